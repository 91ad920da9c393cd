//! Typed operations over the `channel` table.
//!
//! Every statement is parameterized; filters and updates only ever contribute
//! fixed column names to the SQL text.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, guild, enabled, lastsync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub id: u64,
    pub guild: u64,
    pub enabled: bool,
    /// Watermark: everything strictly before it is already indexed.
    pub last_sync: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewChannel {
    pub id: u64,
    pub guild: u64,
}

/// Conjunction of column equalities; an empty filter matches every row.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub id: Option<u64>,
    pub guild: Option<u64>,
    pub enabled: Option<bool>,
}

impl ChannelFilter {
    pub fn id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn guild(guild: u64) -> Self {
        Self {
            guild: Some(guild),
            ..Default::default()
        }
    }

    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Default::default()
        }
    }

    pub fn with_guild(mut self, guild: u64) -> Self {
        self.guild = Some(guild);
        self
    }

    fn where_clause(&self, params: &mut Vec<Value>) -> String {
        let mut clauses = Vec::new();
        if let Some(id) = self.id {
            clauses.push("id = ?");
            params.push(Value::Integer(id as i64));
        }
        if let Some(guild) = self.guild {
            clauses.push("guild = ?");
            params.push(Value::Integer(guild as i64));
        }
        if let Some(enabled) = self.enabled {
            clauses.push("enabled = ?");
            params.push(Value::Integer(enabled as i64));
        }
        if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        }
    }
}

impl From<NewChannel> for ChannelFilter {
    fn from(new: NewChannel) -> Self {
        Self {
            id: Some(new.id),
            guild: Some(new.guild),
            enabled: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub enabled: Option<bool>,
    /// Never moves the stored watermark backwards.
    pub last_sync: Option<DateTime<Utc>>,
}

impl ChannelUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    pub fn watermark(at: DateTime<Utc>) -> Self {
        Self {
            last_sync: Some(at),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.last_sync.is_none()
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRecord> {
    let id: i64 = row.get(0)?;
    let guild: i64 = row.get(1)?;
    let enabled: i64 = row.get(2)?;
    let secs: i64 = row.get(3)?;
    let last_sync = DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, secs))?;
    Ok(ChannelRecord {
        id: id as u64,
        guild: guild as u64,
        enabled: enabled != 0,
        last_sync,
    })
}

pub fn select(conn: &Connection, filter: &ChannelFilter) -> rusqlite::Result<Vec<ChannelRecord>> {
    let mut params = Vec::new();
    let sql = format!(
        "SELECT {COLUMNS} FROM channel{} ORDER BY id",
        filter.where_clause(&mut params)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), from_row)?;
    let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// At most one row; absence is `None`, not an error.
pub fn get(conn: &Connection, filter: &ChannelFilter) -> rusqlite::Result<Option<ChannelRecord>> {
    let mut params = Vec::new();
    let sql = format!(
        "SELECT {COLUMNS} FROM channel{} LIMIT 1",
        filter.where_clause(&mut params)
    );
    conn.query_row(&sql, params_from_iter(params), from_row)
        .optional()
}

/// Inserts and reads the row back so column defaults are populated.
pub fn insert(conn: &Connection, new: &NewChannel) -> rusqlite::Result<ChannelRecord> {
    conn.execute(
        "INSERT INTO channel (id, guild) VALUES (?1, ?2)",
        (new.id as i64, new.guild as i64),
    )?;
    let rowid = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM channel WHERE rowid = ?1"),
        [rowid],
        from_row,
    )
}

/// Not atomic on its own; run it inside a transaction when that matters.
pub fn get_or_insert(conn: &Connection, new: &NewChannel) -> rusqlite::Result<ChannelRecord> {
    match get(conn, &ChannelFilter::from(*new))? {
        Some(existing) => Ok(existing),
        None => insert(conn, new),
    }
}

pub fn update(
    conn: &Connection,
    changes: &ChannelUpdate,
    filter: &ChannelFilter,
) -> rusqlite::Result<usize> {
    if changes.is_empty() {
        return Ok(0);
    }
    let mut sets = Vec::new();
    let mut params = Vec::new();
    if let Some(enabled) = changes.enabled {
        sets.push("enabled = ?");
        params.push(Value::Integer(enabled as i64));
    }
    if let Some(at) = changes.last_sync {
        sets.push("lastsync = MAX(lastsync, ?)");
        params.push(Value::Integer(at.timestamp()));
    }
    let sql = format!(
        "UPDATE channel SET {}{}",
        sets.join(", "),
        filter.where_clause(&mut params)
    );
    conn.execute(&sql, params_from_iter(params))
}

pub fn delete(conn: &Connection, filter: &ChannelFilter) -> rusqlite::Result<usize> {
    let mut params = Vec::new();
    let sql = format!("DELETE FROM channel{}", filter.where_clause(&mut params));
    conn.execute(&sql, params_from_iter(params))
}
