/// One row per indexed channel. `lastsync` is Unix seconds and defaults to the
/// Discord epoch so a fresh channel is collected from its very first message.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS channel (
        id          INTEGER NOT NULL PRIMARY KEY,
        guild       INTEGER NOT NULL,
        enabled     BOOLEAN NOT NULL DEFAULT 1,
        lastsync    TIMESTAMP NOT NULL DEFAULT 1420070400
    );
    CREATE INDEX IF NOT EXISTS idx_channel_guild ON channel (guild);
";
