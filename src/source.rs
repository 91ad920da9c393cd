use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{Cache, ChannelId, GetMessages, Http, Message, MessageId, MessageType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::DISCORD_EPOCH_SECS;
use crate::error::SourceError;
use crate::merge::{EmbeddedBlock, RawMessage, ReplyResolver};

const PAGE_SIZE: u8 = 100;

/// Where channel history comes from.
#[async_trait]
pub trait MessageSource: ReplyResolver + Send + Sync {
    /// Messages created in `[after, before)`, in no particular order.
    async fn history(
        &self,
        channel_id: u64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, SourceError>;
}

/// Smallest snowflake a message created at `at` can carry.
pub fn snowflake_at(at: DateTime<Utc>) -> u64 {
    let ms = at.timestamp_millis() - DISCORD_EPOCH_SECS * 1000;
    (ms.max(0) as u64) << 22
}

fn is_system(kind: MessageType) -> bool {
    !matches!(
        kind,
        MessageType::Regular
            | MessageType::InlineReply
            | MessageType::ChatInputCommand
            | MessageType::ContextMenuCommand
            | MessageType::ThreadStarterMessage
    )
}

fn raw_message(msg: &Message, cache: &Arc<Cache>) -> RawMessage {
    let created_at = DateTime::<Utc>::from_timestamp(msg.timestamp.unix_timestamp(), 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    RawMessage {
        id: msg.id.get(),
        author_id: msg.author.id.get(),
        author_is_bot: msg.author.bot,
        created_at,
        content: msg.content_safe(cache),
        attachments: msg.attachments.iter().map(|a| a.filename.clone()).collect(),
        embeds: msg
            .embeds
            .iter()
            .map(|e| EmbeddedBlock {
                title: e.title.clone(),
                description: e.description.clone(),
            })
            .collect(),
        mentions: msg.mentions.iter().map(|u| u.id.get()).collect(),
        is_system: is_system(msg.kind),
        reply_to: msg
            .message_reference
            .as_ref()
            .and_then(|r| r.message_id)
            .map(|id| id.get()),
    }
}

/// History straight from the Discord REST API.
///
/// Messages referenced by replies arrive embedded in the reply itself; they are
/// kept per channel until that channel's next fetch so the merger can resolve
/// reply chains without extra requests.
pub struct DiscordSource {
    http: Arc<Http>,
    cache: Arc<Cache>,
    replies: Mutex<HashMap<u64, (u64, RawMessage)>>,
}

impl DiscordSource {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>) -> Self {
        Self {
            http,
            cache,
            replies: Mutex::new(HashMap::new()),
        }
    }
}

impl ReplyResolver for DiscordSource {
    fn resolve_reply(&self, message: &RawMessage) -> Option<RawMessage> {
        let id = message.reply_to?;
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|(_, m)| m.clone())
    }
}

#[async_trait]
impl MessageSource for DiscordSource {
    async fn history(
        &self,
        channel_id: u64,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let channel = ChannelId::new(channel_id);
        let mut cursor = MessageId::new(snowflake_at(after).saturating_sub(1).max(1));
        let mut collected = Vec::new();
        let mut referenced = Vec::new();

        loop {
            let mut page = channel
                .messages(&self.http, GetMessages::new().after(cursor).limit(PAGE_SIZE))
                .await?;
            if page.is_empty() {
                break;
            }
            page.sort_by_key(|m| m.id);
            let full = page.len() == PAGE_SIZE as usize;
            let mut reached_end = false;

            for msg in &page {
                if msg.timestamp.unix_timestamp() >= before.timestamp() {
                    reached_end = true;
                    break;
                }
                if let Some(parent) = msg.referenced_message.as_deref() {
                    referenced.push(raw_message(parent, &self.cache));
                }
                collected.push(raw_message(msg, &self.cache));
            }

            if let Some(last) = page.last() {
                cursor = last.id;
            }
            if !full || reached_end {
                break;
            }
        }

        {
            let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
            replies.retain(|_, (owner, _)| *owner != channel_id);
            for parent in referenced {
                replies.insert(parent.id, (channel_id, parent));
            }
        }

        debug!(
            "Fetched {} messages from channel {} since {}",
            collected.len(),
            channel_id,
            after
        );
        Ok(collected)
    }
}
