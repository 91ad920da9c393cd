//! Folds raw channel history into documents worth embedding.
//!
//! Messages are filtered, reply chains are prepended, and everything one author
//! wrote inside the same minute becomes a single [`MergedDocument`].

use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Width of a merge bucket in seconds.
pub const MERGE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmbeddedBlock {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u64,
    pub author_id: u64,
    pub author_is_bot: bool,
    pub created_at: DateTime<Utc>,
    /// Display text with mentions already rendered as names.
    pub content: String,
    pub attachments: Vec<String>,
    pub embeds: Vec<EmbeddedBlock>,
    pub mentions: Vec<u64>,
    pub is_system: bool,
    pub reply_to: Option<u64>,
}

impl RawMessage {
    pub fn new(id: u64, author_id: u64, created_at: DateTime<Utc>, content: impl Into<String>) -> Self {
        Self {
            id,
            author_id,
            author_is_bot: false,
            created_at,
            content: content.into(),
            attachments: Vec::new(),
            embeds: Vec::new(),
            mentions: Vec::new(),
            is_system: false,
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, id: u64) -> Self {
        self.reply_to = Some(id);
        self
    }

    /// Content, attachment names and embed titles/descriptions, space separated.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        parts.push(&self.content);
        parts.extend(self.attachments.iter().map(String::as_str));
        for embed in &self.embeds {
            if let Some(title) = &embed.title {
                parts.push(title);
            }
            if let Some(description) = &embed.description {
                parts.push(description);
            }
        }
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedDocument {
    /// Id of the newest message in the merge group.
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub content: String,
}

/// Looks up the message a reply points at.
pub trait ReplyResolver {
    fn resolve_reply(&self, message: &RawMessage) -> Option<RawMessage>;
}

impl ReplyResolver for HashMap<u64, RawMessage> {
    fn resolve_reply(&self, message: &RawMessage) -> Option<RawMessage> {
        message.reply_to.and_then(|id| self.get(&id).cloned())
    }
}

/// `message` preceded by every ancestor it (transitively) replies to, oldest
/// first. Each message appears at most once even if the references loop.
pub fn reply_chain<R: ReplyResolver + ?Sized>(message: &RawMessage, replies: &R) -> Vec<RawMessage> {
    let mut seen = HashSet::from([message.id]);
    let mut chain = vec![message.clone()];
    let mut cursor = replies.resolve_reply(message);
    while let Some(parent) = cursor {
        if !seen.insert(parent.id) {
            break;
        }
        cursor = replies.resolve_reply(&parent);
        chain.push(parent);
    }
    chain.reverse();
    chain
}

fn noise() -> &'static Regex {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    NOISE.get_or_init(|| Regex::new(r"([^\w\-\.?]|_)+").expect("noise pattern is valid"))
}

/// Collapses every run of characters other than letters, digits, `-`, `.` and
/// `?` (underscores included) into a single space.
pub fn clean(text: &str) -> String {
    noise().replace_all(text, " ").trim().to_string()
}

#[derive(Debug, Clone)]
pub struct MessageMerger {
    bot_id: u64,
    prefix: String,
}

impl MessageMerger {
    pub fn new(bot_id: u64, prefix: impl Into<String>) -> Self {
        Self {
            bot_id,
            prefix: prefix.into(),
        }
    }

    /// Automation accounts, bot mentions, commands and system notices are skipped.
    pub fn is_indexable(&self, message: &RawMessage) -> bool {
        !(message.author_is_bot
            || message.is_system
            || message.mentions.contains(&self.bot_id)
            || (!self.prefix.is_empty() && message.content.starts_with(&self.prefix)))
    }

    /// Groups `messages` by `(author, minute bucket)` and returns one document per
    /// group, ordered by each group's first message.
    pub fn merge<R: ReplyResolver + ?Sized>(
        &self,
        mut messages: Vec<RawMessage>,
        replies: &R,
    ) -> Vec<MergedDocument> {
        messages.sort_by_key(|m| (m.created_at, m.id));

        let mut slots: HashMap<(u64, i64), usize> = HashMap::new();
        let mut groups: Vec<(MergedDocument, Vec<String>)> = Vec::new();

        for message in messages.iter().filter(|m| self.is_indexable(m)) {
            let key = (
                message.author_id,
                message.created_at.timestamp().div_euclid(MERGE_WINDOW_SECS),
            );
            let text = reply_chain(message, replies)
                .iter()
                .map(RawMessage::text)
                .collect::<Vec<_>>()
                .join(" ");

            match slots.get(&key) {
                Some(&slot) => {
                    let (doc, parts) = &mut groups[slot];
                    doc.id = message.id;
                    doc.created_at = message.created_at;
                    parts.push(text);
                }
                None => {
                    slots.insert(key, groups.len());
                    groups.push((
                        MergedDocument {
                            id: message.id,
                            created_at: message.created_at,
                            content: String::new(),
                        },
                        vec![text],
                    ));
                }
            }
        }

        groups
            .into_iter()
            .filter_map(|(mut doc, parts)| {
                doc.content = clean(&parts.join(" "));
                (!doc.content.is_empty()).then_some(doc)
            })
            .collect()
    }
}

/// Splits `docs` into order-preserving chunks of at most `size` documents.
pub fn into_chunks(docs: Vec<MergedDocument>, size: usize) -> Vec<Vec<MergedDocument>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(docs.len().div_ceil(size));
    let mut docs = docs.into_iter().peekable();
    while docs.peek().is_some() {
        chunks.push(docs.by_ref().take(size).collect());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: u64 = 999;
    const A: u64 = 1;
    const B: u64 = 2;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_040 + secs, 0).unwrap()
    }

    fn merger() -> MessageMerger {
        MessageMerger::new(BOT, "?")
    }

    fn no_replies() -> HashMap<u64, RawMessage> {
        HashMap::new()
    }

    #[test]
    fn same_author_same_minute_merges() {
        let messages = vec![
            RawMessage::new(10, A, at(0), "hi"),
            RawMessage::new(11, A, at(10), "there"),
            RawMessage::new(12, B, at(0), "yo"),
        ];
        let docs = merger().merge(messages, &no_replies());
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "hi there");
        assert_eq!(docs[0].id, 11, "id of the newest message in the group");
        assert_eq!(docs[1].content, "yo");
        assert_eq!(docs[1].id, 12);
    }

    #[test]
    fn bucket_boundary_splits() {
        // at(0) sits exactly on a minute boundary
        let inside = vec![
            RawMessage::new(1, A, at(0), "one"),
            RawMessage::new(2, A, at(59), "two"),
        ];
        assert_eq!(merger().merge(inside, &no_replies()).len(), 1);

        let straddling = vec![
            RawMessage::new(1, A, at(59), "one"),
            RawMessage::new(2, A, at(60), "two"),
        ];
        assert_eq!(merger().merge(straddling, &no_replies()).len(), 2);
    }

    #[test]
    fn filters_bots_commands_mentions_and_system() {
        let mut bot = RawMessage::new(1, A, at(0), "automated");
        bot.author_is_bot = true;
        let command = RawMessage::new(2, A, at(1), "?faq list");
        let mut mention = RawMessage::new(3, A, at(2), "hey bot");
        mention.mentions.push(BOT);
        let mut system = RawMessage::new(4, A, at(3), "pinned a message");
        system.is_system = true;
        let keep = RawMessage::new(5, A, at(4), "real question");

        let docs = merger().merge(vec![bot, command, mention, system, keep], &no_replies());
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "real question");
        assert_eq!(docs[0].id, 5);
    }

    #[test]
    fn replies_are_prepended() {
        let question = RawMessage::new(1, B, at(-600), "how do I reset");
        let answer = RawMessage::new(2, A, at(0), "use the button").replying_to(1);
        let replies = HashMap::from([(1, question)]);

        let docs = merger().merge(vec![answer], &replies);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "how do I reset use the button");
    }

    #[test]
    fn reply_cycles_terminate() {
        let a = RawMessage::new(1, A, at(0), "a").replying_to(2);
        let b = RawMessage::new(2, B, at(1), "b").replying_to(1);
        let replies = HashMap::from([(1, a.clone()), (2, b)]);

        let chain = reply_chain(&a, &replies);
        let ids: Vec<u64> = chain.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 1]);

        let selfish = RawMessage::new(3, A, at(2), "me").replying_to(3);
        let replies = HashMap::from([(3, selfish.clone())]);
        assert_eq!(reply_chain(&selfish, &replies).len(), 1);
    }

    #[test]
    fn unresolvable_reply_is_ignored() {
        let orphan = RawMessage::new(1, A, at(0), "orphan").replying_to(42);
        let docs = merger().merge(vec![orphan], &no_replies());
        assert_eq!(docs[0].content, "orphan");
    }

    #[test]
    fn attachments_and_embeds_are_included() {
        let mut message = RawMessage::new(1, A, at(0), "see");
        message.attachments.push("crash_log.txt".to_string());
        message.embeds.push(EmbeddedBlock {
            title: Some("Guide".to_string()),
            description: Some("Step one!".to_string()),
        });
        let docs = merger().merge(vec![message], &no_replies());
        assert_eq!(docs[0].content, "see crash log.txt Guide Step one");
    }

    #[test]
    fn clean_keeps_words_hyphens_periods_questions() {
        assert_eq!(clean("a__b!!c"), "a b c");
        assert_eq!(clean("well-known v1.2?"), "well-known v1.2?");
        assert_eq!(clean("  **bold**\n\tline  "), "bold line");
        assert_eq!(clean("čćž šđ"), "čćž šđ");
    }

    #[test]
    fn empty_documents_are_dropped() {
        let docs = merger().merge(vec![RawMessage::new(1, A, at(0), "!!! ***")], &no_replies());
        assert!(docs.is_empty());
    }

    #[test]
    fn input_order_is_normalized() {
        let newest_first = vec![
            RawMessage::new(3, A, at(130), "third"),
            RawMessage::new(2, A, at(65), "second"),
            RawMessage::new(1, A, at(0), "first"),
        ];
        let docs = merger().merge(newest_first, &no_replies());
        let contents: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn chunks_are_bounded_and_ordered() {
        let docs: Vec<MergedDocument> = (0..300)
            .map(|i| MergedDocument {
                id: i,
                created_at: at(i as i64 * 60),
                content: format!("doc {i}"),
            })
            .collect();
        let chunks = into_chunks(docs, 128);
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![128, 128, 44]
        );
        let flat: Vec<u64> = chunks.into_iter().flatten().map(|d| d.id).collect();
        assert_eq!(flat, (0..300).collect::<Vec<_>>());
        assert!(into_chunks(Vec::new(), 128).is_empty());
    }
}
