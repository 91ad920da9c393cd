pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod merge;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod vecdb;
pub mod worker;

#[cfg(test)]
pub(crate) mod fakes;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub indexer: std::sync::Arc<indexer::ChannelIndexer>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
