pub mod faq;

use crate::error::IndexError;
use crate::{Context, Data, Error};
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};

pub const OK: &str = "✅";
pub const DENIED: &str = "🛑";
pub const WARNING: &str = "⚠️";

pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![faq::faq(), faq::query()]
}

/// Reacts to the invoking message, or replies for slash commands.
pub async fn acknowledge(ctx: Context<'_>, emoji: &str) -> Result<(), Error> {
    match ctx {
        poise::Context::Prefix(prefix) => {
            prefix
                .msg
                .react(ctx.serenity_context(), serenity::ReactionType::Unicode(emoji.to_string()))
                .await?;
        }
        poise::Context::Application(_) => {
            ctx.say(emoji).await?;
        }
    }
    Ok(())
}

/// Turns indexing errors into reactions; everything else goes to poise.
pub async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            let emoji = match error.downcast_ref::<IndexError>() {
                Some(IndexError::Validation { channel, guild }) => {
                    warn!("Rejected command on channel {} from guild {}", channel, guild);
                    DENIED
                }
                Some(IndexError::NotFound(channel)) => {
                    info!("Channel {} is not indexed", channel);
                    WARNING
                }
                _ => {
                    error!("Command '{}' failed: {}", ctx.command().qualified_name, error);
                    WARNING
                }
            };
            if let Err(e) = acknowledge(ctx, emoji).await {
                error!("Could not report command failure: {}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}
