use crate::indexer::{ensure_scope, ChannelStatus, ChannelTarget};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

use super::{acknowledge, OK};

const DEFAULT_K: u32 = 4;

fn guild_of(ctx: Context<'_>) -> Result<u64, Error> {
    Ok(ctx
        .guild_id()
        .ok_or("this command only works in a server")?
        .get())
}

/// The named channel, or the one the command was used in.
async fn resolve_target(
    ctx: Context<'_>,
    channel: Option<serenity::GuildChannel>,
) -> Result<ChannelTarget, Error> {
    let guild = guild_of(ctx)?;
    let channel = match channel {
        Some(channel) => channel,
        None => ctx
            .guild_channel()
            .await
            .ok_or("could not resolve the current channel")?,
    };
    let target = ChannelTarget {
        id: channel.id.get(),
        guild: channel.guild_id.get(),
    };
    ensure_scope(target, guild)?;
    Ok(target)
}

pub fn jump_link(guild: u64, channel: u64, message: &str) -> String {
    format!("https://discord.com/channels/{guild}/{channel}/{message}")
}

fn status_line(status: &ChannelStatus) -> String {
    let marker = if status.record.enabled { "✅" } else { "⏸️" };
    let documents = status
        .documents
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} <#{}> · {} documents · last sync {}",
        marker,
        status.record.id,
        documents,
        status.record.last_sync.format("%d.%m. %H:%M")
    )
}

/// Manage which channels are indexed
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_MESSAGES",
    subcommands("list", "enable", "disable", "forget", "sync"),
    subcommand_required
)]
pub async fn faq(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show indexed channels of this server
#[poise::command(prefix_command, slash_command)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild = guild_of(ctx)?;
    let statuses = ctx.data().indexer.list(guild).await?;

    if statuses.is_empty() {
        ctx.say("No channels are indexed here.").await?;
        return Ok(());
    }
    let total: usize = statuses.iter().filter_map(|s| s.documents).sum();
    let mut response = String::from("## Indexed channels\n");
    for status in &statuses {
        response.push_str(&status_line(status));
        response.push('\n');
    }
    response.push_str(&format!(
        "\n{} channels, {} documents",
        statuses.len(),
        total
    ));
    ctx.say(response).await?;
    Ok(())
}

/// Start indexing a channel
#[poise::command(prefix_command, slash_command)]
pub async fn enable(
    ctx: Context<'_>,
    #[description = "Channel to index (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let target = resolve_target(ctx, channel).await?;
    info!("Enable requested for channel {} by {}", target.id, ctx.author().name);
    ctx.data().indexer.enable(target).await?;
    acknowledge(ctx, OK).await
}

/// Pause indexing a channel, keeping what is indexed
#[poise::command(prefix_command, slash_command)]
pub async fn disable(
    ctx: Context<'_>,
    #[description = "Channel to pause (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let target = resolve_target(ctx, channel).await?;
    ctx.data().indexer.disable(target.id, target.guild).await?;
    acknowledge(ctx, OK).await
}

/// Stop indexing a channel and delete its index
#[poise::command(prefix_command, slash_command)]
pub async fn forget(
    ctx: Context<'_>,
    #[description = "Channel to forget (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let target = resolve_target(ctx, channel).await?;
    info!("Forget requested for channel {} by {}", target.id, ctx.author().name);
    ctx.data().indexer.forget(target.id, target.guild).await?;
    acknowledge(ctx, OK).await
}

/// Index new messages of a channel right now
#[poise::command(prefix_command, slash_command)]
pub async fn sync(
    ctx: Context<'_>,
    #[description = "Channel to sync (defaults to this one)"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let target = resolve_target(ctx, channel).await?;
    ctx.defer_or_broadcast().await?;
    let report = ctx
        .data()
        .indexer
        .sync_channel(target.id, target.guild)
        .await?;
    info!(
        "Manual sync of channel {}: {} documents",
        target.id, report.documents
    );
    acknowledge(ctx, OK).await
}

/// Find earlier messages in this channel similar to a question
#[poise::command(prefix_command, slash_command, guild_only, aliases("q", "ask"))]
pub async fn query(
    ctx: Context<'_>,
    #[description = "How many matches to show"] k: Option<u32>,
    #[description = "What to look for"]
    #[rest]
    text: String,
) -> Result<(), Error> {
    let guild = guild_of(ctx)?;
    let channel = ctx.channel_id().get();
    let k = k.unwrap_or(DEFAULT_K) as usize;

    let matches = ctx.data().indexer.query(channel, guild, &text, k).await?;
    if matches.is_empty() {
        ctx.say("404").await?;
        return Ok(());
    }

    let response = matches
        .iter()
        .map(|m| {
            format!(
                "`{:.2}` {}",
                m.score(),
                jump_link(guild, channel, &m.id)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    ctx.say(response).await?;
    Ok(())
}
