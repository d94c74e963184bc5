// This is the entry point of the Discord bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (SQLite stores)
// - `discord/` = Discord-specific adapters (commands, events, role calls)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework and background tasks
// 4. Register commands and event handlers

mod config;

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::config::AppConfig;
use crate::core::leveling::LevelingService;
use crate::core::moderation::ModerationService;
use crate::core::scheduling::{Clock, PeriodicTask, SystemClock};
use crate::discord::chat_rewards::{reward_chat_activity, ChatActivity};
use crate::discord::moderation::serenity_platform::SerenityPlatform;
use crate::discord::voice_rewards::award_voice_activity;
use crate::discord::{Data, Error};
use crate::infra::leveling::SqliteRewardStore;
use crate::infra::moderation::SqliteModerationStore;
use poise::serenity_prelude as serenity;
use std::sync::Arc;

/// Event handler for non-command Discord events.
async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if new_message.author.bot {
                return Ok(());
            }
            let Some(guild_id) = new_message.guild_id else {
                return Ok(());
            };
            data.leveling
                .remember_author(new_message.id.get(), new_message.author.id.get());

            // Attachment-only messages don't earn XP
            if !new_message.content.is_empty() {
                reward_chat_activity(
                    ctx,
                    data,
                    new_message.author.id,
                    guild_id,
                    new_message.channel_id,
                    ChatActivity::Message,
                )
                .await;
            }
        }
        serenity::FullEvent::MessageUpdate { event, .. } => {
            // Edits count as activity too; the cooldown keeps this from being farmed.
            let (Some(author), Some(guild_id)) = (event.author.as_ref(), event.guild_id) else {
                return Ok(());
            };
            let has_content = event.content.as_deref().map_or(false, |c| !c.is_empty());
            if author.bot || !has_content {
                return Ok(());
            }

            reward_chat_activity(
                ctx,
                data,
                author.id,
                guild_id,
                event.channel_id,
                ChatActivity::Edit,
            )
            .await;
        }
        serenity::FullEvent::MessageDelete {
            channel_id,
            deleted_message_id,
            guild_id: Some(guild_id),
        } => {
            let author = data
                .leveling
                .take_author(deleted_message_id.get())
                .or_else(|| {
                    ctx.cache
                        .message(*channel_id, *deleted_message_id)
                        .filter(|message| !message.author.bot)
                        .map(|message| message.author.id.get())
                });
            let Some(user_id) = author else {
                return Ok(());
            };

            if let Err(e) = data
                .leveling
                .record_deleted_message(user_id, guild_id.get())
                .await
            {
                tracing::error!("Error counting deleted message: {}", e);
            }
        }
        serenity::FullEvent::GuildRoleDelete {
            guild_id,
            removed_role_id,
            ..
        } => {
            match data
                .moderation
                .handle_role_deleted(guild_id.get(), removed_role_id.get())
                .await
            {
                Ok(true) => {
                    tracing::warn!(guild_id = %guild_id, "Moderation switched off after muted role was deleted");
                }
                Ok(false) => {}
                Err(e) => tracing::error!("Error handling role deletion: {}", e),
            }
        }

        _ => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Create our services with their dependencies.
    // This is the "composition root" where we wire everything together.

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Rewards and moderation share one SQLite database
    let reward_store = SqliteRewardStore::new(&config.database_url).await?;
    let moderation_store = Arc::new(SqliteModerationStore::new(reward_store.pool()));
    moderation_store.migrate().await?;

    let leveling_service = Arc::new(LevelingService::new(
        reward_store,
        config.rewards.clone(),
        Arc::clone(&clock),
    ));

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required to read message content
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_VOICE_STATES;

    let setup_config = config.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            // Register all our commands here
            commands: vec![
                discord::commands::leveling::xp(),
                discord::commands::leveling::levelreq(),
                discord::commands::leveling::leaderboard(),
                discord::commands::leveling::deleterboard(),
                discord::commands::leveling::setxp(),
                discord::commands::leveling::takexp(),
                discord::moderation::commands::moderation(),
                discord::moderation::commands::maxstrikes(),
                discord::moderation::commands::strike(),
                discord::moderation::commands::strikes(),
                discord::moderation::commands::removestrike(),
                discord::moderation::commands::mute(),
                discord::moderation::commands::unmute(),
                discord::moderation::commands::mutestatus(),
                discord::moderation::commands::next_sweep(),
            ],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                tracing::info!("🤖 Bot is starting up...");

                // Register slash commands globally (can take up to an hour to propagate)
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!("✅ Commands registered!");

                let platform = Arc::new(SerenityPlatform::new(ctx.http.clone()));
                let moderation = Arc::new(ModerationService::new(
                    moderation_store,
                    Arc::clone(&platform),
                    Arc::clone(&clock),
                    setup_config.default_max_strikes,
                ));

                // Mutes that ended while we were offline are lifted before any
                // command runs; the rest get their timers back.
                if let Err(e) = moderation.recover_mutes().await {
                    tracing::error!("Mute recovery failed, the sweep will retry: {}", e);
                }
                tracing::info!(pending = moderation.pending_releases(), "Mute releases armed");

                let mute_sweep = Arc::new(PeriodicTask::new(
                    "mute_sweep",
                    setup_config.mute_sweep_interval,
                    Arc::clone(&clock),
                ));
                let sweep_moderation = Arc::clone(&moderation);
                mute_sweep.start(move || {
                    let moderation = Arc::clone(&sweep_moderation);
                    async move {
                        match moderation.sweep_expired_mutes().await {
                            Ok(0) => {}
                            Ok(released) => tracing::info!(released, "Mute sweep lifted expired mutes"),
                            Err(e) => tracing::warn!("Mute sweep failed: {}", e),
                        }
                    }
                });

                let voice_xp = Arc::new(PeriodicTask::new(
                    "voice_xp",
                    setup_config.voice_xp_interval,
                    Arc::clone(&clock),
                ));
                let voice_leveling = Arc::clone(&leveling_service);
                let cache = ctx.cache.clone();
                voice_xp.start(move || {
                    let leveling = Arc::clone(&voice_leveling);
                    let cache = Arc::clone(&cache);
                    async move { award_voice_activity(&cache, &leveling).await }
                });

                for task in [&mute_sweep, &voice_xp] {
                    tracing::info!(task = task.name(), every = ?task.interval(), "Periodic task started");
                }
                tracing::info!("🚀 Bot is ready!");

                Ok(Data {
                    leveling: leveling_service,
                    moderation,
                    platform,
                    mute_sweep,
                    voice_xp,
                    restriction_role_name: setup_config.restriction_role_name,
                })
            })
        })
        .build();

    // Serenity's message cache backs up the author index when a delete arrives
    let mut cache_settings = serenity::cache::Settings::default();
    cache_settings.max_messages = 10_000;

    // Create the client and start the bot
    let mut client = serenity::ClientBuilder::new(&config.discord_token, intents)
        .framework(framework)
        .cache_settings(cache_settings)
        .await?;

    client.start().await?;
    Ok(())
}
