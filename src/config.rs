// Application configuration, read once at startup from the environment
// (and a `.env` file if there is one) and handed to the services.

use crate::core::leveling::RewardConfig;
use anyhow::{bail, Context};
use std::str::FromStr;
use std::time::Duration;

/// Longest chat cooldown accepted from the environment.
const MAX_COOLDOWN_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub discord_token: String,
    pub database_url: String,
    pub rewards: RewardConfig,
    /// How often members in voice channels are paid.
    pub voice_xp_interval: Duration,
    /// Strike limit for guilds that never set their own.
    pub default_max_strikes: u32,
    /// How often expired mutes are swept up.
    pub mute_sweep_interval: Duration,
    /// Name of the role created when moderation is enabled.
    pub restriction_role_name: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Missing optional keys fall back to
    /// defaults; present but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN").context(
            "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
        )?;

        let defaults = RewardConfig::default();
        let rewards = RewardConfig {
            min_award: parse_or(&lookup, "XP_MIN", defaults.min_award)?,
            max_award: parse_or(&lookup, "XP_MAX", defaults.max_award)?,
            cooldown: Duration::from_secs(parse_or(
                &lookup,
                "XP_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
            level_constant: parse_or(&lookup, "XP_LEVEL_CONSTANT", defaults.level_constant)?,
        };
        if rewards.min_award >= rewards.max_award {
            bail!(
                "XP_MIN ({}) must be lower than XP_MAX ({})",
                rewards.min_award,
                rewards.max_award
            );
        }
        if rewards.cooldown.as_secs() > MAX_COOLDOWN_SECS {
            bail!("XP_COOLDOWN_SECS must be at most {} (one week)", MAX_COOLDOWN_SECS);
        }
        if !(rewards.level_constant.is_finite() && rewards.level_constant > 0.0) {
            bail!("XP_LEVEL_CONSTANT must be a positive number");
        }

        let default_max_strikes = parse_or(&lookup, "DEFAULT_MAX_STRIKES", 3u32)?;
        if default_max_strikes == 0 {
            bail!("DEFAULT_MAX_STRIKES must be at least 1");
        }

        let voice_xp_interval =
            Duration::from_secs(parse_or(&lookup, "VOICE_XP_INTERVAL_SECS", 150u64)?);
        let mute_sweep_interval =
            Duration::from_secs(parse_or(&lookup, "MUTE_SWEEP_INTERVAL_SECS", 900u64)?);
        if voice_xp_interval.is_zero() || mute_sweep_interval.is_zero() {
            bail!("Task intervals must be longer than zero");
        }

        Ok(Self {
            discord_token,
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "data/aika.db".to_string()),
            rewards,
            voice_xp_interval,
            default_max_strikes,
            mute_sweep_interval,
            restriction_role_name: lookup("RESTRICTION_ROLE_NAME")
                .unwrap_or_else(|| "muted".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        None => Ok(default),
    }
}
