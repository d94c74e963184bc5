// Moderation service - strikes with ban escalation and timed mutes.
//
// This service handles:
// - Per-guild moderation settings (on/off, strike threshold, muted role)
// - Strikes, banning a member once they reach the threshold
// - Mutes, applied as a role and lifted by a deferred release
// - Restoring pending releases after a restart
//
// NO Discord dependencies here. Discord calls go through `ModerationPlatform`.

use super::moderation_models::{
    normalize_reason, BanStatus, BatchReport, MemberSnapshot, ModerationConfig, MuteKey,
    MuteOutcome, MuteState, PlatformError, RecoveryReport, StrikeOutcome, StrikeRecord,
    SubjectError,
};
use crate::core::scheduling::deferred::delay_until;
use crate::core::scheduling::{Clock, DeferredScheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Moderation is disabled in this server")]
    FeatureDisabled,

    #[error("The muted role is not configured")]
    ConfigMissing,

    #[error("Mute duration must be longer than zero and end on a real date")]
    InvalidDuration,

    #[error("Strike limit must be at least 1")]
    InvalidThreshold,

    #[error("Discord refused: {0}")]
    Platform(PlatformError),
}

// ============================================================================
// PORTS
// ============================================================================

/// Persistence for moderation state.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn get_config(&self, guild_id: u64) -> Result<Option<ModerationConfig>, ModerationError>;

    async fn save_config(
        &self,
        guild_id: u64,
        config: &ModerationConfig,
    ) -> Result<(), ModerationError>;

    /// Record a strike and return its id.
    async fn insert_strike(
        &self,
        guild_id: u64,
        user_id: u64,
        reason: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<i64, ModerationError>;

    async fn count_strikes(&self, guild_id: u64, user_id: u64) -> Result<u32, ModerationError>;

    /// Strikes oldest first.
    async fn list_strikes(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<StrikeRecord>, ModerationError>;

    /// Delete a strike in this guild. Returns whether one was deleted.
    async fn delete_strike(&self, guild_id: u64, strike_id: i64) -> Result<bool, ModerationError>;

    async fn get_mute(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MuteState>, ModerationError>;

    async fn set_muted_until(
        &self,
        guild_id: u64,
        user_id: u64,
        muted_until: DateTime<Utc>,
    ) -> Result<(), ModerationError>;

    /// Delete the mute row. With `due_by`, only a row whose `muted_until` is at
    /// or before it is deleted, so a late timer cannot end a newer mute.
    /// Returns whether a row was deleted.
    async fn release_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        due_by: Option<DateTime<Utc>>,
    ) -> Result<bool, ModerationError>;

    /// Every persisted mute, across all guilds.
    async fn active_mutes(&self) -> Result<Vec<MuteState>, ModerationError>;
}

/// The chat platform actions moderation needs.
#[async_trait]
pub trait ModerationPlatform: Send + Sync {
    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64)
        -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), PlatformError>;
}

/// Audit log reason when a mute runs out.
pub const EXPIRY_REASON: &str = "Mute expired.";
/// Audit log reason when a moderator lifts a mute.
pub const EARLY_RELEASE_REASON: &str = "Unmuted by a moderator.";

// ============================================================================
// CORE SERVICE
// ============================================================================

pub struct ModerationService<S, P>
where
    S: ModerationStore + 'static,
    P: ModerationPlatform + 'static,
{
    store: Arc<S>,
    platform: Arc<P>,
    releases: DeferredScheduler<MuteKey>,
    clock: Arc<dyn Clock>,
    default_max_strikes: u32,
}

impl<S, P> ModerationService<S, P>
where
    S: ModerationStore + 'static,
    P: ModerationPlatform + 'static,
{
    pub fn new(
        store: Arc<S>,
        platform: Arc<P>,
        clock: Arc<dyn Clock>,
        default_max_strikes: u32,
    ) -> Self {
        Self {
            store,
            platform,
            releases: DeferredScheduler::new(Arc::clone(&clock)),
            clock,
            default_max_strikes,
        }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_config(&self, guild_id: u64) -> Result<ModerationConfig, ModerationError> {
        Ok(self
            .store
            .get_config(guild_id)
            .await?
            .unwrap_or_else(|| ModerationConfig::disabled(self.default_max_strikes)))
    }

    /// Turn moderation on or off. Enabling records the muted role.
    ///
    /// Disabling forgets every mute in the guild, because the muted role goes
    /// away with it. Returns whether anything changed.
    pub async fn set_moderation(
        &self,
        guild_id: u64,
        enabled: bool,
        restriction_role_id: Option<u64>,
    ) -> Result<bool, ModerationError> {
        let mut config = self.get_config(guild_id).await?;
        let role_unchanged =
            restriction_role_id.is_none() || restriction_role_id == config.restriction_role_id;
        if config.enabled == enabled && role_unchanged {
            return Ok(false);
        }

        config.enabled = enabled;
        config.restriction_role_id = if enabled {
            restriction_role_id.or(config.restriction_role_id)
        } else {
            None
        };
        self.store.save_config(guild_id, &config).await?;

        if !enabled {
            for mute in self.store.active_mutes().await? {
                if mute.guild_id != guild_id {
                    continue;
                }
                self.releases.cancel(&mute.key());
                self.store.release_mute(guild_id, mute.user_id, None).await?;
            }
        }

        tracing::info!(guild_id, enabled, role = ?config.restriction_role_id, "Moderation setting changed");
        Ok(true)
    }

    /// Someone deleted a role. If it was our muted role, moderation can no
    /// longer work and is switched off. Returns whether that happened.
    pub async fn handle_role_deleted(
        &self,
        guild_id: u64,
        role_id: u64,
    ) -> Result<bool, ModerationError> {
        let config = self.get_config(guild_id).await?;
        if !config.enabled || config.restriction_role_id != Some(role_id) {
            return Ok(false);
        }

        tracing::warn!(guild_id, role_id, "Muted role was deleted, disabling moderation");
        self.set_moderation(guild_id, false, None).await
    }

    pub async fn set_max_strikes(
        &self,
        guild_id: u64,
        max_strikes: u32,
    ) -> Result<(), ModerationError> {
        if max_strikes == 0 {
            return Err(ModerationError::InvalidThreshold);
        }
        let mut config = self.get_config(guild_id).await?;
        config.max_strikes = max_strikes;
        self.store.save_config(guild_id, &config).await
    }

    async fn enabled_config(&self, guild_id: u64) -> Result<ModerationConfig, ModerationError> {
        let config = self.get_config(guild_id).await?;
        if !config.enabled {
            return Err(ModerationError::FeatureDisabled);
        }
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Strikes
    // ------------------------------------------------------------------

    /// Strike every subject the actor outranks, banning those who reach the limit.
    pub async fn strike(
        &self,
        guild_id: u64,
        actor: &MemberSnapshot,
        subjects: &[MemberSnapshot],
        reason: &str,
    ) -> Result<BatchReport<StrikeOutcome>, ModerationError> {
        let config = self.enabled_config(guild_id).await?;
        let reason = normalize_reason(reason);
        let mut report = BatchReport::default();

        for subject in subjects {
            if !actor.outranks(subject) {
                report.push(subject.user_id, Err(SubjectError::InsufficientAuthority));
                continue;
            }

            let strike_id = self
                .store
                .insert_strike(guild_id, subject.user_id, &reason, self.clock.now())
                .await?;
            let active_strikes = self.store.count_strikes(guild_id, subject.user_id).await?;

            let ban = if active_strikes >= config.max_strikes {
                let ban_reason = format!(
                    "Striked above limit ({}/{}) [{}].",
                    active_strikes, config.max_strikes, reason
                );
                match self.platform.ban(guild_id, subject.user_id, &ban_reason).await {
                    Ok(()) => {
                        tracing::info!(guild_id, user_id = subject.user_id, active_strikes, "Member banned for strikes");
                        BanStatus::Banned
                    }
                    Err(e) => {
                        tracing::warn!(guild_id, user_id = subject.user_id, error = %e, "Ban failed");
                        BanStatus::Failed(e)
                    }
                }
            } else {
                BanStatus::NotBanned
            };

            report.push(
                subject.user_id,
                Ok(StrikeOutcome {
                    strike_id,
                    active_strikes,
                    max_strikes: config.max_strikes,
                    ban,
                }),
            );
        }

        Ok(report)
    }

    /// Delete one strike. Bans it contributed to are left alone.
    pub async fn remove_strike(
        &self,
        guild_id: u64,
        strike_id: i64,
    ) -> Result<bool, ModerationError> {
        self.store.delete_strike(guild_id, strike_id).await
    }

    pub async fn list_strikes(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Vec<StrikeRecord>, ModerationError> {
        self.store.list_strikes(guild_id, user_id).await
    }

    // ------------------------------------------------------------------
    // Mutes
    // ------------------------------------------------------------------

    /// Mute every subject the actor outranks for `duration`.
    pub async fn mute(
        &self,
        guild_id: u64,
        actor: &MemberSnapshot,
        subjects: &[MemberSnapshot],
        duration: Duration,
    ) -> Result<BatchReport<MuteOutcome>, ModerationError> {
        if duration.is_zero() {
            return Err(ModerationError::InvalidDuration);
        }
        let length =
            chrono::Duration::from_std(duration).map_err(|_| ModerationError::InvalidDuration)?;

        let config = self.enabled_config(guild_id).await?;
        let role_id = config
            .restriction_role_id
            .ok_or(ModerationError::ConfigMissing)?;

        let now = self.clock.now();
        let muted_until = now
            .checked_add_signed(length)
            .ok_or(ModerationError::InvalidDuration)?;
        let mut report = BatchReport::default();

        for subject in subjects {
            if !actor.outranks(subject) {
                report.push(subject.user_id, Err(SubjectError::InsufficientAuthority));
                continue;
            }

            let persisted = self.store.get_mute(guild_id, subject.user_id).await?;
            let still_muted = persisted.map_or(false, |m| !m.is_due(now));
            if subject.has_role(role_id) || still_muted {
                report.push(subject.user_id, Err(SubjectError::AlreadyMuted));
                continue;
            }

            // The row goes first so a role never outlives its expiry record.
            self.store
                .set_muted_until(guild_id, subject.user_id, muted_until)
                .await?;

            if let Err(e) = self
                .platform
                .add_role(guild_id, subject.user_id, role_id)
                .await
            {
                tracing::warn!(guild_id, user_id = subject.user_id, error = %e, "Could not apply muted role");
                self.store
                    .release_mute(guild_id, subject.user_id, None)
                    .await?;
                report.push(subject.user_id, Err(SubjectError::Platform(e)));
                continue;
            }

            self.arm_release(
                MuteKey {
                    guild_id,
                    user_id: subject.user_id,
                },
                muted_until,
            );

            tracing::info!(guild_id, user_id = subject.user_id, %muted_until, "Member muted");
            report.push(subject.user_id, Ok(MuteOutcome { muted_until }));
        }

        Ok(report)
    }

    /// Lift a mute before it expires. Safe to call for members who are not
    /// muted. Returns whether a mute was in place.
    pub async fn unmute(&self, guild_id: u64, user_id: u64) -> Result<bool, ModerationError> {
        let key = MuteKey { guild_id, user_id };
        let was_pending = self.releases.cancel(&key);

        let config = self.get_config(guild_id).await?;
        if let Some(role_id) = config.restriction_role_id {
            remove_restriction(&*self.platform, key, role_id, EARLY_RELEASE_REASON).await?;
        }
        let cleared = self.store.release_mute(guild_id, user_id, None).await?;

        if cleared || was_pending {
            tracing::info!(guild_id, user_id, "Member unmuted early");
        }
        Ok(cleared || was_pending)
    }

    /// Time left on a member's mute, if they are muted.
    pub async fn mute_remaining(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<Duration>, ModerationError> {
        // An armed timer answers without touching storage.
        if let Some(left) = self.releases.time_until(&MuteKey { guild_id, user_id }) {
            return Ok(Some(left));
        }

        let now = self.clock.now();
        Ok(self
            .store
            .get_mute(guild_id, user_id)
            .await?
            .filter(|m| !m.is_due(now))
            .map(|m| delay_until(m.muted_until, now)))
    }

    /// Number of releases waiting on a timer.
    pub fn pending_releases(&self) -> usize {
        self.releases.pending()
    }

    /// Rebuild the release timers from storage. Run once at startup, before
    /// commands are served: expired mutes are lifted right here, the rest are
    /// scheduled again.
    pub async fn recover_mutes(&self) -> Result<RecoveryReport, ModerationError> {
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        for mute in self.store.active_mutes().await? {
            if mute.is_due(now) {
                match release(&*self.store, &*self.platform, mute.key(), Some(now)).await {
                    Ok(true) => report.released += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(guild_id = mute.guild_id, user_id = mute.user_id, error = %e, "Failed to lift expired mute");
                    }
                }
            } else {
                self.arm_release(mute.key(), mute.muted_until);
                report.rearmed += 1;
            }
        }

        tracing::info!(released = report.released, rearmed = report.rearmed, "Mute recovery finished");
        Ok(report)
    }

    /// Lift any mute that is past due. Catches releases whose timer was lost.
    pub async fn sweep_expired_mutes(&self) -> Result<usize, ModerationError> {
        let now = self.clock.now();
        let mut released = 0;

        for mute in self.store.active_mutes().await? {
            if !mute.is_due(now) {
                continue;
            }
            self.releases.cancel(&mute.key());
            match release(&*self.store, &*self.platform, mute.key(), Some(now)).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(guild_id = mute.guild_id, user_id = mute.user_id, error = %e, "Sweep could not lift mute");
                }
            }
        }

        if released > 0 {
            tracing::info!(released, "Sweep lifted expired mutes");
        }
        Ok(released)
    }

    fn arm_release(&self, key: MuteKey, run_at: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        let platform = Arc::clone(&self.platform);

        self.releases.schedule(key, run_at, move || async move {
            match release(&*store, &*platform, key, Some(run_at)).await {
                Ok(true) => {
                    tracing::info!(guild_id = key.guild_id, user_id = key.user_id, "Mute expired");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(guild_id = key.guild_id, user_id = key.user_id, error = %e, "Failed to lift mute");
                }
            }
        });
    }
}

/// Lift a mute that is due by `due_by` (any mute when `None`).
///
/// The role goes first: if Discord refuses, the row stays and the next sweep
/// tries again.
async fn release<S, P>(
    store: &S,
    platform: &P,
    key: MuteKey,
    due_by: Option<DateTime<Utc>>,
) -> Result<bool, ModerationError>
where
    S: ModerationStore + ?Sized,
    P: ModerationPlatform + ?Sized,
{
    let Some(state) = store.get_mute(key.guild_id, key.user_id).await? else {
        return Ok(false);
    };
    if let Some(due_by) = due_by {
        if !state.is_due(due_by) {
            return Ok(false);
        }
    }

    let config = store.get_config(key.guild_id).await?;
    if let Some(role_id) = config.and_then(|c| c.restriction_role_id) {
        remove_restriction(platform, key, role_id, EXPIRY_REASON).await?;
    }

    store.release_mute(key.guild_id, key.user_id, due_by).await
}

/// Remove the muted role. A member who no longer has it (or has left) is fine.
async fn remove_restriction<P>(
    platform: &P,
    key: MuteKey,
    role_id: u64,
    reason: &str,
) -> Result<(), ModerationError>
where
    P: ModerationPlatform + ?Sized,
{
    match platform
        .remove_role(key.guild_id, key.user_id, role_id, reason)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(ModerationError::Platform(e)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
