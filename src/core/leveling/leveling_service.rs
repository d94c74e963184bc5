// This is the leveling module - it contains ALL the business logic for the reward system.
// Notice how this module has NO Discord-specific code (no serenity, no poise imports).
// It works with primitive types (u64, f64) so it could be driven by any chat frontend.

use crate::core::scheduling::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Message authors kept in memory so deletions can be attributed.
const MAX_TRACKED_AUTHORS: usize = 5_000;

// ============================================================================
// DOMAIN MODELS
// ============================================================================

/// A user's reward account in a specific guild.
///
/// Users can be in multiple Discord servers (guilds), and their progress is
/// tracked separately in each one.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardAccount {
    pub user_id: u64,
    pub guild_id: u64,
    pub points: u64,
    /// Awards are refused until this instant (unless overridden).
    pub next_eligible_at: DateTime<Utc>,
}

/// How many of a user's messages were deleted in a guild.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionTally {
    pub user_id: u64,
    pub deleted: u64,
}

/// Returned inside an award when the whole-number level went up,
/// so the Discord layer can announce it.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelUpEvent {
    pub user_id: u64,
    pub guild_id: u64,
    pub old_level: u32,
    pub new_level: u32,
    pub total_points: u64,
}

/// What happened when we tried to award points.
#[derive(Debug, Clone, PartialEq)]
pub enum AwardOutcome {
    Awarded {
        amount: u64,
        total: u64,
        level_up: Option<LevelUpEvent>,
    },
    /// The account is still cooling down. Nothing was changed.
    OnCooldown { remaining: Duration },
    /// The multiplier shrank the reward range to nothing. Nothing was changed.
    DegenerateRange,
}

impl AwardOutcome {
    pub fn awarded(&self) -> bool {
        matches!(self, AwardOutcome::Awarded { .. })
    }

    /// The level-up this award caused, if any.
    pub fn into_level_up(self) -> Option<LevelUpEvent> {
        match self {
            AwardOutcome::Awarded { level_up, .. } => level_up,
            _ => None,
        }
    }
}

/// A user's position in their guild, as shown by `/xp`.
#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub points: u64,
    pub level: f64,
    pub rank: u64,
}

/// What a member is doing in a voice channel during a voice XP tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceActivity {
    pub deafened: bool,
    pub muted: bool,
    pub video: bool,
    pub streaming: bool,
}

/// Reward multiplier for a voice tick. Deafened members earn nothing.
pub fn voice_multiplier(activity: VoiceActivity) -> Option<f64> {
    if activity.deafened {
        return None;
    }

    let mut multiplier = 1.0;
    if activity.video {
        multiplier *= 2.0;
    }
    if activity.streaming {
        multiplier *= 1.5;
    }
    if activity.muted {
        multiplier /= 2.0;
    }
    Some(multiplier)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LevelingError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid user or guild ID")]
    InvalidId,

    #[error("Multiplier must be a positive number, got {0}")]
    InvalidMultiplier(f64),

    #[error("Cannot remove {requested} points, only {available} available")]
    InsufficientPoints { requested: u64, available: u64 },

    #[error("Leaderboard limit must be at least 1")]
    InvalidLimit,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Smallest amount a single award can draw (inclusive).
    pub min_award: u64,
    /// Upper bound of a single award draw (exclusive).
    pub max_award: u64,
    /// Minimum time between two regular awards for the same account.
    pub cooldown: Duration,
    /// `K` in `level = sqrt(points / K)`.
    pub level_constant: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            min_award: 2,
            max_award: 7,
            cooldown: Duration::from_secs(60),
            level_constant: 50.0,
        }
    }
}

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================
// The core defines WHAT it needs, the infra layer decides HOW.

/// Persistence for reward accounts.
///
/// Every mutating method creates the account (0 points, immediately eligible)
/// if it does not exist yet.
#[async_trait]
pub trait RewardStore: Send + Sync {
    async fn get_account(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Option<RewardAccount>, LevelingError>;

    /// Atomically: if the account is eligible at `now`, add `amount` and move
    /// `next_eligible_at` forward. Returns the new total, or `None` when the
    /// account is still cooling down (in which case nothing changes).
    async fn claim_award(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
        now: DateTime<Utc>,
        next_eligible_at: DateTime<Utc>,
    ) -> Result<Option<u64>, LevelingError>;

    /// Add points without looking at (or moving) the cooldown. Returns the new total.
    async fn add_points(&self, user_id: u64, guild_id: u64, amount: u64)
        -> Result<u64, LevelingError>;

    async fn set_points(&self, user_id: u64, guild_id: u64, points: u64)
        -> Result<(), LevelingError>;

    /// Atomically subtract `amount` if the account holds at least that much.
    /// Returns the new total, or `None` if the balance was too small.
    async fn deduct_points(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
    ) -> Result<Option<u64>, LevelingError>;

    /// How many accounts in the guild have strictly more than `points`.
    async fn count_ahead(&self, guild_id: u64, points: u64) -> Result<u64, LevelingError>;

    /// Accounts with points, highest first (ties by user id).
    async fn get_leaderboard(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<RewardAccount>, LevelingError>;

    /// Count one more deleted message for the user. Returns the new count.
    async fn record_deleted_message(&self, user_id: u64, guild_id: u64)
        -> Result<u64, LevelingError>;

    /// Users with deleted messages, most first (ties by user id).
    async fn get_deletion_board(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<DeletionTally>, LevelingError>;
}

// ============================================================================
// CORE SERVICE
// ============================================================================

/// The main service for reward operations.
///
/// Generic over S: RewardStore, so tests can run it against an in-memory store.
pub struct LevelingService<S: RewardStore> {
    store: S,
    config: RewardConfig,
    clock: Arc<dyn Clock>,
    /// Last known `next_eligible_at` per (user, guild). Only used to skip a
    /// storage round-trip; the store stays the authority.
    cooldowns: DashMap<(u64, u64), DateTime<Utc>>,
    /// Message id -> author id, for messages seen since startup.
    recent_authors: DashMap<u64, u64>,
}

impl<S: RewardStore> LevelingService<S> {
    pub fn new(store: S, config: RewardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            cooldowns: DashMap::new(),
            recent_authors: DashMap::new(),
        }
    }

    fn validate_ids(user_id: u64, guild_id: u64) -> Result<(), LevelingError> {
        if user_id == 0 || guild_id == 0 {
            Err(LevelingError::InvalidId)
        } else {
            Ok(())
        }
    }

    /// The `[low, high)` range an award draws from under `multiplier`.
    pub fn award_range(&self, multiplier: f64) -> (u64, u64) {
        let low = (self.config.min_award as f64 * multiplier) as u64;
        let high = (self.config.max_award as f64 * multiplier) as u64;
        (low, high)
    }

    /// Try to award points for one piece of activity (a message, a voice tick).
    ///
    /// With `override_cooldown` the award ignores the cooldown and does not
    /// move it either; voice ticks use this.
    pub async fn award(
        &self,
        user_id: u64,
        guild_id: u64,
        multiplier: f64,
        override_cooldown: bool,
    ) -> Result<AwardOutcome, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(LevelingError::InvalidMultiplier(multiplier));
        }

        let now = self.clock.now();
        let key = (user_id, guild_id);

        // 1. Cheap cooldown check against the cache
        if !override_cooldown {
            if let Some(next) = self.cooldowns.get(&key).map(|entry| *entry) {
                if now < next {
                    return Ok(AwardOutcome::OnCooldown {
                        remaining: remaining_until(next, now),
                    });
                }
            }
        }

        // 2. Draw the amount
        let (low, high) = self.award_range(multiplier);
        if low >= high {
            tracing::debug!(user_id, guild_id, multiplier, "Award range is empty");
            return Ok(AwardOutcome::DegenerateRange);
        }
        let amount = StdRng::from_entropy().gen_range(low..high);

        // 3. Persist
        let total = if override_cooldown {
            self.store.add_points(user_id, guild_id, amount).await?
        } else {
            // A cooldown too long for the calendar never ends.
            let next = chrono::Duration::from_std(self.config.cooldown)
                .ok()
                .and_then(|cooldown| now.checked_add_signed(cooldown))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            match self
                .store
                .claim_award(user_id, guild_id, amount, now, next)
                .await?
            {
                Some(total) => {
                    self.cooldowns.insert(key, next);
                    total
                }
                None => {
                    // Someone else claimed it first, or the cache was cold.
                    let account = self.store.get_account(user_id, guild_id).await?;
                    let next = account
                        .map(|a| a.next_eligible_at)
                        .unwrap_or(now);
                    self.cooldowns.insert(key, next);
                    return Ok(AwardOutcome::OnCooldown {
                        remaining: remaining_until(next, now),
                    });
                }
            }
        };

        // 4. Did the whole-number level go up?
        let old_level = self.whole_level(total.saturating_sub(amount));
        let new_level = self.whole_level(total);
        let level_up = (new_level > old_level).then(|| LevelUpEvent {
            user_id,
            guild_id,
            old_level,
            new_level,
            total_points: total,
        });

        Ok(AwardOutcome::Awarded {
            amount,
            total,
            level_up,
        })
    }

    /// Current points (0 for accounts we have never seen).
    pub async fn get_points(&self, user_id: u64, guild_id: u64) -> Result<u64, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        Ok(self
            .store
            .get_account(user_id, guild_id)
            .await?
            .map(|a| a.points)
            .unwrap_or(0))
    }

    /// `level = sqrt(points / K)`.
    pub fn level(&self, points: u64) -> f64 {
        (points as f64 / self.config.level_constant).sqrt()
    }

    fn whole_level(&self, points: u64) -> u32 {
        self.level(points).floor() as u32
    }

    /// Inverse of `level`: points needed to reach `level`.
    pub fn points_required_for_level(&self, level: f64) -> u64 {
        (self.config.level_constant * level.max(0.0).powi(2)) as u64
    }

    /// How far `current` points are toward `level`, as a percentage capped at 100.
    pub fn progress_percent(&self, current: u64, level: f64) -> f64 {
        let required = self.points_required_for_level(level);
        if current >= required {
            100.0
        } else {
            current as f64 / required as f64 * 100.0
        }
    }

    /// 1-based rank of `points` in the guild. Equal points share a rank.
    pub async fn get_rank(&self, guild_id: u64, points: u64) -> Result<u64, LevelingError> {
        Ok(self.store.count_ahead(guild_id, points).await? + 1)
    }

    pub async fn get_standing(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<Standing, LevelingError> {
        let points = self.get_points(user_id, guild_id).await?;
        let rank = self.get_rank(guild_id, points).await?;
        Ok(Standing {
            points,
            level: self.level(points),
            rank,
        })
    }

    pub async fn get_leaderboard(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<RewardAccount>, LevelingError> {
        if guild_id == 0 {
            return Err(LevelingError::InvalidId);
        }
        if limit == 0 {
            return Err(LevelingError::InvalidLimit);
        }
        self.store.get_leaderboard(guild_id, limit).await
    }

    /// Remember who wrote a message in case it is deleted later.
    pub fn remember_author(&self, message_id: u64, user_id: u64) {
        self.recent_authors.insert(message_id, user_id);

        // Drop an arbitrary entry once past the cap.
        if self.recent_authors.len() > MAX_TRACKED_AUTHORS {
            let evict = self
                .recent_authors
                .iter()
                .map(|entry| *entry.key())
                .find(|id| *id != message_id);
            if let Some(id) = evict {
                self.recent_authors.remove(&id);
            }
        }
    }

    /// The remembered author of a message, forgetting it.
    pub fn take_author(&self, message_id: u64) -> Option<u64> {
        self.recent_authors.remove(&message_id).map(|(_, user_id)| user_id)
    }

    /// Note that one of the user's messages was deleted.
    pub async fn record_deleted_message(
        &self,
        user_id: u64,
        guild_id: u64,
    ) -> Result<u64, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        let deleted = self.store.record_deleted_message(user_id, guild_id).await?;
        tracing::debug!(user_id, guild_id, deleted, "Deleted message counted");
        Ok(deleted)
    }

    pub async fn get_deletion_board(
        &self,
        guild_id: u64,
        limit: usize,
    ) -> Result<Vec<DeletionTally>, LevelingError> {
        if guild_id == 0 {
            return Err(LevelingError::InvalidId);
        }
        if limit == 0 {
            return Err(LevelingError::InvalidLimit);
        }
        self.store.get_deletion_board(guild_id, limit).await
    }

    /// Administrative reset of a user's points.
    pub async fn set_points(
        &self,
        user_id: u64,
        guild_id: u64,
        points: u64,
    ) -> Result<(), LevelingError> {
        Self::validate_ids(user_id, guild_id)?;
        self.store.set_points(user_id, guild_id, points).await?;
        tracing::info!(user_id, guild_id, points, "Points set by administrator");
        Ok(())
    }

    /// Administrative decrement. Never takes an account below zero.
    pub async fn deduct_points(
        &self,
        user_id: u64,
        guild_id: u64,
        amount: u64,
    ) -> Result<u64, LevelingError> {
        Self::validate_ids(user_id, guild_id)?;

        match self.store.deduct_points(user_id, guild_id, amount).await? {
            Some(total) => {
                tracing::info!(user_id, guild_id, amount, total, "Points deducted");
                Ok(total)
            }
            None => {
                let available = self.get_points(user_id, guild_id).await?;
                Err(LevelingError::InsufficientPoints {
                    requested: amount,
                    available,
                })
            }
        }
    }
}

fn remaining_until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduling::clock::ManualClock;
    use chrono::TimeZone;

    /// In-memory store for testing. Clones share the same data, which lets a
    /// test "restart" the service on top of existing state.
    #[derive(Clone, Default)]
    struct MockRewardStore {
        accounts: Arc<DashMap<(u64, u64), RewardAccount>>,
        deletions: Arc<DashMap<(u64, u64), u64>>,
    }

    impl MockRewardStore {
        fn entry(
            &self,
            user_id: u64,
            guild_id: u64,
        ) -> dashmap::mapref::one::RefMut<'_, (u64, u64), RewardAccount> {
            self.accounts
                .entry((user_id, guild_id))
                .or_insert_with(|| RewardAccount {
                    user_id,
                    guild_id,
                    points: 0,
                    next_eligible_at: Utc.timestamp_opt(0, 0).unwrap(),
                })
        }
    }

    #[async_trait]
    impl RewardStore for MockRewardStore {
        async fn get_account(
            &self,
            user_id: u64,
            guild_id: u64,
        ) -> Result<Option<RewardAccount>, LevelingError> {
            Ok(self.accounts.get(&(user_id, guild_id)).map(|a| a.clone()))
        }

        async fn claim_award(
            &self,
            user_id: u64,
            guild_id: u64,
            amount: u64,
            now: DateTime<Utc>,
            next_eligible_at: DateTime<Utc>,
        ) -> Result<Option<u64>, LevelingError> {
            let mut account = self.entry(user_id, guild_id);
            if account.next_eligible_at > now {
                return Ok(None);
            }
            account.points += amount;
            account.next_eligible_at = next_eligible_at;
            Ok(Some(account.points))
        }

        async fn add_points(
            &self,
            user_id: u64,
            guild_id: u64,
            amount: u64,
        ) -> Result<u64, LevelingError> {
            let mut account = self.entry(user_id, guild_id);
            account.points += amount;
            Ok(account.points)
        }

        async fn set_points(
            &self,
            user_id: u64,
            guild_id: u64,
            points: u64,
        ) -> Result<(), LevelingError> {
            self.entry(user_id, guild_id).points = points;
            Ok(())
        }

        async fn deduct_points(
            &self,
            user_id: u64,
            guild_id: u64,
            amount: u64,
        ) -> Result<Option<u64>, LevelingError> {
            let mut account = self.entry(user_id, guild_id);
            if account.points < amount {
                return Ok(None);
            }
            account.points -= amount;
            Ok(Some(account.points))
        }

        async fn count_ahead(&self, guild_id: u64, points: u64) -> Result<u64, LevelingError> {
            Ok(self
                .accounts
                .iter()
                .filter(|a| a.guild_id == guild_id && a.points > points)
                .count() as u64)
        }

        async fn get_leaderboard(
            &self,
            guild_id: u64,
            limit: usize,
        ) -> Result<Vec<RewardAccount>, LevelingError> {
            let mut accounts: Vec<_> = self
                .accounts
                .iter()
                .filter(|a| a.guild_id == guild_id && a.points > 0)
                .map(|a| a.clone())
                .collect();
            accounts.sort_by(|a, b| b.points.cmp(&a.points).then(a.user_id.cmp(&b.user_id)));
            accounts.truncate(limit);
            Ok(accounts)
        }

        async fn record_deleted_message(
            &self,
            user_id: u64,
            guild_id: u64,
        ) -> Result<u64, LevelingError> {
            let mut count = self.deletions.entry((user_id, guild_id)).or_insert(0);
            *count += 1;
            Ok(*count)
        }

        async fn get_deletion_board(
            &self,
            guild_id: u64,
            limit: usize,
        ) -> Result<Vec<DeletionTally>, LevelingError> {
            let mut board: Vec<_> = self
                .deletions
                .iter()
                .filter(|e| e.key().1 == guild_id)
                .map(|e| DeletionTally {
                    user_id: e.key().0,
                    deleted: *e.value(),
                })
                .collect();
            board.sort_by(|a, b| b.deleted.cmp(&a.deleted).then(a.user_id.cmp(&b.user_id)));
            board.truncate(limit);
            Ok(board)
        }
    }

    fn make_service() -> (Arc<ManualClock>, MockRewardStore, LevelingService<MockRewardStore>) {
        let clock = Arc::new(ManualClock::new());
        let store = MockRewardStore::default();
        let service = LevelingService::new(
            store.clone(),
            RewardConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );
        (clock, store, service)
    }

    #[test]
    fn test_level_calculation() {
        let (_, _, service) = make_service();

        assert_eq!(service.level(0), 0.0);
        assert_eq!(service.level(50), 1.0);
        assert_eq!(service.level(200), 2.0);
        assert_eq!(service.level(450), 3.0);
        assert!((service.level(100) - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_points_required_for_level() {
        let (_, _, service) = make_service();

        assert_eq!(service.points_required_for_level(0.0), 0);
        assert_eq!(service.points_required_for_level(1.0), 50);
        assert_eq!(service.points_required_for_level(2.0), 200);
        assert_eq!(service.points_required_for_level(1.5), 112);
        assert_eq!(service.points_required_for_level(-3.0), 0);
    }

    #[test]
    fn level_and_points_required_are_inverse() {
        let (_, _, service) = make_service();

        for whole in 0..200u32 {
            let level = whole as f64;
            let round_trip = service.level(service.points_required_for_level(level));
            assert!((round_trip - level).abs() < 1e-9, "level {}", level);
        }

        // Fractional levels truncate to whole points, so the required amount is
        // the last point total at or below the level.
        for tenth in 0..500u32 {
            let level = tenth as f64 / 10.0;
            let required = service.points_required_for_level(level);
            assert!(service.level(required) <= level + 1e-9);
            assert!(service.level(required + 1) > level);
        }
    }

    #[test]
    fn progress_is_capped_at_one_hundred_percent() {
        let (_, _, service) = make_service();

        assert_eq!(service.progress_percent(100, 2.0), 50.0);
        assert_eq!(service.progress_percent(200, 2.0), 100.0);
        assert_eq!(service.progress_percent(5000, 2.0), 100.0);
        assert_eq!(service.progress_percent(0, 0.0), 100.0);
    }

    #[tokio::test]
    async fn first_message_creates_account_and_starts_cooldown() {
        let (clock, store, service) = make_service();

        assert_eq!(service.get_points(10, 20).await.unwrap(), 0);

        let outcome = service.award(10, 20, 1.0, false).await.unwrap();
        let AwardOutcome::Awarded { amount, total, .. } = outcome else {
            panic!("expected an award, got {:?}", outcome);
        };
        assert!((2..7).contains(&amount));
        assert_eq!(total, amount);

        let account = store.get_account(10, 20).await.unwrap().unwrap();
        assert_eq!(account.points, amount);
        assert_eq!(
            account.next_eligible_at,
            clock.now() + chrono::Duration::seconds(60)
        );

        clock.advance_secs(10);
        let outcome = service.award(10, 20, 1.0, false).await.unwrap();
        assert_eq!(
            outcome,
            AwardOutcome::OnCooldown {
                remaining: Duration::from_secs(50)
            }
        );
        assert_eq!(service.get_points(10, 20).await.unwrap(), amount);
    }

    #[tokio::test]
    async fn awards_are_never_closer_than_the_cooldown() {
        let (clock, _, service) = make_service();
        let mut award_times = Vec::new();

        for _ in 0..200 {
            if service.award(1, 1, 1.0, false).await.unwrap().awarded() {
                award_times.push(clock.now());
            }
            clock.advance_secs(7);
        }

        assert!(award_times.len() > 1);
        for pair in award_times.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::seconds(60));
        }
    }

    #[tokio::test]
    async fn cooldown_survives_a_restart() {
        let (clock, store, service) = make_service();
        assert!(service.award(1, 2, 1.0, false).await.unwrap().awarded());

        // A fresh service has a cold cache but the store still remembers.
        let restarted = LevelingService::new(
            store,
            RewardConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );
        clock.advance_secs(30);
        let outcome = restarted.award(1, 2, 1.0, false).await.unwrap();
        assert_eq!(
            outcome,
            AwardOutcome::OnCooldown {
                remaining: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn oversized_cooldown_never_ends() {
        let clock = Arc::new(ManualClock::new());
        let service = LevelingService::new(
            MockRewardStore::default(),
            RewardConfig {
                cooldown: Duration::from_secs(u64::MAX / 2),
                ..RewardConfig::default()
            },
            clock.clone() as Arc<dyn Clock>,
        );

        assert!(service.award(1, 2, 1.0, false).await.unwrap().awarded());
        clock.advance_secs(365 * 24 * 60 * 60);
        assert!(!service.award(1, 2, 1.0, false).await.unwrap().awarded());
    }

    #[tokio::test]
    async fn cooldown_is_per_guild() {
        let (_, _, service) = make_service();

        assert!(service.award(1, 100, 1.0, false).await.unwrap().awarded());
        assert!(service.award(1, 200, 1.0, false).await.unwrap().awarded());
        assert!(!service.award(1, 100, 1.0, false).await.unwrap().awarded());
    }

    #[tokio::test]
    async fn override_ignores_and_keeps_the_cooldown() {
        let (clock, store, service) = make_service();

        assert!(service.award(1, 1, 1.0, false).await.unwrap().awarded());
        let before = store.get_account(1, 1).await.unwrap().unwrap();

        for _ in 0..3 {
            assert!(service.award(1, 1, 1.0, true).await.unwrap().awarded());
        }
        let after = store.get_account(1, 1).await.unwrap().unwrap();
        assert_eq!(after.next_eligible_at, before.next_eligible_at);
        assert!(after.points >= before.points + 6);

        clock.advance_secs(5);
        assert!(!service.award(1, 1, 1.0, false).await.unwrap().awarded());
    }

    #[tokio::test]
    async fn multiplier_scales_the_range() {
        let (_, _, service) = make_service();

        assert_eq!(service.award_range(1.0), (2, 7));
        assert_eq!(service.award_range(2.0), (4, 14));
        assert_eq!(service.award_range(0.5), (1, 3));

        let outcome = service.award(1, 1, 2.0, true).await.unwrap();
        let AwardOutcome::Awarded { amount, .. } = outcome else {
            panic!("expected an award");
        };
        assert!((4..14).contains(&amount));
    }

    #[tokio::test]
    async fn degenerate_range_is_skipped_without_side_effects() {
        let (_, store, service) = make_service();

        let outcome = service.award(1, 1, 0.1, false).await.unwrap();
        assert_eq!(outcome, AwardOutcome::DegenerateRange);
        assert!(store.get_account(1, 1).await.unwrap().is_none());

        // And the cooldown was not consumed.
        assert!(service.award(1, 1, 1.0, false).await.unwrap().awarded());
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected() {
        let (_, _, service) = make_service();

        assert!(matches!(
            service.award(1, 1, 0.0, false).await,
            Err(LevelingError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            service.award(1, 1, f64::NAN, false).await,
            Err(LevelingError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            service.award(0, 1, 1.0, false).await,
            Err(LevelingError::InvalidId)
        ));
        assert!(matches!(
            service.get_leaderboard(1, 0).await,
            Err(LevelingError::InvalidLimit)
        ));
    }

    #[tokio::test]
    async fn level_up_is_reported_when_crossing_a_whole_level() {
        let (_, _, service) = make_service();
        service.set_points(1, 1, 49).await.unwrap();

        let outcome = service.award(1, 1, 1.0, false).await.unwrap();
        let AwardOutcome::Awarded {
            level_up: Some(event),
            total,
            ..
        } = outcome
        else {
            panic!("expected a level up, got {:?}", outcome);
        };
        assert_eq!(event.old_level, 0);
        assert_eq!(event.new_level, 1);
        assert_eq!(event.total_points, total);

        let announced = AwardOutcome::Awarded {
            amount: 2,
            total,
            level_up: Some(event.clone()),
        };
        assert_eq!(announced.into_level_up(), Some(event));

        // Same level after the award, or no award at all: nothing to announce.
        service.set_points(1, 1, 60).await.unwrap();
        let quiet = service.award(1, 1, 1.0, true).await.unwrap();
        assert!(quiet.awarded());
        assert_eq!(quiet.into_level_up(), None);
        let cooling = service.award(1, 1, 1.0, false).await.unwrap();
        assert_eq!(cooling.into_level_up(), None);
    }

    #[tokio::test]
    async fn deleted_messages_are_tallied_per_guild() {
        let (_, _, service) = make_service();

        assert_eq!(service.record_deleted_message(1, 9).await.unwrap(), 1);
        assert_eq!(service.record_deleted_message(1, 9).await.unwrap(), 2);
        service.record_deleted_message(2, 9).await.unwrap();
        service.record_deleted_message(3, 9).await.unwrap();
        service.record_deleted_message(4, 8).await.unwrap(); // other guild

        let board = service.get_deletion_board(9, 2).await.unwrap();
        assert_eq!(
            board,
            vec![
                DeletionTally { user_id: 1, deleted: 2 },
                DeletionTally { user_id: 2, deleted: 1 },
            ]
        );
        assert!(service.get_deletion_board(7, 10).await.unwrap().is_empty());
        assert!(matches!(
            service.record_deleted_message(0, 9).await,
            Err(LevelingError::InvalidId)
        ));
        assert!(matches!(
            service.get_deletion_board(9, 0).await,
            Err(LevelingError::InvalidLimit)
        ));
    }

    #[test]
    fn message_authors_are_taken_once_and_capped() {
        let (_, _, service) = make_service();

        service.remember_author(500, 1);
        assert_eq!(service.take_author(500), Some(1));
        assert_eq!(service.take_author(500), None);

        for id in 0..(MAX_TRACKED_AUTHORS as u64 + 10) {
            service.remember_author(id, 2);
        }
        assert_eq!(service.recent_authors.len(), MAX_TRACKED_AUTHORS);
        // The newest message is never the one evicted.
        assert_eq!(service.take_author(MAX_TRACKED_AUTHORS as u64 + 9), Some(2));
    }

    #[tokio::test]
    async fn deduction_never_goes_negative() {
        let (_, _, service) = make_service();
        service.set_points(1, 1, 10).await.unwrap();

        assert_eq!(service.deduct_points(1, 1, 4).await.unwrap(), 6);
        let err = service.deduct_points(1, 1, 7).await.unwrap_err();
        assert!(matches!(
            err,
            LevelingError::InsufficientPoints {
                requested: 7,
                available: 6
            }
        ));
        assert_eq!(service.get_points(1, 1).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn rank_follows_points() {
        let (_, _, service) = make_service();
        service.set_points(1, 9, 500).await.unwrap();
        service.set_points(2, 9, 300).await.unwrap();
        service.set_points(3, 9, 300).await.unwrap();
        service.set_points(4, 9, 100).await.unwrap();
        service.set_points(5, 8, 9000).await.unwrap(); // other guild

        assert_eq!(service.get_rank(9, 500).await.unwrap(), 1);
        assert_eq!(service.get_rank(9, 300).await.unwrap(), 2);
        assert_eq!(service.get_rank(9, 100).await.unwrap(), 4);

        let standing = service.get_standing(3, 9).await.unwrap();
        assert_eq!(standing.rank, 2);
        assert_eq!(standing.points, 300);

        let board = service.get_leaderboard(9, 10).await.unwrap();
        let order: Vec<u64> = board.iter().map(|a| a.user_id).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn voice_multipliers() {
        assert_eq!(voice_multiplier(VoiceActivity::default()), Some(1.0));
        assert_eq!(
            voice_multiplier(VoiceActivity {
                deafened: true,
                video: true,
                ..Default::default()
            }),
            None
        );
        assert_eq!(
            voice_multiplier(VoiceActivity {
                video: true,
                streaming: true,
                ..Default::default()
            }),
            Some(3.0)
        );
        assert_eq!(
            voice_multiplier(VoiceActivity {
                muted: true,
                ..Default::default()
            }),
            Some(0.5)
        );
    }

    #[test]
    fn leveling_error_messages_are_descriptive() {
        let storage_error = LevelingError::StorageError("db down".into());
        assert!(storage_error.to_string().contains("db down"));

        let invalid_id = LevelingError::InvalidId;
        assert_eq!(invalid_id.to_string(), "Invalid user or guild ID");
    }
}
