// Moderation domain models - strikes, mutes and per-guild settings.
//
// These are pure domain types with no Discord dependencies.
// The Discord layer converts members into `MemberSnapshot`s and renders the
// reports that come back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest reason we keep on a strike.
pub const MAX_REASON_CHARS: usize = 256;

/// Per-guild moderation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Whether moderation commands may be used in this guild
    pub enabled: bool,
    /// Strike count at which a member is banned
    pub max_strikes: u32,
    /// The role that mutes members (provisioned when moderation is enabled)
    pub restriction_role_id: Option<u64>,
}

impl ModerationConfig {
    /// Settings for a guild that has never touched moderation.
    pub fn disabled(max_strikes: u32) -> Self {
        Self {
            enabled: false,
            max_strikes,
            restriction_role_id: None,
        }
    }
}

/// One recorded infraction.
#[derive(Debug, Clone, PartialEq)]
pub struct StrikeRecord {
    pub id: i64,
    pub guild_id: u64,
    pub user_id: u64,
    pub reason: String,
    pub issued_at: DateTime<Utc>,
}

/// A persisted mute. No row means the member is not muted.
#[derive(Debug, Clone, PartialEq)]
pub struct MuteState {
    pub guild_id: u64,
    pub user_id: u64,
    pub muted_until: DateTime<Utc>,
}

impl MuteState {
    pub fn key(&self) -> MuteKey {
        MuteKey {
            guild_id: self.guild_id,
            user_id: self.user_id,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.muted_until <= now
    }
}

/// Identifies the pending release of a mute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MuteKey {
    pub guild_id: u64,
    pub user_id: u64,
}

/// What the core needs to know about a guild member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSnapshot {
    pub user_id: u64,
    /// Position of the member's highest role. Higher outranks lower.
    pub authority: u16,
    pub role_ids: Vec<u64>,
}

impl MemberSnapshot {
    pub fn outranks(&self, other: &MemberSnapshot) -> bool {
        self.authority > other.authority
    }

    pub fn has_role(&self, role_id: u64) -> bool {
        self.role_ids.contains(&role_id)
    }
}

// ============================================================================
// PLATFORM ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    PermissionDenied,
    NotFound,
    Other,
}

/// A failed call to the chat platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == PlatformErrorKind::NotFound
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PlatformErrorKind::PermissionDenied => write!(f, "missing permissions ({})", self.message),
            PlatformErrorKind::NotFound => write!(f, "not found ({})", self.message),
            PlatformErrorKind::Other => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for PlatformError {}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BanStatus {
    NotBanned,
    Banned,
    /// The threshold was reached but the ban call failed.
    Failed(PlatformError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrikeOutcome {
    pub strike_id: i64,
    pub active_strikes: u32,
    pub max_strikes: u32,
    pub ban: BanStatus,
}

impl StrikeOutcome {
    pub fn banned(&self) -> bool {
        self.ban == BanStatus::Banned
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuteOutcome {
    pub muted_until: DateTime<Utc>,
}

/// Why a single member in a batch was skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubjectError {
    #[error("you do not outrank this member")]
    InsufficientAuthority,

    #[error("already muted")]
    AlreadyMuted,

    #[error("Discord refused: {0}")]
    Platform(PlatformError),
}

/// Per-member results of a command that targets several members.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport<T> {
    pub results: Vec<(u64, Result<T, SubjectError>)>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn push(&mut self, user_id: u64, result: Result<T, SubjectError>) {
        self.results.push((user_id, result));
    }

    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (u64, &T)> {
        self.results
            .iter()
            .filter_map(|(user_id, result)| result.as_ref().ok().map(|t| (*user_id, t)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (u64, &SubjectError)> {
        self.results
            .iter()
            .filter_map(|(user_id, result)| result.as_ref().err().map(|e| (*user_id, e)))
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    /// One-line summary for the command reply.
    pub fn summary(&self) -> String {
        let ok = self.success_count();
        if ok == 0 {
            "No changes were made.".to_string()
        } else if ok == self.attempted() {
            format!("Done for all {} member(s).", ok)
        } else {
            format!("{} of {} succeeded.", ok, self.attempted())
        }
    }
}

/// What startup reconciliation did with the persisted mutes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Mutes that had already expired and were lifted right away
    pub released: usize,
    /// Mutes still running whose release was scheduled again
    pub rearmed: usize,
}

/// Collapse whitespace and cap the length, the way strike reasons are stored.
pub fn normalize_reason(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_REASON_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_collapsed_and_truncated() {
        assert_eq!(normalize_reason("  spamming \n in   general "), "spamming in general");
        assert_eq!(normalize_reason(""), "");

        let long = "é".repeat(300);
        let normalized = normalize_reason(&long);
        assert_eq!(normalized.chars().count(), MAX_REASON_CHARS);
    }

    #[test]
    fn batch_summary_distinguishes_outcomes() {
        let mut report: BatchReport<()> = BatchReport::default();
        assert_eq!(report.summary(), "No changes were made.");

        report.push(1, Err(SubjectError::InsufficientAuthority));
        assert_eq!(report.summary(), "No changes were made.");

        report.push(2, Ok(()));
        assert_eq!(report.summary(), "1 of 2 succeeded.");
        assert_eq!(report.failed().count(), 1);

        let mut all_ok: BatchReport<()> = BatchReport::default();
        all_ok.push(1, Ok(()));
        all_ok.push(2, Ok(()));
        assert_eq!(all_ok.summary(), "Done for all 2 member(s).");
    }

    #[test]
    fn authority_must_be_strictly_higher() {
        let moderator = MemberSnapshot {
            user_id: 1,
            authority: 5,
            role_ids: vec![],
        };
        let peer = MemberSnapshot {
            user_id: 2,
            authority: 5,
            role_ids: vec![],
        };
        let member = MemberSnapshot {
            user_id: 3,
            authority: 1,
            role_ids: vec![42],
        };

        assert!(!moderator.outranks(&peer));
        assert!(moderator.outranks(&member));
        assert!(member.has_role(42));
    }
}
