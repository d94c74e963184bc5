// Parsing helpers for free-text command arguments.
//
// Slash commands can't take a variable number of users, so batch commands
// accept a text field of mentions instead.

use std::time::Duration;

/// Pull user ids out of text like `<@123> <@!456> 789`.
///
/// Duplicates are dropped, order is kept.
pub fn parse_mentions(input: &str) -> Vec<u64> {
    let mut ids = Vec::new();

    for token in input.split(|c: char| c.is_whitespace() || c == ',') {
        let inner = token
            .strip_prefix("<@")
            .and_then(|t| t.strip_suffix('>'))
            .map(|t| t.trim_start_matches('!'))
            .unwrap_or(token);

        if !(17..=20).contains(&inner.len()) || !inner.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(id) = inner.parse::<u64>() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    ids
}

/// Longest mute a moderator can ask for.
pub const MAX_DURATION: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Parse a mute duration such as `30` (seconds), `10m`, `2h`, `1d`, `1w`
/// or `30 minutes`. Zero and anything past `MAX_DURATION` are rejected.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim().to_lowercase();

    let duration = parse_compact_format(&input.replace(' ', ""))
        .or_else(|| parse_verbose_format(&input))?;

    (!duration.is_zero() && duration <= MAX_DURATION).then_some(duration)
}

/// Compact formats: a number with an optional single-letter unit.
fn parse_compact_format(input: &str) -> Option<Duration> {
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num_str, unit) = input.split_at(split);

    let multiplier = match unit {
        "" | "s" => 1u64,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        _ => return None,
    };

    let number: u64 = num_str.parse().ok()?;
    number.checked_mul(multiplier).map(Duration::from_secs)
}

/// Verbose formats like "30 minutes", "2 hours", "1 day".
fn parse_verbose_format(input: &str) -> Option<Duration> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.len() != 2 {
        return None;
    }

    let number: u64 = parts[0].parse().ok()?;
    let multiplier = match parts[1].trim_end_matches('s') {
        "second" | "sec" => 1u64,
        "minute" | "min" => 60,
        "hour" | "hr" => 3600,
        "day" => 86400,
        "week" => 604800,
        _ => return None,
    };

    number.checked_mul(multiplier).map(Duration::from_secs)
}

/// Render a duration the way mute replies show it, e.g. `1d 2h 5m 3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86400,
        (total % 86400) / 3600,
        (total % 3600) / 60,
        total % 60,
    );

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{}s", seconds));
    }
    parts.join(" ")
}
