use std::time::Duration;

use chrono::{DateTime, Utc};

pub const ELLIPSIS: &str = "...";

#[must_use]
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_millis(1) {
        format!("{}µs", duration.as_micros())
    } else if duration < Duration::from_secs(1) {
        #[allow(clippy::cast_precision_loss)]
        let millis = duration.as_micros() as f64 / 1000.0;
        format!("{millis:.1}ms")
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// Truncates to `max_runes` characters, the last three replaced by `...`.
#[must_use]
pub fn truncate_runes(value: &str, max_runes: usize) -> String {
    if max_runes == 0 {
        return String::new();
    }
    if value.chars().count() <= max_runes {
        return value.to_string();
    }
    if max_runes <= ELLIPSIS.len() {
        return value.chars().take(max_runes).collect();
    }

    let mut truncated: String = value.chars().take(max_runes - ELLIPSIS.len()).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

#[must_use]
pub fn format_time_ago(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    if elapsed.num_minutes() < 1 {
        return "just now".to_string();
    }
    if elapsed.num_hours() < 1 {
        return match elapsed.num_minutes() {
            1 => "1 min ago".to_string(),
            minutes => format!("{minutes} mins ago"),
        };
    }
    if elapsed.num_days() < 1 {
        return match elapsed.num_hours() {
            1 => "1 hour ago".to_string(),
            hours => format!("{hours} hours ago"),
        };
    }
    match elapsed.num_days() {
        1 => "yesterday".to_string(),
        days @ 2..=6 => format!("{days} days ago"),
        _ => at.format("%b %d, %Y").to_string(),
    }
}
