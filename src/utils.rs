use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Longest payload excerpt carried inside error messages.
pub const EXCERPT_LEN: usize = 200;

/// Truncates `text` to at most `EXCERPT_LEN` characters for logging.
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Start of the UTC hour containing `ts`.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

/// Converts unix seconds as sent by the upstream.
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

pub fn env_u64(name: &str, default: u64) -> Result<u64, String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("{} must be a non-negative integer, got {:?}", name, s)),
        _ => Ok(default),
    }
}

pub fn env_f64(name: &str, default: f64) -> Result<f64, String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
            _ => Err(format!("{} must be a positive number, got {:?}", name, s)),
        },
        _ => Ok(default),
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn floors_to_the_hour() {
        let ts = Utc.with_ymd_and_hms(2023, 11, 14, 22, 47, 13).unwrap();
        assert_eq!(floor_to_hour(ts), Utc.with_ymd_and_hms(2023, 11, 14, 22, 0, 0).unwrap());
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(EXCERPT_LEN + 10);
        let out = excerpt(&long);
        assert_eq!(out.chars().count(), EXCERPT_LEN + 1);
        assert!(out.ends_with('…'));
        assert_eq!(excerpt("  short  "), "short");
    }
}
