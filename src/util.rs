//! Small shared helpers: stable identifiers and number formatting.

use sha2::{Digest, Sha256};

/// Length of alarm-instance identifiers.
pub const ALARM_HASH_LEN: usize = 16;

/// Length of command-acknowledgement identifiers.
pub const ACK_HASH_LEN: usize = 6;

/// Generate a hex identifier from the concatenation of the given parts.
///
/// The same parts always produce the same identifier, which is what makes
/// these usable as alarm-instance and command-ack ids across processes.
pub fn make_hash<I, S>(parts: I, hash_length: usize) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(hash_length + 2);
    for byte in digest.iter() {
        if out.len() >= hash_length {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(hash_length);
    out
}

/// Format a sensor measurement with a sensible number of significant figures.
///
/// In general rounds to three significant figures; when `low` and `high` are
/// close together, enough decimals are kept to distinguish them (limits of
/// 1.023 and 1.044 give three decimal places). Returns `None` when the
/// bracket or the value makes the computation meaningless (e.g. low == high
/// or a non-positive value), so callers can fall back to a plain format.
pub fn sensible_sig_figs(value: f64, low: f64, high: f64) -> Option<String> {
    const DEFAULT_SIG_FIGS: i32 = 3;
    if !(high > low) || value <= 0.0 || !value.is_finite() {
        return None;
    }
    let min_decimals = 1 - (high - low).log10().floor() as i32;
    let min_sig_figs = value.log10().floor() as i32 + 1 + min_decimals;
    let sig_figs = min_sig_figs.max(DEFAULT_SIG_FIGS);
    Some(format_sig_figs(value, sig_figs))
}

/// Current unix time in fractional seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Index into a per-level table (silence durations, escalation thresholds,
/// protocols, recipients). Levels are 1-based: level 1 maps to the first
/// entry; out-of-range levels clamp to the last entry.
pub fn level_index(level: i64, len: usize) -> usize {
    let idx = (level.max(1) - 1) as usize;
    idx.min(len.saturating_sub(1))
}

/// Format `value` to `sig_figs` significant figures without trailing cruft.
pub fn format_sig_figs(value: f64, sig_figs: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = sig_figs - 1 - magnitude;
    if decimals > 0 {
        format!("{:.*}", decimals as usize, value)
    } else {
        // rounding above the decimal point
        let scale = 10f64.powi(-decimals);
        format!("{:.0}", (value / scale).round() * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_sized() {
        let a = make_hash(["1234.5", "alarm_test"], ALARM_HASH_LEN);
        let b = make_hash(["1234.5", "alarm_test"], ALARM_HASH_LEN);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_differs_on_input() {
        let a = make_hash(["1234.5", "alarm_test"], ALARM_HASH_LEN);
        let b = make_hash(["1234.6", "alarm_test"], ALARM_HASH_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ack_hash_length() {
        assert_eq!(make_hash(["x"], ACK_HASH_LEN).len(), 6);
    }

    #[test]
    fn test_sig_figs_default() {
        assert_eq!(sensible_sig_figs(12.3456, 0.0, 100.0).unwrap(), "12.3");
    }

    #[test]
    fn test_sig_figs_tight_bracket() {
        // limits 1.023..1.044 need three decimals
        assert_eq!(sensible_sig_figs(1.0301, 1.023, 1.044).unwrap(), "1.030");
    }

    #[test]
    fn test_sig_figs_degenerate_bracket() {
        assert!(sensible_sig_figs(5.0, 2.0, 2.0).is_none());
        assert!(sensible_sig_figs(-1.0, 0.0, 10.0).is_none());
    }

    #[test]
    fn test_sig_figs_large_value() {
        assert_eq!(sensible_sig_figs(12345.0, 0.0, 100000.0).unwrap(), "12300");
    }

    #[test]
    fn test_level_index_is_one_based_and_clamped() {
        assert_eq!(level_index(1, 3), 0);
        assert_eq!(level_index(2, 3), 1);
        assert_eq!(level_index(3, 3), 2);
        // out of range clamps to the last configured entry
        assert_eq!(level_index(7, 3), 2);
        // nonsense levels clamp to the first
        assert_eq!(level_index(0, 3), 0);
        assert_eq!(level_index(-1, 3), 0);
    }
}
