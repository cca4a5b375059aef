//! Small helpers shared by logging and the handshake.

use std::time::{SystemTime, UNIX_EPOCH};

/// Render a byte count for logs (`512B`, `1.500K`, `3.000M`, `1.250G`).
pub fn fmt_bytes(len: u64) -> String {
    const K: f64 = 1024.0;
    let value = len as f64;
    if len < 1024 {
        format!("{len}B")
    } else if value < K * K {
        format!("{:.3}K", value / K)
    } else if value < K * K * K {
        format!("{:.3}M", value / (K * K))
    } else {
        format!("{:.3}G", value / (K * K * K))
    }
}

/// Seconds since the Unix epoch (0 if the clock is before it).
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0B");
        assert_eq!(fmt_bytes(1023), "1023B");
        assert_eq!(fmt_bytes(1536), "1.500K");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.000M");
        assert_eq!(fmt_bytes(5 * 1024 * 1024 * 1024 / 4), "1.250G");
    }

    #[test]
    fn test_unix_time_is_recent() {
        // 2020-01-01
        assert!(unix_time() > 1_577_836_800);
    }
}
