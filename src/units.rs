//! Rendering helpers for log output.

use std::time::Duration;

/// Render an elapsed duration with an adaptive unit: microseconds under a
/// millisecond, milliseconds under a second, fractional seconds above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();

    if seconds < 0.001 {
        format!("{}µs", (seconds * 1e6).ceil() as u64)
    } else if seconds < 1.0 {
        format!("{}ms", (seconds * 1e3).ceil() as u64)
    } else {
        format!("{seconds:.1}s")
    }
}

/// Render a byte count with an adaptive decimal unit (powers of 10³).
pub fn format_body_size(size: u64) -> String {
    if size < 1_000 {
        format!("{size}B")
    } else if size < 1_000_000 {
        format!("{:.1}KB", size as f64 / 1e3)
    } else if size < 1_000_000_000 {
        format!("{:.1}MB", size as f64 / 1e6)
    } else {
        format!("{:.1}GB", size as f64 / 1e9)
    }
}

/// Truncate a string to at most `max` bytes without splitting a character.
pub fn truncate_to_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_micros(50)), "50µs");
        assert_eq!(format_elapsed(Duration::from_micros(999)), "999µs");
        assert_eq!(format_elapsed(Duration::from_millis(2)), "2ms");
        assert_eq!(format_elapsed(Duration::from_millis(999)), "999ms");
        assert_eq!(format_elapsed(Duration::from_secs(2)), "2.0s");
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.5s");
    }

    #[test]
    fn test_format_body_size() {
        assert_eq!(format_body_size(0), "0B");
        assert_eq!(format_body_size(999), "999B");
        assert_eq!(format_body_size(1_500), "1.5KB");
        assert_eq!(format_body_size(2_000_000), "2.0MB");
        assert_eq!(format_body_size(3_500_000_000), "3.5GB");
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let mut s = "abcdef".to_string();
        truncate_to_char_boundary(&mut s, 4);
        assert_eq!(s, "abcd");

        let mut s = "abc".to_string();
        truncate_to_char_boundary(&mut s, 4);
        assert_eq!(s, "abc");

        // é is two bytes; a limit inside it backs off to the boundary.
        let mut s = "aéé".to_string();
        truncate_to_char_boundary(&mut s, 2);
        assert_eq!(s, "a");

        let mut s = "aéé".to_string();
        truncate_to_char_boundary(&mut s, 3);
        assert_eq!(s, "aé");

        let mut s = "日本語".to_string();
        truncate_to_char_boundary(&mut s, 4);
        assert_eq!(s, "日");

        let mut s = String::new();
        truncate_to_char_boundary(&mut s, 0);
        assert_eq!(s, "");
    }
}
