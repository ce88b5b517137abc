//! Unit grammars shared by query options and log output.

/// A parsed memory specification. `percent` is true for values of the form
/// `80%`, which some callers accept and others (query options) reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSpec {
    pub bytes: i64,
    pub percent: bool,
}

/// Parse a memory size of the form `<number>[kKmMgGtT][bB]` or `<number>%`.
/// A bare number is bytes. Returns None for negative, malformed or empty
/// input.
pub fn parse_mem_spec(value: &str) -> Option<MemSpec> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(number) = value.strip_suffix('%') {
        let pct = number.trim().parse::<f64>().ok()?;
        if !(0.0..=100.0).contains(&pct) {
            return None;
        }
        return Some(MemSpec { bytes: pct as i64, percent: true });
    }

    let lower = value.to_ascii_lowercase();
    let (number, multiplier) = if let Some(n) = strip_unit(&lower, 't') {
        (n, 1i64 << 40)
    } else if let Some(n) = strip_unit(&lower, 'g') {
        (n, 1i64 << 30)
    } else if let Some(n) = strip_unit(&lower, 'm') {
        (n, 1i64 << 20)
    } else if let Some(n) = strip_unit(&lower, 'k') {
        (n, 1i64 << 10)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };

    let number = number.trim().parse::<f64>().ok()?;
    if number < 0.0 {
        return None;
    }
    let bytes = (number * multiplier as f64) as i64;
    Some(MemSpec { bytes, percent: false })
}

fn strip_unit<'a>(value: &'a str, unit: char) -> Option<&'a str> {
    // Accept both "4g" and "4gb".
    value
        .strip_suffix(&format!("{}b", unit))
        .or_else(|| value.strip_suffix(unit))
}

/// Render a millisecond duration the way the fleet's log scrapers expect:
/// `2s000ms`, `1m30s`, `500ms`, `2h3m`.
pub fn pretty_duration_ms(ms: i64) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;

    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}s{:03}ms", seconds, millis)
    } else {
        format!("{}ms", millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse_mem_spec("1048576"), Some(MemSpec { bytes: 1 << 20, percent: false }));
        assert_eq!(parse_mem_spec("0"), Some(MemSpec { bytes: 0, percent: false }));
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_mem_spec("4g").unwrap().bytes, 4 << 30);
        assert_eq!(parse_mem_spec("4GB").unwrap().bytes, 4 << 30);
        assert_eq!(parse_mem_spec("256m").unwrap().bytes, 256 << 20);
        assert_eq!(parse_mem_spec("8k").unwrap().bytes, 8 << 10);
        assert_eq!(parse_mem_spec("2t").unwrap().bytes, 2i64 << 40);
        assert_eq!(parse_mem_spec("100b").unwrap().bytes, 100);
        assert_eq!(parse_mem_spec("1.5g").unwrap().bytes, 3 << 29);
    }

    #[test]
    fn test_parse_percent() {
        let spec = parse_mem_spec("80%").unwrap();
        assert!(spec.percent);
        assert_eq!(spec.bytes, 80);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_mem_spec("").is_none());
        assert!(parse_mem_spec("-4g").is_none());
        assert!(parse_mem_spec("lots").is_none());
        assert!(parse_mem_spec("4x").is_none());
        assert!(parse_mem_spec("200%").is_none());
    }

    #[test]
    fn test_pretty_duration() {
        assert_eq!(pretty_duration_ms(2_000), "2s000ms");
        assert_eq!(pretty_duration_ms(2_500), "2s500ms");
        assert_eq!(pretty_duration_ms(500), "500ms");
        assert_eq!(pretty_duration_ms(90_000), "1m30s");
        assert_eq!(pretty_duration_ms(7_380_000), "2h3m");
        assert_eq!(pretty_duration_ms(0), "0ms");
    }
}
