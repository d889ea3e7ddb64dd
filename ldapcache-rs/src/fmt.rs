//! Provides parsing and formatting helpers for durations and byte sizes.
//!
//! These are used to read human friendly settings like `max_memory: 256m` or `timeout: 30s`
//! and to report such values in the log.
use std::fmt::Write;
use std::time::Duration;

use anyhow::anyhow;

const SIZE_UNITS: [&str; 6] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];

const DURATION_UNITS: [(u128, &str); 5] = [
    (1000 * 60 * 60 * 24, "d"),
    (1000 * 60 * 60, "h"),
    (1000 * 60, "m"),
    (1000, "s"),
    (1, "ms"),
];

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// # Examples
///
/// ```
/// # use ldapcache::fmt::format_size;
/// assert_eq!(format_size(0), "0 bytes");
/// assert_eq!(format_size(1), "1 byte");
/// assert_eq!(format_size(100), "100 bytes");
/// assert_eq!(format_size(8_734), "8.53 KiB");
/// assert_eq!(format_size(87_340), "85.3 KiB");
/// assert_eq!(format_size(873_400), "853 KiB");
/// assert_eq!(format_size(256 * 1024 * 1024), "256 MiB");
/// assert_eq!(format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    match size_in_bytes {
        1 => return "1 byte".to_owned(),
        n if n < 1024 => return format!("{} bytes", n),
        _ => (),
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f64;
    while size > 1024. && magnitude < SIZE_UNITS.len() - 1 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        format!("{:.2} {}", size, SIZE_UNITS[magnitude])
    } else if size <= 100. {
        format!("{:.1} {}", size, SIZE_UNITS[magnitude])
    } else {
        format!("{:.0} {}", size, SIZE_UNITS[magnitude])
    }
}

/// Parses a size from a given string.
///
/// This string can have the following suffixes:
/// * **k** or **K**: treats the value as KiB
/// * **m** or **M**: treats the value as MiB
/// * **g** or **G**: treats the value as GiB
/// * **t** or **T**: treats the value as TiB
///
/// Returns an **Err** if either a non-integer value, an unknown suffix or a value which
/// doesn't fit into memory at all is given.
///
/// # Examples
///
/// ```
/// # use ldapcache::fmt::parse_size;
/// assert_eq!(parse_size("100").unwrap(), 100);
/// assert_eq!(parse_size("100b").unwrap(), 100);
/// assert_eq!(parse_size("8k").unwrap(), 8192);
/// assert_eq!(parse_size("256m").unwrap(), 256 * 1024 * 1024);
/// assert_eq!(parse_size("4 G").unwrap(), 4 * 1024 * 1024 * 1024);
///
/// assert_eq!(parse_size("3 Y").is_err(), true);
/// assert_eq!(parse_size("1.2g").is_err(), true);
/// assert_eq!(parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(str: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    let invalid = || {
        anyhow!(
            "Cannot parse '{}' into a size expression. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            str.as_ref()
        )
    };

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(invalid)?;
    let number = captures[1].parse::<usize>().map_err(|_| invalid())?;
    let factor: usize = match &captures[2] {
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1 << 40,
        _ => 1,
    };

    number.checked_mul(factor).ok_or_else(invalid)
}

/// Parses a duration from a given string.
///
/// This string can have the following suffixes:
/// * **ms** or **MS**: treats the value as milliseconds (also used if no suffix is present)
/// * **s** or **S**: treats the value as seconds
/// * **m** or **M**: treats the value as minutes
/// * **h** or **H**: treats the value as hours
/// * **d** or **D**: treats the value as days
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use ldapcache::fmt::parse_duration;
/// assert_eq!(parse_duration("100").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("15 m").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(parse_duration("2 H").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// assert_eq!(parse_duration("3 Y").is_err(), true);
/// assert_eq!(parse_duration("1.5s").is_err(), true);
/// assert_eq!(parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|s|m|h|d|MS|S|M|H|D)? *$").unwrap();
    }

    let invalid = || {
        anyhow!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    };

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(invalid)?;
    let number = captures[1].parse::<u64>().map_err(|_| invalid())?;
    let seconds = |factor: u64| {
        number
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    };

    match captures.get(2).map(|suffix| suffix.as_str()) {
        Some("s") | Some("S") => seconds(1),
        Some("m") | Some("M") => seconds(60),
        Some("h") | Some("H") => seconds(60 * 60),
        Some("d") | Some("D") => seconds(60 * 60 * 24),
        _ => Ok(Duration::from_millis(number)),
    }
}

/// Formats a duration into a string like "1d 3h 17m 2s 12ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use ldapcache::fmt::format_duration;
/// assert_eq!(format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(format_duration(Duration::from_secs(15 * 60)), "15m");
/// assert_eq!(format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// assert_eq!(format_duration(Duration::ZERO), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut result = String::new();
    let mut value = duration.as_millis();

    for (millis, unit) in DURATION_UNITS {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            value %= millis;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}
