//! Provides parsing and formatting helpers for durations and byte sizes.
//!
//! These are used to read the timing parameters of the [config](crate::config) (e.g. `30s` or
//! `10ms`) and to emit human readable log messages.
use std::fmt::Write;
use std::time::Duration;

/// Formats a duration given in microseconds.
///
/// The unit (microseconds, milliseconds or seconds) is picked so that the output stays short.
/// A convenience wrapper which returns a String is [format_short_duration](format_short_duration).
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    match micros {
        m if m < 1_000 => write!(f, "{} us", m),
        m if m < 10_000 => write!(f, "{:.2} ms", m as f32 / 1_000.),
        m if m < 100_000 => write!(f, "{:.1} ms", m as f32 / 1_000.),
        m if m < 1_000_000 => write!(f, "{} ms", m / 1_000),
        m if m < 10_000_000 => write!(f, "{:.2} s", m as f32 / 1_000_000.),
        m if m < 100_000_000 => write!(f, "{:.1} s", m as f32 / 1_000_000.),
        m => write!(f, "{} s", m / 1_000_000),
    }
}

/// Formats a duration given in microseconds into a String.
///
/// # Examples
///
/// ```
/// assert_eq!(cacher::fmt::format_short_duration(250), "250 us");
/// assert_eq!(cacher::fmt::format_short_duration(4_096), "4.10 ms");
/// assert_eq!(cacher::fmt::format_short_duration(48_000), "48.0 ms");
/// assert_eq!(cacher::fmt::format_short_duration(512_345), "512 ms");
/// assert_eq!(cacher::fmt::format_short_duration(2_500_000), "2.50 s");
/// assert_eq!(cacher::fmt::format_short_duration(30_000_000), "30.0 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes, e.g. "8.53 KiB".
///
/// # Examples
///
/// ```
/// assert_eq!(cacher::fmt::format_size(0), "0 bytes");
/// assert_eq!(cacher::fmt::format_size(1), "1 byte");
/// assert_eq!(cacher::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(cacher::fmt::format_size(873_400_000), "833 MiB");
/// assert_eq!(cacher::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    const UNITS: [&str; 6] = ["Bytes", "KiB", "MiB", "GiB", "TiB", "PiB"];

    match size_in_bytes {
        1 => return "1 byte".to_owned(),
        n if n < 1024 => return format!("{} bytes", n),
        _ => (),
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < UNITS.len() - 1 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        format!("{:.2} {}", size, UNITS[magnitude])
    } else if size <= 100. {
        format!("{:.1} {}", size, UNITS[magnitude])
    } else {
        format!("{:.0} {}", size, UNITS[magnitude])
    }
}

/// Parses a byte size like "512", "64k", "16m" or "1g".
///
/// Accepted suffixes are **b**, **k**, **m**, **g** and **t** (case insensitive, powers of 1024).
///
/// # Examples
///
/// ```
/// assert_eq!(cacher::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(cacher::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(cacher::fmt::parse_size("1 G").unwrap(), 1024 * 1024 * 1024);
/// assert_eq!(cacher::fmt::parse_size("1.5g").is_err(), true);
/// assert_eq!(cacher::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(str: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a size expression. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<usize>()?;
    let factor: usize = match &captures[2] {
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        "t" | "T" => 1 << 40,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("The size '{}' is too large.", str.as_ref()))
}

/// Parses a duration like "10ms", "30s", "5m", "2h" or "1d".
///
/// A plain number without suffix is treated as milliseconds.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(cacher::fmt::parse_duration("10ms").unwrap(), Duration::from_millis(10));
/// assert_eq!(cacher::fmt::parse_duration("500").unwrap(), Duration::from_millis(500));
/// assert_eq!(cacher::fmt::parse_duration("30 s").unwrap(), Duration::from_secs(30));
/// assert_eq!(cacher::fmt::parse_duration("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(cacher::fmt::parse_duration("1d").unwrap(), Duration::from_secs(86_400));
///
/// assert_eq!(cacher::fmt::parse_duration("3 Y").is_err(), true);
/// assert_eq!(cacher::fmt::parse_duration("1.2s").is_err(), true);
/// assert_eq!(cacher::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *((ms|s|m|h|d|MS|S|M|H|D)?) *$").unwrap();
    }

    let captures = NUMBER_AND_SUFFIX.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration expression. \
             Expected a positive number and optionally 'ms', 's', 'm', 'h' or 'd' as suffix.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    Ok(match &captures[2] {
        "s" | "S" => Duration::from_secs(number),
        "m" | "M" => Duration::from_secs(number * 60),
        "h" | "H" => Duration::from_secs(number * 60 * 60),
        "d" | "D" => Duration::from_secs(number * 60 * 60 * 24),
        _ => Duration::from_millis(number),
    })
}

/// Parses a duration which may also be switched off.
///
/// "0", "never" and "off" yield **None**, everything else is handled by
/// [parse_duration](parse_duration).
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(cacher::fmt::parse_optional_duration("never").unwrap(), None);
/// assert_eq!(cacher::fmt::parse_optional_duration("0").unwrap(), None);
/// assert_eq!(cacher::fmt::parse_optional_duration("15m").unwrap(), Some(Duration::from_secs(900)));
/// ```
pub fn parse_optional_duration(str: impl AsRef<str>) -> anyhow::Result<Option<Duration>> {
    match str.as_ref().trim() {
        "never" | "off" => Ok(None),
        value => parse_duration(value).map(|duration| Some(duration).filter(|d| !d.is_zero())),
    }
}

/// Formats a duration into a string like "1m 2s 13ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(cacher::fmt::format_duration(Duration::from_millis(10)), "10ms");
/// assert_eq!(cacher::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(cacher::fmt::format_duration(Duration::from_secs(30)), "30s");
/// assert_eq!(cacher::fmt::format_duration(Duration::from_secs(90_060)), "1d 1h 1m");
/// assert_eq!(cacher::fmt::format_duration(Duration::ZERO), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut value = duration.as_millis();
    for (millis_per_unit, suffix) in UNITS {
        let amount = value / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, suffix);
            value %= millis_per_unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}
