use anyhow::{anyhow, Result};
use serde_json::Value;
use std::time::Duration;

/// Parse human-readable duration strings.
/// Supports formats like: "1s", "500ms", "2m", "1.5s", "30", "2h".
/// A bare number is read as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();

    if let Ok(ms) = input.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let (number_part, unit_part) = split_number_and_unit(input)?;
    let value: f64 = number_part
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", number_part))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("Duration must be a non-negative number: {}", input));
    }

    let multiplier = match unit_part.trim() {
        "ms" | "milliseconds" | "millisecond" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "" => 1.0,
        other => return Err(anyhow!("Unknown time unit: {}", other)),
    };

    Ok(Duration::from_millis((value * multiplier) as u64))
}

fn split_number_and_unit(input: &str) -> Result<(&str, &str)> {
    let split_pos = input
        .char_indices()
        .find(|(_, ch)| ch.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(input.len());

    let number_part = &input[..split_pos];
    let unit_part = &input[split_pos..];

    if number_part.trim().is_empty() {
        return Err(anyhow!("No numeric value in duration: {}", input));
    }

    Ok((number_part, unit_part))
}

/// Read a duration from a script value: numbers are milliseconds, strings are parsed.
pub fn duration_from_value(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| Duration::from_millis(f as u64))
            }),
        Value::String(s) => parse_duration(s).ok(),
        _ => None,
    }
}

/// Serde adapter: serializes a `Duration` as milliseconds and accepts either
/// milliseconds or a human-readable string when deserializing.
pub mod as_millis {
    use super::parse_duration;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Float(ms) if ms.is_finite() && ms >= 0.0 => Ok(Duration::from_millis(ms as u64)),
            Raw::Float(ms) => Err(de::Error::custom(format!("invalid duration: {ms}"))),
            Raw::Text(text) => parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
