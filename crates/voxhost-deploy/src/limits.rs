//! Parsing of CPU and memory limit strings into runtime units.

use crate::error::DeployError;

/// Parses a CPU count such as `"2"` or `"0.5"` into nano-CPUs.
pub fn parse_cpus(raw: &str) -> Result<i64, DeployError> {
    let cpus: f64 = raw
        .trim()
        .parse()
        .map_err(|_| DeployError::InvalidConfig(format!("invalid cpu limit: {:?}", raw)))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(DeployError::InvalidConfig(format!(
            "cpu limit must be positive: {:?}",
            raw
        )));
    }
    Ok((cpus * 1_000_000_000.0).round() as i64)
}

/// Parses a memory size such as `"512m"`, `"4g"`, `"2GiB"` or a plain byte
/// count into bytes. Suffixes are binary multiples.
pub fn parse_memory(raw: &str) -> Result<i64, DeployError> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let invalid = || DeployError::InvalidConfig(format!("invalid memory limit: {:?}", raw));

    let unit_start = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(unit_start);
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier: f64 = match unit.trim_end_matches("ib").trim_end_matches('b') {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes < 1.0 || bytes > i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as i64)
}
