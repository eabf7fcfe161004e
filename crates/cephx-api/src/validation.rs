//! Input checks applied before any command is issued.

use crate::error::{ApiError, ApiResult};

const MAX_NAME_LEN: usize = 64;
const MAX_PATH_LEN: usize = 4096;

/// Filesystem, client and similar identifiers: 1-64 chars of `[A-Za-z0-9_-]`.
pub fn identifier(field: &str, value: &str) -> ApiResult<()> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(ApiError::validation(format!(
            "{} must be between 1 and {} characters",
            field, MAX_NAME_LEN
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::validation(format!(
            "{} may only contain letters, digits, '_' and '-'",
            field
        )));
    }
    Ok(())
}

pub fn in_range(field: &str, value: u64, min: u64, max: u64) -> ApiResult<()> {
    if value < min || value > max {
        return Err(ApiError::validation(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )));
    }
    Ok(())
}

/// Upper bound for a schedule period of the given unit.
fn schedule_max(unit: char) -> Option<u64> {
    match unit {
        'h' => Some(8760),
        'd' => Some(3650),
        'w' => Some(520),
        'M' => Some(1200),
        'y' => Some(100),
        _ => None,
    }
}

/// `<positive integer><unit>`, unit one of `h d w M y` (case-sensitive).
pub fn schedule(value: &str) -> ApiResult<()> {
    let invalid = || {
        ApiError::validation(format!(
            "Invalid schedule '{}'. Expected <number><unit> with unit h, d, w, M or y (e.g. 1h, 1d, 1M)",
            value
        ))
    };

    let unit = value.chars().last().ok_or_else(invalid)?;
    let max = schedule_max(unit).ok_or_else(invalid)?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let number: u64 = digits.parse().map_err(|_| invalid())?;
    if number == 0 {
        return Err(ApiError::validation("Schedule number must be positive"));
    }
    if number > max {
        return Err(ApiError::validation(format!(
            "Schedule number too large for unit {}. Maximum is {}",
            unit, max
        )));
    }
    Ok(())
}

/// Absolute CephFS path without trailing or doubled slashes.
pub fn fs_path(value: &str) -> ApiResult<()> {
    if value.is_empty() || value.len() > MAX_PATH_LEN {
        return Err(ApiError::validation(format!(
            "Path must be between 1 and {} bytes",
            MAX_PATH_LEN
        )));
    }
    if !value.starts_with('/') {
        return Err(ApiError::validation("Path must start with /"));
    }
    if value != "/" && value.ends_with('/') {
        return Err(ApiError::validation(
            "Path must not end with / (except for root)",
        ));
    }
    if value.contains("//") {
        return Err(ApiError::validation("Path must not contain double slashes"));
    }
    if value.chars().any(char::is_control) {
        return Err(ApiError::validation("Path contains invalid characters"));
    }
    Ok(())
}

/// `HH:MM:SS`, 24-hour clock.
pub fn start_time(value: &str) -> ApiResult<()> {
    let parts: Vec<&str> = value.split(':').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_digit()))
        && parts[0] < "24"
        && parts[1] < "60"
        && parts[2] < "60";
    if !valid {
        return Err(ApiError::validation(format!(
            "start_time '{}' must be HH:MM:SS (24-hour)",
            value
        )));
    }
    Ok(())
}
