use crate::PassageError;

/// Parses an OpenSSH-style time spec such as `1W2d3h4m5` into seconds.
///
/// Units are `s`, `m`, `h`, `d`, `w` (case-insensitive); a trailing bare
/// number counts as seconds. The result must fit in a u32.
pub fn parse_duration_seconds(text: &str) -> Result<u32, PassageError> {
    if text.is_empty() {
        return Err(bad(text, "empty"));
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut saw_value = false;

    let mut push = |digits: &mut String, unit: u64| -> Result<(), PassageError> {
        if digits.is_empty() {
            return Err(bad(text, "missing number"));
        }
        let value: u64 = digits.parse().map_err(|_| bad(text, "bad number"))?;
        digits.clear();
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| bad(text, "overflow"))?;
        Ok(())
    };

    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            'w' => 604800,
            _ => return Err(bad(text, "unknown unit")),
        };
        push(&mut digits, unit)?;
        saw_value = true;
    }
    if !digits.is_empty() {
        push(&mut digits, 1)?;
        saw_value = true;
    }
    if !saw_value {
        return Err(bad(text, "missing number"));
    }
    u32::try_from(total).map_err(|_| bad(text, "overflow"))
}

fn bad(text: &str, message: &str) -> PassageError {
    PassageError::Config(format!("invalid time value \"{text}\": {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_units() {
        assert_eq!(parse_duration_seconds("1W2d3h4m5").unwrap(), 788645);
        assert_eq!(parse_duration_seconds("90").unwrap(), 90);
        assert_eq!(parse_duration_seconds("2h").unwrap(), 7200);
        assert_eq!(parse_duration_seconds("1w").unwrap(), 604800);
    }

    #[test]
    fn test_overflow() {
        assert!(parse_duration_seconds("4294967296s").is_err());
        assert!(parse_duration_seconds("4294967295s").is_ok());
        assert!(parse_duration_seconds("99999999999w").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_duration_seconds("").is_err());
        assert!(parse_duration_seconds("h").is_err());
        assert!(parse_duration_seconds("5x").is_err());
        assert!(parse_duration_seconds("1h2q").is_err());
    }
}
