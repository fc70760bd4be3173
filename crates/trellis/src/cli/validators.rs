//! CLI input validation functions.
//!
//! Used by clap's `value_parser` attribute so invalid input is rejected at
//! parse time. Each delegates to the domain rule it mirrors.

/// Validate a task ID prefix; returns the trimmed prefix.
pub fn validate_prefix(s: &str) -> Result<String, String> {
    let trimmed = s.trim();
    crate::config::validate_prefix(trimmed).map_err(|e| e.to_string())?;
    Ok(trimmed.to_string())
}

/// Validate a task or job identifier: non-empty, no whitespace.
pub fn validate_id(s: &str) -> Result<String, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("ID cannot be empty".to_string());
    }
    if s.chars().any(char::is_whitespace) {
        return Err(format!("ID cannot contain whitespace: '{s}'"));
    }
    Ok(s.to_string())
}

/// Validate a task title; returns the trimmed title.
pub fn validate_title(s: &str) -> Result<String, String> {
    let s = s.trim();
    crate::domain::validate_title(s)?;

    if s.contains('\n') || s.contains('\r') {
        return Err("Title cannot contain newline characters".to_string());
    }

    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("t-1")]
    #[case::padded("  t-1  ")]
    fn test_validate_id_valid(#[case] input: &str) {
        assert_eq!(validate_id(input).unwrap(), "t-1");
    }

    #[rstest]
    #[case::empty("")]
    #[case::inner_space("t 1")]
    fn test_validate_id_invalid(#[case] input: &str) {
        assert!(validate_id(input).is_err());
    }

    #[test]
    fn test_validate_title() {
        assert_eq!(validate_title(" Ship it ").unwrap(), "Ship it");
        assert!(validate_title("   ").is_err());
        assert!(validate_title("a\nb").is_err());
        assert!(validate_title(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_validate_prefix_trims() {
        assert_eq!(validate_prefix(" proj ").unwrap(), "proj");
        assert!(validate_prefix("p").is_err());
    }
}
