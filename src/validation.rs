//! Request validation
//!
//! Validated newtypes for user-supplied fields. Fields are private so that
//! values can only be obtained through the checking constructors.

use std::fmt;

use crate::currency::Currency;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("source and destination account are the same: {0}")]
    SameAccount(i64),

    #[error("account {account_id} currency mismatch: {actual} vs {expected}")]
    CurrencyMismatch {
        account_id: i64,
        expected: Currency,
        actual: Currency,
    },

    #[error("{0} is required")]
    Required(&'static str),

    #[error("invalid length for {field}: expected {min}-{max}, got {actual}")]
    InvalidLength {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("invalid format for {field}: '{value}' (expected: {expected})")]
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

fn check_length(field: &'static str, value: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual < min || actual > max {
        return Err(ValidationError::InvalidLength {
            field,
            min,
            max,
            actual,
        });
    }
    Ok(())
}

/// Transfer amounts are strictly positive minor units.
pub fn validate_amount(amount: i64) -> Result<i64, ValidationError> {
    if amount <= 0 {
        return Err(ValidationError::InvalidAmount(amount));
    }
    Ok(amount)
}

/// Validated username
///
/// # Validation Rules
/// - Length: 3-100 characters
/// - Lowercase letters, digits and underscore only
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        check_length("username", value, 3, 100)?;

        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "username",
                value: value.to_string(),
                expected: "lowercase letters, digits, underscore only",
            });
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated full name: letters and spaces, 3-100 characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullName(String);

impl FullName {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        check_length("full_name", value, 3, 100)?;

        if !value.chars().all(|c| c.is_alphabetic() || c == ' ') {
            return Err(ValidationError::InvalidFormat {
                field: "full_name",
                value: value.to_string(),
                expected: "letters or spaces only",
            });
        }

        Ok(Self(value.to_string()))
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Validated email address.
///
/// Only the shape is checked (`local@domain.tld`); deliverability is the
/// verification email's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email(String);

impl Email {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        check_length("email", value, 3, 200)?;

        let invalid = || ValidationError::InvalidFormat {
            field: "email",
            value: value.to_string(),
            expected: "local@domain",
        };

        let (local, domain) = value.split_once('@').ok_or_else(invalid)?;
        if local.is_empty()
            || domain.contains('@')
            || !domain.contains('.')
            || domain.starts_with('.')
            || domain.ends_with('.')
            || value.chars().any(char::is_whitespace)
        {
            return Err(invalid());
        }

        Ok(Self(value.to_string()))
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount() {
        assert_eq!(validate_amount(30), Ok(30));
        assert_eq!(validate_amount(0), Err(ValidationError::InvalidAmount(0)));
        assert_eq!(validate_amount(-5), Err(ValidationError::InvalidAmount(-5)));
    }

    #[test]
    fn test_username_valid() {
        assert_eq!(Username::new("alice_01").unwrap().as_str(), "alice_01");
    }

    #[test]
    fn test_username_invalid() {
        assert!(matches!(
            Username::new("al"),
            Err(ValidationError::InvalidLength { field: "username", .. })
        ));
        assert!(matches!(
            Username::new("Alice"),
            Err(ValidationError::InvalidFormat { field: "username", .. })
        ));
        assert!(Username::new("bob smith").is_err());
    }

    #[test]
    fn test_full_name() {
        assert!(FullName::new("Alice Liddell").is_ok());
        assert!(FullName::new("R2D2").is_err());
        assert!(FullName::new("  ").is_err());
    }

    #[test]
    fn test_email() {
        assert!(Email::new("alice@example.com").is_ok());
        assert!(Email::new("alice.example.com").is_err());
        assert!(Email::new("@example.com").is_err());
        assert!(Email::new("alice@example").is_err());
        assert!(Email::new("alice@@example.com").is_err());
        assert!(Email::new("al ice@example.com").is_err());
    }

    #[test]
    fn test_display_messages() {
        let err = ValidationError::InvalidAmount(-5);
        assert_eq!(err.to_string(), "amount must be greater than zero, got -5");
    }
}
