//! Password policy domain model

use crate::domain::attrs::AttrMap;
use serde::{Deserialize, Serialize};

// Per-domain policy attributes; absent attributes fall back to defaults.
const A_PASSWORD_MIN_LENGTH: &str = "provisPasswordMinLength";
const A_PASSWORD_MAX_LENGTH: &str = "provisPasswordMaxLength";
const A_PASSWORD_MIN_UPPER: &str = "provisPasswordMinUpperCaseChars";
const A_PASSWORD_MIN_LOWER: &str = "provisPasswordMinLowerCaseChars";
const A_PASSWORD_MIN_NUMERIC: &str = "provisPasswordMinNumericChars";
const A_PASSWORD_MIN_PUNCTUATION: &str = "provisPasswordMinPunctuationChars";
const A_PASSWORD_MIN_ALPHA: &str = "provisPasswordMinAlphaChars";
const A_PASSWORD_ALLOWED_CHARS: &str = "provisPasswordAllowedChars";
const A_PASSWORD_MIN_AGE: &str = "provisPasswordMinAge";
const A_PASSWORD_MAX_AGE: &str = "provisPasswordMaxAge";
const A_PASSWORD_HISTORY: &str = "provisPasswordEnforceHistory";
const A_LOCKOUT_ENABLED: &str = "provisPasswordLockoutEnabled";
const A_LOCKOUT_MAX_FAILURES: &str = "provisPasswordLockoutMaxFailures";
const A_LOCKOUT_DURATION_MINS: &str = "provisPasswordLockoutDuration";
const A_LOCKOUT_FAILURE_WINDOW_MINS: &str = "provisPasswordLockoutFailureLifetime";

/// Password policy configuration for a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PasswordPolicy {
    /// Minimum password length (default: 8)
    #[serde(default = "default_min_length")]
    pub min_length: u32,
    /// Maximum password length (default: 64)
    #[serde(default = "default_max_length")]
    pub max_length: u32,
    /// Minimum count of uppercase letters
    #[serde(default)]
    pub min_upper_case: u32,
    /// Minimum count of lowercase letters
    #[serde(default)]
    pub min_lower_case: u32,
    /// Minimum count of numeric characters
    #[serde(default)]
    pub min_numeric: u32,
    /// Minimum count of punctuation characters
    #[serde(default)]
    pub min_punctuation: u32,
    /// Minimum count of alphabetic characters
    #[serde(default)]
    pub min_alpha: u32,
    /// Regular expression every character must match (None = any)
    #[serde(default)]
    pub allowed_chars: Option<String>,
    /// Minimum age in days before a password may be changed again (0 = off)
    #[serde(default)]
    pub min_age_days: u32,
    /// Maximum password age in days (0 = no expiry)
    #[serde(default)]
    pub max_age_days: u32,
    /// Number of previous password hashes to refuse (0 = disabled)
    #[serde(default)]
    pub history_count: u32,
    /// Whether failed-login lockout is enforced
    #[serde(default)]
    pub lockout_enabled: bool,
    /// Number of consecutive failures before lockout (0 = disabled)
    #[serde(default)]
    pub lockout_threshold: u32,
    /// How long a lockout lasts (0 = until an admin clears it)
    #[serde(default = "default_lockout_duration")]
    pub lockout_duration_mins: u32,
    /// Window within which failures are counted as consecutive
    #[serde(default = "default_failure_window")]
    pub lockout_failure_window_mins: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 64,
            min_upper_case: 0,
            min_lower_case: 0,
            min_numeric: 0,
            min_punctuation: 0,
            min_alpha: 0,
            allowed_chars: None,
            min_age_days: 0,
            max_age_days: 0,
            history_count: 0,
            lockout_enabled: false,
            lockout_threshold: 0,
            lockout_duration_mins: 15,
            lockout_failure_window_mins: 60,
        }
    }
}

fn default_min_length() -> u32 {
    8
}

fn default_max_length() -> u32 {
    64
}

fn default_lockout_duration() -> u32 {
    15
}

fn default_failure_window() -> u32 {
    60
}

impl PasswordPolicy {
    /// Build a policy from a domain's (or the global entry's) attributes
    pub fn from_attrs(attrs: &AttrMap) -> Self {
        let defaults = PasswordPolicy::default();
        let u32_attr = |name: &str, fallback: u32| {
            attrs
                .get_i64(name)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(fallback)
        };

        Self {
            min_length: u32_attr(A_PASSWORD_MIN_LENGTH, defaults.min_length),
            max_length: u32_attr(A_PASSWORD_MAX_LENGTH, defaults.max_length),
            min_upper_case: u32_attr(A_PASSWORD_MIN_UPPER, 0),
            min_lower_case: u32_attr(A_PASSWORD_MIN_LOWER, 0),
            min_numeric: u32_attr(A_PASSWORD_MIN_NUMERIC, 0),
            min_punctuation: u32_attr(A_PASSWORD_MIN_PUNCTUATION, 0),
            min_alpha: u32_attr(A_PASSWORD_MIN_ALPHA, 0),
            allowed_chars: attrs.get(A_PASSWORD_ALLOWED_CHARS).map(|s| s.to_string()),
            min_age_days: u32_attr(A_PASSWORD_MIN_AGE, 0),
            max_age_days: u32_attr(A_PASSWORD_MAX_AGE, 0),
            history_count: u32_attr(A_PASSWORD_HISTORY, 0),
            lockout_enabled: attrs.get_bool(A_LOCKOUT_ENABLED).unwrap_or(false),
            lockout_threshold: u32_attr(A_LOCKOUT_MAX_FAILURES, 0),
            lockout_duration_mins: u32_attr(A_LOCKOUT_DURATION_MINS, defaults.lockout_duration_mins),
            lockout_failure_window_mins: u32_attr(
                A_LOCKOUT_FAILURE_WINDOW_MINS,
                defaults.lockout_failure_window_mins,
            ),
        }
    }

    /// Validate a password's strength against this policy.
    ///
    /// Returns every violated rule, each with a distinct message, so a
    /// caller can tell a length failure from a character-class failure.
    pub fn validate_password(&self, password: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let chars: Vec<char> = password.chars().collect();

        if (chars.len() as u32) < self.min_length {
            errors.push(format!(
                "Password must be at least {} characters",
                self.min_length
            ));
        }

        if self.max_length > 0 && (chars.len() as u32) > self.max_length {
            errors.push(format!(
                "Password must be at most {} characters",
                self.max_length
            ));
        }

        let count = |pred: fn(&char) -> bool| chars.iter().filter(|c| pred(c)).count() as u32;

        if count(|c| c.is_uppercase()) < self.min_upper_case {
            errors.push(format!(
                "Password must contain at least {} uppercase letters",
                self.min_upper_case
            ));
        }

        if count(|c| c.is_lowercase()) < self.min_lower_case {
            errors.push(format!(
                "Password must contain at least {} lowercase letters",
                self.min_lower_case
            ));
        }

        if count(|c| c.is_ascii_digit()) < self.min_numeric {
            errors.push(format!(
                "Password must contain at least {} numeric characters",
                self.min_numeric
            ));
        }

        if count(|c| c.is_ascii_punctuation()) < self.min_punctuation {
            errors.push(format!(
                "Password must contain at least {} punctuation characters",
                self.min_punctuation
            ));
        }

        if count(|c| c.is_alphabetic()) < self.min_alpha {
            errors.push(format!(
                "Password must contain at least {} letters",
                self.min_alpha
            ));
        }

        if let Some(pattern) = &self.allowed_chars {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if chars.iter().any(|c| !re.is_match(&c.to_string())) {
                        errors.push(format!(
                            "Password contains characters outside the allowed set {pattern}"
                        ));
                    }
                }
                Err(_) => {
                    errors.push(format!("Invalid allowed-characters pattern: {pattern}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attrs::AttrMap;

    #[test]
    fn test_policy_defaults() {
        let policy = PasswordPolicy::default();
        assert_eq!(policy.min_length, 8);
        assert_eq!(policy.max_length, 64);
        assert_eq!(policy.history_count, 0);
        assert!(!policy.lockout_enabled);
        assert_eq!(policy.lockout_duration_mins, 15);
    }

    #[test]
    fn test_min_length_rule_names_length() {
        let policy = PasswordPolicy::default();
        let errors = policy.validate_password("short").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("at least 8 characters"));
    }

    #[test]
    fn test_character_class_counts() {
        let policy = PasswordPolicy {
            min_length: 4,
            min_upper_case: 2,
            min_numeric: 2,
            min_punctuation: 1,
            ..Default::default()
        };

        assert!(policy.validate_password("ABcd12!").is_ok());

        let errors = policy.validate_password("Abcd1!").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("uppercase")));
        assert!(errors.iter().any(|e| e.contains("numeric")));
    }

    #[test]
    fn test_allowed_chars_pattern() {
        let policy = PasswordPolicy {
            allowed_chars: Some("[A-Za-z0-9]".to_string()),
            ..Default::default()
        };

        assert!(policy.validate_password("OnlyAlnum123").is_ok());
        let errors = policy.validate_password("HasSpace 123").unwrap_err();
        assert!(errors[0].contains("allowed set"));
    }

    #[test]
    fn test_max_length_rule() {
        let policy = PasswordPolicy {
            min_length: 1,
            max_length: 10,
            ..Default::default()
        };
        assert!(policy.validate_password("0123456789x").is_err());
        assert!(policy.validate_password("0123456789").is_ok());
    }

    #[test]
    fn test_from_attrs_reads_domain_policy() {
        let mut attrs = AttrMap::new();
        attrs.set(A_PASSWORD_MIN_LENGTH, "12");
        attrs.set(A_PASSWORD_HISTORY, "4");
        attrs.set(A_LOCKOUT_ENABLED, "TRUE");
        attrs.set(A_LOCKOUT_MAX_FAILURES, "3");

        let policy = PasswordPolicy::from_attrs(&attrs);
        assert_eq!(policy.min_length, 12);
        assert_eq!(policy.history_count, 4);
        assert!(policy.lockout_enabled);
        assert_eq!(policy.lockout_threshold, 3);
        // unset attributes keep defaults
        assert_eq!(policy.max_length, 64);
    }
}
