//! Structured search filters
//!
//! Filters are built as values and rendered to RFC 4515 strings only at the
//! wire adapter, with metacharacters escaped there. The in-memory store
//! evaluates the same structure directly, so both backends agree on
//! semantics by construction.

use crate::domain::AttrMap;
use std::fmt;

/// A directory search filter
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Attribute equals value (case-insensitive, as directory strings are)
    Eq(String, String),
    /// Attribute is present
    Present(String),
    /// Attribute contains the substring
    Contains(String, String),
    /// Attribute starts with the prefix
    StartsWith(String, String),
    /// Attribute is lexicographically greater than or equal to the value;
    /// used with generalized-time attributes for sync searches
    Ge(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Pre-rendered filter text from external configuration (already
    /// escaped by whoever configured it). Only the wire adapter can
    /// evaluate it; structural matching treats it as matching nothing.
    Raw(String),
}

impl Filter {
    pub fn eq(attr: &str, value: impl Into<String>) -> Self {
        Filter::Eq(attr.to_string(), value.into())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Entries of a given object class
    pub fn object_class(oc: &str) -> Self {
        Filter::eq(crate::domain::names::A_OBJECT_CLASS, oc)
    }

    /// Parse the simple `(attr=value)` shape into a structured equality;
    /// anything else is carried as [`Filter::Raw`]
    pub fn from_template(rendered: &str) -> Self {
        let simple = rendered
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .and_then(|s| s.split_once('='));
        match simple {
            Some((attr, value))
                if !attr.is_empty()
                    && !value.is_empty()
                    && !attr.contains(['(', ')', '&', '|', '!', '='])
                    && !value.contains(['(', ')', '*']) =>
            {
                Filter::eq(attr, value)
            }
            _ => Filter::Raw(rendered.to_string()),
        }
    }

    /// Evaluate against an attribute map. Used by the in-memory store and
    /// by unit tests; the wire adapter lets the server evaluate instead.
    pub fn matches(&self, attrs: &AttrMap) -> bool {
        match self {
            Filter::Eq(attr, value) => attrs.contains_value(attr, value),
            Filter::Present(attr) => attrs.contains_key(attr),
            Filter::Contains(attr, needle) => {
                let needle = needle.to_lowercase();
                attrs
                    .get_all(attr)
                    .iter()
                    .any(|v| v.to_lowercase().contains(&needle))
            }
            Filter::StartsWith(attr, prefix) => {
                let prefix = prefix.to_lowercase();
                attrs
                    .get_all(attr)
                    .iter()
                    .any(|v| v.to_lowercase().starts_with(&prefix))
            }
            Filter::Ge(attr, value) => attrs.get_all(attr).iter().any(|v| v.as_str() >= value.as_str()),
            Filter::And(filters) => filters.iter().all(|f| f.matches(attrs)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attrs)),
            Filter::Not(inner) => !inner.matches(attrs),
            Filter::Raw(_) => false,
        }
    }
}

/// Escape filter metacharacters per RFC 4515
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq(attr, value) => write!(f, "({}={})", attr, escape_value(value)),
            Filter::Present(attr) => write!(f, "({attr}=*)"),
            Filter::Contains(attr, needle) => {
                write!(f, "({}=*{}*)", attr, escape_value(needle))
            }
            Filter::StartsWith(attr, prefix) => {
                write!(f, "({}={}*)", attr, escape_value(prefix))
            }
            Filter::Ge(attr, value) => write!(f, "({}>={})", attr, escape_value(value)),
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Raw(rendered) => write!(f, "{rendered}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::names;

    #[test]
    fn test_render_escapes_metacharacters() {
        let filter = Filter::eq(names::A_MAIL, "we(ird)*user@example.com");
        assert_eq!(
            filter.to_string(),
            "(mail=we\\28ird\\29\\2auser@example.com)"
        );
    }

    #[test]
    fn test_render_composite() {
        let filter = Filter::and(vec![
            Filter::object_class("provisAccount"),
            Filter::or(vec![
                Filter::eq(names::A_MAIL, "a@x.com"),
                Filter::eq(names::A_MAIL_ALIAS, "a@x.com"),
            ]),
        ]);
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=provisAccount)(|(mail=a@x.com)(provisMailAlias=a@x.com)))"
        );
    }

    #[test]
    fn test_matches_eq_is_case_insensitive() {
        let mut attrs = AttrMap::new();
        attrs.set(names::A_MAIL, "User@Example.Com");
        assert!(Filter::eq(names::A_MAIL, "user@example.com").matches(&attrs));
    }

    #[test]
    fn test_matches_ge_on_generalized_time() {
        let mut attrs = AttrMap::new();
        attrs.set(names::A_MODIFIED_TIMESTAMP, "20240115103000Z");
        assert!(
            Filter::Ge(
                names::A_MODIFIED_TIMESTAMP.to_string(),
                "20240115000000Z".to_string()
            )
            .matches(&attrs)
        );
        assert!(
            !Filter::Ge(
                names::A_MODIFIED_TIMESTAMP.to_string(),
                "20240116000000Z".to_string()
            )
            .matches(&attrs)
        );
    }

    #[test]
    fn test_from_template() {
        assert_eq!(
            Filter::from_template("(sAMAccountName=jane)"),
            Filter::eq("sAMAccountName", "jane")
        );
        assert!(matches!(
            Filter::from_template("(&(objectClass=user)(cn=jane))"),
            Filter::Raw(_)
        ));
    }

    #[test]
    fn test_matches_not_and_contains() {
        let mut attrs = AttrMap::new();
        attrs.set("cn", "Jane Roe");
        assert!(Filter::Contains("cn".to_string(), "roe".to_string()).matches(&attrs));
        assert!(!Filter::Not(Box::new(Filter::Present("cn".to_string()))).matches(&attrs));
    }
}
