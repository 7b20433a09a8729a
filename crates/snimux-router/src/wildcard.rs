//! Wildcard domain patterns
//!
//! Only single-level wildcards at the leftmost position are supported (e.g., `*.example.com`).
//!
//! # Supported patterns
//! - `*.example.com` - matches `api.example.com`, `web.example.com`
//! - `*.cdn.example.com` - matches `x.cdn.example.com`
//!
//! # Rejected patterns
//! - `**.example.com` - double asterisk
//! - `api.*.example.com` - mid-level wildcard
//! - `example.*` - right-side wildcard
//! - `*` - bare asterisk
//! - `*.com` - wildcard over a bare TLD

use thiserror::Error;

use crate::table::normalize_hostname;

/// Errors that can occur while parsing a wildcard pattern
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WildcardError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Bare asterisk (*) is not a valid pattern")]
    BareAsterisk,

    #[error("Double asterisk patterns (**.domain) are not supported")]
    DoubleAsterisk,

    #[error("Mid-level wildcards (api.*.domain) are not supported")]
    MidLevelWildcard,

    #[error("Right-side wildcards (domain.*) are not supported")]
    RightSideWildcard,

    #[error("Pattern must have at least two domain labels after the wildcard")]
    InsufficientDomainParts,

    #[error("Invalid base domain: {0}")]
    InvalidBaseDomain(String),
}

/// A validated `*.base.tld` pattern, stored lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WildcardPattern {
    base_domain: String,
}

impl WildcardPattern {
    /// Parse and validate a wildcard pattern string
    ///
    /// # Examples
    /// ```
    /// use snimux_router::wildcard::WildcardPattern;
    ///
    /// let pattern = WildcardPattern::parse("*.CDN.example.com").unwrap();
    /// assert_eq!(pattern.base_domain(), "cdn.example.com");
    /// assert!(pattern.matches("x.cdn.example.com"));
    /// assert!(!pattern.matches("cdn.example.com"));
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, WildcardError> {
        match pattern {
            "" => return Err(WildcardError::EmptyPattern),
            "*" => return Err(WildcardError::BareAsterisk),
            _ => {}
        }

        if pattern.contains("**") {
            return Err(WildcardError::DoubleAsterisk);
        }

        let Some(base) = pattern.strip_prefix("*.") else {
            if pattern.ends_with(".*") {
                return Err(WildcardError::RightSideWildcard);
            }
            return Err(WildcardError::MidLevelWildcard);
        };

        if base.contains('*') {
            return Err(WildcardError::MidLevelWildcard);
        }

        let base_domain = normalize_hostname(base)
            .ok_or_else(|| WildcardError::InvalidBaseDomain(base.to_string()))?;

        if !base_domain.contains('.') {
            return Err(WildcardError::InsufficientDomainParts);
        }

        Ok(Self { base_domain })
    }

    /// Check if a normalized hostname matches this pattern
    ///
    /// Only the immediate parent is considered: `*.example.com` matches
    /// `api.example.com` but not `sub.api.example.com` or `example.com`.
    pub fn matches(&self, hostname: &str) -> bool {
        parent_domain(hostname) == Some(self.base_domain.as_str())
    }

    /// The domain the wildcard hangs off (e.g., `example.com`)
    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Check if a pattern string is written in wildcard form
    pub fn is_wildcard_pattern(pattern: &str) -> bool {
        pattern.starts_with('*')
    }
}

impl std::fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "*.{}", self.base_domain)
    }
}

/// The immediate parent domain of a hostname, if one can carry a wildcard
///
/// ```
/// use snimux_router::wildcard::parent_domain;
///
/// assert_eq!(parent_domain("api.example.com"), Some("example.com"));
/// assert_eq!(parent_domain("example.com"), None);
/// ```
pub fn parent_domain(hostname: &str) -> Option<&str> {
    let (label, parent) = hostname.split_once('.')?;
    if label.is_empty() || !parent.contains('.') {
        return None;
    }
    Some(parent)
}
