//! Naming rules for domains, sources, event types and consumers
//!
//! Every event type and source leaving the process is qualified with the
//! configured domain. Types are dot separated (`com.acme.user.created.v1`),
//! sources are colon separated (`com:acme:user:backend`).

use crate::error::{Result, TransitError};
use regex::Regex;
use std::sync::OnceLock;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:\.|:)[a-z0-9]+)*$").expect("static name pattern")
    })
}

fn type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:\.[a-z0-9]+)*$").expect("static type pattern"))
}

/// Convert a dot separated name into a colon separated one
pub fn dot_to_colon(name: &str) -> String {
    name.replace('.', ":")
}

/// Convert a dot separated name into an underscore separated one, as used
/// in consumer names
pub fn dot_to_underscore(name: &str) -> String {
    name.replace('.', "_")
}

/// Convert a colon separated source into an underscore separated one
pub fn colon_to_underscore(name: &str) -> String {
    name.replace(':', "_")
}

/// Validate the configured `domain`
pub fn validate_domain_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(TransitError::Configuration(format!(
            "You must configure the `domain`. It must be lowercase, alphanumeric and \
             dot/colon separated, got '{}'",
            name
        )))
    }
}

/// Validate the configured `source_root`
pub fn validate_source_root(name: &str) -> Result<()> {
    validate_source_name(name).map_err(|e| match e {
        TransitError::Validation(reason) => TransitError::Configuration(format!(
            "You must configure the `source_root`. {}",
            reason
        )),
        other => other,
    })
}

/// Validate an event `source` supplied at runtime
pub fn validate_source_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(TransitError::Validation(format!(
            "Event source must be lowercase, alphanumeric and dot/colon separated, got '{}'",
            name
        )))
    }
}

/// Validate an event type (dots only, colons are forbidden)
pub fn validate_event_type(name: &str) -> Result<()> {
    if type_pattern().is_match(name) {
        Ok(())
    } else {
        Err(TransitError::Validation(format!(
            "Event types must be lowercase, alphanumeric and dot separated, got '{}'",
            name
        )))
    }
}

/// Check whether `subject` matches a subscription `pattern`
///
/// `*` matches exactly one token, a trailing `>` matches one or more
/// remaining tokens, anything else must match literally.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    for (i, token) in pattern_tokens.iter().enumerate() {
        let is_last = i == pattern_tokens.len() - 1;
        if *token == ">" && is_last {
            return subject_tokens.len() > i;
        }

        match subject_tokens.get(i) {
            Some(s) if *token == "*" => {
                if s.is_empty() {
                    return false;
                }
            }
            Some(s) if s == token => {}
            _ => return false,
        }
    }

    subject_tokens.len() == pattern_tokens.len()
}

/// Validated naming context: the organisation domain and this process's
/// source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    domain: String,
    source_root: String,
}

impl Naming {
    /// Build a naming context, rejecting invalid `domain` / `source_root`
    pub fn new(domain: impl Into<String>, source_root: impl Into<String>) -> Result<Self> {
        let domain = domain.into();
        let source_root = source_root.into();
        validate_domain_name(&domain)?;
        validate_source_root(&source_root)?;
        Ok(Self {
            domain,
            source_root,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn source_root(&self) -> &str {
        &self.source_root
    }

    /// Remove the domain (dotted or colon form) from the front of a name
    pub fn trim_domain_prefix<'a>(&self, name: &'a str) -> &'a str {
        let dotted = format!("{}.", self.domain);
        if let Some(rest) = name.strip_prefix(dotted.as_str()) {
            return rest;
        }
        let colon = format!("{}:", dot_to_colon(&self.domain));
        name.strip_prefix(colon.as_str()).unwrap_or(name)
    }

    /// Domain-qualified event type, e.g. `calc.mult.v1` → `com.test.calc.mult.v1`
    pub fn full_type(&self, event_type: &str) -> Result<String> {
        validate_event_type(event_type)?;
        Ok(format!("{}.{}", self.domain, self.trim_domain_prefix(event_type)))
    }

    /// Domain- and root-qualified source in colon form
    ///
    /// An explicit `source` is appended after the root; if it already carries
    /// the domain/root prefix that prefix is not repeated.
    pub fn full_source(&self, source: Option<&str>) -> Result<String> {
        let root = format!(
            "{}:{}",
            dot_to_colon(&self.domain),
            dot_to_colon(&self.source_root)
        );

        let Some(source) = source else {
            return Ok(root);
        };

        validate_source_name(source)?;
        let source = dot_to_colon(source);
        let rest = match source.strip_prefix(root.as_str()) {
            Some(rest) => rest.trim_start_matches(':'),
            None => source.as_str(),
        };

        if rest.is_empty() {
            Ok(root)
        } else {
            Ok(format!("{}:{}", root, rest))
        }
    }

    /// Deterministic durable consumer name for an event type
    ///
    /// `<source_root>_<source?>_<type>` with dots and colons replaced by
    /// underscores and the domain trimmed from the type.
    pub fn consumer_name(&self, event_type: &str, source: Option<&str>) -> Result<String> {
        validate_event_type(event_type)?;
        let event_type = dot_to_underscore(self.trim_domain_prefix(event_type));
        let root = colon_to_underscore(&dot_to_underscore(&self.source_root));

        match source {
            Some(source) => {
                validate_source_name(source)?;
                let source = colon_to_underscore(&dot_to_underscore(source));
                Ok([root, source, event_type].join("_"))
            }
            None => Ok([root, event_type].join("_")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> Naming {
        Naming::new("com.test", "user.backend").unwrap()
    }

    #[test]
    fn test_dot_and_colon_conversion() {
        assert_eq!(
            dot_to_colon("com.acme.user.created.v1.schema.v1"),
            "com:acme:user:created:v1:schema:v1"
        );
        assert_eq!(dot_to_underscore("foo.bar.baz"), "foo_bar_baz");
        assert_eq!(colon_to_underscore("foo:bar:baz"), "foo_bar_baz");
    }

    #[test]
    fn test_validate_domain_name() {
        for ok in ["com.test", "com.test.foo", "com:test"] {
            assert!(validate_domain_name(ok).is_ok(), "{} should pass", ok);
        }

        for bad in [
            "com test",
            "user\tcreated",
            "user\n\rcreated",
            "user:*%[]<>$!@#-_created",
            ".user",
            "user.",
            ":user",
            "user:",
            "",
            "Com.Test",
        ] {
            let err = validate_domain_name(bad).unwrap_err();
            assert!(
                matches!(err, TransitError::Configuration(_)),
                "{:?} should be a configuration error",
                bad
            );
        }
    }

    #[test]
    fn test_validate_source_root_is_configuration_error() {
        assert!(validate_source_root("user.backend").is_ok());
        assert!(matches!(
            validate_source_root("user backend"),
            Err(TransitError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_source_name_is_validation_error() {
        assert!(validate_source_name("orders:api").is_ok());
        assert!(matches!(
            validate_source_name("orders api"),
            Err(TransitError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_event_type_forbids_colons() {
        assert!(validate_event_type("user.created.v1").is_ok());
        assert!(validate_event_type("user:created").is_err());
        assert!(validate_event_type("user.created.").is_err());
        assert!(validate_event_type("User.created").is_err());
    }

    #[test]
    fn test_full_type_and_trim_are_inverse() {
        let n = naming();
        for t in ["calc.mult.v1", "user.created.v1", "a"] {
            let full = n.full_type(t).unwrap();
            assert_eq!(n.trim_domain_prefix(&full), t);
        }
        assert_eq!(n.full_type("calc.mult.v1").unwrap(), "com.test.calc.mult.v1");
        // Already qualified input is not double-prefixed
        assert_eq!(
            n.full_type("com.test.calc.mult.v1").unwrap(),
            "com.test.calc.mult.v1"
        );
    }

    #[test]
    fn test_trim_domain_prefix_colon_form() {
        let n = naming();
        assert_eq!(n.trim_domain_prefix("com:test:user:backend"), "user:backend");
        assert_eq!(n.trim_domain_prefix("other.type"), "other.type");
    }

    #[test]
    fn test_full_source() {
        let n = naming();
        assert_eq!(n.full_source(None).unwrap(), "com:test:user:backend");
        assert_eq!(
            n.full_source(Some("orders")).unwrap(),
            "com:test:user:backend:orders"
        );
        assert_eq!(
            n.full_source(Some("orders.api")).unwrap(),
            "com:test:user:backend:orders:api"
        );
        assert_eq!(
            n.full_source(Some("com:test:user:backend:orders")).unwrap(),
            "com:test:user:backend:orders"
        );
        assert!(n.full_source(Some("bad source")).is_err());
    }

    #[test]
    fn test_consumer_name() {
        let n = naming();
        assert_eq!(
            n.consumer_name("foo.bar.v1", None).unwrap(),
            "user_backend_foo_bar_v1"
        );
        assert_eq!(
            n.consumer_name("com.test.foo.bar.v1", None).unwrap(),
            "user_backend_foo_bar_v1"
        );
        assert_eq!(
            n.consumer_name("foo.bar.v1", Some("my.app:worker")).unwrap(),
            "user_backend_my_app_worker_foo_bar_v1"
        );
        assert!(n.consumer_name("foo bar", None).is_err());
    }

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("foo.bar.baz", "foo.*.baz"));
        assert!(!subject_matches("foo.bar", "foo.*.*"));
        assert!(subject_matches("foo.bar.baz.qux", "foo.>"));
        assert!(subject_matches("foo.bar", "foo.>"));
        assert!(!subject_matches("foo", "foo.>"));
        assert!(subject_matches("foo.bar", "foo.bar"));
        assert!(!subject_matches("foo.bar.baz", "foo.bar"));
        assert!(!subject_matches("foo.baz", "foo.bar"));
        assert!(!subject_matches("foo.bar.baz", "foo.>.baz"));
    }

    #[test]
    fn test_naming_rejects_bad_config() {
        assert!(matches!(
            Naming::new("com test", "user.backend"),
            Err(TransitError::Configuration(_))
        ));
        assert!(matches!(
            Naming::new("com.test", "user backend"),
            Err(TransitError::Configuration(_))
        ));
    }
}
