//! WAMP URI validation
//!
//! URIs are dot-separated components: `com.myapp.topic1`
//! Each component must be non-empty and may not contain whitespace or `#`.

use crate::error::{Result, WampError};

/// Characters that may never appear inside a URI component
fn is_valid_component_char(c: char) -> bool {
    !c.is_whitespace() && c != '#' && c != '.'
}

fn is_valid_component(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_component_char)
}

/// Check whether `uri` is a syntactically valid WAMP URI
pub fn is_valid_uri(uri: &str) -> bool {
    !uri.is_empty() && uri.split('.').all(is_valid_component)
}

/// Validate a required URI parameter named `name`
pub fn check_uri(name: &'static str, uri: &str) -> Result<()> {
    if is_valid_uri(uri) {
        Ok(())
    } else {
        Err(WampError::InvalidUri {
            name,
            value: uri.to_string(),
        })
    }
}

/// Validate an optional URI parameter; `None` is accepted
pub fn check_optional_uri(name: &'static str, uri: Option<&str>) -> Result<()> {
    match uri {
        Some(uri) => check_uri(name, uri),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_valid() {
        assert!(is_valid_uri("realm1"));
        assert!(is_valid_uri("com.myapp.topic1"));
        assert!(is_valid_uri("wamp.error.not_authorized"));
        assert!(is_valid_uri("com.myapp.user-123"));
        assert!(is_valid_uri("com.MyApp.Topic"));
    }

    #[test]
    fn test_uri_invalid() {
        assert!(!is_valid_uri(""));
        assert!(!is_valid_uri("com..topic"));
        assert!(!is_valid_uri(".com.topic"));
        assert!(!is_valid_uri("com.topic."));
        assert!(!is_valid_uri("com.my topic"));
        assert!(!is_valid_uri("com.topic#1"));
        assert!(!is_valid_uri("com.\ttopic"));
    }

    #[test]
    fn test_check_uri_names_parameter() {
        let err = check_uri("realm", "bad realm").unwrap_err();
        match err {
            WampError::InvalidUri { name, value } => {
                assert_eq!(name, "realm");
                assert_eq!(value, "bad realm");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_optional_uri() {
        assert!(check_optional_uri("reason", None).is_ok());
        assert!(check_optional_uri("reason", Some("wamp.close.normal")).is_ok());
        assert!(check_optional_uri("reason", Some("wamp close")).is_err());
    }
}
