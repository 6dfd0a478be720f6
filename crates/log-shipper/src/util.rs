// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the configuration layer.

/// Parses and validates a namespace string identifying the producing host/application.
///
/// A valid namespace must:
/// - Start with an ASCII letter
/// - Contain only ASCII alphanumerics, underscores, periods or hyphens
/// - Not be empty or contain only whitespace
///
/// Whitespace is automatically trimmed from the input.
///
/// # Examples
///
/// ```
/// use log_shipper::util::parse_namespace;
///
/// assert_eq!(parse_namespace("web-01"), Some("web-01".to_string()));
/// assert_eq!(parse_namespace("my_app.logs"), Some("my_app.logs".to_string()));
/// assert_eq!(parse_namespace("1invalid"), None);
/// assert_eq!(parse_namespace("my app"), None);
/// ```
pub fn parse_namespace(namespace: &str) -> Option<String> {
    let trimmed = namespace.trim();
    let mut chars = trimmed.chars();

    match chars.next() {
        Some(first_char) if first_char.is_ascii_alphabetic() => {}
        Some(_) => {
            tracing::error!("Namespace must start with a letter, got: '{}'", trimmed);
            return None;
        }
        None => return None,
    }

    if let Some(invalid_char) =
        chars.find(|&ch| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.' && ch != '-')
    {
        tracing::error!(
            "Namespace contains invalid character '{}' in '{}'. Only ASCII alphanumerics, underscores, periods and hyphens are allowed.",
            invalid_char, trimmed
        );
        return None;
    }

    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespace_valid() {
        assert_eq!(parse_namespace("anonymous"), Some("anonymous".to_string()));
        assert_eq!(parse_namespace("my_app"), Some("my_app".to_string()));
        assert_eq!(parse_namespace("my.app"), Some("my.app".to_string()));
        assert_eq!(parse_namespace("host-42"), Some("host-42".to_string()));
    }

    #[test]
    fn test_parse_namespace_with_whitespace() {
        assert_eq!(parse_namespace("  myapp  "), Some("myapp".to_string()));
        assert_eq!(parse_namespace("\tmyapp\n"), Some("myapp".to_string()));
    }

    #[test]
    fn test_parse_namespace_empty() {
        assert_eq!(parse_namespace(""), None);
        assert_eq!(parse_namespace("   "), None);
    }

    #[test]
    fn test_parse_namespace_invalid() {
        assert_eq!(parse_namespace("1myapp"), None);
        assert_eq!(parse_namespace("_myapp"), None);
        assert_eq!(parse_namespace("my app"), None);
        assert_eq!(parse_namespace("my@app"), None);
        assert_eq!(parse_namespace("my/app"), None);
    }
}
