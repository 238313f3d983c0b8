//! Small helpers shared across modules.

/// Minimum credential length before it's worth showing a partial value.
const MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY: usize = 8;

/// Characters shown at the start/end of a masked credential.
const KEY_MASK_VISIBLE_CHARS: usize = 4;

/// Substrings that mark an error message as unsafe to show verbatim.
const SENSITIVE_PATTERNS: &[&str] = &[
    "api_key",
    "api-key",
    "apikey",
    "authorization",
    "bearer",
    "token",
    "secret",
    "password",
    "credential",
];

/// Mask a credential for safe display in logs and `Debug` output.
///
/// Shows the first and last 4 characters for credentials longer than 8
/// characters; otherwise returns `"****"`.
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.len() <= MIN_KEY_LENGTH_FOR_PARTIAL_DISPLAY {
        return "****".to_string();
    }
    format!(
        "{}...{}",
        &key[..KEY_MASK_VISIBLE_CHARS],
        &key[key.len() - KEY_MASK_VISIBLE_CHARS..]
    )
}

/// Strip likely-sensitive content from an error message before it reaches a
/// user-facing surface. Returns a generic message if any sensitive pattern
/// is present, otherwise returns the message unchanged.
#[must_use]
pub fn sanitize_error_for_user(error: &str) -> String {
    let lower = error.to_lowercase();
    for pattern in SENSITIVE_PATTERNS {
        if lower.contains(pattern) {
            return "An API error occurred. Please try again.".to_string();
        }
    }
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_long_key_shows_partial() {
        let masked = mask_api_key("sk-1234567890abcdefghij");
        assert_eq!(masked, "sk-1...ghij");
        assert!(!masked.contains("567890"));
    }

    #[test]
    fn mask_short_key_is_fully_hidden() {
        assert_eq!(mask_api_key("short"), "****");
        assert_eq!(mask_api_key(""), "****");
    }

    #[test]
    fn sanitize_hides_sensitive_substrings() {
        assert_eq!(
            sanitize_error_for_user("invalid api_key provided"),
            "An API error occurred. Please try again."
        );
        assert_eq!(
            sanitize_error_for_user("bearer token expired"),
            "An API error occurred. Please try again."
        );
    }

    #[test]
    fn sanitize_passes_through_safe_messages() {
        assert_eq!(
            sanitize_error_for_user("connection timeout after 30s"),
            "connection timeout after 30s"
        );
    }
}
