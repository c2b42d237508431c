use serde::{Deserialize, Serialize};
use url::Url;

/// Outcome of checking a user-supplied URL before it is encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            valid: true,
            reason: "Valid URL".to_string(),
        }
    }

    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: reason.to_string(),
        }
    }
}

/// Check that `raw` is an absolute http(s) URL with a host
pub fn validate_url(raw: &str) -> ValidationResult {
    if raw.trim().is_empty() {
        return ValidationResult::invalid("Please enter a URL");
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return ValidationResult::invalid("Invalid URL format"),
    };

    if !matches!(url.scheme(), "http" | "https") {
        return ValidationResult::invalid("Only HTTP and HTTPS URLs are supported");
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => ValidationResult::valid(),
        _ => ValidationResult::invalid("Invalid domain name"),
    }
}
