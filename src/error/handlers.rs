//! Standardized mapping of HTTP failures into registry errors

use crate::error::RegistryError;
use reqwest::StatusCode;

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Turn a non-success response into a protocol error for `operation` on `target`
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
        target: &str,
    ) -> RegistryError {
        let detail = Self::summarize_body(error_text);
        let message = match status.as_u16() {
            401 => format!("unauthorized (HTTP 401): {}", detail),
            403 => format!("forbidden, insufficient permissions (HTTP 403): {}", detail),
            404 => format!("not found (HTTP 404): {}", detail),
            405 => format!("operation not supported by registry (HTTP 405): {}", detail),
            429 => format!("rate limited (HTTP 429): {}", detail),
            500 => format!("registry server error (HTTP 500): {}", detail),
            502 | 503 | 504 => format!("registry unavailable (HTTP {}): {}", status.as_u16(), detail),
            _ => format!("failed with HTTP {}: {}", status, detail),
        };

        RegistryError::Protocol {
            operation: operation.to_string(),
            target: target.to_string(),
            status: Some(status.as_u16()),
            message,
        }
    }

    /// Token endpoint failures keep the realm in the target for diagnosis
    pub fn handle_auth_error(status: StatusCode, error_text: &str, realm: &str) -> RegistryError {
        let message = match status.as_u16() {
            400 => "invalid token request parameters".to_string(),
            401 => "invalid credentials provided".to_string(),
            403 => "access denied, insufficient permissions".to_string(),
            404 => "authentication endpoint not found".to_string(),
            _ => format!("failed with HTTP {}: {}", status, Self::summarize_body(error_text)),
        };

        RegistryError::Protocol {
            operation: "Fetching bearer token from".to_string(),
            target: realm.to_string(),
            status: Some(status.as_u16()),
            message,
        }
    }

    /// Pull the first `errors[].message` out of an OCI error body, else trim the raw text
    fn summarize_body(error_text: &str) -> String {
        let parsed = serde_json::from_str::<serde_json::Value>(error_text).ok();
        let first = parsed
            .as_ref()
            .and_then(|v| v.get("errors"))
            .and_then(|errors| errors.as_array())
            .and_then(|errors| errors.first())
            .map(|e| {
                let code = e.get("code").and_then(|c| c.as_str()).unwrap_or("UNKNOWN");
                let message = e.get("message").and_then(|m| m.as_str()).unwrap_or("");
                format!("{}: {}", code, message)
            });

        match first {
            Some(summary) => summary,
            None if error_text.trim().is_empty() => "(empty body)".to_string(),
            None => error_text.trim().chars().take(256).collect(),
        }
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: reqwest::Error, context: &str, url: &str) -> RegistryError {
        let context = if error.is_timeout() {
            format!("{} timed out", context)
        } else if error.is_connect() {
            format!("Connection error during {}", context)
        } else if error.to_string().contains("certificate") {
            format!("TLS certificate error during {}", context)
        } else {
            format!("Network error during {}", context)
        };

        RegistryError::Transport {
            context,
            url: url.to_string(),
            source: error,
        }
    }
}
