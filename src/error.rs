use reqwest::StatusCode;
use thiserror::Error;

/// Failures raised by a provider adapter while talking to its external API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Credentials for the provider are absent; the adapter is skipped.
    #[error("provider credentials are not configured")]
    NotConfigured,

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<u64> },

    /// The provider holds no data for the requested window or anything older.
    #[error("provider has no further historical data")]
    HistoryExhausted,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Network("request timed out".to_string())
        } else if err.is_connect() {
            FetchError::Network(format!("connection failed: {err}"))
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            if status == StatusCode::TOO_MANY_REQUESTS {
                FetchError::RateLimited { retry_after: None }
            } else {
                FetchError::Api {
                    status: status.as_u16(),
                    body: err.to_string(),
                }
            }
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// Rejections raised at the inbound webhook boundary.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    MissingSecret,

    #[error("missing signature header")]
    MissingSignature,

    #[error("signature does not match request body")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Error messages collected during a run, capped so results stay small.
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    limit: usize,
    messages: Vec<String>,
    overflow: usize,
}

impl ErrorList {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            messages: Vec::new(),
            overflow: 0,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.messages.len() < self.limit {
            self.messages.push(message.into());
        } else {
            self.overflow += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        let mut messages = self.messages;
        if self.overflow > 0 {
            messages.push(format!("... and {} more", self.overflow));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_list_caps_messages_and_reports_overflow() {
        let mut errors = ErrorList::new(2);
        errors.push("first");
        errors.push("second");
        errors.push("third");
        errors.push("fourth");

        let rendered = errors.into_vec();
        assert_eq!(rendered, vec!["first", "second", "... and 2 more"]);
    }

    #[test]
    fn empty_error_list_renders_nothing() {
        let errors = ErrorList::new(5);
        assert!(errors.is_empty());
        assert!(errors.into_vec().is_empty());
    }

    #[test]
    fn fetch_error_display() {
        assert_eq!(
            FetchError::Api {
                status: 500,
                body: "boom".to_string()
            }
            .to_string(),
            "provider returned HTTP 500: boom"
        );
        assert!(FetchError::RateLimited { retry_after: Some(30) }.is_rate_limited());
        assert!(!FetchError::HistoryExhausted.is_rate_limited());
    }

    #[test]
    fn decode_errors_convert_from_serde() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(FetchError::from(err), FetchError::Decode(_)));
    }
}
