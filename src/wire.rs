use serde::Deserialize;

/// Structured error body returned by the API on non-success statuses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ApiErrorMessage {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

impl ApiErrorMessage {
    /// Parses a response body; `None` when it is not a JSON error object.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let parsed: Self = serde_json::from_slice(body).ok()?;
        if parsed.error.is_none() && parsed.message.is_none() && parsed.text.is_none() {
            return None;
        }
        Some(parsed)
    }

    pub fn describe(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .or(self.text.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::ApiErrorMessage;

    #[test]
    fn prefers_message_over_error() {
        let parsed = ApiErrorMessage::parse(
            br#"{"error":"NotFound","message":"Database 'x' does not exist","severity":"error"}"#,
        )
        .unwrap();
        assert_eq!(parsed.describe(), Some("Database 'x' does not exist"));
        assert_eq!(parsed.severity.as_deref(), Some("error"));
    }

    #[test]
    fn rejects_non_error_bodies() {
        assert!(ApiErrorMessage::parse(b"<html>bad gateway</html>").is_none());
        assert!(ApiErrorMessage::parse(br#"{"databases":[]}"#).is_none());
    }
}
