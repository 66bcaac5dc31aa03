//! Control messages posted by pages.

use hashbrown::HashMap;
use offgrid_net::CredentialsMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A message from a foreground page.
///
/// Messages are tagged by `type`. Anything unrecognised, including a known
/// type with malformed fields, decodes to [`ControlMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Fetch `urls` into the shell namespace (API URLs into the API one).
    Warmup {
        #[serde(default)]
        urls: Vec<String>,
    },
    /// Fetch external assets into the external namespace. Without `urls`
    /// the configured warm list is used.
    WarmupIcons {
        #[serde(default)]
        urls: Option<Vec<String>>,
    },
    /// Queue a request without attempting it first.
    QueueRequest {
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        credentials: Option<CredentialsMode>,
    },
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Replay the mutation queue now.
    ReplayQueue,
    /// Ask the platform for a warmup background sync.
    WarmupSync,
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Decode a posted message.
    pub fn parse(message: &Value) -> Self {
        match serde_json::from_value(message.clone()) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognised control message");
                ControlMessage::Unknown
            }
        }
    }
}

/// Body of a queued request as text.
pub(crate) fn body_text(body: &Option<Value>) -> Option<String> {
    match body {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_warmup() {
        let msg = ControlMessage::parse(&json!({"type": "WARMUP", "urls": ["/", "/api/items"]}));
        assert_eq!(
            msg,
            ControlMessage::Warmup {
                urls: vec!["/".to_string(), "/api/items".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_queue_request() {
        let msg = ControlMessage::parse(&json!({
            "type": "QUEUE_REQUEST",
            "url": "/api/analytics",
            "body": {"event": "open"}
        }));
        match msg {
            ControlMessage::QueueRequest {
                url, method, body, ..
            } => {
                assert_eq!(url, "/api/analytics");
                assert!(method.is_none());
                assert_eq!(body_text(&body).as_deref(), Some(r#"{"event":"open"}"#));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unit_messages() {
        assert_eq!(
            ControlMessage::parse(&json!({"type": "SKIP_WAITING"})),
            ControlMessage::SkipWaiting
        );
        assert_eq!(
            ControlMessage::parse(&json!({"type": "WARMUP_SYNC"})),
            ControlMessage::WarmupSync
        );
    }

    #[test]
    fn test_unknown_messages_are_ignored() {
        assert_eq!(
            ControlMessage::parse(&json!({"type": "SOMETHING_NEW", "x": 1})),
            ControlMessage::Unknown
        );
        assert_eq!(ControlMessage::parse(&json!("hello")), ControlMessage::Unknown);
        assert_eq!(
            ControlMessage::parse(&json!({"type": "QUEUE_REQUEST"})),
            ControlMessage::Unknown
        );
    }

    #[test]
    fn test_body_text() {
        assert_eq!(body_text(&None), None);
        assert_eq!(body_text(&Some(Value::Null)), None);
        assert_eq!(body_text(&Some(json!("a=1"))).as_deref(), Some("a=1"));
    }
}
