//! Push payload parsing and notification descriptors.

use offgrid_core::WorkerConfig;
use serde_json::{Map, Value};
use tracing::debug;

use crate::NotificationDescriptor;

/// Inbound push payload.
///
/// Known fields are read one by one; a field of the wrong type is treated
/// as absent without discarding the rest. The decoded JSON is kept as-is so
/// it can be republished to pages unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub url: Option<String>,
    pub tag: Option<String>,
    pub require_interaction: Option<bool>,
    pub data: Value,
}

impl Default for PushPayload {
    fn default() -> Self {
        Self {
            title: None,
            body: None,
            icon: None,
            badge: None,
            url: None,
            tag: None,
            require_interaction: None,
            data: Value::Object(Map::new()),
        }
    }
}

impl PushPayload {
    /// Parse a raw payload.
    ///
    /// A missing payload yields an empty one. Bytes that are not JSON are
    /// treated as the plain-text body.
    pub fn from_bytes(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON, using it as text");
                let body = String::from_utf8_lossy(raw).into_owned();
                let mut data = Map::new();
                data.insert("body".to_string(), Value::String(body.clone()));
                Self {
                    body: Some(body),
                    data: Value::Object(data),
                    ..Self::default()
                }
            }
        }
    }

    /// Read the known fields of a decoded payload.
    pub fn from_value(data: Value) -> Self {
        let text = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);
        let mut payload = Self {
            title: text("title"),
            body: text("body"),
            icon: text("icon"),
            badge: text("badge"),
            url: text("url"),
            tag: text("tag"),
            require_interaction: data.get("requireInteraction").and_then(Value::as_bool),
            ..Self::default()
        };
        payload.data = data;
        payload
    }

    /// The payload as broadcast to pages.
    pub fn to_value(&self) -> Value {
        self.data.clone()
    }

    /// Build the notification to show, filling every missing or empty field
    /// from the configured defaults.
    pub fn to_notification(&self, config: &WorkerConfig) -> NotificationDescriptor {
        let defaults = &config.notifications;
        NotificationDescriptor {
            title: non_empty(&self.title).unwrap_or(defaults.title.as_str()).to_string(),
            body: non_empty(&self.body).unwrap_or(defaults.body.as_str()).to_string(),
            icon: non_empty(&self.icon).unwrap_or(defaults.icon.as_str()).to_string(),
            badge: non_empty(&self.badge).unwrap_or(defaults.badge.as_str()).to_string(),
            tag: non_empty(&self.tag)
                .map(str::to_string)
                .unwrap_or_else(|| config.default_push_tag()),
            url: non_empty(&self.url).unwrap_or(defaults.url.as_str()).to_string(),
            renotify: true,
            require_interaction: self.require_interaction.unwrap_or(false),
            vibrate: defaults.vibrate.clone(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open window already showed the target path and was focused.
    Focused(String),
    /// A new window was opened at the target.
    Opened(String),
    /// Neither was possible.
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_payload() {
        let payload = PushPayload::from_bytes(Some(&b"hello"[..]));
        assert_eq!(payload.body.as_deref(), Some("hello"));

        let notification = payload.to_notification(&WorkerConfig::default());
        assert_eq!(notification.title, "New notification");
        assert_eq!(notification.body, "hello");
        assert_eq!(notification.tag, "offgrid-push");
        assert_eq!(notification.url, "/notifications");
    }

    #[test]
    fn test_json_payload_overrides_defaults() {
        let raw = br#"{"title":"Order shipped","url":"/orders/7","tag":"order-7","requireInteraction":true,"sound":"ding"}"#;
        let payload = PushPayload::from_bytes(Some(&raw[..]));
        let notification = payload.to_notification(&WorkerConfig::default());

        assert_eq!(notification.title, "Order shipped");
        assert_eq!(notification.body, "You have a new message");
        assert_eq!(notification.url, "/orders/7");
        assert_eq!(notification.tag, "order-7");
        assert!(notification.require_interaction);
        assert!(notification.renotify);
        assert_eq!(notification.vibrate, vec![100, 50, 100]);

        assert_eq!(payload.to_value()["sound"], "ding");
    }

    #[test]
    fn test_empty_fields_fall_back() {
        let payload = PushPayload::from_bytes(Some(&br#"{"title":"","body":"  "}"#[..]));
        let notification = payload.to_notification(&WorkerConfig::default());
        assert_eq!(notification.title, "New notification");
        assert_eq!(notification.body, "You have a new message");
    }

    #[test]
    fn test_missing_payload() {
        let payload = PushPayload::from_bytes(None);
        assert_eq!(payload, PushPayload::default());
        assert!(!payload
            .to_notification(&WorkerConfig::default())
            .title
            .is_empty());
    }

    #[test]
    fn test_non_object_json_uses_defaults() {
        let payload = PushPayload::from_bytes(Some(&b"42"[..]));
        assert_eq!(payload.body, None);
        assert_eq!(payload.to_value(), serde_json::json!(42));
        assert_eq!(
            payload.to_notification(&WorkerConfig::default()).body,
            "You have a new message"
        );
    }

    #[test]
    fn test_mistyped_field_keeps_the_others() {
        let raw = br#"{"title":"Sale today","body":"50% off","url":"/deals","requireInteraction":"yes","tag":7}"#;
        let payload = PushPayload::from_bytes(Some(&raw[..]));
        let notification = payload.to_notification(&WorkerConfig::default());

        assert_eq!(notification.title, "Sale today");
        assert_eq!(notification.body, "50% off");
        assert_eq!(notification.url, "/deals");
        assert_eq!(notification.tag, "offgrid-push");
        assert!(!notification.require_interaction);

        let broadcast = payload.to_value();
        assert_eq!(broadcast["title"], "Sale today");
        assert_eq!(broadcast["requireInteraction"], "yes");
    }

    #[test]
    fn test_plain_text_is_broadcast_as_body() {
        let payload = PushPayload::from_bytes(Some(&b"hello"[..]));
        assert_eq!(payload.to_value(), serde_json::json!({"body": "hello"}));
    }
}
