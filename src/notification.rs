//! Inbound notification model and normalization.
//!
//! The notify endpoint receives a JSON envelope with a single
//! `notification` object. Normalization flattens the nested unread counts,
//! validates the device list and leaves a canonical value that downstream
//! code (and a second normalization pass) can rely on.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Format hint asking for a stripped-down payload.
pub const FORMAT_EVENT_ID_ONLY: &str = "event_id_only";

/// Notification priority as sent by the homeserver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    High,
    Low,
}

impl Priority {
    /// Returns `true` for low-priority notifications.
    #[must_use]
    pub fn is_low(self) -> bool {
        matches!(self, Priority::Low)
    }
}

/// Per-device notification tweaks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tweaks {
    /// Sound to play, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,

    /// Whether the event should be highlighted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub highlight: bool,
}

/// Unread counts as nested on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counts {
    #[serde(default)]
    pub unread: Option<u64>,
    #[serde(default)]
    pub missed_calls: Option<u64>,
}

/// Pushkin-relevant fields of a device's `data` bag.
///
/// Unknown fields are preserved in `extra` so pushkins with their own
/// conventions still see them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    /// Payload skeleton the derived fields are merged into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_payload: Option<serde_json::Value>,

    /// Device-level format hint; wins over the notification-level one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Drop notifications that carry no event identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_only: Option<bool>,

    /// Keep at most one pending notification per room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_last_per_room: Option<bool>,

    /// Registration-time flag with no dispatch-time effect; carried as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,

    /// WebPush subscription endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// WebPush subscription auth secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    /// WebPush TTL override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single device target of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub app_id: String,
    pub pushkey: String,

    /// Timestamp (seconds) at which the pushkey was issued.
    #[serde(default)]
    pub pushkey_ts: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DeviceData>,

    #[serde(default)]
    pub tweaks: Tweaks,
}

impl Device {
    /// The device's `data` bag, or a default one when absent.
    #[must_use]
    pub fn data(&self) -> DeviceData {
        self.data.clone().unwrap_or_default()
    }
}

/// A normalized inbound notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    /// Matrix event type, e.g. `m.room.message`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user_is_target: bool,

    #[serde(default)]
    pub prio: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,

    /// Nested counts as sent by the homeserver; emptied by normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<Counts>,

    /// Flattened from `counts.unread`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<u64>,

    /// Flattened from `counts.missed_calls`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_calls: Option<u64>,

    /// Notification-level format hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Notification {
    /// Canonicalize the notification: flatten nested counts and validate
    /// the device list. Normalizing an already-normalized value is a no-op.
    pub fn normalize(mut self) -> Result<Self> {
        if self.devices.is_empty() {
            return Err(Error::InvalidNotification(
                "expected at least one device".to_string(),
            ));
        }

        for device in &self.devices {
            if device.app_id.is_empty() {
                return Err(Error::InvalidNotification(
                    "device with empty app_id".to_string(),
                ));
            }
            if device.pushkey.is_empty() {
                return Err(Error::InvalidNotification(
                    "device with empty pushkey".to_string(),
                ));
            }
        }

        if let Some(counts) = self.counts.take() {
            // The nested form is authoritative when both appear.
            if counts.unread.is_some() {
                self.unread = counts.unread;
            }
            if counts.missed_calls.is_some() {
                self.missed_calls = counts.missed_calls;
            }
        }

        Ok(self)
    }

    /// The effective format hint for a device; the device-level hint wins.
    #[must_use]
    pub fn format_for(&self, device: &Device) -> Option<String> {
        device
            .data
            .as_ref()
            .and_then(|d| d.format.clone())
            .or_else(|| self.format.clone())
    }

    /// Whether the device asked for identifiers-only payloads.
    #[must_use]
    pub fn event_id_only(&self, device: &Device) -> bool {
        self.format_for(device).as_deref() == Some(FORMAT_EVENT_ID_ONLY)
    }

    /// The message body from the event content, if it is a string.
    #[must_use]
    pub fn content_body(&self) -> Option<&str> {
        self.content.as_ref()?.get("body")?.as_str()
    }

    /// The msgtype from the event content, if it is a string.
    #[must_use]
    pub fn content_msgtype(&self) -> Option<&str> {
        self.content.as_ref()?.get("msgtype")?.as_str()
    }
}

/// The request envelope for the notify endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub notification: Notification,
}

/// Parse and normalize a notify request body.
pub fn parse_notify_request(body: &[u8]) -> Result<Notification> {
    let envelope: NotifyRequest = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidNotification(format!("malformed request body: {e}")))?;
    envelope.notification.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_body() -> Vec<u8> {
        json!({
            "notification": {
                "event_id": "$evt:example.org",
                "room_id": "!room:example.org",
                "type": "m.room.message",
                "sender": "@alice:example.org",
                "sender_display_name": "Alice",
                "room_name": "Mission Control",
                "prio": "high",
                "counts": { "unread": 2, "missed_calls": 1 },
                "content": { "msgtype": "m.text", "body": "hello" },
                "devices": [
                    {
                        "app_id": "com.example.ios",
                        "pushkey": "AAAA",
                        "pushkey_ts": 12345,
                        "tweaks": { "sound": "default" }
                    }
                ]
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_parse_and_flatten_counts() {
        let n = parse_notify_request(&sample_body()).unwrap();
        assert_eq!(n.unread, Some(2));
        assert_eq!(n.missed_calls, Some(1));
        assert_eq!(n.event_type.as_deref(), Some("m.room.message"));
        assert_eq!(n.devices.len(), 1);
        assert_eq!(n.devices[0].tweaks.sound.as_deref(), Some("default"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = parse_notify_request(&sample_body()).unwrap();

        // Round-trip through the wire shape and normalize again.
        let wire = serde_json::to_vec(&NotifyRequest {
            notification: once.clone(),
        })
        .unwrap();
        let twice = parse_notify_request(&wire).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_nested_counts_win_over_flat() {
        let body = json!({
            "notification": {
                "counts": { "unread": 7 },
                "unread": 3,
                "devices": [{ "app_id": "a", "pushkey": "p" }]
            }
        })
        .to_string();

        let n = parse_notify_request(body.as_bytes()).unwrap();
        assert_eq!(n.unread, Some(7));
    }

    #[test]
    fn test_no_devices_rejected() {
        let body = json!({ "notification": { "devices": [] } }).to_string();
        let err = parse_notify_request(body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("at least one device"));
    }

    #[test]
    fn test_missing_pushkey_rejected() {
        let body = json!({
            "notification": { "devices": [{ "app_id": "a", "pushkey": "" }] }
        })
        .to_string();
        assert!(parse_notify_request(body.as_bytes()).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = parse_notify_request(b"{not json").unwrap_err();
        assert!(matches!(err, Error::InvalidNotification(_)));
    }

    #[test]
    fn test_device_format_wins() {
        let body = json!({
            "notification": {
                "format": "full",
                "devices": [
                    {
                        "app_id": "a",
                        "pushkey": "p",
                        "data": { "format": "event_id_only" }
                    },
                    { "app_id": "b", "pushkey": "q" }
                ]
            }
        })
        .to_string();

        let n = parse_notify_request(body.as_bytes()).unwrap();
        assert!(n.event_id_only(&n.devices[0]));
        assert!(!n.event_id_only(&n.devices[1]));
        assert_eq!(n.format_for(&n.devices[1]).as_deref(), Some("full"));
    }

    #[test]
    fn test_unknown_prio_rejected() {
        let body = json!({
            "notification": {
                "prio": "urgent",
                "devices": [{ "app_id": "a", "pushkey": "p" }]
            }
        })
        .to_string();
        assert!(parse_notify_request(body.as_bytes()).is_err());
    }

    #[test]
    fn test_device_data_keeps_unknown_fields() {
        let body = json!({
            "notification": {
                "devices": [{
                    "app_id": "a",
                    "pushkey": "p",
                    "data": { "endpoint": "https://push.example", "custom": 42 }
                }]
            }
        })
        .to_string();

        let n = parse_notify_request(body.as_bytes()).unwrap();
        let data = n.devices[0].data();
        assert_eq!(data.endpoint.as_deref(), Some("https://push.example"));
        assert_eq!(data.extra["custom"], json!(42));
    }
}
