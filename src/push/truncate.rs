//! Oversize-payload reduction.
//!
//! APNs and FCM both cap the serialized payload at 4 KiB. When a payload
//! overflows, notification fields are reduced in a fixed priority order —
//! message body first, then the human-readable room and sender decorations,
//! and finally the event content as a whole — re-rendering after each step
//! until the payload fits.

use serde_json::Value;

use crate::notification::Notification;

/// Payload byte cap applied by APNs and FCM.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Serialized length of a JSON value in bytes.
#[must_use]
pub fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Cut a string to at most `max_bytes` at a char boundary.
#[must_use]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn set_content_body(n: &mut Notification, body: &str) {
    if let Some(content) = n.content.as_mut().and_then(Value::as_object_mut) {
        content.insert("body".to_string(), Value::String(body.to_string()));
    }
}

/// Render `build(n)` within `max_bytes`, reducing notification fields in
/// priority order until it fits. Returns `None` when even the fully
/// reduced notification overflows.
pub fn shrink_to_fit<F>(n: &Notification, max_bytes: usize, build: F) -> Option<Value>
where
    F: Fn(&Notification) -> Value,
{
    let payload = build(n);
    if encoded_len(&payload) <= max_bytes {
        return Some(payload);
    }

    let mut trimmed = n.clone();

    // Halve the message body until the payload fits or the body is gone.
    loop {
        let body_len = trimmed.content_body().map(str::len).unwrap_or(0);
        if body_len == 0 {
            break;
        }
        let shorter = truncate_str(trimmed.content_body().unwrap_or(""), body_len / 2).to_string();
        set_content_body(&mut trimmed, &shorter);

        let payload = build(&trimmed);
        if encoded_len(&payload) <= max_bytes {
            return Some(payload);
        }
    }

    let reductions: [fn(&mut Notification); 4] = [
        |n| n.room_name = None,
        |n| n.sender_display_name = None,
        |n| n.room_alias = None,
        |n| n.content = None,
    ];

    for reduce in reductions {
        reduce(&mut trimmed);
        let payload = build(&trimmed);
        if encoded_len(&payload) <= max_bytes {
            return Some(payload);
        }
    }

    None
}
