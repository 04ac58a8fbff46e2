//! Pushkins: per-app plugins that relay notifications to one upstream
//! push service, plus the registry that routes app IDs to them.

pub mod apns;
pub mod client;
pub mod fcm;
pub mod limiter;
pub mod retry;
pub mod truncate;
pub mod webpush;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::notification::{Device, Notification};

pub use apns::ApnsPushkin;
pub use fcm::FcmPushkin;
pub use webpush::WebPushPushkin;

/// Per-device result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream accepted the notification.
    Delivered,
    /// The pushkey is permanently unusable; the homeserver should drop it.
    Rejected { reason: String },
    /// A transient failure; the homeserver should resend the notification.
    Retryable {
        reason: String,
        /// Minimum delay requested by the upstream, if any.
        retry_after: Option<Duration>,
    },
}

impl Outcome {
    /// Shorthand for a rejection with the given reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Outcome::Rejected {
            reason: reason.into(),
        }
    }

    /// Shorthand for a retryable failure with no upstream-requested delay.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Label used for the outcome metric.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Rejected { .. } => "rejected",
            Outcome::Retryable { .. } => "retryable",
        }
    }
}

/// A per-app plugin that dispatches notifications to one upstream cloud.
///
/// The dispatcher hands each pushkin the subset of a notification's
/// devices that routed to it; the returned outcomes are parallel to that
/// slice.
#[async_trait]
pub trait Pushkin: Send + Sync {
    /// The configured app-id pattern this pushkin was created for.
    fn name(&self) -> &str;

    /// The pushkin's admission-control limiter.
    fn limiter(&self) -> &limiter::Limiter;

    /// Dispatch the notification to the given devices.
    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome>;
}

/// An app-id pattern: an exact string or an asterisk-suffix glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppIdPattern {
    Exact(String),
    Prefix(String),
}

impl AppIdPattern {
    /// Parse a pattern string; a trailing `*` makes it a prefix glob.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => AppIdPattern::Prefix(prefix.to_string()),
            None => AppIdPattern::Exact(pattern.to_string()),
        }
    }

    /// Case-sensitive match against an app ID.
    #[must_use]
    pub fn matches(&self, app_id: &str) -> bool {
        match self {
            AppIdPattern::Exact(pattern) => pattern == app_id,
            AppIdPattern::Prefix(prefix) => app_id.starts_with(prefix.as_str()),
        }
    }

    #[must_use]
    pub fn is_exact(&self) -> bool {
        matches!(self, AppIdPattern::Exact(_))
    }
}

/// Routes app IDs to pushkins.
///
/// Patterns are checked in insertion order; an exact match always beats a
/// glob, and the first-loaded entry wins ties.
#[derive(Default)]
pub struct PushkinRegistry {
    entries: Vec<(AppIdPattern, Arc<dyn Pushkin>)>,
}

impl PushkinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pushkin under an app-id pattern.
    pub fn insert(&mut self, pattern: &str, pushkin: Arc<dyn Pushkin>) {
        self.entries.push((AppIdPattern::parse(pattern), pushkin));
    }

    /// Find the pushkin responsible for an app ID, if any.
    #[must_use]
    pub fn resolve(&self, app_id: &str) -> Option<Arc<dyn Pushkin>> {
        let mut glob_match = None;
        for (pattern, pushkin) in &self.entries {
            if !pattern.matches(app_id) {
                continue;
            }
            if pattern.is_exact() {
                return Some(pushkin.clone());
            }
            if glob_match.is_none() {
                glob_match = Some(pushkin.clone());
            }
        }
        glob_match
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over registered pushkins in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Pushkin>> {
        self.entries.iter().map(|(_, p)| p)
    }
}

/// Tracks a window during which a pushkin is considered degraded.
///
/// Tripped when the upstream rejects our credentials; while active, every
/// dispatch short-circuits to a retryable outcome instead of hammering the
/// upstream with requests it will refuse.
pub struct Degraded {
    until: Mutex<Option<Instant>>,
    window: Duration,
}

/// How long a pushkin stays degraded after a credential rejection.
pub const DEGRADED_WINDOW: Duration = Duration::from_secs(30);

impl Degraded {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            until: Mutex::new(None),
            window,
        }
    }

    /// Mark the pushkin degraded for the configured window.
    pub fn trip(&self) {
        let mut until = self.until.lock().expect("degraded lock poisoned");
        *until = Some(Instant::now() + self.window);
    }

    /// Whether the degraded window is still open.
    #[must_use]
    pub fn active(&self) -> bool {
        let mut until = self.until.lock().expect("degraded lock poisoned");
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }
}

impl Default for Degraded {
    fn default() -> Self {
        Self::new(DEGRADED_WINDOW)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::StaticPushkin;
    use super::*;

    fn registry_with(patterns: &[&str]) -> PushkinRegistry {
        let mut registry = PushkinRegistry::new();
        for pattern in patterns {
            registry.insert(pattern, Arc::new(StaticPushkin::new(pattern, Outcome::Delivered)));
        }
        registry
    }

    #[test]
    fn test_exact_match() {
        let registry = registry_with(&["com.example.ios"]);
        assert!(registry.resolve("com.example.ios").is_some());
        assert!(registry.resolve("com.example.android").is_none());
    }

    #[test]
    fn test_glob_match_is_prefix_only() {
        let registry = registry_with(&["com.example.*"]);
        assert!(registry.resolve("com.example.ios").is_some());
        assert!(registry.resolve("com.example.").is_some());
        assert!(registry.resolve("org.example.ios").is_none());
    }

    #[test]
    fn test_exact_wins_over_earlier_glob() {
        let registry = registry_with(&["com.example.*", "com.example.ios"]);
        let resolved = registry.resolve("com.example.ios").unwrap();
        assert_eq!(resolved.name(), "com.example.ios");
    }

    #[test]
    fn test_first_loaded_glob_wins_ties() {
        let registry = registry_with(&["com.*", "com.example.*"]);
        let resolved = registry.resolve("com.example.ios").unwrap();
        assert_eq!(resolved.name(), "com.*");
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let registry = registry_with(&["com.Example.iOS"]);
        assert!(registry.resolve("com.example.ios").is_none());
        assert!(registry.resolve("com.Example.iOS").is_some());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        // Same configuration, many lookups: always the same winner.
        let registry = registry_with(&["a.*", "a.b.*", "a.b.c"]);
        let first = registry.resolve("a.b.x").unwrap().name().to_string();
        for _ in 0..100 {
            assert_eq!(registry.resolve("a.b.x").unwrap().name(), first);
        }
        assert_eq!(first, "a.*");
        assert_eq!(registry.resolve("a.b.c").unwrap().name(), "a.b.c");
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(
            AppIdPattern::parse("com.x.*"),
            AppIdPattern::Prefix("com.x.".to_string())
        );
        assert_eq!(
            AppIdPattern::parse("com.x"),
            AppIdPattern::Exact("com.x".to_string())
        );
    }

    #[test]
    fn test_degraded_window() {
        let degraded = Degraded::new(Duration::from_millis(30));
        assert!(!degraded.active());
        degraded.trip();
        assert!(degraded.active());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!degraded.active());
    }

    #[test]
    fn test_outcome_metric_labels() {
        assert_eq!(Outcome::Delivered.metric_label(), "delivered");
        assert_eq!(Outcome::rejected("x").metric_label(), "rejected");
        assert_eq!(Outcome::retryable("x").metric_label(), "retryable");
    }
}
