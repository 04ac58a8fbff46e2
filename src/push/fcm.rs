//! Firebase Cloud Messaging pushkin.
//!
//! Supports the legacy JSON API (static API key, batched registration ids)
//! and the v1 REST API (service-account OAuth2, one call per device).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PushkinConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::notification::{Device, Notification};
use crate::proxy;
use crate::push::client::{self, ClientSettings, DEFAULT_MAX_CONNECTIONS};
use crate::push::limiter::{DEFAULT_INFLIGHT_LIMIT, Limiter};
use crate::push::retry::{self, Attempt, RetryConfig};
use crate::push::truncate::{self, MAX_PAYLOAD_BYTES};
use crate::push::{Degraded, Outcome, Pushkin};

const FCM_BASE_URL: &str = "https://fcm.googleapis.com";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Legacy API ceiling on registration ids per request.
const MAX_REGISTRATION_IDS: usize = 1000;

/// Access tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Legacy per-result errors that permanently invalidate the pushkey.
const REJECT_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MismatchSenderId"];

/// Legacy per-result errors that are worth the homeserver retrying.
const RETRY_ERRORS: &[&str] = &["Unavailable", "InternalServerError"];

/// Service account JSON structure.
#[derive(Debug, Deserialize)]
pub(crate) struct ServiceAccount {
    pub(crate) project_id: String,
    pub(crate) private_key: String,
    pub(crate) client_email: String,
    pub(crate) token_uri: String,
}

/// JWT claims for the OAuth2 assertion.
#[derive(Debug, Serialize)]
struct OAuthClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Serialize)]
struct TokenRequest {
    grant_type: String,
    assertion: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// One entry of a legacy `results` array.
#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    registration_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    results: Vec<LegacyResult>,
}

enum FcmMode {
    Legacy {
        api_key: String,
    },
    V1 {
        project_id: String,
        client_email: String,
        encoding_key: EncodingKey,
        token_uri: String,
        cached: RwLock<Option<CachedToken>>,
    },
}

/// Pushkin relaying notifications to FCM.
pub struct FcmPushkin {
    name: String,
    client: Client,
    base_url: String,
    mode: FcmMode,
    fcm_options: Map<String, Value>,
    limiter: Limiter,
    degraded: Degraded,
    retry_config: RetryConfig,
    metrics: Metrics,
}

impl FcmPushkin {
    /// Create a new FCM pushkin from its app configuration.
    pub async fn new(
        name: &str,
        config: &PushkinConfig,
        global_proxy: Option<&str>,
        metrics: Metrics,
    ) -> Result<Self> {
        let mode = match config.api_version.as_deref() {
            None | Some("legacy") => {
                if config.api_version.is_none() {
                    warn!(app = %name, "api_version not set, defaulting to legacy");
                }
                let api_key = config.api_key.clone().ok_or_else(|| {
                    Error::PushkinSetup(format!("app '{name}': no 'api_key' set"))
                })?;
                FcmMode::Legacy { api_key }
            }
            Some("v1") => {
                let sa_file = config.service_account_file.as_ref().ok_or_else(|| {
                    Error::PushkinSetup(format!(
                        "app '{name}': 'service_account_file' is required with api_version v1"
                    ))
                })?;
                let raw = tokio::fs::read_to_string(sa_file).await.map_err(|e| {
                    Error::PushkinSetup(format!(
                        "cannot read service account file '{}': {e}",
                        sa_file.display()
                    ))
                })?;
                let sa: ServiceAccount = serde_json::from_str(&raw).map_err(|e| {
                    Error::PushkinSetup(format!("invalid service account JSON: {e}"))
                })?;
                let encoding_key =
                    EncodingKey::from_rsa_pem(sa.private_key.as_bytes()).map_err(|e| {
                        Error::PushkinSetup(format!("invalid service account key: {e}"))
                    })?;

                let project_id = config
                    .project_id
                    .clone()
                    .unwrap_or_else(|| sa.project_id.clone());
                if project_id.is_empty() {
                    return Err(Error::PushkinSetup(format!(
                        "app '{name}': 'project_id' is required with api_version v1"
                    )));
                }

                FcmMode::V1 {
                    project_id,
                    client_email: sa.client_email,
                    encoding_key,
                    token_uri: if sa.token_uri.is_empty() {
                        OAUTH_TOKEN_URL.to_string()
                    } else {
                        sa.token_uri
                    },
                    cached: RwLock::new(None),
                }
            }
            Some(other) => {
                return Err(Error::PushkinSetup(format!(
                    "app '{name}': invalid api_version '{other}'"
                )));
            }
        };

        let proxy = proxy::select_proxy(config.proxy.as_deref(), global_proxy)?;
        let client = client::build_client(ClientSettings {
            max_connections: config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            proxy,
            ..Default::default()
        })?;

        Ok(Self {
            name: name.to_string(),
            client,
            base_url: FCM_BASE_URL.to_string(),
            mode,
            fcm_options: config.fcm_options.clone(),
            limiter: Limiter::new(
                config.inflight_request_limit.unwrap_or(DEFAULT_INFLIGHT_LIMIT),
            ),
            degraded: Degraded::default(),
            retry_config: RetryConfig::default(),
            metrics,
        })
    }

    /// Get a valid OAuth2 access token, refreshing when close to expiry.
    async fn access_token(&self) -> Result<String> {
        let FcmMode::V1 {
            client_email,
            encoding_key,
            token_uri,
            cached,
            ..
        } = &self.mode
        else {
            return Err(Error::Fcm("access tokens are a v1 concern".to_string()));
        };

        {
            let guard = cached.read().await;
            if let Some(ref token) = *guard
                && token.expires_at > SystemTime::now()
            {
                return Ok(token.token.clone());
            }
        }

        let mut guard = cached.write().await;
        if let Some(ref token) = *guard
            && token.expires_at > SystemTime::now()
        {
            return Ok(token.token.clone());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Fcm(format!("system time error: {e}")))?
            .as_secs();

        let claims = OAuthClaims {
            iss: client_email.clone(),
            scope: FCM_SCOPE.to_string(),
            aud: token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, encoding_key)?;

        let response = self
            .client
            .post(token_uri)
            .form(&TokenRequest {
                grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer".to_string(),
                assertion,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fcm(format!(
                "OAuth token request failed: {status} - {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *guard = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: SystemTime::now() + lifetime,
        });
        self.metrics
            .credential_refreshes_total
            .with_label_values(&[&self.name])
            .inc();

        debug!(app = %self.name, "Refreshed FCM access token");
        Ok(token.access_token)
    }

    /// Dispatch one legacy chunk (up to 1000 registration ids).
    async fn dispatch_legacy_chunk(
        &self,
        n: &Notification,
        devices: &[Device],
        api_key: &str,
    ) -> Vec<Outcome> {
        let first = &devices[0];
        let Some(data) = self.build_capped_data(n, first) else {
            return vec![self.data_failure_outcome(first); devices.len()];
        };

        let mut body = Map::new();
        for (key, value) in &self.fcm_options {
            body.insert(key.clone(), value.clone());
        }
        body.insert("data".to_string(), Value::Object(data));
        body.insert(
            "priority".to_string(),
            json!(request_priority(n, devices)),
        );
        if devices.len() == 1 {
            body.insert("to".to_string(), json!(devices[0].pushkey));
        } else {
            let ids: Vec<&str> = devices.iter().map(|d| d.pushkey.as_str()).collect();
            body.insert("registration_ids".to_string(), json!(ids));
        }

        let url = format!("{}/fcm/send", self.base_url);
        let auth_header = format!("key={api_key}");

        let result = retry::with_transport_retry(&self.retry_config, "FCM", || {
            self.send_once(&url, &body, &auth_header)
        })
        .await;

        match result {
            Ok(response) => self.interpret_legacy_response(response, devices).await,
            Err(reason) => vec![Outcome::retryable(reason); devices.len()],
        }
    }

    /// Dispatch one device through the v1 API.
    async fn dispatch_v1_device(
        &self,
        n: &Notification,
        device: &Device,
        project_id: &str,
    ) -> Outcome {
        let Some(data) = self.build_capped_data(n, device) else {
            return self.data_failure_outcome(device);
        };

        let mut message = Map::new();
        for (key, value) in &self.fcm_options {
            message.insert(key.clone(), value.clone());
        }
        message.insert("data".to_string(), Value::Object(data));
        message.insert("token".to_string(), json!(device.pushkey));

        let priority = json!({ "priority": request_priority(n, std::slice::from_ref(device)) });
        match message.get_mut("android").and_then(Value::as_object_mut) {
            Some(android) => {
                android.insert(
                    "priority".to_string(),
                    priority["priority"].clone(),
                );
            }
            None => {
                message.insert("android".to_string(), priority);
            }
        }

        let mut body = Map::new();
        body.insert("message".to_string(), Value::Object(message));

        let access_token = match self.access_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(app = %self.name, error = %e, "Could not obtain access token");
                return Outcome::retryable("cannot obtain FCM access token");
            }
        };

        let url = format!("{}/v1/projects/{project_id}/messages:send", self.base_url);
        let auth_header = format!("Bearer {access_token}");

        let result = retry::with_transport_retry(&self.retry_config, "FCM", || {
            self.send_once(&url, &body, &auth_header)
        })
        .await;

        match result {
            Ok(response) => self.interpret_v1_response(response, device).await,
            Err(reason) => Outcome::retryable(reason),
        }
    }

    /// Build the string-valued data object, capped at 4 KiB, merging the
    /// device's default payload beneath the derived fields. `None` means
    /// the payload could not be made to fit or the default payload is
    /// misconfigured.
    fn build_capped_data(&self, n: &Notification, device: &Device) -> Option<Map<String, Value>> {
        let data = device.data();
        let base = match &data.default_payload {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                warn!(
                    app = %self.name,
                    "Rejecting pushkey: default_payload must be an object"
                );
                return None;
            }
        };

        let payload = truncate::shrink_to_fit(n, MAX_PAYLOAD_BYTES, |n| {
            Value::Object(build_data(n, &base))
        })?;

        match payload {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Outcome for a device whose data could not be built: misconfigured
    /// payloads reject the pushkey, oversize ones are worth retrying.
    fn data_failure_outcome(&self, device: &Device) -> Outcome {
        let misconfigured = device
            .data
            .as_ref()
            .and_then(|d| d.default_payload.as_ref())
            .is_some_and(|p| !p.is_object());
        if misconfigured {
            Outcome::rejected("misconfigured default_payload")
        } else {
            Outcome::retryable("payload too large after truncation")
        }
    }

    async fn send_once(
        &self,
        url: &str,
        body: &Map<String, Value>,
        auth_header: &str,
    ) -> Attempt<reqwest::Response> {
        let timer = self
            .metrics
            .upstream_request_seconds
            .with_label_values(&[&self.name])
            .start_timer();

        let response = self
            .client
            .post(url)
            .header("Authorization", auth_header)
            .json(body)
            .send()
            .await;
        timer.observe_duration();

        match response {
            Ok(response) => {
                self.metrics
                    .observe_status(&self.name, response.status().as_u16());
                Attempt::Done(response)
            }
            Err(e) => Attempt::Transport(e.to_string()),
        }
    }

    async fn interpret_legacy_response(
        &self,
        response: reqwest::Response,
        devices: &[Device],
    ) -> Vec<Outcome> {
        let status = response.status().as_u16();
        let retry_after = retry::retry_after_from(&response);

        match status {
            200..=299 => {}
            401 => {
                warn!(app = %self.name, "FCM refused our API key");
                self.degraded.trip();
                return vec![Outcome::retryable("credential rejection"); devices.len()];
            }
            404 => {
                info!(app = %self.name, "404 from FCM; assuming unregistered");
                return vec![Outcome::rejected("unregistered"); devices.len()];
            }
            400..=499 => {
                warn!(app = %self.name, status, "FCM rejected our request");
                return vec![
                    Outcome::rejected(format!("{status} from FCM"));
                    devices.len()
                ];
            }
            _ => {
                return vec![
                    Outcome::Retryable {
                        reason: format!("{status} from FCM"),
                        retry_after,
                    };
                    devices.len()
                ];
            }
        }

        let parsed: LegacyResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(app = %self.name, error = %e, "Invalid JSON in FCM response");
                return vec![Outcome::retryable("invalid FCM response"); devices.len()];
            }
        };

        if parsed.results.len() < devices.len() {
            warn!(
                app = %self.name,
                sent = devices.len(),
                received = parsed.results.len(),
                "FCM returned fewer results than registration ids"
            );
        }

        devices
            .iter()
            .enumerate()
            .map(|(i, device)| match parsed.results.get(i) {
                Some(result) => self.interpret_legacy_result(result, device),
                None => Outcome::retryable("missing result from FCM"),
            })
            .collect()
    }

    fn interpret_legacy_result(&self, result: &LegacyResult, device: &Device) -> Outcome {
        if let Some(error) = &result.error {
            if REJECT_ERRORS.contains(&error.as_str()) {
                info!(
                    app = %self.name,
                    error = %error,
                    "Registration ID permanently failed; rejecting upstream"
                );
                return Outcome::rejected(error.clone());
            }
            if RETRY_ERRORS.contains(&error.as_str()) {
                return Outcome::retryable(error.clone());
            }
            debug!(app = %self.name, error = %error, "Unrecognized FCM result error");
            return Outcome::retryable(error.clone());
        }

        if let Some(canonical) = &result.registration_id {
            info!(
                app = %self.name,
                pushkey = %device.pushkey,
                canonical = %canonical,
                "FCM reports an updated canonical registration ID"
            );
        }
        if result.message_id.is_none() {
            debug!(app = %self.name, "FCM result carried neither message_id nor error");
        }
        Outcome::Delivered
    }

    async fn interpret_v1_response(
        &self,
        response: reqwest::Response,
        _device: &Device,
    ) -> Outcome {
        let status = response.status().as_u16();
        let retry_after = retry::retry_after_from(&response);
        let body = response.text().await.unwrap_or_default();

        match status {
            200..=299 => Outcome::Delivered,
            404 => Outcome::rejected("unregistered"),
            401 => {
                warn!(app = %self.name, "FCM refused our access token");
                self.degraded.trip();
                Outcome::retryable("credential rejection")
            }
            429 => Outcome::Retryable {
                reason: "quota exceeded".to_string(),
                retry_after,
            },
            400..=499 if body.contains("UNREGISTERED") => Outcome::rejected("UNREGISTERED"),
            400..=499 => {
                warn!(app = %self.name, status, body = %body, "FCM rejected our request");
                Outcome::rejected(format!("{status} from FCM"))
            }
            _ => Outcome::Retryable {
                reason: format!("{status} from FCM"),
                retry_after,
            },
        }
    }
}

#[async_trait]
impl Pushkin for FcmPushkin {
    fn name(&self) -> &str {
        &self.name
    }

    fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    async fn dispatch(&self, notification: &Notification, devices: &[Device]) -> Vec<Outcome> {
        if self.degraded.active() {
            return vec![
                Outcome::retryable("pushkin degraded after credential rejection");
                devices.len()
            ];
        }

        match &self.mode {
            FcmMode::Legacy { api_key } => {
                let mut outcomes = Vec::with_capacity(devices.len());
                for chunk in devices.chunks(MAX_REGISTRATION_IDS) {
                    outcomes.extend(self.dispatch_legacy_chunk(notification, chunk, api_key).await);
                }
                outcomes
            }
            FcmMode::V1 { project_id, .. } => {
                let futures = devices
                    .iter()
                    .map(|d| self.dispatch_v1_device(notification, d, project_id));
                futures::future::join_all(futures).await
            }
        }
    }
}

/// The upstream request priority: high for highlights and incoming calls.
fn request_priority(n: &Notification, devices: &[Device]) -> &'static str {
    let highlighted = devices.iter().any(|d| d.tweaks.highlight);
    if highlighted || n.event_type.as_deref() == Some("m.call.invite") {
        "high"
    } else {
        "normal"
    }
}

/// Flatten the notification into a string-valued data object over the
/// given default-payload base. Non-string values are JSON-stringified.
fn build_data(n: &Notification, base: &Map<String, Value>) -> Map<String, Value> {
    let mut data = Map::new();
    for (key, value) in base {
        data.insert(key.clone(), stringify(value));
    }

    let fields: [(&str, Option<&String>); 8] = [
        ("event_id", n.event_id.as_ref()),
        ("type", n.event_type.as_ref()),
        ("sender", n.sender.as_ref()),
        ("sender_display_name", n.sender_display_name.as_ref()),
        ("room_name", n.room_name.as_ref()),
        ("room_alias", n.room_alias.as_ref()),
        ("room_id", n.room_id.as_ref()),
        ("membership", n.membership.as_ref()),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            data.insert(key.to_string(), json!(value));
        }
    }

    if let Some(content) = &n.content {
        data.insert("content".to_string(), stringify(content));
    }

    data.insert(
        "prio".to_string(),
        json!(if n.prio.is_low() { "normal" } else { "high" }),
    );

    if let Some(unread) = n.unread {
        data.insert("unread".to_string(), json!(unread.to_string()));
    }
    if let Some(missed_calls) = n.missed_calls {
        data.insert("missed_calls".to_string(), json!(missed_calls.to_string()));
    }

    data
}

/// String values pass through; everything else becomes its JSON text.
fn stringify(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
impl FcmPushkin {
    /// Legacy-mode pushkin pointed at a mock server.
    pub(crate) fn test_instance_legacy(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: base_url.to_string(),
            mode: FcmMode::Legacy {
                api_key: "test-api-key".to_string(),
            },
            fcm_options: Map::new(),
            limiter: Limiter::new(DEFAULT_INFLIGHT_LIMIT),
            degraded: Degraded::default(),
            retry_config: RetryConfig {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
            },
            metrics: Metrics::new().unwrap(),
        }
    }

    /// v1-mode pushkin pointed at a mock server, with a pre-populated
    /// access token so no OAuth round-trip is needed.
    pub(crate) fn test_instance_v1(name: &str, base_url: &str) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: base_url.to_string(),
            mode: FcmMode::V1 {
                project_id: "test-project".to_string(),
                client_email: "test@test.iam.gserviceaccount.com".to_string(),
                encoding_key: EncodingKey::from_secret(b"unused"),
                token_uri: OAUTH_TOKEN_URL.to_string(),
                cached: RwLock::new(Some(CachedToken {
                    token: "test-access-token".to_string(),
                    expires_at: SystemTime::now() + Duration::from_secs(3600),
                })),
            },
            fcm_options: Map::new(),
            limiter: Limiter::new(DEFAULT_INFLIGHT_LIMIT),
            degraded: Degraded::default(),
            retry_config: RetryConfig {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
            },
            metrics: Metrics::new().unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn device(pushkey: &str) -> Device {
        Device {
            app_id: "com.example.android".to_string(),
            pushkey: pushkey.to_string(),
            pushkey_ts: 0,
            data: None,
            tweaks: Default::default(),
        }
    }

    fn notification(devices: Vec<Device>) -> Notification {
        Notification {
            event_id: Some("$evt:example.org".to_string()),
            room_id: Some("!room:example.org".to_string()),
            event_type: Some("m.room.message".to_string()),
            sender: Some("@alice:example.org".to_string()),
            content: Some(json!({ "msgtype": "m.text", "body": "hello" })),
            unread: Some(3),
            devices,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_legacy_mixed_results() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(header("Authorization", "key=test-api-key"))
            .and(body_partial_json(json!({
                "registration_ids": ["token-1", "token-2"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    { "message_id": "m1" },
                    { "error": "NotRegistered" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let n = notification(vec![device("token-1"), device("token-2")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(
            outcomes,
            vec![Outcome::Delivered, Outcome::rejected("NotRegistered")]
        );
    }

    #[tokio::test]
    async fn test_legacy_single_device_uses_to() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(body_partial_json(json!({ "to": "token-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "message_id": "m1" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes, vec![Outcome::Delivered]);
    }

    #[tokio::test]
    async fn test_legacy_5xx_is_retryable_with_retry_after() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).insert_header("retry-after", "120"),
            )
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(
            outcomes,
            vec![Outcome::Retryable {
                reason: "503 from FCM".to_string(),
                retry_after: Some(Duration::from_secs(120)),
            }]
        );
    }

    #[tokio::test]
    async fn test_legacy_canonical_id_is_delivered() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "message_id": "m1", "registration_id": "newer-token" }]
            })))
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes, vec![Outcome::Delivered]);
    }

    #[tokio::test]
    async fn test_v1_delivered() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project/messages:send"))
            .and(header("Authorization", "Bearer test-access-token"))
            .and(body_partial_json(json!({
                "message": { "token": "token-1" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/test-project/messages/1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_v1("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes, vec![Outcome::Delivered]);
    }

    #[tokio::test]
    async fn test_v1_503_is_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_v1("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert!(matches!(outcomes[0], Outcome::Retryable { .. }));
    }

    #[tokio::test]
    async fn test_v1_404_rejects() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_v1("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes, vec![Outcome::rejected("unregistered")]);
    }

    #[tokio::test]
    async fn test_401_degrades_pushkin() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let n = notification(vec![device("token-1")]);

        let outcomes = pushkin.dispatch(&n, &n.devices).await;
        assert!(matches!(outcomes[0], Outcome::Retryable { .. }));

        // Degraded: no second request reaches the server.
        let outcomes = pushkin.dispatch(&n, &n.devices).await;
        assert!(matches!(outcomes[0], Outcome::Retryable { .. }));
    }

    #[test]
    fn test_build_data_is_string_valued() {
        let n = notification(vec![device("token-1")]);
        let data = build_data(&n, &Map::new());

        for (key, value) in &data {
            assert!(value.is_string(), "field '{key}' is not a string");
        }

        assert_eq!(data["type"], "m.room.message");
        assert_eq!(data["prio"], "high");
        assert_eq!(data["unread"], "3");
        // Content is carried as its JSON text.
        let content: Value = serde_json::from_str(data["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["body"], "hello");
    }

    #[test]
    fn test_build_data_merges_default_payload_beneath() {
        let n = notification(vec![device("token-1")]);
        let mut base = Map::new();
        base.insert("custom".to_string(), json!("kept"));
        base.insert("type".to_string(), json!("overridden-by-derived"));

        let data = build_data(&n, &base);
        assert_eq!(data["custom"], "kept");
        assert_eq!(data["type"], "m.room.message");
    }

    #[test]
    fn test_request_priority() {
        let mut n = notification(vec![device("token-1")]);
        assert_eq!(request_priority(&n, &n.devices), "normal");

        n.event_type = Some("m.call.invite".to_string());
        assert_eq!(request_priority(&n, &n.devices), "high");

        n.event_type = Some("m.room.message".to_string());
        let mut highlighted = device("token-1");
        highlighted.tweaks.highlight = true;
        let n = notification(vec![highlighted]);
        assert_eq!(request_priority(&n, &n.devices), "high");
    }

    #[test]
    fn test_low_priority_notification_data_prio() {
        let mut n = notification(vec![device("token-1")]);
        n.prio = crate::notification::Priority::Low;
        let data = build_data(&n, &Map::new());
        assert_eq!(data["prio"], "normal");
    }

    #[tokio::test]
    async fn test_batching_chunks_large_device_lists() {
        let server = MockServer::start().await;

        // 1001 devices: two requests, 1000 + 1.
        let results_full: Vec<Value> =
            (0..1000).map(|_| json!({ "message_id": "m" })).collect();
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "priority": "normal" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": results_full
            })))
            .expect(2)
            .mount(&server)
            .await;

        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());
        let devices: Vec<Device> = (0..1001).map(|i| device(&format!("token-{i}"))).collect();
        let n = notification(devices);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes.len(), 1001);
        assert_eq!(outcomes[0], Outcome::Delivered);
        assert_eq!(outcomes[1000], Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_v1_priority_merges_into_configured_android_options() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "message": {
                    "android": { "collapse_key": "room", "priority": "normal" },
                    "token": "token-1"
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/test-project/messages/1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut pushkin = FcmPushkin::test_instance_v1("com.example.android", &server.uri());
        pushkin
            .fcm_options
            .insert("android".to_string(), json!({ "collapse_key": "room" }));

        let n = notification(vec![device("token-1")]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(outcomes, vec![Outcome::Delivered]);
    }

    #[tokio::test]
    async fn test_misconfigured_default_payload_rejects() {
        let server = MockServer::start().await;
        let pushkin = FcmPushkin::test_instance_legacy("com.example.android", &server.uri());

        let mut d = device("token-1");
        d.data = Some(crate::notification::DeviceData {
            default_payload: Some(json!("not an object")),
            ..Default::default()
        });
        let n = notification(vec![d]);
        let outcomes = pushkin.dispatch(&n, &n.devices).await;

        assert_eq!(
            outcomes,
            vec![Outcome::rejected("misconfigured default_payload")]
        );
    }
}
