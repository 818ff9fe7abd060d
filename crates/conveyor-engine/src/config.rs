//! Engine and queue configuration.
//!
//! Configuration is serde-friendly (camelCase, humantime durations) so it
//! can be loaded from JSON or YAML by the embedding application. Unknown
//! fields are ignored, which keeps configs forward-compatible.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of delivery attempts for a new task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_retry_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_key_prefix() -> String {
    "conveyor:".to_string()
}

/// Fixed-window rate limit parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Maximum allowed requests per window. A value of zero denies all
    /// requests without opening a window.
    pub max_requests: u32,
    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Configuration for a single logical queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Logical queue name; tasks address queues by this name.
    pub name: String,

    /// Fully-qualified dispatcher queue path. Defaults to
    /// `projects/{project}/locations/{location}/queues/{name}` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Callback URL the dispatcher delivers task payloads to. Falls back
    /// to the engine-wide `default_processor_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_url: Option<String>,

    /// OIDC subject for dispatcher-to-callback authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_email: Option<String>,

    /// Per-queue ingress limit enforced by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimitConfig>,

    /// Default `max_attempts` for tasks added to this queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Retry backoff hint passed to the dispatcher at queue creation.
    #[serde(
        default = "default_retry_delay",
        with = "humantime_serde",
        skip_serializing_if = "is_default_retry_delay"
    )]
    pub retry_delay: Duration,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_retry_delay(d: &Duration) -> bool {
    *d == default_retry_delay()
}

impl QueueConfig {
    /// Creates a queue configuration with just a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            processor_url: None,
            service_account_email: None,
            rate_limiter: None,
            max_retries: None,
            retry_delay: default_retry_delay(),
        }
    }

    /// Sets the callback URL.
    #[must_use]
    pub fn with_processor_url(mut self, url: impl Into<String>) -> Self {
        self.processor_url = Some(url.into());
        self
    }

    /// Sets the OIDC service account.
    #[must_use]
    pub fn with_service_account(mut self, email: impl Into<String>) -> Self {
        self.service_account_email = Some(email.into());
        self
    }

    /// Sets the per-queue rate limit.
    #[must_use]
    pub const fn with_rate_limiter(mut self, config: RateLimitConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    /// Sets the default attempt cap for tasks added to this queue.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Returns the dispatcher queue path, deriving the conventional one
    /// when no explicit path is configured.
    #[must_use]
    pub fn queue_path(&self, project_id: &str, location: &str) -> String {
        self.path.clone().unwrap_or_else(|| {
            format!(
                "projects/{project_id}/locations/{location}/queues/{}",
                self.name
            )
        })
    }
}

/// Storage backend selection.
///
/// The `Redis` and `Mongo` variants require the corresponding cargo
/// feature; selecting them without the feature fails at engine build
/// time. Custom adapters are injected through the engine builder instead
/// of this enum.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageConfig {
    /// Process-local in-memory storage (testing and development).
    #[default]
    Memory,
    /// Redis-backed key-value storage.
    #[serde(rename_all = "camelCase")]
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379`.
        url: String,
        /// Prefix applied to every key.
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// MongoDB-backed document storage.
    #[serde(rename_all = "camelCase")]
    Mongo {
        /// Connection URI, e.g. `mongodb://127.0.0.1:27017`.
        uri: String,
        /// Database name.
        database: String,
    },
}

/// Dispatcher credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Path to a service-account key file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<String>,

    /// Inline JSON credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Dispatcher project identifier.
    pub project_id: String,

    /// Dispatcher location (e.g., "us-central1").
    pub location: String,

    /// Configured queues.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Whether the engine attempts dispatcher-side queue creation at build.
    #[serde(default)]
    pub auto_create_queues: bool,

    /// Engine-wide ingress limit applied before any per-queue limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rate_limiter: Option<RateLimitConfig>,

    /// Fallback callback URL for queues without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_processor_url: Option<String>,

    /// Dispatcher credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl EngineConfig {
    /// Creates a configuration with required dispatcher addressing.
    #[must_use]
    pub fn new(project_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: location.into(),
            queues: Vec::new(),
            storage: StorageConfig::Memory,
            auto_create_queues: false,
            global_rate_limiter: None,
            default_processor_url: None,
            auth: None,
        }
    }

    /// Adds a queue.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    /// Selects the storage backend.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the engine-wide rate limit.
    #[must_use]
    pub const fn with_global_rate_limiter(mut self, config: RateLimitConfig) -> Self {
        self.global_rate_limiter = Some(config);
        self
    }

    /// Sets the fallback callback URL.
    #[must_use]
    pub fn with_default_processor_url(mut self, url: impl Into<String>) -> Self {
        self.default_processor_url = Some(url.into());
        self
    }

    /// Enables dispatcher-side queue creation at engine build.
    #[must_use]
    pub const fn with_auto_create_queues(mut self, enabled: bool) -> Self {
        self.auto_create_queues = enabled;
        self
    }

    /// Looks up a queue by name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Returns the callback URL for a queue, applying the fallback.
    #[must_use]
    pub fn processor_url_for<'a>(&'a self, queue: &'a QueueConfig) -> Option<&'a str> {
        queue
            .processor_url
            .as_deref()
            .or(self.default_processor_url.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_path_derives_conventional_path() {
        let queue = QueueConfig::new("emails");
        assert_eq!(
            queue.queue_path("my-project", "us-central1"),
            "projects/my-project/locations/us-central1/queues/emails"
        );
    }

    #[test]
    fn queue_path_prefers_explicit_path() {
        let mut queue = QueueConfig::new("emails");
        queue.path = Some("projects/p/locations/l/queues/custom".into());
        assert_eq!(
            queue.queue_path("my-project", "us-central1"),
            "projects/p/locations/l/queues/custom"
        );
    }

    #[test]
    fn config_builder_pattern() {
        let config = EngineConfig::new("my-project", "us-central1")
            .with_queue(
                QueueConfig::new("emails")
                    .with_processor_url("https://worker.example.com/deliver")
                    .with_max_retries(5),
            )
            .with_global_rate_limiter(RateLimitConfig::new(100, Duration::from_secs(60)));

        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queue("emails").unwrap().max_retries, Some(5));
        assert!(config.queue("missing").is_none());
        assert_eq!(config.global_rate_limiter.unwrap().max_requests, 100);
    }

    #[test]
    fn processor_url_falls_back_to_default() {
        let config = EngineConfig::new("p", "l")
            .with_queue(QueueConfig::new("emails"))
            .with_default_processor_url("https://fallback.example.com");

        let queue = config.queue("emails").unwrap();
        assert_eq!(
            config.processor_url_for(queue),
            Some("https://fallback.example.com")
        );
    }

    #[test]
    fn storage_config_deserializes_tagged() {
        let json = r#"{"kind":"redis","url":"redis://localhost","keyPrefix":"cv:"}"#;
        let storage: StorageConfig = serde_json::from_str(json).unwrap();
        match storage {
            StorageConfig::Redis { url, key_prefix } => {
                assert_eq!(url, "redis://localhost");
                assert_eq!(key_prefix, "cv:");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn engine_config_roundtrips_through_json() {
        let config = EngineConfig::new("p", "l").with_queue(
            QueueConfig::new("emails")
                .with_rate_limiter(RateLimitConfig::new(3, Duration::from_secs(60))),
        );

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.queues[0].rate_limiter.unwrap().max_requests, 3);
    }
}
