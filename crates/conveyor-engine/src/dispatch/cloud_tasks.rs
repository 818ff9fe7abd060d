//! Google Cloud Tasks dispatcher client.
//!
//! This module provides [`CloudTasksClient`], the production
//! implementation of the [`DispatcherClient`] trait using Google Cloud
//! Tasks.
//!
//! ## Features
//!
//! - **Idempotent registration**: Uses `task_id/attempts` as the Cloud
//!   Tasks task name, so duplicate registrations of the same attempt are
//!   absorbed by the service
//! - **Queue creation**: Supports `auto_create_queues` with a retry
//!   configuration derived from the queue config
//! - **OIDC authentication**: Attaches a service-account OIDC token to
//!   deliveries when the queue is configured with one
//!
//! ## Usage
//!
//! This module is only functional when the `gcp` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! conveyor-engine = { version = "0.1", features = ["gcp"] }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the Cloud Tasks client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudTasksClientConfig {
    /// Maximum time the worker has to respond to a delivery
    /// (default: 30 minutes).
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Path to a service-account key file. When absent, credentials are
    /// discovered from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<String>,

    /// Inline JSON service-account credentials. Takes precedence over
    /// `key_filename`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for CloudTasksClientConfig {
    fn default() -> Self {
        Self {
            task_timeout: default_task_timeout(),
            key_filename: None,
            credentials: None,
        }
    }
}

impl CloudTasksClientConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delivery timeout.
    #[must_use]
    pub const fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the service-account key file.
    #[must_use]
    pub fn with_key_filename(mut self, path: impl Into<String>) -> Self {
        self.key_filename = Some(path.into());
        self
    }
}

// ============================================================================
// GCP Feature-Gated Implementation
// ============================================================================

#[cfg(feature = "gcp")]
mod gcp_impl {
    use super::{CloudTasksClientConfig, Duration};

    use async_trait::async_trait;
    use base64::Engine;
    use gcp_auth::TokenProvider;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    use crate::dispatch::{DeliveryPayload, DeliveryTarget, DispatcherClient, EnqueueOptions};
    use crate::error::{Error, Result};

    /// Google Cloud Tasks dispatcher client.
    ///
    /// ## Idempotency
    ///
    /// Registrations are named `{queue_path}/tasks/{task_id}_{attempts}`.
    /// Re-registering the same attempt returns `ALREADY_EXISTS`, which
    /// this client absorbs as success; a later attempt produces a
    /// distinct Cloud Tasks task.
    pub struct CloudTasksClient {
        config: CloudTasksClientConfig,
        token_provider: Arc<dyn TokenProvider>,
        client: reqwest::Client,
    }

    // Manual Debug implementation since TokenProvider doesn't implement Debug
    impl std::fmt::Debug for CloudTasksClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("CloudTasksClient")
                .field("config", &self.config)
                .field("token_provider", &"<TokenProvider>")
                .field("client", &self.client)
                .finish()
        }
    }

    /// Cloud Tasks API request body for creating a task.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct CreateTaskRequest {
        task: CloudTask,
    }

    /// Cloud Task resource.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct CloudTask {
        /// Task name, set for idempotency.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// HTTP request to execute.
        http_request: HttpRequest,
        /// Schedule time (optional).
        #[serde(skip_serializing_if = "Option::is_none")]
        schedule_time: Option<String>,
        /// Maximum time the worker has to respond.
        #[serde(skip_serializing_if = "Option::is_none")]
        dispatch_deadline: Option<String>,
    }

    /// HTTP request configuration for Cloud Tasks.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct HttpRequest {
        /// Target URL.
        url: String,
        /// HTTP method.
        http_method: String,
        /// Request headers.
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<std::collections::HashMap<String, String>>,
        /// Request body (base64 encoded).
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// OIDC token configuration.
        #[serde(skip_serializing_if = "Option::is_none")]
        oidc_token: Option<OidcToken>,
    }

    /// OIDC token configuration for authenticated deliveries.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct OidcToken {
        /// Service account email.
        service_account_email: String,
        /// Audience (the callback URL).
        #[serde(skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
    }

    /// Queue creation request body.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct CreateQueueRequest {
        name: String,
        retry_config: QueueRetryConfig,
    }

    /// Queue retry configuration.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct QueueRetryConfig {
        max_attempts: u32,
        min_backoff: String,
    }

    /// Cloud Tasks API error response.
    #[derive(Debug, Deserialize)]
    struct CloudTasksErrorResponse {
        error: CloudTasksError,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)] // Fields used for deserialization
    struct CloudTasksError {
        code: i32,
        message: String,
        status: String,
    }

    impl CloudTasksClient {
        /// Creates a new Cloud Tasks client.
        ///
        /// # Errors
        ///
        /// Returns an error if GCP authentication cannot be initialized
        /// or the HTTP client cannot be built.
        pub async fn new(config: CloudTasksClientConfig) -> Result<Self> {
            if config.task_timeout.is_zero() {
                return Err(Error::invalid_argument(
                    "task_timeout must be greater than zero",
                ));
            }

            let token_provider: Arc<dyn TokenProvider> =
                if let Some(credentials) = &config.credentials {
                    Arc::new(
                        gcp_auth::CustomServiceAccount::from_json(credentials).map_err(|e| {
                            Error::invalid_argument(format!("invalid GCP credentials: {e}"))
                        })?,
                    )
                } else if let Some(path) = &config.key_filename {
                    Arc::new(gcp_auth::CustomServiceAccount::from_file(path).map_err(|e| {
                        Error::invalid_argument(format!("invalid GCP key file: {e}"))
                    })?)
                } else {
                    gcp_auth::provider().await.map_err(|e| {
                        Error::dispatch(format!("failed to initialize GCP auth: {e}"))
                    })?
                };

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| Error::dispatch(format!("failed to create HTTP client: {e}")))?;

            Ok(Self {
                config,
                token_provider,
                client,
            })
        }

        /// Sanitizes a string for use as a Cloud Tasks task ID.
        ///
        /// Task IDs must start with a letter or underscore, contain only
        /// letters, numbers, underscores, and hyphens, and be at most
        /// 500 characters.
        pub(crate) fn sanitize_task_id(key: &str) -> String {
            let sanitized: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();

            if sanitized.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                format!("t_{sanitized}")
            } else {
                sanitized
            }
            .chars()
            .take(500)
            .collect()
        }

        /// Gets an access token for the Cloud Tasks API.
        async fn get_access_token(&self) -> Result<String> {
            let scopes = &["https://www.googleapis.com/auth/cloud-tasks"];
            let token = self
                .token_provider
                .token(scopes)
                .await
                .map_err(|e| Error::dispatch(format!("failed to get GCP access token: {e}")))?;

            Ok(token.as_str().to_string())
        }

        /// Formats a duration as a Cloud Tasks API duration string.
        pub(crate) fn format_duration(duration: Duration) -> String {
            let secs = duration.as_secs();
            let nanos = duration.subsec_nanos();
            if nanos == 0 {
                return format!("{secs}s");
            }

            let mut fractional = format!("{nanos:09}");
            while fractional.ends_with('0') {
                fractional.pop();
            }

            format!("{secs}.{fractional}s")
        }

        /// Formats a delay as an RFC 3339 schedule time.
        fn format_schedule_time(delay: Duration) -> String {
            let now = chrono::Utc::now();
            let scheduled = now + chrono::Duration::from_std(delay).unwrap_or_default();
            scheduled.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
        }

        fn map_error_response(status: reqwest::StatusCode, body: &str) -> Error {
            if let Ok(parsed) = serde_json::from_str::<CloudTasksErrorResponse>(body) {
                Error::dispatch(format!(
                    "Cloud Tasks API error: {} ({})",
                    parsed.error.message, parsed.error.status
                ))
            } else {
                Error::dispatch(format!("Cloud Tasks API error: {status} - {body}"))
            }
        }
    }

    #[async_trait]
    impl DispatcherClient for CloudTasksClient {
        async fn enqueue_http(
            &self,
            target: &DeliveryTarget,
            payload: &DeliveryPayload,
            options: EnqueueOptions,
        ) -> Result<()> {
            // Task name for idempotency: task id + attempt counter.
            let idempotency_key = format!("{}_{}", payload.task_id, payload.attempts);
            let task_name = format!(
                "{}/tasks/{}",
                target.queue_path,
                Self::sanitize_task_id(&idempotency_key)
            );

            let body_bytes = serde_json::to_vec(payload)
                .map_err(|e| Error::serialization(e.to_string()))?;
            let body_base64 = base64::engine::general_purpose::STANDARD.encode(&body_bytes);

            let oidc_token = target
                .service_account_email
                .as_ref()
                .map(|email| OidcToken {
                    service_account_email: email.clone(),
                    audience: Some(target.url.clone()),
                });

            let request = CreateTaskRequest {
                task: CloudTask {
                    name: Some(task_name),
                    http_request: HttpRequest {
                        url: target.url.clone(),
                        http_method: "POST".to_string(),
                        headers: Some({
                            let mut headers = std::collections::HashMap::new();
                            headers
                                .insert("Content-Type".to_string(), "application/json".to_string());
                            headers
                        }),
                        body: Some(body_base64),
                        oidc_token,
                    },
                    schedule_time: options.delay.map(Self::format_schedule_time),
                    dispatch_deadline: Some(Self::format_duration(self.config.task_timeout)),
                },
            };

            let access_token = self.get_access_token().await?;
            let api_url = format!(
                "https://cloudtasks.googleapis.com/v2/{}/tasks",
                target.queue_path
            );

            let response = self
                .client
                .post(&api_url)
                .bearer_auth(&access_token)
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::dispatch(format!("Cloud Tasks API request failed: {e}")))?;

            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 409 {
                // ALREADY_EXISTS: this attempt was registered before.
                return Ok(());
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            Err(Self::map_error_response(status, &error_body))
        }

        async fn create_queue(
            &self,
            queue_path: &str,
            max_retries: u32,
            retry_delay: Duration,
        ) -> Result<()> {
            let parent = queue_path
                .rsplit_once("/queues/")
                .map(|(parent, _)| parent)
                .ok_or_else(|| {
                    Error::invalid_argument(format!("malformed queue path '{queue_path}'"))
                })?;

            let request = CreateQueueRequest {
                name: queue_path.to_string(),
                retry_config: QueueRetryConfig {
                    max_attempts: max_retries,
                    min_backoff: Self::format_duration(retry_delay),
                },
            };

            let access_token = self.get_access_token().await?;
            let api_url = format!("https://cloudtasks.googleapis.com/v2/{parent}/queues");

            let response = self
                .client
                .post(&api_url)
                .bearer_auth(&access_token)
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::dispatch(format!("Cloud Tasks queue creation failed: {e}")))?;

            let status = response.status();

            if status.is_success() || status.as_u16() == 409 {
                // ALREADY_EXISTS is fine for auto-creation.
                return Ok(());
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            Err(Self::map_error_response(status, &error_body))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn sanitize_task_id_passes_clean_input_through() {
            assert_eq!(
                CloudTasksClient::sanitize_task_id("AARZ3NDEKTSV4RRFFQ69G5FAV_1"),
                "AARZ3NDEKTSV4RRFFQ69G5FAV_1"
            );
        }

        #[test]
        fn sanitize_task_id_prefixes_digit_start() {
            // ULIDs can start with a digit; the Cloud Tasks rule requires
            // a letter or underscore prefix.
            assert_eq!(CloudTasksClient::sanitize_task_id("0abc"), "t_0abc");
        }

        #[test]
        fn sanitize_task_id_special_chars() {
            assert_eq!(CloudTasksClient::sanitize_task_id("a@b#c$d"), "a_b_c_d");
        }

        #[test]
        fn format_duration_seconds_only() {
            assert_eq!(
                CloudTasksClient::format_duration(Duration::from_secs(10)),
                "10s"
            );
        }

        #[test]
        fn format_duration_subsecond() {
            assert_eq!(
                CloudTasksClient::format_duration(Duration::from_millis(1500)),
                "1.5s"
            );
            assert_eq!(
                CloudTasksClient::format_duration(Duration::new(1, 5_000_000)),
                "1.005s"
            );
        }
    }
}

// ============================================================================
// Non-GCP Placeholder Implementation
// ============================================================================

#[cfg(not(feature = "gcp"))]
mod placeholder_impl {
    use super::{CloudTasksClientConfig, Duration};

    use async_trait::async_trait;

    use crate::dispatch::{DeliveryPayload, DeliveryTarget, DispatcherClient, EnqueueOptions};
    use crate::error::{Error, Result};

    /// Placeholder Cloud Tasks client (GCP feature not enabled).
    ///
    /// This is a stub that returns errors indicating the `gcp` feature
    /// must be enabled for actual Cloud Tasks integration.
    #[derive(Debug)]
    pub struct CloudTasksClient {
        #[allow(dead_code)] // Kept so construction validates the config shape.
        config: CloudTasksClientConfig,
    }

    impl CloudTasksClient {
        /// Creates a new placeholder client.
        ///
        /// # Errors
        ///
        /// Returns an error if the configuration is invalid.
        pub async fn new(config: CloudTasksClientConfig) -> Result<Self> {
            if config.task_timeout.is_zero() {
                return Err(Error::invalid_argument(
                    "task_timeout must be greater than zero",
                ));
            }
            Ok(Self { config })
        }
    }

    #[async_trait]
    impl DispatcherClient for CloudTasksClient {
        async fn enqueue_http(
            &self,
            _target: &DeliveryTarget,
            _payload: &DeliveryPayload,
            _options: EnqueueOptions,
        ) -> Result<()> {
            Err(Error::dispatch(
                "CloudTasksClient requires the 'gcp' feature to be enabled. \
                 Add `conveyor-engine = { features = [\"gcp\"] }` to your Cargo.toml.",
            ))
        }

        async fn create_queue(
            &self,
            _queue_path: &str,
            _max_retries: u32,
            _retry_delay: Duration,
        ) -> Result<()> {
            Err(Error::dispatch(
                "CloudTasksClient requires the 'gcp' feature to be enabled",
            ))
        }
    }
}

// Re-export the appropriate implementation
#[cfg(feature = "gcp")]
pub use gcp_impl::CloudTasksClient;

#[cfg(not(feature = "gcp"))]
pub use placeholder_impl::CloudTasksClient;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CloudTasksClientConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(30 * 60));
        assert!(config.key_filename.is_none());
        assert!(config.credentials.is_none());
    }

    #[test]
    fn config_builder_pattern() {
        let config = CloudTasksClientConfig::new()
            .with_task_timeout(Duration::from_secs(60 * 60))
            .with_key_filename("/secrets/sa.json");

        assert_eq!(config.task_timeout, Duration::from_secs(3600));
        assert_eq!(config.key_filename.as_deref(), Some("/secrets/sa.json"));
    }

    #[tokio::test]
    async fn client_rejects_zero_timeout() {
        let result = CloudTasksClient::new(
            CloudTasksClientConfig::new().with_task_timeout(Duration::ZERO),
        )
        .await;
        assert!(result.is_err());
    }
}
