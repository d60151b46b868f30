//! Post-dispatch verification of jobs.
//!
//! A job agent may declare [`VerificationSpec`]s for a dispatched job. The
//! [`VerificationManager`] samples each metric through a [`MetricProvider`],
//! evaluates the success and failure conditions as CEL over `{result}`, and
//! reports progress as `job-verification.updated` events.
//!
//! A metric passes after `successThreshold` passing samples. It fails after
//! more than `failureLimit` failing samples, or when `count` samples are used
//! up without passing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::id::deterministic_ulid;
use keel_core::parallel::CancelFlag;
use keel_core::Clock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::{EventSink, EventType, RawEvent};
use crate::model::{JobVerification, Measurement, MetricStatus, VerificationMetric};
use crate::selector::{cache, cel};

/// Measurement timeout used when a spec does not set one.
pub const DEFAULT_MEASUREMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider selection and its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider type, e.g. `http` or `prometheus`.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Provider-specific settings.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// One metric to sample after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSpec {
    /// Metric name.
    pub name: String,
    /// Where samples come from.
    pub provider: ProviderSpec,
    /// CEL over `result`; true marks a passing sample.
    pub success_condition: String,
    /// CEL over `result`; true marks a failing sample. Defaults to "not passing".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,
    /// Delay between samples.
    #[serde(default)]
    pub interval_seconds: u64,
    /// Maximum number of samples.
    pub count: u32,
    /// Passing samples needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    /// Failing samples tolerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_limit: Option<u32>,
    /// Per-sample timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl VerificationSpec {
    fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(1).max(1)
    }

    fn failure_limit(&self) -> u32 {
        self.failure_limit.unwrap_or(0)
    }

    fn timeout(&self) -> Duration {
        self.timeout_seconds
            .map_or(DEFAULT_MEASUREMENT_TIMEOUT, Duration::from_secs)
    }

    /// Compiles both conditions.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the malformed condition.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::validation(format!("metric '{}' has count 0", self.name)));
        }
        for condition in std::iter::once(&self.success_condition).chain(self.failure_condition.iter()) {
            cache::program(condition).map_err(|e| {
                Error::validation(format!("metric '{}' condition '{condition}': {e}", self.name))
            })?;
        }
        Ok(())
    }
}

/// Source of measurement samples.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Type string matched against [`ProviderSpec::provider_type`].
    fn provider_type(&self) -> &'static str;

    /// Takes one sample.
    async fn measure(&self, config: &Map<String, Value>) -> Result<Value>;
}

fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation(format!("provider config requires string '{key}'")))
}

/// Issues an HTTP request; the result is `{statusCode, ok, body}`.
#[derive(Debug, Clone, Default)]
pub struct HttpProvider {
    client: reqwest::Client,
}

impl HttpProvider {
    /// Creates a provider with its own client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricProvider for HttpProvider {
    fn provider_type(&self) -> &'static str {
        "http"
    }

    async fn measure(&self, config: &Map<String, Value>) -> Result<Value> {
        let url = config_str(config, "url")?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|e| Error::validation(format!("invalid http method: {e}")))?;

        let mut request = self.client.request(method, url);
        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        if let Some(body) = config.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::evaluation(format!("http measurement failed: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::evaluation(format!("failed reading http measurement body: {e}")))?;
        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
        Ok(json!({
            "statusCode": status.as_u16(),
            "ok": status.is_success(),
            "body": body,
        }))
    }
}

/// Runs an instant query; the result is `{value, data}` where `value` is the
/// first sample as a float.
#[derive(Debug, Clone, Default)]
pub struct PrometheusProvider {
    client: reqwest::Client,
}

impl PrometheusProvider {
    /// Creates a provider with its own client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricProvider for PrometheusProvider {
    fn provider_type(&self) -> &'static str {
        "prometheus"
    }

    async fn measure(&self, config: &Map<String, Value>) -> Result<Value> {
        let address = config_str(config, "address")?;
        let query = config_str(config, "query")?;
        let url = format!("{}/api/v1/query", address.trim_end_matches('/'));

        let response = self
            .client
            .get(url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| Error::evaluation(format!("prometheus query failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::evaluation(format!(
                "prometheus query returned {}",
                response.status()
            )));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|e| Error::evaluation(format!("invalid prometheus response: {e}")))?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        Ok(json!({
            "value": first_sample(&data),
            "data": data,
        }))
    }
}

/// Extracts the first sample of a vector or scalar result.
fn first_sample(data: &Value) -> Value {
    let sample = match data.get("resultType").and_then(Value::as_str) {
        Some("vector") => data.pointer("/result/0/value/1"),
        Some("scalar") => data.pointer("/result/1"),
        _ => None,
    };
    sample
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
        .unwrap_or(Value::Null)
}

/// Waits `durationMs` then reports `{ok: true}`. Used in tests and demos.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepProvider;

#[async_trait]
impl MetricProvider for SleepProvider {
    fn provider_type(&self) -> &'static str {
        "sleep"
    }

    async fn measure(&self, config: &Map<String, Value>) -> Result<Value> {
        let ms = config.get("durationMs").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({"ok": true, "durationMs": ms}))
    }
}

fn condition_holds(condition: &str, result: &Value) -> Result<bool> {
    let program = cache::program(condition)
        .map_err(|e| Error::evaluation(format!("invalid condition '{condition}': {e}")))?;
    let activation = cel::Activation::new().bind("result", result);
    Ok(program.evaluate_bool(&activation).unwrap_or(false))
}

/// Samples verification metrics and reports their progress.
#[derive(Clone)]
pub struct VerificationManager {
    providers: HashMap<String, Arc<dyn MetricProvider>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for VerificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationManager")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl VerificationManager {
    /// Creates a manager with no providers.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: HashMap::new(),
            sink,
            clock,
        }
    }

    /// Creates a manager with the `http`, `prometheus` and `sleep` providers.
    #[must_use]
    pub fn with_default_providers(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_MEASUREMENT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(sink, clock)
            .with_provider(Arc::new(HttpProvider::new(client.clone())))
            .with_provider(Arc::new(PrometheusProvider::new(client)))
            .with_provider(Arc::new(SleepProvider))
    }

    /// Registers a provider, replacing any with the same type.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn MetricProvider>) -> Self {
        self.providers
            .insert(provider.provider_type().to_string(), provider);
        self
    }

    /// Samples every metric of `specs` for `job_id` until each passes or fails.
    ///
    /// Metrics run concurrently. Every sample is reported as a
    /// `job-verification.updated` event carrying the whole record.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed specs or unknown providers,
    /// [`Error::Cancelled`] if `cancel` is raised, or the sink's error.
    #[tracing::instrument(skip(self, specs, cancel), fields(metrics = specs.len()))]
    pub async fn verify(
        &self,
        workspace_id: &str,
        job_id: &str,
        specs: Vec<VerificationSpec>,
        cancel: CancelFlag,
    ) -> Result<JobVerification> {
        for spec in &specs {
            spec.validate()?;
            if !self.providers.contains_key(&spec.provider.provider_type) {
                return Err(Error::validation(format!(
                    "unknown metric provider '{}'",
                    spec.provider.provider_type
                )));
            }
        }

        let now = self.clock.now();
        let record = Arc::new(Mutex::new(JobVerification {
            id: deterministic_ulid(now.timestamp_millis(), &format!("verification:{job_id}")),
            job_id: job_id.to_string(),
            created_at: now,
            metrics: specs
                .iter()
                .map(|spec| VerificationMetric {
                    name: spec.name.clone(),
                    status: MetricStatus::Running,
                    measurements: Vec::new(),
                })
                .collect(),
        }));

        let runs = specs.iter().enumerate().map(|(index, spec)| {
            self.run_metric(workspace_id, index, spec, Arc::clone(&record), cancel.clone())
        });
        futures::future::try_join_all(runs).await?;

        let done = record.lock().await.clone();
        Ok(done)
    }

    async fn run_metric(
        &self,
        workspace_id: &str,
        index: usize,
        spec: &VerificationSpec,
        record: Arc<Mutex<JobVerification>>,
        cancel: CancelFlag,
    ) -> Result<()> {
        let provider = self
            .providers
            .get(&spec.provider.provider_type)
            .ok_or_else(|| Error::validation(format!("unknown metric provider '{}'", spec.provider.provider_type)))?;

        let (mut passes, mut failures) = (0u32, 0u32);
        for sample in 0..spec.count {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if sample > 0 && spec.interval_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(spec.interval_seconds)).await;
            }

            let data = match tokio::time::timeout(spec.timeout(), provider.measure(&spec.provider.config)).await {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => json!({"error": e.to_string()}),
                Err(_) => json!({"error": "measurement timed out"}),
            };
            let passed = data.get("error").is_none() && condition_holds(&spec.success_condition, &data)?;
            let failed = match &spec.failure_condition {
                Some(condition) if data.get("error").is_none() => condition_holds(condition, &data)?,
                _ => !passed,
            };
            if passed {
                passes += 1;
            }
            if failed {
                failures += 1;
            }

            let status = if failures > spec.failure_limit() {
                MetricStatus::Failed
            } else if passes >= spec.success_threshold() {
                MetricStatus::Passed
            } else if sample + 1 == spec.count {
                MetricStatus::Failed
            } else {
                MetricStatus::Running
            };

            let snapshot = {
                let mut guard = record.lock().await;
                if let Some(metric) = guard.metrics.get_mut(index) {
                    metric.measurements.push(Measurement {
                        measured_at: self.clock.now(),
                        passed,
                        data,
                    });
                    metric.status = status;
                }
                guard.clone()
            };
            let event = RawEvent::new(
                EventType::JobVerificationUpdated,
                workspace_id,
                &snapshot,
                self.clock.now_millis(),
            )?;
            self.sink.submit(event).await?;

            if status != MetricStatus::Running {
                tracing::debug!(metric = %spec.name, ?status, samples = sample + 1, "verification metric settled");
                break;
            }
        }
        Ok(())
    }
}
