//! Configuration for the worker, router and seeding binaries.
//!
//! Every value comes from an environment variable. Unset and blank values
//! fall back to defaults; values that are set but malformed are errors.

use std::collections::BTreeSet;
use std::time::Duration;

use keel_core::{Error, Result};
use keel_engine::jobs::DispatchConfig;

/// Default worker listen port.
pub const DEFAULT_WORKER_PORT: u16 = 8080;

/// Default router listen port.
pub const DEFAULT_ROUTER_PORT: u16 = 9000;

const DEFAULT_PARTITION_COUNT: u32 = 16;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listen port; `None` uses the binary's default.
    pub http_port: Option<u16>,
    /// Pretty logs instead of JSON.
    pub debug: bool,
    /// Worker identity announced to the router.
    pub worker_id: String,
    /// Address the router proxies to; derived from the port when unset.
    pub advertise_address: Option<String>,
    /// Router to register and heartbeat with.
    pub router_url: Option<String>,
    /// Number of workspace partitions.
    pub partition_count: u32,
    /// Partitions owned by this worker; `None` owns all of them.
    pub partitions: Option<BTreeSet<u32>>,
    /// Worker heartbeat period.
    pub heartbeat_interval: Duration,
    /// Time without a heartbeat before the router evicts a worker.
    pub worker_timeout: Duration,
    /// Workqueue claim batch size.
    pub dispatch_batch_size: usize,
    /// Workqueue lease duration.
    pub dispatch_lease: Duration,
    /// Periodic `workspace.tick` interval.
    pub tick_interval: Duration,
    /// Worker the seeding tool posts to.
    pub bootstrap_server: Option<String>,
    /// Workspace the seeding tool assigns to events that carry none.
    pub workspace_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: None,
            debug: false,
            worker_id: ulid::Ulid::new().to_string(),
            advertise_address: None,
            router_url: None,
            partition_count: DEFAULT_PARTITION_COUNT,
            partitions: None,
            heartbeat_interval: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(30),
            dispatch_batch_size: 10,
            dispatch_lease: Duration::from_secs(30),
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            bootstrap_server: None,
            workspace_id: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a set variable cannot be parsed or
    /// the resulting configuration is inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);
        let mut config = Self::default();

        config.http_port = env.u16("KEEL_HTTP_PORT")?;
        if let Some(debug) = env.bool("KEEL_DEBUG")? {
            config.debug = debug;
        }
        if let Some(worker_id) = env.string("KEEL_WORKER_ID") {
            config.worker_id = worker_id;
        }
        config.advertise_address = env.string("KEEL_ADVERTISE_ADDRESS");
        config.router_url = env
            .string("KEEL_ROUTER_URL")
            .map(|url| url.trim_end_matches('/').to_string());

        if let Some(count) = env.u32("KEEL_PARTITION_COUNT")? {
            config.partition_count = count;
        }
        if config.partition_count == 0 {
            return Err(Error::InvalidInput(
                "KEEL_PARTITION_COUNT must be greater than zero".into(),
            ));
        }
        if let Some(list) = env.string("KEEL_PARTITIONS") {
            config.partitions = Some(parse_partitions(
                "KEEL_PARTITIONS",
                &list,
                config.partition_count,
            )?);
        }

        if let Some(secs) = env.u64("KEEL_HEARTBEAT_INTERVAL_SECONDS")? {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env.u64("KEEL_WORKER_TIMEOUT_SECONDS")? {
            config.worker_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = env.usize("KEEL_DISPATCH_BATCH_SIZE")? {
            if size == 0 {
                return Err(Error::InvalidInput(
                    "KEEL_DISPATCH_BATCH_SIZE must be greater than zero".into(),
                ));
            }
            config.dispatch_batch_size = size;
        }
        if let Some(secs) = env.u64("KEEL_DISPATCH_LEASE_SECONDS")? {
            config.dispatch_lease = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env.i64("WORKSPACE_TICK_INTERVAL_SECONDS")? {
            config.tick_interval = tick_interval(secs);
        }

        config.bootstrap_server = env
            .string("BOOTSTRAP_SERVER")
            .map(|url| url.trim_end_matches('/').to_string());
        config.workspace_id = env.string("WORKSPACE_ID");

        Ok(config)
    }

    /// Listen port, or `default` when none is configured.
    #[must_use]
    pub fn port_or(&self, default: u16) -> u16 {
        self.http_port.unwrap_or(default)
    }

    /// Address announced to the router for a worker listening on `port`.
    #[must_use]
    pub fn advertise_address(&self, port: u16) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"))
    }

    /// Partitions owned by this worker, ascending.
    #[must_use]
    pub fn owned_partitions(&self) -> Vec<u32> {
        self.partitions.as_ref().map_or_else(
            || (0..self.partition_count).collect(),
            |set| set.iter().copied().collect(),
        )
    }

    /// Dispatch loop settings for this worker.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        let mut dispatch = DispatchConfig::new(self.worker_id.clone());
        dispatch.batch_size = self.dispatch_batch_size;
        dispatch.lease = chrono::Duration::from_std(self.dispatch_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        dispatch
    }
}

/// Non-positive intervals fall back to the default.
fn tick_interval(secs: i64) -> Duration {
    u64::try_from(secs)
        .ok()
        .filter(|s| *s > 0)
        .map_or(Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS), Duration::from_secs)
}

fn parse_partitions(name: &str, value: &str, count: u32) -> Result<BTreeSet<u32>> {
    let mut partitions = BTreeSet::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let partition = part.parse::<u32>().map_err(|e| {
            Error::InvalidInput(format!("{name} entries must be integers (got {part}): {e}"))
        })?;
        if partition >= count {
            return Err(Error::InvalidInput(format!(
                "{name} entry {partition} is out of range for {count} partitions"
            )));
        }
        partitions.insert(partition);
    }
    if partitions.is_empty() {
        return Err(Error::InvalidInput(format!(
            "{name} must list at least one partition"
        )));
    }
    Ok(partitions)
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn i64(&self, name: &str) -> Result<Option<i64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<i64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be an integer: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() -> Result<()> {
        let config = load(&[])?;
        assert_eq!(config.port_or(DEFAULT_WORKER_PORT), 8080);
        assert_eq!(config.port_or(DEFAULT_ROUTER_PORT), 9000);
        assert!(!config.debug);
        assert_eq!(config.partition_count, 16);
        assert_eq!(config.owned_partitions(), (0..16).collect::<Vec<_>>());
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.advertise_address(8080), "http://127.0.0.1:8080");
        assert!(!config.worker_id.is_empty());
        Ok(())
    }

    #[test]
    fn blank_values_are_treated_as_unset() -> Result<()> {
        let config = load(&[("KEEL_HTTP_PORT", "  "), ("KEEL_WORKER_ID", "")])?;
        assert_eq!(config.http_port, None);
        assert!(!config.worker_id.is_empty());
        Ok(())
    }

    #[test]
    fn values_are_parsed() -> Result<()> {
        let config = load(&[
            ("KEEL_HTTP_PORT", "8181"),
            ("KEEL_DEBUG", "yes"),
            ("KEEL_WORKER_ID", "worker-a"),
            ("KEEL_ROUTER_URL", "http://router:9000/"),
            ("KEEL_PARTITION_COUNT", "8"),
            ("KEEL_PARTITIONS", "3, 1,3"),
            ("KEEL_DISPATCH_BATCH_SIZE", "25"),
            ("KEEL_DISPATCH_LEASE_SECONDS", "45"),
            ("WORKSPACE_TICK_INTERVAL_SECONDS", "15"),
        ])?;
        assert_eq!(config.http_port, Some(8181));
        assert!(config.debug);
        assert_eq!(config.worker_id, "worker-a");
        assert_eq!(config.router_url.as_deref(), Some("http://router:9000"));
        assert_eq!(config.owned_partitions(), vec![1, 3]);
        assert_eq!(config.tick_interval, Duration::from_secs(15));

        let dispatch = config.dispatch_config();
        assert_eq!(dispatch.worker_id, "worker-a");
        assert_eq!(dispatch.batch_size, 25);
        assert_eq!(dispatch.lease, chrono::Duration::seconds(45));
        Ok(())
    }

    #[test]
    fn non_positive_tick_interval_uses_default() -> Result<()> {
        for raw in ["0", "-5"] {
            let config = load(&[("WORKSPACE_TICK_INTERVAL_SECONDS", raw)])?;
            assert_eq!(config.tick_interval, Duration::from_secs(60));
        }
        Ok(())
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = load(&[("KEEL_HTTP_PORT", "http")]).unwrap_err();
        let Error::InvalidInput(message) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("KEEL_HTTP_PORT"));

        assert!(load(&[("KEEL_PARTITION_COUNT", "0")]).is_err());
        assert!(load(&[("KEEL_PARTITIONS", "16")]).is_err());
        assert!(load(&[("KEEL_PARTITIONS", "a,b")]).is_err());
        assert!(load(&[("KEEL_DISPATCH_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_accepts_false_values() {
        assert!(!parse_bool("TEST", "false").unwrap());
        assert!(!parse_bool("TEST", "0").unwrap());
        assert!(!parse_bool("TEST", "no").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }
}
