use std::collections::HashMap;
use std::time::Duration;

/// Operational knobs the engine recognizes. Defaults suit a single-process
/// deployment; everything can be overridden from the environment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Per-frame execution budget, for runner frames and gateway calls.
    pub runner_deadline: Duration,
    /// Maximum claims one worker attempts per trigger.
    pub claim_batch_limit: usize,
    /// Number of parallel dispatcher workers.
    pub dispatcher_concurrency: usize,
    /// Fallback scan cadence when no self-trigger arrives.
    pub scan_interval: Duration,
    /// `service_name -> endpoint` for the module gateway.
    pub module_endpoints: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runner_deadline: Duration::from_secs(180),
            claim_batch_limit: 1,
            dispatcher_concurrency: 1,
            scan_interval: Duration::from_millis(1000),
            module_endpoints: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// `TASKRUN_MODULE_ENDPOINTS` is a comma-separated list of
    /// `service=url` pairs.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("TASKRUN_RUNNER_DEADLINE_SECS") {
            config.runner_deadline = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("TASKRUN_CLAIM_BATCH") {
            config.claim_batch_limit = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("TASKRUN_WORKERS") {
            config.dispatcher_concurrency = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("TASKRUN_SCAN_INTERVAL_MS") {
            config.scan_interval = Duration::from_millis(ms.max(10));
        }
        if let Ok(spec) = std::env::var("TASKRUN_MODULE_ENDPOINTS") {
            config.module_endpoints = parse_endpoint_map(&spec);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn parse_endpoint_map(spec: &str) -> HashMap<String, String> {
    spec.split(',')
        .filter_map(|pair| {
            let (service, url) = pair.split_once('=')?;
            let (service, url) = (service.trim(), url.trim());
            if service.is_empty() || url.is_empty() {
                return None;
            }
            Some((service.to_string(), url.to_string()))
        })
        .collect()
}
