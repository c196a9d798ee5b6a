use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::DomainConfig;
use crate::rules::Rule;

/// One access-log line for a request that passed verification.
#[derive(Debug, Clone, Serialize)]
pub struct DomainLog {
    pub time: u64,
    pub ip: String,
    pub browser: String,
    pub bot: String,
    pub tls_fp: String,
    pub user_agent: String,
    pub path: String,
}

/// Mutable per-domain state. Lives under the firewall lock for the
/// process lifetime.
pub struct DomainData {
    pub stage: u8,
    pub stage_locked: bool,
    pub stage2_difficulty: usize,

    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub requests_per_second: u32,
    pub bypassed_per_second: u32,

    pub under_attack: bool,
    pub attack_start: Option<u64>,
    pub bypass_attack: bool,

    pub last_logs: VecDeque<DomainLog>,

    // Totals at the previous monitor tick, for the per-second deltas.
    last_total: u64,
    last_bypassed: u64,
}

impl DomainData {
    pub fn new(config: &DomainConfig) -> Self {
        Self {
            stage: config.stage,
            stage_locked: config.stage_locked,
            stage2_difficulty: config.stage2_difficulty,
            total_requests: 0,
            bypassed_requests: 0,
            requests_per_second: 0,
            bypassed_per_second: 0,
            under_attack: false,
            attack_start: None,
            bypass_attack: false,
            last_logs: VecDeque::new(),
            last_total: 0,
            last_bypassed: 0,
        }
    }

    pub fn push_log(&mut self, entry: DomainLog, max_length: usize) {
        while self.last_logs.len() >= max_length {
            self.last_logs.pop_front();
        }
        self.last_logs.push_back(entry);
    }

    /// Recompute the per-second rates from the totals. Called once a
    /// second by the monitor tick, under the firewall write lock.
    pub fn roll_rates(&mut self) {
        self.requests_per_second = (self.total_requests - self.last_total) as u32;
        self.bypassed_per_second = (self.bypassed_requests - self.last_bypassed) as u32;
        self.last_total = self.total_requests;
        self.last_bypassed = self.bypassed_requests;
    }
}

/// Read-mostly per-domain settings, fixed after config load.
pub struct DomainSettings {
    pub name: String,
    pub backend: String,
    pub base_stage: u8,
    pub ip_info: bool,
    pub custom_rules: Vec<Rule>,
    pub rps_threshold: u32,
    pub bypass_rps_threshold: u32,
}

pub struct DomainRegistry {
    map: DashMap<String, Arc<DomainSettings>>,
}

impl DomainRegistry {
    pub fn new(configs: &[DomainConfig]) -> Self {
        let map = DashMap::new();
        for config in configs {
            map.insert(
                config.name.clone(),
                Arc::new(DomainSettings {
                    name: config.name.clone(),
                    backend: config.backend.trim_end_matches('/').to_string(),
                    base_stage: config.stage,
                    ip_info: config.ip_info,
                    custom_rules: config.custom_rules.clone(),
                    rps_threshold: config.rps_threshold,
                    bypass_rps_threshold: config.bypass_rps_threshold,
                }),
            );
        }
        Self { map }
    }

    pub fn get(&self, host: &str) -> Option<Arc<DomainSettings>> {
        self.map.get(host).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_config() -> DomainConfig {
        serde_json::from_str(
            r#"{"name": "example.com", "backend": "http://127.0.0.1:3000/"}"#,
        )
        .unwrap()
    }

    #[test]
    fn log_ring_is_bounded() {
        let mut data = DomainData::new(&domain_config());
        for i in 0..25 {
            data.push_log(
                DomainLog {
                    time: i,
                    ip: "1.2.3.4".into(),
                    browser: "Chrome".into(),
                    bot: String::new(),
                    tls_fp: "fp".into(),
                    user_agent: "ua".into(),
                    path: format!("/{i}"),
                },
                10,
            );
        }
        assert_eq!(data.last_logs.len(), 10);
        assert_eq!(data.last_logs.front().unwrap().time, 15);
        assert_eq!(data.last_logs.back().unwrap().time, 24);
    }

    #[test]
    fn rates_roll_from_deltas() {
        let mut data = DomainData::new(&domain_config());
        data.total_requests = 100;
        data.bypassed_requests = 40;
        data.roll_rates();
        assert_eq!(data.requests_per_second, 100);
        assert_eq!(data.bypassed_per_second, 40);

        data.total_requests = 130;
        data.bypassed_requests = 45;
        data.roll_rates();
        assert_eq!(data.requests_per_second, 30);
        assert_eq!(data.bypassed_per_second, 5);
    }

    #[test]
    fn registry_strips_trailing_backend_slash() {
        let registry = DomainRegistry::new(&[domain_config()]);
        let settings = registry.get("example.com").unwrap();
        assert_eq!(settings.backend, "http://127.0.0.1:3000");
        assert!(registry.get("other.com").is_none());
    }
}
