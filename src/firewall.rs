use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::domains::{DomainData, DomainRegistry};
use crate::helpers::trim_time;

/// Buckets are kept for the current and the previous 10-second
/// window; anything older is discarded on rotation, so an event
/// counted in window W is gone by window W+2.
const WINDOW_SECS: u64 = 10;

#[derive(Default)]
pub struct WindowCounter {
    buckets: HashMap<u64, HashMap<String, u32>>,
}

impl WindowCounter {
    pub fn bump(&mut self, window: u64, key: &str) {
        *self
            .buckets
            .entry(window)
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    pub fn count(&self, key: &str) -> u32 {
        self.buckets
            .values()
            .filter_map(|bucket| bucket.get(key))
            .sum()
    }

    pub fn rotate(&mut self, window: u64) {
        self.buckets
            .retain(|&bucket_window, _| bucket_window + WINDOW_SECS >= window);
    }
}

/// Everything guarded by the firewall lock. Queries take the read
/// half, mutation the write half; the lock is never held across a
/// network call.
pub struct FirewallState {
    /// Current 10-second window. Advanced only by the monitor tick.
    pub window: u64,
    pub access_ips: WindowCounter,
    pub access_ips_cookie: WindowCounter,
    pub unk_fps: WindowCounter,
    /// remote_addr -> observed TLS fingerprint, fed by the acceptor.
    pub connections: HashMap<String, String>,
    pub domains: HashMap<String, DomainData>,
}

pub struct Firewall {
    state: RwLock<FirewallState>,
    known_fingerprints: HashMap<String, String>,
    bot_fingerprints: HashMap<String, String>,
    forbidden_fingerprints: HashMap<String, String>,
    max_log_length: usize,
}

/// Per-client counters read in one pass at the top of the pipeline.
pub struct ClientCounts {
    pub ip_count: u32,
    pub ip_count_cookie: u32,
    pub fp_count: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttackTransition {
    Started { stage: u8 },
    Ended { stage: u8 },
}

impl Firewall {
    pub fn new(config: &Config, now: u64) -> Self {
        let domains = config
            .domains
            .iter()
            .map(|domain| (domain.name.clone(), DomainData::new(domain)))
            .collect();

        Self {
            state: RwLock::new(FirewallState {
                window: trim_time(now),
                access_ips: WindowCounter::default(),
                access_ips_cookie: WindowCounter::default(),
                unk_fps: WindowCounter::default(),
                connections: HashMap::new(),
                domains,
            }),
            known_fingerprints: config.fingerprints.known.clone(),
            bot_fingerprints: config.fingerprints.bots.clone(),
            forbidden_fingerprints: config.fingerprints.forbidden.clone(),
            max_log_length: config.proxy.max_log_length,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FirewallState> {
        self.state.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FirewallState> {
        self.state.write().unwrap()
    }

    pub fn max_log_length(&self) -> usize {
        self.max_log_length
    }

    // Fingerprint tables are read-only after load, no lock needed.

    pub fn browser_label(&self, tls_fp: &str) -> &str {
        self.known_fingerprints
            .get(tls_fp)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn bot_label(&self, tls_fp: &str) -> &str {
        self.bot_fingerprints
            .get(tls_fp)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn forbidden_browser(&self, tls_fp: &str) -> Option<&str> {
        self.forbidden_fingerprints.get(tls_fp).map(String::as_str)
    }

    /// Seam for the TLS acceptor: called once per established
    /// connection with the observed fingerprint. Plain-HTTP
    /// deployments never populate the table; their requests carry an
    /// empty fingerprint, which classifies as no browser and is
    /// exempt from the unknown-fingerprint gate so unrelated clients
    /// never share one counter bucket.
    pub fn record_connection(&self, remote_addr: &str, tls_fp: &str) {
        self.write()
            .connections
            .insert(remote_addr.to_string(), tls_fp.to_string());
    }

    pub fn drop_connection(&self, remote_addr: &str) {
        self.write().connections.remove(remote_addr);
    }

    pub fn client_counts(&self, ip: &str, tls_fp: &str) -> ClientCounts {
        let state = self.read();
        ClientCounts {
            ip_count: state.access_ips.count(ip),
            ip_count_cookie: state.access_ips_cookie.count(ip),
            fp_count: state.unk_fps.count(tls_fp),
        }
    }

    /// Monitor tick: advance the window, discard stale buckets, roll
    /// the per-domain rates and drive stage escalation. The only
    /// writer that advances `window`. Returns attack transitions for
    /// logging outside the lock.
    pub fn tick(
        &self,
        now: u64,
        registry: &DomainRegistry,
    ) -> Vec<(String, AttackTransition)> {
        let mut transitions = Vec::new();
        let mut state = self.write();

        let window = trim_time(now);
        state.window = window;
        state.access_ips.rotate(window);
        state.access_ips_cookie.rotate(window);
        state.unk_fps.rotate(window);

        for (name, data) in state.domains.iter_mut() {
            let Some(settings) = registry.get(name) else {
                continue;
            };
            data.roll_rates();
            data.bypass_attack = data.bypassed_per_second > settings.bypass_rps_threshold;

            let over_threshold = data.requests_per_second > settings.rps_threshold;
            if over_threshold && !data.under_attack {
                data.under_attack = true;
                data.attack_start = Some(now);
                if !data.stage_locked && data.stage < 2 {
                    data.stage = 2;
                }
                transitions.push((name.clone(), AttackTransition::Started { stage: data.stage }));
            } else if !over_threshold && data.under_attack && !data.bypass_attack {
                data.under_attack = false;
                data.attack_start = None;
                if !data.stage_locked {
                    data.stage = settings.base_stage;
                }
                transitions.push((name.clone(), AttackTransition::Ended { stage: data.stage }));
            }
        }

        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn test_config(rps_threshold: u32) -> Config {
        let raw = format!(
            r#"{{
                "proxy": {{}},
                "domains": [{{
                    "name": "example.com",
                    "backend": "http://127.0.0.1:3000",
                    "stage": 1,
                    "rps_threshold": {rps_threshold},
                    "bypass_rps_threshold": 50
                }}]
            }}"#
        );
        let mut parsed: Config = serde_json::from_str(&raw).unwrap();
        parsed.fingerprints = config::FingerprintConfig::default();
        parsed
    }

    #[test]
    fn counter_sums_current_and_previous_window() {
        let mut counter = WindowCounter::default();
        counter.bump(1000, "1.2.3.4");
        counter.bump(1000, "1.2.3.4");
        counter.bump(1010, "1.2.3.4");
        assert_eq!(counter.count("1.2.3.4"), 3);
        assert_eq!(counter.count("9.9.9.9"), 0);
    }

    #[test]
    fn events_in_window_w_are_gone_by_w_plus_2() {
        let mut counter = WindowCounter::default();
        counter.bump(1000, "1.2.3.4");

        counter.rotate(1010);
        assert_eq!(counter.count("1.2.3.4"), 1);

        counter.rotate(1020);
        assert_eq!(counter.count("1.2.3.4"), 0);
    }

    #[test]
    fn tick_escalates_and_recovers_stage() {
        let cfg = test_config(10);
        let registry = DomainRegistry::new(&cfg.domains);
        let firewall = Firewall::new(&cfg, 1000);

        firewall
            .write()
            .domains
            .get_mut("example.com")
            .unwrap()
            .total_requests = 100;

        let transitions = firewall.tick(1001, &registry);
        assert_eq!(
            transitions,
            vec![(
                "example.com".to_string(),
                AttackTransition::Started { stage: 2 }
            )]
        );
        {
            let state = firewall.read();
            let data = &state.domains["example.com"];
            assert!(data.under_attack);
            assert_eq!(data.stage, 2);
            assert_eq!(data.attack_start, Some(1001));
        }

        // No new requests: rps falls to zero and the stage recovers.
        let transitions = firewall.tick(1002, &registry);
        assert_eq!(
            transitions,
            vec![(
                "example.com".to_string(),
                AttackTransition::Ended { stage: 1 }
            )]
        );
        let state = firewall.read();
        assert!(!state.domains["example.com"].under_attack);
        assert_eq!(state.domains["example.com"].stage, 1);
    }

    #[test]
    fn locked_stage_survives_attack_cycle() {
        let cfg = test_config(10);
        let registry = DomainRegistry::new(&cfg.domains);
        let firewall = Firewall::new(&cfg, 1000);
        {
            let mut state = firewall.write();
            let data = state.domains.get_mut("example.com").unwrap();
            data.stage_locked = true;
            data.stage = 3;
            data.total_requests = 100;
        }

        firewall.tick(1001, &registry);
        assert_eq!(firewall.read().domains["example.com"].stage, 3);

        firewall.tick(1002, &registry);
        assert_eq!(firewall.read().domains["example.com"].stage, 3);
    }

    #[test]
    fn connection_table_tracks_fingerprints() {
        let cfg = test_config(10);
        let firewall = Firewall::new(&cfg, 1000);
        firewall.record_connection("1.2.3.4:5555", "fp-chrome");
        assert_eq!(
            firewall.read().connections.get("1.2.3.4:5555").map(String::as_str),
            Some("fp-chrome")
        );
        firewall.drop_connection("1.2.3.4:5555");
        assert!(firewall.read().connections.get("1.2.3.4:5555").is_none());
    }
}
