use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::rules::Rule;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub cloudflare: bool,
    pub stealth: bool,
    pub admin_secret: String,
    pub ip_ratelimit: u32,
    pub fp_ratelimit: u32,
    pub fail_challenge_ratelimit: u32,
    pub max_log_length: usize,
    pub dedup_enabled: bool,
    pub upstream_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cloudflare: false,
            stealth: false,
            admin_secret: String::new(),
            ip_ratelimit: 300,
            fp_ratelimit: 150,
            fail_challenge_ratelimit: 40,
            max_log_length: 10,
            dedup_enabled: true,
            upstream_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    /// Origin base URL, e.g. `http://127.0.0.1:3000`.
    pub backend: String,
    #[serde(default = "default_stage")]
    pub stage: u8,
    #[serde(default)]
    pub stage_locked: bool,
    #[serde(default = "default_stage2_difficulty")]
    pub stage2_difficulty: usize,
    #[serde(default)]
    pub ip_info: bool,
    #[serde(default)]
    pub custom_rules: Vec<Rule>,
    #[serde(default = "default_rps_threshold")]
    pub rps_threshold: u32,
    #[serde(default = "default_bypass_rps_threshold")]
    pub bypass_rps_threshold: u32,
}

fn default_stage() -> u8 {
    1
}

fn default_stage2_difficulty() -> usize {
    5
}

fn default_rps_threshold() -> u32 {
    500
}

fn default_bypass_rps_threshold() -> u32 {
    200
}

/// TLS-fingerprint classification tables. The built-in tables cover
/// the major browsers and crawlers; config entries extend or override
/// them. Keys are fingerprint tokens as observed by the TLS acceptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub known: HashMap<String, String>,
    pub bots: HashMap<String, String>,
    pub forbidden: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub fingerprints: FingerprintConfig,
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.as_ref().display()))?;
    let mut config: Config =
        serde_json::from_str(&content).context("parsing config.json")?;

    if config.domains.is_empty() {
        anyhow::bail!("config.json defines no domains");
    }
    for domain in &config.domains {
        if domain.stage > 3 {
            anyhow::bail!("domain {}: stage must be 0..=3", domain.name);
        }
        if domain.stage2_difficulty == 0 || domain.stage2_difficulty >= 64 {
            anyhow::bail!("domain {}: stage2_difficulty must be 1..=63", domain.name);
        }
    }

    merge_builtin_fingerprints(&mut config.fingerprints);
    Ok(config)
}

/// One IP per line; blank lines and `#` comments are skipped.
pub fn load_ip_whitelist<P: AsRef<Path>>(path: P) -> anyhow::Result<HashSet<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn merge_builtin_fingerprints(tables: &mut FingerprintConfig) {
    let known = [
        ("771,4865-4866-4867-49195-49199", "Chrome"),
        ("771,4865-4867-4866-49195-49199", "Firefox"),
        ("771,4865-4866-4867-49196-49200", "Safari"),
        ("771,4865-4866-4867-49195-49200", "Edge"),
        ("772,4865-4866-4867-49195-49199", "Opera"),
    ];
    let bots = [
        ("771,4866-4867-4865-49196-49200", " (Googlebot)"),
        ("771,4866-4865-4867-49196-49200", " (Bingbot)"),
        ("771,4867-4865-4866-49196-49200", " (DuckDuckBot)"),
    ];
    for (fp, name) in known {
        tables
            .known
            .entry(fp.to_string())
            .or_insert_with(|| name.to_string());
    }
    for (fp, name) in bots {
        tables
            .bots
            .entry(fp.to_string())
            .or_insert_with(|| name.to_string());
    }
}
