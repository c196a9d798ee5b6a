use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, request::Parts, HeaderValue, Request, Response, StatusCode};

use crate::admin;
use crate::challenge::{self, ChallengeRequest};
use crate::dedup::{StartOutcome, WaitOutcome};
use crate::domains::{DomainLog, DomainSettings};
use crate::helpers::{current_ts, stage_to_str};
use crate::ipinfo::IpInfo;
use crate::metrics::ProxyMetrics;
use crate::rules::{self, RuleEnv};
use crate::token;
use crate::upstream::{self, ForwardIdentity};
use crate::AppState;

pub const PROXY_FINGERPRINT: &str = "S3LF_BU1LD_0R_M0D1F13D";

const CREDITS: &str = "BalooProxyX https://github.com/h1v9/balooProxyX;\nBased on BalooProxy: a Lightweight http reverse-proxy https://github.com/41Baloo/balooProxy. Protected by GNU GENERAL PUBLIC LICENSE Version 3, June 2007";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

struct ClientIdentity {
    ip: String,
    tls_fp: String,
    browser: String,
    bot: String,
}

/// Fields read from the domain state in the same lock pass that bumps
/// the per-request counters.
struct DomainSnapshot {
    stage: u8,
    stage_locked: bool,
    stage2_difficulty: usize,
    under_attack: bool,
    bypass_attack: bool,
    requests_per_second: u32,
    bypassed_per_second: u32,
}

/// Top-level per-request pipeline: domain lookup, identity, counters,
/// rate-limit gates, custom rules, token verification, challenge or
/// forward. Order is fixed; the first matching gate wins.
pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    ProxyMetrics::inc(&state.metrics.total_requests);

    let (parts, body) = request.into_parts();

    let host = host_of(&parts);
    let Some(settings) = state.domains.get(&host) else {
        ProxyMetrics::inc(&state.metrics.blocked_requests);
        return plain_text("404 Not Found");
    };

    let remote_addr = addr.to_string();
    let identity = extract_identity(&state, &parts, &addr, &remote_addr);
    let counts = state.firewall.client_counts(&identity.ip, &identity.tls_fp);

    // Static whitelist: no counters, no challenge, no self-identifying
    // headers.
    if state.ip_whitelist.contains(&identity.ip) {
        return forward(&state, &settings, parts, body, &identity).await;
    }

    let stealth = state.config.proxy.stealth;
    let block_txt = if stealth {
        "Blocked.\n"
    } else {
        "Blocked by BalooProxyX.\n"
    };
    let name_txt = if stealth { "" } else { "BalooProxyX " };

    // Count the hit and snapshot the domain in one write-lock pass.
    let snapshot = {
        let mut firewall = state.firewall.write();
        let window = firewall.window;
        firewall.access_ips.bump(window, &identity.ip);
        let Some(data) = firewall.domains.get_mut(&host) else {
            drop(firewall);
            ProxyMetrics::inc(&state.metrics.blocked_requests);
            return finalize(plain_text("404 Not Found"), stealth);
        };
        data.total_requests += 1;
        DomainSnapshot {
            stage: data.stage,
            stage_locked: data.stage_locked,
            stage2_difficulty: data.stage2_difficulty,
            under_attack: data.under_attack,
            bypass_attack: data.bypass_attack,
            requests_per_second: data.requests_per_second,
            bypassed_per_second: data.bypassed_per_second,
        }
    };

    let mut sus_lv = snapshot.stage;

    // Rate-limit gates, strictest signal first.
    if counts.ip_count_cookie > state.config.proxy.fail_challenge_ratelimit {
        ProxyMetrics::inc(&state.metrics.blocked_requests);
        return finalize(
            plain_text(&format!("{block_txt}You have been ratelimited. (R1)")),
            stealth,
        );
    }
    if counts.ip_count > state.config.proxy.ip_ratelimit {
        ProxyMetrics::inc(&state.metrics.blocked_requests);
        return finalize(
            plain_text(&format!("{block_txt}You have been ratelimited. (R2)")),
            stealth,
        );
    }
    // The unknown-fingerprint gate needs an observed fingerprint.
    // Without one (no TLS acceptor feeding the connection table)
    // every client would share the empty-key bucket and R3 would
    // block the whole site at once.
    if identity.browser.is_empty() && !identity.tls_fp.is_empty() {
        if counts.fp_count > state.config.proxy.fp_ratelimit {
            ProxyMetrics::inc(&state.metrics.blocked_requests);
            return finalize(
                plain_text(&format!("{block_txt}You have been ratelimited. (R3)")),
                stealth,
            );
        }
        let mut firewall = state.firewall.write();
        let window = firewall.window;
        firewall.unk_fps.bump(window, &identity.tls_fp);
    }
    if let Some(forbidden) = state.firewall.forbidden_browser(&identity.tls_fp) {
        ProxyMetrics::inc(&state.metrics.blocked_requests);
        return finalize(
            plain_text(&format!(
                "{block_txt}Your browser {forbidden} is not allowed."
            )),
            stealth,
        );
    }

    let ip_info = if settings.ip_info {
        state.ip_info.lookup(&identity.ip).await
    } else {
        IpInfo::unknown()
    };

    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let cookie_header = parts
        .headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !settings.custom_rules.is_empty() {
        let user_agent_lower = user_agent.to_lowercase();
        let version = format!("{:?}", parts.version);
        let env = RuleEnv {
            ip_src: &identity.ip,
            ip_country: &ip_info.country,
            ip_asn: &ip_info.asn,
            ip_engine: &identity.browser,
            ip_bot: &identity.bot,
            ip_fingerprint: &identity.tls_fp,
            ip_http_requests: i64::from(counts.ip_count),
            ip_challenge_requests: i64::from(counts.ip_count_cookie),
            http_host: &host,
            http_version: &version,
            http_method: parts.method.as_str(),
            http_url: path_and_query(&parts),
            http_query: parts.uri.query().unwrap_or(""),
            http_path: parts.uri.path(),
            http_user_agent: &user_agent_lower,
            http_cookie: &cookie_header,
            proxy_stage: i64::from(snapshot.stage),
            proxy_cloudflare: state.config.proxy.cloudflare,
            proxy_stage_locked: snapshot.stage_locked,
            proxy_attack: snapshot.under_attack,
            proxy_bypass_attack: snapshot.bypass_attack,
            proxy_rps: i64::from(snapshot.requests_per_second),
            proxy_rps_allowed: i64::from(snapshot.bypassed_per_second),
        };
        sus_lv = rules::evaluate(&settings.custom_rules, &env, sus_lv);
    }

    if sus_lv > 3 {
        ProxyMetrics::inc(&state.metrics.blocked_requests);
        // Stealth only swaps the block prefix; the level and base
        // stage are part of the reason either way.
        return finalize(
            plain_text(&format!(
                "{block_txt}Suspicious request of level {} (base {})",
                stage_to_str(sus_lv),
                snapshot.stage
            )),
            stealth,
        );
    }

    // Token lookup/issue. The identity key is rebuilt per request from
    // a pooled buffer; only cache misses allocate for the map insert.
    let secrets = state.secrets.current();
    let sus_str = stage_to_str(sus_lv);
    let mut key_buf = state.buffers.get(
        identity.ip.len()
            + identity.tls_fp.len()
            + user_agent.len()
            + secrets.hour_str.len()
            + sus_str.len(),
    );
    key_buf.push_str(&identity.ip);
    key_buf.push_str(&identity.tls_fp);
    key_buf.push_str(&user_agent);
    key_buf.push_str(&secrets.hour_str);
    let access_key_len = key_buf.len();
    key_buf.push_str(sus_str);

    let (token_value, pow_hash) = challenge::token_for(
        &state.token_cache,
        &secrets,
        &key_buf[..access_key_len],
        &key_buf,
        sus_lv,
        &state.metrics,
    );
    state.buffers.put(key_buf);

    let verified = sus_lv == 0 || token::cookie_matches(&cookie_header, &token_value);

    if !verified {
        {
            let mut firewall = state.firewall.write();
            let window = firewall.window;
            firewall.access_ips_cookie.bump(window, &identity.ip);
        }
        ProxyMetrics::inc(&state.metrics.challenges_issued);
        if cookie_header.contains(token::COOKIE_ATTRIBUTE) {
            ProxyMetrics::inc(&state.metrics.challenges_failed);
        }

        let challenge_request = ChallengeRequest {
            sus_lv,
            token: &token_value,
            pow_hash: pow_hash.as_deref(),
            ip: &identity.ip,
            request_uri: path_and_query(&parts),
            stage2_difficulty: snapshot.stage2_difficulty,
            name_txt,
        };
        let response = challenge::respond(
            &challenge_request,
            &state.templates,
            &state.captcha_cache,
            &state.metrics,
        );
        return finalize(response, stealth);
    }

    if sus_lv > 0 {
        ProxyMetrics::inc(&state.metrics.challenges_passed);
    }
    ProxyMetrics::inc(&state.metrics.bypassed_requests);

    // Access log for requests that passed the challenge.
    {
        let max_log_length = state.firewall.max_log_length();
        let mut firewall = state.firewall.write();
        if let Some(data) = firewall.domains.get_mut(&host) {
            data.bypassed_requests += 1;
            data.push_log(
                DomainLog {
                    time: current_ts(),
                    ip: identity.ip.clone(),
                    browser: identity.browser.clone(),
                    bot: identity.bot.clone(),
                    tls_fp: identity.tls_fp.clone(),
                    user_agent: user_agent.clone(),
                    path: path_and_query(&parts).to_string(),
                },
                max_log_length,
            );
        }
    }
    tracing::info!(
        target: "access",
        ip = %identity.ip,
        host = %host,
        path = %parts.uri.path(),
        browser = %identity.browser,
        "request passed verification"
    );

    // Reserved proxy paths, reachable only after verification.
    if let Some(response) = reserved_path(
        &state,
        &settings,
        &parts,
        &identity,
        &counts,
        &ip_info,
        sus_lv,
        stealth,
    ) {
        return finalize(response, stealth);
    }

    finalize(forward(&state, &settings, parts, body, &identity).await, stealth)
}

fn extract_identity(
    state: &AppState,
    parts: &Parts,
    addr: &SocketAddr,
    remote_addr: &str,
) -> ClientIdentity {
    if state.config.proxy.cloudflare {
        let ip = parts
            .headers
            .get("Cf-Connecting-Ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| addr.ip().to_string());
        return ClientIdentity {
            ip,
            tls_fp: "Cloudflare".to_string(),
            browser: "Cloudflare".to_string(),
            bot: String::new(),
        };
    }

    let tls_fp = state
        .firewall
        .read()
        .connections
        .get(remote_addr)
        .cloned()
        .unwrap_or_default();
    ClientIdentity {
        ip: addr.ip().to_string(),
        browser: state.firewall.browser_label(&tls_fp).to_string(),
        bot: state.firewall.bot_label(&tls_fp).to_string(),
        tls_fp,
    }
}

#[allow(clippy::too_many_arguments)]
fn reserved_path(
    state: &AppState,
    settings: &DomainSettings,
    parts: &Parts,
    identity: &ClientIdentity,
    counts: &crate::firewall::ClientCounts,
    ip_info: &IpInfo,
    sus_lv: u8,
    stealth: bool,
) -> Option<Response<Body>> {
    let path = parts.uri.path();
    let query = parts.uri.query().unwrap_or("");

    match path {
        "/_bProxy/stats" if !stealth => {
            let firewall = state.firewall.read();
            let data = firewall.domains.get(&settings.name)?;
            Some(plain_text(&format!(
                "Stage: {}\nTotal Requests: {}\nBypassed Requests: {}\nTotal R/s: {}\nBypassed R/s: {}\nProxy Fingerprint: {}",
                stage_to_str(data.stage),
                data.total_requests,
                data.bypassed_requests,
                data.requests_per_second,
                data.bypassed_per_second,
                PROXY_FINGERPRINT,
            )))
        }
        "/_bProxy/fingerprint" if !stealth => Some(plain_text(&format!(
            "IP: {}\nASN: {}\nCountry: {}\nIP Requests: {}\nIP Challenge Requests: {}\nSusLV: {}\nFingerprint: {}\nBrowser: {}{}",
            identity.ip,
            ip_info.asn,
            ip_info.country,
            counts.ip_count,
            counts.ip_count_cookie,
            sus_lv,
            identity.tls_fp,
            identity.browser,
            identity.bot,
        ))),
        "/_bProxy/verified" if !stealth => Some(plain_text("verified")),
        "/_bProxy/credits" if !stealth => Some(plain_text(CREDITS)),
        _ => {
            let admin_secret = &state.config.proxy.admin_secret;
            if !admin_secret.is_empty()
                && path == format!("/_bProxy/{admin_secret}/api/v1")
            {
                return Some(admin::process_v1(state, &settings.name, query));
            }
            None
        }
    }
}

/// Hand the request upstream, coalescing through the deduplicator
/// when the request surface allows it.
async fn forward(
    state: &AppState,
    settings: &DomainSettings,
    parts: Parts,
    body: Body,
    identity: &ClientIdentity,
) -> Response<Body> {
    // API v2 for whitelisted IPs only.
    if parts.uri.path().starts_with("/_bProxy/api/v2") {
        if state.ip_whitelist.contains(&identity.ip) {
            return admin::process_v2(
                state,
                &host_of(&parts),
                parts.uri.query().unwrap_or(""),
            );
        }
        return plain_text("404 Not Found");
    }

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            let mut response = plain_text("400 Bad Request");
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        }
    };

    if !state.dedup.should_dedupe(&parts.method, &parts.headers) {
        return call_upstream(state, settings, &parts, body_bytes, identity, None).await;
    }

    let host = host_of(&parts);
    let key = state.dedup.key(
        &parts.method,
        &host,
        parts.uri.path(),
        parts.uri.query().unwrap_or(""),
        &parts.headers,
    );

    match state.dedup.wait(&key).await {
        WaitOutcome::Completed(cached) => {
            ProxyMetrics::inc(&state.metrics.deduplicated_requests);
            return upstream::into_response(&cached);
        }
        // Producer failure or wait cap: proceed independently.
        WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
            return call_upstream(state, settings, &parts, body_bytes, identity, None).await;
        }
        WaitOutcome::NoPending => {}
    }

    match state.dedup.start(&key) {
        StartOutcome::Started => {
            call_upstream(state, settings, &parts, body_bytes, identity, Some(&key)).await
        }
        StartOutcome::AlreadyPending => {
            // Lost the registration race; join the winner once.
            match state.dedup.wait(&key).await {
                WaitOutcome::Completed(cached) => {
                    ProxyMetrics::inc(&state.metrics.deduplicated_requests);
                    upstream::into_response(&cached)
                }
                _ => call_upstream(state, settings, &parts, body_bytes, identity, None).await,
            }
        }
        StartOutcome::Overflow => {
            call_upstream(state, settings, &parts, body_bytes, identity, None).await
        }
    }
}

/// One upstream round-trip. When `dedup_key` is set this request is
/// the leader for that key: success fans the response out to every
/// waiter, failure cancels so waiters retry on their own.
async fn call_upstream(
    state: &AppState,
    settings: &DomainSettings,
    parts: &Parts,
    body_bytes: Vec<u8>,
    identity: &ClientIdentity,
    dedup_key: Option<&str>,
) -> Response<Body> {
    let result = state
        .upstream
        .forward(
            &settings.backend,
            parts.method.clone(),
            path_and_query(parts),
            &parts.headers,
            body_bytes,
            ForwardIdentity {
                ip: &identity.ip,
                tls_fp: &identity.tls_fp,
                browser: &identity.browser,
                bot: &identity.bot,
            },
        )
        .await;

    match result {
        Ok(cached) => {
            if let Some(key) = dedup_key {
                let waiters = state.dedup.complete(key, cached.clone());
                if waiters > 0 {
                    ProxyMetrics::add(&state.metrics.deduplication_savings, waiters as u64);
                }
            }
            upstream::into_response(&cached)
        }
        Err(error) => {
            if let Some(key) = dedup_key {
                state.dedup.cancel(key);
            }
            ProxyMetrics::inc(&state.metrics.upstream_errors);
            tracing::warn!(%error, backend = %settings.backend, "upstream request failed");
            upstream::bad_gateway()
        }
    }
}

fn host_of(parts: &Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_string()
}

fn path_and_query(parts: &Parts) -> &str {
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

fn plain_text(body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Version header on every self-generated response unless stealth.
fn finalize(mut response: Response<Body>, stealth: bool) -> Response<Body> {
    if !stealth {
        if let Ok(value) = HeaderValue::from_str(env!("CARGO_PKG_VERSION")) {
            response.headers_mut().insert("baloo-Proxy", value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::CaptchaCache;
    use crate::config;
    use crate::dedup::Deduplicator;
    use crate::domains::DomainRegistry;
    use crate::firewall::Firewall;
    use crate::helpers::BufferPool;
    use crate::ipinfo::NoopIpInfo;
    use crate::templates;
    use crate::token::{SecretStore, TokenCache};
    use crate::upstream::UpstreamClient;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn state_for(raw_config: &str) -> AppState {
        let loaded: config::Config = serde_json::from_str(raw_config).unwrap();
        let now = current_ts();
        AppState {
            firewall: Arc::new(Firewall::new(&loaded, now)),
            domains: Arc::new(DomainRegistry::new(&loaded.domains)),
            secrets: Arc::new(SecretStore::new()),
            token_cache: Arc::new(TokenCache::new()),
            captcha_cache: Arc::new(CaptchaCache::new()),
            dedup: Arc::new(Deduplicator::new(loaded.proxy.dedup_enabled)),
            upstream: Arc::new(UpstreamClient::new(Duration::from_secs(5)).unwrap()),
            metrics: Arc::new(ProxyMetrics::default()),
            templates: Arc::new(templates::init().unwrap()),
            buffers: Arc::new(BufferPool::new()),
            ip_info: Arc::new(NoopIpInfo),
            ip_whitelist: Arc::new(Default::default()),
            config: Arc::new(loaded),
        }
    }

    fn config_json(stage: u8, backend: &str, extra_proxy: &str) -> String {
        format!(
            r#"{{
                "proxy": {{ "port": 0{extra_proxy} }},
                "domains": [{{
                    "name": "example.com",
                    "backend": "{backend}",
                    "stage": {stage},
                    "stage2_difficulty": 4
                }}]
            }}"#
        )
    }

    /// Minimal origin: counts hits, answers a fixed body, closes.
    async fn spawn_origin(body: &'static str, delay_ms: u64) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_loop = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let hits = Arc::clone(&hits_for_loop);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut seen = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn request_for(method: Method, path: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "example.com")
            .header(header::USER_AGENT, "Mozilla/5.0 (test)");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(state: &AppState, ip: &str, request: Request<Body>) -> Response<Body> {
        let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
        handle(State(state.clone()), ConnectInfo(addr), request).await
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn unknown_host_is_answered_with_plain_404_body() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", ""));
        let request = Request::builder()
            .uri("/x")
            .header(header::HOST, "other.com")
            .body(Body::empty())
            .unwrap();
        let response = send(&state, "1.2.3.4", request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "404 Not Found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silent_stage1_redirect_then_pass() {
        let (backend, hits) = spawn_origin("origin-body", 0).await;
        let state = state_for(&config_json(1, &backend, ""));

        // First request: no cookie, expect the silent redirect.
        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/x");
        assert_eq!(
            response.headers().get("baloo-Proxy").unwrap(),
            env!("CARGO_PKG_VERSION")
        );
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("_1__bProxy_v="));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Second request replays the cookie and reaches the origin.
        let pair = cookie.split(';').next().unwrap();
        let response = send(
            &state,
            "1.2.3.4",
            request_for(Method::GET, "/x", &[("cookie", pair)]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "origin-body");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.metrics.snapshot().challenges_passed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_gets_hit_upstream_once() {
        let (backend, hits) = spawn_origin("static-css", 150).await;
        let state = state_for(&config_json(0, &backend, ""));

        let mut handles = Vec::new();
        for i in 0..5 {
            let state = state.clone();
            let ip = format!("10.0.0.{}", i + 1);
            handles.push(tokio::spawn(async move {
                let request = request_for(Method::GET, "/static.css", &[]);
                body_string(send(&state, &ip, request).await).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "static-css");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.deduplication_savings, 4);
        assert_eq!(snapshot.deduplicated_requests, 4);
    }

    #[tokio::test]
    async fn pow_page_reveals_salt_and_target() {
        let state = state_for(&config_json(2, "http://127.0.0.1:1", ""));
        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store, no-cache, must-revalidate, max-age=0"
        );

        // Recompute the expected token from the same identity tuple.
        let secrets = state.secrets.current();
        let access_key = format!("1.2.3.4{}{}", "Mozilla/5.0 (test)", secrets.hour_str);
        let expected = token::issue(&access_key, &secrets.js_otp);
        let html = body_string(response).await;
        assert!(html.contains(&expected[..expected.len() - 4]));
        assert!(html.contains(&token::sha256_hex(&expected)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pow_cookie_unlocks_forwarding() {
        let (backend, hits) = spawn_origin("after-pow", 0).await;
        let state = state_for(&config_json(2, &backend, ""));

        send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;

        let secrets = state.secrets.current();
        let access_key = format!("1.2.3.4{}{}", "Mozilla/5.0 (test)", secrets.hour_str);
        let token_value = token::issue(&access_key, &secrets.js_otp);
        let cookie = format!("__bProxy_v={token_value}");
        let response = send(
            &state,
            "1.2.3.4",
            request_for(Method::GET, "/x", &[("cookie", &cookie)]),
        )
        .await;
        assert_eq!(body_string(response).await, "after-pow");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn captcha_challenge_caches_under_secret_part() {
        let state = state_for(&config_json(3, "http://127.0.0.1:1", ""));
        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let html = body_string(response).await;
        assert!(html.contains("data:image/png;base64,"));

        let secrets = state.secrets.current();
        let access_key = format!("1.2.3.4{}{}", "Mozilla/5.0 (test)", secrets.hour_str);
        let token_value = token::issue(&access_key, &secrets.captcha_otp);
        assert!(state
            .captcha_cache
            .fetch(&token_value[..6], current_ts())
            .is_some());
        // The page exposes only the public remainder of the token.
        assert!(html.contains(&token_value[6..]));
        assert!(!html.contains(&token_value));
    }

    #[tokio::test]
    async fn r1_outranks_r2_and_skips_later_gates() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", ""));

        {
            let mut firewall = state.firewall.write();
            let window = firewall.window;
            for _ in 0..500 {
                firewall.access_ips.bump(window, "1.2.3.4");
            }
            for _ in 0..50 {
                firewall.access_ips_cookie.bump(window, "1.2.3.4");
            }
        }

        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let body = body_string(response).await;
        assert!(body.ends_with("You have been ratelimited. (R1)"));
        // R1 short-circuits: the unknown-FP bucket stays untouched.
        assert_eq!(state.firewall.read().unk_fps.count(""), 0);
    }

    #[tokio::test]
    async fn unknown_fingerprint_ratelimit_blocks_r3() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", r#", "fp_ratelimit": 100, "ip_ratelimit": 100000"#));
        state.firewall.record_connection("1.2.3.4:50000", "unindexed-fp");

        {
            let mut firewall = state.firewall.write();
            let window = firewall.window;
            for _ in 0..101 {
                firewall.unk_fps.bump(window, "unindexed-fp");
            }
        }

        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let body = body_string(response).await;
        assert!(body.ends_with("You have been ratelimited. (R3)"));
    }

    #[tokio::test]
    async fn unobserved_fingerprint_never_shares_a_bucket() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", ""));

        // No connection-table entry for these clients: the
        // unknown-fingerprint gate must stay out of the way instead
        // of funnelling everyone into the empty-key bucket.
        for i in 0..3 {
            let ip = format!("10.1.0.{}", i + 1);
            send(&state, &ip, request_for(Method::GET, "/x", &[])).await;
        }
        assert_eq!(state.firewall.read().unk_fps.count(""), 0);
    }

    #[tokio::test]
    async fn forbidden_fingerprint_is_named_in_block() {
        let raw = r#"{
            "proxy": { "port": 0 },
            "domains": [{ "name": "example.com", "backend": "http://127.0.0.1:1", "stage": 1 }],
            "fingerprints": { "forbidden": { "bad-fp": "HeadlessChrome" } }
        }"#;
        let state = state_for(raw);
        state.firewall.record_connection("1.2.3.4:50000", "bad-fp");

        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let body = body_string(response).await;
        assert!(body.ends_with("Your browser HeadlessChrome is not allowed."));
    }

    #[tokio::test]
    async fn custom_rule_block_reveals_level_and_base() {
        let raw = r#"{
            "proxy": { "port": 0 },
            "domains": [{
                "name": "example.com",
                "backend": "http://127.0.0.1:1",
                "stage": 1,
                "custom_rules": [
                    {"expression": {"contains": ["http.user_agent", "mozilla"]}, "action": 5}
                ]
            }]
        }"#;
        let state = state_for(raw);
        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let body = body_string(response).await;
        assert_eq!(
            body,
            "Blocked by BalooProxyX.\nSuspicious request of level 5+ (base 1)"
        );

        // Stealth swaps only the prefix; level and base stay.
        let stealth_raw = raw.replace(r#""port": 0"#, r#""port": 0, "stealth": true"#);
        let state = state_for(&stealth_raw);
        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        let body = body_string(response).await;
        assert_eq!(body, "Blocked.\nSuspicious request of level 5+ (base 1)");
    }

    #[tokio::test]
    async fn stealth_mode_hides_identity() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", r#", "stealth": true"#));

        {
            let mut firewall = state.firewall.write();
            let window = firewall.window;
            for _ in 0..50 {
                firewall.access_ips_cookie.bump(window, "1.2.3.4");
            }
        }

        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        assert!(response.headers().get("baloo-Proxy").is_none());
        let body = body_string(response).await;
        assert_eq!(body, "Blocked.\nYou have been ratelimited. (R1)");
    }

    #[tokio::test]
    async fn cloudflare_mode_uses_header_identity() {
        let raw = r#"{
            "proxy": { "port": 0, "cloudflare": true },
            "domains": [{ "name": "example.com", "backend": "http://127.0.0.1:1", "stage": 0 }]
        }"#;
        let state = state_for(raw);

        let response = send(
            &state,
            "172.68.0.1",
            request_for(Method::GET, "/_bProxy/fingerprint", &[("Cf-Connecting-Ip", "9.9.9.9")]),
        )
        .await;
        let body = body_string(response).await;
        assert!(body.contains("IP: 9.9.9.9"));
        assert!(body.contains("Fingerprint: Cloudflare"));
        // Cloudflare identity counts as a known browser, so the
        // unknown-fingerprint bucket is never touched.
        assert_eq!(state.firewall.read().unk_fps.count("Cloudflare"), 0);
    }

    #[tokio::test]
    async fn whitelisted_ip_skips_counters_and_challenges() {
        let (backend, hits) = spawn_origin("vip", 0).await;
        let mut state = state_for(&config_json(3, &backend, ""));
        state.ip_whitelist = Arc::new(["1.2.3.4".to_string()].into_iter().collect());

        let response = send(&state, "1.2.3.4", request_for(Method::GET, "/x", &[])).await;
        assert_eq!(body_string(response).await, "vip");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.firewall.read().access_ips.count("1.2.3.4"), 0);
    }

    #[tokio::test]
    async fn reserved_stats_path_reports_domain_state() {
        let state = state_for(&config_json(0, "http://127.0.0.1:1", ""));
        let response = send(
            &state,
            "1.2.3.4",
            request_for(Method::GET, "/_bProxy/stats", &[]),
        )
        .await;
        let body = body_string(response).await;
        assert!(body.starts_with("Stage: 0\n"));
        assert!(body.contains("Total Requests: 1"));
        assert!(body.contains(&format!("Proxy Fingerprint: {PROXY_FINGERPRINT}")));
    }

    #[tokio::test]
    async fn admin_api_sets_and_locks_stage() {
        let state = state_for(&config_json(1, "http://127.0.0.1:1", r#", "admin_secret": "s3cr3t", "stealth": false"#));

        // Wrong secret does not resolve to the API; with stage 1 and
        // no cookie the request is challenged instead.
        let response = send(
            &state,
            "1.2.3.4",
            request_for(Method::GET, "/_bProxy/wrong/api/v1?action=set_stage&stage=3", &[]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);

        // Pass the challenge, then drive the API.
        let secrets = state.secrets.current();
        let access_key = format!("1.2.3.4{}{}", "Mozilla/5.0 (test)", secrets.hour_str);
        let cookie = format!("__bProxy_v={}", token::issue(&access_key, &secrets.cookie_otp));
        let response = send(
            &state,
            "1.2.3.4",
            request_for(
                Method::GET,
                "/_bProxy/s3cr3t/api/v1?action=set_stage&stage=3",
                &[("cookie", &cookie)],
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"stage\":3"));
        {
            let firewall = state.firewall.read();
            assert_eq!(firewall.domains["example.com"].stage, 3);
            assert!(firewall.domains["example.com"].stage_locked);
        }
    }
}
