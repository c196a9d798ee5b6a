use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

use crate::domains::DomainLog;
use crate::AppState;

#[derive(Serialize)]
struct DomainStatusResp {
    domain: String,
    stage: u8,
    stage_locked: bool,
    stage2_difficulty: usize,
    total_requests: u64,
    bypassed_requests: u64,
    requests_per_second: u32,
    bypassed_per_second: u32,
    under_attack: bool,
    attack_start: Option<u64>,
}

#[derive(Serialize)]
struct ErrorResp {
    error: &'static str,
}

#[derive(Serialize)]
struct OkResp {
    ok: bool,
    stage: u8,
    stage_locked: bool,
}

/// Admin API behind `/_bProxy/<AdminSecret>/api/v1`. The secret in
/// the path is the authentication; knowing it grants mutation.
pub fn process_v1(state: &AppState, host: &str, query: &str) -> Response<Body> {
    let action = query_param(query, "action").unwrap_or_default();
    match action.as_str() {
        "stats" => domain_stats(state, host),
        "logs" => domain_logs(state, host),
        "metrics" => json(StatusCode::OK, &state.metrics.snapshot()),
        "dedup" => json(StatusCode::OK, &state.dedup.stats()),
        "set_stage" => set_stage(state, host, query),
        "unlock_stage" => unlock_stage(state, host),
        _ => json(StatusCode::BAD_REQUEST, &ErrorResp { error: "unknown action" }),
    }
}

/// Read-only API behind `/_bProxy/api/v2`, reachable only from
/// whitelisted IPs (the dispatcher enforces that).
pub fn process_v2(state: &AppState, host: &str, query: &str) -> Response<Body> {
    let action = query_param(query, "action").unwrap_or_default();
    match action.as_str() {
        "stats" => domain_stats(state, host),
        "metrics" => json(StatusCode::OK, &state.metrics.snapshot()),
        "dedup" => json(StatusCode::OK, &state.dedup.stats()),
        _ => json(StatusCode::BAD_REQUEST, &ErrorResp { error: "unknown action" }),
    }
}

fn domain_stats(state: &AppState, host: &str) -> Response<Body> {
    let firewall = state.firewall.read();
    match firewall.domains.get(host) {
        Some(data) => json(
            StatusCode::OK,
            &DomainStatusResp {
                domain: host.to_string(),
                stage: data.stage,
                stage_locked: data.stage_locked,
                stage2_difficulty: data.stage2_difficulty,
                total_requests: data.total_requests,
                bypassed_requests: data.bypassed_requests,
                requests_per_second: data.requests_per_second,
                bypassed_per_second: data.bypassed_per_second,
                under_attack: data.under_attack,
                attack_start: data.attack_start,
            },
        ),
        None => json(StatusCode::NOT_FOUND, &ErrorResp { error: "unknown domain" }),
    }
}

fn domain_logs(state: &AppState, host: &str) -> Response<Body> {
    let firewall = state.firewall.read();
    match firewall.domains.get(host) {
        Some(data) => {
            let logs: Vec<&DomainLog> = data.last_logs.iter().collect();
            json(StatusCode::OK, &logs)
        }
        None => json(StatusCode::NOT_FOUND, &ErrorResp { error: "unknown domain" }),
    }
}

/// Setting a stage through the API also locks it, so the attack
/// detector stops adjusting it until `unlock_stage`.
fn set_stage(state: &AppState, host: &str, query: &str) -> Response<Body> {
    let Some(stage) = query_param(query, "stage").and_then(|s| s.parse::<u8>().ok()) else {
        return json(StatusCode::BAD_REQUEST, &ErrorResp { error: "missing or invalid stage" });
    };
    if stage > 3 {
        return json(StatusCode::BAD_REQUEST, &ErrorResp { error: "stage must be 0..=3" });
    }
    let mut firewall = state.firewall.write();
    match firewall.domains.get_mut(host) {
        Some(data) => {
            data.stage = stage;
            data.stage_locked = true;
            json(
                StatusCode::OK,
                &OkResp { ok: true, stage: data.stage, stage_locked: true },
            )
        }
        None => json(StatusCode::NOT_FOUND, &ErrorResp { error: "unknown domain" }),
    }
}

fn unlock_stage(state: &AppState, host: &str) -> Response<Body> {
    let base_stage = state.domains.get(host).map(|settings| settings.base_stage);
    let mut firewall = state.firewall.write();
    match (firewall.domains.get_mut(host), base_stage) {
        (Some(data), Some(base)) => {
            data.stage_locked = false;
            data.stage = base;
            json(
                StatusCode::OK,
                &OkResp { ok: true, stage: data.stage, stage_locked: false },
            )
        }
        _ => json(StatusCode::NOT_FOUND, &ErrorResp { error: "unknown domain" }),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        if parts.next()? == name {
            Some(parts.next().unwrap_or("").to_string())
        } else {
            None
        }
    })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extracts_values() {
        assert_eq!(
            query_param("action=set_stage&stage=2", "stage").as_deref(),
            Some("2")
        );
        assert_eq!(
            query_param("action=stats", "action").as_deref(),
            Some("stats")
        );
        assert!(query_param("action=stats", "stage").is_none());
        assert_eq!(query_param("flag&x=1", "flag").as_deref(), Some(""));
    }
}
