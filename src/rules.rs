use serde::Deserialize;
use serde_json::Value;

/// The fixed variable set exposed to custom rules. Names mirror the
/// config syntax (`"ip.src"`, `"http.path"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Field {
    #[serde(rename = "ip.src")]
    IpSrc,
    #[serde(rename = "ip.country")]
    IpCountry,
    #[serde(rename = "ip.asn")]
    IpAsn,
    #[serde(rename = "ip.engine")]
    IpEngine,
    #[serde(rename = "ip.bot")]
    IpBot,
    #[serde(rename = "ip.fingerprint")]
    IpFingerprint,
    #[serde(rename = "ip.http_requests")]
    IpHttpRequests,
    #[serde(rename = "ip.challenge_requests")]
    IpChallengeRequests,
    #[serde(rename = "http.host")]
    HttpHost,
    #[serde(rename = "http.version")]
    HttpVersion,
    #[serde(rename = "http.method")]
    HttpMethod,
    #[serde(rename = "http.url")]
    HttpUrl,
    #[serde(rename = "http.query")]
    HttpQuery,
    #[serde(rename = "http.path")]
    HttpPath,
    #[serde(rename = "http.user_agent")]
    HttpUserAgent,
    #[serde(rename = "http.cookie")]
    HttpCookie,
    #[serde(rename = "proxy.stage")]
    ProxyStage,
    #[serde(rename = "proxy.cloudflare")]
    ProxyCloudflare,
    #[serde(rename = "proxy.stage_locked")]
    ProxyStageLocked,
    #[serde(rename = "proxy.attack")]
    ProxyAttack,
    #[serde(rename = "proxy.bypass_attack")]
    ProxyBypassAttack,
    #[serde(rename = "proxy.rps")]
    ProxyRps,
    #[serde(rename = "proxy.rps_allowed")]
    ProxyRpsAllowed,
}

/// Rule predicate tree. Static after config load; deserialized
/// straight from `config.json`, e.g.
/// `{"and": [{"eq": ["http.method", "POST"]}, {"gt": ["ip.http_requests", 50]}]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Eq(Field, Value),
    Ne(Field, Value),
    Gt(Field, i64),
    Lt(Field, i64),
    Contains(Field, String),
}

/// A single custom rule: when `expression` holds, `action` replaces
/// the current suspicion level. Later rules override earlier ones.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub expression: Expr,
    pub action: u8,
}

/// Named-variable environment handed to the evaluator. Fixed shape,
/// built once per request; string fields borrow from the request.
pub struct RuleEnv<'a> {
    pub ip_src: &'a str,
    pub ip_country: &'a str,
    pub ip_asn: &'a str,
    pub ip_engine: &'a str,
    pub ip_bot: &'a str,
    pub ip_fingerprint: &'a str,
    pub ip_http_requests: i64,
    pub ip_challenge_requests: i64,

    pub http_host: &'a str,
    pub http_version: &'a str,
    pub http_method: &'a str,
    pub http_url: &'a str,
    pub http_query: &'a str,
    pub http_path: &'a str,
    /// Lowercased by the caller.
    pub http_user_agent: &'a str,
    pub http_cookie: &'a str,

    pub proxy_stage: i64,
    pub proxy_cloudflare: bool,
    pub proxy_stage_locked: bool,
    pub proxy_attack: bool,
    pub proxy_bypass_attack: bool,
    pub proxy_rps: i64,
    pub proxy_rps_allowed: i64,
}

enum FieldValue<'a> {
    Str(&'a str),
    Int(i64),
    Bool(bool),
}

fn value_of<'a>(env: &'a RuleEnv<'a>, field: Field) -> FieldValue<'a> {
    use Field::*;
    match field {
        IpSrc => FieldValue::Str(env.ip_src),
        IpCountry => FieldValue::Str(env.ip_country),
        IpAsn => FieldValue::Str(env.ip_asn),
        IpEngine => FieldValue::Str(env.ip_engine),
        IpBot => FieldValue::Str(env.ip_bot),
        IpFingerprint => FieldValue::Str(env.ip_fingerprint),
        IpHttpRequests => FieldValue::Int(env.ip_http_requests),
        IpChallengeRequests => FieldValue::Int(env.ip_challenge_requests),
        HttpHost => FieldValue::Str(env.http_host),
        HttpVersion => FieldValue::Str(env.http_version),
        HttpMethod => FieldValue::Str(env.http_method),
        HttpUrl => FieldValue::Str(env.http_url),
        HttpQuery => FieldValue::Str(env.http_query),
        HttpPath => FieldValue::Str(env.http_path),
        HttpUserAgent => FieldValue::Str(env.http_user_agent),
        HttpCookie => FieldValue::Str(env.http_cookie),
        ProxyStage => FieldValue::Int(env.proxy_stage),
        ProxyCloudflare => FieldValue::Bool(env.proxy_cloudflare),
        ProxyStageLocked => FieldValue::Bool(env.proxy_stage_locked),
        ProxyAttack => FieldValue::Bool(env.proxy_attack),
        ProxyBypassAttack => FieldValue::Bool(env.proxy_bypass_attack),
        ProxyRps => FieldValue::Int(env.proxy_rps),
        ProxyRpsAllowed => FieldValue::Int(env.proxy_rps_allowed),
    }
}

fn matches_value(actual: &FieldValue<'_>, expected: &Value) -> bool {
    match (actual, expected) {
        (FieldValue::Str(s), Value::String(v)) => *s == v.as_str(),
        (FieldValue::Int(i), Value::Number(n)) => n.as_i64() == Some(*i),
        (FieldValue::Bool(b), Value::Bool(v)) => b == v,
        _ => false,
    }
}

fn eval(expr: &Expr, env: &RuleEnv<'_>) -> bool {
    match expr {
        Expr::And(all) => all.iter().all(|e| eval(e, env)),
        Expr::Or(any) => any.iter().any(|e| eval(e, env)),
        Expr::Not(inner) => !eval(inner, env),
        Expr::Eq(field, value) => matches_value(&value_of(env, *field), value),
        Expr::Ne(field, value) => !matches_value(&value_of(env, *field), value),
        Expr::Gt(field, bound) => match value_of(env, *field) {
            FieldValue::Int(i) => i > *bound,
            _ => false,
        },
        Expr::Lt(field, bound) => match value_of(env, *field) {
            FieldValue::Int(i) => i < *bound,
            _ => false,
        },
        Expr::Contains(field, needle) => match value_of(env, *field) {
            FieldValue::Str(s) => s.contains(needle.as_str()),
            _ => false,
        },
    }
}

/// Run every rule against the environment. Each matching rule
/// replaces the suspicion level; the final match wins.
pub fn evaluate(rules: &[Rule], env: &RuleEnv<'_>, base: u8) -> u8 {
    let mut sus_lv = base;
    for rule in rules {
        if eval(&rule.expression, env) {
            sus_lv = rule.action;
        }
    }
    sus_lv
}
