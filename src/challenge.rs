use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use tera::Context;

use crate::captcha::{self, CaptchaCache};
use crate::helpers::current_ts;
use crate::metrics::ProxyMetrics;
use crate::templates::{CAPTCHA_TEMPLATE, POW_TEMPLATE};
use crate::token::{self, Secrets, TokenCache};

const CHALLENGE_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// Everything the responder needs to build a challenge page.
pub struct ChallengeRequest<'a> {
    pub sus_lv: u8,
    pub token: &'a str,
    pub pow_hash: Option<&'a str>,
    pub ip: &'a str,
    pub request_uri: &'a str,
    pub stage2_difficulty: usize,
    /// `""` in stealth mode, `"BalooProxyX "` otherwise.
    pub name_txt: &'a str,
}

/// Look up or mint the token for an identity at a suspicion level.
/// `access_key` is `ip || tlsFP || userAgent || currentHourStr`;
/// `cache_key` is the same with the suspicion string appended.
/// Returns the token plus, at stage 2, its sha256 PoW target.
/// Level 0 requests are whitelisted and carry no token.
pub fn token_for(
    cache: &TokenCache,
    secrets: &Secrets,
    access_key: &str,
    cache_key: &str,
    sus_lv: u8,
    metrics: &ProxyMetrics,
) -> (String, Option<String>) {
    if let Some(cached) = cache.token(cache_key) {
        ProxyMetrics::inc(&metrics.token_cache_hits);
        let pow_hash = if sus_lv == 2 {
            cache.pow_hash(&cached)
        } else {
            None
        };
        return (cached, pow_hash);
    }

    ProxyMetrics::inc(&metrics.token_cache_misses);
    let mut pow_hash = None;
    let token = match sus_lv {
        0 => String::new(),
        1 => token::issue(access_key, &secrets.cookie_otp),
        2 => {
            let token = token::issue(access_key, &secrets.js_otp);
            let hashed = token::sha256_hex(&token);
            cache.insert_pow_hash(token.clone(), hashed.clone());
            pow_hash = Some(hashed);
            token
        }
        _ => token::issue(access_key, &secrets.captcha_otp),
    };
    cache.insert_token(cache_key.to_string(), token.clone());
    (token, pow_hash)
}

/// Build the challenge response for an unverified request at levels
/// 1..=3. Level 0 forwards and levels above 3 block before reaching
/// this point.
pub fn respond(
    request: &ChallengeRequest<'_>,
    templates: &tera::Tera,
    captcha_cache: &CaptchaCache,
    metrics: &ProxyMetrics,
) -> Response<Body> {
    match request.sus_lv {
        1 => silent_redirect(request),
        2 => pow_page(request, templates),
        3 => captcha_page(request, templates, captcha_cache, metrics),
        _ => plain_error(request.name_txt, "unsupported challenge level"),
    }
}

/// Stage 1: hand the token over in a sibling cookie and bounce the
/// browser back to the same URL. Any cookie-carrying client passes
/// the next round without noticing.
fn silent_redirect(request: &ChallengeRequest<'_>) -> Response<Body> {
    let cookie = format!(
        "_1__bProxy_v={}; SameSite=Lax; path=/; Secure",
        request.token
    );
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.insert(header::SET_COOKIE, value);
    }
    if let Ok(value) = HeaderValue::from_str(request.request_uri) {
        headers.insert(header::LOCATION, value);
    }
    response
}

/// Stage 2: reveal the token minus its trailing `difficulty` hex
/// characters plus the sha256 of the full token; the client searches
/// the missing suffix.
fn pow_page(request: &ChallengeRequest<'_>, templates: &tera::Tera) -> Response<Body> {
    let salt_len = request.token.len().saturating_sub(request.stage2_difficulty);
    let public_salt = &request.token[..salt_len];

    let mut ctx = Context::new();
    ctx.insert("PublicSalt", public_salt);
    ctx.insert("HashedEncryptedIP", request.pow_hash.unwrap_or(""));
    ctx.insert("Stage2Difficulty", &request.stage2_difficulty.to_string());

    match templates.render(POW_TEMPLATE, &ctx) {
        Ok(html) => challenge_html(html),
        Err(error) => {
            tracing::error!(%error, "pow template render failed");
            plain_error(request.name_txt, "Failed to render challenge")
        }
    }
}

/// Stage 3: the first six hex characters of the token are the captcha
/// solution; the rest is handed to the client in the clear.
fn captcha_page(
    request: &ChallengeRequest<'_>,
    templates: &tera::Tera,
    captcha_cache: &CaptchaCache,
    metrics: &ProxyMetrics,
) -> Response<Body> {
    if request.token.len() < 6 {
        return plain_error(request.name_txt, "Error: challenge token too short");
    }
    let secret_part = &request.token[..6];
    let public_part = &request.token[6..];

    let now = current_ts();
    let (captcha_data, mask_data) = match captcha_cache.fetch(secret_part, now) {
        Some(cached) => {
            ProxyMetrics::inc(&metrics.captcha_cache_hits);
            cached
        }
        None => {
            ProxyMetrics::inc(&metrics.captcha_cache_misses);
            match captcha::render(secret_part, public_part) {
                Ok((captcha_data, mask_data)) => {
                    captcha_cache.insert(
                        secret_part.to_string(),
                        captcha_data.clone(),
                        mask_data.clone(),
                        now,
                    );
                    (captcha_data, mask_data)
                }
                Err(error) => {
                    tracing::error!(%error, "captcha render failed");
                    return plain_error(request.name_txt, "Error: Failed to encode captcha");
                }
            }
        }
    };

    let mut ctx = Context::new();
    ctx.insert("Ip", request.ip);
    ctx.insert("PublicPart", public_part);
    ctx.insert("CaptchaData", &captcha_data);
    ctx.insert("MaskData", &mask_data);

    match templates.render(CAPTCHA_TEMPLATE, &ctx) {
        Ok(html) => challenge_html(html),
        Err(error) => {
            tracing::error!(%error, "captcha template render failed");
            plain_error(request.name_txt, "Failed to render challenge")
        }
    }
}

fn challenge_html(html: String) -> Response<Body> {
    let mut response = Response::new(Body::from(html));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CHALLENGE_CACHE_CONTROL),
    );
    response
}

/// Transient internal failure: short plain-text body, never a 5xx
/// that would leak which subsystem fell over.
fn plain_error(name_txt: &str, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{name_txt}{message}")));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}
