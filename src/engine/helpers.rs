use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

pub const AUTH_HEADER: &str = "x-zyppmon-auth-token";
pub const LOAD_TOKEN_LEN: usize = 64;

const HTTP_PORT: u16 = 8880;
const HTTPS_PORT: u16 = 8843;

/// JavaScript-style truthiness of a JSON value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Continuation cursor: absent when the server sent a falsy value.
pub fn cursor_value(value: &Value) -> Option<String> {
    if !truthy(value) {
        return None;
    }
    value_as_string(value)
}

pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LOAD_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Normalize a host address into a base URL with an explicit port and one trailing slash.
///
/// `h1` -> `http://h1:8880/`, `h1:8843` -> `https://h1:8843/`,
/// `https://h1/` -> `https://h1:8843/`.
pub fn fix_url(host: &str) -> String {
    let host = host.trim();
    let lower = host.to_ascii_lowercase();
    let has_scheme = lower.starts_with("http://") || lower.starts_with("https://");

    let with_scheme = if has_scheme {
        host.to_string()
    } else if authority_of(host).ends_with(&format!(":{HTTPS_PORT}")) {
        format!("https://{host}")
    } else {
        format!("http://{host}")
    };

    let (scheme, rest) = match with_scheme.find("://") {
        Some(idx) => (&with_scheme[..idx], &with_scheme[idx + 3..]),
        None => ("http", with_scheme.as_str()),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let authority = if authority.contains(':') {
        authority.to_string()
    } else if scheme.eq_ignore_ascii_case("https") {
        format!("{authority}:{HTTPS_PORT}")
    } else {
        format!("{authority}:{HTTP_PORT}")
    };

    format!("{scheme}://{authority}{}/", path.trim_end_matches('/'))
}

fn authority_of(host: &str) -> &str {
    host.split('/').next().unwrap_or(host)
}
