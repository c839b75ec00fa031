//! Session and login-state cookie helpers
//!
//! Both cookies are HttpOnly with SameSite=Lax. The session cookie lives as
//! long as the session TTL; the state cookie only bridges the OIDC redirect
//! round trip and expires after ten minutes.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

pub const SESSION_COOKIE: &str = "sirena_session";
pub const STATE_COOKIE: &str = "sirena_state";

const STATE_COOKIE_MAX_AGE: i64 = 600;

/// Extract a cookie value from request headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let header = header.to_str().ok()?;
        for pair in header.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?;
            if key == name {
                return parts.next().map(|v| v.to_string());
            }
        }
    }
    None
}

/// Build the Set-Cookie value for a fresh session
pub fn session_cookie(token: &str, max_age_seconds: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_seconds
    )
}

/// Build the Set-Cookie value that clears the session cookie
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Build the Set-Cookie value for the login-state cookie
pub fn state_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        STATE_COOKIE, token, STATE_COOKIE_MAX_AGE
    )
}

/// Build the Set-Cookie value that clears the login-state cookie
pub fn clear_state_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", STATE_COOKIE)
}
