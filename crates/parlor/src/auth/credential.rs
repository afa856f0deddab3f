//! Credential extraction from the connection handshake.

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};

use super::AuthError;

/// Cookie carrying the credential for browser clients.
const AUTH_COOKIE: &str = "auth_token";

/// Query parameter carrying the credential (browsers can't set headers on WS).
const TOKEN_PARAM: &str = "token";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidOrExpiredCredential)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidOrExpiredCredential);
    }

    let token = parts.next().ok_or(AuthError::InvalidOrExpiredCredential)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidOrExpiredCredential);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == TOKEN_PARAM {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Find the credential presented with a connection-open request.
///
/// Sources in priority order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `auth_token` cookie
/// 3. `token` query parameter
///
/// Returns `Ok(None)` when no source carries a non-empty credential; a
/// malformed Authorization header is an error rather than a fallthrough.
pub fn credential_from_request(
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Option<String>, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let value = header
            .to_str()
            .map_err(|_| AuthError::InvalidOrExpiredCredential)?;
        return Ok(Some(bearer_token_from_header(value)?.to_string()));
    }

    let cookie_token = headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, AUTH_COOKIE))
        .filter(|token| !token.is_empty());
    if let Some(token) = cookie_token {
        return Ok(Some(token.to_string()));
    }

    Ok(query
        .and_then(token_from_query)
        .filter(|token| !token.is_empty()))
}
