//! Authentication middleware and cookie helpers.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::{CookieJar, TypedHeader};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use cookie::time::Duration as CookieDuration;
use tracing::{debug, warn};

use super::{WebState, AUTH_COOKIE};
use crate::auth::{CSRF_COOKIE, LOGIN_FAILED, TOO_MANY_ATTEMPTS};

/// Let a request through with a valid `auth` cookie or Basic credentials.
///
/// Basic failures are throttled like form logins. Requests with neither
/// are sent to the login page.
pub async fn require_auth(
    State(state): State<WebState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    basic: Option<TypedHeader<Authorization<Basic>>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(cookie) = jar.get(AUTH_COOKIE) {
        if state.gate.validate_token(cookie.value()) {
            return next.run(request).await;
        }
        debug!(peer = %addr, "Rejected invalid or expired session cookie");
    }

    if let Some(TypedHeader(credentials)) = basic {
        let source = addr.ip().to_string();
        if !state.limiter.admit(&source).await {
            return (StatusCode::TOO_MANY_REQUESTS, TOO_MANY_ATTEMPTS).into_response();
        }
        if state.gate.verify(credentials.username(), credentials.password()) {
            state.limiter.reset(&source);
            return next.run(request).await;
        }
        warn!(peer = %addr, "Basic authentication failed");
        return (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="weblist""#),
            )],
            LOGIN_FAILED,
        )
            .into_response();
    }

    Redirect::to(&state.login_path).into_response()
}

/// Whether the client reached us over HTTPS, directly or via a proxy.
pub fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

pub fn auth_cookie(token: String, ttl: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(cookie_duration(ttl))
        .build()
}

pub fn csrf_cookie(token: String, ttl: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(cookie_duration(ttl))
        .build()
}

/// A removal cookie matching the path the named cookie was set on.
pub fn expired(name: &'static str) -> Cookie<'static> {
    Cookie::build(name).path("/").build()
}

fn cookie_duration(ttl: Duration) -> CookieDuration {
    CookieDuration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}
