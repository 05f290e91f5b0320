//! Login, logout, listing and download handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use axum_extra::extract::CookieJar;
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use tracing::{info, warn};

use super::guard::{auth_cookie, csrf_cookie, expired, is_https};
use super::page::login_form;
use super::{WebError, WebState, AUTH_COOKIE, DOWNLOAD_CHUNK};
use crate::auth::{AuthError, CSRF_COOKIE};
use crate::files::{DirectoryEntry, JailError, OpenFile};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub path: String,
}

/// `GET <login_path>`: render the form with a fresh CSRF token.
pub async fn login_page(
    State(state): State<WebState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    if let Some(cookie) = jar.get(AUTH_COOKIE) {
        if state.gate.validate_token(cookie.value()) {
            return Redirect::to("/").into_response();
        }
    }
    render_form(&state, &headers, jar, StatusCode::OK, None)
}

/// `POST <login_path>`: check throttling, body shape, CSRF and credentials,
/// in that order.
pub async fn login_submit(
    State(state): State<WebState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let source = addr.ip().to_string();
    let (form, rejection) = match form {
        Ok(Form(form)) => (form, None),
        Err(rejection) => (LoginForm::default(), Some(rejection.body_text())),
    };

    let outcome = if !state.limiter.admit(&source).await {
        Err(AuthError::RateLimited)
    } else if let Some(reason) = rejection {
        Err(AuthError::MalformedRequest(reason))
    } else if !state.csrf.verify(
        form.csrf_token.as_deref(),
        jar.get(CSRF_COOKIE).map(|c| c.value()),
    ) {
        Err(AuthError::CsrfMismatch)
    } else if !state.gate.verify(&form.username, &form.password) {
        Err(AuthError::AuthenticationFailed)
    } else {
        Ok(())
    };

    match outcome {
        Ok(()) => {
            state.limiter.reset(&source);
            info!(peer = %addr, user = %form.username, "Web login succeeded");

            let cookie = auth_cookie(
                state.gate.issue_token(),
                state.gate.tokens().ttl(),
                is_https(&headers),
            );
            let jar = jar.add(cookie).remove(expired(CSRF_COOKIE));
            (jar, Redirect::to("/")).into_response()
        }
        Err(err) => {
            warn!(peer = %addr, user = %form.username, reason = %err, "Web login rejected");
            let status = match err {
                AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                AuthError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::OK,
            };
            render_form(&state, &headers, jar, status, Some(err.user_message()))
        }
    }
}

/// `POST /logout`: drop the session cookie.
pub async fn logout(State(state): State<WebState>, jar: CookieJar) -> Response {
    let jar = jar.remove(expired(AUTH_COOKIE));
    (jar, Redirect::to(&state.login_path)).into_response()
}

/// `GET /api/list?path=`: the jailed listing as JSON.
pub async fn list(
    State(state): State<WebState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DirectoryEntry>>, WebError> {
    let jail = Arc::clone(&state.jail);
    let entries = tokio::task::spawn_blocking(move || jail.list(&query.path))
        .await
        .map_err(|e| WebError::Internal(e.to_string()))??;
    Ok(Json(entries))
}

/// `GET /files/{*path}`: stream a file in fixed-size chunks.
pub async fn download(
    State(state): State<WebState>,
    Path(path): Path<String>,
) -> Result<Response, WebError> {
    let jail = Arc::clone(&state.jail);
    let file = tokio::task::spawn_blocking(move || jail.open(&path))
        .await
        .map_err(|e| WebError::Internal(e.to_string()))??;
    let file = Arc::new(file);

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (header::CONTENT_LENGTH, HeaderValue::from(file.size())),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(file.entry().name.as_str()),
        ),
    ];
    Ok((headers, Body::from_stream(chunks(file))).into_response())
}

fn chunks(
    file: Arc<OpenFile>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    stream::try_unfold((file, 0u64, false), |(file, offset, done)| async move {
        if done {
            return Ok(None);
        }
        let reader = Arc::clone(&file);
        let outcome = tokio::task::spawn_blocking(move || reader.read_at(offset, DOWNLOAD_CHUNK))
            .await
            .map_err(std::io::Error::other)?
            .map_err(into_io)?;
        if outcome.data.is_empty() {
            return Ok(None);
        }
        let next = offset + outcome.data.len() as u64;
        Ok::<_, std::io::Error>(Some((outcome.data, (file, next, outcome.eof))))
    })
}

fn into_io(err: JailError) -> std::io::Error {
    match err {
        JailError::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

fn content_disposition(name: &str) -> HeaderValue {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn render_form(
    state: &WebState,
    headers: &HeaderMap,
    jar: CookieJar,
    status: StatusCode,
    error: Option<&str>,
) -> Response {
    let token = state.csrf.issue_token();
    let html = login_form(&state.login_path, &token, error);
    let jar = jar.add(csrf_cookie(token, state.csrf.ttl(), is_https(headers)));
    (status, jar, Html(html)).into_response()
}
