//! HTTP front door.
//!
//! Routes:
//! - `GET|POST <login_path>`: login form and submission
//! - `POST /logout`: drop the `auth` cookie
//! - `GET /` and `GET /api/list?path=`: directory listing as JSON
//! - `GET /files/{*path}`: streamed file download
//!
//! Everything but login and logout requires a valid `auth` cookie or
//! HTTP Basic credentials.

pub mod guard;
pub mod handlers;
pub mod page;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use protocol::StatusCode as SftpStatus;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{CredentialGate, CsrfGuard, RateLimiter};
use crate::files::{JailError, JailedFileSystem};

/// Name of the session cookie.
pub const AUTH_COOKIE: &str = "auth";

/// Chunk size used when streaming downloads.
pub const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// State shared by all web handlers.
#[derive(Clone)]
pub struct WebState {
    pub gate: Arc<CredentialGate>,
    pub limiter: Arc<RateLimiter>,
    pub csrf: CsrfGuard,
    pub jail: Arc<JailedFileSystem>,
    pub login_path: Arc<str>,
}

impl WebState {
    pub fn new(
        gate: Arc<CredentialGate>,
        limiter: Arc<RateLimiter>,
        jail: Arc<JailedFileSystem>,
        login_path: &str,
    ) -> Self {
        Self {
            gate,
            limiter,
            csrf: CsrfGuard::new(),
            jail,
            login_path: Arc::from(login_path),
        }
    }
}

/// Build the application router.
pub fn router(state: WebState) -> Router {
    let protected = Router::new()
        .route("/", get(handlers::list))
        .route("/api/list", get(handlers::list))
        .route("/files/{*path}", get(handlers::download))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard::require_auth,
        ));

    Router::new()
        .route(
            &state.login_path,
            get(handlers::login_page).post(handlers::login_submit),
        )
        .route("/logout", post(handlers::logout))
        .merge(protected)
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    match listener.local_addr() {
        Ok(addr) => info!("Web interface listening on http://{}", addr),
        Err(e) => warn!("Web listener address unavailable: {}", e),
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Web interface stopped");
    Ok(())
}

/// Errors returned by the data routes.
#[derive(Debug)]
pub enum WebError {
    Jail(JailError),
    Internal(String),
}

impl From<JailError> for WebError {
    fn from(err: JailError) -> Self {
        WebError::Jail(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Jail(err) => {
                if err.is_denial() {
                    warn!(error = %err, "Web request denied");
                }
                let status = match (&err, err.status_code()) {
                    (_, SftpStatus::PermissionDenied) => StatusCode::FORBIDDEN,
                    (_, SftpStatus::NoSuchFile) => StatusCode::NOT_FOUND,
                    (_, SftpStatus::OpUnsupported) => StatusCode::FORBIDDEN,
                    (JailError::NotADirectory(_) | JailError::IsADirectory(_), _) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.peer_message()).into_response()
            }
            WebError::Internal(message) => {
                warn!("Internal web error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
