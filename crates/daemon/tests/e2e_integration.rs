//! End-to-end integration tests for weblist.
//!
//! These tests drive complete flows through the public API:
//! - SFTP sessions over an in-memory stream
//! - SSH connections over TCP: authentication, subsystem and shell handling
//! - Web login, logout, listing and download through the router
//! - Rate limiting shared between both front doors
//! - Daemon startup and shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::Engine;
use bytes::Bytes;
use protocol::{
    FileAttrs, OpenFlags, PacketCodec, Request as SftpRequest, Response as SftpResponse,
    StatusCode as SftpStatus, LENGTH_PREFIX_SIZE,
};
use russh::client;
use russh::{Channel, ChannelMsg};
use tempfile::TempDir;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use weblist_daemon::auth::{AuthorizedKeys, CredentialGate, RateLimiter, SessionTokens};
use weblist_daemon::config::{Config, SftpConfig};
use weblist_daemon::files::{ExclusionSet, JailedFileSystem};
use weblist_daemon::identity::HostIdentity;
use weblist_daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use weblist_daemon::sftp::{SftpContext, SftpServer, SftpSession};
use weblist_daemon::web::{self, WebState};

const USER: &str = "admin";
const PASSWORD: &str = "testpassword";

/// A shared tree with a nested file, a larger file and an excluded directory.
fn create_share() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::create_dir_all(root.join(".git")).unwrap();
    std::fs::write(root.join("docs/readme.md"), b"# weblist\n").unwrap();
    std::fs::write(root.join(".git/config"), b"[core]\n").unwrap();

    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("large.bin"), large).unwrap();
    temp_dir
}

fn create_jail(share: &TempDir) -> Arc<JailedFileSystem> {
    Arc::new(JailedFileSystem::new(share.path(), ExclusionSet::new([".git"])).unwrap())
}

fn create_gate() -> Arc<CredentialGate> {
    Arc::new(CredentialGate::new(
        USER,
        Some(PASSWORD),
        AuthorizedKeys::default(),
        SessionTokens::random(Duration::from_secs(3600)).unwrap(),
    ))
}

// ============================================================================
// SFTP
// ============================================================================

struct SftpClient {
    codec: PacketCodec,
    rx: ReadHalf<DuplexStream>,
    tx: WriteHalf<DuplexStream>,
}

impl SftpClient {
    fn connect(jail: Arc<JailedFileSystem>) -> (Self, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(512 * 1024);
        let session = SftpSession::new(jail);
        let task = tokio::spawn(async move {
            session.serve(server).await.unwrap();
        });
        let (rx, tx) = tokio::io::split(client);
        (
            Self {
                codec: PacketCodec::new(),
                rx,
                tx,
            },
            task,
        )
    }

    async fn call(&mut self, request: SftpRequest) -> SftpResponse {
        let packet = self.codec.encode(&request.encode()).unwrap();
        self.tx.write_all(&packet).await.unwrap();

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.rx.read_exact(&mut prefix).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
        self.rx.read_exact(&mut payload).await.unwrap();
        SftpResponse::decode(&payload).unwrap()
    }

    async fn open(&mut self, id: u32, path: &str) -> Bytes {
        match self
            .call(SftpRequest::Open {
                id,
                path: path.to_string(),
                flags: OpenFlags(OpenFlags::READ),
                attrs: FileAttrs::default(),
            })
            .await
        {
            SftpResponse::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {:?}", other),
        }
    }

    async fn close(self, task: tokio::task::JoinHandle<()>) {
        drop(self.tx);
        drop(self.rx);
        task.await.unwrap();
    }
}

fn status_code(response: &SftpResponse) -> SftpStatus {
    match response {
        SftpResponse::Status { code, .. } => *code,
        other => panic!("expected status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sftp_browse_and_read() {
    let share = create_share();
    let (mut client, task) = SftpClient::connect(create_jail(&share));

    assert_eq!(
        client.call(SftpRequest::Init { version: 3 }).await,
        SftpResponse::Version { version: 3 }
    );

    let realpath = client
        .call(SftpRequest::Realpath {
            id: 1,
            path: ".".to_string(),
        })
        .await;
    match realpath {
        SftpResponse::Name { id: 1, entries } => assert_eq!(entries[0].filename, "/"),
        other => panic!("unexpected response: {:?}", other),
    }

    let handle = match client
        .call(SftpRequest::Opendir {
            id: 2,
            path: "/".to_string(),
        })
        .await
    {
        SftpResponse::Handle { handle, .. } => handle,
        other => panic!("expected handle, got {:?}", other),
    };

    let mut names = Vec::new();
    loop {
        let response = client
            .call(SftpRequest::Readdir {
                id: 3,
                handle: handle.clone(),
            })
            .await;
        match response {
            SftpResponse::Name { entries, .. } => {
                names.extend(entries.into_iter().map(|e| e.filename))
            }
            other => {
                assert_eq!(status_code(&other), SftpStatus::Eof);
                break;
            }
        }
    }
    assert!(names.contains(&"docs".to_string()));
    assert!(names.contains(&"large.bin".to_string()));
    assert!(!names.contains(&".git".to_string()));

    let file = client.open(4, "docs/readme.md").await;
    let data = client
        .call(SftpRequest::Read {
            id: 5,
            handle: file.clone(),
            offset: 0,
            len: 4096,
        })
        .await;
    assert_eq!(
        data,
        SftpResponse::Data {
            id: 5,
            data: Bytes::from_static(b"# weblist\n"),
        }
    );

    let eof = client
        .call(SftpRequest::Read {
            id: 6,
            handle: file.clone(),
            offset: 10,
            len: 4096,
        })
        .await;
    assert_eq!(status_code(&eof), SftpStatus::Eof);

    let closed = client.call(SftpRequest::Close { id: 7, handle: file }).await;
    assert_eq!(status_code(&closed), SftpStatus::Ok);

    client.close(task).await;
}

#[tokio::test]
async fn test_sftp_large_file_reads_in_chunks() {
    let share = create_share();
    let expected = std::fs::read(share.path().join("large.bin")).unwrap();
    let (mut client, task) = SftpClient::connect(create_jail(&share));
    client.call(SftpRequest::Init { version: 3 }).await;

    let handle = client.open(1, "/large.bin").await;
    let mut received = Vec::new();
    let mut id = 2;
    loop {
        let response = client
            .call(SftpRequest::Read {
                id,
                handle: handle.clone(),
                offset: received.len() as u64,
                len: 32 * 1024,
            })
            .await;
        match response {
            SftpResponse::Data { data, .. } => received.extend_from_slice(&data),
            other => {
                assert_eq!(status_code(&other), SftpStatus::Eof);
                break;
            }
        }
        id += 1;
    }
    assert_eq!(received, expected);

    client.close(task).await;
}

#[tokio::test]
async fn test_sftp_refuses_escape_exclusion_and_writes() {
    let share = create_share();
    let (mut client, task) = SftpClient::connect(create_jail(&share));
    client.call(SftpRequest::Init { version: 3 }).await;

    let traversal = client
        .call(SftpRequest::Stat {
            id: 1,
            path: "../../etc/passwd".to_string(),
        })
        .await;
    assert_eq!(status_code(&traversal), SftpStatus::PermissionDenied);

    let excluded = client
        .call(SftpRequest::Stat {
            id: 2,
            path: ".git/config".to_string(),
        })
        .await;
    assert_eq!(status_code(&excluded), SftpStatus::PermissionDenied);

    let write_open = client
        .call(SftpRequest::Open {
            id: 3,
            path: "new.txt".to_string(),
            flags: OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT),
            attrs: FileAttrs::default(),
        })
        .await;
    assert_eq!(status_code(&write_open), SftpStatus::PermissionDenied);

    let removal = client
        .call(SftpRequest::Remove {
            id: 4,
            path: "docs/readme.md".to_string(),
        })
        .await;
    assert_eq!(status_code(&removal), SftpStatus::PermissionDenied);

    let mkdir = client
        .call(SftpRequest::Mkdir {
            id: 5,
            path: "uploads".to_string(),
            attrs: FileAttrs::default(),
        })
        .await;
    assert_eq!(status_code(&mkdir), SftpStatus::PermissionDenied);

    client.close(task).await;

    // Nothing on disk changed.
    assert!(share.path().join("docs/readme.md").exists());
    assert!(!share.path().join("new.txt").exists());
    assert!(!share.path().join("uploads").exists());
}

// ============================================================================
// SSH
// ============================================================================

struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct SshFixture {
    _share: TempDir,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for SshFixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_ssh(max_attempts: u32) -> SshFixture {
    let share = create_share();
    let limiter = RateLimiter::new(max_attempts, Duration::from_secs(600))
        .with_denial_delay(Duration::ZERO);
    let context = SftpContext {
        gate: create_gate(),
        limiter: Arc::new(limiter),
        jail: create_jail(&share),
    };
    let server = Arc::new(SftpServer::new(
        &SftpConfig::default(),
        &HostIdentity::from_secret_key_bytes(&[9u8; 32]),
        context,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(listener, shutdown.clone()));

    SshFixture {
        _share: share,
        addr,
        shutdown,
    }
}

async fn ssh_connect(addr: SocketAddr) -> client::Handle<TrustingClient> {
    client::connect(Arc::new(client::Config::default()), addr, TrustingClient)
        .await
        .unwrap()
}

async fn ssh_login(addr: SocketAddr) -> client::Handle<TrustingClient> {
    let mut handle = ssh_connect(addr).await;
    assert!(handle.authenticate_password(USER, PASSWORD).await.unwrap());
    handle
}

/// Summaries of everything the server sends on `channel` until it closes.
async fn drain_channel(channel: &mut Channel<client::Msg>) -> Vec<String> {
    let mut seen = Vec::new();
    let collect = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Success => seen.push("success".to_string()),
                ChannelMsg::Failure => seen.push("failure".to_string()),
                ChannelMsg::Data { data } => {
                    seen.push(format!("data:{}", String::from_utf8_lossy(&data)))
                }
                ChannelMsg::ExitStatus { exit_status } => seen.push(format!("exit:{}", exit_status)),
                ChannelMsg::Eof => seen.push("eof".to_string()),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("channel closes");
    seen
}

/// Wait for the reply to a `want_reply` channel request.
async fn request_reply(channel: &mut Channel<client::Msg>) -> bool {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) | None => return false,
            Some(_) => continue,
        }
    }
}

async fn sftp_exchange<S>(stream: &mut S, request: SftpRequest) -> SftpResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = PacketCodec::new().encode(&request.encode()).unwrap();
    stream.write_all(&packet).await.unwrap();
    stream.flush().await.unwrap();

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    SftpResponse::decode(&payload).unwrap()
}

#[tokio::test]
async fn test_ssh_serves_several_sftp_channels() {
    let fixture = start_ssh(5).await;
    let handle = ssh_login(fixture.addr).await;

    let mut streams = Vec::new();
    for _ in 0..2 {
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();
        assert!(request_reply(&mut channel).await);
        streams.push(channel.into_stream());
    }

    for stream in &mut streams {
        let reply = sftp_exchange(stream, SftpRequest::Init { version: 3 }).await;
        assert_eq!(reply, SftpResponse::Version { version: 3 });
    }
    for (id, stream) in streams.iter_mut().enumerate() {
        let id = id as u32 + 1;
        let reply = sftp_exchange(
            stream,
            SftpRequest::Stat {
                id,
                path: "/docs/readme.md".to_string(),
            },
        )
        .await;
        match reply {
            SftpResponse::Attrs { id: got, attrs } => {
                assert_eq!(got, id);
                assert_eq!(attrs.size, Some(10));
            }
            other => panic!("expected attrs, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ssh_refuses_shell_and_exec() {
    let fixture = start_ssh(5).await;
    let handle = ssh_login(fixture.addr).await;
    let expected = vec![
        "success".to_string(),
        "data:This service only provides SFTP access.\r\n".to_string(),
        "exit:1".to_string(),
        "eof".to_string(),
    ];

    let mut shell = handle.channel_open_session().await.unwrap();
    shell.request_shell(true).await.unwrap();
    assert_eq!(drain_channel(&mut shell).await, expected);

    let mut exec = handle.channel_open_session().await.unwrap();
    exec.exec(true, "cat /etc/passwd").await.unwrap();
    assert_eq!(drain_channel(&mut exec).await, expected);

    // The connection is still usable for file transfer afterwards.
    let mut sftp = handle.channel_open_session().await.unwrap();
    sftp.request_subsystem(true, "sftp").await.unwrap();
    assert!(request_reply(&mut sftp).await);
}

#[tokio::test]
async fn test_ssh_only_sftp_subsystem_is_served() {
    let fixture = start_ssh(5).await;
    let handle = ssh_login(fixture.addr).await;

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "scp").await.unwrap();
    assert!(!request_reply(&mut channel).await);
}

#[tokio::test]
async fn test_ssh_wrong_password_is_rejected() {
    let fixture = start_ssh(5).await;
    let mut handle = ssh_connect(fixture.addr).await;

    assert!(!handle.authenticate_password(USER, "wrong").await.unwrap());
    assert!(!handle.authenticate_password("root", PASSWORD).await.unwrap());
    assert!(handle.authenticate_password(USER, PASSWORD).await.unwrap());
}

#[tokio::test]
async fn test_ssh_rate_limited_source_refused() {
    let fixture = start_ssh(2).await;

    let mut handle = ssh_connect(fixture.addr).await;
    for _ in 0..2 {
        assert!(!handle.authenticate_password(USER, "wrong").await.unwrap());
    }
    // Correct credentials no longer help inside the window, on any connection.
    assert!(!handle.authenticate_password(USER, PASSWORD).await.unwrap());

    let mut fresh = ssh_connect(fixture.addr).await;
    assert!(!fresh.authenticate_password(USER, PASSWORD).await.unwrap());
}

// ============================================================================
// Web
// ============================================================================

struct WebFixture {
    _share: TempDir,
    app: Router,
}

fn create_web() -> WebFixture {
    let share = create_share();
    let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(600)));
    let state = WebState::new(create_gate(), limiter, create_jail(&share), "/login");
    let app = web::router(state).layer(MockConnectInfo(SocketAddr::from((
        [127, 0, 0, 1],
        40000,
    ))));
    WebFixture { _share: share, app }
}

async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Value of the named cookie set by `response`, if any.
fn set_cookie(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| cookie::Cookie::parse(v.to_string()).ok())
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}

fn location(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn fetch_csrf(app: &Router) -> String {
    let response = send(
        app,
        Request::get("/login").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    set_cookie(&response, "csrf_token").expect("login page sets csrf cookie")
}

fn login_request(username: &str, password: &str, form_csrf: &str, cookie_csrf: &str) -> Request<Body> {
    let body = format!(
        "username={}&password={}&csrf_token={}",
        username, password, form_csrf
    );
    Request::post("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::COOKIE, format!("csrf_token={}", cookie_csrf))
        .body(Body::from(body))
        .unwrap()
}

async fn login(app: &Router) -> String {
    let csrf = fetch_csrf(app).await;
    let response = send(app, login_request(USER, PASSWORD, &csrf, &csrf)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    set_cookie(&response, "auth").expect("login sets auth cookie")
}

fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::COOKIE, format!("auth={}", token))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_web_login_page_renders_form() {
    let fixture = create_web();
    let response = send(
        &fixture.app,
        Request::get("/login").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let csrf = set_cookie(&response, "csrf_token").unwrap();
    let html = body_text(response).await;
    assert!(html.contains("<form"));
    assert!(html.contains(&csrf));
}

#[tokio::test]
async fn test_web_login_success_sets_cookie() {
    let fixture = create_web();
    let csrf = fetch_csrf(&fixture.app).await;

    let response = send(&fixture.app, login_request(USER, PASSWORD, &csrf, &csrf)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");

    let token = set_cookie(&response, "auth").unwrap();
    assert!(!token.is_empty());
    assert!(!token.contains(PASSWORD));
}

#[tokio::test]
async fn test_web_login_csrf_mismatch_rejected() {
    let fixture = create_web();
    let csrf = fetch_csrf(&fixture.app).await;

    let response = send(
        &fixture.app,
        login_request(USER, PASSWORD, "forged", &csrf),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response, "auth").is_none());
    assert!(body_text(response)
        .await
        .contains("Invalid username or password."));
}

#[tokio::test]
async fn test_web_login_rate_limited() {
    let fixture = create_web();

    for _ in 0..5 {
        let csrf = fetch_csrf(&fixture.app).await;
        let response = send(&fixture.app, login_request(USER, "wrong", &csrf, &csrf)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Even correct credentials are refused once the window is exhausted.
    let csrf = fetch_csrf(&fixture.app).await;
    let response = send(&fixture.app, login_request(USER, PASSWORD, &csrf, &csrf)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(set_cookie(&response, "auth").is_none());
    assert!(body_text(response)
        .await
        .to_lowercase()
        .contains("too many attempts"));
}

#[tokio::test]
async fn test_web_login_malformed_body_rejected() {
    let fixture = create_web();
    let csrf = fetch_csrf(&fixture.app).await;

    let request = Request::post("/login")
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::COOKIE, format!("csrf_token={}", csrf))
        .body(Body::from(format!("{}:{}", USER, PASSWORD)))
        .unwrap();
    let response = send(&fixture.app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(set_cookie(&response, "auth").is_none());
    let html = body_text(response).await;
    assert!(html.contains("<form"));
    assert!(html.contains("Invalid username or password."));
}

#[tokio::test]
async fn test_web_unauthenticated_redirects_to_login() {
    let fixture = create_web();

    for uri in ["/", "/api/list?path=docs", "/files/docs/readme.md"] {
        let response = send(&fixture.app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{}", uri);
        assert_eq!(location(&response), "/login");
    }

    let response = send(&fixture.app, authed_get("/api/list", "forged.token")).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_web_basic_auth() {
    let fixture = create_web();
    let encode = |user: &str, pass: &str| {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
        )
    };

    let response = send(
        &fixture.app,
        Request::get("/api/list?path=docs")
            .header(header::AUTHORIZATION, encode(USER, PASSWORD))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &fixture.app,
        Request::get("/api/list?path=docs")
            .header(header::AUTHORIZATION, encode(USER, "wrong"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_web_listing_hides_excluded_entries() {
    let fixture = create_web();
    let token = login(&fixture.app).await;

    let response = send(&fixture.app, authed_get("/api/list?path=/", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(&body_text(response).await).unwrap();
    let names: Vec<&str> = entries
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names[0], "..");
    assert!(names.contains(&"docs"));
    assert!(names.contains(&"large.bin"));
    assert!(!names.contains(&".git"));

    let docs = entries.iter().find(|e| e["name"] == "docs").unwrap();
    assert_eq!(docs["kind"], "directory");

    let response = send(&fixture.app, authed_get("/api/list?path=.git", &token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_web_download_streams_content() {
    let fixture = create_web();
    let token = login(&fixture.app).await;

    let response = send(&fixture.app, authed_get("/files/docs/readme.md", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"readme.md\""
    );
    assert_eq!(body_text(response).await, "# weblist\n");

    let response = send(&fixture.app, authed_get("/files/large.bin", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "200000");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body.len(), 200_000);
}

#[tokio::test]
async fn test_web_download_refuses_escape() {
    let fixture = create_web();
    let token = login(&fixture.app).await;

    let response = send(
        &fixture.app,
        authed_get("/files/..%2F..%2Fetc%2Fpasswd", &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&fixture.app, authed_get("/files/missing.txt", &token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&fixture.app, authed_get("/files/docs", &token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_web_logout_clears_cookie() {
    let fixture = create_web();
    let token = login(&fixture.app).await;

    let response = send(
        &fixture.app,
        Request::post("/logout")
            .header(header::COOKIE, format!("auth={}", token))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");
    assert_eq!(set_cookie(&response, "auth").as_deref(), Some(""));
}

// ============================================================================
// Daemon lifecycle
// ============================================================================

#[tokio::test]
async fn test_daemon_serves_web_over_tcp() {
    let temp_dir = TempDir::new().unwrap();
    let share = create_share();

    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.files.root = share.path().to_path_buf();
    config.auth.password = Some(PASSWORD.to_string());
    config.web.listen = "127.0.0.1:0".to_string();
    config.sftp.listen = "127.0.0.1:0".to_string();

    let orchestrator = DaemonOrchestrator::new(config).unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);

    let addr = orchestrator.web_addr().await.unwrap();
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("csrf_token"));

    // The SSH listener announces itself before any authentication.
    let sftp_addr = orchestrator.sftp_addr().await.unwrap();
    let mut ssh = tokio::net::TcpStream::connect(sftp_addr).await.unwrap();
    let mut banner = [0u8; 8];
    ssh.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-");

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}
