//! Transient distribution server (Authority only).
//!
//! Serves exactly one file, the trust bundle, at `GET /<file_name>` over
//! plain HTTP. Every other path gets a 404. The bundle is read into memory
//! once when the session starts; nothing else on disk is reachable.
//!
//! A session ends on the first of:
//! - explicit [`DistributionSession::stop`] or cancellation of the token
//! - the absolute session timeout
//! - the configured number of successful fetches
//!
//! A fetch only counts once the whole body has been handed to the
//! connection. The body is sent chunked so the end of the stream is always
//! observed; a client that disconnects mid-transfer does not use up a slot.
//!
//! On stop the listener stops accepting connections and in-flight transfers
//! get the drain timeout to finish (graceful shutdown). Connections still
//! open after that are abandoned and the listening port is released.
//! Dropping the session cancels it, so the port is released even when the
//! owner bails out on an error.
//!
//! There is no authentication and no transport encryption. The bundle is
//! the trust anchor being bootstrapped; run sessions on a trusted segment.

use crate::bundle::{BundleError, TrustBundle};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// How long in-flight transfers may run once a session is stopping.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of each body chunk handed to the connection.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("cannot serve bundle: {0}")]
    Bundle(#[from] BundleError),

    #[error("failed to bind distribution endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("distribution server failed: {0}")]
    Server(#[source] std::io::Error),

    #[error("distribution server task aborted: {0}")]
    Task(String),
}

/// Lifecycle of a distribution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Serving,
    Stopped,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()`, token cancellation, Ctrl-C, or the session was dropped.
    Cancelled,
    TimedOut,
    FetchLimitReached,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub bind: SocketAddr,
    /// Absolute limit on the session. `None` serves until cancelled.
    pub timeout: Option<Duration>,
    /// End the session after this many successful fetches.
    pub stop_after_fetches: Option<usize>,
    /// Parent token; cancelling it ends the session.
    pub cancel: Option<CancellationToken>,
    /// Grace period for open connections after the session stops.
    pub drain_timeout: Duration,
}

impl SessionOptions {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            timeout: None,
            stop_after_fetches: None,
            cancel: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.stop_after_fetches = Some(limit);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// A server that has not started yet.
#[derive(Debug)]
pub struct DistributionServer {
    bundle_path: PathBuf,
    options: SessionOptions,
}

#[derive(Clone)]
struct ServeState {
    bundle: TrustBundle,
    route: Arc<str>,
    fetches: Arc<AtomicUsize>,
    fetch_limit: Option<usize>,
    reason: Arc<OnceLock<StopReason>>,
    token: CancellationToken,
}

impl DistributionServer {
    pub fn new(bundle_path: impl Into<PathBuf>, options: SessionOptions) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            options,
        }
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn state(&self) -> SessionState {
        SessionState::NotStarted
    }

    /// Load the bundle, bind the port, and start serving.
    pub async fn serve(self) -> Result<DistributionSession, ServeError> {
        let bundle = TrustBundle::read(&self.bundle_path)?;
        let file_name = bundle.file_name().to_string();
        let fingerprint = bundle.fingerprint();

        let listener = TcpListener::bind(self.options.bind)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.options.bind,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServeError::Server)?;

        let token = match &self.options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let fetches = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(OnceLock::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let state = ServeState {
            bundle,
            route: format!("/{}", file_name).into(),
            fetches: fetches.clone(),
            fetch_limit: self.options.stop_after_fetches,
            reason: reason.clone(),
            token: token.clone(),
        };

        let app = Router::new()
            .fallback(serve_bundle)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let shutdown = {
            let token = token.clone();
            let reason = reason.clone();
            let timeout = self.options.timeout;
            async move {
                match timeout {
                    Some(limit) => {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(limit) => {
                                let _ = reason.set(StopReason::TimedOut);
                                token.cancel();
                            }
                        }
                    }
                    None => token.cancelled().await,
                }
            }
        };

        let handle = tokio::spawn({
            let stopped = stopped.clone();
            let token = token.clone();
            let drain_timeout = self.options.drain_timeout;
            async move {
                let server = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown);
                let server = std::future::IntoFuture::into_future(server);
                tokio::pin!(server);

                // Dropping the server future closes the listener; connection
                // tasks still running are left to die with their peers.
                let result = tokio::select! {
                    result = &mut server => result,
                    _ = async {
                        token.cancelled().await;
                        tokio::time::sleep(drain_timeout).await;
                    } => {
                        warn!(
                            drain_timeout = ?drain_timeout,
                            "connections still open after drain timeout; abandoning them"
                        );
                        Ok(())
                    }
                };
                stopped.store(true, Ordering::SeqCst);
                result
            }
        });

        warn!(
            addr = %local_addr,
            "serving trust bundle over unauthenticated plain HTTP; only run on a trusted network segment"
        );
        info!(
            url = %format!("http://{}/{}", local_addr, file_name),
            fingerprint = %fingerprint,
            timeout = ?self.options.timeout,
            fetch_limit = ?self.options.stop_after_fetches,
            "distribution session started"
        );

        Ok(DistributionSession {
            local_addr,
            file_name,
            fingerprint,
            token,
            fetches,
            reason,
            stopped,
            handle: Some(handle),
        })
    }
}

async fn serve_bundle(
    State(state): State<ServeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> Response {
    if uri.path() != &*state.route {
        info!(%peer, path = uri.path(), "refused request for unknown path");
        return StatusCode::NOT_FOUND.into_response();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    if method == Method::HEAD {
        return (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            state.bundle.content().clone(),
        )
            .into_response();
    }

    let body = CountedBody {
        remaining: state.bundle.content().clone(),
        completion: Some((state, peer)),
    };
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

impl ServeState {
    fn record_fetch(&self, peer: SocketAddr) {
        let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%peer, count, "bundle fetched");

        if let Some(limit) = self.fetch_limit {
            if count >= limit {
                let _ = self.reason.set(StopReason::FetchLimitReached);
                self.token.cancel();
            }
        }
    }
}

/// Bundle body that records the fetch when the stream runs to its end.
///
/// Dropped early (client gone, write error) it records nothing.
struct CountedBody {
    remaining: Bytes,
    completion: Option<(ServeState, SocketAddr)>,
}

impl Stream for CountedBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.remaining.is_empty() {
            if let Some((state, peer)) = self.completion.take() {
                state.record_fetch(peer);
            }
            return Poll::Ready(None);
        }

        let len = self.remaining.len().min(CHUNK_SIZE);
        let chunk = self.remaining.split_to(len);
        Poll::Ready(Some(Ok(chunk)))
    }
}

/// A running distribution session, owned by the Authority.
#[derive(Debug)]
pub struct DistributionSession {
    local_addr: SocketAddr,
    file_name: String,
    fingerprint: String,
    token: CancellationToken,
    fetches: Arc<AtomicUsize>,
    reason: Arc<OnceLock<StopReason>>,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl DistributionSession {
    pub fn state(&self) -> SessionState {
        if self.handle.is_none() || self.stopped.load(Ordering::SeqCst) {
            SessionState::Stopped
        } else {
            SessionState::Serving
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}/{}", self.local_addr, self.file_name)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// GETs whose whole body has been sent so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Token that ends the session when cancelled (e.g. from a signal
    /// handler).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting connections and wait for the server to wind down.
    pub async fn stop(&mut self) -> Result<StopReason, ServeError> {
        let _ = self.reason.set(StopReason::Cancelled);
        self.token.cancel();
        self.finish().await
    }

    /// Wait for the session to end on its own (timeout, fetch limit, or
    /// external cancellation).
    pub async fn wait(&mut self) -> Result<StopReason, ServeError> {
        self.finish().await
    }

    async fn finish(&mut self) -> Result<StopReason, ServeError> {
        if let Some(handle) = self.handle.take() {
            let result = handle.await;
            // Recorded before the result is inspected so an I/O failure
            // still reports as a stopped session.
            self.stopped.store(true, Ordering::SeqCst);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(ServeError::Server(e)),
                Err(e) => return Err(ServeError::Task(e.to_string())),
            }
        }

        let reason = *self.reason.get_or_init(|| StopReason::Cancelled);
        info!(
            reason = ?reason,
            fetches = self.fetch_count(),
            "distribution session stopped"
        );
        Ok(reason)
    }
}

impl Drop for DistributionSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn write_bundle(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("bundle.p12");
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn get(url: &str) -> (u16, Vec<u8>) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status().as_u16();
        (status, response.bytes().await.unwrap().to_vec())
    }

    #[tokio::test]
    async fn test_serves_exact_bundle_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..3072u32).map(|i| (i % 251) as u8).collect();
        let path = write_bundle(temp_dir.path(), &content);

        let server = DistributionServer::new(&path, SessionOptions::new(loopback()));
        assert_eq!(server.state(), SessionState::NotStarted);

        let mut session = server.serve().await.unwrap();
        assert_eq!(session.state(), SessionState::Serving);

        for _ in 0..3 {
            let (status, body) = get(&session.url()).await;
            assert_eq!(status, 200);
            assert_eq!(body, content);
        }
        assert_eq!(session.fetch_count(), 3);

        assert_eq!(session.stop().await.unwrap(), StopReason::Cancelled);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_other_paths_are_refused() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");
        std::fs::write(temp_dir.path().join("secret.key"), b"do not serve").unwrap();

        let mut session = DistributionServer::new(&path, SessionOptions::new(loopback()))
            .serve()
            .await
            .unwrap();
        let base = format!("http://{}", session.local_addr());

        for other in ["/", "/secret.key", "/bundle.p12/", "/../bundle.p12x", "/bundle.p12.bak"] {
            let (status, _) = get(&format!("{}{}", base, other)).await;
            assert_eq!(status, 404, "path {} should be refused", other);
        }
        assert_eq!(session.fetch_count(), 0);

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");

        let mut session = DistributionServer::new(&path, SessionOptions::new(loopback()))
            .serve()
            .await
            .unwrap();
        let addr = session.local_addr();
        session.stop().await.unwrap();

        // Same port can be bound again
        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_ends_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");

        let options = SessionOptions::new(loopback()).with_timeout(Duration::from_millis(50));
        let mut session = DistributionServer::new(&path, options)
            .serve()
            .await
            .unwrap();

        assert_eq!(session.wait().await.unwrap(), StopReason::TimedOut);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_fetch_limit_ends_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");

        let options = SessionOptions::new(loopback())
            .with_timeout(Duration::from_secs(30))
            .with_fetch_limit(2);
        let mut session = DistributionServer::new(&path, options)
            .serve()
            .await
            .unwrap();

        assert_eq!(get(&session.url()).await.1, b"keystore");
        assert_eq!(get(&session.url()).await.1, b"keystore");

        assert_eq!(session.wait().await.unwrap(), StopReason::FetchLimitReached);
        assert_eq!(session.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_parent_token_cancels_session() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");
        let parent = CancellationToken::new();

        let options = SessionOptions::new(loopback()).with_cancellation(parent.clone());
        let mut session = DistributionServer::new(&path, options)
            .serve()
            .await
            .unwrap();

        parent.cancel();
        assert_eq!(session.wait().await.unwrap(), StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_stalled_request_does_not_outlive_timeout() {
        use tokio::io::AsyncWriteExt;

        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");

        let options = SessionOptions::new(loopback())
            .with_timeout(Duration::from_millis(300))
            .with_drain_timeout(Duration::from_millis(500));
        let mut session = DistributionServer::new(&path, options)
            .serve()
            .await
            .unwrap();

        // Half a request header, never finished
        let mut stalled = tokio::net::TcpStream::connect(session.local_addr())
            .await
            .unwrap();
        stalled
            .write_all(b"GET /bundle.p12 HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .expect("session outlived its timeout")
            .unwrap();
        assert_eq!(reason, StopReason::TimedOut);
        assert_eq!(session.state(), SessionState::Stopped);

        drop(stalled);
    }

    #[tokio::test]
    async fn test_aborted_transfer_does_not_count() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let temp_dir = TempDir::new().unwrap();
        // Larger than the loopback socket buffers so the transfer is still
        // in progress when the client goes away
        let content = vec![7u8; 32 * 1024 * 1024];
        let path = write_bundle(temp_dir.path(), &content);

        let options = SessionOptions::new(loopback())
            .with_timeout(Duration::from_secs(60))
            .with_fetch_limit(1);
        let mut session = DistributionServer::new(&path, options)
            .serve()
            .await
            .unwrap();

        let mut partial = tokio::net::TcpStream::connect(session.local_addr())
            .await
            .unwrap();
        partial
            .write_all(b"GET /bundle.p12 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut head = vec![0u8; 16 * 1024];
        partial.read_exact(&mut head).await.unwrap();
        drop(partial);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.fetch_count(), 0);
        assert_eq!(session.state(), SessionState::Serving);

        let (status, body) = get(&session.url()).await;
        assert_eq!(status, 200);
        assert_eq!(body.len(), content.len());

        assert_eq!(session.wait().await.unwrap(), StopReason::FetchLimitReached);
        assert_eq!(session.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_bundle_is_not_served() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"");

        let result = DistributionServer::new(&path, SessionOptions::new(loopback()))
            .serve()
            .await;
        assert!(matches!(
            result,
            Err(ServeError::Bundle(BundleError::Empty(_)))
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_bundle(temp_dir.path(), b"keystore");
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let result = DistributionServer::new(
            &path,
            SessionOptions::new(taken.local_addr().unwrap()),
        )
        .serve()
        .await;
        assert!(matches!(result, Err(ServeError::Bind { .. })));
    }
}
