//! Retrieving client (Follower only).
//!
//! Polls the Authority's distribution endpoint until the bundle comes back,
//! with bounded attempts and a delay between them. Followers are not told
//! when the Authority starts serving; "not up yet" is handled exactly like a
//! network failure, by retrying.
//!
//! A response only counts as success when it is a 2xx with a non-empty
//! body. Empty or truncated transfers are transient failures.

use crate::bundle::{BundleError, TrustBundle};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why one attempt failed. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("empty response body")]
    EmptyBody,

    #[error("transfer failed: {0}")]
    Transfer(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("gave up on {url} after {attempts} attempts; last failure: {last_failure}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_failure: FetchFailure,
    },

    #[error("retry policy allows no attempts")]
    NoAttempts,

    #[error("invalid destination '{0}': expected a file path")]
    InvalidDestination(PathBuf),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Performs a single fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchFailure>;
}

/// Plain HTTP GET with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            // The Authority is on the local segment; never route through a proxy
            .no_proxy()
            .user_agent(concat!("trustseed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RetrievalError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout
    } else if err.is_connect() {
        FetchFailure::Connect(err.to_string())
    } else {
        FetchFailure::Transfer(err.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchFailure> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let expected = response.content_length();
        let body = response.bytes().await.map_err(classify)?;
        if let Some(expected) = expected {
            if body.len() as u64 != expected {
                return Err(FetchFailure::Transfer(format!(
                    "received {} of {} bytes",
                    body.len(),
                    expected
                )));
            }
        }

        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure(FetchFailure),
}

/// One try at fetching the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalAttempt {
    /// 1-based.
    pub index: u32,
    pub url: String,
    pub outcome: AttemptOutcome,
}

/// All attempts made for one retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalCampaign {
    pub url: String,
    pub max_attempts: u32,
    pub attempts: Vec<RetrievalAttempt>,
}

impl RetrievalCampaign {
    fn new(url: &str, max_attempts: u32) -> Self {
        Self {
            url: url.to_string(),
            max_attempts,
            attempts: Vec::new(),
        }
    }

    fn record(&mut self, outcome: AttemptOutcome) -> u32 {
        let index = self.attempts.len() as u32 + 1;
        self.attempts.push(RetrievalAttempt {
            index,
            url: self.url.clone(),
            outcome,
        });
        index
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.attempts.last().map(|a| &a.outcome),
            Some(AttemptOutcome::Success)
        )
    }
}

/// A successfully retrieved bundle.
#[derive(Debug)]
pub struct Retrieved {
    pub bundle: TrustBundle,
    pub path: PathBuf,
    pub campaign: RetrievalCampaign,
}

pub struct RetrievingClient {
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
}

impl RetrievingClient {
    pub fn new(fetcher: Arc<dyn Fetcher>, policy: RetryPolicy) -> Self {
        Self { fetcher, policy }
    }

    /// HTTP client with the given per-request timeout.
    pub fn http(policy: RetryPolicy, request_timeout: Duration) -> Result<Self, RetrievalError> {
        Ok(Self::new(Arc::new(HttpFetcher::new(request_timeout)?), policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `source_url` into `dest_path`.
    ///
    /// The destination is written only after a successful attempt, and
    /// atomically. On exhaustion nothing is written.
    pub async fn retrieve(
        &self,
        source_url: &str,
        dest_path: &Path,
    ) -> Result<Retrieved, RetrievalError> {
        let (dir, file_name) = split_destination(dest_path)?;
        if self.policy.max_attempts == 0 {
            return Err(RetrievalError::NoAttempts);
        }

        let mut campaign = RetrievalCampaign::new(source_url, self.policy.max_attempts);
        let mut last_failure = FetchFailure::Connect("no attempt made".to_string());

        info!(
            url = source_url,
            max_attempts = self.policy.max_attempts,
            "retrieving trust bundle"
        );

        for attempt in 1..=self.policy.max_attempts {
            let result = match self.fetcher.fetch(source_url).await {
                Ok(body) if body.is_empty() => Err(FetchFailure::EmptyBody),
                other => other,
            };

            match result {
                Ok(body) => {
                    campaign.record(AttemptOutcome::Success);
                    let bundle = TrustBundle::new(file_name, body)?;
                    let path = bundle.write_atomic(dir)?;

                    info!(
                        attempt,
                        bytes = bundle.len(),
                        fingerprint = %bundle.fingerprint(),
                        "trust bundle retrieved"
                    );
                    return Ok(Retrieved {
                        bundle,
                        path,
                        campaign,
                    });
                }
                Err(failure) => {
                    campaign.record(AttemptOutcome::TransientFailure(failure.clone()));

                    match self.policy.delay_after(attempt) {
                        Some(delay) => {
                            debug!(
                                attempt,
                                max_attempts = self.policy.max_attempts,
                                %failure,
                                retry_in = ?delay,
                                "bundle not retrievable yet"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(attempt, %failure, "final retrieval attempt failed");
                        }
                    }
                    last_failure = failure;
                }
            }
        }

        Err(RetrievalError::Exhausted {
            url: source_url.to_string(),
            attempts: campaign.attempt_count(),
            last_failure,
        })
    }
}

fn split_destination(dest_path: &Path) -> Result<(&Path, &str), RetrievalError> {
    let invalid = || RetrievalError::InvalidDestination(dest_path.to_path_buf());
    let file_name = dest_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(invalid)?;
    let dir = match dest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::Instant;

    /// Replays a fixed script of results and records when each call came in.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Bytes, FetchFailure>>>,
        fallback: Result<Bytes, FetchFailure>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Bytes, FetchFailure>>, fallback: Result<Bytes, FetchFailure>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn always_refused() -> Arc<Self> {
            Self::new(Vec::new(), Err(FetchFailure::Connect("refused".into())))
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchFailure> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    const URL: &str = "http://10.0.0.10:8000/bundle.p12";

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_exactly_max_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");
        let fetcher = ScriptedFetcher::always_refused();
        let client = RetrievingClient::new(
            fetcher.clone(),
            RetryPolicy::fixed(50, Duration::from_secs(5)),
        );

        let err = client.retrieve(URL, &dest).await.unwrap_err();

        match err {
            RetrievalError::Exhausted { attempts, url, last_failure } => {
                assert_eq!(attempts, 50);
                assert_eq!(url, URL);
                assert!(matches!(last_failure, FetchFailure::Connect(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }

        // Exactly 50 calls, each 5s apart, never a 51st
        let times = fetcher.call_times();
        assert_eq!(times.len(), 50);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }

        // Nothing written on failure
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_k_stops_retrying() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");
        let content = Bytes::from(vec![42u8; 3 * 1024]);

        let fetcher = ScriptedFetcher::new(
            vec![
                Err(FetchFailure::Connect("refused".into())),
                Err(FetchFailure::Status(503)),
                Ok(content.clone()),
            ],
            Err(FetchFailure::Timeout),
        );
        let client = RetrievingClient::new(
            fetcher.clone(),
            RetryPolicy::fixed(50, Duration::from_secs(5)),
        );

        let retrieved = client.retrieve(URL, &dest).await.unwrap();

        assert_eq!(fetcher.call_times().len(), 3);
        assert_eq!(retrieved.campaign.attempt_count(), 3);
        assert!(retrieved.campaign.succeeded());
        assert_eq!(retrieved.campaign.attempts[2].index, 3);
        assert_eq!(retrieved.bundle.content(), &content);
        assert_eq!(std::fs::read(&dest).unwrap(), content.to_vec());
        assert_eq!(retrieved.path, dest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");

        let fetcher = ScriptedFetcher::new(
            vec![Ok(Bytes::new()), Ok(Bytes::from_static(b"keystore"))],
            Err(FetchFailure::Timeout),
        );
        let client = RetrievingClient::new(fetcher, RetryPolicy::fixed(5, Duration::from_secs(1)));

        let retrieved = client.retrieve(URL, &dest).await.unwrap();
        assert_eq!(
            retrieved.campaign.attempts[0].outcome,
            AttemptOutcome::TransientFailure(FetchFailure::EmptyBody)
        );
        assert_eq!(retrieved.bundle.content().as_ref(), b"keystore");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_only_exhausts() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("bundle.p12");

        let fetcher = ScriptedFetcher::new(Vec::new(), Ok(Bytes::new()));
        let client = RetrievingClient::new(fetcher, RetryPolicy::fixed(3, Duration::from_secs(1)));

        let err = client.retrieve(URL, &dest).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Exhausted {
                attempts: 3,
                last_failure: FetchFailure::EmptyBody,
                ..
            }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_zero_attempts_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let client = RetrievingClient::new(
            ScriptedFetcher::always_refused(),
            RetryPolicy::fixed(0, Duration::from_secs(1)),
        );

        let err = client
            .retrieve(URL, &temp_dir.path().join("bundle.p12"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::NoAttempts));
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
        let result = fetcher
            .fetch(&format!("http://127.0.0.1:{}/bundle.p12", port))
            .await;

        assert!(matches!(result, Err(FetchFailure::Connect(_))));
    }
}
