//! Retrying HTTP client for the job ledger.
//!
//! Every request carries the runner's basic-auth credential. Connection
//! failures and unexpected HTTP statuses are retried after each delay of the
//! retry schedule in turn; a 404 is returned at once as [`TransportError::NotFound`].
//! When the schedule is used up the error is fatal to the runner.

use crate::config::RunnerConfig;
use cbt_common::protocol::{DUMP_PART, paths};
use cbt_common::{CtsResult, CtsSubmission, ErrorCode, JobBody, JobId, JobStatus, LitResult, StatusUpdate};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Delays slept before each retry: immediately, a minute, an hour, two hours.
pub const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Covers the whole exchange, including dump uploads.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("ledger has no resource at {path}")]
    NotFound { path: String },

    #[error("ledger request {path} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        path: String,
        attempts: usize,
        last_error: String,
    },

    #[error("failed to decode ledger response from {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("failed to read dump archive {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::LedgerJobNotFound,
            Self::Exhausted { .. } => ErrorCode::LedgerRetriesExhausted,
            Self::Decode { .. } => ErrorCode::LedgerDecodeError,
            Self::Attachment { .. } => ErrorCode::DumpAttachFailed,
            Self::Client(_) => ErrorCode::LedgerUnreachable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Ledger session: base URL, credential and retry policy.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    http: Client,
    base_url: String,
    runner_name: String,
    runner_key: String,
    retry_schedule: Vec<Duration>,
    request_timeout: Duration,
}

impl LedgerClient {
    /// `base_url` must end in `/`.
    pub fn new(
        base_url: impl Into<String>,
        runner_name: impl Into<String>,
        runner_key: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let http = Client::builder()
            .user_agent(concat!("cbt-wkr/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            runner_name: runner_name.into(),
            runner_key: runner_key.into(),
            retry_schedule: RETRY_SCHEDULE.to_vec(),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self, TransportError> {
        Self::new(
            config.ledger_url.value.clone(),
            config.runner_name.value.clone(),
            config.runner_key.value.clone(),
        )
    }

    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    /// A request that gets no full answer within `timeout` counts as a
    /// failed attempt.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    /// Lease the oldest queued job. `None` when the queue is empty.
    pub async fn lease(&self) -> Result<Option<JobBody>, TransportError> {
        let response = self
            .send(paths::DISPATCH, || self.request(Method::POST, paths::DISPATCH))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(paths::DISPATCH, response).await.map(Some)
    }

    pub async fn job(&self, id: JobId) -> Result<JobBody, TransportError> {
        let path = paths::job(id);
        let response = self.send(&path, || self.request(Method::GET, &path)).await?;
        decode(&path, response).await
    }

    pub async fn job_status(&self, id: JobId) -> Result<JobStatus, TransportError> {
        Ok(self.job(id).await?.status)
    }

    /// Write a status. Returns the job as the ledger now holds it.
    pub async fn update_status(
        &self,
        id: JobId,
        update: &StatusUpdate,
    ) -> Result<JobBody, TransportError> {
        let path = paths::job(id);
        let response = self
            .send(&path, || self.request(Method::PUT, &path).json(update))
            .await?;
        decode(&path, response).await
    }

    pub async fn post_lit_result(&self, id: JobId, result: &LitResult) -> Result<(), TransportError> {
        let path = paths::lit(id);
        self.send(&path, || self.request(Method::POST, &path).json(result))
            .await?;
        Ok(())
    }

    /// Submit a CTS result, attaching its dump archive when there is one.
    pub async fn post_cts_result(&self, id: JobId, result: &CtsResult) -> Result<(), TransportError> {
        let path = paths::cts(id);
        let fields = CtsSubmission::form_fields(result);

        let dump = match &result.dump_path {
            Some(dump_path) => {
                let bytes = tokio::fs::read(dump_path).await.map_err(|source| {
                    TransportError::Attachment {
                        path: dump_path.clone(),
                        source,
                    }
                })?;
                let file_name = dump_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "dump.tar.gz".to_string());
                Some((file_name, bytes))
            }
            None => None,
        };

        // Multipart bodies are consumed on send, so each attempt builds its own.
        let form = || {
            let mut form = Form::new();
            for (name, value) in &fields {
                form = form.text(*name, value.clone());
            }
            if let Some((file_name, bytes)) = &dump {
                form = form.part(
                    DUMP_PART,
                    Part::bytes(bytes.clone()).file_name(file_name.clone()),
                );
            }
            form
        };

        self.send(&path, || self.request(Method::POST, &path).multipart(form()))
            .await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.request_timeout)
            .basic_auth(&self.runner_name, Some(&self.runner_key))
    }

    async fn send<F>(&self, path: &str, build: F) -> Result<Response, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delays = self.retry_schedule.iter();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let last_error = match build().send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    debug!("Ledger returned 404 for {}", path);
                    return Err(TransportError::NotFound {
                        path: path.to_string(),
                    });
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let code = if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        ErrorCode::LedgerAuthFailed
                    } else {
                        ErrorCode::LedgerHttpError
                    };
                    warn!(
                        error_code = %code.code_string(),
                        "Ledger answered {} for {} (attempt {})", status, path, attempts
                    );
                    format!("HTTP {status}")
                }
                Err(e) => {
                    warn!(
                        error_code = %ErrorCode::LedgerUnreachable.code_string(),
                        "Ledger request {} failed (attempt {}): {}", path, attempts, e
                    );
                    e.to_string()
                }
            };

            match delays.next() {
                Some(delay) => {
                    if !delay.is_zero() {
                        debug!(
                            "Retrying {} in {}",
                            path,
                            humantime::format_duration(*delay)
                        );
                        tokio::time::sleep(*delay).await;
                    }
                }
                None => {
                    return Err(TransportError::Exhausted {
                        path: path.to_string(),
                        attempts,
                        last_error,
                    });
                }
            }
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    path: &str,
    response: Response,
) -> Result<T, TransportError> {
    response.json::<T>().await.map_err(|e| TransportError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const JOB_JSON: &str =
        r#"{"pk": 7, "revision_hash": "abc", "status": "T", "run_lit_all": true}"#;

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    /// Answers 503 `failures` times, then the job body.
    fn flaky_router(failures: usize, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/job/7/",
                get(move |State(hits): State<Arc<AtomicUsize>>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        (
                            [(axum::http::header::CONTENT_TYPE, "application/json")],
                            JOB_JSON,
                        )
                            .into_response()
                    }
                }),
            )
            .with_state(hits)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_follow_schedule() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn(flaky_router(3, Arc::clone(&hits))).await;
        let client = LedgerClient::new(base, "runner", "key").unwrap();

        let start = tokio::time::Instant::now();
        let job = client.job(JobId(7)).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(job.id, JobId(7));
        assert_eq!(job.status, JobStatus::Testing);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(elapsed >= Duration::from_secs(60 + 3600), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(60 + 3600 + 7200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/job/9/",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }),
            )
            .with_state(Arc::clone(&hits));
        let client = LedgerClient::new(spawn(router).await, "runner", "key").unwrap();

        let start = tokio::time::Instant::now();
        let err = client.job(JobId(9)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.code(), ErrorCode::LedgerJobNotFound);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_connection_failures_exhaust_schedule() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LedgerClient::new(format!("http://{addr}/"), "runner", "key")
            .unwrap()
            .with_retry_schedule(vec![Duration::ZERO, Duration::from_millis(5)]);

        match client.lease().await.unwrap_err() {
            TransportError::Exhausted { attempts, path, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(path, "dispatch/");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_lease_no_content() {
        let router = Router::new().route("/dispatch/", post(|| async { AxumStatus::NO_CONTENT }));
        let client = LedgerClient::new(spawn(router).await, "runner", "key").unwrap();
        assert!(client.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_ledger_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = LedgerClient::new(format!("http://{addr}/"), "runner", "key")
            .unwrap()
            .with_retry_schedule(vec![Duration::ZERO])
            .with_request_timeout(Duration::from_millis(200));

        let outcome = tokio::time::timeout(Duration::from_secs(10), client.lease())
            .await
            .expect("lease hung on a silent ledger");
        match outcome.unwrap_err() {
            TransportError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_attachment_is_reported() {
        let client = LedgerClient::new("http://127.0.0.1:9/", "runner", "key").unwrap();
        let now = chrono::Utc::now();
        let result = CtsResult {
            test_category: "basic".to_string(),
            test_name: "test1".to_string(),
            passing: true,
            timedout: false,
            start_time: now,
            end_time: now,
            standard_output: String::new(),
            standard_error: String::new(),
            test_executable: String::new(),
            test_arguments: String::new(),
            suite_version: String::new(),
            toolchain_version: String::new(),
            runtime_version: String::new(),
            dump_path: Some(PathBuf::from("/nonexistent/dump.tar.gz")),
        };
        let err = client.post_cts_result(JobId(1), &result).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DumpAttachFailed);
    }
}
