//! Recognition service client
//!
//! Wire protocol:
//! - `POST {base}/v1/jobs` with `{image_url | image_base64, site, wait_ms}`
//!   returns a job document; `status` is `completed`, `pending` or `failed`.
//!   The service answers `pending` once `wait_ms` has passed without a result.
//! - `GET {base}/v1/jobs/{job_id}` returns the same document
//!
//! Redirects are followed manually: the endpoint is rebased onto the origin of
//! the `Location` header so that later calls (including polls) go straight to
//! the new host.
//!
//! Every call runs against one overall deadline: retries share it, and a
//! request that times out is never retried.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use vigil_common::config::ResolverConfig;
use zeroize::Zeroizing;

use crate::models::{ImageInput, ResolvedMatch, SiteMeta};
use crate::services::credentials::{Credential, CredentialProvider};

const USER_AGENT: &str = concat!("vigil-scan/", env!("CARGO_PKG_VERSION"));

/// Client-level failures; mapped onto `ScanError` at the orchestrator seam
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Recognition service did not answer within {0} ms")]
    Timeout(u64),

    #[error("Rate limited by recognition service")]
    RateLimited,

    #[error("Recognition service error {0}")]
    ServerError(u16),

    #[error("Recognition service rejected request with {0}")]
    ClientError(u16),

    #[error("Gave up after {0} redirects")]
    TooManyRedirects(u32),

    #[error("Recognition job failed: {0}")]
    JobFailed(String),

    #[error("Timed out waiting for job to complete")]
    PollTimeout,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Credential unavailable: {0}")]
    Credential(String),
}

impl ResolutionError {
    /// Transient failures that a poll loop treats as "still pending"
    fn is_pending_like(&self) -> bool {
        matches!(
            self,
            ResolutionError::Network(_)
                | ResolutionError::Timeout(_)
                | ResolutionError::RateLimited
                | ResolutionError::ServerError(503)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    #[serde(alias = "queued", alias = "processing")]
    Pending,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
struct JobDocument {
    job_id: String,
    status: JobStatus,
    #[serde(default)]
    matches: Vec<ResolvedMatch>,
    view_url: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<&'a str>,
    site: &'a SiteMeta,
    /// Longest the service may hold the request before answering `pending`
    wait_ms: u64,
}

/// Outcome of the synchronous submit call
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: String,
    pub status: JobStatus,
    pub matches: Vec<ResolvedMatch>,
    pub view_url: Option<String>,
    /// Result not ready; caller must poll
    pub deferred: bool,
    pub credential_ref: String,
}

/// Completed job fetched by polling
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub job_id: String,
    pub matches: Vec<ResolvedMatch>,
    pub view_url: Option<String>,
}

/// Poll delay schedule: grows ×1.5 per step, capped
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next_ms: u64,
    max_ms: u64,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max_ms = max.as_millis() as u64;
        Self {
            next_ms: (initial.as_millis() as u64).min(max_ms),
            max_ms,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next_ms;
        self.next_ms = (current.saturating_mul(3) / 2).min(self.max_ms);
        Duration::from_millis(current)
    }
}

impl Iterator for PollBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Seam between the scan pipeline and the recognition service
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn submit(&self, image: &ImageInput, site: &SiteMeta) -> Result<Submission, ResolutionError>;

    async fn poll_until_complete(
        &self,
        job_id: &str,
        deadline: Duration,
        initial_delay: Duration,
    ) -> Result<ResolutionResult, ResolutionError>;
}

pub struct ResolutionClient {
    http: reqwest::Client,
    endpoint: RwLock<Url>,
    credentials: Arc<CredentialProvider>,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    config: ResolverConfig,
}

impl ResolutionClient {
    pub fn new(config: ResolverConfig, credentials: Arc<CredentialProvider>) -> Result<Self, ResolutionError> {
        let endpoint = Url::parse(&config.base_url)
            .map_err(|e| ResolutionError::Parse(format!("resolver base_url '{}': {}", config.base_url, e)))?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ResolutionError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        Ok(Self {
            http,
            endpoint: RwLock::new(endpoint),
            credentials,
            rate_limiter,
            config,
        })
    }

    /// Base URL currently in use (changes after a redirect)
    pub async fn endpoint(&self) -> Url {
        self.endpoint.read().await.clone()
    }

    async fn credential(&self) -> Result<Credential, ResolutionError> {
        match self.credentials.current().await {
            Ok(Some(credential)) => Ok(credential),
            Ok(None) => Err(ResolutionError::Credential("no resolver API key configured".into())),
            Err(e) => Err(ResolutionError::Credential(e.to_string())),
        }
    }

    /// Send with redirect rebasing and, when `max_retries > 0`, retry on
    /// network failure, 5xx and 429
    ///
    /// All attempts share `budget`. A timed-out request is not retried, and
    /// no retry is started that could not finish inside the budget.
    async fn send<F>(
        &self,
        operation: &str,
        max_retries: u32,
        budget: Duration,
        build: F,
    ) -> Result<reqwest::Response, ResolutionError>
    where
        F: Fn(&Url) -> Result<reqwest::RequestBuilder, ResolutionError>,
    {
        let budget_ms = budget.as_millis() as u64;
        let deadline = Instant::now() + budget;
        let mut attempt = 0u32;
        let mut redirects = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, self.rate_limiter.until_ready())
                    .await
                    .is_err()
            {
                return Err(ResolutionError::Timeout(budget_ms));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let base = self.endpoint.read().await.clone();

            let failure = match build(&base)?.timeout(remaining).send().await {
                Ok(response) => {
                    let status = response.status();
                    if is_followed_redirect(status) {
                        redirects += 1;
                        if redirects > self.config.max_redirects {
                            return Err(ResolutionError::TooManyRedirects(self.config.max_redirects));
                        }
                        self.rebase(&response).await?;
                        continue;
                    }
                    if status.is_success() {
                        return Ok(response);
                    }
                    match status.as_u16() {
                        429 => ResolutionError::RateLimited,
                        code @ 500..=599 => ResolutionError::ServerError(code),
                        code @ (401 | 403) => {
                            self.credentials.invalidate().await;
                            return Err(ResolutionError::ClientError(code));
                        }
                        code => return Err(ResolutionError::ClientError(code)),
                    }
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(operation, budget_ms, "Resolver request timed out");
                    return Err(ResolutionError::Timeout(budget_ms));
                }
                Err(e) => ResolutionError::Network(e.to_string()),
            };

            if attempt >= max_retries {
                return Err(failure);
            }

            let delay = Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(16)));
            if delay >= deadline.saturating_duration_since(Instant::now()) {
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %failure,
                    "No time left to retry resolver request"
                );
                return Err(failure);
            }
            tracing::warn!(
                operation,
                attempt = attempt + 1,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Resolver request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn rebase(&self, response: &reqwest::Response) -> Result<(), ResolutionError> {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ResolutionError::Parse("redirect without Location header".into()))?;

        let new_base = rebase_origin(response.url(), location)?;
        tracing::info!(from = %response.url(), to = %new_base, "Resolver endpoint redirected");
        *self.endpoint.write().await = new_base;
        Ok(())
    }

    fn request_budget(&self) -> Duration {
        Duration::from_millis(self.config.submit_timeout_ms)
    }

    async fn fetch_job(&self, job_id: &str, credential: &Credential) -> Result<JobDocument, ResolutionError> {
        let path = format!("v1/jobs/{}", job_id);
        let response = self
            .send("poll", 0, self.request_budget(), |base| {
                Ok(self.http.get(join(base, &path)?).bearer_auth(credential.secret()))
            })
            .await?;

        response
            .json::<JobDocument>()
            .await
            .map_err(|e| ResolutionError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Resolver for ResolutionClient {
    async fn submit(&self, image: &ImageInput, site: &SiteMeta) -> Result<Submission, ResolutionError> {
        let credential = self.credential().await?;

        let encoded: Option<Zeroizing<String>> = match image {
            ImageInput::Bytes(bytes) => Some(Zeroizing::new(
                base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()),
            )),
            ImageInput::Url(_) => None,
        };
        let body = SubmitBody {
            image_url: match image {
                ImageInput::Url(url) => Some(url.as_str()),
                ImageInput::Bytes(_) => None,
            },
            image_base64: encoded.as_ref().map(|s| s.as_str()),
            site,
            wait_ms: self.config.submit_wait_ms.min(self.config.submit_timeout_ms),
        };

        let started = Instant::now();
        let response = self
            .send("submit", self.config.max_retries, self.request_budget(), |base| {
                Ok(self
                    .http
                    .post(join(base, "v1/jobs")?)
                    .bearer_auth(credential.secret())
                    .json(&body))
            })
            .await?;

        let job: JobDocument = response
            .json()
            .await
            .map_err(|e| ResolutionError::Parse(e.to_string()))?;

        tracing::debug!(
            job_id = %job.job_id,
            status = ?job.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resolver accepted job"
        );

        if job.status == JobStatus::Failed {
            return Err(ResolutionError::JobFailed(job.error.unwrap_or_else(|| "unspecified".into())));
        }

        Ok(Submission {
            deferred: job.status == JobStatus::Pending,
            job_id: job.job_id,
            status: job.status,
            matches: job.matches,
            view_url: job.view_url,
            credential_ref: credential.reference(),
        })
    }

    async fn poll_until_complete(
        &self,
        job_id: &str,
        deadline: Duration,
        initial_delay: Duration,
    ) -> Result<ResolutionResult, ResolutionError> {
        let credential = self.credential().await?;
        let started = Instant::now();
        let mut backoff = PollBackoff::new(initial_delay, Duration::from_millis(self.config.poll_max_delay_ms));

        loop {
            match self.fetch_job(job_id, &credential).await {
                Ok(job) => match job.status {
                    JobStatus::Completed => {
                        return Ok(ResolutionResult {
                            job_id: job.job_id,
                            matches: job.matches,
                            view_url: job.view_url,
                        })
                    }
                    JobStatus::Failed => {
                        return Err(ResolutionError::JobFailed(job.error.unwrap_or_else(|| "unspecified".into())))
                    }
                    JobStatus::Pending => {}
                },
                Err(e) if e.is_pending_like() => {
                    tracing::debug!(job_id, error = %e, "Transient poll failure, treating as pending");
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::warn!(job_id, elapsed_ms = elapsed.as_millis() as u64, "Polling deadline exceeded");
                return Err(ResolutionError::PollTimeout);
            }
            let delay = backoff.next_delay().min(deadline - elapsed);
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Origin of `location` resolved against the URL that produced it
fn rebase_origin(current: &Url, location: &str) -> Result<Url, ResolutionError> {
    let target = current
        .join(location)
        .map_err(|e| ResolutionError::Parse(format!("bad Location '{}': {}", location, e)))?;

    let origin = target.origin();
    if !origin.is_tuple() {
        return Err(ResolutionError::Parse(format!("Location '{}' has no origin", location)));
    }
    Url::parse(&origin.ascii_serialization()).map_err(|e| ResolutionError::Parse(e.to_string()))
}

/// Append `path` to `base`, keeping any path prefix on the base
fn join(base: &Url, path: &str) -> Result<Url, ResolutionError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| ResolutionError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_delay_sequence() {
        let delays: Vec<u64> = PollBackoff::new(Duration::from_millis(5_000), Duration::from_millis(30_000))
            .take(8)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5_000, 7_500, 11_250, 16_875, 25_312, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn test_rebase_keeps_only_origin() {
        let current = Url::parse("http://old.example:8600/v1/jobs").unwrap();
        let rebased = rebase_origin(&current, "https://new.example:9443/v1/jobs?x=1").unwrap();
        assert_eq!(rebased.as_str(), "https://new.example:9443/");
    }

    #[test]
    fn test_rebase_relative_location_stays_on_host() {
        let current = Url::parse("http://old.example:8600/v1/jobs").unwrap();
        let rebased = rebase_origin(&current, "/elsewhere").unwrap();
        assert_eq!(rebased.as_str(), "http://old.example:8600/");
    }

    #[test]
    fn test_join_preserves_prefix() {
        let base = Url::parse("http://host/api/").unwrap();
        assert_eq!(join(&base, "v1/jobs").unwrap().as_str(), "http://host/api/v1/jobs");
        let base = Url::parse("http://host").unwrap();
        assert_eq!(join(&base, "v1/jobs/abc").unwrap().as_str(), "http://host/v1/jobs/abc");
    }

    #[test]
    fn test_job_status_aliases() {
        let status: JobStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(status, JobStatus::Pending);
        let status: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, JobStatus::Completed);
    }
}
