//! Resilience patterns for directory service calls.
//!
//! Provides retry logic with exponential backoff, and a service decorator that
//! bounds every call with a timeout.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DirectoryError, DirectoryResult};
use crate::ids::{DirectoryId, GrantId, PrincipalId};
use crate::traits::{AuditOp, DirectoryReader, DirectoryService, ExclusionOp, ExpulsionOp, GrantOp};
use crate::types::{
    DirectoryInfo, Exclusion, ExpulsionRecord, GrantInfo, Page, PageRequest, PrincipalSnapshot,
};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Upper bound of a single attempt; an attempt that runs longer fails
    /// with a transient timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Longest time one `execute` call can take: every attempt timing out plus
    /// every backoff delay at its cap.
    #[must_use]
    pub fn budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let delay = self.max_delay.mul_f64(if self.jitter { 1.25 } else { 1.0 });
        self.attempt_timeout * attempts + delay * (attempts - 1)
    }
}

/// Retry executor with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a new retry executor with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calculate delay after a failed attempt (0-indexed).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.config.max_delay.as_millis() as f64);

        let final_delay = if self.config.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand_simple() * 0.25);
            delay_ms * jitter_factor
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Execute an operation, retrying transient failures.
    ///
    /// Each attempt is bounded by `attempt_timeout`. The last error is returned
    /// once attempts are exhausted. Permanent errors are returned immediately.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> DirectoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DirectoryResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match with_timeout(self.config.attempt_timeout, operation()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let is_last = attempt + 1 >= max_attempts;
                    if !e.is_transient() || is_last {
                        if e.is_transient() {
                            warn!(
                                attempts = attempt + 1,
                                error = %e,
                                "Retries exhausted"
                            );
                        }
                        return Err(e);
                    }

                    let delay = self.retry_delay(&e, attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff delay, stretched to honour a service-provided retry hint.
    fn retry_delay(&self, error: &DirectoryError, attempt: u32) -> Duration {
        let backoff = self.calculate_delay(attempt);
        match error {
            DirectoryError::RateLimited {
                retry_after_ms: Some(ms),
            } => backoff.max(Duration::from_millis(*ms).min(self.config.max_delay)),
            _ => backoff,
        }
    }
}

/// Run a call, failing with [`DirectoryError::Timeout`] once `limit` elapses.
pub async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> DirectoryResult<T>
where
    Fut: Future<Output = DirectoryResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DirectoryError::timeout(limit)),
    }
}

/// Directory service decorator that bounds every call, reads included.
#[derive(Clone)]
pub struct TimeoutDirectory {
    inner: Arc<dyn DirectoryService>,
    limit: Duration,
}

impl TimeoutDirectory {
    #[must_use]
    pub fn new(inner: Arc<dyn DirectoryService>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl std::fmt::Debug for TimeoutDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutDirectory")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DirectoryReader for TimeoutDirectory {
    async fn fetch_directory(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Option<DirectoryInfo>> {
        with_timeout(self.limit, self.inner.fetch_directory(directory)).await
    }

    async fn fetch_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<PrincipalSnapshot>> {
        with_timeout(self.limit, self.inner.fetch_principal(directory, principal)).await
    }

    async fn fetch_grant(
        &self,
        directory: DirectoryId,
        grant: GrantId,
    ) -> DirectoryResult<Option<GrantInfo>> {
        with_timeout(self.limit, self.inner.fetch_grant(directory, grant)).await
    }

    async fn list_principals(
        &self,
        directory: DirectoryId,
        page: PageRequest,
    ) -> DirectoryResult<Page<PrincipalSnapshot>> {
        with_timeout(self.limit, self.inner.list_principals(directory, page)).await
    }
}

#[async_trait]
impl GrantOp for TimeoutDirectory {
    async fn add_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()> {
        with_timeout(self.limit, self.inner.add_grant(directory, principal, grant)).await
    }

    async fn remove_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()> {
        with_timeout(self.limit, self.inner.remove_grant(directory, principal, grant)).await
    }
}

#[async_trait]
impl ExclusionOp for TimeoutDirectory {
    async fn list_exclusions(&self, directory: DirectoryId) -> DirectoryResult<Vec<Exclusion>> {
        with_timeout(self.limit, self.inner.list_exclusions(directory)).await
    }

    async fn fetch_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<Exclusion>> {
        with_timeout(self.limit, self.inner.fetch_exclusion(directory, principal)).await
    }

    async fn add_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        with_timeout(self.limit, self.inner.add_exclusion(directory, principal, reason)).await
    }

    async fn remove_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        with_timeout(self.limit, self.inner.remove_exclusion(directory, principal, reason)).await
    }
}

#[async_trait]
impl ExpulsionOp for TimeoutDirectory {
    async fn remove_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        with_timeout(self.limit, self.inner.remove_principal(directory, principal, reason)).await
    }
}

#[async_trait]
impl AuditOp for TimeoutDirectory {
    async fn latest_expulsion(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Option<ExpulsionRecord>> {
        with_timeout(self.limit, self.inner.latest_expulsion(directory)).await
    }
}

/// Simple pseudo-random number generator for jitter.
/// Not cryptographically secure, but sufficient for jitter.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}
