//! Modbus client: one exchange at a time, retried with exponential backoff
//!
//! Per request the client walks `Sending -> AwaitingReply -> Decoded`, or
//! loops back through `Retrying` until the attempt budget is spent.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::codec::{self, Request, Response};
use crate::error::{AttemptError, ClientError, CodecError, Retryability};
use crate::transport::Transport;

/// Retry policy for a single request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Apply ±25% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);

        let mut delay = if factor.is_finite() {
            self.initial_backoff.mul_f64(factor.min(1e6))
        } else {
            self.max_backoff
        };
        if delay > self.max_backoff {
            delay = self.max_backoff;
        }

        if self.jitter && !delay.is_zero() {
            let range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-range..=range);
            delay = Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64);
        }
        delay
    }
}

/// Owns the transport; callers share it through the worker queue
pub struct Client<T: Transport> {
    transport: T,
    reply_timeout: Duration,
    policy: RetryPolicy,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, reply_timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            transport,
            reply_timeout,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one request to completion
    pub async fn execute(&mut self, request: &Request) -> Result<Response, ClientError> {
        let frame = request
            .encode()
            .map_err(|e| ClientError::TransportUnavailable(format!("cannot encode request: {e}")))?;
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(&frame, request).await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!("{:?} succeeded on attempt {}", request, attempt);
                    }
                    return Ok(response);
                },
                Err(err) => err,
            };

            match (err.retryability(), err) {
                (Retryability::Terminal, AttemptError::Codec(CodecError::Exception { code, .. })) => {
                    warn!("{:?} rejected by device: {}", request, code);
                    return Err(ClientError::Rejected(code));
                },
                (Retryability::Terminal, err) => {
                    warn!("{:?} failed on {}: {}", request, self.transport.name(), err);
                    return Err(ClientError::TransportUnavailable(err.to_string()));
                },
                (Retryability::Retryable, err) if attempt >= max_attempts => {
                    warn!("{:?} gave up after {} attempts: {}", request, attempt, err);
                    return Err(ClientError::Unreachable {
                        attempts: attempt,
                        last: err,
                    });
                },
                (Retryability::Retryable, err) => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        "{:?} attempt {}/{} failed ({}), retrying in {:?}",
                        request, attempt, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    async fn attempt(&mut self, frame: &[u8], request: &Request) -> Result<Response, AttemptError> {
        let reply = self
            .transport
            .send_and_receive(frame, self.reply_timeout)
            .await?;
        Ok(codec::decode(&reply, request)?)
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport.name())
            .field("reply_timeout", &self.reply_timeout)
            .field("policy", &self.policy)
            .finish()
    }
}
