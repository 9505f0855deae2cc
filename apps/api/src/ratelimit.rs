//! Fixed-window request counter in Redis, keyed by scope and client IP.
//!
//! Fails open: if Redis is unreachable the request is allowed and a warning logged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

/// Per-key hit counter backing the limiter.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Increments `key` and returns the new count; the first hit starts a `ttl_secs` expiry.
    async fn hit(&self, key: &str, ttl_secs: u64) -> redis::RedisResult<i64>;
}

#[async_trait]
impl WindowCounter for MultiplexedConnection {
    async fn hit(&self, key: &str, ttl_secs: u64) -> redis::RedisResult<i64> {
        // Clones share the one underlying socket.
        let mut conn = self.clone();
        let count: i64 = conn.incr(key, 1i64).await?;
        if count == 1 {
            let _: bool = conn.expire(key, ttl_secs as i64).await?;
        }
        Ok(count)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn WindowCounter>,
    max_attempts: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn WindowCounter>, max_attempts: u32, window_secs: u64) -> Self {
        Self {
            counter,
            max_attempts: max_attempts.max(1),
            window_secs: window_secs.max(1),
        }
    }

    /// Opens the shared multiplexed connection once; every check reuses it.
    pub async fn connect(
        client: &redis::Client,
        max_attempts: u32,
        window_secs: u64,
    ) -> redis::RedisResult<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(Arc::new(conn), max_attempts, window_secs))
    }

    pub async fn check(&self, scope: &str, client_key: &str) -> RateDecision {
        let now = Utc::now().timestamp().max(0) as u64;
        let (key, retry_after_secs) = window_key(scope, client_key, now, self.window_secs);

        match self.counter.hit(&key, self.window_secs).await {
            Ok(count) => decide(count, self.max_attempts, retry_after_secs),
            Err(e) => {
                warn!(scope, "Rate limiter unavailable, allowing request: {e}");
                RateDecision::Allowed {
                    remaining: self.max_attempts,
                }
            }
        }
    }

    /// Checks the limit for the request's client and turns a refusal into a 429,
    /// recording a `rate_limit_exceeded` audit event.
    pub async fn enforce(&self, scope: &str, audit: &AuditLogger) -> Result<(), AppError> {
        let client_key = audit.context().ip.as_deref().unwrap_or("unknown");
        match self.check(scope, client_key).await {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after_secs } => {
                audit
                    .log(
                        AuditEvent::new(AuditEventType::RateLimitExceeded)
                            .resource(scope)
                            .detail("limit", self.max_attempts)
                            .detail("window_secs", self.window_secs)
                            .failed("too many attempts"),
                    )
                    .await;
                Err(AppError::RateLimited { retry_after_secs })
            }
        }
    }
}

/// Redis key for the window containing `now`, and seconds until that window closes.
fn window_key(scope: &str, client_key: &str, now: u64, window_secs: u64) -> (String, u64) {
    let window = now / window_secs;
    let retry_after = window_secs - (now % window_secs);
    (format!("ratelimit:{scope}:{client_key}:{window}"), retry_after)
}

fn decide(count: i64, max_attempts: u32, retry_after_secs: u64) -> RateDecision {
    if count > i64::from(max_attempts) {
        RateDecision::Limited { retry_after_secs }
    } else {
        RateDecision::Allowed {
            remaining: (i64::from(max_attempts) - count).max(0) as u32,
        }
    }
}
