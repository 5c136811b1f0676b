//! Per-provider connection pooling and usage-context admission control.
//!
//! Each configured provider gets one `nntp_rs::NntpPool` sized to its
//! `max_connections`. Layered on top is a pair of semaphores that split
//! those connections into a "general" share and a "streaming reserve":
//! `Streaming` leases may draw from either, everything else only draws
//! from the general share. This guarantees a streaming WebDAV read can
//! always make progress even when the queue processor has saturated the
//! pool with `Queue`-context work, the admission-control scheme described
//! for the connection pool component.

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::types::UsageContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A pool for a single configured NNTP provider.
pub struct ProviderPool {
    /// host:port, used in error messages and provider-stat keys.
    pub name: String,
    /// Configured role/priority, used by the client's ordering logic.
    pub priority: i32,
    /// `true` for a primary provider, `false` for a failover backup.
    pub is_primary: bool,
    inner: nntp_rs::NntpPool,
    general: Arc<Semaphore>,
    reserved: Arc<Semaphore>,
    health: ProviderHealth,
}

struct ProviderHealth {
    consecutive_failures: AtomicU64,
    unhealthy_until_epoch_ms: AtomicI64,
}

impl ProviderPool {
    /// Build a pool for one provider, sizing the general/reserved semaphore
    /// split from `pool_config.streaming_reserve_fraction`.
    pub async fn new(
        provider: &ProviderConfig,
        pool_config: &crate::config::PoolConfig,
    ) -> Result<Self> {
        let name = format!("{}:{}", provider.host, provider.port);
        let server_config: nntp_rs::ServerConfig = provider.clone().into();

        let inner = nntp_rs::NntpPool::with_retry_config(
            server_config,
            provider.max_connections as u32,
            nntp_rs::RetryConfig {
                max_retries: pool_config.connect_retries,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::ProviderUnhealthy {
            provider: name.clone(),
            reason: format!("initial pool setup failed: {e}"),
        })?;

        let reserved_slots = (provider.max_connections as f64
            * pool_config.streaming_reserve_fraction)
            .ceil() as usize;
        let reserved_slots = reserved_slots.clamp(0, provider.max_connections.max(1));
        let general_slots = provider.max_connections.saturating_sub(reserved_slots).max(1);

        Ok(Self {
            name,
            priority: provider.priority,
            is_primary: matches!(provider.role, crate::config::ProviderRole::Primary),
            inner,
            general: Arc::new(Semaphore::new(general_slots)),
            reserved: Arc::new(Semaphore::new(reserved_slots)),
            health: ProviderHealth {
                consecutive_failures: AtomicU64::new(0),
                unhealthy_until_epoch_ms: AtomicI64::new(0),
            },
        })
    }

    /// `true` when this provider is in a failure cooldown and should be
    /// skipped by ordering, except as a last resort.
    pub fn is_unhealthy(&self, now_epoch_ms: i64) -> bool {
        self.health.unhealthy_until_epoch_ms.load(Ordering::Relaxed) > now_epoch_ms
    }

    /// Record a successful article fetch, clearing the failure streak.
    pub fn record_success(&self) {
        self.health.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a transient failure, marking the provider unhealthy once the
    /// failure streak crosses `connect_retries`.
    pub fn record_failure(&self, now_epoch_ms: i64, cooldown: Duration, trip_threshold: u32) {
        let failures = self.health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= trip_threshold as u64 {
            self.health
                .unhealthy_until_epoch_ms
                .store(now_epoch_ms + cooldown.as_millis() as i64, Ordering::Relaxed);
        }
    }

    /// Acquire an admission-control permit for the given usage context,
    /// waiting up to `timeout` before returning [`Error::PoolExhausted`].
    ///
    /// `Streaming` tries the reserved share first (non-blocking), then
    /// falls back to the general share like everything else.
    pub async fn acquire(&self, ctx: UsageContext, timeout: Duration) -> Result<Lease> {
        if matches!(ctx, UsageContext::Streaming)
            && let Ok(permit) = self.reserved.clone().try_acquire_owned()
        {
            return Ok(Lease { _permit: permit });
        }

        match tokio::time::timeout(timeout, self.general.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Lease { _permit: permit }),
            _ => Err(Error::PoolExhausted {
                provider: self.name.clone(),
            }),
        }
    }

    /// Fetch a single article's raw (still yEnc-encoded) body bytes.
    ///
    /// Distinguishes a permanent "no such article" response (430/423) from
    /// a transient failure (timeout, connection reset): the former maps to
    /// `None` so the caller can fail over to the next provider without
    /// tripping this provider's health tracking, the latter maps to a
    /// transient [`Error`] so the caller's retry/backoff logic applies.
    pub async fn fetch_body(&self, message_id: &str, deadline: Duration) -> Result<Option<Vec<u8>>> {
        let fetch = async {
            let mut conn = self.inner.get_no_retry().await?;
            conn.fetch_body_binary(message_id).await
        };

        match tokio::time::timeout(deadline, fetch).await {
            Ok(Ok(response)) => Ok(Some(response.data)),
            Ok(Err(nntp_rs::NntpError::NoSuchArticle(_))) => Ok(None),
            Ok(Err(e)) => Err(Error::ArticleUnavailable {
                message_id: message_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(format!(
                "fetching {message_id} from {}",
                self.name
            ))),
        }
    }
}

/// An admission-control permit. Dropping it returns the slot to the pool.
pub struct Lease {
    _permit: OwnedSemaphorePermit,
}

/// Current wall-clock time as milliseconds since the epoch, for health
/// tracking. A thin wrapper so callers don't each import `SystemTime`.
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ProviderConfig, ProviderRole};

    fn provider() -> ProviderConfig {
        ProviderConfig {
            host: "127.0.0.1".into(),
            port: 1119,
            tls: false,
            username: None,
            password: None,
            max_connections: 10,
            priority: 0,
            role: ProviderRole::Primary,
        }
    }

    #[test]
    fn reserved_slot_computation_rounds_up() {
        let pool_config = PoolConfig {
            streaming_reserve_fraction: 0.2,
            ..PoolConfig::default()
        };
        // ceil(10 * 0.2) = 2 reserved, 8 general.
        let reserved = (10.0_f64 * pool_config.streaming_reserve_fraction).ceil() as usize;
        assert_eq!(reserved, 2);
    }

    #[test]
    fn health_trips_after_threshold_failures() {
        let health = ProviderHealth {
            consecutive_failures: AtomicU64::new(0),
            unhealthy_until_epoch_ms: AtomicI64::new(0),
        };
        let now = 1_000_000_i64;
        let cooldown = Duration::from_secs(60);
        for _ in 0..2 {
            let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= 3 {
                health
                    .unhealthy_until_epoch_ms
                    .store(now + cooldown.as_millis() as i64, Ordering::Relaxed);
            }
        }
        assert!(health.unhealthy_until_epoch_ms.load(Ordering::Relaxed) <= now);
        let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= 3 {
            health
                .unhealthy_until_epoch_ms
                .store(now + cooldown.as_millis() as i64, Ordering::Relaxed);
        }
        assert!(health.unhealthy_until_epoch_ms.load(Ordering::Relaxed) > now);
    }

    #[tokio::test]
    async fn acquire_respects_general_share_limit() {
        // Without a live server we can't build a real ProviderPool, so this
        // exercises the semaphore logic in isolation the same way `acquire`
        // uses it internally.
        let general = Arc::new(Semaphore::new(1));
        let _first = general.clone().acquire_owned().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), general.clone().acquire_owned()).await;
        assert!(second.is_err());
        let _ = provider();
    }
}
