//! Semaphore-based connection pool for router commands.
//!
//! The [`ConnectionPool`] bounds the number of in-flight router commands and
//! remembers when the router last answered, so an acquire after a quiet period
//! triggers a health check first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{Result, RouterError};

/// Default maximum number of concurrent router commands.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// How long a successful exchange vouches for the router.
const HEALTH_TTL: Duration = Duration::from_secs(30);

/// A permit to run one router command. Returned to the pool on drop.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
    /// Set when the caller must probe the router before using the permit.
    pub needs_health_check: bool,
}

/// Bounded pool of router command slots.
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    last_healthy: Mutex<Option<Instant>>,
}

impl ConnectionPool {
    pub fn new(max_size: usize, acquire_timeout: Duration) -> Self {
        let limit = if max_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            max_size
        };

        info!(max_size = limit, "Router connection pool created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_size: limit,
            acquire_timeout,
            last_healthy: Mutex::new(None),
        }
    }

    /// Wait for a slot, up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PoolPermit> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| RouterError::Unreachable("pool acquire timed out".into()))?
        .map_err(|_| RouterError::Unreachable("pool closed".into()))?;

        let needs_health_check = self
            .last_healthy
            .lock()
            .await
            .is_none_or(|at| at.elapsed() > HEALTH_TTL);
        if needs_health_check {
            debug!("Router health check due");
        }

        Ok(PoolPermit {
            _permit: permit,
            needs_health_check,
        })
    }

    pub async fn mark_healthy(&self) {
        *self.last_healthy.lock().await = Some(Instant::now());
    }

    pub async fn mark_unhealthy(&self) {
        *self.last_healthy.lock().await = None;
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, Duration::from_secs(15))
    }
}
