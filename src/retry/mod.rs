use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Bounded, fixed-delay retry for filesystem calls that can fail
/// transiently (another process holding a handle, a virus scanner, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 20,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Runs `f` until it succeeds or the attempts are used up. The final
    /// error is tagged with [`StoreError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    warn!(what, attempt, error = %e, "filesystem call failed, retrying");
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(StoreError::RetriesExhausted {
                        what: what.to_owned(),
                        attempts,
                    }))
                }
            }
        }
    }
}
