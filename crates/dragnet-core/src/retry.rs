//! Bounded retry with jitter for transient store failures.
//!
//! Only [`dragnet_store::StoreError::Unavailable`] is worth retrying;
//! conflicts and missing documents are answers, not outages. After the
//! attempts are spent the last error escalates to the caller, which
//! encodes it as task state rather than crashing the process.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use dragnet_store::StoreResult;

const ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(50);
const MAX_JITTER_MS: u64 = 50;

/// Run a store operation, retrying transient failures with jittered
/// exponential backoff.
pub async fn store_retry<T, F, Fut>(what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_transient() && attempt < ATTEMPTS => {
                let jitter = rand::rng().random_range(0..MAX_JITTER_MS);
                warn!(
                    what,
                    attempt,
                    error = %e,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
