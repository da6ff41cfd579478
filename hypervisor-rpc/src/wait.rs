//! Shared convergence helper: poll a predicate until it's true or a
//! timeout is exhausted.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Poll `pred` every `interval`, returning `Ok(())` the first time it
/// resolves to `true`. If `timeout` is `Some`, gives up with
/// `Error::Timeout` once that much wall-clock time has elapsed; `None`
/// polls forever (used by the few waits in the spec that have no bound,
/// e.g. waiting for a VM to stop before deleting it).
pub async fn wait_until_true<F, Fut>(
    label: &str,
    timeout: Option<Duration>,
    interval: Duration,
    mut pred: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        if pred().await? {
            return Ok(());
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(label.to_string()));
            }
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn resolves_once_predicate_is_true() {
        let calls = AtomicU32::new(0);
        let result = wait_until_true("test", None, Duration::from_millis(10), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(n >= 2)
        })
        .await;
        assert!(result.is_ok());
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_true() {
        let result = wait_until_true(
            "never",
            Some(Duration::from_millis(30)),
            Duration::from_millis(10),
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
