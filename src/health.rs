//! Health polling for freshly launched services.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::{Error, Result};

/// Default interval between health probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Poll `check` at a fixed interval until it reports healthy or the
/// deadline elapses.
///
/// Checks are local or LAN-local and bounded by short deadlines, so a
/// fixed interval is used instead of backoff. The last observed failure is
/// surfaced in the timeout error.
pub async fn wait_healthy<T, F, Fut>(
    label: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, String>>,
{
    let deadline = Instant::now() + timeout;
    let mut last_error: Option<String> = None;

    loop {
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::trace!("{} not healthy yet: {}", label, e);
                last_error = Some(e);
            }
        }

        if Instant::now() + interval > deadline {
            let last = last_error.unwrap_or_else(|| "no checks completed".to_string());
            return Err(Error::HealthTimeout(format!(
                "{} after {:?}: last error: {}",
                label, timeout, last
            )));
        }
        sleep(interval).await;
    }
}

/// Probe an HTTP health endpoint once; usable as a `wait_healthy` check.
pub async fn probe_http(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("status {}", response.status()))
    }
}
