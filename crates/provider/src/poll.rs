//! Bounded polling for objects that settle asynchronously

use std::future::Future;
use std::time::{Duration, Instant};

use harvester_common::{Error, Result};
use tracing::trace;

/// How long a resource's long-running operations may take
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub create: Duration,
    pub delete: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(5 * 60),
            min_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(10),
        }
    }
}

impl Timeouts {
    /// Millisecond-scale waits for exercising handlers against the in-memory store
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            create: Duration::from_millis(200),
            delete: Duration::from_millis(200),
            min_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        }
    }

    pub fn wait(&self, what: impl Into<String>, timeout: Duration) -> WaitConfig {
        WaitConfig {
            what: what.into(),
            pending: Vec::new(),
            target: Vec::new(),
            timeout,
            delay: Duration::ZERO,
            min_interval: self.min_interval,
            max_interval: self.max_interval,
        }
    }
}

/// Parameters of one wait
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Used in log lines and the timeout error
    pub what: String,
    pub pending: Vec<&'static str>,
    pub target: Vec<&'static str>,
    pub timeout: Duration,
    /// Sleep before the first refresh
    pub delay: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl WaitConfig {
    pub fn pending(mut self, states: &[&'static str]) -> Self {
        self.pending = states.to_vec();
        self
    }

    pub fn target(mut self, states: &[&'static str]) -> Self {
        self.target = states.to_vec();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Call `refresh` until it reports a target state. Each refresh yields the
/// current value and its state name. Pending states keep waiting with a
/// doubling interval; any other state is an error.
pub async fn wait_for_state<T, F, Fut>(config: &WaitConfig, mut refresh: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, String)>>,
{
    let start = Instant::now();
    let mut interval = config.min_interval;

    if !config.delay.is_zero() {
        tokio::time::sleep(config.delay).await;
    }

    loop {
        let (value, state) = refresh().await?;
        if config.target.iter().any(|t| *t == state) {
            return Ok(value);
        }
        if !config.pending.iter().any(|p| *p == state) {
            return Err(Error::Validation(format!(
                "unexpected state '{}' while waiting for {}, wanted one of [{}]",
                state,
                config.what,
                config.target.join(", ")
            )));
        }

        if start.elapsed() >= config.timeout {
            return Err(Error::Timeout {
                what: config.what.clone(),
                seconds: config.timeout.as_secs(),
            });
        }

        trace!("{} is {}, checking again in {:?}", config.what, state, interval);
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> WaitConfig {
        Timeouts::fast()
            .wait("image default/ubuntu", Duration::from_millis(100))
            .pending(&["In-Progress"])
            .target(&["Active"])
    }

    #[tokio::test]
    async fn test_reaches_target() {
        let calls = AtomicUsize::new(0);
        let value = wait_for_state(&config(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let state = if n < 3 { "In-Progress" } else { "Active" };
            Ok((n, state.to_string()))
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let err = wait_for_state(&config(), || async { Ok(((), "In-Progress".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_state_fails_fast() {
        let err = wait_for_state(&config(), || async { Ok(((), "Failed".to_string())) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected state 'Failed'"));
    }

    #[tokio::test]
    async fn test_refresh_error_propagates() {
        let err = wait_for_state::<(), _, _>(&config(), || async {
            Err(Error::Internal("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
