use std::{fmt::Display, future::Future, time::Duration};

use tracing::warn;

use crate::resolver::LinkResolver;

/// Errors that mean "start over from the movie page".
pub trait StaleSession {
    fn is_stale_session(&self) -> bool;

    /// Page the site pointed at when it dropped the session.
    fn session_redirect(&self) -> Option<&str> {
        None
    }
}

/// Caller-side restart policy for stale resolver sessions. Before each
/// restart the session is re-primed through the redirect the site gave, if
/// any. Any other failure is returned on the first attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    /// Backoff before attempt `attempt + 1`; doubles each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub async fn run<T, E, F, Fut>(&self, resolver: &dyn LinkResolver, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StaleSession + Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_stale_session() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "resolver session expired, restarting"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(to) = err.session_redirect() {
                        if let Err(refresh_err) = resolver.refresh_session(to).await {
                            warn!(url = %to, error = %refresh_err, "session refresh failed");
                        }
                    }
                    attempt += 1;
                },
                other => return other,
            }
        }
    }
}
