pub mod chat;
pub mod embedding;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Keyed by a model's `mode` string ("Chat", "Embedding", ...). Two
/// responsibilities: is this URL path compatible with this mode, and is the
/// child process actually serving this model yet.
#[async_trait]
pub trait InterfacePlugin: Send + Sync {
    fn mode(&self) -> &'static str;

    fn validate_request(&self, path: &str, model_name: &str) -> Result<()>;

    /// Two-phase probe against `http://127.0.0.1:<port>`: a shallow
    /// list-models poll until it succeeds, then a minimal real request of
    /// the mode's own kind. Returns once the deep probe first succeeds, or
    /// an error once `deadline` elapses.
    async fn health_check(&self, model_name: &str, port: u16, deadline: Duration) -> Result<()>;
}

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("reqwest client builder should not fail with static config")
}

/// Retries `attempt` with ~1-2s backoff until it returns `Ok` or `deadline`
/// (measured from `start`) elapses. Shared by every interface plugin's
/// shallow and deep probe phases so the retry/backoff/deadline policy in one
/// place instead of copy-pasted per mode.
pub(crate) async fn poll_until<F, Fut>(
    start: std::time::Instant,
    deadline: Duration,
    backoff: Duration,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if start.elapsed() >= deadline {
                    return Err(e);
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
