use super::{client, poll_until, InterfacePlugin};
use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};

pub struct ChatInterface;

#[async_trait]
impl InterfacePlugin for ChatInterface {
    fn mode(&self) -> &'static str {
        "Chat"
    }

    fn validate_request(&self, path: &str, model_name: &str) -> Result<()> {
        if path.contains("v1/completions") || path.contains("v1/embeddings") {
            return Err(SupervisorError::ModeMismatch(format!(
                "model '{model_name}' is a Chat model and does not support this endpoint"
            )));
        }
        Ok(())
    }

    async fn health_check(&self, model_name: &str, port: u16, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        let base = format!("http://127.0.0.1:{port}");
        let http = client();

        poll_until(start, deadline, Duration::from_secs(2), || {
            let http = http.clone();
            let url = format!("{base}/v1/models");
            async move { shallow_probe(&http, &url).await }
        })
        .await?;

        poll_until(start, deadline, Duration::from_secs(1), || {
            let http = http.clone();
            let url = format!("{base}/v1/chat/completions");
            let model_name = model_name.to_string();
            async move { deep_probe(&http, &url, &model_name).await }
        })
        .await
    }
}

async fn shallow_probe(http: &reqwest::Client, url: &str) -> Result<()> {
    http.get(url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?
        .error_for_status()
        .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?;
    Ok(())
}

async fn deep_probe(http: &reqwest::Client, url: &str, model_name: &str) -> Result<()> {
    let body = json!({
        "model": model_name,
        "messages": [{"role": "user", "content": "hello"}],
        "max_tokens": 1,
        "stream": false,
    });
    http.post(url)
        .json(&body)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?
        .error_for_status()
        .map_err(|e| SupervisorError::HealthCheckFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_completions_and_embeddings_paths() {
        let plugin = ChatInterface;
        assert!(plugin.validate_request("/v1/completions", "m").is_err());
        assert!(plugin.validate_request("/v1/embeddings", "m").is_err());
        assert!(plugin.validate_request("/v1/chat/completions", "m").is_ok());
    }
}
