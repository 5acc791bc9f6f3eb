use super::{client, poll_until, InterfacePlugin};
use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};

pub struct EmbeddingInterface;

#[async_trait]
impl InterfacePlugin for EmbeddingInterface {
    fn mode(&self) -> &'static str {
        "Embedding"
    }

    fn validate_request(&self, path: &str, model_name: &str) -> Result<()> {
        if path.contains("v1/chat/completions") || path.contains("v1/completions") {
            return Err(SupervisorError::ModeMismatch(format!(
                "model '{model_name}' is an Embedding model and does not support this endpoint"
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
            let url = format!("{base}/v1/embeddings");
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
        "input": "hello",
        "encoding_format": "float",
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
    fn rejects_chat_and_completions_paths() {
        let plugin = EmbeddingInterface;
        assert!(plugin.validate_request("/v1/chat/completions", "e").is_err());
        assert!(plugin.validate_request("/v1/completions", "e").is_err());
        assert!(plugin.validate_request("/v1/embeddings", "e").is_ok());
    }
}
