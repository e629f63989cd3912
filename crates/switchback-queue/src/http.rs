//! HTTP delivery of completion callbacks.

use async_trait::async_trait;
use std::time::Duration;
use switchback_config::CallbackSettings;
use switchback_core::{BuildResult, CallbackSender, DeliveryError};
use tracing::debug;
use url::Url;

/// POSTs the build result as JSON to the job's callback URL.
pub struct HttpCallbackSender {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpCallbackSender {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("switchback/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        Ok(Self { client, api_key })
    }

    pub fn from_settings(settings: &CallbackSettings) -> Result<Self, DeliveryError> {
        Self::new(settings.api_key.clone(), settings.request_timeout)
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn send(&self, url: &Url, result: &BuildResult) -> Result<(), DeliveryError> {
        let mut request = self.client.post(url.clone()).json(result);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(DeliveryError::Status(status.as_u16()));
        }

        debug!(url = %url, job_id = %result.job_id, status = status.as_u16(), "Callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_settings() {
        let settings = CallbackSettings {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let sender = HttpCallbackSender::from_settings(&settings).unwrap();
        assert_eq!(sender.api_key.as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_request_error() {
        let sender = HttpCallbackSender::new(None, Duration::from_secs(2)).unwrap();
        // Nothing listens on the local discard port.
        let url = Url::parse("http://127.0.0.1:9/callback").unwrap();

        let err = sender.send(&url, &BuildResult::default()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Request(_)));
    }
}
