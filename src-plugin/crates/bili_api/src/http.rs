use std::time::Duration;

use crate::errors::BiliApiError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;

/// Timeout for metadata sized responses.
pub const API_TIMEOUT: Duration = Duration::from_secs(15);

/// The network capability the signer and resolver depend on.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// GET `url` and return the response body as text.
    async fn get_text(&self, url: &str, headers: HeaderMap) -> Result<String, BiliApiError>;

    /// Follow redirects from `url` and return the final location.
    async fn resolve_redirect(&self, url: &str, user_agent: &str)
        -> Result<String, BiliApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new() -> Result<Self, BiliApiError> {
        let client = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ApiClient {
    async fn get_text(&self, url: &str, headers: HeaderMap) -> Result<String, BiliApiError> {
        let resp = self
            .client
            .get(url)
            .headers(headers)
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        if !resp.status().is_success() {
            if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
                return Err(BiliApiError::SecurityControl);
            }
            return Err(BiliApiError::InvalidResponseStatus {
                status: resp.status(),
            });
        }

        Ok(resp.text().await?)
    }

    async fn resolve_redirect(
        &self,
        url: &str,
        user_agent: &str,
    ) -> Result<String, BiliApiError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(BiliApiError::SecurityControl);
        }
        let location = resp.url().to_string();
        log::debug!("Short link {url} resolved to {location}");
        Ok(location)
    }
}
