//! JSON-over-HTTP transport with a bounded per-request timeout
//!
//! No retries here: any network, timeout or decode failure goes straight
//! back to the caller.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::error::TrackerError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TrackerError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }

    /// GET `url` with `query` appended as URL parameters, decode the body as JSON
    pub async fn get<Q>(&self, url: &str, query: &Q) -> Result<Value, TrackerError>
    where
        Q: Serialize + ?Sized,
    {
        let resp = self.http_client.get(url).query(query).send().await?;
        let body = resp.json::<Value>().await?;
        Ok(body)
    }

    /// POST `body` as JSON to `url`, decode the response body as JSON
    pub async fn post<B>(&self, url: &str, body: &B) -> Result<Value, TrackerError>
    where
        B: Serialize + ?Sized,
    {
        let resp = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        let body = resp.json::<Value>().await?;
        Ok(body)
    }
}
