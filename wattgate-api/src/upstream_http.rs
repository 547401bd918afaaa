//! HTTP client for the provider's third-party API.
//!
//! Every call reports its status and latency to Prometheus. Non-success
//! answers are returned as [`UpstreamFailure`] with status, body and any
//! `Retry-After` hint; transport failures count as 503 so they are retried.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use wattgate_core::{
    Aggregation, ConfigError, DateRange, LookupScope, UpstreamApi, UpstreamFailure, UpstreamResult,
};

use crate::telemetry::metrics;

const USER_AGENT: &str = concat!("wattgate/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed [`UpstreamApi`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
}

impl HttpUpstream {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url).map_err(|e| ConfigError::InvalidValue {
            field: "WATTGATE_UPSTREAM_BASE_URL".to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                field: "WATTGATE_UPSTREAM_BASE_URL".to_string(),
                reason: "must be an absolute http(s) URL".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "WATTGATE_UPSTREAM_TIMEOUT_SECS".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url })
    }

    fn url(&self, segments: &[&str]) -> UpstreamResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamFailure::transport("upstream base URL cannot take a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call(
        &self,
        endpoint: &'static str,
        method: Method,
        url: Url,
        bearer: &str,
        body: Option<Value>,
    ) -> UpstreamResult<Value> {
        let start = Instant::now();
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(bearer)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let result = match request.send().await {
            Ok(response) => read_response(response).await,
            Err(e) => {
                tracing::warn!(endpoint = endpoint, error = %e, "upstream transport failure");
                Err(UpstreamFailure::transport(format!("HTTP request failed: {}", e)))
            }
        };

        let status = match &result {
            Ok(_) => 200,
            Err(failure) => failure.status,
        };
        if let Some(m) = metrics() {
            m.record_upstream_call(endpoint, status, start.elapsed().as_secs_f64());
        }
        tracing::debug!(
            endpoint = endpoint,
            status = status,
            duration_ms = start.elapsed().as_millis() as u64,
            "upstream call finished"
        );
        result
    }
}

async fn read_response(response: reqwest::Response) -> UpstreamResult<Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string());
    let body = response
        .text()
        .await
        .map_err(|e| UpstreamFailure::transport(format!("Failed to read body: {}", e)))?;

    if !status.is_success() {
        return Err(UpstreamFailure::new(status.as_u16(), body).with_retry_after(retry_after));
    }
    serde_json::from_str(&body).map_err(|e| {
        UpstreamFailure::new(502, format!("Malformed upstream response: {}", e))
    })
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn fetch_access_token(&self, refresh_token: &str) -> UpstreamResult<Value> {
        let url = self.url(&["api", "token"])?;
        self.call("token", Method::GET, url, refresh_token, None).await
    }

    async fn list_authorizations(&self, access_token: &str) -> UpstreamResult<Value> {
        let url = self.url(&["api", "authorization", "authorizations"])?;
        self.call("authorizations", Method::GET, url, access_token, None)
            .await
    }

    async fn metering_point_ids(
        &self,
        access_token: &str,
        scope: LookupScope,
        identifier: &str,
    ) -> UpstreamResult<Value> {
        let url = self.url(&[
            "api",
            "authorization",
            "authorization",
            "meteringpointids",
            scope.as_str(),
            identifier,
        ])?;
        self.call("metering_point_ids", Method::GET, url, access_token, None)
            .await
    }

    async fn time_series(
        &self,
        access_token: &str,
        range: DateRange,
        aggregation: Aggregation,
        metering_point_ids: &[String],
    ) -> UpstreamResult<Value> {
        let from = range.from.format("%Y-%m-%d").to_string();
        let to = range.to.format("%Y-%m-%d").to_string();
        let url = self.url(&[
            "api",
            "meterdata",
            "gettimeseries",
            &from,
            &to,
            aggregation.as_str(),
        ])?;
        let body = json!({ "meteringPoints": { "meteringPoint": metering_point_ids } });
        self.call("time_series", Method::POST, url, access_token, Some(body))
            .await
    }
}
