//! Provider fetcher — one HTTP GET per call, classified.
//!
//! The ingestion loop talks to the provider only through the `Fetcher`
//! trait; `HttpFetcher` is the production implementation. Every attempt
//! (success or failure) lands in the quota log, and rate-limit headers
//! are read opportunistically to warn about budget pressure before the
//! provider starts refusing calls.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::{Config, EndpointPolicy};
use crate::error::FetchError;

pub mod quota_log;

use quota_log::{CallRecord, QuotaLog};

const ERROR_BODY_MAX_CHARS: usize = 500;

// ── Core Types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub endpoint: String,
    pub symbol: String,
    pub path: String,
}

impl FetchRequest {
    pub fn for_policy(policy: &EndpointPolicy, symbol: &str) -> Self {
        Self {
            endpoint: policy.name.clone(),
            symbol: symbol.to_string(),
            path: policy.path_for(symbol),
        }
    }
}

/// Daily usage the provider reported in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub daily_count: u64,
    pub daily_limit: u64,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Value,
    pub quota: Option<QuotaHeaders>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPressure {
    Normal,
    /// Above 75 % of the provider's daily limit.
    Elevated,
    /// Above 90 %.
    Critical,
}

impl QuotaHeaders {
    pub fn pressure(&self) -> QuotaPressure {
        if self.daily_limit == 0 {
            return QuotaPressure::Normal;
        }
        let used = self.daily_count as f64 / self.daily_limit as f64;
        if used > 0.90 {
            QuotaPressure::Critical
        } else if used > 0.75 {
            QuotaPressure::Elevated
        } else {
            QuotaPressure::Normal
        }
    }
}

// ── Fetcher Trait ───────────────────────────────────────────────────

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform exactly one GET. Non-2xx answers come back as
    /// `FetchError::Status` carrying the code.
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

// ── HTTP Implementation ─────────────────────────────────────────────

pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    count_header: String,
    limit_header: String,
    quota_log: Option<Arc<QuotaLog>>,
}

impl HttpFetcher {
    pub fn new(config: &Config, quota_log: Option<Arc<QuotaLog>>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("flowd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.api_token.clone(),
            count_header: config.daily_count_header.to_ascii_lowercase(),
            limit_header: config.daily_limit_header.to_ascii_lowercase(),
            quota_log,
        })
    }

    fn parse_quota_headers(&self, headers: &HeaderMap) -> Option<QuotaHeaders> {
        let get = |name: &str| -> Option<u64> { headers.get(name)?.to_str().ok()?.trim().parse().ok() };
        Some(QuotaHeaders {
            daily_count: get(&self.count_header)?,
            daily_limit: get(&self.limit_header)?,
        })
    }

    async fn send(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let start = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&req.endpoint, e))?;
        let status = resp.status().as_u16();
        let quota = self.parse_quota_headers(resp.headers());

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                endpoint: req.endpoint.clone(),
                status,
                body: body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::from_reqwest(&req.endpoint, e))?;
        Ok(FetchResponse {
            status,
            body,
            quota,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn log_call(&self, req: &FetchRequest, result: &Result<FetchResponse, FetchError>, latency_ms: u64) {
        let Some(log) = &self.quota_log else {
            return;
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        let (status_code, outcome, quota) = match result {
            Ok(resp) => (Some(resp.status), "success", resp.quota),
            Err(e) => (e.status(), e.outcome_label(), None),
        };
        let record = CallRecord {
            request_id: &request_id,
            endpoint: &req.endpoint,
            symbol: &req.symbol,
            requested_at: Utc::now(),
            status_code,
            outcome,
            latency_ms,
            daily_count: quota.map(|q| q.daily_count),
            daily_limit: quota.map(|q| q.daily_limit),
        };
        if let Err(e) = log.record_call(&record) {
            warn!(endpoint = %req.endpoint, error = %e, "Failed to append quota log");
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let start = Instant::now();
        let result = self.send(req).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        self.log_call(req, &result, latency_ms);

        match &result {
            Ok(resp) => {
                debug!(
                    endpoint = %req.endpoint,
                    symbol = %req.symbol,
                    status = resp.status,
                    latency_ms,
                    "Fetched"
                );
                if let Some(quota) = resp.quota {
                    report_pressure(quota);
                }
            }
            Err(e) => debug!(endpoint = %req.endpoint, symbol = %req.symbol, error = %e, "Fetch failed"),
        }
        result
    }
}

/// Early budget-pressure logging from provider headers.
pub fn report_pressure(quota: QuotaHeaders) {
    match quota.pressure() {
        QuotaPressure::Normal => {}
        QuotaPressure::Elevated => warn!(
            daily_count = quota.daily_count,
            daily_limit = quota.daily_limit,
            "Provider daily quota above 75%"
        ),
        QuotaPressure::Critical => error!(
            daily_count = quota.daily_count,
            daily_limit = quota.daily_limit,
            "Provider daily quota above 90%"
        ),
    }
}
