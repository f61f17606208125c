//! Remote forecast provider with conditional GET support.

use std::future::Future;
use std::time::Duration;

use nimbus_core::WeatherConfig;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::instrument;

use crate::error::CacheError;
use crate::key::UnitSystem;
use crate::model::Snapshot;

const ONE_CALL_PATH: &str = "/data/3.0/onecall";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastQuery {
    pub lat: f64,
    pub lon: f64,
    pub unit: UnitSystem,
}

/// Cache validators sent back to the provider on revalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            etag: snapshot.etag.clone(),
            last_modified: snapshot.last_modified.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshBody {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    NotModified,
    Fresh(FreshBody),
}

/// Something that can answer a conditional forecast request.
pub trait ForecastSource: Send + Sync + 'static {
    fn fetch(
        &self,
        query: &ForecastQuery,
        validators: &Validators,
    ) -> impl Future<Output = Result<FetchOutcome, CacheError>> + Send;
}

/// OpenWeatherMap One Call 3.0 client.
pub struct OneCallClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    exclude: String,
}

impl OneCallClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        exclude: &str,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            exclude: exclude.to_string(),
        })
    }

    pub fn from_config(config: &WeatherConfig) -> Result<Self, CacheError> {
        Self::new(
            &config.api_base_url,
            config.effective_api_key(),
            &config.exclude,
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

impl ForecastSource for OneCallClient {
    #[instrument(skip(self, validators), level = "debug")]
    async fn fetch(
        &self,
        query: &ForecastQuery,
        validators: &Validators,
    ) -> Result<FetchOutcome, CacheError> {
        let url = format!("{}{}", self.base_url, ONE_CALL_PATH);

        let mut params = vec![
            ("lat", query.lat.to_string()),
            ("lon", query.lon.to_string()),
            ("units", query.unit.as_str().to_string()),
        ];
        if !self.exclude.is_empty() {
            params.push(("exclude", self.exclude.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("appid", key.clone()));
        }

        let mut request = self.client.get(&url).query(&params);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!("Provider answered 304 Not Modified");
            return Ok(FetchOutcome::NotModified);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Provider returned {}", status);
            return Err(CacheError::Status { status: status.as_u16(), body });
        }

        let etag = header_value(&response, ETAG);
        let last_modified = header_value(&response, LAST_MODIFIED);
        let body = response.bytes().await?.to_vec();

        Ok(FetchOutcome::Fresh(FreshBody { body, etag, last_modified }))
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
