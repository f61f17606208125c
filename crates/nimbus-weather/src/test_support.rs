//! Scripted forecast source for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::provider::{FetchOutcome, ForecastQuery, ForecastSource, FreshBody, Validators};

/// One Call body with the given `current.dt`.
pub(crate) fn forecast_body(dt: i64) -> Vec<u8> {
    serde_json::json!({
        "lat": 43.6532,
        "lon": -79.3832,
        "timezone": "America/Toronto",
        "current": {
            "dt": dt,
            "temp": 4.2,
            "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}]
        }
    })
    .to_string()
    .into_bytes()
}

#[derive(Default)]
pub(crate) struct ScriptedSource {
    responses: Mutex<VecDeque<Result<FetchOutcome, CacheError>>>,
    queries: Mutex<Vec<ForecastQuery>>,
    validators: Mutex<Vec<Validators>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub(crate) fn push_fresh(&self, dt: i64, etag: Option<&str>) {
        self.responses.lock().push_back(Ok(FetchOutcome::Fresh(FreshBody {
            body: forecast_body(dt),
            etag: etag.map(str::to_string),
            last_modified: None,
        })));
    }

    pub(crate) fn push_body(&self, body: &[u8]) {
        self.responses.lock().push_back(Ok(FetchOutcome::Fresh(FreshBody {
            body: body.to_vec(),
            etag: None,
            last_modified: None,
        })));
    }

    pub(crate) fn push_not_modified(&self) {
        self.responses.lock().push_back(Ok(FetchOutcome::NotModified));
    }

    pub(crate) fn push_status(&self, status: u16) {
        self.responses.lock().push_back(Err(CacheError::Status { status, body: String::new() }));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_validators(&self) -> Vec<Validators> {
        self.validators.lock().clone()
    }

    pub(crate) fn seen_queries(&self) -> Vec<ForecastQuery> {
        self.queries.lock().clone()
    }
}

impl ForecastSource for ScriptedSource {
    async fn fetch(
        &self,
        query: &ForecastQuery,
        validators: &Validators,
    ) -> Result<FetchOutcome, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(*query);
        self.validators.lock().push(validators.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| {
            Err(CacheError::Status { status: 599, body: "no scripted response".to_string() })
        })
    }
}
