use super::auth::{auth_provider, AuthProvider};
use super::paging::{page_resolver, Page};
use super::uri::{ApiRequest, DateWindow, PagedUriProvider, RequestTemplate, SimpleUriProvider, UriProvider};
use super::{http_error, json_at, parse_method};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use tributary_core::error::DEFAULT_RESTART_DELAY;
use tributary_core::spec::RestApiSourceSpec;
use tributary_core::{PollingSource, PollingState, Pull, SourceTags, StreamError, StreamResult};

/// Polls a REST endpoint and emits the JSON records of every response
pub struct RestApiSource {
    name: String,
    tags: SourceTags,
    http: Client,
    method: Method,
    provider: Box<dyn UriProvider>,
    auth: Box<dyn AuthProvider>,
    limiter: Option<RateLimiter>,
    records_key_chain: Vec<String>,
    polling: PollingState,
    // request that was generated but not answered yet
    pending: Option<ApiRequest>,
    last: Option<Page>,
}

impl RestApiSource {
    pub fn from_spec(
        name: impl Into<String>,
        spec: &RestApiSourceSpec,
        polling: PollingState,
    ) -> StreamResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(spec.http_timeout_secs))
            .build()
            .map_err(|e| StreamError::config(format!("failed to build HTTP client: {e}")))?;
        let window = DateWindow::starting(
            polling.is_backfilling(),
            spec.backfill_start_date.as_deref(),
            ChronoDuration::seconds(spec.look_back_range_secs as i64),
            Utc::now(),
        )?;
        let template = RequestTemplate::new(
            spec.uri_template.clone(),
            spec.body_template.clone(),
            spec.templated_fields.clone(),
        );
        let provider: Box<dyn UriProvider> = match &spec.paging {
            Some(paging) => Box::new(PagedUriProvider::new(template, window, page_resolver(paging))),
            None => Box::new(SimpleUriProvider::new(template, window)),
        };
        Ok(Self {
            name: name.into(),
            tags: SourceTags::new(spec.uri_template.clone(), "rest-api"),
            http,
            method: parse_method(&spec.method)?,
            provider,
            auth: auth_provider(&spec.auth)?,
            limiter: spec.rate_limit.as_ref().map(RateLimiter::from_spec),
            records_key_chain: spec.response_property_key_chain.clone().unwrap_or_default(),
            polling,
            pending: None,
            last: None,
        })
    }

    fn records(&self, body: &Value) -> Vec<Value> {
        match json_at(body, &self.records_key_chain) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        }
    }
}

#[async_trait]
impl PollingSource for RestApiSource {
    type Item = Value;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &SourceTags {
        &self.tags
    }

    async fn on_pull(&mut self) -> StreamResult<Pull<Value>> {
        if self.pending.is_none() {
            let last = self.last.take();
            match self.provider.next_request(last.as_ref())? {
                Some(request) => self.pending = Some(request),
                None => return Ok(self.polling.on_empty()),
            }
        }
        if let Some(limiter) = self.limiter.as_mut() {
            if !limiter.try_acquire() {
                return Ok(Pull::Wait(limiter.time_to_next()));
            }
        }
        let Some(request) = self.pending.clone() else {
            return Ok(self.polling.on_empty());
        };

        debug!(url = %request.url, "sending request");
        let mut builder = self.http.request(self.method.clone(), &request.url);
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        let builder = self.auth.authorize(&self.http, builder).await?;
        let response = builder.send().await.map_err(http_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
            let delay = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESTART_DELAY);
            warn!(status = status.as_u16(), retry_in = ?delay, "request throttled");
            return Ok(Pull::Wait(delay));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await.map_err(http_error)?;
        let records = self.records(&body);
        debug!(records = records.len(), "response received");
        self.pending = None;
        self.last = Some(Page::new(body, records.len()));
        Ok(Pull::Emit(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tributary_core::spec::{PagingSpec, TemplatedFieldKind, TemplatedFieldSpec};
    use tributary_core::{BackfillState, Message, PollingDriver, Source};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(uri: String) -> RestApiSourceSpec {
        RestApiSourceSpec {
            uri_template: uri,
            method: "GET".into(),
            body_template: None,
            templated_fields: vec![],
            paging: None,
            auth: Default::default(),
            rate_limit: None,
            response_property_key_chain: Some(vec!["data".into()]),
            backfill_start_date: None,
            look_back_range_secs: 3600,
            http_timeout_secs: 5,
        }
    }

    fn backfill() -> PollingState {
        PollingState::new(BackfillState::new(true, true).unwrap(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_counter_paging_until_total() {
        let server = MockServer::start().await;
        for page in 1..=2 {
            Mock::given(method("GET"))
                .and(path("/orders"))
                .and(query_param("page", page.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "pages": 2,
                    "data": [{ "id": page * 10 }, { "id": page * 10 + 1 }]
                })))
                .expect(1)
                .mount(&server)
                .await;
        }
        let mut spec = spec(format!("{}/orders?page={{page}}", server.uri()));
        spec.templated_fields = vec![TemplatedFieldSpec {
            name: "page".into(),
            kind: TemplatedFieldKind::PagePointer,
            format: None,
            placement: Default::default(),
        }];
        spec.paging = Some(PagingSpec::Counter {
            total_pages_key_chain: vec!["pages".into()],
        });

        let source = RestApiSource::from_spec("orders", &spec, backfill()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        PollingDriver::new(source)
            .run(tx, CancellationToken::new())
            .await
            .unwrap();

        let mut ids = Vec::new();
        let mut eos = false;
        while let Some(message) = rx.recv().await {
            match message {
                Message::Batch(v) => ids.push(v["id"].as_i64().unwrap()),
                Message::Eos => eos = true,
            }
        }
        assert_eq!(ids, vec![10, 11, 20, 21]);
        assert!(eos);
    }

    #[tokio::test]
    async fn test_throttled_response_waits_and_retries_same_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": 1 }] })))
            .mount(&server)
            .await;

        let mut source = RestApiSource::from_spec("rates", &spec(server.uri()), backfill()).unwrap();
        assert!(matches!(
            source.on_pull().await.unwrap(),
            Pull::Wait(d) if d == Duration::from_secs(3)
        ));
        match source.on_pull().await.unwrap() {
            Pull::Emit(records) => assert_eq!(records, vec![json!({ "id": 1 })]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Complete));
    }

    #[tokio::test]
    async fn test_server_error_is_fatal_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let mut source = RestApiSource::from_spec("rates", &spec(server.uri()), backfill()).unwrap();
        let err = source.on_pull().await.unwrap_err();
        assert!(matches!(err, StreamError::Http { status: 500, .. }));
        assert_eq!(source.decide(&err), tributary_core::Directive::Stop);
    }

    #[tokio::test]
    async fn test_single_object_response_is_one_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "rate": 1.1 } })))
            .mount(&server)
            .await;
        let polling = PollingState::new(BackfillState::new(false, false).unwrap(), Duration::from_secs(30));
        let mut source = RestApiSource::from_spec("rates", &spec(server.uri()), polling).unwrap();
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Emit(r) if r.len() == 1));
        assert!(matches!(
            source.on_pull().await.unwrap(),
            Pull::Wait(d) if d == Duration::from_secs(30)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_pull_waits() {
        let mut spec = spec("http://127.0.0.1:9/never".into());
        spec.rate_limit = Some(tributary_core::spec::RateLimitSpec {
            requests_per_second: 1,
            burst: 0,
        });
        let mut source = RestApiSource::from_spec("rates", &spec, backfill()).unwrap();
        // drain the single token so the next pull is rejected locally
        source.limiter.as_mut().unwrap().try_acquire();
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Wait(_)));
    }
}
