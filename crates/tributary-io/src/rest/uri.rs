//! Request generation for REST listings
//!
//! A listing run is the sequence of requests issued for one date window.
//! [`SimpleUriProvider`] issues a single request per run, [`PagedUriProvider`]
//! keeps asking its [`PageResolver`] until the resolver ends the run. Either
//! way the window closes when the run is exhausted, and the next run starts
//! where the previous one ended.

use super::paging::{Page, PageResolver};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use std::fmt::Write;
use tributary_core::spec::{FieldPlacement, TemplatedFieldKind, TemplatedFieldSpec};
use tributary_core::{StreamError, StreamResult};

/// A rendered request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub url: String,
    pub body: Option<String>,
}

pub trait UriProvider: Send {
    /// Next request of the current run, or `None` when the run is exhausted
    fn next_request(&mut self, last: Option<&Page>) -> StreamResult<Option<ApiRequest>>;
}

/// Date range covered by a listing run
#[derive(Debug, Clone)]
pub struct DateWindow {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

impl DateWindow {
    /// Window for a new stream
    ///
    /// Backfills start at `backfill_start`, falling back to the look back like
    /// incremental streams do.
    pub fn starting(
        backfilling: bool,
        backfill_start: Option<&str>,
        look_back: ChronoDuration,
        now: DateTime<Utc>,
    ) -> StreamResult<Self> {
        let start = match backfill_start.filter(|_| backfilling) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| StreamError::config(format!("invalid backfill start date {raw}: {e}")))?
                .with_timezone(&Utc),
            None => now - look_back,
        };
        Ok(Self { start, end: None })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn is_open(&self) -> bool {
        self.end.is_some()
    }

    /// Fix the end of the window for the run that is starting
    pub fn open(&mut self, now: DateTime<Utc>) {
        self.end = Some(now.max(self.start));
    }

    /// Move the start to the end of the finished run
    pub fn close(&mut self) {
        if let Some(end) = self.end.take() {
            self.start = end;
        }
    }
}

/// URL and body templates with their placeholder definitions
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    uri: String,
    body: Option<String>,
    fields: Vec<TemplatedFieldSpec>,
}

impl RequestTemplate {
    pub fn new(uri: impl Into<String>, body: Option<String>, fields: Vec<TemplatedFieldSpec>) -> Self {
        Self {
            uri: uri.into(),
            body,
            fields,
        }
    }

    pub fn render(&self, window: &DateWindow, pointer: Option<&str>) -> StreamResult<ApiRequest> {
        let mut url = self.uri.clone();
        let mut body = self.body.clone();
        for field in &self.fields {
            let value = match field.kind {
                TemplatedFieldKind::DateRangeStart => format_date(window.start(), field.format.as_deref())?,
                TemplatedFieldKind::DateRangeEnd => {
                    let end = window
                        .end()
                        .ok_or_else(|| StreamError::config("date window is not open"))?;
                    format_date(end, field.format.as_deref())?
                }
                TemplatedFieldKind::PagePointer => pointer.unwrap_or_default().to_string(),
            };
            let placeholder = format!("{{{}}}", field.name);
            match field.placement {
                FieldPlacement::Url => url = url.replace(&placeholder, &urlencoding::encode(&value)),
                FieldPlacement::Body => {
                    let Some(text) = body.as_mut() else {
                        return Err(StreamError::config(format!(
                            "field {} is placed in the body but no body template is set",
                            field.name
                        )));
                    };
                    *text = text.replace(&placeholder, &value);
                }
            }
        }
        Ok(ApiRequest { url, body })
    }
}

/// One request per run
pub struct SimpleUriProvider {
    template: RequestTemplate,
    window: DateWindow,
}

impl SimpleUriProvider {
    pub fn new(template: RequestTemplate, window: DateWindow) -> Self {
        Self { template, window }
    }
}

impl UriProvider for SimpleUriProvider {
    fn next_request(&mut self, last: Option<&Page>) -> StreamResult<Option<ApiRequest>> {
        if self.window.is_open() && last.is_some() {
            self.window.close();
            return Ok(None);
        }
        self.window.open(Utc::now());
        self.template.render(&self.window, None).map(Some)
    }
}

/// Requests driven by a page resolver
pub struct PagedUriProvider {
    template: RequestTemplate,
    window: DateWindow,
    resolver: Box<dyn PageResolver>,
}

impl PagedUriProvider {
    pub fn new(template: RequestTemplate, window: DateWindow, resolver: Box<dyn PageResolver>) -> Self {
        Self {
            template,
            window,
            resolver,
        }
    }
}

impl UriProvider for PagedUriProvider {
    fn next_request(&mut self, last: Option<&Page>) -> StreamResult<Option<ApiRequest>> {
        if !self.resolver.resolve(last) {
            self.window.close();
            return Ok(None);
        }
        if !self.window.is_open() {
            self.window.open(Utc::now());
        }
        let pointer = self.resolver.pointer();
        self.template.render(&self.window, pointer.as_deref()).map(Some)
    }
}

fn format_date(value: DateTime<Utc>, format: Option<&str>) -> StreamResult<String> {
    let Some(format) = format else {
        return Ok(value.to_rfc3339_opts(SecondsFormat::Secs, true));
    };
    let mut out = String::new();
    write!(out, "{}", value.format(format))
        .map_err(|_| StreamError::config(format!("invalid date format {format}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::paging::CounterResolver;
    use chrono::TimeZone;
    use serde_json::json;

    fn field(name: &str, kind: TemplatedFieldKind, placement: FieldPlacement) -> TemplatedFieldSpec {
        TemplatedFieldSpec {
            name: name.into(),
            kind,
            format: None,
            placement,
        }
    }

    fn window() -> DateWindow {
        DateWindow::starting(
            true,
            Some("2024-01-01T00:00:00Z"),
            ChronoDuration::hours(1),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_render_dates_and_pointer() {
        let template = RequestTemplate::new(
            "https://api.test/orders?from={from}&page={page}",
            Some(r#"{"until":"{until}"}"#.into()),
            vec![
                field("from", TemplatedFieldKind::DateRangeStart, FieldPlacement::Url),
                TemplatedFieldSpec {
                    format: Some("%Y-%m-%d".into()),
                    ..field("until", TemplatedFieldKind::DateRangeEnd, FieldPlacement::Body)
                },
                field("page", TemplatedFieldKind::PagePointer, FieldPlacement::Url),
            ],
        );
        let mut window = window();
        window.open(Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap());
        let request = template.render(&window, Some("a b:c/d")).unwrap();
        assert_eq!(
            request.url,
            "https://api.test/orders?from=2024-01-01T00%3A00%3A00Z&page=a%20b%3Ac%2Fd"
        );
        assert_eq!(request.body.as_deref(), Some(r#"{"until":"2024-03-05"}"#));
    }

    #[test]
    fn test_invalid_backfill_start_is_config_error() {
        let err = DateWindow::starting(true, Some("yesterday"), ChronoDuration::hours(1), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_incremental_window_uses_look_back() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let window =
            DateWindow::starting(false, Some("2020-01-01T00:00:00Z"), ChronoDuration::hours(2), now)
                .unwrap();
        assert_eq!(window.start(), Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_simple_provider_issues_one_request_per_run() {
        let template = RequestTemplate::new("https://api.test/rates", None, vec![]);
        let mut provider = SimpleUriProvider::new(template, window());
        let page = Page::new(json!([1]), 1);
        assert!(provider.next_request(None).unwrap().is_some());
        assert!(provider.next_request(Some(&page)).unwrap().is_none());
        assert!(provider.next_request(None).unwrap().is_some());
    }

    #[test]
    fn test_paged_provider_resets_window_when_exhausted() {
        let template = RequestTemplate::new(
            "https://api.test/orders?from={from}&page={page}",
            None,
            vec![
                field("from", TemplatedFieldKind::DateRangeStart, FieldPlacement::Url),
                field("page", TemplatedFieldKind::PagePointer, FieldPlacement::Url),
            ],
        );
        let mut provider = PagedUriProvider::new(
            template,
            window(),
            Box::new(CounterResolver::new(vec!["pages".into()])),
        );
        let filled = Page::new(json!({ "pages": 2, "items": [1] }), 1);

        let first = provider.next_request(None).unwrap().unwrap();
        assert_eq!(first.url, "https://api.test/orders?from=2024-01-01T00%3A00%3A00Z&page=1");
        let second = provider.next_request(Some(&filled)).unwrap().unwrap();
        assert!(second.url.ends_with("page=2"));
        assert!(provider.next_request(Some(&filled)).unwrap().is_none());

        // next run starts at the end of the previous window
        let next = provider.next_request(None).unwrap().unwrap();
        assert!(!next.url.contains("2024-01-01T00%3A00%3A00Z"));
        assert!(next.url.ends_with("page=1"));
    }
}
