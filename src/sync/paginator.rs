//! Paginated ingestion over the resilient client
//!
//! The upstream returns either a bare JSON array or an envelope
//! `{ "data": [...], "meta": { "nextPage": n | null, "totalPages": n } }`.
//! Fetching stops as soon as any signal says there is nothing more: a page
//! shorter than the page size, a null or absent `nextPage`, or the last of
//! `totalPages`. Hitting the configured page cap while the upstream still
//! reports more pages is an error, so a capped entity is never mistaken for
//! a complete one.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::http_client::{CallOptions, ResilientClient};
use super::rate_limit::RateLimitSnapshot;
use crate::config::PaginatorConfig;
use crate::error::SyncError;

/// One fetched page
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number
    pub index: u32,
    pub items: Vec<Value>,
    pub rate_limit: RateLimitSnapshot,
    /// Total page count when the envelope reports it
    pub total_pages: Option<u32>,
    /// Whether another page will be requested
    pub has_more: bool,
    pub retries: u32,
}

/// Drives the client page by page
pub struct Paginator {
    client: Arc<ResilientClient>,
    config: PaginatorConfig,
}

impl Paginator {
    pub fn new(client: Arc<ResilientClient>, config: PaginatorConfig) -> Self {
        Self { client, config }
    }

    /// Lazy sequence of pages, consumed with `next().await`
    pub fn pages(&self, path: &str, query: Vec<(String, String)>, page_size: u32) -> PageStream<'_> {
        PageStream {
            paginator: self,
            path: path.to_string(),
            query,
            page_size: page_size.max(1),
            next_page: 1,
            last_rate_limit: None,
            done: false,
        }
    }

    /// Fetch every page and return the items in response order
    ///
    /// `on_progress(page_index, item_count, rate_limit)` runs after every page.
    pub async fn paginate<F>(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        page_size: u32,
        mut on_progress: F,
    ) -> Result<Vec<Value>, SyncError>
    where
        F: FnMut(u32, usize, &RateLimitSnapshot),
    {
        let mut accumulated = Vec::new();
        let mut stream = self.pages(path, query, page_size);

        while let Some(page) = stream.next().await {
            let page = page?;
            on_progress(page.index, page.items.len(), &page.rate_limit);
            accumulated.extend(page.items);
        }

        Ok(accumulated)
    }

    /// Pause before the next page, longer when the budget is nearly spent
    pub fn delay_after(&self, rate_limit: &RateLimitSnapshot) -> Duration {
        if rate_limit.is_low(self.config.low_water_mark) {
            Duration::from_millis(self.config.low_budget_delay_ms)
        } else {
            Duration::from_millis(self.config.page_delay_ms)
        }
    }
}

/// Lazy page sequence
pub struct PageStream<'a> {
    paginator: &'a Paginator,
    path: String,
    query: Vec<(String, String)>,
    page_size: u32,
    next_page: u32,
    last_rate_limit: Option<RateLimitSnapshot>,
    done: bool,
}

impl<'a> PageStream<'a> {
    /// Fetch the next page, or `None` once the sequence is exhausted
    ///
    /// An error ends the sequence.
    pub async fn next(&mut self) -> Option<Result<Page, SyncError>> {
        if self.done {
            return None;
        }

        // Only reached when the previous page reported more to come
        if self.next_page > self.paginator.config.max_pages {
            let max_pages = self.paginator.config.max_pages;
            warn!(
                path = %self.path,
                max_pages = max_pages,
                "Page cap reached with more pages pending"
            );
            self.done = true;
            return Some(Err(SyncError::InvalidData(format!(
                "page cap of {} reached with more pages pending",
                max_pages
            ))));
        }

        if let Some(rate_limit) = &self.last_rate_limit {
            let delay = self.paginator.delay_after(rate_limit);
            if rate_limit.is_low(self.paginator.config.low_water_mark) {
                debug!(
                    path = %self.path,
                    remaining = ?rate_limit.remaining,
                    delay_ms = delay.as_millis() as u64,
                    "Rate-limit budget low, slowing down"
                );
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let index = self.next_page;
        let mut options = CallOptions::get();
        options.query = self.query.clone();
        options.query.push(("page".to_string(), index.to_string()));
        options
            .query
            .push(("per_page".to_string(), self.page_size.to_string()));

        let response = match self.paginator.client.call(&self.path, &options).await {
            Ok(response) => response,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let parsed = match parse_body(response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let short_page = (parsed.items.len() as u32) < self.page_size;
        let envelope_says_stop = parsed.next_page_present == Some(false)
            || matches!(parsed.total_pages, Some(total) if index >= total);
        let has_more = !short_page && !envelope_says_stop;

        debug!(
            path = %self.path,
            page = index,
            rows = parsed.items.len(),
            has_more = has_more,
            "Fetched page"
        );

        self.done = !has_more;
        self.next_page += 1;
        self.last_rate_limit = Some(response.rate_limit.clone());

        Some(Ok(Page {
            index,
            items: parsed.items,
            rate_limit: response.rate_limit,
            total_pages: parsed.total_pages,
            has_more,
            retries: response.retries,
        }))
    }
}

struct ParsedBody {
    items: Vec<Value>,
    /// `Some(false)` when the envelope reports no next page, either with a
    /// null `nextPage` or by omitting both `nextPage` and `totalPages`
    next_page_present: Option<bool>,
    total_pages: Option<u32>,
}

fn parse_body(body: Value) -> Result<ParsedBody, SyncError> {
    match body {
        Value::Array(items) => Ok(ParsedBody {
            items,
            next_page_present: None,
            total_pages: None,
        }),
        Value::Object(mut map) => {
            let items = match map.remove("data") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(SyncError::InvalidData(
                        "envelope 'data' is not an array".to_string(),
                    ))
                }
            };
            let meta = map.remove("meta").unwrap_or(Value::Null);
            let total_pages = meta
                .get("totalPages")
                .and_then(Value::as_u64)
                .map(|t| t as u32);
            // An envelope with neither nextPage nor totalPages has no next page
            let next_page_present = match meta.get("nextPage") {
                Some(next) => Some(!next.is_null()),
                None if total_pages.is_some() => None,
                None => Some(false),
            };

            Ok(ParsedBody {
                items,
                next_page_present,
                total_pages,
            })
        }
        Value::Null => Ok(ParsedBody {
            items: Vec::new(),
            next_page_present: None,
            total_pages: None,
        }),
        other => Err(SyncError::InvalidData(format!(
            "unexpected page body: {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig, UpstreamConfig};
    use crate::sync::breaker::CircuitBreaker;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn items(start: usize, count: usize) -> Value {
        Value::Array(
            (start..start + count)
                .map(|i| serde_json::json!({"id": i}))
                .collect(),
        )
    }

    fn paginator_for(server: &MockServer) -> Paginator {
        let upstream = UpstreamConfig {
            base_url: Some(server.uri()),
            api_token: Some("t".to_string()),
            timeout_ms: 2_000,
            page_size: 200,
        };
        let retry = RetryConfig {
            max_retries: 0,
            base_delay_ms: 0,
            growth: 2.0,
            max_delay_ms: 0,
            jitter: false,
        };
        let client = ResilientClient::new(
            &upstream,
            retry,
            Arc::new(CircuitBreaker::new(&BreakerConfig::default())),
        )
        .unwrap();
        Paginator::new(
            Arc::new(client),
            PaginatorConfig {
                page_delay_ms: 0,
                low_budget_delay_ms: 0,
                low_water_mark: 10,
                max_pages: 100,
            },
        )
    }

    async fn mount_page(server: &MockServer, page: u32, body: Value) {
        Mock::given(method("GET"))
            .and(path("/owners"))
            .and(query_param("page", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    // Test 1: Pages of 200, 200, 150 yield 550 items in 3 requests
    #[tokio::test]
    async fn test_stops_after_short_page() {
        let server = MockServer::start().await;
        mount_page(&server, 1, items(0, 200)).await;
        mount_page(&server, 2, items(200, 200)).await;
        mount_page(&server, 3, items(400, 150)).await;

        let paginator = paginator_for(&server);
        let mut progress = Vec::new();
        let all = paginator
            .paginate("/owners", Vec::new(), 200, |page, count, _| {
                progress.push((page, count))
            })
            .await
            .unwrap();

        assert_eq!(all.len(), 550);
        assert_eq!(all[0]["id"], 0);
        assert_eq!(all[549]["id"], 549);
        assert_eq!(progress, vec![(1, 200), (2, 200), (3, 150)]);
    }

    // Test 2: Empty first page returns nothing after one request
    #[tokio::test]
    async fn test_empty_first_page() {
        let server = MockServer::start().await;
        mount_page(&server, 1, serde_json::json!([])).await;

        let paginator = paginator_for(&server);
        let all = paginator
            .paginate("/owners", Vec::new(), 200, |_, _, _| {})
            .await
            .unwrap();

        assert!(all.is_empty());
    }

    // Test 3: Envelope with null nextPage stops even on a full page
    #[tokio::test]
    async fn test_envelope_next_page_null_stops() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            serde_json::json!({"data": items(0, 2), "meta": {"nextPage": 2, "totalPages": 2}}),
        )
        .await;
        mount_page(
            &server,
            2,
            serde_json::json!({"data": items(2, 2), "meta": {"nextPage": null, "totalPages": 2}}),
        )
        .await;

        let paginator = paginator_for(&server);
        let mut stream = paginator.pages("/owners", Vec::new(), 2);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.total_pages, Some(2));
        assert!(first.has_more);

        let second = stream.next().await.unwrap().unwrap();
        assert!(!second.has_more);
        assert!(stream.next().await.is_none());
    }

    // Test 4: Errors end the stream
    #[tokio::test]
    async fn test_error_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let paginator = paginator_for(&server);
        let mut stream = paginator.pages("/owners", Vec::new(), 200);

        assert!(matches!(
            stream.next().await,
            Some(Err(SyncError::ClientError { status: 400, .. }))
        ));
        assert!(stream.next().await.is_none());
    }

    // Test 5: Page cap with more pages pending is an error, not a short result
    #[tokio::test]
    async fn test_max_pages_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/owners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(items(0, 1)))
            .expect(3)
            .mount(&server)
            .await;

        let mut paginator = paginator_for(&server);
        paginator.config.max_pages = 3;

        let result = paginator
            .paginate("/owners", Vec::new(), 1, |_, _, _| {})
            .await;
        match result {
            Err(SyncError::InvalidData(message)) => {
                assert!(message.contains("page cap of 3"));
            }
            other => panic!("expected page cap error, got {:?}", other),
        }
    }

    // Test 6: Last page landing exactly on the cap is not an error
    #[tokio::test]
    async fn test_max_pages_cap_exact_fit() {
        let server = MockServer::start().await;
        mount_page(&server, 1, items(0, 2)).await;
        mount_page(&server, 2, items(2, 1)).await;

        let mut paginator = paginator_for(&server);
        paginator.config.max_pages = 2;

        let all = paginator
            .paginate("/owners", Vec::new(), 2, |_, _, _| {})
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    // Test 7: Envelope without nextPage or totalPages stops after one full page
    #[tokio::test]
    async fn test_envelope_without_next_page_stops() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            serde_json::json!({"data": items(0, 2), "meta": {}}),
        )
        .await;

        let paginator = paginator_for(&server);
        let mut stream = paginator.pages("/owners", Vec::new(), 2);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(!first.has_more);
        assert!(stream.next().await.is_none());
    }

    // Test 8: Adaptive delay switches on the low-water mark
    #[test]
    fn test_adaptive_delay() {
        let paginator = Paginator {
            client: Arc::new(
                ResilientClient::new(
                    &UpstreamConfig {
                        base_url: Some("http://localhost".to_string()),
                        ..UpstreamConfig::default()
                    },
                    RetryConfig::default(),
                    Arc::new(CircuitBreaker::with_defaults()),
                )
                .unwrap(),
            ),
            config: PaginatorConfig::default(),
        };

        let unknown = RateLimitSnapshot::default();
        assert_eq!(paginator.delay_after(&unknown), Duration::from_millis(250));

        let plenty = RateLimitSnapshot {
            remaining: Some(500),
            ..RateLimitSnapshot::default()
        };
        assert_eq!(paginator.delay_after(&plenty), Duration::from_millis(250));

        let low = RateLimitSnapshot {
            remaining: Some(3),
            ..RateLimitSnapshot::default()
        };
        assert_eq!(paginator.delay_after(&low), Duration::from_millis(5000));
    }

    // Test 9: Body shape parsing
    #[test]
    fn test_parse_body_shapes() {
        let parsed = parse_body(serde_json::json!({"data": [1, 2], "meta": {}})).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.next_page_present, Some(false));

        let parsed = parse_body(serde_json::json!({"data": [1]})).unwrap();
        assert_eq!(parsed.next_page_present, Some(false));

        let parsed = parse_body(serde_json::json!({"data": [1], "meta": {"totalPages": 4}})).unwrap();
        assert_eq!(parsed.next_page_present, None);
        assert_eq!(parsed.total_pages, Some(4));

        let parsed = parse_body(serde_json::json!([1, 2])).unwrap();
        assert_eq!(parsed.next_page_present, None);

        assert!(parse_body(serde_json::json!("oops")).is_err());
        assert!(parse_body(serde_json::json!({"data": {"id": 1}})).is_err());
        assert!(parse_body(Value::Null).unwrap().items.is_empty());
    }
}
