//! Request/response sessions over HTTP.
use std::{
    borrow::Cow,
    ops::RangeInclusive,
    time::{Duration, SystemTime},
};

use reqwest::{Client, Method, header::CONTENT_TYPE};
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    context::IterationContext,
    fixture::{SetupError, excerpt},
    metric::{RequestRecord, Sample, Tags},
};

/// Statuses that count as a successful response for `http_req_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatuses {
    ranges: Vec<RangeInclusive<u16>>,
}

impl Default for ExpectedStatuses {
    fn default() -> Self {
        Self::range(200..=399)
    }
}

impl ExpectedStatuses {
    pub fn range(range: RangeInclusive<u16>) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    pub fn of(statuses: &[u16]) -> Self {
        Self {
            ranges: statuses.iter().map(|&s| s..=s).collect(),
        }
    }

    pub fn and(mut self, status: u16) -> Self {
        self.ranges.push(status..=status);
        self
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&status))
    }
}

/// One request, built fluently and sent with [`Http::request`].
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    tags: Tags,
    timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            tags: Tags::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Adds `Authorization: Bearer <token>`; an empty token adds nothing.
    pub fn bearer(self, token: &str) -> Self {
        if token.is_empty() {
            return self;
        }
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Serializes `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self.header(CONTENT_TYPE.as_str(), "application/json"))
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// What came back. Any transport failure sets `error`; the status is `0`
/// unless the failure happened while reading the body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub latency: Duration,
    pub error: Option<String>,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Status and the start of the body, for logs and setup errors.
    pub fn summary(&self) -> String {
        match (&self.error, self.status) {
            (Some(e), 0) => format!("no response: {e}"),
            (Some(e), status) => format!("{status}, body cut short: {e}"),
            (None, status) => format!("{status}: {}", excerpt(&self.text())),
        }
    }
}

/// Shared HTTP session strategy.
///
/// Cheap to clone; clone it into scenario closures instead of building a
/// client per iteration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Http {
    #[builder(default)]
    client: Client,
    #[builder(default)]
    expected: ExpectedStatuses,
    /// Applied to requests without their own timeout.
    #[builder(default = Duration::from_secs(60))]
    timeout: Duration,
}

impl Default for Http {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Http {
    /// Sends `spec` and records a `RequestRecord` tagged with the iteration
    /// tags, `method`, `status` and the request's own tags.
    pub async fn request<D>(&self, ctx: &IterationContext<D>, spec: RequestSpec) -> Response {
        let tags = ctx
            .tags
            .merged(&spec.tags)
            .with("method", spec.method.as_str());
        let response = self.send(&spec).await;
        let failed = response.error.is_some() || !self.expected.contains(response.status);

        if failed {
            tracing::debug!(
                "[{}] {} {}",
                spec.tags.get("type").unwrap_or("unknown"),
                spec.describe(),
                response.summary()
            );
        }
        ctx.sink().record(Sample::Request(RequestRecord {
            tags: tags.with("status", response.status.to_string()),
            status: response.status,
            failed,
            latency: response.latency,
            timestamp: SystemTime::now(),
            bytes: response.body.len(),
        }));
        response
    }

    /// Sends `spec` without recording anything; meant for setup code.
    pub async fn fetch(&self, spec: RequestSpec) -> Response {
        self.send(&spec).await
    }

    /// Like [`Http::fetch`], but any status outside `200..300` or an
    /// undecodable body is a [`SetupError`].
    pub async fn fetch_json<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, SetupError> {
        let response = self.send(&spec).await;
        if !response.is_success() || response.error.is_some() {
            return Err(match &response.error {
                Some(e) if response.status == 0 => {
                    SetupError::new(spec.describe(), format!("request failed: {e}"))
                }
                Some(e) => SetupError::http(
                    spec.describe(),
                    response.status,
                    &response.text(),
                    format!("body read failed: {e}"),
                ),
                None => SetupError::http(
                    spec.describe(),
                    response.status,
                    &response.text(),
                    "unexpected status",
                ),
            });
        }
        response.json().map_err(|e| {
            SetupError::http(
                spec.describe(),
                response.status,
                &response.text(),
                format!("undecodable body: {e}"),
            )
        })
    }

    async fn send(&self, spec: &RequestSpec) -> Response {
        let mut builder = self
            .client
            .request(spec.method.clone(), &spec.url)
            .timeout(spec.timeout.unwrap_or(self.timeout));
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        for (key, value) in &spec.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let (status, result) = match builder.send().await {
            Ok(res) => {
                let status = res.status().as_u16();
                (status, res.bytes().await.map(|body| body.to_vec()))
            }
            Err(e) => (e.status().map_or(0, |s| s.as_u16()), Err(e)),
        };
        let latency = started.elapsed();

        match result {
            Ok(body) => Response {
                status,
                body,
                latency,
                error: None,
            },
            Err(e) => Response {
                status,
                body: Vec::new(),
                latency,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn expected_statuses() {
        let default = ExpectedStatuses::default();
        assert!(default.contains(200));
        assert!(default.contains(302));
        assert!(!default.contains(404));
        assert!(!default.contains(0));

        let observed = ExpectedStatuses::range(200..=206).and(409).and(429);
        assert!(observed.contains(409));
        assert!(!observed.contains(500));
        assert!(ExpectedStatuses::of(&[202]).contains(202));
    }

    #[test]
    fn empty_bearer_tokens_are_skipped() {
        let anonymous = RequestSpec::get("http://localhost").bearer("");
        assert!(anonymous.headers.is_empty());

        let authed = RequestSpec::get("http://localhost").bearer("abc");
        assert_eq!(
            authed.headers,
            vec![("Authorization".to_owned(), "Bearer abc".to_owned())]
        );
    }

    #[tokio::test]
    async fn unreachable_hosts_yield_status_zero() {
        let http = Http::builder().timeout(Duration::from_secs(2)).build();
        // Port 9 (discard) on loopback is closed on any sane test host
        let response = http.fetch(RequestSpec::get("http://127.0.0.1:9/")).await;
        assert_eq!(response.status, 0);
        assert!(response.error.is_some());
    }

    /// Serves one response that promises more body than it sends.
    fn truncating_server() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/rooms", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n[\"a\"");
        });
        url
    }

    #[tokio::test]
    async fn body_cut_short_keeps_the_status() {
        let url = truncating_server();
        let response = Http::default().fetch(RequestSpec::get(&url)).await;
        assert_eq!(response.status, 200);
        assert!(response.error.is_some());
        assert!(response.summary().starts_with("200, body cut short"), "{}", response.summary());

        let url = truncating_server();
        let err = Http::default()
            .fetch_json::<Vec<String>>(RequestSpec::get(&url))
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("body read failed"), "{err}");
        assert!(err.response.as_deref().is_some_and(|r| r.starts_with("200")), "{err}");
    }
}
