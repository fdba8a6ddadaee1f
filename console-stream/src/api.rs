//! REST client for job detail, event pages, and the cancel flow.
//!
//! Event history is paginated; callers get a URL builder for the first page
//! and follow the absolute `next` links the server returns. The server
//! advertises its per-view event ceiling in the `X-UI-Max-Events` response
//! header, which feeds the truncation banner upstream.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use url::Url;

use console_types::{CancelCheck, EventPage, JobSummary, STRUCTURAL_EVENT_KINDS};

/// Response header naming the server's event-count ceiling for one view.
pub const MAX_EVENTS_HEADER: &str = "X-UI-Max-Events";

const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {0} failed: {1}")]
    Request(String, String),

    #[error("session rejected with status {0}")]
    Unauthorized(u16),

    #[error("{url} returned status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not parse response from {0}: {1}")]
    Parse(String, String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    /// True when the session itself is dead and no retry can help.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Which slice of a job's events a page request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Play, task, and recap markers only. Small, loads first.
    Structural,
    /// Everything except the structural markers.
    Detail,
    /// No kind filter.
    All,
}

/// Query parameters for an event page request. Pages are always ordered by
/// `start_line` so output assembles top to bottom.
#[derive(Debug, Clone)]
pub struct EventQuery {
    filter: EventFilter,
    page_size: u32,
    counter_lte: Option<u64>,
}

impl EventQuery {
    pub fn structural() -> Self {
        Self {
            filter: EventFilter::Structural,
            page_size: DEFAULT_PAGE_SIZE,
            counter_lte: None,
        }
    }

    pub fn detail() -> Self {
        Self {
            filter: EventFilter::Detail,
            page_size: DEFAULT_PAGE_SIZE,
            counter_lte: None,
        }
    }

    pub fn all() -> Self {
        Self {
            filter: EventFilter::All,
            page_size: DEFAULT_PAGE_SIZE,
            counter_lte: None,
        }
    }

    /// Bound the page to events at or below `counter`, fencing a backlog
    /// replay off from live traffic.
    pub fn up_to_counter(mut self, counter: u64) -> Self {
        self.counter_lte = Some(counter);
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    fn apply(&self, url: &mut Url) {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("order_by", "start_line");
        pairs.append_pair("page_size", &self.page_size.to_string());
        match self.filter {
            EventFilter::Structural => {
                pairs.append_pair("event__in", &STRUCTURAL_EVENT_KINDS.join(","));
            }
            EventFilter::Detail => {
                pairs.append_pair("not__event__in", &STRUCTURAL_EVENT_KINDS.join(","));
            }
            EventFilter::All => {}
        }
        if let Some(counter) = self.counter_lte {
            pairs.append_pair("counter__lte", &counter.to_string());
        }
    }
}

/// One fetched event page plus the truncation ceiling, when the server
/// sent one.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page: EventPage,
    pub max_events: Option<u64>,
}

/// HTTP client bound to one API base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)?;
        // No request timeout: a stalled fetch holds its stage open rather
        // than failing it, and stage completion is what gates Live.
        let http = reqwest::Client::new();
        Ok(Self { http, base, token })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// First-page URL for a job's events under `query`. Subsequent pages
    /// come from the `next` links in each response.
    pub fn events_url(&self, job_id: i64, query: &EventQuery) -> Result<String, ApiError> {
        let mut url = self.base.join(&format!("api/v1/jobs/{job_id}/job_events/"))?;
        query.apply(&mut url);
        Ok(url.into())
    }

    /// Fetch one event page from an absolute URL.
    pub async fn get_events(&self, url: &str) -> Result<FetchedPage, ApiError> {
        let response = self.check(url, self.request(reqwest::Method::GET, url)).await?;
        let max_events = max_events_from_headers(response.headers());
        let page: EventPage = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(url.to_string(), e.to_string()))?;
        Ok(FetchedPage { page, max_events })
    }

    pub async fn get_job(&self, job_id: i64) -> Result<JobSummary, ApiError> {
        let url: String = self.base.join(&format!("api/v1/jobs/{job_id}/"))?.into();
        let response = self
            .check(&url, self.request(reqwest::Method::GET, &url))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Parse(url, e.to_string()))
    }

    /// Whether the server will still accept a cancel for this job.
    pub async fn can_cancel(&self, job_id: i64) -> Result<bool, ApiError> {
        let url: String = self
            .base
            .join(&format!("api/v1/jobs/{job_id}/cancel/"))?
            .into();
        let response = self
            .check(&url, self.request(reqwest::Method::GET, &url))
            .await?;
        let check: CancelCheck = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(url, e.to_string()))?;
        Ok(check.can_cancel)
    }

    pub async fn cancel(&self, job_id: i64) -> Result<(), ApiError> {
        let url: String = self
            .base
            .join(&format!("api/v1/jobs/{job_id}/cancel/"))?
            .into();
        self.check(&url, self.request(reqwest::Method::POST, &url))
            .await?;
        Ok(())
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn check(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Request(url.to_string(), e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn max_events_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(MAX_EVENTS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// Tests
// ============================================================================
