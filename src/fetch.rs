//! Fetch layer: the boundary between the pipeline and page rendering.
//!
//! The pipeline only ever sees the [`Renderer`] contract,
//! `render(url, wait_policy) -> Document | FetchError`, so it can run against
//! fixture documents without a network or a browser.
//!
//! # Implementations
//!
//! - [`HttpRenderer`]: plain HTTP via `reqwest`, optionally routed through an
//!   external JavaScript rendering service
//! - [`FixtureRenderer`]: in-memory pages or `.html` files on disk
//! - [`RetryRenderer`]: decorator adding exponential backoff to any renderer
//!
//! # Retry Strategy
//!
//! - Only transient failures are retried (network, timeout, 429, 5xx)
//! - Exponential backoff from `base_delay`, capped at 30 seconds
//! - Random jitter (0-250ms) added to each delay

use crate::error::FetchError;
use crate::utils::{slugify, truncate_for_log};
use rand::{Rng, rng};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

/// A rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// The URL the document was rendered from; relative links resolve against it.
    pub url: String,
    pub html: String,
}

/// How long and for what the renderer should wait before returning the DOM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WaitPolicy {
    /// CSS selector that must be present before the page counts as rendered.
    pub wait_for: Option<String>,
    /// Scroll to the bottom once to trigger lazy-loaded product cards.
    pub scroll_to_bottom: bool,
    /// Extra settle time after the page reports ready.
    pub settle: Duration,
}

/// Renders a URL into a [`Document`].
pub trait Renderer {
    async fn render(&self, url: &str, wait: &WaitPolicy) -> Result<Document, FetchError>;
}

/// Fetches pages over HTTP.
///
/// Without a render service the raw server HTML is returned, which is enough
/// for sources that render their product grid server-side. With a render
/// service, the request is sent as
/// `{service}?url=<page>&wait=<secs>&scroll=<0|1>[&wait_for=<css>]` and the
/// service's response body is taken as the rendered DOM.
pub struct HttpRenderer {
    client: reqwest::Client,
    render_service: Option<String>,
}

impl HttpRenderer {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        render_service: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            render_service,
        })
    }

    fn request_url(&self, url: &str, wait: &WaitPolicy) -> String {
        match &self.render_service {
            None => url.to_string(),
            Some(service) => {
                let mut request = format!(
                    "{}?url={}&wait={}&scroll={}",
                    service.trim_end_matches('/'),
                    urlencoding::encode(url),
                    wait.settle.as_secs_f64(),
                    u8::from(wait.scroll_to_bottom)
                );
                if let Some(selector) = &wait.wait_for {
                    request.push_str("&wait_for=");
                    request.push_str(&urlencoding::encode(selector));
                }
                request
            }
        }
    }

    /// A 5xx from the render service means the render failed, not the page.
    fn status_error(&self, url: &str, status: u16) -> FetchError {
        if self.render_service.is_some() && status >= 500 {
            FetchError::Render {
                url: url.to_string(),
                message: format!("render service answered HTTP {status}"),
            }
        } else {
            FetchError::Status {
                url: url.to_string(),
                status,
            }
        }
    }
}

impl fmt::Debug for HttpRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRenderer")
            .field("render_service", &self.render_service)
            .finish()
    }
}

impl Renderer for HttpRenderer {
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn render(&self, url: &str, wait: &WaitPolicy) -> Result<Document, FetchError> {
        let request_url = self.request_url(url, wait);
        let network = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        };

        let response = self.client.get(&request_url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(url, status.as_u16()));
        }
        let html = response.text().await.map_err(network)?;
        debug!(bytes = html.len(), "Fetched page");
        Ok(Document {
            url: url.to_string(),
            html,
        })
    }
}

/// Serves fixed documents, keyed by URL.
///
/// Pages registered with [`FixtureRenderer::with_page`] win; otherwise, when a
/// directory is configured, `<dir>/<slugified url>.html` is read.
#[derive(Debug, Default)]
pub struct FixtureRenderer {
    pages: HashMap<String, String>,
    dir: Option<PathBuf>,
}

impl FixtureRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            pages: HashMap::new(),
            dir: Some(dir.into()),
        }
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// The file name a page is looked up under in the fixture directory.
    pub fn file_name(url: &str) -> String {
        format!("{}.html", slugify(url))
    }
}

impl Renderer for FixtureRenderer {
    async fn render(&self, url: &str, _wait: &WaitPolicy) -> Result<Document, FetchError> {
        if let Some(html) = self.pages.get(url) {
            return Ok(Document {
                url: url.to_string(),
                html: html.clone(),
            });
        }
        let not_found = || FetchError::NotFound {
            url: url.to_string(),
        };
        let dir = self.dir.as_ref().ok_or_else(not_found)?;
        let path = dir.join(Self::file_name(url));
        let html = tokio::fs::read_to_string(&path).await.map_err(|_| not_found())?;
        Ok(Document {
            url: url.to_string(),
            html,
        })
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`Renderer`].
///
/// The delay between retries follows this formula:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryRenderer<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> RetryRenderer<T>
where
    T: Renderer,
{
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryRenderer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRenderer")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> Renderer for RetryRenderer<T>
where
    T: Renderer,
{
    #[instrument(level = "info", skip_all, fields(url = %truncate_for_log(url, 120)))]
    async fn render(&self, url: &str, wait: &WaitPolicy) -> Result<Document, FetchError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.render(url, wait).await {
                Ok(document) => return Ok(document),
                Err(e) if !e.is_transient() => {
                    warn!(error = %e, "render failed with a permanent error; not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis(),
                            elapsed_ms_total = total_dt.as_millis(),
                            error = %e,
                            "render() exhausted retries"
                        );
                        return Err(e);
                    }

                    let mut delay = self.base_delay.saturating_mul(1 << (attempt - 1));
                    if delay > self.max_delay {
                        delay = self.max_delay;
                    }
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + Duration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis(),
                        elapsed_ms_total = total_dt.as_millis(),
                        ?delay,
                        error = %e,
                        "render() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given error a fixed number of times, then succeeds.
    struct Flaky {
        failures: usize,
        status: u16,
        calls: AtomicUsize,
    }

    impl Renderer for Flaky {
        async fn render(&self, url: &str, _wait: &WaitPolicy) -> Result<Document, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(FetchError::Status {
                    url: url.to_string(),
                    status: self.status,
                })
            } else {
                Ok(Document {
                    url: url.to_string(),
                    html: "<html></html>".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let flaky = Flaky {
            failures: 2,
            status: 503,
            calls: AtomicUsize::new(0),
        };
        let renderer = RetryRenderer::new(flaky, 3, Duration::from_millis(1));
        let doc = renderer
            .render("https://example.com/a", &WaitPolicy::default())
            .await
            .unwrap();
        assert_eq!(doc.url, "https://example.com/a");
        assert_eq!(renderer.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let flaky = Flaky {
            failures: 10,
            status: 502,
            calls: AtomicUsize::new(0),
        };
        let renderer = RetryRenderer::new(flaky, 2, Duration::from_millis(1));
        let err = renderer
            .render("https://example.com/a", &WaitPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 502, .. }));
        assert_eq!(renderer.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let flaky = Flaky {
            failures: 10,
            status: 404,
            calls: AtomicUsize::new(0),
        };
        let renderer = RetryRenderer::new(flaky, 3, Duration::from_millis(1));
        assert!(renderer.render("https://example.com/a", &WaitPolicy::default()).await.is_err());
        assert_eq!(renderer.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fixture_renderer_reads_pages_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://www.cvs.com/search?searchTerm=women+health+test";
        std::fs::write(dir.path().join(FixtureRenderer::file_name(url)), "<p>from disk</p>").unwrap();

        let renderer = FixtureRenderer::from_dir(dir.path()).with_page("https://a.test/", "<p>memory</p>");
        let memory = renderer.render("https://a.test/", &WaitPolicy::default()).await.unwrap();
        assert_eq!(memory.html, "<p>memory</p>");
        let disk = renderer.render(url, &WaitPolicy::default()).await.unwrap();
        assert_eq!(disk.html, "<p>from disk</p>");
        let missing = renderer.render("https://b.test/", &WaitPolicy::default()).await;
        assert!(matches!(missing, Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn test_render_service_request_url() {
        let renderer = HttpRenderer::new(
            "kitprice-test",
            Duration::from_secs(5),
            Some("http://localhost:8050/render.html/".to_string()),
        )
        .unwrap();
        let wait = WaitPolicy {
            wait_for: Some(".product-card".to_string()),
            scroll_to_bottom: true,
            settle: Duration::from_secs(2),
        };
        let request = renderer.request_url("https://www.cvs.com/search?q=a b", &wait);
        assert_eq!(
            request,
            "http://localhost:8050/render.html?url=https%3A%2F%2Fwww.cvs.com%2Fsearch%3Fq%3Da%20b&wait=2&scroll=1&wait_for=.product-card"
        );
    }

    #[test]
    fn test_render_service_failures_map_to_render_error() {
        let service = HttpRenderer::new(
            "kitprice-test",
            Duration::from_secs(5),
            Some("http://localhost:8050/render.html".to_string()),
        )
        .unwrap();
        let err = service.status_error("https://www.cvs.com/s", 502);
        assert!(matches!(err, FetchError::Render { .. }));
        assert!(err.is_transient());
        assert!(matches!(service.status_error("https://www.cvs.com/s", 404), FetchError::Status { status: 404, .. }));

        let plain = HttpRenderer::new("kitprice-test", Duration::from_secs(5), None).unwrap();
        assert!(matches!(plain.status_error("https://www.cvs.com/s", 502), FetchError::Status { status: 502, .. }));
    }

    #[test]
    fn test_plain_request_url_is_unchanged() {
        let renderer = HttpRenderer::new("kitprice-test", Duration::from_secs(5), None).unwrap();
        assert_eq!(
            renderer.request_url("https://www.target.com/s", &WaitPolicy::default()),
            "https://www.target.com/s"
        );
    }
}
