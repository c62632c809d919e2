use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ConfluenceSettings;
use crate::model::{Page, Space};

/// Operations the core needs from the wiki that owns pages and labels.
pub trait SourceApi {
    fn list_spaces(&mut self) -> Result<Vec<Space>>;
    /// All pages of a space with parent linkage and labels resolved.
    fn list_pages(&mut self, space_key: &str) -> Result<Vec<Page>>;
    /// Storage-format (marked-up) body of a page.
    fn get_page_content(&mut self, page_id: &str) -> Result<String>;
    fn add_label(&mut self, page_id: &str, label: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub page_limit: usize,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_settings(settings: &ConfluenceSettings) -> Result<Self> {
        if settings.base_url.is_empty() {
            bail!("Confluence URL is not configured (set CONFLUENCE_URL or [confluence].url)");
        }
        if settings.email.is_empty() {
            bail!("Confluence email is not configured (set CONFLUENCE_EMAIL or [confluence].email)");
        }
        let Some(api_token) = settings.api_token.clone() else {
            bail!(
                "Confluence API token is missing or a placeholder (set CONFLUENCE_API_TOKEN or [confluence].api_token)"
            );
        };
        Ok(Self {
            base_url: settings.base_url.clone(),
            email: settings.email.clone(),
            api_token,
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            page_limit: settings.page_limit,
            rate_limit_read_ms: 100,
            rate_limit_write_ms: 500,
            max_retries: settings.max_retries,
            max_write_retries: settings.max_write_retries,
            retry_delay_ms: settings.retry_delay_ms,
        })
    }

    fn rest_root(&self) -> String {
        format!("{}/wiki/rest/api", self.base_url)
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn from_settings(settings: &ConfluenceSettings) -> Result<Self> {
        Self::new(ConfluenceClientConfig::from_settings(settings)?)
    }

    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, url: &Url) -> Result<Value> {
        let max_retries = self.config.max_retries;
        self.send_with_retry(max_retries, false, |client, config| {
            authorized(client.get(url.clone()), config)
        })
    }

    fn request_json_post(&mut self, url: &Url, body: &Value) -> Result<Value> {
        let max_retries = self.config.max_write_retries;
        self.send_with_retry(max_retries, true, |client, config| {
            authorized(client.post(url.clone()), config).json(body)
        })
    }

    fn send_with_retry<F>(&mut self, max_retries: usize, is_write: bool, build: F) -> Result<Value>
    where
        F: Fn(&Client, &ConfluenceClientConfig) -> RequestBuilder,
    {
        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = build(&self.client, &self.config).send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            tracing::debug!(%status, attempt, "retrying Confluence request");
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        let detail = response.text().unwrap_or_default();
                        bail!(
                            "Confluence API request failed with HTTP {status}: {}",
                            summarize_body(&detail)
                        );
                    }
                    if status == StatusCode::NO_CONTENT {
                        return Ok(Value::Null);
                    }
                    return response
                        .json()
                        .context("failed to decode Confluence API JSON response");
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        tracing::debug!(%error, attempt, "retrying Confluence request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call Confluence API");
                }
            }
        }

        bail!("Confluence API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let raw = format!("{}/{}", self.config.rest_root(), path.trim_start_matches('/'));
        let mut url =
            Url::parse(&raw).with_context(|| format!("invalid Confluence URL: {raw}"))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Follow `_links.next` until the listing is exhausted.
    fn collect_paginated<T, F>(&mut self, first: Url, mut push: F) -> Result<()>
    where
        T: for<'de> Deserialize<'de>,
        F: FnMut(T),
    {
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let payload = self.request_json_get(&url)?;
            let listing: Listing<T> = serde_json::from_value(payload)
                .context("failed to decode Confluence listing response")?;
            for item in listing.results {
                push(item);
            }
            if let Some(link) = listing.links.next.as_deref() {
                next = Some(resolve_next_url(
                    link,
                    listing.links.base.as_deref(),
                    &self.config.base_url,
                )?);
            }
        }
        Ok(())
    }
}

impl SourceApi for ConfluenceClient {
    fn list_spaces(&mut self) -> Result<Vec<Space>> {
        let url = self.endpoint("space", &[("limit", self.config.page_limit.to_string())])?;
        let mut spaces = Vec::new();
        self.collect_paginated(url, |item: SpaceItem| {
            spaces.push(Space {
                name: item.name.unwrap_or_else(|| item.key.clone()),
                key: item.key,
                last_indexed: None,
            });
        })?;
        Ok(spaces)
    }

    fn list_pages(&mut self, space_key: &str) -> Result<Vec<Page>> {
        let url = self.endpoint(
            "content",
            &[
                ("spaceKey", space_key.to_string()),
                ("type", "page".to_string()),
                ("expand", "metadata.labels,ancestors".to_string()),
                ("limit", self.config.page_limit.to_string()),
            ],
        )?;
        let mut pages = Vec::new();
        self.collect_paginated(url, |item: ContentItem| {
            pages.push(page_from_item(item, space_key));
        })
        .with_context(|| format!("failed to list pages of space {space_key}"))?;
        tracing::debug!(space_key, pages = pages.len(), "fetched pages from Confluence");
        Ok(pages)
    }

    fn get_page_content(&mut self, page_id: &str) -> Result<String> {
        let url = self.endpoint(
            &format!("content/{page_id}"),
            &[("expand", "body.storage".to_string())],
        )?;
        let payload = self.request_json_get(&url)?;
        let item: ContentItem = serde_json::from_value(payload)
            .with_context(|| format!("failed to decode content of page {page_id}"))?;
        Ok(item
            .body
            .and_then(|body| body.storage)
            .map(|storage| storage.value)
            .unwrap_or_default())
    }

    fn add_label(&mut self, page_id: &str, label: &str) -> Result<()> {
        let url = self.endpoint(&format!("content/{page_id}/label"), &[])?;
        let body = json!([{ "prefix": "global", "name": label }]);
        self.request_json_post(&url, &body)
            .with_context(|| format!("failed to add label {label:?} to page {page_id}"))?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Builds the Confluence client on first use so cache-only commands work
/// without credentials.
pub struct LazyConfluenceClient {
    settings: ConfluenceSettings,
    client: Option<ConfluenceClient>,
}

impl LazyConfluenceClient {
    pub fn new(settings: ConfluenceSettings) -> Self {
        Self {
            settings,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&mut ConfluenceClient> {
        if self.client.is_none() {
            self.client = Some(ConfluenceClient::from_settings(&self.settings)?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Confluence client is unavailable"))
    }
}

impl SourceApi for LazyConfluenceClient {
    fn list_spaces(&mut self) -> Result<Vec<Space>> {
        self.client()?.list_spaces()
    }

    fn list_pages(&mut self, space_key: &str) -> Result<Vec<Page>> {
        self.client()?.list_pages(space_key)
    }

    fn get_page_content(&mut self, page_id: &str) -> Result<String> {
        self.client()?.get_page_content(page_id)
    }

    fn add_label(&mut self, page_id: &str, label: &str) -> Result<()> {
        self.client()?.add_label(page_id, label)
    }

    fn request_count(&self) -> usize {
        self.client.as_ref().map_or(0, |client| client.request_count())
    }
}

fn authorized(builder: RequestBuilder, config: &ConfluenceClientConfig) -> RequestBuilder {
    builder
        .basic_auth(&config.email, Some(&config.api_token))
        .header("User-Agent", config.user_agent.clone())
        .header("Accept", "application/json")
}

/// Confluence returns `_links.next` relative to `_links.base` (which already ends in `/wiki`).
fn resolve_next_url(next: &str, links_base: Option<&str>, base_url: &str) -> Result<Url> {
    if let Ok(absolute) = Url::parse(next) {
        return Ok(absolute);
    }
    let base = links_base
        .map(|base| base.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("{}/wiki", base_url.trim_end_matches('/')));
    let joined = format!("{base}/{}", next.trim_start_matches('/'));
    Url::parse(&joined).with_context(|| format!("invalid Confluence next link: {joined}"))
}

fn page_from_item(item: ContentItem, space_key: &str) -> Page {
    let parent_id = item.ancestors.last().map(|ancestor| ancestor.id.clone());
    let labels = item
        .metadata
        .and_then(|metadata| metadata.labels)
        .map(|labels| labels.results.into_iter().map(|label| label.name).collect())
        .unwrap_or_default();
    Page {
        id: item.id,
        space_key: space_key.to_string(),
        title: item.title.unwrap_or_default(),
        parent_id,
        labels,
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(200).collect::<String>();
    out.push_str("...");
    out
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: ListingLinks,
}

#[derive(Debug, Deserialize, Default)]
struct ListingLinks {
    next: Option<String>,
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpaceItem {
    key: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: String,
    title: Option<String>,
    #[serde(default)]
    ancestors: Vec<AncestorItem>,
    metadata: Option<MetadataItem>,
    body: Option<BodyItem>,
}

#[derive(Debug, Deserialize)]
struct AncestorItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    labels: Option<LabelListing>,
}

#[derive(Debug, Deserialize)]
struct LabelListing {
    #[serde(default)]
    results: Vec<LabelItem>,
}

#[derive(Debug, Deserialize)]
struct LabelItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BodyItem {
    storage: Option<StorageItem>,
}

#[derive(Debug, Deserialize)]
struct StorageItem {
    #[serde(default)]
    value: String,
}
