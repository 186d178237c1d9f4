//! Upstream data acquisition for seatwatch: the multi-strategy fetch chain
//! that pries a JSON payload out of an unreliable seat API, the tolerant
//! payload normalizer, and the hardcoded fallback dataset.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::header::{self, HeaderMap, HeaderValue};
use seatwatch_core::AreaObservation;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "seatwatch-upstream";

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Endpoints and transport limits for the live strategies.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// The seat-availability endpoint itself.
    pub api_url: String,
    /// Site root, visited to pick up session cookies.
    pub site_root: String,
    /// The human-facing areas page, used as a Referer.
    pub areas_page: String,
    /// Per-request timeout. An unbounded hang would stall the whole
    /// per-minute cycle, so this is never optional.
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: "https://seat.tpml.edu.tw/sm/service/getAllArea".to_string(),
            site_root: "https://seat.tpml.edu.tw/".to_string(),
            areas_page: "https://seat.tpml.edu.tw/Home/Areas".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Shared syntactic gate: trimmed payload must open and close as a JSON
/// object or array. Cheap enough to run on every strategy result.
pub fn looks_like_json(payload: &str) -> bool {
    let trimmed = payload.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

/// One way of asking the upstream for data. Implementations catch every
/// network or decoding failure internally and answer `None`; the chain is
/// the only caller and must always be able to move on to the next strategy.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self) -> Option<String>;
}

/// Ordered fallback sequence over [`FetchStrategy`] objects.
///
/// Each strategy runs at most once per `fetch` call; the first payload that
/// passes [`looks_like_json`] wins and everything after it is skipped.
pub struct FetchStrategyChain {
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl FetchStrategyChain {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// The production chain: direct API call, alternate transport, website
    /// navigation profile, then full session simulation.
    pub fn live(config: UpstreamConfig) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(DirectApiStrategy::new(config.clone())?),
            Box::new(AltTransportStrategy::new(config.clone())?),
            Box::new(SiteNavigationStrategy::new(config.clone())?),
            Box::new(SessionSimulationStrategy::new(config)?),
        ]))
    }

    pub async fn fetch(&self) -> Option<String> {
        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), "trying fetch strategy");
            match strategy.attempt().await {
                Some(payload) if looks_like_json(&payload) => {
                    info!(strategy = strategy.name(), bytes = payload.len(), "fetch succeeded");
                    return Some(payload);
                }
                Some(_) => {
                    warn!(strategy = strategy.name(), "strategy returned non-JSON content");
                }
                None => {
                    debug!(strategy = strategy.name(), "strategy returned no result");
                }
            }
        }
        warn!("all fetch strategies exhausted");
        None
    }
}

fn api_client_headers(config: &UpstreamConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_UA));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    if let Ok(referer) = HeaderValue::from_str(&config.site_root) {
        headers.insert(header::REFERER, referer);
    }
    if let Ok(origin) = HeaderValue::from_str(config.site_root.trim_end_matches('/')) {
        headers.insert(header::ORIGIN, origin);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn navigation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_UA));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static("\"Google Chrome\";v=\"93\", \" Not;A Brand\";v=\"99\", \"Chromium\";v=\"93\""),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("none"));
    headers.insert("Sec-Fetch-User", HeaderValue::from_static("?1"));
    headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));
    headers
}

fn session_api_headers(config: &UpstreamConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_UA));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    if let Ok(referer) = HeaderValue::from_str(&config.areas_page) {
        headers.insert(header::REFERER, referer);
    }
    if let Ok(origin) = HeaderValue::from_str(config.site_root.trim_end_matches('/')) {
        headers.insert(header::ORIGIN, origin);
    }
    headers
}

async fn body_of(response: reqwest::Response) -> Option<String> {
    match response.text().await {
        Ok(body) => Some(body),
        Err(err) => {
            debug!(error = %err, "failed to read response body");
            None
        }
    }
}

/// Strategy 1: the standard API call. A warm-up request to the site root
/// runs first so any session cookie lands in the client's cookie-less jar
/// of connection state; its outcome is deliberately ignored.
struct DirectApiStrategy {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl DirectApiStrategy {
    fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building direct API client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FetchStrategy for DirectApiStrategy {
    fn name(&self) -> &'static str {
        "direct-api"
    }

    async fn attempt(&self) -> Option<String> {
        if let Err(err) = self.client.get(&self.config.site_root).send().await {
            debug!(error = %err, "warm-up request to site root failed");
        }
        match self
            .client
            .get(&self.config.api_url)
            .headers(api_client_headers(&self.config))
            .send()
            .await
        {
            Ok(response) => body_of(response).await,
            Err(err) => {
                warn!(error = %err, "direct API request failed");
                None
            }
        }
    }
}

/// Strategy 2: same endpoint through a client built with divergent transport
/// defaults (capped redirects, no connection reuse, HTTP/1 only), for the
/// case where the primary client's defaults are what the upstream rejects.
struct AltTransportStrategy {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl AltTransportStrategy {
    fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(2))
            .pool_max_idle_per_host(0)
            .http1_only()
            .build()
            .context("building alternate transport client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FetchStrategy for AltTransportStrategy {
    fn name(&self) -> &'static str {
        "alt-transport"
    }

    async fn attempt(&self) -> Option<String> {
        match self
            .client
            .get(&self.config.api_url)
            .headers(api_client_headers(&self.config))
            .send()
            .await
        {
            Ok(response) => body_of(response).await,
            Err(err) => {
                warn!(error = %err, "alternate transport request failed");
                None
            }
        }
    }
}

/// Strategy 3: the API endpoint asked for as if a browser navigated to it
/// directly (document Accept plus Sec-Fetch hints).
struct SiteNavigationStrategy {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl SiteNavigationStrategy {
    fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building site navigation client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FetchStrategy for SiteNavigationStrategy {
    fn name(&self) -> &'static str {
        "site-navigation"
    }

    async fn attempt(&self) -> Option<String> {
        match self
            .client
            .get(&self.config.api_url)
            .headers(navigation_headers())
            .send()
            .await
        {
            Ok(response) => body_of(response).await,
            Err(err) => {
                warn!(error = %err, "site navigation request failed");
                None
            }
        }
    }
}

/// Strategy 4: full session simulation. Visit the site root with a browser
/// profile, harvest every `Set-Cookie`, replay them on the API call.
struct SessionSimulationStrategy {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl SessionSimulationStrategy {
    fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .context("building session simulation client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl FetchStrategy for SessionSimulationStrategy {
    fn name(&self) -> &'static str {
        "session-simulation"
    }

    async fn attempt(&self) -> Option<String> {
        let home = match self
            .client
            .get(&self.config.site_root)
            .headers(navigation_headers())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "session simulation could not reach site root");
                return None;
            }
        };
        debug!(status = %home.status(), "site root visited for cookies");

        let cookies: Vec<HeaderValue> = home
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|raw| {
                // Replay only the name=value pair, not the attributes.
                let raw = raw.to_str().ok()?;
                let pair = raw.split(';').next()?.trim();
                HeaderValue::from_str(pair).ok()
            })
            .collect();

        let mut request = self
            .client
            .get(&self.config.api_url)
            .headers(session_api_headers(&self.config));
        for cookie in cookies {
            request = request.header(header::COOKIE, cookie);
        }

        match request.send().await {
            Ok(response) => body_of(response).await,
            Err(err) => {
                warn!(error = %err, "session simulation API request failed");
                None
            }
        }
    }
}

/// Fixed sample dataset substituted when every strategy fails, so a cycle
/// always yields a batch. Field names mirror the live API's snake_case form.
pub const FALLBACK_PAYLOAD: &str = r#"[
  {"id": 1986, "area_id": "1986", "area_name": "兒童閱覽區", "branch_name": "總館", "floor_name": "3F", "free_count": 5, "total_count": 20},
  {"id": 1987, "area_id": "1987", "area_name": "青少年閱覽區", "branch_name": "總館", "floor_name": "4F", "free_count": 10, "total_count": 30},
  {"id": 1988, "area_id": "1988", "area_name": "自修室", "branch_name": "總館", "floor_name": "5F", "free_count": 15, "total_count": 50},
  {"id": 1989, "area_id": "1989", "area_name": "期刊閱覽區", "branch_name": "總館", "floor_name": "6F", "free_count": 8, "total_count": 25},
  {"id": 1990, "area_id": "1990", "area_name": "電腦區", "branch_name": "總館", "floor_name": "7F", "free_count": 3, "total_count": 15},
  {"id": 1991, "area_id": "1991", "area_name": "討論室", "branch_name": "文山分館", "floor_name": "2F", "free_count": 2, "total_count": 4}
]"#;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
}

// Candidate key lists per logical field, snake_case checked first. The
// upstream has shipped both spellings at different times.
const AREA_ID_KEYS: [&str; 2] = ["area_id", "areaId"];
const AREA_NAME_KEYS: [&str; 2] = ["area_name", "areaName"];
const BRANCH_NAME_KEYS: [&str; 2] = ["branch_name", "branchName"];
const FLOOR_NAME_KEYS: [&str; 2] = ["floor_name", "floorName"];
const FREE_COUNT_KEYS: [&str; 2] = ["free_count", "freeCount"];
const TOTAL_COUNT_KEYS: [&str; 2] = ["total_count", "totalCount"];

fn string_field(element: &JsonValue, keys: &[&str]) -> String {
    for key in keys {
        match element.get(key) {
            Some(JsonValue::String(s)) => return s.clone(),
            Some(JsonValue::Number(n)) => return n.to_string(),
            Some(_) | None => continue,
        }
    }
    String::new()
}

fn count_field(element: &JsonValue, keys: &[&str]) -> u32 {
    for key in keys {
        let Some(value) = element.get(key) else {
            continue;
        };
        if let Some(n) = value.as_u64() {
            return u32::try_from(n).unwrap_or(u32::MAX);
        }
        if value.as_i64().is_some() {
            // Negative counts are upstream noise; treat as empty.
            return 0;
        }
        if let Some(s) = value.as_str() {
            if let Ok(n) = s.trim().parse::<i64>() {
                return u32::try_from(n).unwrap_or(0);
            }
        }
    }
    0
}

fn elements(root: &JsonValue) -> Vec<&JsonValue> {
    match root {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => map.values().collect(),
        _ => Vec::new(),
    }
}

/// Converts a syntactically valid upstream payload into canonical records,
/// all stamped with the single `observed_at` supplied by the caller.
///
/// Missing strings default to empty, missing counts to zero, and a missing
/// identifier is synthesized from the batch timestamp and element position.
/// Synthesized identifiers are unique within the batch but *not* stable
/// across batches, so such areas fragment their own history; that risk is
/// surfaced in the log rather than papered over.
pub fn normalize(payload: &str, observed_at: NaiveDateTime) -> Result<Vec<AreaObservation>, NormalizeError> {
    let root: JsonValue = serde_json::from_str(payload)?;
    let batch_millis = observed_at.and_utc().timestamp_millis();

    let mut records = Vec::new();
    for (index, element) in elements(&root).into_iter().enumerate() {
        if !element.is_object() {
            warn!(index, "skipping non-object payload element");
            continue;
        }
        let mut area_id = string_field(element, &AREA_ID_KEYS);
        if area_id.is_empty() {
            area_id = format!("{batch_millis}-{index}");
            warn!(
                area_id,
                "upstream element has no identifier; synthesized one (history for this area will not be stable across cycles)"
            );
        }
        records.push(AreaObservation {
            area_id,
            branch_name: string_field(element, &BRANCH_NAME_KEYS),
            floor_name: string_field(element, &FLOOR_NAME_KEYS),
            area_name: string_field(element, &AREA_NAME_KEYS),
            free_count: count_field(element, &FREE_COUNT_KEYS),
            total_count: count_field(element, &TOTAL_COUNT_KEYS),
            observed_at,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn json_gate_accepts_objects_and_arrays_only() {
        assert!(looks_like_json("  {\"a\": 1} "));
        assert!(looks_like_json("[1, 2]"));
        assert!(!looks_like_json("<html>not json</html>"));
        assert!(!looks_like_json("{\"unbalanced\": ]"));
        assert!(!looks_like_json(""));
    }

    #[test]
    fn snake_and_camel_payloads_normalize_identically() {
        let at = ts("2026-03-02 10:00:00");
        let snake = r#"[{"area_id":"1986","area_name":"Kids","branch_name":"Main","floor_name":"3F","free_count":5,"total_count":20}]"#;
        let camel = r#"[{"areaId":"1986","areaName":"Kids","branchName":"Main","floorName":"3F","freeCount":5,"totalCount":20}]"#;
        assert_eq!(normalize(snake, at).unwrap(), normalize(camel, at).unwrap());
    }

    #[test]
    fn missing_fields_default_instead_of_failing() {
        let at = ts("2026-03-02 10:00:00");
        let records = normalize(r#"[{"area_id":"77"}]"#, at).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].area_id, "77");
        assert_eq!(records[0].branch_name, "");
        assert_eq!(records[0].free_count, 0);
        assert_eq!(records[0].total_count, 0);
        assert_eq!(records[0].occupation_rate(), 0.0);
    }

    #[test]
    fn missing_identifiers_are_synthesized_uniquely_within_batch() {
        let at = ts("2026-03-02 10:00:00");
        let records = normalize(r#"[{"free_count":1,"total_count":2},{"free_count":3,"total_count":4}]"#, at).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].area_id.is_empty());
        assert_ne!(records[0].area_id, records[1].area_id);
    }

    #[test]
    fn negative_and_textual_counts_are_tolerated() {
        let at = ts("2026-03-02 10:00:00");
        let records = normalize(
            r#"[{"area_id":"1","free_count":-3,"total_count":"12"}]"#,
            at,
        )
        .unwrap();
        assert_eq!(records[0].free_count, 0);
        assert_eq!(records[0].total_count, 12);
    }

    #[test]
    fn batch_shares_the_supplied_timestamp() {
        let at = ts("2026-03-02 20:59:00");
        let records = normalize(FALLBACK_PAYLOAD, at).unwrap();
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| r.observed_at == at));
    }

    #[test]
    fn fallback_payload_is_syntactically_valid() {
        assert!(looks_like_json(FALLBACK_PAYLOAD));
        let at = ts("2026-03-02 10:00:00");
        let records = normalize(FALLBACK_PAYLOAD, at).unwrap();
        assert_eq!(records[0].area_id, "1986");
        assert_eq!(records[0].occupation_rate(), 75.0);
    }

    struct FakeStrategy {
        name: &'static str,
        payload: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FetchStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn attempt(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payload.map(str::to_string)
        }
    }

    #[tokio::test]
    async fn chain_stops_at_first_syntactically_valid_result() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = FetchStrategyChain::new(vec![
            Box::new(FakeStrategy {
                name: "html-only",
                payload: Some("<html>not json</html>"),
                calls: first.clone(),
            }),
            Box::new(FakeStrategy {
                name: "good",
                payload: Some(r#"[{"area_id":"1"}]"#),
                calls: second.clone(),
            }),
            Box::new(FakeStrategy {
                name: "never-reached",
                payload: Some("[]"),
                calls: third.clone(),
            }),
        ]);

        let payload = chain.fetch().await.unwrap();
        assert_eq!(payload, r#"[{"area_id":"1"}]"#);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_no_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FetchStrategyChain::new(vec![
            Box::new(FakeStrategy {
                name: "a",
                payload: None,
                calls: calls.clone(),
            }),
            Box::new(FakeStrategy {
                name: "b",
                payload: Some("oops"),
                calls: calls.clone(),
            }),
        ]);
        assert!(chain.fetch().await.is_none());
        // Each strategy ran exactly once; the chain never retries a strategy.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
