//! Scan engine (C10) — the heart of the scheduler-to-alert pipeline.
//!
//! Grounded in the teacher's `crawling`/`new_architecture` semaphore-bounded
//! page-walk pattern, generalised to spec.md §4.10: page discovery through
//! C6/C7, the filter pipeline, then C9 (delta) and C8 (deal detection) in
//! sequence, with a `ScanJob` lifecycle for batch runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::deal_detector::{detect_deals_batch, DetectionConfig};
use crate::delta_detector::DeltaDetector;
use crate::domain::{Category, DetectedDeal, DiscoveredProduct, ExclusionKind, Id, ProductExclusion, RequestOutcome};
use crate::fetch::{self, FetchOutcome, FetchPolicy, FetchRequest, Fetcher};
use crate::metrics;
use crate::parser::ParserRegistry;
use crate::proxy_pool::{FailureKind, ProxyPool};
use crate::rate_limiter::RateLimiter;
use crate::session_store::SessionStore;
use crate::store_health::StoreHealthTracker;

static STORE_BASE_URLS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("amazon_us", "https://www.amazon.com"),
        ("walmart", "https://www.walmart.com"),
        ("target", "https://www.target.com"),
        ("best_buy", "https://www.bestbuy.com"),
        ("costco", "https://www.costco.com"),
    ])
});

/// Result of scanning one category (spec.md §4.10 step 6).
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub category_id: Id,
    pub store: String,
    pub products_scanned: usize,
    pub products_after_filter: usize,
    pub changed_products: usize,
    pub deals: Vec<DetectedDeal>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ScanResult {
    fn failed(category: &Category, duration: Duration, error: String) -> Self {
        Self {
            category_id: category.id,
            store: category.store.clone(),
            products_scanned: 0,
            products_after_filter: 0,
            changed_products: 0,
            deals: Vec::new(),
            duration,
            error: Some(error),
        }
    }

    /// Whether the failure should flip `Category.enabled = false` when
    /// `disable_on_404` is set (spec.md §4.10 step "404-class errors").
    #[must_use]
    pub fn is_404_class(&self) -> bool {
        self.error.as_deref().is_some_and(|e| e.contains("HTTP 404"))
    }
}

/// Repository contract the scan engine updates after each category scan and
/// at batch completion; concrete storage lives in `crate::db` (C18).
#[async_trait::async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn record_scan_result(&self, result: &ScanResult) -> anyhow::Result<()>;
    async fn disable(&self, category_id: Id) -> anyhow::Result<()>;
}

fn matches_any(patterns: &[Regex], haystack: &str) -> bool {
    patterns.iter().any(|r| r.is_match(haystack))
}

/// `category.keyword_include`/`keyword_exclude`/`brand_include`/
/// `brand_exclude` are themselves case-insensitive regexes (spec.md §4.10
/// step 3), not keyword lists — compiled once per scan.
fn compile_patterns(raw: Option<&str>) -> Vec<Regex> {
    let Some(raw) = raw else { return Vec::new() };
    if raw.trim().is_empty() {
        return Vec::new();
    }
    Regex::new(&format!("(?i){raw}")).into_iter().collect()
}

/// All knobs the filter pipeline (spec.md §4.10 step 3) consults, bundled so
/// `apply_filters` stays a pure function testable without a live scan.
pub struct FilterContext<'a> {
    pub category: &'a Category,
    pub exclusions: &'a [ProductExclusion],
    pub scan: &'a ScanConfig,
}

/// Apply the full filter pipeline to one page's products (spec.md §4.10
/// step 3): keyword/brand include-exclude, price bounds, explicit sku
/// exclusions, the kids-item rule, and the global minimum retail price.
#[must_use]
pub fn apply_filters(products: Vec<DiscoveredProduct>, ctx: &FilterContext<'_>) -> Vec<DiscoveredProduct> {
    let keyword_include = compile_patterns(ctx.category.keyword_include.as_deref());
    let keyword_exclude = compile_patterns(ctx.category.keyword_exclude.as_deref());
    let brand_include = compile_patterns(ctx.category.brand_include.as_deref());
    let brand_exclude = compile_patterns(ctx.category.brand_exclude.as_deref());

    let sku_exclusions: Vec<&str> = ctx
        .exclusions
        .iter()
        .filter(|e| e.kind == ExclusionKind::Sku)
        .filter(|e| e.store.as_deref().map_or(true, |s| s == ctx.category.store))
        .map(|e| e.pattern.as_str())
        .collect();
    let regex_exclusions: Vec<Regex> = ctx
        .exclusions
        .iter()
        .filter(|e| e.kind == ExclusionKind::KeywordRegex)
        .filter(|e| e.store.as_deref().map_or(true, |s| s == ctx.category.store))
        .filter_map(|e| Regex::new(&format!("(?i){}", e.pattern)).ok())
        .collect();
    let brand_row_exclusions: Vec<Regex> = ctx
        .exclusions
        .iter()
        .filter(|e| e.kind == ExclusionKind::Brand)
        .filter(|e| e.store.as_deref().map_or(true, |s| s == ctx.category.store))
        .filter_map(|e| Regex::new(&format!("(?i){}", regex::escape(&e.pattern))).ok())
        .collect();

    let kids_sku_blocklist: &[String] =
        ctx.scan.kids_exclude_skus.get(&ctx.category.store).map_or(&[], |v| v.as_slice());

    products
        .into_iter()
        .filter(|p| sku_exclusions.iter().all(|s| !s.eq_ignore_ascii_case(&p.sku)))
        .filter(|p| !matches_any(&regex_exclusions, &p.title))
        .filter(|p| !matches_any(&brand_row_exclusions, &p.title))
        .filter(|p| keyword_include.is_empty() || matches_any(&keyword_include, &p.title))
        .filter(|p| !matches_any(&keyword_exclude, &p.title))
        .filter(|p| brand_include.is_empty() || matches_any(&brand_include, &p.title))
        .filter(|p| !matches_any(&brand_exclude, &p.title))
        .filter(|p| ctx.category.min_price.map_or(true, |min| p.current_price.map_or(true, |c| c >= min)))
        .filter(|p| ctx.category.max_price.map_or(true, |max| p.current_price.map_or(true, |c| c <= max)))
        .filter(|p| !is_kids_excluded(p, ctx.scan, kids_sku_blocklist))
        .filter(|p| passes_min_retail_price(p, ctx.scan.global_min_price))
        .collect()
}

fn is_kids_excluded(product: &DiscoveredProduct, scan: &ScanConfig, sku_blocklist: &[String]) -> bool {
    if sku_blocklist.iter().any(|s| s.eq_ignore_ascii_case(&product.sku)) {
        return true;
    }
    let low_price = product.current_price.is_some_and(|p| p <= scan.kids_low_price_max);
    if !low_price {
        return false;
    }
    let lowered = product.title.to_lowercase();
    scan.kids_exclude_keywords.iter().any(|kw| lowered.contains(&kw.to_lowercase()))
}

/// `min_retail_price` consults `original_price`/`msrp`/`current_price` in
/// that order (spec.md §4.10 step 3).
#[must_use]
pub fn passes_min_retail_price(product: &DiscoveredProduct, min_retail_price: f64) -> bool {
    let retail = product.original_price.or(product.msrp).or(product.current_price);
    retail.is_some_and(|r| r >= min_retail_price)
}

fn resolve_category_url(category: &Category) -> String {
    if let Ok(parsed) = reqwest::Url::parse(&category.url) {
        if parsed.host().is_some() {
            return category.url.clone();
        }
    }
    let base = STORE_BASE_URLS.get(category.store.as_str()).copied().unwrap_or("https://example.com");
    format!("{}/{}", base.trim_end_matches('/'), category.url.trim_start_matches('/'))
}

fn classify_error(outcome: &FetchOutcome, url: &str) -> String {
    match outcome {
        FetchOutcome::Blocked { block_type } if block_type.starts_with("http_") => {
            let code = block_type.trim_start_matches("http_");
            format!("HTTP {code} blocked at {url}")
        }
        FetchOutcome::Blocked { block_type } if block_type.starts_with("content:") => {
            format!("Blocked or bot challenge detected: {block_type}")
        }
        FetchOutcome::Blocked { block_type } => format!("Blocked: {block_type} at {url}"),
        FetchOutcome::NotFound => format!("HTTP 404 Not Found: {url}"),
        FetchOutcome::Timeout => format!("ReadTimeout while fetching {url}"),
        FetchOutcome::RetryableNetwork => format!("Network error exhausted retries for {url}"),
        FetchOutcome::RateLimited => format!("HTTP 429 rate limited, retries exhausted for {url}"),
        FetchOutcome::ParsingEmpty => format!("Parsing yielded zero product indicators for {url}"),
        FetchOutcome::PartialContentSuspect => format!("Partial content suspected for {url}"),
        FetchOutcome::OkHtml { .. } | FetchOutcome::OkJson { .. } => unreachable!("ok outcomes are not errors"),
    }
}

fn uniform(min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    min + fastrand::f64() * (max - min)
}

/// Synthesize the C2 `RequestOutcome` a terminal [`FetchOutcome`] implies;
/// `FetchOutcome` itself only carries a raw status for a few variants.
fn request_outcome_for(outcome: &FetchOutcome, duration_ms: u64) -> RequestOutcome {
    let timestamp = chrono::Utc::now();
    match outcome {
        FetchOutcome::OkHtml { .. } | FetchOutcome::OkJson { .. } => {
            RequestOutcome { timestamp, success: true, duration_ms, status_code: Some(200), blocked: false, block_type: None }
        }
        FetchOutcome::Blocked { block_type } => {
            let status_code = block_type.strip_prefix("http_").and_then(|c| c.parse::<u16>().ok());
            RequestOutcome { timestamp, success: false, duration_ms, status_code, blocked: true, block_type: Some(block_type.clone()) }
        }
        FetchOutcome::NotFound => {
            RequestOutcome { timestamp, success: false, duration_ms, status_code: Some(404), blocked: false, block_type: None }
        }
        FetchOutcome::RateLimited => {
            RequestOutcome { timestamp, success: false, duration_ms, status_code: Some(429), blocked: false, block_type: None }
        }
        FetchOutcome::Timeout | FetchOutcome::RetryableNetwork => {
            RequestOutcome { timestamp, success: false, duration_ms, status_code: None, blocked: false, block_type: None }
        }
        FetchOutcome::ParsingEmpty | FetchOutcome::PartialContentSuspect => {
            RequestOutcome { timestamp, success: true, duration_ms, status_code: Some(200), blocked: false, block_type: None }
        }
    }
}

/// Whether a terminal outcome should be reported against the proxy that
/// served it (spec.md §4.3); parsing-level outcomes are not a proxy's
/// fault, so only transport/blocking failures count here.
fn proxy_failure_kind(outcome: &FetchOutcome) -> Option<FailureKind> {
    match outcome {
        FetchOutcome::Blocked { block_type } if block_type == "http_401" || block_type == "http_403" => {
            Some(FailureKind::Http403)
        }
        FetchOutcome::Blocked { .. } | FetchOutcome::Timeout | FetchOutcome::RetryableNetwork | FetchOutcome::RateLimited => {
            Some(FailureKind::Other)
        }
        _ => None,
    }
}

/// Drives per-category scans under a global concurrency cap (spec.md §4.10).
pub struct ScanEngine {
    fetcher: Arc<dyn Fetcher>,
    parsers: Arc<ParserRegistry>,
    rate_limiter: Arc<RateLimiter>,
    delta_detector: Arc<DeltaDetector>,
    store_health: Arc<StoreHealthTracker>,
    proxy_pool: Arc<ProxyPool>,
    session_store: Arc<SessionStore>,
    category_semaphore: Arc<Semaphore>,
    scan_config: ScanConfig,
}

impl ScanEngine {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        parsers: Arc<ParserRegistry>,
        rate_limiter: Arc<RateLimiter>,
        delta_detector: Arc<DeltaDetector>,
        store_health: Arc<StoreHealthTracker>,
        proxy_pool: Arc<ProxyPool>,
        session_store: Arc<SessionStore>,
        scan_config: ScanConfig,
    ) -> Self {
        let category_semaphore = Arc::new(Semaphore::new(scan_config.max_parallel_category_scans.max(1)));
        Self {
            fetcher,
            parsers,
            rate_limiter,
            delta_detector,
            store_health,
            proxy_pool,
            session_store,
            category_semaphore,
            scan_config,
        }
    }

    fn page_limit_for(&self, store: &str) -> usize {
        if store == "amazon_us" {
            self.scan_config.amazon_max_parallel_pages.max(1)
        } else {
            self.scan_config.max_parallel_pages_per_category.max(1)
        }
    }

    /// Scan one category end to end (spec.md §4.10 steps 1-6).
    pub async fn scan(&self, category: &Category, exclusions: &[ProductExclusion]) -> ScanResult {
        let start = Instant::now();
        let _permit = self.category_semaphore.acquire().await.expect("semaphore never closed");
        metrics::set_active_scans(
            (self.scan_config.max_parallel_category_scans.max(1) - self.category_semaphore.available_permits()) as i64,
        );
        let page_semaphore = Arc::new(Semaphore::new(self.page_limit_for(&category.store)));

        let mut page_url = resolve_category_url(category);
        let mut raw_products = Vec::new();
        let mut pages_fetched = 0usize;

        loop {
            if pages_fetched >= category.max_pages.max(1) as usize {
                break;
            }
            let _page_permit = page_semaphore.acquire().await.expect("semaphore never closed");

            if pages_fetched > 0 {
                let delay = uniform(self.scan_config.min_page_delay_seconds, self.scan_config.max_page_delay_seconds);
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
            }

            let rate_limit = self.scan_config.retailer_rate_limits.get(&category.store).copied().unwrap_or_default();
            self.rate_limiter.acquire_with_interval(&category.store, rate_limit.min_s, rate_limit.max_s, rate_limit.jitter_s).await;

            let proxy = self.proxy_pool.next(&[], None);
            let proxy_url = proxy.as_ref().map(crate::domain::Proxy::url);
            let proxy_id = proxy.as_ref().map(|p| p.id);
            let session_key = fetch::session_key_for(&category.store, proxy_id, fetch::DEFAULT_USER_AGENT);
            let domain = reqwest::Url::parse(&page_url).ok().and_then(|u| u.host_str().map(str::to_string));
            let cookie_header = match &domain {
                Some(d) => self.session_store.cookie_header(&session_key, d).await,
                None => None,
            };

            let fetch_start = Instant::now();
            let req = FetchRequest {
                url: &page_url,
                store: &category.store,
                extra_headers: HeaderMap::new(),
                cookie_header,
                proxy_url,
            };
            let outcome = self.fetcher.fetch_with_policy(&req, &FetchPolicy::default()).await;
            let fetch_duration_ms = u64::try_from(fetch_start.elapsed().as_millis()).unwrap_or(u64::MAX);

            let request_outcome = request_outcome_for(&outcome, fetch_duration_ms);
            self.store_health.record(&category.store, request_outcome.clone());
            self.session_store.update_metadata(&session_key, request_outcome.success, request_outcome.status_code).await;

            if let Some(id) = proxy_id {
                match proxy_failure_kind(&outcome) {
                    Some(FailureKind::Http403) => {
                        self.proxy_pool.report_block(id);
                        if let Some(p) = &proxy {
                            metrics::record_proxy_403(&p.host);
                            metrics::set_proxy_strike_gauge(&p.host, self.proxy_pool.strikes(id));
                        }
                    }
                    Some(kind) => self.proxy_pool.report_failure(id, kind),
                    None => self.proxy_pool.report_success(id),
                }
            }
            metrics::set_store_error_rate(&category.store, self.store_health.health_summary(&category.store).error_rate);
            metrics::set_recommended_delay(
                &category.store,
                (self.store_health.recommended_delay(&category.store) * 1000.0) as u64,
            );

            let body = match outcome {
                FetchOutcome::OkHtml { body, .. } | FetchOutcome::OkJson { body, .. } => body,
                other => {
                    let message = classify_error(&other, &page_url);
                    warn!(category = %category.name, store = %category.store, %message, "scan aborted");
                    metrics::record_scan_attempt(&category.store, &category.name, false);
                    metrics::record_scan_duration(&category.store, start.elapsed().as_secs_f64());
                    return ScanResult::failed(category, start.elapsed(), message);
                }
            };

            let mut products = self.parsers.extract(&category.store, &body, &page_url);
            pages_fetched += 1;
            let next = self.parsers.get(&category.store).and_then(|p| p.next_page_url(&body, &page_url));
            raw_products.append(&mut products);

            match next {
                Some(next_url) if pages_fetched < category.max_pages.max(1) as usize => page_url = next_url,
                _ => break,
            }
        }

        let products_scanned = raw_products.len();
        metrics::record_products_discovered(&category.store, products_scanned as u64);
        let ctx = FilterContext { category, exclusions, scan: &self.scan_config };
        let filtered = apply_filters(raw_products, &ctx);
        let products_after_filter = filtered.len();

        let changed = match self.delta_detector.filter_changed(filtered, &category.store).await {
            Ok(changed) => changed,
            Err(e) => {
                metrics::record_scan_attempt(&category.store, &category.name, false);
                metrics::record_scan_duration(&category.store, start.elapsed().as_secs_f64());
                return ScanResult::failed(category, start.elapsed(), format!("delta detector error: {e}"));
            }
        };
        let changed_products = changed.len();
        metrics::record_delta_result(changed_products > 0);
        if let Err(e) = self.delta_detector.mark_seen(&changed, &category.store).await {
            warn!(error = %e, "failed to mark delta hashes as seen");
        }

        let min_discount = self.scan_config.global_min_discount_percent.max(category.min_discount_percent.unwrap_or(0.0));
        let config = DetectionConfig::for_category(&category.name, Some(category.store.as_str()));
        let deals = detect_deals_batch(&changed, &config, 0.0)
            .into_iter()
            .filter(|d| d.discount_percent >= min_discount)
            .collect::<Vec<_>>();

        info!(
            category = %category.name,
            store = %category.store,
            products_scanned,
            products_after_filter,
            changed_products,
            deals_found = deals.len(),
            "category scan complete"
        );

        metrics::record_scan_attempt(&category.store, &category.name, true);
        metrics::record_scan_duration(&category.store, start.elapsed().as_secs_f64());

        ScanResult {
            category_id: category.id,
            store: category.store.clone(),
            products_scanned,
            products_after_filter,
            changed_products,
            deals,
            duration: start.elapsed(),
            error: None,
        }
    }

    /// Scan many categories concurrently (bounded by the engine's own
    /// semaphore), invoking `on_result` as each finishes and disabling
    /// categories that hit a 404-class error when configured to do so
    /// (spec.md §4.10 "Batch scan").
    pub async fn scan_many<F>(
        &self,
        categories: Vec<Category>,
        exclusions_by_store: &HashMap<String, Vec<ProductExclusion>>,
        repo: Arc<dyn CategoryRepository>,
        mut on_result: F,
    ) -> Vec<ScanResult>
    where
        F: FnMut(&ScanResult),
    {
        let empty = Vec::new();
        let scan_futures = categories.iter().map(|category| {
            let exclusions = exclusions_by_store.get(&category.store).unwrap_or(&empty);
            self.scan(category, exclusions)
        });

        let mut results = futures::future::join_all(scan_futures).await;
        for result in &mut results {
            if let Err(e) = repo.record_scan_result(result).await {
                warn!(error = %e, category_id = %result.category_id, "failed to persist scan result");
            }
            if result.is_404_class() && self.scan_config.disable_on_404 {
                if let Err(e) = repo.disable(result.category_id).await {
                    warn!(error = %e, category_id = %result.category_id, "failed to disable category after 404");
                }
            }
            on_result(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Id;

    fn category() -> Category {
        Category {
            id: Id::new(),
            store: "walmart".into(),
            name: "electronics".into(),
            url: "https://www.walmart.com/browse/electronics".into(),
            enabled: true,
            priority: 5,
            base_scan_interval_minutes: 30,
            max_pages: 3,
            keyword_include: None,
            keyword_exclude: Some("refurbished".into()),
            brand_include: None,
            brand_exclude: None,
            min_price: Some(10.0),
            max_price: None,
            min_discount_percent: None,
            last_scanned_at: None,
            last_error: None,
            last_error_at: None,
            products_found: 0,
            deals_found: 0,
        }
    }

    fn product(sku: &str, title: &str, current: f64, original: Option<f64>) -> DiscoveredProduct {
        DiscoveredProduct {
            sku: sku.into(),
            title: title.into(),
            url: "https://www.walmart.com/ip/1".into(),
            current_price: Some(current),
            original_price: original,
            msrp: None,
            store: "walmart".into(),
            image_url: None,
            category_id: None,
        }
    }

    #[test]
    fn keyword_exclude_drops_matching_titles() {
        let cat = category();
        let scan = ScanConfig::default();
        let ctx = FilterContext { category: &cat, exclusions: &[], scan: &scan };
        let products = vec![
            product("A1", "Refurbished Laptop", 200.0, Some(400.0)),
            product("A2", "New Laptop", 200.0, Some(400.0)),
        ];
        let filtered = apply_filters(products, &ctx);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sku, "A2");
    }

    #[test]
    fn min_price_filters_out_cheap_products() {
        let cat = category();
        let scan = ScanConfig::default();
        let ctx = FilterContext { category: &cat, exclusions: &[], scan: &scan };
        let products = vec![product("B1", "Cheap Thing", 5.0, Some(8.0))];
        assert!(apply_filters(products, &ctx).is_empty());
    }

    #[test]
    fn sku_exclusion_rows_are_respected() {
        let cat = category();
        let scan = ScanConfig::default();
        let exclusions = vec![ProductExclusion {
            id: Id::new(),
            store: None,
            kind: ExclusionKind::Sku,
            pattern: "A1".into(),
            created_at: chrono::Utc::now(),
        }];
        let ctx = FilterContext { category: &cat, exclusions: &exclusions, scan: &scan };
        let products = vec![
            product("A1", "Some Product", 200.0, Some(400.0)),
            product("A2", "Some Other Product", 200.0, Some(400.0)),
        ];
        let filtered = apply_filters(products, &ctx);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sku, "A2");
    }

    #[test]
    fn kids_rule_excludes_low_price_keyword_matches() {
        let mut scan = ScanConfig::default();
        scan.kids_low_price_max = 30.0;
        scan.kids_exclude_keywords = vec!["toddler".into()];
        let mut cat = category();
        cat.min_price = None;
        let ctx = FilterContext { category: &cat, exclusions: &[], scan: &scan };
        let products = vec![
            product("K1", "Toddler Shoes", 15.0, Some(25.0)),
            product("K2", "Toddler Bike", 80.0, Some(120.0)),
        ];
        let filtered = apply_filters(products, &ctx);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sku, "K2");
    }

    #[test]
    fn min_retail_price_checks_original_then_msrp_then_current() {
        let mut p = product("R1", "thing", 40.0, None);
        assert!(!passes_min_retail_price(&p, 50.0));
        p.msrp = Some(60.0);
        assert!(passes_min_retail_price(&p, 50.0));
    }

    #[test]
    fn resolve_category_url_keeps_absolute_urls() {
        let cat = category();
        assert_eq!(resolve_category_url(&cat), cat.url);
    }

    #[test]
    fn resolve_category_url_joins_relative_against_store_base() {
        let mut cat = category();
        cat.url = "/browse/deals".into();
        assert_eq!(resolve_category_url(&cat), "https://www.walmart.com/browse/deals");
    }
}
