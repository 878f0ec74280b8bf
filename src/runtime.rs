//! Runtime wiring (C19).
//!
//! Assembles every stateful component once at startup, grounded in the
//! teacher's `AppState`/`CrawlingContext` composition-root pattern: a
//! single struct of `Arc`-wrapped collaborators built from [`AppConfig`],
//! handed to the CLI entrypoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::info;

use crate::alert_pipeline::{Alert, AlertPipeline, AlertSink};
use crate::config::AppConfig;
use crate::cross_source_dedupe::CrossSourceDeduper;
use crate::db::{CategoryRepositoryImpl, CategoryStore, Database, ProductExclusionStore, ProxyStore, ScanJobStore};
use crate::delta_detector::DeltaDetector;
use crate::fetch::FetchPipeline;
use crate::http_cache::{HttpCache, KvStore};
use crate::kv::RedisStore;
use crate::parser::ParserRegistry;
use crate::proxy_pool::ProxyPool;
use crate::rate_limiter::RateLimiter;
use crate::scan_engine::{CategoryRepository, ScanEngine};
use crate::session_store::SessionStore;
use crate::store_health::{AdaptiveParams, StoreHealthTracker};

/// Logs alerts through `tracing` rather than delivering them anywhere;
/// the transport (webhook, email, chat bot) is an external collaborator
/// the core does not implement (spec.md §6).
struct LoggingAlertSink;

#[async_trait::async_trait]
impl AlertSink for LoggingAlertSink {
    async fn emit(&self, alert: Alert) -> anyhow::Result<()> {
        info!(
            sku = %alert.sku,
            store = %alert.store,
            price = alert.current_price,
            confidence = alert.confidence,
            reason = %alert.reason,
            "deal alert"
        );
        Ok(())
    }
}

/// Every stateful collaborator the core needs, built once at startup.
pub struct CoreRuntime {
    pub config: AppConfig,
    pub db: Database,
    pub kv: Arc<RedisStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub store_health: Arc<StoreHealthTracker>,
    pub proxy_pool: Arc<ProxyPool>,
    pub session_store: Arc<SessionStore>,
    pub http_cache: Arc<HttpCache>,
    pub fetch_pipeline: Arc<FetchPipeline>,
    pub parsers: Arc<ParserRegistry>,
    pub delta_detector: Arc<DeltaDetector>,
    pub cross_source_dedupe: Arc<CrossSourceDeduper>,
    pub alert_pipeline: Arc<AlertPipeline>,
    pub scan_engine: Arc<ScanEngine>,
    pub category_repository: Arc<dyn CategoryRepository>,
    pub category_store: CategoryStore,
    pub proxy_store: ProxyStore,
    pub scan_job_store: ScanJobStore,
    pub product_exclusion_store: ProductExclusionStore,
}

impl CoreRuntime {
    /// Connect to storage, run migrations, and wire every component
    /// together from `config` (spec.md §4.19 "Runtime wiring").
    pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        db.migrate().await?;
        let kv = Arc::new(RedisStore::connect(&config.redis_url).await?);

        let proxy_store = ProxyStore::new(&db);
        let proxies = proxy_store.list().await?;

        let rate_limiter = Arc::new(RateLimiter::new());
        let store_health = Arc::new(StoreHealthTracker::new(AdaptiveParams {
            adaptive_enabled: config.adaptive.adaptive_rate_limiting_enabled,
            base_delay_seconds: config.adaptive.adaptive_base_delay_seconds,
            max_delay_seconds: config.adaptive.adaptive_max_delay_seconds,
        }));
        let proxy_pool = Arc::new(ProxyPool::new(
            proxies,
            config.adaptive.proxy_max_consecutive_403s,
            config.adaptive.proxy_cooldown_minutes,
        ));
        let session_store = Arc::new(SessionStore::new());

        let kv_dyn: Arc<dyn KvStore> = kv.clone();
        let http_cache = Arc::new(HttpCache::new(
            kv_dyn.clone(),
            config.adaptive.http_cache_ttl_seconds,
            config.adaptive.http_cache_enabled,
        ));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.adaptive.category_request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.adaptive.connection_timeout_seconds))
            .pool_max_idle_per_host(config.adaptive.http_max_connections)
            .pool_idle_timeout(Duration::from_secs(config.adaptive.connection_keepalive_seconds))
            .cookie_store(false)
            .build()?;
        let fetch_pipeline = Arc::new(FetchPipeline::new(client, http_cache.clone()));

        let parsers = Arc::new(ParserRegistry::new());

        let delta_detector = Arc::new(DeltaDetector::new(
            kv_dyn.clone(),
            config.adaptive.delta_cache_ttl_seconds,
            config.adaptive.delta_detection_enabled,
        ));
        let cross_source_dedupe =
            Arc::new(CrossSourceDeduper::new(kv_dyn.clone(), config.adaptive.cross_source_ttl_seconds));
        let alert_pipeline = Arc::new(AlertPipeline::new(
            kv_dyn.clone(),
            cross_source_dedupe.clone(),
            config.scan.aggregator_stores.clone(),
            Arc::new(LoggingAlertSink),
            config.adaptive.dedupe_ttl_hours * 3600,
            config.adaptive.cooldown_minutes * 60,
        ));

        let scan_engine = Arc::new(ScanEngine::new(
            fetch_pipeline.clone(),
            parsers.clone(),
            rate_limiter.clone(),
            delta_detector.clone(),
            store_health.clone(),
            proxy_pool.clone(),
            session_store.clone(),
            config.scan.clone(),
        ));

        let category_store = CategoryStore::new(&db);
        let scan_job_store = ScanJobStore::new(&db);
        let product_exclusion_store = ProductExclusionStore::new(&db);
        let category_repository: Arc<dyn CategoryRepository> = Arc::new(CategoryRepositoryImpl::new(
            CategoryStore::new(&db),
            config.scan.db_batch_update_size,
        ));

        Ok(Self {
            config,
            db,
            kv,
            rate_limiter,
            store_health,
            proxy_pool,
            session_store,
            http_cache,
            fetch_pipeline,
            parsers,
            delta_detector,
            cross_source_dedupe,
            alert_pipeline,
            scan_engine,
            category_repository,
            category_store,
            proxy_store,
            scan_job_store,
            product_exclusion_store,
        })
    }
}
