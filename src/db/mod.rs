//! Relational persistence (C18 relational half).
//!
//! Grounded in `infrastructure/database_connection.rs`'s pool-management
//! shape, modernised to use `sqlx::migrate!()` instead of hand-read SQL
//! files. Repositories for Category, Proxy, ScanJob, and ProductExclusion
//! (spec.md §6 "Persistence").

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::domain::{Category, Id, Proxy, ProxyType, ScanJob, ScanJobKind, ScanJobStatus, ProductExclusion};
use crate::scan_engine::{CategoryRepository, ScanResult};

/// Owns the sqlite connection pool and applies migrations on startup.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `database_url`, creating the sqlite file and its parent
    /// directory if they don't exist yet (mirrors `DatabaseConnection::new`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let path = database_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create database directory {parent:?}"))?;
            }
        }
        if !Path::new(path).exists() {
            std::fs::File::create(path).with_context(|| format!("failed to create database file {path:?}"))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to connect to {database_url}"))?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON").execute(&self.pool).await?;
        sqlx::migrate!("./migrations").run(&self.pool).await.context("failed to run migrations")?;
        Ok(())
    }
}

/// Category persistence (spec.md §3 "Category", §6 "Persistence").
pub struct CategoryStore {
    pool: SqlitePool,
}

impl CategoryStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }

    /// All enabled categories, for the scheduler's tick (spec.md §4.11 step 1).
    pub async fn list_enabled(&self) -> Result<Vec<Category>> {
        sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await
            .context("failed to list enabled categories")
    }

    pub async fn get(&self, id: Id) -> Result<Option<Category>> {
        sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch category")
    }

    pub async fn insert(&self, category: &Category) -> Result<()> {
        sqlx::query(
            "INSERT INTO categories (id, store, name, url, enabled, priority, base_scan_interval_minutes, max_pages, \
             keyword_include, keyword_exclude, brand_include, brand_exclude, min_price, max_price, \
             min_discount_percent, last_scanned_at, last_error, last_error_at, products_found, deals_found) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(category.id)
        .bind(&category.store)
        .bind(&category.name)
        .bind(&category.url)
        .bind(category.enabled)
        .bind(category.priority)
        .bind(category.base_scan_interval_minutes)
        .bind(category.max_pages)
        .bind(&category.keyword_include)
        .bind(&category.keyword_exclude)
        .bind(&category.brand_include)
        .bind(&category.brand_exclude)
        .bind(category.min_price)
        .bind(category.max_price)
        .bind(category.min_discount_percent)
        .bind(category.last_scanned_at)
        .bind(&category.last_error)
        .bind(category.last_error_at)
        .bind(category.products_found)
        .bind(category.deals_found)
        .execute(&self.pool)
        .await
        .context("failed to insert category")?;
        Ok(())
    }

    /// Batch-apply `{last_scanned_at, products_found, deals_found, last_error,
    /// last_error_at}` updates in groups (spec.md §4.10 "Batch scan").
    pub async fn apply_scan_updates(&self, updates: &[ScanResult], batch_size: usize) -> Result<()> {
        for chunk in updates.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await.context("failed to start batch update transaction")?;
            for result in chunk {
                sqlx::query(
                    "UPDATE categories SET last_scanned_at = ?, products_found = products_found + ?, \
                     deals_found = deals_found + ?, last_error = ?, last_error_at = ? WHERE id = ?",
                )
                .bind(Utc::now())
                .bind(result.products_after_filter as i64)
                .bind(result.deals.len() as i64)
                .bind(&result.error)
                .bind(result.error.as_ref().map(|_| Utc::now()))
                .bind(result.category_id)
                .execute(&mut *tx)
                .await
                .context("failed to apply one batched category update")?;
            }
            tx.commit().await.context("failed to commit batched category updates")?;
        }
        Ok(())
    }

    pub async fn disable(&self, id: Id) -> Result<()> {
        sqlx::query("UPDATE categories SET enabled = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to disable category")?;
        Ok(())
    }
}

/// Adapts [`CategoryStore`] to the scan engine's storage-agnostic
/// [`CategoryRepository`] contract, batching every call (batch size of one
/// is the degenerate per-result case `scan_engine` drives it with).
pub struct CategoryRepositoryImpl {
    store: CategoryStore,
    batch_size: usize,
}

impl CategoryRepositoryImpl {
    #[must_use]
    pub fn new(store: CategoryStore, batch_size: usize) -> Self {
        Self { store, batch_size }
    }
}

#[async_trait::async_trait]
impl CategoryRepository for CategoryRepositoryImpl {
    async fn record_scan_result(&self, result: &ScanResult) -> anyhow::Result<()> {
        self.store.apply_scan_updates(std::slice::from_ref(result), self.batch_size).await
    }

    async fn disable(&self, category_id: Id) -> anyhow::Result<()> {
        self.store.disable(category_id).await
    }
}

/// Proxy persistence (spec.md §3 "Proxy").
pub struct ProxyStore {
    pool: SqlitePool,
}

impl ProxyStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }

    pub async fn list(&self) -> Result<Vec<Proxy>> {
        sqlx::query_as::<_, Proxy>("SELECT * FROM proxies").fetch_all(&self.pool).await.context("failed to list proxies")
    }

    pub async fn insert(&self, proxy: &Proxy) -> Result<()> {
        sqlx::query(
            "INSERT INTO proxies (id, host, port, username, password, proxy_type, enabled, success_count, \
             failure_count, last_used_at, last_success_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(proxy.id)
        .bind(&proxy.host)
        .bind(i64::from(proxy.port))
        .bind(&proxy.username)
        .bind(&proxy.password)
        .bind(proxy.proxy_type)
        .bind(proxy.enabled)
        .bind(proxy.success_count)
        .bind(proxy.failure_count)
        .bind(proxy.last_used_at)
        .bind(proxy.last_success_at)
        .execute(&self.pool)
        .await
        .context("failed to insert proxy")?;
        Ok(())
    }

    /// Persist success/failure counters after a scan (spec.md §4.3 in-memory
    /// state is mirrored back here periodically; `enabled` is never flipped
    /// from here — only an operator action touches it).
    pub async fn record_counters(&self, id: Id, success_count: i64, failure_count: i64) -> Result<()> {
        sqlx::query("UPDATE proxies SET success_count = ?, failure_count = ? WHERE id = ?")
            .bind(success_count)
            .bind(failure_count)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to persist proxy counters")?;
        Ok(())
    }
}

/// ScanJob persistence (spec.md §3 "ScanJob", §4.10 "Batch scan" lifecycle).
pub struct ScanJobStore {
    pool: SqlitePool,
}

impl ScanJobStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }

    pub async fn create(&self, kind: ScanJobKind, total_categories: i64) -> Result<ScanJob> {
        let job = ScanJob::new(kind, total_categories);
        sqlx::query(
            "INSERT INTO scan_jobs (id, kind, status, total_categories, completed_categories, total_products, \
             total_deals, errors) VALUES (?, ?, ?, ?, 0, 0, 0, 0)",
        )
        .bind(job.id)
        .bind(job.kind)
        .bind(job.status)
        .bind(job.total_categories)
        .execute(&self.pool)
        .await
        .context("failed to create scan job")?;
        Ok(job)
    }

    pub async fn mark_running(&self, id: Id) -> Result<()> {
        sqlx::query("UPDATE scan_jobs SET status = ?, started_at = ? WHERE id = ?")
            .bind(ScanJobStatus::Running)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to mark scan job running")?;
        Ok(())
    }

    pub async fn complete(&self, id: Id, results: &[ScanResult]) -> Result<()> {
        let total_products: i64 = results.iter().map(|r| r.products_after_filter as i64).sum();
        let total_deals: i64 = results.iter().map(|r| r.deals.len() as i64).sum();
        let errors = results.iter().filter(|r| r.error.is_some()).count() as i64;

        sqlx::query(
            "UPDATE scan_jobs SET status = ?, completed_at = ?, completed_categories = ?, total_products = ?, \
             total_deals = ?, errors = ? WHERE id = ?",
        )
        .bind(ScanJobStatus::Completed)
        .bind(Utc::now())
        .bind(results.len() as i64)
        .bind(total_products)
        .bind(total_deals)
        .bind(errors)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to complete scan job")?;
        Ok(())
    }
}

/// Operator-managed exclusion rules (spec.md §6 "Persistence").
pub struct ProductExclusionStore {
    pool: SqlitePool,
}

impl ProductExclusionStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }

    /// All rules applicable to `store` (the store's own rows plus the
    /// wildcard `store IS NULL` rows).
    pub async fn list_for_store(&self, store: &str) -> Result<Vec<ProductExclusion>> {
        sqlx::query_as::<_, ProductExclusion>("SELECT * FROM product_exclusions WHERE store = ? OR store IS NULL")
            .bind(store)
            .fetch_all(&self.pool)
            .await
            .context("failed to list product exclusions")
    }

    pub async fn insert(&self, exclusion: &ProductExclusion) -> Result<()> {
        sqlx::query("INSERT INTO product_exclusions (id, store, kind, pattern, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(exclusion.id)
            .bind(&exclusion.store)
            .bind(exclusion.kind)
            .bind(&exclusion.pattern)
            .bind(exclusion.created_at)
            .execute(&self.pool)
            .await
            .context("failed to insert product exclusion")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExclusionKind, ProxyType};
    use tempfile::tempdir;

    async fn test_db() -> Database {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        // Leak the tempdir so the file isn't removed before the pool closes;
        // acceptable in tests, mirroring the teacher's own test style.
        std::mem::forget(dir);
        let db = Database::connect(&format!("sqlite:{}", path.display())).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn category_round_trips_through_sqlite() {
        let db = test_db().await;
        let store = CategoryStore::new(&db);

        let category = Category {
            id: Id::new(),
            store: "walmart".into(),
            name: "electronics".into(),
            url: "https://example.com/electronics".into(),
            enabled: true,
            priority: 7,
            base_scan_interval_minutes: 30,
            max_pages: 3,
            keyword_include: None,
            keyword_exclude: None,
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
        };
        store.insert(&category).await.unwrap();

        let loaded = store.list_enabled().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].store, "walmart");
    }

    #[tokio::test]
    async fn disabling_a_category_removes_it_from_enabled_list() {
        let db = test_db().await;
        let store = CategoryStore::new(&db);

        let category = Category {
            id: Id::new(),
            store: "target".into(),
            name: "toys".into(),
            url: "https://example.com/toys".into(),
            enabled: true,
            priority: 5,
            base_scan_interval_minutes: 30,
            max_pages: 2,
            keyword_include: None,
            keyword_exclude: None,
            brand_include: None,
            brand_exclude: None,
            min_price: None,
            max_price: None,
            min_discount_percent: None,
            last_scanned_at: None,
            last_error: None,
            last_error_at: None,
            products_found: 0,
            deals_found: 0,
        };
        store.insert(&category).await.unwrap();
        store.disable(category.id).await.unwrap();

        assert!(store.list_enabled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_round_trips_through_sqlite() {
        let db = test_db().await;
        let store = ProxyStore::new(&db);

        let proxy = Proxy {
            id: Id::new(),
            host: "10.0.0.1".into(),
            port: 8080,
            username: None,
            password: None,
            proxy_type: ProxyType::Residential,
            enabled: true,
            success_count: 0,
            failure_count: 0,
            consecutive_403s: 0,
            last_used_at: None,
            last_success_at: None,
            cooldown_until: None,
        };
        store.insert(&proxy).await.unwrap();

        let loaded = store.list().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].proxy_type, ProxyType::Residential);
    }

    #[tokio::test]
    async fn product_exclusion_wildcard_applies_to_every_store() {
        let db = test_db().await;
        let store = ProductExclusionStore::new(&db);

        let rule = ProductExclusion {
            id: Id::new(),
            store: None,
            kind: ExclusionKind::Brand,
            pattern: "GenericBrand".into(),
            created_at: Utc::now(),
        };
        store.insert(&rule).await.unwrap();

        let applicable = store.list_for_store("walmart").await.unwrap();
        assert_eq!(applicable.len(), 1);
    }
}
