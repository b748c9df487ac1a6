use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, DeleteResult, EntityTrait, QueryFilter, Set,
    sea_query::OnConflict,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    catalog::Catalog,
    db::is_missing_table,
    entities::{download_link_best, download_link_normal},
    models::{Quality, ResolvedLink},
    resolver::{LinkResolver, ResolveError},
    retry::StaleSession,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("movie {0} does not exist")]
    MovieNotFound(i32),

    #[error("upstream resolution failed: {0}")]
    Upstream(#[from] ResolveError),

    #[error(transparent)]
    Storage(#[from] DbErr),
}

impl StaleSession for CacheError {
    fn is_stale_session(&self) -> bool {
        matches!(self, CacheError::Upstream(err) if err.is_stale_session())
    }

    fn session_redirect(&self) -> Option<&str> {
        match self {
            CacheError::Upstream(err) => err.session_redirect(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedEntry {
    pub link: ResolvedLink,
    pub last_updated: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub normal: u64,
    pub best: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.normal + self.best
    }
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;
type KeyLocks = Arc<Mutex<HashMap<(i32, Quality), Arc<Mutex<()>>>>>;

/// Memo of resolved download links, one row per movie and quality tier.
#[derive(Clone)]
pub struct LinkCache {
    db: DatabaseConnection,
    catalog: Catalog,
    resolver: Arc<dyn LinkResolver>,
    ttl_seconds: i64,
    resolver_timeout: Duration,
    clock: Clock,
    inflight: KeyLocks,
}

impl LinkCache {
    pub fn new(
        db: DatabaseConnection,
        catalog: Catalog,
        resolver: Arc<dyn LinkResolver>,
        ttl_hours: i64,
        resolver_timeout: Duration,
    ) -> Self {
        Self {
            db,
            catalog,
            resolver,
            ttl_seconds: ttl_hours.saturating_mul(3_600),
            resolver_timeout,
            clock: Arc::new(now_sec),
            inflight: Arc::default(),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Returns the direct link for `movie_id` at `quality`, resolving it
    /// upstream only when no fresh entry exists.
    pub async fn resolve(&self, movie_id: i32, quality: Quality) -> Result<ResolvedLink, CacheError> {
        let key_lock = self.key_lock(movie_id, quality).await;
        let result = {
            let _guard = key_lock.lock().await;
            self.resolve_locked(movie_id, quality).await
        };
        self.release_key(movie_id, quality, key_lock).await;
        result
    }

    async fn resolve_locked(
        &self,
        movie_id: i32,
        quality: Quality,
    ) -> Result<ResolvedLink, CacheError> {
        if let Some(entry) = self.entry(movie_id, quality).await? {
            if self.is_fresh(entry.last_updated, (self.clock)()) {
                debug!(movie_id = movie_id, quality = %quality, "download link cache hit");
                return Ok(entry.link);
            }
            debug!(movie_id = movie_id, quality = %quality, last_updated = entry.last_updated, "download link stale");
        }

        let page_url =
            self.catalog.page_url(movie_id).await?.ok_or(CacheError::MovieNotFound(movie_id))?;

        let link = self.fetch_upstream(&page_url, quality).await.inspect_err(|err| {
            warn!(movie_id = movie_id, quality = %quality, error = %err, "download link resolution failed");
        })?;

        self.upsert(movie_id, quality, &link, (self.clock)()).await?;
        info!(movie_id = movie_id, quality = %quality, filename = %link.filename, "download link refreshed");

        Ok(link)
    }

    async fn fetch_upstream(&self, page_url: &str, quality: Quality) -> Result<ResolvedLink, ResolveError> {
        let variants = self.bounded(self.resolver.list_files(page_url)).await?;
        let variant = quality.pick(&variants).ok_or(ResolveError::MissingVariant {
            quality,
            available: variants.len(),
        })?;

        let link = self.bounded(self.resolver.finalize(&variant.file_url)).await?;
        if link.filename.trim().is_empty() || link.url.trim().is_empty() {
            return Err(ResolveError::EmptyLink);
        }
        Ok(link)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, ResolveError> {
        tokio::time::timeout(self.resolver_timeout, call)
            .await
            .map_err(|_| ResolveError::Timeout(self.resolver_timeout))?
    }

    pub async fn entry(&self, movie_id: i32, quality: Quality) -> Result<Option<CachedEntry>, DbErr> {
        let entry = match quality {
            Quality::Normal => download_link_normal::Entity::find_by_id(movie_id)
                .one(&self.db)
                .await?
                .map(|m| CachedEntry {
                    link: ResolvedLink { filename: m.filename, url: m.url },
                    last_updated: m.last_updated,
                }),
            Quality::Best => download_link_best::Entity::find_by_id(movie_id)
                .one(&self.db)
                .await?
                .map(|m| CachedEntry {
                    link: ResolvedLink { filename: m.filename, url: m.url },
                    last_updated: m.last_updated,
                }),
        };
        Ok(entry)
    }

    /// Single-statement insert-or-replace; filename, url and timestamp
    /// always change together.
    async fn upsert(
        &self,
        movie_id: i32,
        quality: Quality,
        link: &ResolvedLink,
        now: i64,
    ) -> Result<(), DbErr> {
        match quality {
            Quality::Normal => {
                let model = download_link_normal::ActiveModel {
                    movie_id: Set(movie_id),
                    filename: Set(link.filename.clone()),
                    url: Set(link.url.clone()),
                    last_updated: Set(now),
                };
                download_link_normal::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(download_link_normal::Column::MovieId)
                            .update_columns([
                                download_link_normal::Column::Filename,
                                download_link_normal::Column::Url,
                                download_link_normal::Column::LastUpdated,
                            ])
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await?;
            },
            Quality::Best => {
                let model = download_link_best::ActiveModel {
                    movie_id: Set(movie_id),
                    filename: Set(link.filename.clone()),
                    url: Set(link.url.clone()),
                    last_updated: Set(now),
                };
                download_link_best::Entity::insert(model)
                    .on_conflict(
                        OnConflict::column(download_link_best::Column::MovieId)
                            .update_columns([
                                download_link_best::Column::Filename,
                                download_link_best::Column::Url,
                                download_link_best::Column::LastUpdated,
                            ])
                            .to_owned(),
                    )
                    .exec_without_returning(&self.db)
                    .await?;
            },
        }
        Ok(())
    }

    /// Deletes entries older than the TTL from both tier tables. Tables that
    /// do not exist yet count as empty.
    pub async fn sweep_expired(&self) -> Result<SweepReport, DbErr> {
        let cutoff = (self.clock)().saturating_sub(self.ttl_seconds);

        let normal = deleted(
            download_link_normal::Entity::delete_many()
                .filter(download_link_normal::Column::LastUpdated.lt(cutoff))
                .exec(&self.db)
                .await,
        )?;
        let best = deleted(
            download_link_best::Entity::delete_many()
                .filter(download_link_best::Column::LastUpdated.lt(cutoff))
                .exec(&self.db)
                .await,
        )?;

        let report = SweepReport { normal, best };
        debug!(normal = report.normal, best = report.best, cutoff = cutoff, "expired download links swept");
        Ok(report)
    }

    /// Sweeps immediately, then once per `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match cache.sweep_expired().await {
                    Ok(report) if report.total() > 0 => {
                        info!(normal = report.normal, best = report.best, "expired download links removed");
                    },
                    Ok(_) => {},
                    Err(err) => warn!(error = %err, "download link sweep failed"),
                }
            }
        })
    }

    fn is_fresh(&self, last_updated: i64, now: i64) -> bool {
        now.saturating_sub(last_updated) < self.ttl_seconds
    }

    async fn key_lock(&self, movie_id: i32, quality: Quality) -> Arc<Mutex<()>> {
        self.inflight.lock().await.entry((movie_id, quality)).or_default().clone()
    }

    async fn release_key(&self, movie_id: i32, quality: Quality, key_lock: Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        drop(key_lock);
        if inflight.get(&(movie_id, quality)).is_some_and(|l| Arc::strong_count(l) == 1) {
            inflight.remove(&(movie_id, quality));
        }
    }
}

fn deleted(result: Result<DeleteResult, DbErr>) -> Result<u64, DbErr> {
    match result {
        Ok(res) => Ok(res.rows_affected),
        Err(err) if is_missing_table(&err) => Ok(0),
        Err(err) => Err(err),
    }
}

fn now_sec() -> i64 {
    jiff::Timestamp::now().as_second()
}
