//! Multi-provider Usenet article fetching.
//!
//! Owns one [`ProviderPool`] per configured provider and orders candidates
//! the way `nntp_rs::ServerGroup` orders its servers: primaries in priority
//! order, backups only once every primary has been tried. A permanent
//! "no such article" response (430/423, surfaced by `ProviderPool::fetch_body`
//! as `Ok(None)`) moves straight to the next candidate without marking the
//! provider unhealthy — the article is missing, not the server.

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pool::ProviderPool;
use crate::types::{MissingArticleEvent, UsageContext};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A fetched, still-yEnc-encoded article body plus which provider served it.
pub struct FetchedArticle {
    /// Raw article body bytes (not yet yEnc-decoded).
    pub data: Vec<u8>,
    /// Index into the client's configured provider list.
    pub provider_index: usize,
}

/// Multi-provider Usenet article client.
pub struct UsenetClient {
    providers: Vec<Arc<ProviderPool>>,
    pool_config: crate::config::PoolConfig,
}

impl UsenetClient {
    /// Build a client with one pool per configured provider.
    pub async fn new(config: &Config) -> Result<Self> {
        let mut providers = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            providers.push(Arc::new(ProviderPool::new(provider, &config.pool).await?));
        }
        Ok(Self {
            providers,
            pool_config: config.pool.clone(),
        })
    }

    /// Fetch one article by message-id, trying candidate providers in
    /// order until one serves it or all are exhausted.
    ///
    /// Returns [`Error::ArticleMissing`] once every candidate has returned
    /// a permanent "no such article" response, or [`Error::ArticleUnavailable`]
    /// if at least one candidate failed transiently and none succeeded.
    pub async fn fetch_article(
        &self,
        message_id: &str,
        ctx: UsageContext,
    ) -> Result<FetchedArticle> {
        let order = self.candidate_order();
        let mut last_transient: Option<Error> = None;
        let now = crate::pool::now_epoch_ms();

        for index in order {
            let provider = &self.providers[index];
            if provider.is_unhealthy(now) {
                continue;
            }

            let lease = match provider.acquire(ctx, self.pool_config.acquire_timeout).await {
                Ok(lease) => lease,
                Err(e) => {
                    last_transient = Some(e);
                    continue;
                }
            };

            match provider
                .fetch_body(message_id, self.pool_config.article_timeout)
                .await
            {
                Ok(Some(data)) => {
                    drop(lease);
                    provider.record_success();
                    return Ok(FetchedArticle {
                        data,
                        provider_index: index,
                    });
                }
                Ok(None) => {
                    drop(lease);
                    debug!(message_id, provider = %provider.name, "article not found on provider, trying next");
                    continue;
                }
                Err(e) => {
                    drop(lease);
                    provider.record_failure(
                        now,
                        self.pool_config.unhealthy_cooldown,
                        self.pool_config.connect_retries,
                    );
                    warn!(message_id, provider = %provider.name, error = %e, "transient fetch failure");
                    last_transient = Some(e);
                }
            }
        }

        match last_transient {
            Some(e) => Err(Error::ArticleUnavailable {
                message_id: message_id.to_string(),
                reason: e.to_string(),
            }),
            None => Err(Error::ArticleMissing {
                message_id: message_id.to_string(),
            }),
        }
    }

    /// Fetch an article the same way as [`Self::fetch_article`], additionally
    /// recording per-(job, provider) accounting and missing-article events to
    /// `db` — the bookkeeping side of a fetch that only makes sense once a
    /// caller knows which job it's fetching on behalf of (the queue manager's
    /// import pipeline, the streaming reader).
    ///
    /// Best-effort: a failure to persist an accounting row never changes the
    /// fetch outcome returned to the caller.
    pub async fn fetch_article_for_job(
        &self,
        db: &Database,
        job_name: &str,
        message_id: &str,
        ctx: UsageContext,
    ) -> Result<FetchedArticle> {
        let order = self.candidate_order_weighted(db, job_name).await;
        let mut last_transient: Option<Error> = None;
        let mut missing_providers: Vec<usize> = Vec::new();
        let now = crate::pool::now_epoch_ms();

        for index in order {
            let provider = &self.providers[index];
            if provider.is_unhealthy(now) {
                continue;
            }

            let lease = match provider.acquire(ctx, self.pool_config.acquire_timeout).await {
                Ok(lease) => lease,
                Err(e) => {
                    last_transient = Some(e);
                    continue;
                }
            };

            let started = Instant::now();
            match provider
                .fetch_body(message_id, self.pool_config.article_timeout)
                .await
            {
                Ok(Some(data)) => {
                    drop(lease);
                    provider.record_success();
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    if let Err(e) = db
                        .record_provider_fetch(job_name, index, data.len() as i64, elapsed_ms, true)
                        .await
                    {
                        warn!(job_name, error = %e, "failed to record provider fetch stat");
                    }
                    return Ok(FetchedArticle {
                        data,
                        provider_index: index,
                    });
                }
                Ok(None) => {
                    drop(lease);
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    if let Err(e) = db
                        .record_provider_fetch(job_name, index, 0, elapsed_ms, false)
                        .await
                    {
                        warn!(job_name, error = %e, "failed to record provider fetch stat");
                    }
                    missing_providers.push(index);
                    debug!(message_id, provider = %provider.name, "article not found on provider, trying next");
                    continue;
                }
                Err(e) => {
                    drop(lease);
                    provider.record_failure(
                        now,
                        self.pool_config.unhealthy_cooldown,
                        self.pool_config.connect_retries,
                    );
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    if let Err(stat_err) = db
                        .record_provider_fetch(job_name, index, 0, elapsed_ms, false)
                        .await
                    {
                        warn!(job_name, error = %stat_err, "failed to record provider fetch stat");
                    }
                    warn!(message_id, provider = %provider.name, error = %e, "transient fetch failure");
                    last_transient = Some(e);
                }
            }
        }

        for provider_index in &missing_providers {
            let event = self.missing_event(job_name, message_id, *provider_index, "fetch");
            if let Err(e) = db.record_missing_article_event(&event).await {
                warn!(job_name, error = %e, "failed to record missing article event");
            }
        }

        match last_transient {
            Some(e) => Err(Error::ArticleUnavailable {
                message_id: message_id.to_string(),
                reason: e.to_string(),
            }),
            None => Err(Error::ArticleMissing {
                message_id: message_id.to_string(),
            }),
        }
    }

    /// Build a [`MissingArticleEvent`] for a permanently-missing article.
    pub fn missing_event(
        &self,
        filename: &str,
        message_id: &str,
        provider_index: usize,
        operation: &str,
    ) -> MissingArticleEvent {
        MissingArticleEvent {
            filename: filename.to_string(),
            message_id: message_id.to_string(),
            provider_index,
            timestamp: chrono::Utc::now(),
            operation: operation.to_string(),
        }
    }

    /// Candidate provider indices in try-order: primaries first (ordered by
    /// priority, uniformly randomized within equal priority), then backups
    /// in the same fashion. Used only where no `(job, provider)` accounting
    /// is available to weight the draw; [`Self::candidate_order_weighted`]
    /// is used everywhere a job context exists.
    fn candidate_order(&self) -> Vec<usize> {
        let mut primaries: Vec<usize> = Vec::new();
        let mut backups: Vec<usize> = Vec::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.is_primary {
                primaries.push(index);
            } else {
                backups.push(index);
            }
        }
        Self::order_by_priority(&mut primaries, &self.providers, None);
        Self::order_by_priority(&mut backups, &self.providers, None);
        primaries.extend(backups);
        primaries
    }

    /// Candidate provider indices in try-order, as [`Self::candidate_order`],
    /// except the within-priority-band draw is weighted by each provider's
    /// `recent_avg_speed_bps` for this job (§4.4's "weighted random choice
    /// proportional to the recent success rate"): a provider this job has
    /// been pulling bytes from quickly is proportionally more likely to be
    /// tried first among its priority peers. Providers with no recorded
    /// stat yet (never used on this job, or never a successful fetch) get
    /// a neutral baseline weight so they still get a fair first try.
    async fn candidate_order_weighted(&self, db: &Database, job_name: &str) -> Vec<usize> {
        let mut primaries: Vec<usize> = Vec::new();
        let mut backups: Vec<usize> = Vec::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.is_primary {
                primaries.push(index);
            } else {
                backups.push(index);
            }
        }

        let weights = match db.list_provider_stats(job_name).await {
            Ok(stats) => stats
                .into_iter()
                .filter(|s| s.recent_avg_speed_bps > 0.0)
                .map(|s| (s.provider_index, s.recent_avg_speed_bps))
                .collect(),
            Err(e) => {
                warn!(job_name, error = %e, "failed to load provider stats for weighted ordering");
                std::collections::HashMap::new()
            }
        };

        Self::order_by_priority(&mut primaries, &self.providers, Some(&weights));
        Self::order_by_priority(&mut backups, &self.providers, Some(&weights));
        primaries.extend(backups);
        primaries
    }

    /// Sort `indices` by provider priority, then within each equal-priority
    /// band either uniformly shuffle (`weights = None`) or draw without
    /// replacement proportional to `weights` (falling back to a neutral
    /// weight of `1.0` for any provider absent from the map).
    fn order_by_priority(
        indices: &mut Vec<usize>,
        providers: &[Arc<ProviderPool>],
        weights: Option<&std::collections::HashMap<usize, f64>>,
    ) {
        indices.sort_by_key(|&i| providers[i].priority);
        let mut start = 0;
        while start < indices.len() {
            let priority = providers[indices[start]].priority;
            let mut end = start + 1;
            while end < indices.len() && providers[indices[end]].priority == priority {
                end += 1;
            }
            if end - start > 1 {
                let band: Vec<usize> = indices[start..end].to_vec();
                let ordered = match weights {
                    Some(weights) => Self::weighted_draw_without_replacement(band, weights),
                    None => Self::uniform_shuffle(band),
                };
                indices[start..end].copy_from_slice(&ordered);
            }
            start = end;
        }
    }

    fn uniform_shuffle(mut band: Vec<usize>) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        for i in (1..band.len()).rev() {
            let j = rng.gen_range(0..=i);
            band.swap(i, j);
        }
        band
    }

    /// Roulette-wheel sample `band` without replacement: each draw picks an
    /// index with probability proportional to its weight, then removes it
    /// and draws again among what's left.
    fn weighted_draw_without_replacement(
        mut band: Vec<usize>,
        weights: &std::collections::HashMap<usize, f64>,
    ) -> Vec<usize> {
        const NEUTRAL_WEIGHT: f64 = 1.0;
        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(band.len());

        while band.len() > 1 {
            let band_weights: Vec<f64> = band
                .iter()
                .map(|index| weights.get(index).copied().unwrap_or(NEUTRAL_WEIGHT).max(f64::EPSILON))
                .collect();
            let total: f64 = band_weights.iter().sum();
            let mut draw = rng.gen_range(0.0..total);
            let mut chosen = band.len() - 1;
            for (i, w) in band_weights.iter().enumerate() {
                if draw < *w {
                    chosen = i;
                    break;
                }
                draw -= w;
            }
            ordered.push(band.remove(chosen));
        }
        ordered.extend(band);
        ordered
    }

    /// Number of configured providers (primaries and backups combined).
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Time budget to wait for a streaming prefetch slot before surfacing
    /// `PoolExhausted` to the reader.
    pub fn acquire_timeout(&self) -> Duration {
        self.pool_config.acquire_timeout
    }
}
