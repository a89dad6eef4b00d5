//! Per-category blocklist/whitelist caching.
//!
//! A [`ListCache`] keeps, for every category, one sorted entry vector per
//! configured source. Sources are fetched in parallel; each successfully
//! fetched vector is swapped in atomically under the write lock while the
//! hot match path takes the shared lock. A source that fails with a
//! transient error keeps its previous entries; a permanent failure replaces
//! them with an empty vector.

pub mod download;
mod index;
mod parse;

pub use download::{Downloader, Etag, FetchError, FetchOutcome};

use crate::metrics::Metrics;
use futures::future::join_all;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Blacklist,
    Whitelist,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Blacklist => f.write_str("blacklist"),
            ListKind::Whitelist => f.write_str("whitelist"),
        }
    }
}

/// Matches domains against cached list entries.
pub trait Matcher: Send + Sync {
    /// Returns the first of `groups` whose cached entries contain `domain`.
    fn find_group(&self, domain: &str, groups: &[String]) -> Option<String>;

    /// Returns the current configuration and stats as printable lines.
    fn configuration(&self) -> Vec<String>;
}

type SourceCaches = FxHashMap<String, FxHashMap<String, Arc<Vec<String>>>>;

pub struct ListCache {
    kind: ListKind,
    group_sources: Vec<(String, Vec<String>)>,
    caches: RwLock<SourceCaches>,
    refresh_period: Option<Duration>,
    downloader: Downloader,
    source_gauge: Option<prometheus::GaugeVec>,
}

enum SourceFetch {
    Entries(Vec<String>),
    Unchanged,
    Empty,
    Transient,
}

impl ListCache {
    /// Builds the cache and synchronously populates every source before
    /// returning, then keeps refreshing on its own task at the configured
    /// period (minutes; `0` means the 4 h default, negative disables).
    pub async fn new(
        kind: ListKind,
        group_sources: HashMap<String, Vec<String>>,
        refresh_period_minutes: i64,
        metrics: &Metrics,
    ) -> Arc<Self> {
        let refresh_period = match refresh_period_minutes {
            0 => Some(DEFAULT_REFRESH_PERIOD),
            p if p < 0 => None,
            p => Some(Duration::from_secs(p as u64 * 60)),
        };

        let source_gauge = metrics.register_gauge_vec(
            &format!("warden_{kind}_cache"),
            "Number of list sources populated per group",
            &["group"],
        );

        let mut group_sources: Vec<(String, Vec<String>)> = group_sources.into_iter().collect();
        group_sources.sort_by(|a, b| a.0.cmp(&b.0));

        let cache = Arc::new(Self {
            kind,
            group_sources,
            caches: RwLock::new(FxHashMap::default()),
            refresh_period,
            downloader: Downloader::new(),
            source_gauge,
        });

        cache.refresh().await;
        cache.spawn_periodic();

        cache
    }

    fn spawn_periodic(self: &Arc<Self>) {
        let Some(period) = self.refresh_period else {
            return;
        };
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; the boot population
            // already ran.
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.refresh().await;
            }
        });
    }

    /// Re-fetches every source of every category.
    ///
    /// Source vectors are swapped one at a time under the write lock, so a
    /// concurrent reader may observe a mix of old and new vectors across the
    /// sources of one category while a refresh is in flight.
    pub async fn refresh(&self) {
        for (group, links) in &self.group_sources {
            let fetches = links.iter().map(|link| async move {
                (link.as_str(), self.fetch_source(link).await)
            });

            for (link, fetched) in join_all(fetches).await {
                match fetched {
                    SourceFetch::Entries(entries) => self.install(group, link, entries),
                    SourceFetch::Unchanged => {}
                    SourceFetch::Empty => self.install(group, link, Vec::new()),
                    SourceFetch::Transient => {
                        warn!(
                            kind = %self.kind,
                            group,
                            link,
                            "populating of source failed, leaving items from last successful download in cache"
                        );
                    }
                }
            }

            if let Some(gauge) = &self.source_gauge {
                gauge
                    .with_label_values(&[group])
                    .set(self.populated_sources(group) as f64);
            }

            info!(
                kind = %self.kind,
                group,
                total_count = self.total_entries(group),
                "group import finished"
            );
        }
    }

    async fn fetch_source(&self, link: &str) -> SourceFetch {
        match self.downloader.fetch(link).await {
            Ok(FetchOutcome::Fetched(body)) => SourceFetch::Entries(parse::parse_list(&body)),
            Ok(FetchOutcome::Unchanged) => SourceFetch::Unchanged,
            Err(err) if err.is_transient() => SourceFetch::Transient,
            Err(err) => {
                warn!(link, error = %err, "error reading source");
                SourceFetch::Empty
            }
        }
    }

    fn install(&self, group: &str, link: &str, entries: Vec<String>) {
        let mut caches = self.caches.write().unwrap();
        caches
            .entry(group.to_string())
            .or_default()
            .insert(link.to_string(), Arc::new(entries));
    }

    fn populated_sources(&self, group: &str) -> usize {
        let caches = self.caches.read().unwrap();
        caches.get(group).map(|sources| sources.len()).unwrap_or(0)
    }

    fn total_entries(&self, group: &str) -> usize {
        let caches = self.caches.read().unwrap();
        caches
            .get(group)
            .map(|sources| sources.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}

impl Matcher for ListCache {
    fn find_group(&self, domain: &str, groups: &[String]) -> Option<String> {
        let caches = self.caches.read().unwrap();
        for group in groups {
            if let Some(sources) = caches.get(group) {
                if sources.values().any(|entries| index::contains(entries, domain)) {
                    return Some(group.clone());
                }
            }
        }
        None
    }

    fn configuration(&self) -> Vec<String> {
        let mut result = Vec::new();

        match self.refresh_period {
            Some(period) => result.push(format!("refresh period: {} minutes", period.as_secs() / 60)),
            None => result.push("refresh: disabled".to_string()),
        }

        result.push("group links:".to_string());
        for (group, links) in &self.group_sources {
            result.push(format!("  {group}:"));
            for link in links {
                result.push(format!("   - {link}"));
            }
        }

        result.push("group caches:".to_string());

        let mut total = 0;
        let caches = self.caches.read().unwrap();
        for (group, _) in &self.group_sources {
            if let Some(sources) = caches.get(group) {
                for entries in sources.values() {
                    result.push(format!("  {group}: {} entries", entries.len()));
                    total += entries.len();
                }
            }
        }
        result.push(format!("  TOTAL: {total} entries"));

        result
    }
}
