//! Read-through cache for the persisted site config.
//!
//! Each refill picks its own expiry of `ttl ± jitter` so replicas started
//! together do not reload at the same instant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;

use mc_domain::config::SiteSection;
use mc_domain::model::SiteConfig;
use mc_sessions::ChatStore;

struct Cached {
    site: SiteConfig,
    expires_at: Instant,
}

pub struct SiteConfigCache {
    store: Arc<ChatStore>,
    ttl: Duration,
    jitter: Duration,
    cached: RwLock<Option<Cached>>,
}

impl SiteConfigCache {
    pub fn new(store: Arc<ChatStore>, cfg: &SiteSection) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(cfg.cache_ttl_secs),
            jitter: Duration::from_secs(cfg.cache_jitter_secs),
            cached: RwLock::new(None),
        }
    }

    pub fn get(&self) -> SiteConfig {
        let now = Instant::now();
        if let Some(c) = self.cached.read().as_ref() {
            if c.expires_at > now {
                return c.site.clone();
            }
        }

        let site = self.store.site_config().unwrap_or_default();
        let expires_at = now + self.next_ttl();
        *self.cached.write() = Some(Cached {
            site: site.clone(),
            expires_at,
        });
        tracing::debug!(models = site.models.len(), "site config cache refilled");
        site
    }

    fn next_ttl(&self) -> Duration {
        let jitter = self.jitter.as_secs().min(self.ttl.as_secs()) as i64;
        if jitter == 0 {
            return self.ttl;
        }
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs((self.ttl.as_secs() as i64 + offset).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &tempfile::TempDir, ttl: u64, jitter: u64) -> (Arc<ChatStore>, SiteConfigCache) {
        let store = Arc::new(ChatStore::open(dir.path()).unwrap());
        let cfg = SiteSection {
            cache_ttl_secs: ttl,
            cache_jitter_secs: jitter,
            ..SiteSection::default()
        };
        let cache = SiteConfigCache::new(store.clone(), &cfg);
        (store, cache)
    }

    #[test]
    fn serves_cached_value_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache) = cache(&dir, 3600, 60);
        store
            .put_site_config(SiteConfig { notice: "v1".into(), ..Default::default() })
            .unwrap();
        assert_eq!(cache.get().notice, "v1");

        store
            .put_site_config(SiteConfig { notice: "v2".into(), ..Default::default() })
            .unwrap();
        assert_eq!(cache.get().notice, "v1");
    }

    #[test]
    fn zero_ttl_reads_through() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache) = cache(&dir, 0, 0);
        assert!(cache.get().models.is_empty());
        store
            .put_site_config(SiteConfig { notice: "fresh".into(), ..Default::default() })
            .unwrap();
        assert_eq!(cache.get().notice, "fresh");
    }

    #[test]
    fn ttl_stays_within_jitter_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, cache) = cache(&dir, 100, 10);
        for _ in 0..50 {
            let ttl = cache.next_ttl().as_secs();
            assert!((90..=110).contains(&ttl));
        }
    }
}
