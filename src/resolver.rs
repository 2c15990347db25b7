//! Cached host to site resolution
//!
//! Composes [`HostResolver`] and a [`SiteResolver`] behind a
//! [`SingleFlightCache`]. Results may be stale for up to one TTL; anything
//! that must observe a fresh assignment reads the database directly.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::SingleFlightCache;
use crate::error::{Error, Result};
use crate::host::HostResolver;
use crate::site::{Descriptor, SiteResolver};

pub type LoadResult = std::result::Result<Arc<Descriptor>, Arc<Error>>;

pub struct ResolutionCache {
    hosts: Arc<HostResolver>,
    sites: Arc<dyn SiteResolver>,
    cache: SingleFlightCache<Arc<Descriptor>, Arc<Error>>,
}

impl ResolutionCache {
    pub fn new(
        hosts: Arc<HostResolver>,
        sites: Arc<dyn SiteResolver>,
        capacity: usize,
        ttl: Duration,
    ) -> Result<Self> {
        Ok(Self {
            hosts,
            sites,
            cache: SingleFlightCache::new(capacity, ttl)?,
        })
    }

    /// Resolve a host, sharing in-flight and recent results
    pub async fn load(&self, host: &str) -> LoadResult {
        let key = host.to_ascii_lowercase();
        let hosts = Arc::clone(&self.hosts);
        let sites = Arc::clone(&self.sites);
        let target = key.clone();

        self.cache
            .load(&key, move || async move {
                resolve_site(&hosts, sites.as_ref(), &target)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            })
            .await
    }
}

/// Uncached resolution of a host to its descriptor
pub async fn resolve_site(hosts: &HostResolver, sites: &dyn SiteResolver, host: &str) -> Result<Descriptor> {
    let id = hosts.resolve(host).await?;
    sites.resolve(&id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::host::{DomainLookup, HostPattern};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoDomains;

    #[async_trait]
    impl DomainLookup for NoDomains {
        async fn resolve(&self, _hostname: &str) -> Result<String> {
            Err(Error::DomainNotFound)
        }
    }

    /// Knows only the `blog` app and counts calls
    #[derive(Default)]
    struct CountingSites {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SiteResolver for CountingSites {
        async fn resolve(&self, id: &str) -> Result<Descriptor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if id != "blog" {
                return Err(Error::SiteNotFound);
            }
            Ok(Descriptor {
                id: id.to_string(),
                app_id: "blog".to_string(),
                site_name: "main".to_string(),
                deployment_id: "deployment_1".to_string(),
                deployment_name: "v1".to_string(),
                storage_key_prefix: "blog/deployment_1/".to_string(),
                config: SiteConfig::default(),
                access: Vec::new(),
            })
        }
    }

    fn cache(sites: Arc<CountingSites>) -> ResolutionCache {
        let hosts = HostResolver::new(
            HostPattern::new("http://*.localhost:8000").unwrap(),
            "",
            Arc::new(NoDomains),
        );
        ResolutionCache::new(Arc::new(hosts), sites, 10, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_resolution() {
        let sites = Arc::new(CountingSites::default());
        let cache = Arc::new(cache(Arc::clone(&sites)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.load("blog.localhost:8000").await })
            })
            .collect();

        for handle in handles {
            let descriptor = handle.await.unwrap().unwrap();
            assert_eq!(descriptor.site_name, "main");
        }
        assert_eq!(sites.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_cached() {
        let sites = Arc::new(CountingSites::default());
        let cache = cache(Arc::clone(&sites));

        for _ in 0..3 {
            let err = cache.load("shop.localhost:8000").await.unwrap_err();
            assert!(matches!(*err, Error::SiteNotFound));
        }
        assert_eq!(sites.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_case_shares_entry() {
        let sites = Arc::new(CountingSites::default());
        let cache = cache(Arc::clone(&sites));

        cache.load("blog.localhost:8000").await.unwrap();
        cache.load("BLOG.localhost:8000").await.unwrap();
        assert_eq!(sites.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_host_is_not_found() {
        let sites = Arc::new(CountingSites::default());
        let cache = cache(Arc::clone(&sites));

        let err = cache.load("example.com").await.unwrap_err();
        assert!(matches!(*err, Error::SiteNotFound));
        assert_eq!(sites.calls.load(Ordering::SeqCst), 0);
    }
}
