//! Host to site identifier resolution
//!
//! Hosts are first matched structurally against the configured pattern,
//! e.g. `*.localhost:8000`, where the `*` captures the site identifier.
//! Hosts that do not match fall back to the custom domain table.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::is_dns_label;

/// Maximum length of a Host header we are willing to resolve
const MAX_HOST_LEN: usize = 261;

/// Captured identifiers look like DNS names
const ID_CAPTURE: &str = "[a-z0-9](?:[a-z0-9.-]*[a-z0-9])?";

/// Compiled host template containing a single `*`
#[derive(Debug, Clone)]
pub struct HostPattern {
    scheme: &'static str,
    before: String,
    after: String,
    /// `*.` form: the dot disappears along with an empty capture
    dotted: bool,
    regex: Regex,
}

impl HostPattern {
    pub fn new(template: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = template.strip_prefix("https://") {
            ("https", rest)
        } else if let Some(rest) = template.strip_prefix("http://") {
            ("http", rest)
        } else {
            ("http", template)
        };

        if rest.matches('*').count() != 1 {
            return Err(Error::InvalidConfig(format!(
                "host pattern '{}' must contain exactly one '*'",
                template
            )));
        }
        let (before, after) = rest
            .split_once('*')
            .ok_or_else(|| Error::InvalidConfig(format!("invalid host pattern '{}'", template)))?;

        let (after, dotted) = match after.strip_prefix('.') {
            Some(stripped) => (stripped, true),
            None => (after, false),
        };

        let expr = if dotted {
            format!(
                "(?i)^{}(?:({})\\.)?{}$",
                regex::escape(before),
                ID_CAPTURE,
                regex::escape(after)
            )
        } else {
            format!(
                "(?i)^{}({})?{}$",
                regex::escape(before),
                ID_CAPTURE,
                regex::escape(after)
            )
        };
        let regex = Regex::new(&expr)
            .map_err(|e| Error::InvalidConfig(format!("invalid host pattern '{}': {}", template, e)))?;

        Ok(Self {
            scheme,
            before: before.to_ascii_lowercase(),
            after: after.to_ascii_lowercase(),
            dotted,
            regex,
        })
    }

    /// The captured identifier, lower-cased; `Some("")` for the bare host
    pub fn capture(&self, host: &str) -> Option<String> {
        let captures = self.regex.captures(host)?;
        Some(
            captures
                .get(1)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_default(),
        )
    }

    /// Public URL of the site with the given identifier
    pub fn site_url(&self, id: &str) -> String {
        if id.is_empty() {
            format!("{}://{}{}", self.scheme, self.before, self.after)
        } else if self.dotted {
            format!("{}://{}{}.{}", self.scheme, self.before, id, self.after)
        } else {
            format!("{}://{}{}{}", self.scheme, self.before, id, self.after)
        }
    }
}

/// How `(app, site)` pairs are encoded in the host capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostIdScheme {
    /// `app` or `site.app`
    #[default]
    Subdomain,
    /// `app` or `app--site`
    Suffix,
}

const SUFFIX_SEPARATOR: &str = "--";

impl HostIdScheme {
    /// Identifier for a site; `None` addresses the app's default site
    pub fn make(&self, app_id: &str, site: Option<&str>) -> String {
        match (self, site) {
            (_, None) => app_id.to_string(),
            (HostIdScheme::Subdomain, Some(site)) => format!("{}.{}", site, app_id),
            (HostIdScheme::Suffix, Some(site)) => format!("{}{}{}", app_id, SUFFIX_SEPARATOR, site),
        }
    }

    /// Split an identifier into app id and optional site name
    pub fn split(&self, id: &str) -> Result<(String, Option<String>)> {
        let (app, site) = match self {
            HostIdScheme::Subdomain => match id.split_once('.') {
                Some((site, app)) => (app, Some(site)),
                None => (id, None),
            },
            HostIdScheme::Suffix => match id.rsplit_once(SUFFIX_SEPARATOR) {
                Some((app, site)) => (app, Some(site)),
                None => (id, None),
            },
        };

        if !is_dns_label(app) || site.is_some_and(|s| !is_dns_label(s)) {
            return Err(Error::SiteNotFound);
        }
        Ok((app.to_string(), site.map(str::to_string)))
    }
}

/// Maps a bare custom hostname to a site identifier
#[async_trait]
pub trait DomainLookup: Send + Sync {
    /// Fails with [`Error::DomainNotFound`] when no domain is registered
    async fn resolve(&self, hostname: &str) -> Result<String>;
}

/// Strip a trailing `:port` from a host, handling bracketed IPv6
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(addr, _)| addr).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

pub struct HostResolver {
    pattern: HostPattern,
    default_site: String,
    domains: Arc<dyn DomainLookup>,
}

impl HostResolver {
    pub fn new(pattern: HostPattern, default_site: impl Into<String>, domains: Arc<dyn DomainLookup>) -> Self {
        Self {
            pattern,
            default_site: default_site.into(),
            domains,
        }
    }

    /// Resolve a raw Host value (port included) to a site identifier
    pub async fn resolve(&self, host: &str) -> Result<String> {
        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(Error::SiteNotFound);
        }

        // The pattern carries the expected port, so match the raw host
        if let Some(id) = self.pattern.capture(host) {
            if id.is_empty() {
                if self.default_site.is_empty() {
                    return Err(Error::SiteNotFound);
                }
                return Ok(self.default_site.clone());
            }
            return Ok(id);
        }

        let hostname = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
        match self.domains.resolve(&hostname).await {
            Ok(id) => Ok(id),
            Err(Error::DomainNotFound) => {
                debug!(host = %hostname, "No site or domain for host");
                Err(Error::SiteNotFound)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticDomains(HashMap<String, String>);

    #[async_trait]
    impl DomainLookup for StaticDomains {
        async fn resolve(&self, hostname: &str) -> Result<String> {
            self.0.get(hostname).cloned().ok_or(Error::DomainNotFound)
        }
    }

    struct BrokenDomains;

    #[async_trait]
    impl DomainLookup for BrokenDomains {
        async fn resolve(&self, _hostname: &str) -> Result<String> {
            Err(Error::Internal(anyhow::anyhow!("database is locked")))
        }
    }

    fn resolver(default_site: &str) -> HostResolver {
        let mut domains = HashMap::new();
        domains.insert("www.example.com".to_string(), "blog".to_string());
        HostResolver::new(
            HostPattern::new("http://*.localhost:8000").unwrap(),
            default_site,
            Arc::new(StaticDomains(domains)),
        )
    }

    #[test]
    fn test_pattern_capture() {
        let pattern = HostPattern::new("http://*.localhost:8000").unwrap();
        assert_eq!(pattern.capture("blog.localhost:8000").as_deref(), Some("blog"));
        assert_eq!(pattern.capture("dev.blog.localhost:8000").as_deref(), Some("dev.blog"));
        assert_eq!(pattern.capture("Blog.LOCALHOST:8000").as_deref(), Some("blog"));
        assert_eq!(pattern.capture("localhost:8000").as_deref(), Some(""));
        assert_eq!(pattern.capture("blog.localhost:9000"), None);
        assert_eq!(pattern.capture("blog.localhost"), None);
        assert_eq!(pattern.capture("blog.evil.com"), None);
        assert_eq!(pattern.capture("-bad.localhost:8000"), None);
    }

    #[test]
    fn test_pattern_without_dot() {
        let pattern = HostPattern::new("*-pages.example.com").unwrap();
        assert_eq!(pattern.capture("blog-pages.example.com").as_deref(), Some("blog"));
        assert_eq!(pattern.capture("-pages.example.com").as_deref(), Some(""));
        assert_eq!(pattern.site_url("blog"), "http://blog-pages.example.com");
    }

    #[test]
    fn test_pattern_requires_single_wildcard() {
        assert!(HostPattern::new("localhost:8000").is_err());
        assert!(HostPattern::new("*.*.localhost").is_err());
    }

    #[test]
    fn test_site_url() {
        let pattern = HostPattern::new("https://*.pages.example.com").unwrap();
        assert_eq!(pattern.site_url("blog"), "https://blog.pages.example.com");
        assert_eq!(pattern.site_url("dev.blog"), "https://dev.blog.pages.example.com");
        assert_eq!(pattern.site_url(""), "https://pages.example.com");
    }

    #[test]
    fn test_subdomain_scheme() {
        let scheme = HostIdScheme::Subdomain;
        assert_eq!(scheme.make("blog", None), "blog");
        assert_eq!(scheme.make("blog", Some("dev")), "dev.blog");
        assert_eq!(scheme.split("blog").unwrap(), ("blog".to_string(), None));
        assert_eq!(
            scheme.split("dev.blog").unwrap(),
            ("blog".to_string(), Some("dev".to_string()))
        );
        assert!(matches!(scheme.split("a.b.c"), Err(Error::SiteNotFound)));
        assert!(matches!(scheme.split(""), Err(Error::SiteNotFound)));
    }

    #[test]
    fn test_suffix_scheme() {
        let scheme = HostIdScheme::Suffix;
        assert_eq!(scheme.make("blog", Some("dev")), "blog--dev");
        assert_eq!(
            scheme.split("blog--dev").unwrap(),
            ("blog".to_string(), Some("dev".to_string()))
        );
        assert_eq!(scheme.split("my-blog").unwrap(), ("my-blog".to_string(), None));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("example.com:"), "example.com:");
    }

    #[tokio::test]
    async fn test_resolve_structural() {
        let resolver = resolver("");
        assert_eq!(resolver.resolve("blog.localhost:8000").await.unwrap(), "blog");
        assert_eq!(resolver.resolve("dev.blog.localhost:8000").await.unwrap(), "dev.blog");
    }

    #[tokio::test]
    async fn test_resolve_default_site() {
        assert_eq!(resolver("blog").resolve("localhost:8000").await.unwrap(), "blog");
        assert!(matches!(
            resolver("").resolve("localhost:8000").await,
            Err(Error::SiteNotFound)
        ));
    }

    #[tokio::test]
    async fn test_resolve_domain_fallback() {
        let resolver = resolver("");
        assert_eq!(resolver.resolve("www.example.com").await.unwrap(), "blog");
        assert_eq!(resolver.resolve("WWW.example.com:443").await.unwrap(), "blog");
        assert_eq!(resolver.resolve("www.example.com.").await.unwrap(), "blog");
    }

    #[tokio::test]
    async fn test_domain_miss_is_site_not_found() {
        let resolver = resolver("");
        assert!(matches!(
            resolver.resolve("unknown.example.com").await,
            Err(Error::SiteNotFound)
        ));
        assert!(matches!(resolver.resolve("").await, Err(Error::SiteNotFound)));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_propagated() {
        let resolver = HostResolver::new(
            HostPattern::new("*.localhost:8000").unwrap(),
            "",
            Arc::new(BrokenDomains),
        );
        assert!(matches!(
            resolver.resolve("www.example.com").await,
            Err(Error::Internal(_))
        ));
    }
}
