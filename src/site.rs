//! Site identifier to descriptor resolution

use async_trait::async_trait;
use serde::Serialize;

use crate::access::AccessRule;
use crate::config::SiteConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::host::HostIdScheme;

/// Ready-to-serve view of a site
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    pub id: String,
    pub app_id: String,
    pub site_name: String,
    pub deployment_id: String,
    pub deployment_name: String,
    pub storage_key_prefix: String,
    pub config: SiteConfig,
    /// Viewing ACL from the app config
    pub access: Vec<AccessRule>,
}

#[async_trait]
pub trait SiteResolver: Send + Sync {
    /// Fails with [`Error::SiteNotFound`] when nothing servable exists
    async fn resolve(&self, id: &str) -> Result<Descriptor>;
}

pub struct DbSiteResolver {
    db: Database,
    scheme: HostIdScheme,
}

impl DbSiteResolver {
    pub fn new(db: Database, scheme: HostIdScheme) -> Self {
        Self { db, scheme }
    }
}

fn not_found_as_site(err: Error) -> Error {
    if err.is_not_found() {
        Error::SiteNotFound
    } else {
        err
    }
}

#[async_trait]
impl SiteResolver for DbSiteResolver {
    async fn resolve(&self, id: &str) -> Result<Descriptor> {
        let (app_id, site) = self.scheme.split(id)?;

        self.db
            .transaction(|tx| {
                let app = tx.get_app(&app_id)?;
                let site_name = site.unwrap_or_else(|| app.config.default_site.clone());
                let declared = app
                    .config
                    .resolve_site(&site_name)
                    .ok_or(Error::SiteNotFound)?;

                let (_, deployment) = tx.get_site_deployment(&app_id, &site_name)?;
                if !deployment.is_uploaded() {
                    return Err(Error::SiteNotFound);
                }

                Ok(Descriptor {
                    id: id.to_string(),
                    app_id: app.id.clone(),
                    site_name,
                    deployment_id: deployment.id,
                    deployment_name: deployment.name,
                    storage_key_prefix: deployment.storage_key_prefix,
                    config: deployment.metadata.config,
                    access: declared.access.clone(),
                })
            })
            .map_err(not_found_as_site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLevel;
    use crate::config::{AppConfig, AppSiteConfig};
    use crate::models::{App, Deployment, DeploymentMetadata, Site};
    use chrono::Utc;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let config = AppConfig {
            sites: vec![
                AppSiteConfig {
                    name: "main".to_string(),
                    access: Vec::new(),
                },
                AppSiteConfig {
                    name: "staging".to_string(),
                    access: vec![AccessRule::ip_range("10.0.0.0/8", AccessLevel::Read)],
                },
            ],
            ..AppConfig::default()
        };

        db.transaction(|tx| {
            tx.create_app(&App::new(now, "blog", config))?;
            let mut deployment = Deployment::new(now, "v1", "blog", "", DeploymentMetadata::default());
            tx.create_deployment(&deployment)?;
            let prefix = deployment.storage_key_prefix.clone();
            deployment = tx.mark_deployment_uploaded("blog", &deployment.id, &prefix, now)?;

            let main = tx.create_site_if_not_exist(&Site::new(now, "blog", "main"))?;
            tx.set_site_deployment(&main.id, Some(deployment.id.as_str()), now)?;
            let staging = tx.create_site_if_not_exist(&Site::new(now, "blog", "staging"))?;
            tx.set_site_deployment(&staging.id, Some(deployment.id.as_str()), now)?;

            let pending = Deployment::new(now, "v2", "blog", "", DeploymentMetadata::default());
            tx.create_deployment(&pending)?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_resolve_default_site() {
        let resolver = DbSiteResolver::new(setup(), HostIdScheme::Subdomain);

        let descriptor = resolver.resolve("blog").await.unwrap();
        assert_eq!(descriptor.app_id, "blog");
        assert_eq!(descriptor.site_name, "main");
        assert_eq!(descriptor.deployment_name, "v1");
        assert!(descriptor.storage_key_prefix.starts_with("blog/deployment_"));
        assert!(descriptor.access.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_named_site() {
        let resolver = DbSiteResolver::new(setup(), HostIdScheme::Suffix);

        let descriptor = resolver.resolve("blog--staging").await.unwrap();
        assert_eq!(descriptor.id, "blog--staging");
        assert_eq!(descriptor.site_name, "staging");
        assert_eq!(descriptor.access.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_misses() {
        let resolver = DbSiteResolver::new(setup(), HostIdScheme::Subdomain);

        for id in ["shop", "dev.blog", "a.b.c", "Bad_Id"] {
            assert!(
                matches!(resolver.resolve(id).await, Err(Error::SiteNotFound)),
                "{id} should not resolve"
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_site_without_deployment() {
        let db = setup();
        db.transaction(|tx| {
            let site = tx.get_site_by_name("blog", "staging")?;
            tx.set_site_deployment(&site.id, None, Utc::now())
        })
        .unwrap();

        let resolver = DbSiteResolver::new(db, HostIdScheme::Subdomain);
        assert!(matches!(
            resolver.resolve("staging.blog").await,
            Err(Error::SiteNotFound)
        ));
    }
}
