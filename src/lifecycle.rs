//! Deployment lifecycle
//!
//! A deployment is created `Pending`, becomes uploaded once its archive is
//! validated and stored, and is then bound to zero or more sites. When the
//! last site lets go of it, it receives an `expire_at` one TTL in the
//! future; binding it again clears that. The window is granted once per
//! transition into the unreferenced state and is never pushed back by
//! recomputing.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::info;
use uuid::Uuid;

use crate::archive::{self, is_safe_path};
use crate::clock::Clock;
use crate::config::{DeploymentLimits, SiteConfig};
use crate::db::{Database, Tx};
use crate::error::{Error, Result};
use crate::models::{
    is_dns_label, App, Deployment, DeploymentMetadata, DeploymentWithSites, FileEntry, Site,
    SiteInfo,
};
use crate::storage::ObjectStorage;

pub struct DeploymentLifecycle {
    db: Database,
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    limits: DeploymentLimits,
    key_prefix: String,
}

impl DeploymentLifecycle {
    pub fn new(
        db: Database,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        limits: DeploymentLimits,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            db,
            storage,
            clock,
            limits,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a pending deployment with its manifest and site config
    pub fn create_deployment(
        &self,
        app_id: &str,
        name: &str,
        files: Vec<FileEntry>,
        site_config: SiteConfig,
    ) -> Result<Deployment> {
        if !is_dns_label(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let metadata = DeploymentMetadata {
            files,
            config: site_config,
        };
        self.check_limits(&metadata)?;
        validate_manifest(&metadata.files)?;
        metadata.config.validate().map_err(Error::InvalidConfig)?;

        let deployment = Deployment::new(self.clock.now(), name, app_id, &self.key_prefix, metadata);
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.create_deployment(&deployment)
        })?;

        info!(
            app = %app_id,
            deployment = %name,
            files = deployment.metadata.files.len(),
            bytes = deployment.metadata.total_size(),
            "Deployment created"
        );
        Ok(deployment)
    }

    fn check_limits(&self, metadata: &DeploymentMetadata) -> Result<()> {
        let count = metadata.files.len();
        if count > self.limits.max_files {
            return Err(Error::TooManyFiles {
                count,
                max: self.limits.max_files,
            });
        }
        let size = metadata.total_size();
        if size > self.limits.max_size_bytes {
            return Err(Error::DeploymentTooLarge {
                size,
                max: self.limits.max_size_bytes,
            });
        }
        Ok(())
    }

    /// Validate and store the deployment's archive, then mark it uploaded.
    ///
    /// Each attempt writes below its own segment of the deployment prefix,
    /// and the winning segment is recorded by the same conditional update
    /// that marks the deployment uploaded. Objects written by failed,
    /// cancelled or losing attempts are never referenced. Failure or
    /// cancellation before the final update leaves the deployment pending;
    /// the upload may be retried.
    pub async fn upload_deployment<R>(&self, app_id: &str, name: &str, reader: R) -> Result<Deployment>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let deployment = self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.get_deployment_by_name(app_id, name)
        })?;
        if deployment.is_uploaded() {
            return Err(Error::AlreadyUploaded);
        }

        let attempt_prefix = format!(
            "{}{}/",
            deployment.storage_key_prefix,
            Uuid::new_v4().simple()
        );
        let summary = archive::extract_files(
            reader,
            &deployment.metadata.files,
            &attempt_prefix,
            Arc::clone(&self.storage),
        )
        .await?;

        let now = self.clock.now();
        let uploaded = self.db.transaction(|tx| {
            tx.mark_deployment_uploaded(app_id, &deployment.id, &attempt_prefix, now)
        })?;

        info!(
            app = %app_id,
            deployment = %name,
            files = summary.files,
            bytes = summary.bytes,
            "Deployment uploaded"
        );
        Ok(uploaded)
    }

    /// Create a site declared in the app config, if it does not exist yet
    pub fn create_site(&self, app_id: &str, name: &str) -> Result<SiteInfo> {
        let now = self.clock.now();
        self.db.transaction(|tx| {
            let app = tx.get_app(app_id)?;
            if app.config.resolve_site(name).is_none() {
                return Err(Error::UndefinedSite);
            }
            tx.create_site_if_not_exist(&Site::new(now, app_id, name))?;
            tx.get_site_info(app_id, name)
        })
    }

    /// Point a site at the named deployment; an empty name unassigns.
    ///
    /// The site must already exist: a name that was never created, declared
    /// in the app config or not, fails with `SiteNotFound` rather than
    /// `UndefinedSite`.
    pub fn assign_site(&self, app_id: &str, site_name: &str, deployment_name: &str) -> Result<SiteInfo> {
        let now = self.clock.now();
        let info = self.db.transaction(|tx| {
            let app = tx.get_app(app_id)?;
            let site = tx.get_site_by_name(app_id, site_name)?;
            if deployment_name.is_empty() {
                unassign_in_tx(tx, &app, &site, now)?;
            } else {
                assign_in_tx(tx, &app, &site, deployment_name, now)?;
            }
            tx.get_site_info(app_id, site_name)
        })?;

        info!(
            app = %app_id,
            site = %site_name,
            deployment = info.deployment_name.as_deref().unwrap_or(""),
            "Site deployment updated"
        );
        Ok(info)
    }

    pub fn unassign_site(&self, app_id: &str, site_name: &str) -> Result<SiteInfo> {
        self.assign_site(app_id, site_name, "")
    }

    pub fn get_site(&self, app_id: &str, name: &str) -> Result<SiteInfo> {
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.get_site_info(app_id, name)
        })
    }

    pub fn list_sites(&self, app_id: &str) -> Result<Vec<SiteInfo>> {
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.list_sites(app_id)
        })
    }

    pub fn get_deployment(&self, app_id: &str, name: &str) -> Result<DeploymentWithSites> {
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            let deployment = tx.get_deployment_by_name(app_id, name)?;
            let site_names = tx.get_deployment_site_names(&deployment.id)?;
            Ok(DeploymentWithSites {
                deployment,
                site_names,
            })
        })
    }

    pub fn list_deployments(&self, app_id: &str) -> Result<Vec<DeploymentWithSites>> {
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.list_deployments(app_id)?
                .into_iter()
                .map(|deployment| {
                    let site_names = tx.get_deployment_site_names(&deployment.id)?;
                    Ok(DeploymentWithSites {
                        deployment,
                        site_names,
                    })
                })
                .collect()
        })
    }
}

/// Manifest paths must be safe and unique
fn validate_manifest(files: &[FileEntry]) -> Result<()> {
    let mut seen = HashSet::with_capacity(files.len());
    for file in files {
        if !is_safe_path(&file.path) {
            return Err(Error::InvalidFileEntry(format!("unsafe path '{}'", file.path)));
        }
        if !seen.insert(file.path.as_str()) {
            return Err(Error::InvalidFileEntry(format!("duplicate path '{}'", file.path)));
        }
    }
    Ok(())
}

/// Bind `site` to the named deployment and recompute expiry on both sides
pub fn assign_in_tx(
    tx: &Tx<'_>,
    app: &App,
    site: &Site,
    deployment_name: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let deployment = tx.get_deployment_by_name(&app.id, deployment_name)?;
    if site.deployment_id.as_deref() == Some(deployment.id.as_str()) {
        return Ok(());
    }
    deployment.check_alive(now)?;

    tx.set_site_deployment(&site.id, Some(deployment.id.as_str()), now)?;

    let ttl = app.config.deployments.ttl();
    recompute_expiry(tx, &app.id, &deployment.id, ttl, now)?;
    if let Some(previous) = &site.deployment_id {
        recompute_previous(tx, &app.id, previous, ttl, now)?;
    }
    Ok(())
}

/// Clear the site's pointer and recompute expiry of the released deployment
pub fn unassign_in_tx(tx: &Tx<'_>, app: &App, site: &Site, now: DateTime<Utc>) -> Result<()> {
    let Some(previous) = &site.deployment_id else {
        return Ok(());
    };
    tx.set_site_deployment(&site.id, None, now)?;
    recompute_previous(tx, &app.id, previous, app.config.deployments.ttl(), now)
}

fn recompute_previous(
    tx: &Tx<'_>,
    app_id: &str,
    deployment_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    match recompute_expiry(tx, app_id, deployment_id, ttl, now) {
        // Already deleted; nothing to expire
        Err(Error::DeploymentNotFound) => Ok(()),
        other => other.map(|_| ()),
    }
}

/// Apply the expiry hysteresis rule and return the resulting `expire_at`.
///
/// Unreferenced with no expiry starts the window at `now + ttl`; referenced
/// with an expiry clears it; anything else is left unchanged.
pub fn recompute_expiry(
    tx: &Tx<'_>,
    app_id: &str,
    deployment_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let deployment = tx.get_deployment(app_id, deployment_id)?;
    let references = tx.count_deployment_sites(deployment_id)?;

    match (references, deployment.expire_at) {
        (0, None) => {
            let expire_at = now
                .checked_add_signed(ttl)
                .ok_or_else(|| Error::InvalidConfig("deployment ttl is out of range".to_string()))?;
            tx.set_deployment_expiry(deployment_id, Some(expire_at), now)?;
            info!(
                app = %app_id,
                deployment = %deployment.name,
                expire_at = %expire_at,
                "Deployment unreferenced, expiry scheduled"
            );
            Ok(Some(expire_at))
        }
        (n, Some(_)) if n > 0 => {
            tx.set_deployment_expiry(deployment_id, None, now)?;
            info!(app = %app_id, deployment = %deployment.name, "Deployment referenced, expiry cleared");
            Ok(None)
        }
        (_, current) => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::storage::MemoryStorage;

    fn lifecycle(limits: DeploymentLimits) -> DeploymentLifecycle {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        db.transaction(|tx| tx.create_app(&App::new(clock.now(), "blog", AppConfig::default())))
            .unwrap();
        DeploymentLifecycle::new(db, Arc::new(MemoryStorage::new()), clock, limits, "")
    }

    fn files(entries: &[(&str, u64)]) -> Vec<FileEntry> {
        entries
            .iter()
            .map(|(path, size)| FileEntry {
                path: path.to_string(),
                size: *size,
            })
            .collect()
    }

    #[test]
    fn test_create_checks_limits() {
        let lc = lifecycle(DeploymentLimits {
            max_files: 2,
            max_size_bytes: 100,
        });

        let err = lc
            .create_deployment("blog", "v1", files(&[("a", 1), ("b", 1), ("c", 1)]), SiteConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::TooManyFiles { count: 3, max: 2 }));

        let err = lc
            .create_deployment("blog", "v1", files(&[("a", 60), ("b", 41)]), SiteConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::DeploymentTooLarge { size: 101, max: 100 }));

        lc.create_deployment("blog", "v1", files(&[("a", 60), ("b", 40)]), SiteConfig::default())
            .unwrap();
    }

    #[test]
    fn test_create_validates_input() {
        let lc = lifecycle(DeploymentLimits::default());

        assert!(matches!(
            lc.create_deployment("blog", "Bad Name", files(&[]), SiteConfig::default()),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            lc.create_deployment("blog", "v1", files(&[("../x", 1)]), SiteConfig::default()),
            Err(Error::InvalidFileEntry(_))
        ));
        assert!(matches!(
            lc.create_deployment("blog", "v1", files(&[("a", 1), ("a", 1)]), SiteConfig::default()),
            Err(Error::InvalidFileEntry(_))
        ));
        assert!(matches!(
            lc.create_deployment(
                "blog",
                "v1",
                files(&[]),
                SiteConfig {
                    public: "/abs".to_string()
                }
            ),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            lc.create_deployment("nope", "v1", files(&[]), SiteConfig::default()),
            Err(Error::AppNotFound)
        ));
    }

    #[test]
    fn test_create_duplicate_name() {
        let lc = lifecycle(DeploymentLimits::default());
        lc.create_deployment("blog", "v1", files(&[("a", 1)]), SiteConfig::default())
            .unwrap();
        assert!(matches!(
            lc.create_deployment("blog", "v1", files(&[("a", 1)]), SiteConfig::default()),
            Err(Error::UsedName)
        ));
    }

    #[test]
    fn test_create_site_requires_declaration() {
        let lc = lifecycle(DeploymentLimits::default());
        let info = lc.create_site("blog", "main").unwrap();
        assert_eq!(info.site.name, "main");
        assert!(info.deployment_name.is_none());

        // Idempotent
        assert_eq!(lc.create_site("blog", "main").unwrap().site.id, info.site.id);

        assert!(matches!(lc.create_site("blog", "staging"), Err(Error::UndefinedSite)));
    }

    #[test]
    fn test_assign_pending_deployment_fails() {
        let lc = lifecycle(DeploymentLimits::default());
        lc.create_site("blog", "main").unwrap();
        lc.create_deployment("blog", "v1", files(&[("a", 1)]), SiteConfig::default())
            .unwrap();

        assert!(matches!(
            lc.assign_site("blog", "main", "v1"),
            Err(Error::DeploymentNotUploaded)
        ));
        assert!(matches!(
            lc.assign_site("blog", "main", "v2"),
            Err(Error::DeploymentNotFound)
        ));
        assert!(matches!(
            lc.assign_site("blog", "staging", "v1"),
            Err(Error::SiteNotFound)
        ));
    }

    #[test]
    fn test_unassign_empty_site_is_noop() {
        let lc = lifecycle(DeploymentLimits::default());
        lc.create_site("blog", "main").unwrap();
        let info = lc.unassign_site("blog", "main").unwrap();
        assert!(info.site.deployment_id.is_none());
    }
}
