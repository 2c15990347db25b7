//! Custom domain management
//!
//! A domain must be declared in the app config before it can be activated.
//! Activation claims the hostname for the app; only active domains take
//! part in host resolution.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::host::{DomainLookup, HostIdScheme};
use crate::models::Domain;

/// Resolves active custom domains to site identifiers
pub struct DbDomainLookup {
    db: Database,
    scheme: HostIdScheme,
}

impl DbDomainLookup {
    pub fn new(db: Database, scheme: HostIdScheme) -> Self {
        Self { db, scheme }
    }
}

#[async_trait]
impl DomainLookup for DbDomainLookup {
    async fn resolve(&self, hostname: &str) -> Result<String> {
        let hostname = hostname.to_ascii_lowercase();
        let domain = self.db.transaction(|tx| tx.get_domain_by_name(&hostname))?;
        Ok(self.scheme.make(&domain.app_id, Some(&domain.site_name)))
    }
}

/// Domain activation for apps
pub struct DomainManager {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl DomainManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Claim a declared domain for the app.
    ///
    /// Re-activating returns the existing record, re-pointed if the
    /// config now maps the domain to another site.
    pub fn activate_domain(&self, app_id: &str, domain: &str) -> Result<Domain> {
        let name = normalize_domain(domain)?;
        let now = self.clock.now();

        let record = self.db.transaction(|tx| {
            let app = tx.get_app(app_id)?;
            let declared = app
                .config
                .resolve_domain(&name)
                .ok_or(Error::UndefinedDomain)?;
            if declared.domain_verification {
                return Err(Error::DomainVerificationNotSupported);
            }

            match tx.get_domain_by_name(&name) {
                Ok(existing) if existing.app_id != app_id => return Err(Error::DomainUsedName),
                Ok(existing) if existing.site_name == declared.site => return Ok(existing),
                Ok(existing) => tx.delete_domain(&existing.id, now)?,
                Err(Error::DomainNotFound) => {}
                Err(e) => return Err(e),
            }

            let record = Domain::new(now, &name, app_id, &declared.site);
            tx.create_domain(&record)?;
            Ok(record)
        })?;

        info!(domain = %record.domain, app = %app_id, site = %record.site_name, "Domain activated");
        Ok(record)
    }

    /// Release a domain held by the app
    pub fn deactivate_domain(&self, app_id: &str, domain: &str) -> Result<()> {
        let name = normalize_domain(domain)?;
        let now = self.clock.now();

        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            let existing = tx.get_domain_by_name(&name)?;
            if existing.app_id != app_id {
                return Err(Error::DomainNotFound);
            }
            tx.delete_domain(&existing.id, now)
        })?;

        info!(domain = %name, app = %app_id, "Domain deactivated");
        Ok(())
    }

    pub fn list_domains(&self, app_id: &str) -> Result<Vec<Domain>> {
        self.db.transaction(|tx| {
            tx.get_app(app_id)?;
            tx.list_domains(app_id)
        })
    }
}

/// Normalize a domain name (lowercase, no trailing dot)
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();

    if domain.is_empty() {
        return Err(Error::InvalidRequest("domain cannot be empty".to_string()));
    }
    if domain.len() > 253 {
        return Err(Error::InvalidRequest("domain name too long".to_string()));
    }

    let valid_chars = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_chars {
        return Err(Error::InvalidRequest(format!(
            "domain '{}' contains invalid characters",
            domain
        )));
    }

    if domain
        .split('.')
        .any(|label| label.is_empty() || label.len() > 63 || label.starts_with('-') || label.ends_with('-'))
    {
        return Err(Error::InvalidRequest(format!("domain '{}' has an invalid label", domain)));
    }

    Ok(domain)
}
