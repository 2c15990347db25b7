//! Persistent records
//!
//! Every record carries a `deleted_at` tombstone; rows are never removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::Credential;
use crate::config::{AppConfig, SiteConfig};
use crate::error::{Error, Result};

/// Generate a record id such as `deployment_3f2a...`
pub fn new_id(kind: &str) -> String {
    format!("{}_{}", kind, Uuid::new_v4().simple())
}

/// Lowercase DNS label: 1-63 chars of `[a-z0-9-]`, no leading or trailing hyphen
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub config: AppConfig,
}

impl App {
    pub fn new(now: DateTime<Utc>, id: impl Into<String>, config: AppConfig) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub app_id: String,
    pub name: String,
    pub deployment_id: Option<String>,
}

impl Site {
    pub fn new(now: DateTime<Utc>, app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_id("site"),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            app_id: app_id.into(),
            name: name.into(),
            deployment_id: None,
        }
    }
}

/// A site together with the name of its current deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteInfo {
    #[serde(flatten)]
    pub site: Site,
    pub deployment_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeploymentMetadata {
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub config: SiteConfig,
}

impl DeploymentMetadata {
    pub fn total_size(&self) -> u64 {
        self.files.iter().fold(0u64, |acc, f| acc.saturating_add(f.size))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Active,
    Inactive,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
    pub app_id: String,
    pub storage_key_prefix: String,
    pub metadata: DeploymentMetadata,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// New pending deployment. Its key prefix embeds the app and the
    /// deployment id, so objects never collide across deployments.
    pub fn new(
        now: DateTime<Utc>,
        name: impl Into<String>,
        app_id: impl Into<String>,
        key_prefix: &str,
        metadata: DeploymentMetadata,
    ) -> Self {
        let id = new_id("deployment");
        let app_id = app_id.into();
        let storage_key_prefix = format!("{}{}/{}/", key_prefix, app_id, id);
        Self {
            id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            name: name.into(),
            app_id,
            storage_key_prefix,
            metadata,
            uploaded_at: None,
            expire_at: None,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    /// Fails unless the deployment may be bound to a site at `now`
    pub fn check_alive(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_uploaded() {
            return Err(Error::DeploymentNotUploaded);
        }
        if self.is_expired(now) {
            return Err(Error::DeploymentExpired);
        }
        Ok(())
    }

    pub fn status(&self, now: DateTime<Utc>, referenced: bool) -> DeploymentStatus {
        if !self.is_uploaded() {
            DeploymentStatus::Pending
        } else if self.is_expired(now) {
            DeploymentStatus::Expired
        } else if referenced {
            DeploymentStatus::Active
        } else {
            DeploymentStatus::Inactive
        }
    }
}

/// A deployment with the sites currently pointing at it
#[derive(Debug, Clone)]
pub struct DeploymentWithSites {
    pub deployment: Deployment,
    pub site_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Domain {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub domain: String,
    pub app_id: String,
    pub site_name: String,
}

impl Domain {
    pub fn new(
        now: DateTime<Utc>,
        domain: impl Into<String>,
        app_id: impl Into<String>,
        site_name: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id("domain"),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            domain: domain.into(),
            app_id: app_id.into(),
            site_name: site_name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub name: String,
}

impl User {
    pub fn new(now: DateTime<Utc>, name: impl Into<String>) -> Self {
        Self {
            id: new_id("user"),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            name: name.into(),
        }
    }
}

/// External identity linked to a user; the id is `<kind>:<value>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserCredential {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub user_id: String,
}

impl UserCredential {
    pub fn new(now: DateTime<Utc>, id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            user_id: user_id.into(),
        }
    }

    /// Request credential represented by this record, if the kind is known
    pub fn credential(&self) -> Option<Credential> {
        let (kind, value) = self.id.split_once(':')?;
        match kind {
            "github" if !value.is_empty() => Some(Credential::GitHubUser(value.to_string())),
            _ => None,
        }
    }
}

/// Validate a `<kind>:<value>` credential id supplied by a client
pub fn validate_credential_id(id: &str) -> Result<()> {
    match id.split_once(':') {
        Some(("github", login)) if !login.is_empty() && !login.contains(char::is_whitespace) => {
            Ok(())
        }
        _ => Err(Error::InvalidRequest(format!(
            "unsupported credential '{}'",
            id
        ))),
    }
}
