//! SQLite data store for apps, sites, deployments, domains and users
//!
//! Every mutation that must be observed atomically runs inside
//! [`Database::transaction`]. Records are soft-deleted; every query filters
//! on `deleted_at IS NULL`. Races between writers are settled by unique
//! partial indexes and conditional updates, and a zero-row result is
//! reported as the matching domain error.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::{App, Deployment, Domain, Site, SiteInfo, User, UserCredential};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const APP_COLUMNS: &str = "id, created_at, updated_at, deleted_at, config";
const SITE_COLUMNS: &str = "s.id, s.created_at, s.updated_at, s.deleted_at, s.app_id, s.name, s.deployment_id";
const DEPLOYMENT_COLUMNS: &str = "d.id, d.created_at, d.updated_at, d.deleted_at, d.name, d.app_id, \
     d.storage_key_prefix, d.metadata, d.uploaded_at, d.expire_at";
const DOMAIN_COLUMNS: &str = "id, created_at, updated_at, deleted_at, domain, app_id, site_name";

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> anyhow::Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE apps (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                config TEXT NOT NULL
            );

            CREATE TABLE users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                name TEXT NOT NULL
            );

            CREATE TABLE user_credentials (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                user_id TEXT NOT NULL REFERENCES users(id)
            );
            CREATE INDEX user_credentials_user ON user_credentials (user_id);

            CREATE TABLE deployments (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                name TEXT NOT NULL,
                app_id TEXT NOT NULL REFERENCES apps(id),
                storage_key_prefix TEXT NOT NULL,
                metadata TEXT NOT NULL,
                uploaded_at TEXT,
                expire_at TEXT
            );
            CREATE UNIQUE INDEX deployments_app_name ON deployments (app_id, name)
                WHERE deleted_at IS NULL;

            CREATE TABLE sites (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                app_id TEXT NOT NULL REFERENCES apps(id),
                name TEXT NOT NULL,
                deployment_id TEXT REFERENCES deployments(id)
            );
            CREATE UNIQUE INDEX sites_app_name ON sites (app_id, name)
                WHERE deleted_at IS NULL;
            CREATE INDEX sites_deployment ON sites (deployment_id)
                WHERE deleted_at IS NULL;

            CREATE TABLE domains (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                domain TEXT NOT NULL,
                app_id TEXT NOT NULL REFERENCES apps(id),
                site_name TEXT NOT NULL
            );
            CREATE UNIQUE INDEX domains_domain ON domains (domain)
                WHERE deleted_at IS NULL;
            CREATE INDEX domains_app ON domains (app_id);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Run `f` inside a transaction, committing only if it succeeds
    pub fn transaction<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = Tx {
            tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
        };
        let value = f(&tx)?;
        tx.tx.commit()?;
        Ok(value)
    }
}

/// An open transaction; dropped without commit it rolls back
pub struct Tx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        deleted_at: row.get(3)?,
        config: json_column(row, 4)?,
    })
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        deleted_at: row.get(3)?,
        app_id: row.get(4)?,
        name: row.get(5)?,
        deployment_id: row.get(6)?,
    })
}

/// Deployment columns starting at `offset`
fn deployment_from_row_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get(offset)?,
        created_at: row.get(offset + 1)?,
        updated_at: row.get(offset + 2)?,
        deleted_at: row.get(offset + 3)?,
        name: row.get(offset + 4)?,
        app_id: row.get(offset + 5)?,
        storage_key_prefix: row.get(offset + 6)?,
        metadata: json_column(row, offset + 7)?,
        uploaded_at: row.get(offset + 8)?,
        expire_at: row.get(offset + 9)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    deployment_from_row_at(row, 0)
}

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        deleted_at: row.get(3)?,
        domain: row.get(4)?,
        app_id: row.get(5)?,
        site_name: row.get(6)?,
    })
}

impl Tx<'_> {
    // ==================== Apps ====================

    pub fn create_app(&self, app: &App) -> Result<()> {
        let inserted = self.tx.execute(
            "INSERT INTO apps (id, created_at, updated_at, deleted_at, config)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT (id) DO NOTHING",
            params![app.id, app.created_at, app.updated_at, serde_json::to_string(&app.config)?],
        )?;
        if inserted == 0 {
            return Err(Error::UsedName);
        }
        Ok(())
    }

    pub fn get_app(&self, id: &str) -> Result<App> {
        self.tx
            .query_row(
                &format!("SELECT {} FROM apps WHERE id = ?1 AND deleted_at IS NULL", APP_COLUMNS),
                params![id],
                app_from_row,
            )
            .optional()?
            .ok_or(Error::AppNotFound)
    }

    pub fn update_app_config(&self, id: &str, config: &AppConfig, now: DateTime<Utc>) -> Result<App> {
        let updated = self.tx.execute(
            "UPDATE apps SET config = ?2, updated_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, serde_json::to_string(config)?, now],
        )?;
        if updated == 0 {
            return Err(Error::AppNotFound);
        }
        self.get_app(id)
    }

    // ==================== Users ====================

    pub fn create_user(&self, user: &User) -> Result<()> {
        self.tx.execute(
            "INSERT INTO users (id, created_at, updated_at, deleted_at, name)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![user.id, user.created_at, user.updated_at, user.name],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.tx
            .query_row(
                "SELECT id, created_at, updated_at, deleted_at, name
                 FROM users WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                        deleted_at: row.get(3)?,
                        name: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or(Error::UserNotFound)
    }

    pub fn add_credential(&self, credential: &UserCredential) -> Result<()> {
        let inserted = self.tx.execute(
            "INSERT INTO user_credentials (id, created_at, updated_at, deleted_at, user_id)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT (id) DO NOTHING",
            params![
                credential.id,
                credential.created_at,
                credential.updated_at,
                credential.user_id
            ],
        )?;
        if inserted == 0 {
            return Err(Error::UsedName);
        }
        Ok(())
    }

    pub fn get_credential(&self, id: &str) -> Result<Option<UserCredential>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, created_at, updated_at, deleted_at, user_id
                 FROM user_credentials WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                credential_from_row,
            )
            .optional()?)
    }

    pub fn list_credentials(&self, user_id: &str) -> Result<Vec<UserCredential>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT id, created_at, updated_at, deleted_at, user_id
             FROM user_credentials WHERE user_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at",
        )?;
        let credentials = stmt
            .query_map(params![user_id], credential_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(credentials)
    }

    // ==================== Sites ====================

    /// Insert the site unless a live one with the same name exists; return the live row
    pub fn create_site_if_not_exist(&self, site: &Site) -> Result<Site> {
        self.tx.execute(
            "INSERT INTO sites (id, created_at, updated_at, deleted_at, app_id, name, deployment_id)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)
             ON CONFLICT (app_id, name) WHERE deleted_at IS NULL DO NOTHING",
            params![
                site.id,
                site.created_at,
                site.updated_at,
                site.app_id,
                site.name,
                site.deployment_id
            ],
        )?;
        self.get_site_by_name(&site.app_id, &site.name)
    }

    pub fn get_site_by_name(&self, app_id: &str, name: &str) -> Result<Site> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {} FROM sites s
                     WHERE s.app_id = ?1 AND s.name = ?2 AND s.deleted_at IS NULL",
                    SITE_COLUMNS
                ),
                params![app_id, name],
                site_from_row,
            )
            .optional()?
            .ok_or(Error::SiteNotFound)
    }

    pub fn get_site_info(&self, app_id: &str, name: &str) -> Result<SiteInfo> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {}, d.name FROM sites s
                     LEFT JOIN deployments d ON d.id = s.deployment_id AND d.deleted_at IS NULL
                     WHERE s.app_id = ?1 AND s.name = ?2 AND s.deleted_at IS NULL",
                    SITE_COLUMNS
                ),
                params![app_id, name],
                site_info_from_row,
            )
            .optional()?
            .ok_or(Error::SiteNotFound)
    }

    pub fn list_sites(&self, app_id: &str) -> Result<Vec<SiteInfo>> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "SELECT {}, d.name FROM sites s
             LEFT JOIN deployments d ON d.id = s.deployment_id AND d.deleted_at IS NULL
             WHERE s.app_id = ?1 AND s.deleted_at IS NULL
             ORDER BY s.name",
            SITE_COLUMNS
        ))?;
        let sites = stmt
            .query_map(params![app_id], site_info_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    /// Point a site at a deployment, or clear the pointer
    pub fn set_site_deployment(
        &self,
        site_id: &str,
        deployment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE sites SET deployment_id = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![site_id, deployment_id, now],
        )?;
        if updated == 0 {
            return Err(Error::SiteNotFound);
        }
        Ok(())
    }

    /// The site and the deployment it currently serves
    pub fn get_site_deployment(&self, app_id: &str, site_name: &str) -> Result<(Site, Deployment)> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {}, {} FROM sites s
                     JOIN deployments d ON d.id = s.deployment_id AND d.deleted_at IS NULL
                     WHERE s.app_id = ?1 AND s.name = ?2 AND s.deleted_at IS NULL",
                    SITE_COLUMNS, DEPLOYMENT_COLUMNS
                ),
                params![app_id, site_name],
                |row| Ok((site_from_row(row)?, deployment_from_row_at(row, 7)?)),
            )
            .optional()?
            .ok_or(Error::DeploymentNotFound)
    }

    // ==================== Deployments ====================

    pub fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let inserted = self.tx.execute(
            "INSERT INTO deployments (id, created_at, updated_at, deleted_at, name, app_id,
                                      storage_key_prefix, metadata, uploaded_at, expire_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (app_id, name) WHERE deleted_at IS NULL DO NOTHING",
            params![
                deployment.id,
                deployment.created_at,
                deployment.updated_at,
                deployment.name,
                deployment.app_id,
                deployment.storage_key_prefix,
                serde_json::to_string(&deployment.metadata)?,
                deployment.uploaded_at,
                deployment.expire_at,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::UsedName);
        }
        Ok(())
    }

    pub fn get_deployment(&self, app_id: &str, id: &str) -> Result<Deployment> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {} FROM deployments d
                     WHERE d.app_id = ?1 AND d.id = ?2 AND d.deleted_at IS NULL",
                    DEPLOYMENT_COLUMNS
                ),
                params![app_id, id],
                deployment_from_row,
            )
            .optional()?
            .ok_or(Error::DeploymentNotFound)
    }

    pub fn get_deployment_by_name(&self, app_id: &str, name: &str) -> Result<Deployment> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {} FROM deployments d
                     WHERE d.app_id = ?1 AND d.name = ?2 AND d.deleted_at IS NULL",
                    DEPLOYMENT_COLUMNS
                ),
                params![app_id, name],
                deployment_from_row,
            )
            .optional()?
            .ok_or(Error::DeploymentNotFound)
    }

    pub fn list_deployments(&self, app_id: &str) -> Result<Vec<Deployment>> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "SELECT {} FROM deployments d
             WHERE d.app_id = ?1 AND d.deleted_at IS NULL
             ORDER BY d.created_at, d.name",
            DEPLOYMENT_COLUMNS
        ))?;
        let deployments = stmt
            .query_map(params![app_id], deployment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deployments)
    }

    /// Set `uploaded_at` and the key prefix holding the uploaded files, if
    /// still unset. Zero rows means someone else won, or the deployment is
    /// gone.
    pub fn mark_deployment_uploaded(
        &self,
        app_id: &str,
        id: &str,
        storage_key_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<Deployment> {
        let updated = self.tx.execute(
            "UPDATE deployments SET uploaded_at = ?3, updated_at = ?3, storage_key_prefix = ?4
             WHERE app_id = ?1 AND id = ?2 AND deleted_at IS NULL AND uploaded_at IS NULL",
            params![app_id, id, now, storage_key_prefix],
        )?;
        if updated == 0 {
            // Distinguish a lost race from a missing row
            self.get_deployment(app_id, id)?;
            return Err(Error::AlreadyUploaded);
        }
        self.get_deployment(app_id, id)
    }

    /// Number of live sites pointing at the deployment
    pub fn count_deployment_sites(&self, deployment_id: &str) -> Result<usize> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM sites WHERE deployment_id = ?1 AND deleted_at IS NULL",
            params![deployment_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn get_deployment_site_names(&self, deployment_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT name FROM sites WHERE deployment_id = ?1 AND deleted_at IS NULL ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![deployment_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn set_deployment_expiry(
        &self,
        id: &str,
        expire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE deployments SET expire_at = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id, expire_at, now],
        )?;
        if updated == 0 {
            return Err(Error::DeploymentNotFound);
        }
        Ok(())
    }

    // ==================== Domains ====================

    pub fn create_domain(&self, domain: &Domain) -> Result<()> {
        let inserted = self.tx.execute(
            "INSERT INTO domains (id, created_at, updated_at, deleted_at, domain, app_id, site_name)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)
             ON CONFLICT (domain) WHERE deleted_at IS NULL DO NOTHING",
            params![
                domain.id,
                domain.created_at,
                domain.updated_at,
                domain.domain,
                domain.app_id,
                domain.site_name
            ],
        )?;
        if inserted == 0 {
            return Err(Error::DomainUsedName);
        }
        Ok(())
    }

    pub fn get_domain_by_name(&self, domain: &str) -> Result<Domain> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {} FROM domains WHERE domain = ?1 AND deleted_at IS NULL",
                    DOMAIN_COLUMNS
                ),
                params![domain],
                domain_from_row,
            )
            .optional()?
            .ok_or(Error::DomainNotFound)
    }

    pub fn list_domains(&self, app_id: &str) -> Result<Vec<Domain>> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "SELECT {} FROM domains WHERE app_id = ?1 AND deleted_at IS NULL ORDER BY domain",
            DOMAIN_COLUMNS
        ))?;
        let domains = stmt
            .query_map(params![app_id], domain_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(domains)
    }

    pub fn delete_domain(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE domains SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now],
        )?;
        if updated == 0 {
            return Err(Error::DomainNotFound);
        }
        Ok(())
    }
}

fn site_info_from_row(row: &Row<'_>) -> rusqlite::Result<SiteInfo> {
    Ok(SiteInfo {
        site: site_from_row(row)?,
        deployment_name: row.get(7)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<UserCredential> {
    Ok(UserCredential {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        deleted_at: row.get(3)?,
        user_id: row.get(4)?,
    })
}
