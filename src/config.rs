use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::access::AccessRule;
use crate::host::{HostIdScheme, HostPattern};
use crate::models::is_dns_label;

/// Server configuration, loaded from TOML
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sites: SitesConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub deployments: DeploymentLimits,

    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port serving site content (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port for the management API (default: 8001)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Token granting full access to the management API.
    /// If not set, only user tokens are accepted.
    pub admin_token: Option<String>,

    /// Time allowed for in-flight connections on shutdown (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            api_port: default_api_port(),
            admin_token: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SitesConfig {
    /// Host template with a single `*` standing for the site identifier
    #[serde(default = "default_host_pattern")]
    pub host_pattern: String,

    #[serde(default)]
    pub host_id_scheme: HostIdScheme,

    /// Identifier used when the pattern capture is empty
    #[serde(default)]
    pub default_site: String,

    /// Maximum number of cached host resolutions (default: 100)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Lifetime of a cached resolution in milliseconds (default: 1000)
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            host_pattern: default_host_pattern(),
            host_id_scheme: HostIdScheme::default(),
            default_site: String::new(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl SitesConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Filesystem,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory of the filesystem backend
    #[serde(default = "default_storage_root")]
    pub root: String,

    /// Prepended to every deployment's key prefix
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: default_storage_root(),
            key_prefix: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeploymentLimits {
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for DeploymentLimits {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Secret for signing user tokens; generated at startup if absent
    pub token_secret: Option<String>,

    #[serde(default = "default_token_expiry")]
    pub token_expiry_minutes: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_expiry_minutes: default_token_expiry(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_api_port() -> u16 {
    8001
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_host_pattern() -> String {
    "http://*.localhost:8000".to_string()
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl_ms() -> u64 {
    1000
}

fn default_database_path() -> String {
    "./data/pagegate.db".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_max_files() -> usize {
    10_000
}

fn default_max_size_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_token_expiry() -> i64 {
    30
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = HostPattern::new(&self.sites.host_pattern) {
            errors.push(format!("sites.host_pattern: {}", e));
        }
        if self.sites.cache_capacity == 0 {
            errors.push("sites.cache_capacity must be greater than 0".to_string());
        }
        if self.server.port == self.server.api_port {
            errors.push("server.port and server.api_port must differ".to_string());
        }
        if self.deployments.max_files == 0 {
            errors.push("deployments.max_files must be greater than 0".to_string());
        }
        if self.auth.token_expiry_minutes <= 0 {
            errors.push("auth.token_expiry_minutes must be positive".to_string());
        }
        if self.storage.key_prefix.starts_with('/') || self.storage.key_prefix.contains("..") {
            errors.push("storage.key_prefix must be a relative key prefix".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

// ==================== App configuration ====================

/// Per-app configuration, stored with the app record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_site_name")]
    pub default_site: String,

    #[serde(default = "default_app_sites")]
    pub sites: Vec<AppSiteConfig>,

    #[serde(default)]
    pub domains: Vec<AppDomainConfig>,

    #[serde(default)]
    pub deployments: AppDeploymentsConfig,

    /// Management access to the app
    #[serde(default)]
    pub team: Vec<AccessRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppSiteConfig {
    pub name: String,

    /// Who may view the site; empty means public
    #[serde(default)]
    pub access: Vec<AccessRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppDomainConfig {
    pub domain: String,
    pub site: String,
    #[serde(default)]
    pub domain_verification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppDeploymentsConfig {
    /// Grace period before an unreferenced deployment expires (default: 1 day)
    #[serde(default = "default_deployment_ttl")]
    pub ttl_secs: u64,
}

impl Default for AppDeploymentsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_deployment_ttl(),
        }
    }
}

impl AppDeploymentsConfig {
    pub fn ttl(&self) -> chrono::Duration {
        // chrono panics above i64::MAX milliseconds
        let secs = self.ttl_secs.min((i64::MAX / 1000) as u64) as i64;
        chrono::Duration::seconds(secs)
    }
}

fn default_site_name() -> String {
    "main".to_string()
}

fn default_app_sites() -> Vec<AppSiteConfig> {
    vec![AppSiteConfig {
        name: default_site_name(),
        access: Vec::new(),
    }]
}

fn default_deployment_ttl() -> u64 {
    86_400
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_site: default_site_name(),
            sites: default_app_sites(),
            domains: Vec::new(),
            deployments: AppDeploymentsConfig::default(),
            team: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Look up a site declared in this config
    pub fn resolve_site(&self, name: &str) -> Option<&AppSiteConfig> {
        self.sites.iter().find(|s| s.name == name)
    }

    /// Look up a custom domain declared in this config
    pub fn resolve_domain(&self, domain: &str) -> Option<&AppDomainConfig> {
        self.domains
            .iter()
            .find(|d| d.domain.eq_ignore_ascii_case(domain))
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for site in &self.sites {
            if !is_dns_label(&site.name) {
                errors.push(format!("invalid site name '{}'", site.name));
            }
            if !names.insert(site.name.as_str()) {
                errors.push(format!("duplicate site '{}'", site.name));
            }
            for rule in &site.access {
                if let Err(e) = rule.validate() {
                    errors.push(format!("site '{}': {}", site.name, e));
                }
            }
        }

        if !names.contains(self.default_site.as_str()) {
            errors.push(format!("default site '{}' is not declared", self.default_site));
        }

        let mut domains = HashSet::new();
        for domain in &self.domains {
            if !domains.insert(domain.domain.to_ascii_lowercase()) {
                errors.push(format!("duplicate domain '{}'", domain.domain));
            }
            if !names.contains(domain.site.as_str()) {
                errors.push(format!(
                    "domain '{}' refers to undeclared site '{}'",
                    domain.domain, domain.site
                ));
            }
        }

        for rule in &self.team {
            if let Err(e) = rule.validate() {
                errors.push(format!("team: {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

// ==================== Site configuration ====================

/// Serving configuration captured with each deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SiteConfig {
    /// Directory inside the deployment that is served as the site root
    #[serde(default)]
    pub public: String,
}

impl SiteConfig {
    pub fn validate(&self) -> Result<(), String> {
        let public = self.public.trim_matches('/');
        if self.public.starts_with('/') {
            return Err("public directory must be relative".to_string());
        }
        if public
            .split('/')
            .any(|part| part == ".." || part == "." || (part.is_empty() && !public.is_empty()))
            || public.contains('\\')
        {
            return Err(format!("public directory '{}' is not a clean path", self.public));
        }
        Ok(())
    }

    /// Public directory as a key fragment: empty, or ending with '/'
    pub fn public_prefix(&self) -> String {
        let public = self.public.trim_matches('/');
        if public.is_empty() {
            String::new()
        } else {
            format!("{}/", public)
        }
    }
}
