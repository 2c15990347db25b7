//! Management API
//!
//! RESTful endpoints for apps, sites, deployments, domains and users. Every
//! route under `/api/v1` requires a bearer token: either the configured
//! admin token, or a user token checked against the app's team ACL.

use chrono::{DateTime, Utc};
use futures::{future, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

use crate::access::{self, AccessLevel, AccessRule, Credential};
use crate::auth::AuthManager;
use crate::config::{AppConfig, SiteConfig};
use crate::domains::DomainManager;
use crate::error::{Error, Result};
use crate::host::{HostIdScheme, HostPattern};
use crate::lifecycle::DeploymentLifecycle;
use crate::models::{
    is_dns_label, validate_credential_id, App, DeploymentStatus, DeploymentWithSites, Domain,
    FileEntry, SiteInfo, User, UserCredential,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const API_PREFIX: &str = "/api/v1/";

/// Largest accepted JSON request body
const MAX_JSON_BODY: usize = 1024 * 1024;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ==================== Requests ====================

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub id: String,
    #[serde(default)]
    pub config: AppConfig,
}

#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSiteRequest {
    /// New deployment; empty unassigns, absent keeps the current one
    #[serde(default)]
    pub deployment_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub site_config: SiteConfig,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    /// Credential id such as `github:octocat`
    pub credential: String,
}

// ==================== Responses ====================

#[derive(Debug, Serialize)]
pub struct SiteView {
    pub id: String,
    pub name: String,
    pub deployment_name: Option<String>,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deployment without its file manifest
#[derive(Debug, Serialize)]
pub struct DeploymentView {
    pub id: String,
    pub name: String,
    pub status: DeploymentStatus,
    pub site_names: Vec<String>,
    pub file_count: usize,
    pub total_size: u64,
    pub site_config: SiteConfig,
    pub created_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct UserTokenView {
    pub user: User,
    pub token: String,
}

// ==================== Callers ====================

/// Authenticated API caller
#[derive(Debug, Clone)]
pub enum Caller {
    Admin,
    User {
        user: User,
        credentials: Vec<Credential>,
    },
}

impl Caller {
    fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

/// Management API request handler
pub struct ManagementApi {
    lifecycle: Arc<DeploymentLifecycle>,
    domains: DomainManager,
    auth: AuthManager,
    admin_token: Option<String>,
    pattern: HostPattern,
    scheme: HostIdScheme,
}

impl ManagementApi {
    pub fn new(
        lifecycle: Arc<DeploymentLifecycle>,
        auth: AuthManager,
        admin_token: Option<String>,
        pattern: HostPattern,
        scheme: HostIdScheme,
    ) -> Self {
        let domains = DomainManager::new(lifecycle.db().clone(), Arc::clone(lifecycle.clock()));
        Self {
            lifecycle,
            domains,
            auth,
            admin_token,
            pattern,
            scheme,
        }
    }

    /// Handle one API request
    pub async fn handle<B>(&self, req: Request<B>, remote: IpAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        // Health check - no auth required
        if path == "/health" && method == Method::GET {
            return json_response(StatusCode::OK, r#"{"status":"ok"}"#);
        }

        // Version - no auth required
        if path == "/version" && method == Method::GET {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version.to_string());
        }

        let result = match self.authenticate(&req, remote) {
            Ok(caller) => self.route(caller, &method, &path, req).await,
            Err(e) => {
                warn!(%path, "Unauthorized API request");
                Err(e)
            }
        };

        result.unwrap_or_else(|e| {
            if e.is_internal() {
                error!(%method, %path, error = %e, "API error");
            }
            error_response(&e)
        })
    }

    async fn route<B>(
        &self,
        caller: Caller,
        method: &Method,
        path: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let Some(rest) = path.strip_prefix(API_PREFIX) else {
            return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
        };
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            // Apps
            (&Method::POST, ["apps"]) => self.create_app(&caller, req).await,
            (&Method::GET, ["apps", app]) => self.get_app(&caller, app),
            (&Method::PUT, ["apps", app, "config"]) => self.set_app_config(&caller, app, req).await,

            // Sites
            (&Method::GET, ["apps", app, "sites"]) => self.list_sites(&caller, app),
            (&Method::POST, ["apps", app, "sites"]) => self.create_site(&caller, app, req).await,
            (&Method::PATCH, ["apps", app, "sites", site]) => {
                self.update_site(&caller, app, site, req).await
            }

            // Deployments
            (&Method::GET, ["apps", app, "deployments"]) => self.list_deployments(&caller, app),
            (&Method::POST, ["apps", app, "deployments"]) => {
                self.create_deployment(&caller, app, req).await
            }
            (&Method::GET, ["apps", app, "deployments", name]) => {
                self.get_deployment(&caller, app, name)
            }
            (&Method::PUT, ["apps", app, "deployments", name, "tarball"]) => {
                self.upload_deployment(&caller, app, name, req).await
            }

            // Domains
            (&Method::GET, ["apps", app, "domains"]) => self.list_domains(&caller, app),
            (&Method::POST, ["apps", app, "domains", domain]) => {
                self.activate_domain(&caller, app, domain)
            }
            (&Method::DELETE, ["apps", app, "domains", domain]) => {
                self.deactivate_domain(&caller, app, domain)
            }

            // Users
            (&Method::POST, ["users"]) => self.create_user(&caller, req).await,

            _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        }
    }

    // ==================== Authentication ====================

    fn authenticate<B>(&self, req: &Request<B>, remote: IpAddr) -> Result<Caller> {
        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.auth.extract_token_from_header(v))
            .ok_or(Error::Unauthorized)?;

        if self.admin_token.as_deref() == Some(token.as_str()) {
            return Ok(Caller::Admin);
        }

        let claims = self
            .auth
            .verify_token(&token)
            .map_err(|e| {
                debug!(error = %e, "Rejected user token");
                Error::Unauthorized
            })?
            .claims;

        let (user, linked) = self
            .lifecycle
            .db()
            .transaction(|tx| {
                let user = tx.get_user(&claims.sub)?;
                let linked = tx.list_credentials(&user.id)?;
                Ok((user, linked))
            })
            .map_err(|e| if e.is_not_found() { Error::Unauthorized } else { e })?;

        let mut credentials = vec![Credential::User(user.id.clone())];
        credentials.extend(linked.iter().filter_map(UserCredential::credential));
        credentials.push(Credential::ip(remote));

        Ok(Caller::User { user, credentials })
    }

    /// Load the app if the caller holds at least `required` on it.
    ///
    /// Callers without any access get `AppNotFound` so app names do not leak.
    fn authorize(&self, caller: &Caller, app_id: &str, required: AccessLevel) -> Result<App> {
        let app = self.lifecycle.db().transaction(|tx| tx.get_app(app_id))?;
        match caller {
            Caller::Admin => Ok(app),
            Caller::User { credentials, .. } => {
                match access::max_access(&app.config.team, credentials) {
                    None => Err(Error::AppNotFound),
                    Some(level) if level < required => Err(Error::Forbidden),
                    Some(_) => Ok(app),
                }
            }
        }
    }

    // ==================== Apps ====================

    async fn create_app<B>(&self, caller: &Caller, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let CreateAppRequest { id, mut config } = read_json(req).await?;

        if !is_dns_label(&id) {
            return Err(Error::InvalidName(id));
        }
        if let Caller::User { user, .. } = caller {
            config.team.push(AccessRule::user(user.id.clone(), AccessLevel::Admin));
        }
        config.validate().map_err(Error::InvalidConfig)?;

        let app = App::new(self.lifecycle.clock().now(), id, config);
        self.lifecycle.db().transaction(|tx| tx.create_app(&app))?;

        info!(app = %app.id, admin = caller.is_admin(), "Created new app");
        ok_json(StatusCode::CREATED, &app)
    }

    fn get_app(&self, caller: &Caller, app_id: &str) -> Result<Response<Full<Bytes>>> {
        let app = self.authorize(caller, app_id, AccessLevel::Read)?;
        ok_json(StatusCode::OK, &app)
    }

    async fn set_app_config<B>(
        &self,
        caller: &Caller,
        app_id: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        self.authorize(caller, app_id, AccessLevel::Admin)?;
        let config: AppConfig = read_json(req).await?;
        config.validate().map_err(Error::InvalidConfig)?;

        let now = self.lifecycle.clock().now();
        let app = self
            .lifecycle
            .db()
            .transaction(|tx| tx.update_app_config(app_id, &config, now))?;

        info!(app = %app_id, "App config updated");
        ok_json(StatusCode::OK, &app)
    }

    // ==================== Sites ====================

    fn site_view(&self, app: &App, info: SiteInfo) -> SiteView {
        let site = (info.site.name != app.config.default_site).then_some(info.site.name.as_str());
        let url = self.pattern.site_url(&self.scheme.make(&app.id, site));
        SiteView {
            url,
            id: info.site.id,
            name: info.site.name,
            deployment_name: info.deployment_name,
            created_at: info.site.created_at,
            updated_at: info.site.updated_at,
        }
    }

    fn list_sites(&self, caller: &Caller, app_id: &str) -> Result<Response<Full<Bytes>>> {
        let app = self.authorize(caller, app_id, AccessLevel::Read)?;
        let sites: Vec<SiteView> = self
            .lifecycle
            .list_sites(app_id)?
            .into_iter()
            .map(|info| self.site_view(&app, info))
            .collect();
        ok_json(StatusCode::OK, &sites)
    }

    async fn create_site<B>(
        &self,
        caller: &Caller,
        app_id: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let app = self.authorize(caller, app_id, AccessLevel::Deploy)?;
        let CreateSiteRequest { name } = read_json(req).await?;

        let info = self.lifecycle.create_site(app_id, &name)?;
        ok_json(StatusCode::CREATED, &self.site_view(&app, info))
    }

    async fn update_site<B>(
        &self,
        caller: &Caller,
        app_id: &str,
        site: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let app = self.authorize(caller, app_id, AccessLevel::Deploy)?;
        let UpdateSiteRequest { deployment_name } = read_json(req).await?;

        // Absent leaves the assignment alone; empty unassigns
        let info = match deployment_name {
            Some(name) => self.lifecycle.assign_site(app_id, site, &name)?,
            None => self.lifecycle.get_site(app_id, site)?,
        };
        ok_json(StatusCode::OK, &self.site_view(&app, info))
    }

    // ==================== Deployments ====================

    fn deployment_view(&self, item: DeploymentWithSites) -> DeploymentView {
        let now = self.lifecycle.clock().now();
        let DeploymentWithSites {
            deployment,
            site_names,
        } = item;

        DeploymentView {
            status: deployment.status(now, !site_names.is_empty()),
            id: deployment.id,
            name: deployment.name,
            file_count: deployment.metadata.files.len(),
            total_size: deployment.metadata.total_size(),
            site_config: deployment.metadata.config,
            site_names,
            created_at: deployment.created_at,
            uploaded_at: deployment.uploaded_at,
            expire_at: deployment.expire_at,
        }
    }

    fn list_deployments(&self, caller: &Caller, app_id: &str) -> Result<Response<Full<Bytes>>> {
        self.authorize(caller, app_id, AccessLevel::Read)?;
        let deployments: Vec<DeploymentView> = self
            .lifecycle
            .list_deployments(app_id)?
            .into_iter()
            .map(|item| self.deployment_view(item))
            .collect();
        ok_json(StatusCode::OK, &deployments)
    }

    fn get_deployment(&self, caller: &Caller, app_id: &str, name: &str) -> Result<Response<Full<Bytes>>> {
        self.authorize(caller, app_id, AccessLevel::Read)?;
        let item = self.lifecycle.get_deployment(app_id, name)?;
        ok_json(StatusCode::OK, &self.deployment_view(item))
    }

    async fn create_deployment<B>(
        &self,
        caller: &Caller,
        app_id: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        self.authorize(caller, app_id, AccessLevel::Deploy)?;
        let CreateDeploymentRequest {
            name,
            files,
            site_config,
        } = read_json(req).await?;

        let deployment = self
            .lifecycle
            .create_deployment(app_id, &name, files, site_config)?;
        let item = DeploymentWithSites {
            deployment,
            site_names: Vec::new(),
        };
        ok_json(StatusCode::CREATED, &self.deployment_view(item))
    }

    async fn upload_deployment<B>(
        &self,
        caller: &Caller,
        app_id: &str,
        name: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        self.authorize(caller, app_id, AccessLevel::Deploy)?;

        let data = BodyStream::new(req.into_body())
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
            .map_err(io::Error::other);
        let reader = StreamReader::new(data.boxed());

        let deployment = self.lifecycle.upload_deployment(app_id, name, reader).await?;
        let site_names = self
            .lifecycle
            .db()
            .transaction(|tx| tx.get_deployment_site_names(&deployment.id))?;
        let item = DeploymentWithSites {
            deployment,
            site_names,
        };
        ok_json(StatusCode::OK, &self.deployment_view(item))
    }

    // ==================== Domains ====================

    fn list_domains(&self, caller: &Caller, app_id: &str) -> Result<Response<Full<Bytes>>> {
        self.authorize(caller, app_id, AccessLevel::Read)?;
        let domains: Vec<Domain> = self.domains.list_domains(app_id)?;
        ok_json(StatusCode::OK, &domains)
    }

    fn activate_domain(&self, caller: &Caller, app_id: &str, domain: &str) -> Result<Response<Full<Bytes>>> {
        self.authorize(caller, app_id, AccessLevel::Admin)?;
        let domain = self.domains.activate_domain(app_id, domain)?;
        ok_json(StatusCode::OK, &domain)
    }

    fn deactivate_domain(&self, caller: &Caller, app_id: &str, domain: &str) -> Result<Response<Full<Bytes>>> {
        self.authorize(caller, app_id, AccessLevel::Admin)?;
        self.domains.deactivate_domain(app_id, domain)?;
        ok_json(StatusCode::OK, &serde_json::json!({ "domain": domain }))
    }

    // ==================== Users ====================

    async fn create_user<B>(&self, caller: &Caller, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        if !caller.is_admin() {
            return Err(Error::Forbidden);
        }
        let CreateUserRequest { name, credential } = read_json(req).await?;
        validate_credential_id(&credential)?;
        if name.trim().is_empty() {
            return Err(Error::InvalidRequest("user name cannot be empty".to_string()));
        }

        let now = self.lifecycle.clock().now();
        let user = self.lifecycle.db().transaction(|tx| {
            if let Some(existing) = tx.get_credential(&credential)? {
                return tx.get_user(&existing.user_id);
            }
            let user = User::new(now, name.trim());
            tx.create_user(&user)?;
            tx.add_credential(&UserCredential::new(now, credential.as_str(), user.id.as_str()))?;
            info!(user = %user.id, credential = %credential, "Created user");
            Ok(user)
        })?;

        let token = self
            .auth
            .create_token(&user.id, &user.name)
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("failed to sign token")))?;
        ok_json(StatusCode::OK, &UserTokenView { user, token })
    }
}

// ==================== Server ====================

/// Management API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    api: Arc<ManagementApi>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, api: Arc<ManagementApi>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            api,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Management API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self.api);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(api, stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(api: Arc<ManagementApi>, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let api = Arc::clone(&api);
        async move { Ok::<_, hyper::Error>(api.handle(req, addr.ip()).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

// ==================== Helpers ====================

async fn read_json<T, B>(req: Request<B>) -> Result<T>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    let body = Limited::new(req.into_body(), MAX_JSON_BODY)
        .collect()
        .await
        .map_err(|e| Error::InvalidRequest(format!("failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| Error::InvalidRequest(format!("invalid JSON: {}", e)))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn ok_json<T: Serialize>(status: StatusCode, data: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_string(&ApiResponse::ok(data))?))
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false,"error":"internal server error"}"#.to_string());
    json_response(status, body)
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let code = err.code();
    let mut response = json_error(err.status_code(), err.public_message());
    response
        .headers_mut()
        .insert("x-pagegate-error", HeaderValue::from_static(code.as_header_value()));
    response
}
