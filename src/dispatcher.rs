//! Per-request serving decision
//!
//! Resolution failures that mean "no such site" and access denials both
//! render as the same 404, so a restricted site cannot be told apart from
//! a missing one.

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Method, Response};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, Span};

use crate::access::{self, AccessLevel, Credential};
use crate::content::SiteContent;
use crate::error::{json_error_response, ErrorCode};
use crate::resolver::ResolutionCache;

pub struct RequestDispatcher {
    cache: Arc<ResolutionCache>,
    content: Arc<dyn SiteContent>,
}

impl RequestDispatcher {
    pub fn new(cache: Arc<ResolutionCache>, content: Arc<dyn SiteContent>) -> Self {
        Self { cache, content }
    }

    pub async fn serve(
        &self,
        host: &str,
        method: &Method,
        path: &str,
        remote: IpAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let site = match self.cache.load(host).await {
            Ok(site) => site,
            Err(e) if e.is_not_found() => return site_not_found(),
            Err(e) => {
                error!(host, error = %e, "Failed to resolve site");
                return json_error_response(ErrorCode::InternalError, "internal server error");
            }
        };

        let credentials = [Credential::ip(remote)];
        if !access::evaluate(&site.access, &credentials, AccessLevel::Read) {
            debug!(site = %site.id, remote = %remote, "Access denied");
            return site_not_found();
        }

        Span::current().record("site", site.id.as_str());

        match self.content.serve(&site, method, path).await {
            Ok(response) => response,
            Err(e) => {
                error!(site = %site.id, path, error = %e, "Failed to serve content");
                e.to_response()
            }
        }
    }
}

fn site_not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(ErrorCode::SiteNotFound, "site not found")
}
