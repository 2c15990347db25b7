//! Serving deployment files from object storage

use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::sync::Arc;

use crate::archive::is_safe_path;
use crate::error::{json_error_response, ErrorCode, Result};
use crate::site::Descriptor;
use crate::storage::{ObjectStorage, StorageError};

const INDEX_FILE: &str = "index.html";

/// Produces the response for a resolved, authorized site request
#[async_trait]
pub trait SiteContent: Send + Sync {
    async fn serve(
        &self,
        site: &Descriptor,
        method: &Method,
        path: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>>;
}

pub struct StorageContent {
    storage: Arc<dyn ObjectStorage>,
}

impl StorageContent {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        match self.storage.get(key).await {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) | Err(StorageError::InvalidKey(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Candidate file paths for a request path, in lookup order.
///
/// The path is percent-decoded first; paths that do not decode to UTF-8
/// have no candidates.
fn candidates(path: &str) -> Option<Vec<String>> {
    let decoded = urlencoding::decode(path).ok()?;
    let path = decoded.trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        let file = format!("{}{}", path, INDEX_FILE);
        return is_safe_path(&file).then(|| vec![file]);
    }
    if !is_safe_path(path) {
        return None;
    }

    let mut files = vec![path.to_string()];
    let last = path.rsplit('/').next().unwrap_or(path);
    if !last.contains('.') {
        files.push(format!("{}/{}", path, INDEX_FILE));
    }
    Some(files)
}

#[async_trait]
impl SiteContent for StorageContent {
    async fn serve(
        &self,
        site: &Descriptor,
        method: &Method,
        path: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        if *method != Method::GET && *method != Method::HEAD {
            let mut response = json_error_response(ErrorCode::MethodNotAllowed, "method not allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return Ok(response);
        }

        let Some(files) = candidates(path) else {
            return Ok(not_found());
        };

        let base = format!("{}{}", site.storage_key_prefix, site.config.public_prefix());
        for file in files {
            if let Some(data) = self.fetch(&format!("{}{}", base, file)).await? {
                return Ok(file_response(method, &file, data));
            }
        }
        Ok(not_found())
    }
}

fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(ErrorCode::NotFound, "not found")
}

fn file_response(method: &Method, file: &str, data: Bytes) -> Response<BoxBody<Bytes, hyper::Error>> {
    let length = data.len();
    let body = if *method == Method::HEAD {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    } else {
        Full::new(data).map_err(|never| match never {}).boxed()
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(detect_mime_type(file)));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

/// Content type from the file extension
pub fn detect_mime_type(path: &str) -> &'static str {
    let file = path.rsplit('/').next().unwrap_or(path);
    let extension = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        // Text
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",

        // Images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "avif" => "image/avif",

        // Fonts
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",

        // Documents and media
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",

        "wasm" => "application/wasm",
        "webmanifest" => "application/manifest+json",

        _ => "application/octet-stream",
    }
}
