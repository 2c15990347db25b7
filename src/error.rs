//! Error taxonomy and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::archive::ArchiveError;
use crate::storage::StorageError;

/// Coarse classification of an [`Error`], used at the HTTP boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Unauthorized,
    Forbidden,
    Internal,
}

/// Errors returned by resolution and lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("site not found")]
    SiteNotFound,
    #[error("deployment not found")]
    DeploymentNotFound,
    #[error("domain not found")]
    DomainNotFound,
    #[error("app not found")]
    AppNotFound,
    #[error("user not found")]
    UserNotFound,

    #[error("name is already in use")]
    UsedName,
    #[error("deployment is already uploaded")]
    AlreadyUploaded,
    #[error("domain is already in use by another app")]
    DomainUsedName,

    #[error("too many files: {count} exceeds limit of {max}")]
    TooManyFiles { count: usize, max: usize },
    #[error("deployment too large: {size} bytes exceeds limit of {max} bytes")]
    DeploymentTooLarge { size: u64, max: u64 },
    #[error("site is not defined in app config")]
    UndefinedSite,
    #[error("domain is not defined in app config")]
    UndefinedDomain,
    #[error("domain verification is not supported")]
    DomainVerificationNotSupported,
    #[error("deployment is not uploaded")]
    DeploymentNotUploaded,
    #[error("deployment is expired")]
    DeploymentExpired,
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid file entry: {0}")]
    InvalidFileEntry(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("authentication required")]
    Unauthorized,
    #[error("access denied")]
    Forbidden,

    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(anyhow::Error::new(err).context("database error"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(anyhow::Error::new(err).context("malformed stored document"))
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SiteNotFound
            | Error::DeploymentNotFound
            | Error::DomainNotFound
            | Error::AppNotFound
            | Error::UserNotFound => ErrorKind::NotFound,
            Error::UsedName | Error::AlreadyUploaded | Error::DomainUsedName => ErrorKind::Conflict,
            Error::TooManyFiles { .. }
            | Error::DeploymentTooLarge { .. }
            | Error::UndefinedSite
            | Error::UndefinedDomain
            | Error::DomainVerificationNotSupported
            | Error::DeploymentNotUploaded
            | Error::DeploymentExpired
            | Error::InvalidName(_)
            | Error::InvalidFileEntry(_)
            | Error::InvalidConfig(_)
            | Error::InvalidRequest(_)
            | Error::Archive(_) => ErrorKind::Validation,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Forbidden => ErrorKind::Forbidden,
            Error::Storage(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    /// Wire error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::SiteNotFound => ErrorCode::SiteNotFound,
            Error::DeploymentNotFound => ErrorCode::DeploymentNotFound,
            Error::DomainNotFound => ErrorCode::DomainNotFound,
            Error::AppNotFound => ErrorCode::AppNotFound,
            Error::UserNotFound => ErrorCode::UserNotFound,
            Error::UsedName => ErrorCode::UsedName,
            Error::AlreadyUploaded => ErrorCode::AlreadyUploaded,
            Error::DomainUsedName => ErrorCode::DomainUsedName,
            Error::TooManyFiles { .. } => ErrorCode::TooManyFiles,
            Error::DeploymentTooLarge { .. } => ErrorCode::DeploymentTooLarge,
            Error::UndefinedSite => ErrorCode::UndefinedSite,
            Error::UndefinedDomain => ErrorCode::UndefinedDomain,
            Error::DomainVerificationNotSupported => ErrorCode::DomainVerificationNotSupported,
            Error::DeploymentNotUploaded => ErrorCode::DeploymentNotUploaded,
            Error::DeploymentExpired => ErrorCode::DeploymentExpired,
            Error::Archive(_) => ErrorCode::InvalidArchive,
            Error::InvalidName(_)
            | Error::InvalidFileEntry(_)
            | Error::InvalidConfig(_)
            | Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Error::Unauthorized => ErrorCode::Unauthorized,
            Error::Forbidden => ErrorCode::Forbidden,
            Error::Storage(_) | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }

    /// Message safe to show to a client; internal detail stays in the logs
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.public_message())
    }
}

/// Error codes rendered in JSON bodies and the X-Pagegate-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Generic not found on the serving path
    NotFound,
    MethodNotAllowed,
    SiteNotFound,
    DeploymentNotFound,
    DomainNotFound,
    AppNotFound,
    UserNotFound,
    UsedName,
    AlreadyUploaded,
    DomainUsedName,
    TooManyFiles,
    DeploymentTooLarge,
    UndefinedSite,
    UndefinedDomain,
    DomainVerificationNotSupported,
    DeploymentNotUploaded,
    DeploymentExpired,
    InvalidArchive,
    InvalidRequest,
    Unauthorized,
    Forbidden,
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound
            | ErrorCode::SiteNotFound
            | ErrorCode::DeploymentNotFound
            | ErrorCode::DomainNotFound
            | ErrorCode::AppNotFound
            | ErrorCode::UserNotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            // Name clashes stay 400 for compatibility with existing clients
            ErrorCode::UsedName | ErrorCode::DomainUsedName => StatusCode::BAD_REQUEST,
            ErrorCode::AlreadyUploaded => StatusCode::CONFLICT,
            ErrorCode::TooManyFiles
            | ErrorCode::DeploymentTooLarge
            | ErrorCode::UndefinedSite
            | ErrorCode::UndefinedDomain
            | ErrorCode::DomainVerificationNotSupported
            | ErrorCode::DeploymentNotUploaded
            | ErrorCode::DeploymentExpired
            | ErrorCode::InvalidArchive
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Pagegate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::SiteNotFound => "SITE_NOT_FOUND",
            ErrorCode::DeploymentNotFound => "DEPLOYMENT_NOT_FOUND",
            ErrorCode::DomainNotFound => "DOMAIN_NOT_FOUND",
            ErrorCode::AppNotFound => "APP_NOT_FOUND",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::UsedName => "USED_NAME",
            ErrorCode::AlreadyUploaded => "ALREADY_UPLOADED",
            ErrorCode::DomainUsedName => "DOMAIN_USED_NAME",
            ErrorCode::TooManyFiles => "TOO_MANY_FILES",
            ErrorCode::DeploymentTooLarge => "DEPLOYMENT_TOO_LARGE",
            ErrorCode::UndefinedSite => "UNDEFINED_SITE",
            ErrorCode::UndefinedDomain => "UNDEFINED_DOMAIN",
            ErrorCode::DomainVerificationNotSupported => "DOMAIN_VERIFICATION_NOT_SUPPORTED",
            ErrorCode::DeploymentNotUploaded => "DEPLOYMENT_NOT_UPLOADED",
            ErrorCode::DeploymentExpired => "DEPLOYMENT_EXPIRED",
            ErrorCode::InvalidArchive => "INVALID_ARCHIVE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Pagegate-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(Full::new(Bytes::from(error.to_json())).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        "x-pagegate-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
