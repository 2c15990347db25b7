//! Pagegate - multi-tenant static site hosting
//!
//! This library provides:
//! - Host based resolution of apps, sites and custom domains to deployments
//! - A single-flight resolution cache in front of the database
//! - Serving of deployment files from object storage with per-site ACLs
//! - Deployment lifecycle management: create, streamed tarball upload,
//!   site assignment and time based expiry
//! - A token authenticated management API

pub mod access;
pub mod api;
pub mod archive;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod content;
pub mod db;
pub mod dispatcher;
pub mod domains;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod models;
pub mod resolver;
pub mod server;
pub mod site;
pub mod storage;

pub use error::{Error, Result};
