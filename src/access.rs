//! Access control lists for site viewing and app management
//!
//! A rule names one or more subjects and the level it grants. Requests
//! present credentials (peer address, user id, linked logins), and a rule
//! applies when any of its subjects matches any credential.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A fact about the requester
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    Ip(IpAddr),
    User(String),
    GitHubUser(String),
}

impl Credential {
    /// Peer address credential, with IPv4-mapped IPv6 folded to IPv4
    pub fn ip(addr: IpAddr) -> Self {
        Credential::Ip(addr.to_canonical())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Ip(ip) => write!(f, "ip:{}", ip),
            Credential::User(id) => write!(f, "user:{}", id),
            Credential::GitHubUser(login) => write!(f, "github:{}", login),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Read,
    Deploy,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_user: Option<String>,

    /// CIDR block or single address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,

    #[serde(default)]
    pub access: AccessLevel,
}

impl AccessRule {
    pub fn user(id: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            user: Some(id.into()),
            github_user: None,
            ip_range: None,
            access,
        }
    }

    pub fn github_user(login: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            user: None,
            github_user: Some(login.into()),
            ip_range: None,
            access,
        }
    }

    pub fn ip_range(range: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            user: None,
            github_user: None,
            ip_range: Some(range.into()),
            access,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.user.is_none() && self.github_user.is_none() && self.ip_range.is_none() {
            return Err("access rule has no subject".to_string());
        }
        if let Some(range) = &self.ip_range {
            if parse_ip_range(range).is_none() {
                return Err(format!("invalid ip_range '{}'", range));
            }
        }
        Ok(())
    }

    /// Whether any subject of this rule matches the credential
    pub fn matches(&self, credential: &Credential) -> bool {
        match credential {
            Credential::Ip(ip) => self
                .ip_range
                .as_deref()
                .and_then(parse_ip_range)
                .is_some_and(|net| net.contains(ip)),
            Credential::User(id) => self.user.as_deref() == Some(id.as_str()),
            Credential::GitHubUser(login) => self
                .github_user
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(login)),
        }
    }
}

fn parse_ip_range(range: &str) -> Option<IpNet> {
    let range = range.trim();
    range
        .parse::<IpNet>()
        .ok()
        .or_else(|| range.parse::<IpAddr>().ok().map(IpNet::from))
}

/// Decide whether the credentials reach `required` under `rules`.
///
/// An empty rule list grants everything. Otherwise some rule at or above
/// the required level must match some credential.
pub fn evaluate(rules: &[AccessRule], credentials: &[Credential], required: AccessLevel) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules
        .iter()
        .filter(|rule| rule.access >= required)
        .any(|rule| credentials.iter().any(|c| rule.matches(c)))
}

/// Highest level granted by any matching rule. An empty list grants nothing.
pub fn max_access(rules: &[AccessRule], credentials: &[Credential]) -> Option<AccessLevel> {
    rules
        .iter()
        .filter(|rule| credentials.iter().any(|c| rule.matches(c)))
        .map(|rule| rule.access)
        .max()
}
