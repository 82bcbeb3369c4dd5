//! Base key generation for rate limit scopes.
//!
//! The key space is shared with every other process deciding against the
//! same store, so the formats here must never change.

use serde::{Deserialize, Serialize};

/// Prefix shared by every rate limit key.
pub const KEY_PREFIX: &str = "rl";

/// Bucket seeded once at service start.
pub const GLOBAL_WARM_UP_KEY: &str = "rl:bucket";

/// The dimension a limit is applied over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// One budget per caller IP address
    #[default]
    Ip,
    /// One budget per authenticated user
    User,
    /// A single budget shared by all callers
    Global,
}

impl std::str::FromStr for ScopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(ScopeKind::Ip),
            "user" => Ok(ScopeKind::User),
            "global" => Ok(ScopeKind::Global),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// A resolved scope, carrying the identity the key is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Ip(String),
    User(String),
    Global,
}

impl Scope {
    /// Build the canonical base key for this scope.
    pub fn base_key(&self) -> String {
        match self {
            Scope::Ip(addr) => format!("{}:ip:{}", KEY_PREFIX, addr),
            Scope::User(id) => format!("{}:user:{}", KEY_PREFIX, id),
            Scope::Global => format!("{}:global", KEY_PREFIX),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Ip(_) => ScopeKind::Ip,
            Scope::User(_) => ScopeKind::User,
            Scope::Global => ScopeKind::Global,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_key())
    }
}

/// Caller identity as extracted by the request pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Remote address, already resolved through any trusted proxy headers
    pub ip: Option<String>,
    /// Authenticated user claim, if the caller is signed in
    pub user: Option<String>,
}

/// Identity used when the pipeline could not determine a remote address.
const UNKNOWN_IP: &str = "unknown";

impl Identity {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Resolve the scope for this identity.
    ///
    /// A user scope without an authenticated user falls back to the IP scope,
    /// so anonymous callers still share a per-address budget.
    pub fn scope(&self, kind: ScopeKind) -> Scope {
        match kind {
            ScopeKind::Global => Scope::Global,
            ScopeKind::User => match non_blank(self.user.as_deref()) {
                Some(user) => Scope::User(user.to_string()),
                None => self.ip_scope(),
            },
            ScopeKind::Ip => self.ip_scope(),
        }
    }

    fn ip_scope(&self) -> Scope {
        let ip = non_blank(self.ip.as_deref()).unwrap_or(UNKNOWN_IP);
        Scope::Ip(ip.to_string())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
