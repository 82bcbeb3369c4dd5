//! Lua sources for the decision and warm-up scripts.
//!
//! The sources ship inside the binary. A deployment may point
//! `store.scripts_dir` at a directory holding its own copies, in which case
//! every script must be present there.

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::algorithm::ScriptKind;
use crate::error::{RatekeeperError, Result};

const FIXED_WINDOW: &str = include_str!("lua/fixed_window.lua");
const SLIDING_LOG: &str = include_str!("lua/sliding_log.lua");
const TOKEN_BUCKET: &str = include_str!("lua/token_bucket.lua");
const HYBRID: &str = include_str!("lua/hybrid.lua");
const WARM_UP: &str = include_str!("lua/warm_up.lua");

/// The full set of script sources, one per [`ScriptKind`].
#[derive(Debug, Clone)]
pub struct ScriptSet {
    sources: HashMap<ScriptKind, String>,
}

impl ScriptSet {
    /// The sources compiled into the crate.
    pub fn embedded() -> Self {
        let sources = ScriptKind::ALL
            .iter()
            .map(|kind| {
                let source = match kind {
                    ScriptKind::FixedWindow => FIXED_WINDOW,
                    ScriptKind::SlidingLog => SLIDING_LOG,
                    ScriptKind::TokenBucket => TOKEN_BUCKET,
                    ScriptKind::Hybrid => HYBRID,
                    ScriptKind::WarmUp => WARM_UP,
                };
                (*kind, source.to_string())
            })
            .collect();

        Self { sources }
    }

    /// Read `{name}.lua` for every script from `dir`.
    ///
    /// A missing or blank file is a configuration error: the store cannot
    /// serve decisions with an incomplete script set.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        info!(path = %dir.display(), "Loading rate limit scripts");

        let mut sources = HashMap::with_capacity(ScriptKind::ALL.len());
        for kind in ScriptKind::ALL {
            let path = dir.join(format!("{}.lua", kind.name()));
            let source = std::fs::read_to_string(&path).map_err(|e| {
                RatekeeperError::Config(format!(
                    "script source {} missing at {}: {}",
                    kind,
                    path.display(),
                    e
                ))
            })?;
            if source.trim().is_empty() {
                return Err(RatekeeperError::Config(format!(
                    "script source {} at {} is empty",
                    kind,
                    path.display()
                )));
            }
            sources.insert(kind, source);
        }

        Ok(Self { sources })
    }

    /// Resolve the script set for an optional override directory.
    pub fn resolve(dir: Option<&str>) -> Result<Self> {
        match dir {
            Some(dir) if !dir.trim().is_empty() => Self::from_dir(dir),
            _ => Ok(Self::embedded()),
        }
    }

    pub fn source(&self, kind: ScriptKind) -> &str {
        // Both constructors populate every kind.
        self.sources.get(&kind).map(String::as_str).unwrap_or_default()
    }
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::embedded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("ratekeeper-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_embedded_scripts_present() {
        let scripts = ScriptSet::embedded();
        for kind in ScriptKind::ALL {
            assert!(!scripts.source(kind).trim().is_empty(), "{} is empty", kind);
        }
        assert!(scripts.source(ScriptKind::FixedWindow).contains(":fw:"));
        assert!(scripts.source(ScriptKind::WarmUp).contains("'NX'"));
    }

    #[test]
    fn test_from_dir_loads_all() {
        let dir = temp_dir("all");
        for kind in ScriptKind::ALL {
            std::fs::write(dir.join(format!("{}.lua", kind.name())), "return {1}").unwrap();
        }

        let scripts = ScriptSet::from_dir(&dir).unwrap();
        assert_eq!(scripts.source(ScriptKind::Hybrid), "return {1}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_dir_missing_script_is_config_error() {
        let dir = temp_dir("missing");
        std::fs::write(dir.join("fixed_window.lua"), "return {1, 1}").unwrap();

        let err = ScriptSet::from_dir(&dir).unwrap_err();
        assert!(matches!(err, RatekeeperError::Config(_)));
        assert!(err.to_string().contains("sliding_log"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resolve_blank_dir_uses_embedded() {
        let scripts = ScriptSet::resolve(Some("  ")).unwrap();
        assert!(scripts.source(ScriptKind::TokenBucket).contains("math.floor"));
    }
}
