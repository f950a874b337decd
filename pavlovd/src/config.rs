use std::fs;
use std::io;

use pavlov::experiments::{builtin_catalog, AssocNetConfig, RENEWAL_RUN};
use pavlov::orchestrator::OrchestratorConfig;
use pavlov::schedule::{Catalog, CatalogError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::paths::AppPaths;

pub const DEFAULT_ADDR: &str = "127.0.0.1:9877";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub addr: String,
    /// Run started when `Start` names none.
    pub run: String,
    pub orchestrator: OrchestratorConfig,
    pub network: AssocNetConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            run: RENEWAL_RUN.to_string(),
            orchestrator: OrchestratorConfig::default(),
            network: AssocNetConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// A missing file means defaults; a malformed one is an error.
pub fn load_config(paths: &AppPaths) -> Result<DaemonConfig, ConfigError> {
    let path = paths.config_file();
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("No config at {:?}; using defaults", path);
            return Ok(DaemonConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// A missing catalog falls back to the built-in one. An invalid catalog is
/// fatal and every violation is logged.
pub fn load_catalog(paths: &AppPaths) -> Result<Catalog, CatalogError> {
    let path = paths.catalog_file();
    if !path.exists() {
        info!("No catalog at {:?}; using the built-in catalog", path);
        return builtin_catalog();
    }
    Catalog::load(&path).inspect_err(|e| {
        error!("Catalog {:?} rejected: {}", path, e);
        for v in e.violations() {
            error!("  {}", v);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> AppPaths {
        let dir = std::env::temp_dir().join(format!("pavlovd-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        AppPaths::at(dir).unwrap()
    }

    #[test]
    fn missing_files_fall_back() {
        let paths = scratch("missing");
        assert_eq!(load_config(&paths).unwrap(), DaemonConfig::default());
        assert!(load_catalog(&paths).unwrap().run(RENEWAL_RUN).is_some());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let paths = scratch("partial");
        fs::write(
            paths.config_file(),
            r#"{ "run": "Partial", "orchestrator": { "cycles_per_quarter": 3 } }"#,
        )
        .unwrap();
        let cfg = load_config(&paths).unwrap();
        assert_eq!(cfg.run, "Partial");
        assert_eq!(cfg.orchestrator.cycles_per_quarter, 3);
        assert!(cfg.orchestrator.training);
        assert_eq!(cfg.addr, DEFAULT_ADDR);
    }

    #[test]
    fn invalid_catalog_is_fatal() {
        let paths = scratch("invalid");
        fs::write(
            paths.catalog_file(),
            r#"{ "conditions": [ { "name": "C", "trial_block": "Nope" } ],
                 "runs": [ { "name": "R", "steps": ["C", "Ghost"] } ] }"#,
        )
        .unwrap();
        let err = load_catalog(&paths).unwrap_err();
        assert_eq!(err.violations().len(), 2);
    }
}
