//! Loading run configuration and propagation rules from disk.

use std::io::{BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use waystage_core::propagate::RuleTableError;
use waystage_core::{RuleTable, StagingConfig, StagingConfigError};
use waystage_fs::open_utf8_file;

/// Errors raised while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// The file could not be opened.
    #[error("failed to open {path}")]
    Open {
        /// Requested path.
        path: Utf8PathBuf,
        /// Source I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The staging configuration was malformed or invalid.
    #[error("invalid staging configuration in {path}")]
    Config {
        /// Requested path.
        path: Utf8PathBuf,
        /// Parse or validation failure.
        #[source]
        source: StagingConfigError,
    },
    /// The rule table was malformed or invalid.
    #[error("invalid propagation rules in {path}")]
    Rules {
        /// Requested path.
        path: Utf8PathBuf,
        /// Parse or validation failure.
        #[source]
        source: RuleTableError,
    },
}

/// Read and validate a JSON staging configuration.
pub fn load_staging_config(path: &Utf8Path) -> Result<StagingConfig, ConfigLoadError> {
    let file = open(path)?;
    StagingConfig::from_json_reader(BufReader::new(file)).map_err(|source| {
        ConfigLoadError::Config {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Read and validate a JSON array of propagation rules.
pub fn load_rule_table(path: &Utf8Path) -> Result<RuleTable, ConfigLoadError> {
    let file = open(path)?;
    RuleTable::from_json_reader(BufReader::new(file)).map_err(|source| ConfigLoadError::Rules {
        path: path.to_path_buf(),
        source,
    })
}

fn open(path: &Utf8Path) -> Result<impl Read, ConfigLoadError> {
    open_utf8_file(path).map_err(|source| ConfigLoadError::Open {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct ConfigDir {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn config_dir() -> ConfigDir {
        let dir = TempDir::new().expect("create temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
        ConfigDir { _dir: dir, root }
    }

    fn write(dir: &ConfigDir, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.root.join(name);
        std::fs::write(path.as_std_path(), contents).expect("write file");
        path
    }

    #[rstest]
    fn loads_partial_configuration(config_dir: ConfigDir) {
        let path = write(&config_dir, "staging.json", r#"{"batch_size": 250}"#);
        let config = load_staging_config(&path).expect("load configuration");
        assert_eq!(config.batch_size, 250);
        assert!(config.propagate);
    }

    #[rstest]
    fn rejects_invalid_configuration(config_dir: ConfigDir) {
        let path = write(&config_dir, "staging.json", r#"{"batch_size": 0}"#);
        let err = load_staging_config(&path).expect_err("zero batch size");
        assert!(matches!(
            err,
            ConfigLoadError::Config {
                source: StagingConfigError::ZeroBatchSize,
                ..
            }
        ));
    }

    #[rstest]
    fn reports_missing_files(config_dir: ConfigDir) {
        let err = load_rule_table(&config_dir.root.join("rules.json")).expect_err("missing");
        assert!(matches!(err, ConfigLoadError::Open { .. }));
    }

    #[rstest]
    fn loads_rule_tables(config_dir: ConfigDir) {
        let path = write(
            &config_dir,
            "rules.json",
            r#"[{"tag": "barrier", "value": "gate", "placement": "border"}]"#,
        );
        let rules = load_rule_table(&path).expect("load rules");
        assert!(!rules.is_empty());
    }
}
