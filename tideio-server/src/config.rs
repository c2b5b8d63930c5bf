use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tideio_core::{DispatcherConfig, Result, TideError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub central_dir: PathBuf,
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("TIDEIO"))
            .build()
            .map_err(|e| TideError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TideError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            central_dir: self.central_dir.clone(),
            catalog_path: self.catalog_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tideio.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "central_dir: /tmp/tideio-central").unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8090");
        assert_eq!(config.central_dir, PathBuf::from("/tmp/tideio-central"));
        assert!(config.catalog_path.is_none());
    }
}
