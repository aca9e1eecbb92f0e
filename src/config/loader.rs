//! Configuration File Loading
//!
//! Finds the configuration file along a search path, parses it as TOML or
//! JSON depending on the extension, and validates the result.

use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::Config;
use crate::error::{Error, Result};

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "FWPILOT_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// JSON for `.json` files, TOML for everything else
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Json => "JSON",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Toml => "toml",
            ConfigFormat::Json => "json",
        }
    }

    pub fn parse<T: DeserializeOwned>(&self, content: &str) -> Result<T> {
        let parsed = match self {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|reason| Error::ConfigParseFailed {
            format: self.name().to_string(),
            reason,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Fall back to built-in defaults when no file is found
    pub use_defaults: bool,
    /// Whether to validate configuration after loading
    pub validate: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_defaults: true,
            validate: true,
        }
    }
}

/// Configuration file loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// File given on the command line; must exist when set
    explicit: Option<PathBuf>,
    /// Base paths tried in order, each with every supported extension
    search_paths: Vec<PathBuf>,
    supported_formats: Vec<ConfigFormat>,
    current_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit: None,
            search_paths: Self::default_search_paths(),
            supported_formats: vec![ConfigFormat::Toml, ConfigFormat::Json],
            current_path: None,
        }
    }

    /// Use `path` instead of searching
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    /// Search only under `path`
    pub fn set_search_path(&mut self, path: PathBuf) {
        self.search_paths = vec![path];
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// File the last successful load read from
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    pub fn load(&mut self) -> Result<Config> {
        self.load_with_options(LoadOptions::default())
    }

    pub fn load_with_options(&mut self, options: LoadOptions) -> Result<Config> {
        let found = match self.explicit.clone() {
            Some(path) => Some((Self::load_file(&path)?, path)),
            None => self.find_and_load(),
        };

        let config = match found {
            Some((config, path)) => {
                info!("Loaded configuration from {}", path.display());
                self.current_path = Some(path);
                config
            }
            None if options.use_defaults => {
                debug!("No configuration file found, using defaults");
                Config::default()
            }
            None => {
                return Err(Error::config(format!(
                    "no configuration file found (searched {} location(s))",
                    self.search_paths.len()
                )))
            }
        };

        if options.validate {
            config.validate()?;
        }
        Ok(config)
    }

    /// Read and parse one file, format chosen by extension
    pub fn load_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|e| Error::ConfigLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        ConfigFormat::from_path(path).parse(&content)
    }

    /// First readable file along the search path. Broken files are skipped
    /// with a warning.
    fn find_and_load(&self) -> Option<(Config, PathBuf)> {
        for base in &self.search_paths {
            for format in &self.supported_formats {
                let path = base.with_extension(format.extension());
                if !path.exists() {
                    continue;
                }
                match Self::load_file(&path) {
                    Ok(config) => return Some((config, path)),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", path.display(), e);
                    }
                }
            }
        }
        None
    }

    /// `$FWPILOT_CONFIG`, the user config dir, then the working directory
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(path) = env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            // Extension is replaced per format during the search
            paths.push(path.with_extension(""));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("fwpilot").join("config"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("fwpilot").join("config"));
        }

        if let Ok(cwd) = env::current_dir() {
            paths.push(cwd.join("fwpilot"));
        }

        paths.dedup();
        paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
