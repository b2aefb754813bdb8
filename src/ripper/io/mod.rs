use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ripper::sender::Proxies;

pub(crate) mod sites;

/// Name of the configuration file.
pub(crate) const CONFIG_NAME: &str = "config.toml";

/// Placeholder substituted with the site name in [CrawlConfig::api_url].
pub(crate) const SITE_PLACEHOLDER: &str = "{site}";

#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Illegal JSON format in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No sites to download. {0}")]
    NoSites(String),
}

pub(crate) type ConfigResult<T> = Result<T, ConfigError>;

/// File locations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct PathsConfig {
    /// Root directory; every site gets a subdirectory.
    pub(crate) download_directory: String,
    pub(crate) stats_file: String,
    pub(crate) proxies_file: String,
    pub(crate) sites_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            download_directory: "DOWNLOADS".to_string(),
            stats_file: "download_stats.json".to_string(),
            proxies_file: "proxies.json".to_string(),
            sites_file: "sites.txt".to_string(),
        }
    }
}

/// Listing API pagination.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct CrawlConfig {
    /// Listing endpoint; `{site}` is replaced with the site name.
    pub(crate) api_url: String,
    pub(crate) page_size: u32,
    pub(crate) start_offset: u32,
    /// Transport failures tolerated at one offset before the walk is abandoned.
    pub(crate) page_retry_attempts: u32,
    /// Pause before fetching the same offset again.
    pub(crate) page_retry_delay_ms: u64,
    /// Also write every post as `{site}_post_id_{id}.post.json`.
    pub(crate) dump_posts_as_json: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            api_url: format!("https://{}.tumblr.com/api/read", SITE_PLACEHOLDER),
            page_size: 50,
            start_offset: 0,
            page_retry_attempts: 5,
            page_retry_delay_ms: 1000,
            dump_posts_as_json: false,
        }
    }
}

/// Media downloads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct DownloadConfig {
    pub(crate) threads: usize,
    pub(crate) retry_attempts: u32,
    /// Per-attempt timeout.
    pub(crate) timeout_secs: u64,
    /// Pause after every completed download.
    pub(crate) delay_ms: u64,
    /// Base of the exponential backoff between attempts, 0 to retry immediately.
    pub(crate) retry_backoff_ms: u64,
    pub(crate) cdn_host: String,
    pub(crate) legacy_prefix: String,
    pub(crate) legacy_extension: String,
}

impl DownloadConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfig {
            threads: 10,
            retry_attempts: 5,
            timeout_secs: 10,
            delay_ms: 500,
            retry_backoff_ms: 0,
            cdn_host: "vt.tumblr.com".to_string(),
            legacy_prefix: "tumblr".to_string(),
            legacy_extension: "mp4".to_string(),
        }
    }
}

/// Everything read from `config.toml`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) paths: PathsConfig,
    pub(crate) crawl: CrawlConfig,
    pub(crate) download: DownloadConfig,
}

impl Config {
    /// Loads the config at `path`.
    ///
    /// A missing file is created with default values. A file that fails to
    /// parse is renamed to `<name>.toml.backup` and replaced by the defaults.
    pub(crate) fn load(path: &Path) -> ConfigResult<Config> {
        if !path.exists() {
            info!("{} not found, creating it with default values", path.display());
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        match toml::from_str::<Config>(&content) {
            Ok(config) => {
                trace!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) => {
                error!("Failed to parse {}: {}", path.display(), e);
                info!("Backing up old config and creating a new one with default values");

                let backup = path.with_extension("toml.backup");
                if let Err(backup_err) = fs::rename(path, &backup) {
                    warn!("Failed to back up old config: {}", backup_err);
                }

                let config = Config::default();
                if let Err(write_err) = config.save(path) {
                    error!("Failed to write new config file: {}", write_err);
                }
                Ok(config)
            }
        }
    }

    pub(crate) fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub(crate) fn download_directory(&self) -> PathBuf {
        PathBuf::from(&self.paths.download_directory)
    }

    pub(crate) fn stats_file(&self) -> PathBuf {
        PathBuf::from(&self.paths.stats_file)
    }
}

/// Reads the optional proxy file. A missing or empty mapping means no proxies;
/// anything that is not a JSON object of strings is an error.
pub(crate) fn load_proxies(path: &Path) -> ConfigResult<Option<Proxies>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let proxies: Proxies = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })?;

    if proxies.is_empty() {
        Ok(None)
    } else {
        Ok(Some(proxies))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_config_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_NAME);

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_NAME);
        fs::write(&path, "[download]\nthreads = 3\n\n[crawl]\ndump_posts_as_json = true\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.download.threads, 3);
        assert_eq!(config.download.retry_attempts, 5);
        assert!(config.crawl.dump_posts_as_json);
        assert_eq!(config.crawl.page_size, 50);
        assert_eq!(config.crawl.page_retry_delay_ms, 1000);
        assert_eq!(config.paths.download_directory, "DOWNLOADS");
    }

    #[test]
    fn test_broken_config_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_NAME);
        fs::write(&path, "[download\nthreads = ").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            fs::read_to_string(dir.path().join("config.toml.backup")).unwrap(),
            "[download\nthreads = "
        );
        assert!(toml::from_str::<Config>(&fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn test_load_proxies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        assert!(load_proxies(&path).unwrap().is_none());

        fs::write(&path, r#"{"http": "http://127.0.0.1:1080", "https": "http://127.0.0.1:1080"}"#).unwrap();
        let proxies = load_proxies(&path).unwrap().unwrap();
        assert_eq!(proxies["https"], "http://127.0.0.1:1080");

        fs::write(&path, "{}").unwrap();
        assert!(load_proxies(&path).unwrap().is_none());
    }

    #[test]
    fn test_malformed_proxies_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        fs::write(&path, "{'http': nope").unwrap();
        assert!(matches!(load_proxies(&path), Err(ConfigError::Json { .. })));
    }
}
