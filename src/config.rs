use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::archiver::{ContentTransform, LinkPolicy, LinkScope, RewriteOptions, StripAbsoluteUrls};
use crate::fetch::{ChromiumConfig, FetchOptions, RenderBackend};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Crawl
    pub seed_urls: Vec<String>,
    pub refresh: bool,
    pub link_scope: Option<LinkScope>,
    pub link_levels: u32,
    pub link_allow: Vec<String>,
    pub link_deny: Vec<String>,
    pub url_blocklist: Vec<String>,
    pub strip_absolute_urls: bool,

    // Storage
    pub archive_root: PathBuf,
    pub bundle_dir: PathBuf,
    pub http_cache_dir: Option<PathBuf>,

    // Fetching
    pub request_timeout: Duration,
    pub fetch_retries: u32,
    pub strict: bool,

    // Rendering
    pub render_backend: RenderBackend,
    pub chrome_path: Option<String>,
    pub render_timeout: Duration,

    // Bundles
    pub export_bundles: bool,
    pub dependency_zip_threshold: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Crawl
            seed_urls: parse_list(&required_env("SEED_URLS")?),
            refresh: parse_env_bool("REFRESH", false)?,
            link_scope: optional_env("LINK_SCOPE")
                .map(|v| parse_link_scope(&v))
                .transpose()?,
            link_levels: parse_env_u32("LINK_LEVELS", 1)?,
            link_allow: parse_list(&env_or_default("LINK_ALLOW", "")),
            link_deny: parse_list(&env_or_default("LINK_DENY", "")),
            url_blocklist: parse_list(&env_or_default("URL_BLOCKLIST", "")),
            strip_absolute_urls: parse_env_bool("STRIP_ABSOLUTE_URLS", false)?,

            // Storage
            archive_root: PathBuf::from(env_or_default("ARCHIVE_ROOT", "./data/archive")),
            bundle_dir: PathBuf::from(env_or_default("BUNDLE_DIR", "./data/bundles")),
            http_cache_dir: match std::env::var("HTTP_CACHE_DIR") {
                Ok(val) if val.is_empty() => None,
                Ok(val) => Some(PathBuf::from(val)),
                Err(_) => Some(PathBuf::from(".webcache")),
            },

            // Fetching
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 60)?),
            fetch_retries: parse_env_u32("FETCH_RETRIES", 5)?,
            strict: parse_env_bool("STRICT", false)?,

            // Rendering
            render_backend: parse_render_backend(&env_or_default("RENDER_BACKEND", "none"))?,
            chrome_path: optional_env("CHROME_PATH"),
            render_timeout: Duration::from_secs(parse_env_u64("RENDER_TIMEOUT_SECS", 30)?),

            // Bundles
            export_bundles: parse_env_bool("EXPORT_BUNDLES", true)?,
            dependency_zip_threshold: optional_env("DEPENDENCY_ZIP_THRESHOLD")
                .map(|_| parse_env_usize("DEPENDENCY_ZIP_THRESHOLD", 2))
                .transpose()?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.seed_urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "SEED_URLS".to_string(),
                message: "must list at least one URL".to_string(),
            });
        }
        if let Some(bad) = self
            .seed_urls
            .iter()
            .find(|u| !url::Url::parse(u).is_ok_and(|u| matches!(u.scheme(), "http" | "https")))
        {
            return Err(ConfigError::InvalidValue {
                name: "SEED_URLS".to_string(),
                message: format!("'{bad}' is not an http(s) URL"),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.render_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "RENDER_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dependency_zip_threshold == Some(0) {
            return Err(ConfigError::InvalidValue {
                name: "DEPENDENCY_ZIP_THRESHOLD".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            request_timeout: self.request_timeout,
            render_timeout: self.render_timeout,
            retry: RetryPolicy {
                max_attempts: self.fetch_retries.saturating_add(1),
                ..RetryPolicy::fetch()
            },
            strict_status: self.strict,
            cache_dir: self.http_cache_dir.clone(),
        }
    }

    #[must_use]
    pub fn chromium_config(&self) -> ChromiumConfig {
        ChromiumConfig {
            chrome_path: self.chrome_path.clone(),
            ..ChromiumConfig::default()
        }
    }

    #[must_use]
    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            blocklist: self.url_blocklist.clone(),
            js_transform: self
                .strip_absolute_urls
                .then(|| Arc::new(StripAbsoluteUrls) as Arc<dyn ContentTransform>),
            ..RewriteOptions::default()
        }
    }

    /// Crawl policy, or `None` when link following is disabled.
    #[must_use]
    pub fn link_policy(&self) -> Option<LinkPolicy> {
        self.link_scope.map(|scope| LinkPolicy {
            scope,
            allow: self.link_allow.clone(),
            deny: self.link_deny.clone(),
            levels: self.link_levels,
        })
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_link_scope(value: &str) -> Result<LinkScope, ConfigError> {
    value.parse().map_err(|message| ConfigError::InvalidValue {
        name: "LINK_SCOPE".to_string(),
        message,
    })
}

fn parse_render_backend(value: &str) -> Result<RenderBackend, ConfigError> {
    value.parse().map_err(|message| ConfigError::InvalidValue {
        name: "RENDER_BACKEND".to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "SEED_URLS",
        "REFRESH",
        "LINK_SCOPE",
        "LINK_LEVELS",
        "LINK_ALLOW",
        "LINK_DENY",
        "URL_BLOCKLIST",
        "STRIP_ABSOLUTE_URLS",
        "ARCHIVE_ROOT",
        "BUNDLE_DIR",
        "HTTP_CACHE_DIR",
        "REQUEST_TIMEOUT_SECS",
        "FETCH_RETRIES",
        "STRICT",
        "RENDER_BACKEND",
        "CHROME_PATH",
        "RENDER_TIMEOUT_SECS",
        "EXPORT_BUNDLES",
        "DEPENDENCY_ZIP_THRESHOLD",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_parse_link_scope() {
        assert_eq!(parse_link_scope("all").unwrap(), LinkScope::All);
        assert_eq!(parse_link_scope("SAME_DOMAIN").unwrap(), LinkScope::SameDomain);
        assert!(parse_link_scope("invalid").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    #[serial]
    fn test_missing_seed_urls() {
        clear_env();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar(name)) if name == "SEED_URLS"
        ));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("SEED_URLS", "https://example.com/a/index.html");

        let config = Config::from_env().unwrap();
        config.validate().unwrap();

        assert_eq!(config.seed_urls, vec!["https://example.com/a/index.html"]);
        assert_eq!(config.archive_root, PathBuf::from("./data/archive"));
        assert_eq!(config.http_cache_dir, Some(PathBuf::from(".webcache")));
        assert_eq!(config.render_backend, RenderBackend::None);
        assert!(config.link_policy().is_none());
        assert!(config.export_bundles);
        assert_eq!(config.dependency_zip_threshold, None);
        assert_eq!(config.fetch_options().retry.max_attempts, 6);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_crawl_settings() {
        clear_env();
        std::env::set_var("SEED_URLS", "https://a.example/, https://b.example/");
        std::env::set_var("LINK_SCOPE", "all");
        std::env::set_var("LINK_LEVELS", "2");
        std::env::set_var("LINK_DENY", "logout,/admin/");
        std::env::set_var("HTTP_CACHE_DIR", "");
        std::env::set_var("FETCH_RETRIES", "0");
        std::env::set_var("DEPENDENCY_ZIP_THRESHOLD", "3");

        let config = Config::from_env().unwrap();
        config.validate().unwrap();

        assert_eq!(config.seed_urls.len(), 2);
        let policy = config.link_policy().unwrap();
        assert_eq!(policy.scope, LinkScope::All);
        assert_eq!(policy.levels, 2);
        assert_eq!(policy.deny, vec!["logout", "/admin/"]);
        assert_eq!(config.http_cache_dir, None);
        assert_eq!(config.fetch_options().retry.max_attempts, 1);
        assert_eq!(config.dependency_zip_threshold, Some(3));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_validate_rejects_non_http_seed() {
        clear_env();
        std::env::set_var("SEED_URLS", "file:///tmp/page.html");
        let config = Config::from_env().unwrap();
        assert!(config.validate().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_backend() {
        clear_env();
        std::env::set_var("SEED_URLS", "https://example.com/");
        std::env::set_var("RENDER_BACKEND", "phantomjs");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "RENDER_BACKEND"
        ));
        clear_env();
    }
}
