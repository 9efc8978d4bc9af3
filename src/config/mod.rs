//! Environment configuration.
//!
//! Everything the process needs is read from environment variables at
//! boot. Configuration failures are fatal: the process prints the
//! error and exits non-zero. Lookup is injected as a closure so tests
//! can feed maps instead of mutating the process environment.

mod plugin;

pub use plugin::resolve_plugin;

use base64::Engine;
use jsonwebtoken::EncodingKey;
use std::fmt;
use thiserror::Error;

use crate::shoes::DockerHubCredential;

/// Fatal configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("failed to fetch plugin binary: {0}")]
    PluginFetch(String),

    #[error("plugin binary rejected: {0}")]
    PluginInvalid(String),
}

/// Which webhook event kind drives job intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookType {
    /// The default and recommended mode.
    WorkflowJob,
    /// Deprecated; accepted for compatibility.
    CheckRun,
}

impl WebhookType {
    pub fn event_name(&self) -> &'static str {
        match self {
            WebhookType::WorkflowJob => "workflow_job",
            WebhookType::CheckRun => "check_run",
        }
    }
}

/// Fully-loaded process configuration.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub debug: bool,
    pub strict: bool,
    pub webhook_type: WebhookType,
    pub runner_user: String,
    /// `latest` or a validated `vX.Y.Z`.
    pub runner_version: String,
    /// Raw value of the plugin path variable; resolved and validated
    /// separately by [`resolve_plugin`] because it may be a URL.
    pub plugin_path: String,
    pub plugin_output_path: String,
    pub github_url: String,
    pub app_id: u64,
    /// RS256 signing key for the app assertion.
    pub app_private_key: EncodingKey,
    /// Shared secret for webhook HMAC verification.
    pub app_secret: Vec<u8>,
    /// Bearer token protecting the admin API.
    pub admin_token: String,
    pub datastore_url: String,
    pub max_connections_to_backend: usize,
    pub max_concurrency_deleting: usize,
    pub enable_rescue_workflow: bool,
    pub provide_docker_hub_metrics: bool,
    pub docker_hub: Option<DockerHubCredential>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("debug", &self.debug)
            .field("strict", &self.strict)
            .field("webhook_type", &self.webhook_type)
            .field("runner_user", &self.runner_user)
            .field("runner_version", &self.runner_version)
            .field("plugin_path", &self.plugin_path)
            .field("github_url", &self.github_url)
            .field("app_id", &self.app_id)
            .field(
                "max_connections_to_backend",
                &self.max_connections_to_backend,
            )
            .field("max_concurrency_deleting", &self.max_concurrency_deleting)
            .field("enable_rescue_workflow", &self.enable_rescue_workflow)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an injected variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match var("PORT") {
            None => 8080,
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                var: "PORT",
                reason: e.to_string(),
            })?,
        };

        let debug = var("DEBUG").as_deref() == Some("true");
        // Strict mode is opt-out.
        let strict = var("STRICT").as_deref() != Some("false");

        let webhook_type = match var("WEBHOOK_TYPE").as_deref() {
            None | Some("workflow_job") => WebhookType::WorkflowJob,
            Some("check_run") => {
                tracing::warn!(
                    "check_run webhook mode is deprecated and will be removed; use workflow_job"
                );
                WebhookType::CheckRun
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "WEBHOOK_TYPE",
                    reason: format!("unknown webhook type {other:?}"),
                });
            }
        };

        let runner_user = var("RUNNER_USER").unwrap_or_else(|| "runner".to_string());

        let runner_version = match var("RUNNER_VERSION") {
            None => "latest".to_string(),
            Some(v) if v == "latest" => v,
            Some(v) => {
                if !is_valid_runner_version(&v) {
                    return Err(ConfigError::Invalid {
                        var: "RUNNER_VERSION",
                        reason: format!("{v:?} is not \"latest\" or \"vX.Y.Z\""),
                    });
                }
                v
            }
        };

        let plugin_path = var("PLUGIN_PATH").ok_or(ConfigError::Missing("PLUGIN_PATH"))?;
        let plugin_output_path = var("PLUGIN_OUTPUT_PATH").unwrap_or_else(|| ".".to_string());

        let github_url = match var("GITHUB_URL") {
            None => "https://github.com".to_string(),
            Some(raw) => {
                let url = reqwest::Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                    var: "GITHUB_URL",
                    reason: e.to_string(),
                })?;
                if url.host_str().is_none() {
                    return Err(ConfigError::Invalid {
                        var: "GITHUB_URL",
                        reason: "must have a host".to_string(),
                    });
                }
                raw
            }
        };

        let app_id = var("GITHUB_APP_ID")
            .ok_or(ConfigError::Missing("GITHUB_APP_ID"))?
            .parse::<u64>()
            .map_err(|e| ConfigError::Invalid {
                var: "GITHUB_APP_ID",
                reason: e.to_string(),
            })?;

        let pem_base64 = var("GITHUB_APP_PRIVATE_KEY_BASE64")
            .ok_or(ConfigError::Missing("GITHUB_APP_PRIVATE_KEY_BASE64"))?;
        let pem =
            base64::engine::general_purpose::STANDARD
                .decode(pem_base64)
                .map_err(|e| ConfigError::Invalid {
                    var: "GITHUB_APP_PRIVATE_KEY_BASE64",
                    reason: format!("not valid base64: {e}"),
                })?;
        let app_private_key =
            EncodingKey::from_rsa_pem(&pem).map_err(|e| ConfigError::Invalid {
                var: "GITHUB_APP_PRIVATE_KEY_BASE64",
                reason: format!("not a valid RSA private key: {e}"),
            })?;

        let app_secret = var("GITHUB_APP_SECRET")
            .ok_or(ConfigError::Missing("GITHUB_APP_SECRET"))?
            .into_bytes();

        let admin_token = var("ADMIN_TOKEN").ok_or(ConfigError::Missing("ADMIN_TOKEN"))?;

        let datastore_url = load_datastore_url(&var)?;

        let max_connections_to_backend = match var("MAX_CONNECTIONS_TO_BACKEND") {
            None => 50,
            Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
                var: "MAX_CONNECTIONS_TO_BACKEND",
                reason: e.to_string(),
            })?,
        };

        let max_concurrency_deleting = match var("MAX_CONCURRENCY_DELETING") {
            None => 1,
            Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
                var: "MAX_CONCURRENCY_DELETING",
                reason: e.to_string(),
            })?,
        };

        let enable_rescue_workflow = var("ENABLE_RESCUE_WORKFLOW").as_deref() == Some("true");

        let provide_docker_hub_metrics =
            var("PROVIDE_DOCKER_HUB_METRICS").as_deref() == Some("true");
        let docker_hub = match (var("DOCKER_HUB_USERNAME"), var("DOCKER_HUB_PASSWORD")) {
            (Some(username), Some(password)) => Some(DockerHubCredential { username, password }),
            _ => {
                if provide_docker_hub_metrics {
                    tracing::warn!(
                        "Docker Hub metrics enabled without credentials; using anonymous access"
                    );
                }
                None
            }
        };

        Ok(Config {
            port,
            debug,
            strict,
            webhook_type,
            runner_user,
            runner_version,
            plugin_path,
            plugin_output_path,
            github_url,
            app_id,
            app_private_key,
            app_secret,
            admin_token,
            datastore_url,
            max_connections_to_backend,
            max_concurrency_deleting,
            enable_rescue_workflow,
            provide_docker_hub_metrics,
            docker_hub,
        })
    }
}

/// Assembles the datastore URL, preferring the discrete host/port/...
/// variables over the composite `DATASTORE_URL`.
fn load_datastore_url(var: &impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let parts = (
        var("DATASTORE_HOST"),
        var("DATASTORE_PORT"),
        var("DATASTORE_USER"),
        var("DATASTORE_PASSWORD"),
        var("DATASTORE_NAME"),
    );
    if let (Some(host), Some(port), Some(user), Some(password), Some(name)) = parts {
        tracing::info!("assembling datastore URL from discrete DATASTORE_* variables");
        return Ok(format!("postgres://{user}:{password}@{host}:{port}/{name}"));
    }
    var("DATASTORE_URL").ok_or(ConfigError::Missing("DATASTORE_URL"))
}

/// Validates a pinned runner version: `v` followed by three numeric
/// dot-separated components (`v2.321.0`).
fn is_valid_runner_version(version: &str) -> bool {
    let Some(rest) = version.strip_prefix('v') else {
        return false;
    };
    let parts: Vec<&str> = rest.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A freshly generated RSA key for config parsing tests (not a
    /// credential for anything).
    const TEST_PEM: &str = include_str!("testdata/test_key.pem");

    fn base_vars() -> HashMap<String, String> {
        let pem_base64 = base64::engine::general_purpose::STANDARD.encode(TEST_PEM);
        HashMap::from([
            ("PLUGIN_PATH".to_string(), "/opt/shoes/plugin".to_string()),
            ("GITHUB_APP_ID".to_string(), "1234".to_string()),
            ("GITHUB_APP_PRIVATE_KEY_BASE64".to_string(), pem_base64),
            ("GITHUB_APP_SECRET".to_string(), "hook-secret".to_string()),
            ("ADMIN_TOKEN".to_string(), "admin-token".to_string()),
            (
                "DATASTORE_URL".to_string(),
                "postgres://treadmill:pw@localhost:5432/treadmill".to_string(),
            ),
        ])
    }

    fn load(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(config.port, 8080);
        assert!(!config.debug);
        assert!(config.strict);
        assert_eq!(config.webhook_type, WebhookType::WorkflowJob);
        assert_eq!(config.runner_user, "runner");
        assert_eq!(config.runner_version, "latest");
        assert_eq!(config.github_url, "https://github.com");
        assert_eq!(config.max_connections_to_backend, 50);
        assert_eq!(config.max_concurrency_deleting, 1);
        assert!(!config.enable_rescue_workflow);
        assert!(config.docker_hub.is_none());
    }

    #[test]
    fn missing_required_vars_fail() {
        for missing in [
            "PLUGIN_PATH",
            "GITHUB_APP_ID",
            "GITHUB_APP_PRIVATE_KEY_BASE64",
            "GITHUB_APP_SECRET",
            "ADMIN_TOKEN",
            "DATASTORE_URL",
        ] {
            let mut vars = base_vars();
            vars.remove(missing);
            assert!(
                matches!(load(&vars), Err(ConfigError::Missing(v)) if v == missing),
                "expected {missing} to be required"
            );
        }
    }

    #[test]
    fn pinned_runner_version_is_validated() {
        let mut vars = base_vars();
        vars.insert("RUNNER_VERSION".to_string(), "v2.321.0".to_string());
        assert_eq!(load(&vars).unwrap().runner_version, "v2.321.0");

        for bad in ["2.321.0", "v2.321", "vlatest", "v2.x.0", "v2.321.0.1"] {
            vars.insert("RUNNER_VERSION".to_string(), bad.to_string());
            assert!(load(&vars).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn check_run_mode_is_accepted() {
        let mut vars = base_vars();
        vars.insert("WEBHOOK_TYPE".to_string(), "check_run".to_string());
        assert_eq!(load(&vars).unwrap().webhook_type, WebhookType::CheckRun);

        vars.insert("WEBHOOK_TYPE".to_string(), "push".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn strict_mode_is_opt_out() {
        let mut vars = base_vars();
        vars.insert("STRICT".to_string(), "false".to_string());
        assert!(!load(&vars).unwrap().strict);
    }

    #[test]
    fn discrete_datastore_parts_win_over_url() {
        let mut vars = base_vars();
        for (k, v) in [
            ("DATASTORE_HOST", "db.internal"),
            ("DATASTORE_PORT", "5433"),
            ("DATASTORE_USER", "svc"),
            ("DATASTORE_PASSWORD", "pw"),
            ("DATASTORE_NAME", "runners"),
        ] {
            vars.insert(k.to_string(), v.to_string());
        }
        assert_eq!(
            load(&vars).unwrap().datastore_url,
            "postgres://svc:pw@db.internal:5433/runners"
        );
    }

    #[test]
    fn github_url_must_have_scheme_and_host() {
        let mut vars = base_vars();
        vars.insert("GITHUB_URL".to_string(), "ghe.example.com".to_string());
        assert!(load(&vars).is_err());

        vars.insert(
            "GITHUB_URL".to_string(),
            "https://ghe.example.com".to_string(),
        );
        assert_eq!(load(&vars).unwrap().github_url, "https://ghe.example.com");
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "GITHUB_APP_PRIVATE_KEY_BASE64".to_string(),
            "@@not-base64@@".to_string(),
        );
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Invalid {
                var: "GITHUB_APP_PRIVATE_KEY_BASE64",
                ..
            })
        ));
    }

    #[test]
    fn docker_hub_credentials_need_both_halves() {
        let mut vars = base_vars();
        vars.insert("DOCKER_HUB_USERNAME".to_string(), "user".to_string());
        assert!(load(&vars).unwrap().docker_hub.is_none());

        vars.insert("DOCKER_HUB_PASSWORD".to_string(), "pass".to_string());
        let credential = load(&vars).unwrap().docker_hub.unwrap();
        assert_eq!(credential.username, "user");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = load(&base_vars()).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hook-secret"));
        assert!(!debug.contains("admin-token"));
        assert!(!debug.contains("postgres://"));
    }

    #[test]
    fn runner_version_validation_table() {
        assert!(is_valid_runner_version("v2.321.0"));
        assert!(is_valid_runner_version("v10.0.99"));
        assert!(!is_valid_runner_version("latest"));
        assert!(!is_valid_runner_version("v"));
        assert!(!is_valid_runner_version("v1.2"));
        assert!(!is_valid_runner_version("v1.2.3-rc1"));
    }
}
