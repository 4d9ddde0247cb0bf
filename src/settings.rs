use config::{Config, ConfigError, File};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static::lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid");
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub provider: ProviderSettings,
    #[serde(default)]
    pub locking: LockSettings,
}

/// Settings of the bucket provisioner
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProviderSettings {
    pub aws_region: String,

    /// Prefix for bucket and IAM user names, e.g. "paas-s3-broker-"
    #[serde(alias = "bucket_prefix")]
    pub resource_prefix: String,

    /// IAM path under which binding users are created
    #[serde(default)]
    iam_user_path: String,

    /// Value of the `deploy_env` tag on buckets and users
    pub deploy_env: String,

    /// Managed policy attached to users that may only access buckets from allowed IPs
    pub iam_ip_restriction_policy_arn: String,

    /// Optional managed policy attached to every binding user
    #[serde(default)]
    pub common_user_policy_arn: Option<String>,

    /// Optional permissions boundary for binding users
    #[serde(default, alias = "iam_user_boundary_policy_arn")]
    pub permissions_boundary_arn: Option<String>,

    /// How long to keep retrying bucket policy writes (0 means the default of 30s)
    #[serde(default)]
    pub timeout_secs: u64,

    /// Deadline for a whole operation including lock acquisition
    #[serde(default = "default_operation_deadline_secs")]
    pub operation_deadline_secs: u64,

    /// Pause after each bucket policy write attempt
    #[serde(default = "default_policy_retry_interval_ms")]
    pub policy_retry_interval_ms: u64,
}

fn default_operation_deadline_secs() -> u64 {
    60
}

fn default_policy_retry_interval_ms() -> u64 {
    2000
}

const DEFAULT_POLICY_WRITE_TIMEOUT_SECS: u64 = 30;

impl ProviderSettings {
    /// Parse provider settings from a raw JSON document
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let mut settings: ProviderSettings = serde_json::from_slice(data).map_err(|e| {
            ConfigError::Message(format!("Failed to parse provider settings: {}", e))
        })?;
        settings.normalize();
        Ok(settings)
    }

    fn normalize(&mut self) {
        self.iam_user_path = normalize_iam_user_path(&self.iam_user_path);
    }

    /// IAM user path in the form `/<path>/`
    pub fn iam_user_path(&self) -> &str {
        &self.iam_user_path
    }

    pub fn policy_write_timeout(&self) -> Duration {
        match self.timeout_secs {
            0 => Duration::from_secs(DEFAULT_POLICY_WRITE_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn operation_deadline(&self) -> Duration {
        Duration::from_secs(self.operation_deadline_secs)
    }

    pub fn policy_retry_interval(&self) -> Duration {
        Duration::from_millis(self.policy_retry_interval_ms)
    }
}

/// Normalize an IAM path to a leading and trailing slash
pub fn normalize_iam_user_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Settings of the instance lock
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LockSettings {
    /// Postgres database holding the shared lock table. Locks are process-local when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Lifetime of a held lock. Must cover the whole operation deadline, since
    /// locks are not refreshed while an operation runs.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_lock_ttl_secs() -> u64 {
    90
}

fn default_lock_max_attempts() -> u32 {
    15
}

fn default_lock_retry_interval_ms() -> u64 {
    1000
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            ttl_secs: default_lock_ttl_secs(),
            max_attempts: default_lock_max_attempts(),
            retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Settings {
    /// Build settings from a raw provider JSON document with default locking
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let provider = ProviderSettings::from_json(data)?;
        let settings = Settings {
            provider,
            locking: LockSettings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the directory named by `S3_BROKER_CONFIG_DIR`
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = env::var("S3_BROKER_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load_from(&config_dir)
    }

    /// Load `default`, then `<run mode>`, then `local` config files from `config_dir`
    pub fn load_from(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode =
            env::var("S3_BROKER_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder();
        for (name, required) in [("default", true), (run_mode.as_str(), false), ("local", false)] {
            match find_config_file(Path::new(config_dir), name) {
                Some(path) => {
                    tracing::info!("Loading config file: {}", path.display());
                    builder = builder.add_source(File::from(path));
                }
                None if required => {
                    return Err(ConfigError::Message(format!(
                        "Required config file not found: {}/{}.{{{}}}",
                        config_dir,
                        name,
                        CONFIG_EXTENSIONS.join(",")
                    )));
                }
                None => tracing::debug!("Optional config file '{}' not found", name),
            }
        }

        let mut json_value: serde_json::Value = builder.build()?.try_deserialize()?;
        expand_env_vars(&mut json_value);

        let mut unused_fields = Vec::new();
        let mut settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in broker config: {}", field);
        }

        settings.provider.normalize();

        // An unset ${DATABASE_URL} substitutes to an empty string
        settings.locking.database_url = settings
            .locking
            .database_url
            .take()
            .filter(|url| !url.is_empty());

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let provider = &self.provider;
        for (name, value) in [
            ("aws_region", &provider.aws_region),
            ("resource_prefix", &provider.resource_prefix),
            ("deploy_env", &provider.deploy_env),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Message(format!(
                    "provider.{} must not be empty",
                    name
                )));
            }
        }

        if provider.operation_deadline_secs == 0 {
            return Err(ConfigError::Message(
                "provider.operation_deadline_secs must be greater than zero".to_string(),
            ));
        }

        if self.locking.ttl_secs < provider.operation_deadline_secs {
            return Err(ConfigError::Message(format!(
                "locking.ttl_secs ({}) must be at least provider.operation_deadline_secs ({})",
                self.locking.ttl_secs, provider.operation_deadline_secs
            )));
        }

        Ok(())
    }
}

const CONFIG_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

/// First of `<dir>/<name>.{toml,yaml,yml,json}` that exists
fn find_config_file(dir: &Path, name: &str) -> Option<PathBuf> {
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|path| path.exists())
}

/// Replace `${VAR}` and `${VAR:-default}` in a string with environment values
fn substitute_env_vars(s: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(s, |caps: &regex::Captures| {
            env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

/// Substitute environment variables in every string of a config tree
fn expand_env_vars(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = substitute_env_vars(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_env_vars),
        serde_json::Value::Object(fields) => fields.values_mut().for_each(expand_env_vars),
        _ => {}
    }
}
