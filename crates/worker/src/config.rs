use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_cloud::s3::S3Config;
use kiln_cloud::volume::VolumeTarget;
use kiln_comfyui::launcher::EngineCommand;
use kiln_comfyui::poller::{
    PollConfig, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_MAX_POLL_ERRORS, DEFAULT_POLL_INTERVAL,
};
use kiln_comfyui::supervisor::{DEFAULT_HEALTH_INTERVAL, DEFAULT_STARTUP_TIMEOUT};

/// Configuration could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// How the engine is started and where it writes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// ComfyUI installation directory.
    pub install_dir: PathBuf,
    pub python: String,
    pub extra_args: Vec<String>,
    pub logs_dir: PathBuf,
    /// Directory the engine writes generated files to.
    pub output_dir: PathBuf,
    /// Ask the engine to rescan models after linking the volume models.
    pub refresh_models: bool,
}

impl EngineConfig {
    /// Base URL of the engine's HTTP API.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn command(&self) -> EngineCommand {
        EngineCommand {
            python: self.python.clone(),
            install_dir: self.install_dir.clone(),
            host: self.host.clone(),
            port: self.port,
            extra_args: self.extra_args.clone(),
            log_dir: self.logs_dir.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub startup: Duration,
    pub health_interval: Duration,
    /// Budget for a submitted job to reach a terminal state.
    pub execution: Duration,
    pub poll_interval: Duration,
    pub max_poll_errors: u32,
    /// Per-request timeout for the engine HTTP client.
    pub http: Duration,
}

impl TimeoutConfig {
    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            max_consecutive_errors: self.max_poll_errors,
            request_timeout: self.http,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `None` unless bucket, access key and secret key are all set.
    pub s3: Option<S3Config>,
    pub volume_root: PathBuf,
    pub volume_subdir: PathBuf,
    /// Symlink the engine's models directory to the volume's.
    pub link_volume_models: bool,
}

impl StorageConfig {
    pub fn volume(&self) -> VolumeTarget {
        VolumeTarget::new(&self.volume_root, &self.volume_subdir)
    }
}

/// Worker configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    pub timeouts: TimeoutConfig,
    pub storage: StorageConfig,
    /// Delete engine output files once every artifact is delivered.
    pub cleanup_temp_files: bool,
    /// Bind address of the HTTP surface.
    pub host: String,
    pub port: u16,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                                               |
    /// |------------------------------|-------------------------------------------------------|
    /// | `COMFYUI_HOST`               | `127.0.0.1`                                           |
    /// | `COMFYUI_PORT`               | `8188`                                                |
    /// | `COMFYUI_PATH`               | `/workspace/ComfyUI`                                  |
    /// | `COMFYUI_PYTHON`             | `python`                                              |
    /// | `COMFYUI_EXTRA_ARGS`         | `--normalvram --preview-method auto --verbose --cache-lru 3` |
    /// | `COMFYUI_LOGS_PATH`          | `/workspace/logs`                                     |
    /// | `COMFYUI_OUTPUT_PATH`        | `$COMFYUI_PATH/output`                                |
    /// | `COMFYUI_REFRESH_MODELS`     | `true`                                                |
    /// | `STARTUP_TIMEOUT_SECS`       | `1200`                                                |
    /// | `HEALTH_CHECK_INTERVAL_SECS` | `2`                                                   |
    /// | `EXECUTION_TIMEOUT_SECS`     | `3600`                                                |
    /// | `POLL_INTERVAL_SECS`         | `2`                                                   |
    /// | `MAX_POLL_ERRORS`            | `5`                                                   |
    /// | `HTTP_TIMEOUT_SECS`          | `30`                                                  |
    /// | `S3_BUCKET`                  | (unset)                                               |
    /// | `S3_ACCESS_KEY`              | (unset)                                               |
    /// | `S3_SECRET_KEY`              | (unset)                                               |
    /// | `S3_ENDPOINT_URL`            | (unset)                                               |
    /// | `S3_REGION`                  | `auto`                                                |
    /// | `S3_PUBLIC_URL`              | (unset)                                               |
    /// | `S3_SIGNED_URL_EXPIRY`       | `3600`                                                |
    /// | `S3_ADDRESSING_STYLE`        | `path`                                                |
    /// | `S3_CACHE_CONTROL`           | `public, max-age=31536000`                            |
    /// | `VOLUME_PATH`                | `/runpod-volume`                                      |
    /// | `VOLUME_OUTPUT_SUBDIR`       | `comfyui/output`                                      |
    /// | `LINK_VOLUME_MODELS`         | `true`                                                |
    /// | `CLEANUP_TEMP_FILES`         | `false`                                               |
    /// | `WORKER_HOST`                | `0.0.0.0`                                             |
    /// | `WORKER_PORT`                | `8000`                                                |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let install_dir = PathBuf::from(env.string("COMFYUI_PATH", "/workspace/ComfyUI"));
        let output_dir = env
            .optional("COMFYUI_OUTPUT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| install_dir.join("output"));

        let engine = EngineConfig {
            host: env.string("COMFYUI_HOST", "127.0.0.1"),
            port: env.parse("COMFYUI_PORT", 8188)?,
            python: env.string("COMFYUI_PYTHON", "python"),
            extra_args: env
                .string(
                    "COMFYUI_EXTRA_ARGS",
                    "--normalvram --preview-method auto --verbose --cache-lru 3",
                )
                .split_whitespace()
                .map(String::from)
                .collect(),
            logs_dir: PathBuf::from(env.string("COMFYUI_LOGS_PATH", "/workspace/logs")),
            refresh_models: env.flag("COMFYUI_REFRESH_MODELS", true),
            install_dir,
            output_dir,
        };

        let timeouts = TimeoutConfig {
            startup: env.secs("STARTUP_TIMEOUT_SECS", DEFAULT_STARTUP_TIMEOUT.as_secs())?,
            health_interval: env.nonzero_secs("HEALTH_CHECK_INTERVAL_SECS", DEFAULT_HEALTH_INTERVAL.as_secs())?,
            execution: env.secs("EXECUTION_TIMEOUT_SECS", DEFAULT_EXECUTION_TIMEOUT.as_secs())?,
            poll_interval: env.nonzero_secs("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL.as_secs())?,
            max_poll_errors: env.parse("MAX_POLL_ERRORS", DEFAULT_MAX_POLL_ERRORS)?,
            http: env.secs("HTTP_TIMEOUT_SECS", 30)?,
        };

        let storage = StorageConfig {
            s3: s3_config(&env)?,
            volume_root: PathBuf::from(env.string("VOLUME_PATH", "/runpod-volume")),
            volume_subdir: PathBuf::from(env.string("VOLUME_OUTPUT_SUBDIR", "comfyui/output")),
            link_volume_models: env.flag("LINK_VOLUME_MODELS", true),
        };

        Ok(Self {
            engine,
            timeouts,
            storage,
            cleanup_temp_files: env.flag("CLEANUP_TEMP_FILES", false),
            host: env.string("WORKER_HOST", "0.0.0.0"),
            port: env.parse("WORKER_PORT", 8000)?,
        })
    }
}

fn s3_config<F>(env: &Env<F>) -> Result<Option<S3Config>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (Some(bucket), Some(access_key), Some(secret_key)) = (
        env.optional("S3_BUCKET"),
        env.optional("S3_ACCESS_KEY"),
        env.optional("S3_SECRET_KEY"),
    ) else {
        return Ok(None);
    };

    let endpoint_url = env.optional("S3_ENDPOINT_URL");
    let path_style = match env.string("S3_ADDRESSING_STYLE", "path").to_ascii_lowercase().as_str() {
        "path" => true,
        "virtual" => false,
        "auto" => endpoint_url.is_some(),
        other => {
            return Err(ConfigError::Invalid {
                key: "S3_ADDRESSING_STYLE",
                value: other.to_string(),
            })
        }
    };

    Ok(Some(S3Config {
        bucket,
        access_key,
        secret_key,
        endpoint_url,
        region: env.string("S3_REGION", "auto"),
        public_url: env.optional("S3_PUBLIC_URL"),
        signed_url_expiry: env.secs("S3_SIGNED_URL_EXPIRY", 3600)?,
        path_style,
        cache_control: env.string("S3_CACHE_CONTROL", "public, max-age=31536000"),
    }))
}

/// Typed accessors over a variable source. Empty values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    /// Interval keys: zero would spin a loop without sleeping.
    fn nonzero_secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        match self.parse(key, default)? {
            0 => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
            }),
            secs => Ok(Duration::from_secs(secs)),
        }
    }

    /// `1`, `true`, `yes` and `on` (any case) are true; anything else is false.
    fn flag(&self, key: &str, default: bool) -> bool {
        match self.optional(key) {
            None => default,
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.engine.api_url(), "http://127.0.0.1:8188");
        assert_eq!(config.engine.output_dir, PathBuf::from("/workspace/ComfyUI/output"));
        assert_eq!(config.engine.extra_args.len(), 6);
        assert_eq!(config.timeouts.startup, Duration::from_secs(1200));
        assert_eq!(config.timeouts.execution, Duration::from_secs(3600));
        assert_eq!(config.timeouts.max_poll_errors, 5);
        assert!(config.storage.s3.is_none());
        assert_eq!(
            config.storage.volume().output_dir(),
            PathBuf::from("/runpod-volume/comfyui/output")
        );
        assert!(config.storage.link_volume_models);
        assert!(!config.cleanup_temp_files);
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn output_dir_follows_install_dir() {
        let config = load(&[("COMFYUI_PATH", "/opt/comfy")]).unwrap();
        assert_eq!(config.engine.output_dir, PathBuf::from("/opt/comfy/output"));
    }

    #[test]
    fn s3_requires_all_credentials() {
        let partial = load(&[("S3_BUCKET", "renders"), ("S3_ACCESS_KEY", "ak")]).unwrap();
        assert!(partial.storage.s3.is_none());

        let blank = load(&[("S3_BUCKET", "renders"), ("S3_ACCESS_KEY", "ak"), ("S3_SECRET_KEY", " ")]).unwrap();
        assert!(blank.storage.s3.is_none());

        let full = load(&[
            ("S3_BUCKET", "renders"),
            ("S3_ACCESS_KEY", "ak"),
            ("S3_SECRET_KEY", "sk"),
            ("S3_SIGNED_URL_EXPIRY", "600"),
        ])
        .unwrap();
        let s3 = full.storage.s3.unwrap();
        assert_eq!(s3.bucket, "renders");
        assert_eq!(s3.region, "auto");
        assert_eq!(s3.signed_url_expiry, Duration::from_secs(600));
        assert!(s3.path_style);
        assert!(s3.public_url.is_none());
    }

    #[test]
    fn flags_accept_common_spellings() {
        for truthy in ["1", "true", "YES", "On"] {
            assert!(load(&[("CLEANUP_TEMP_FILES", truthy)]).unwrap().cleanup_temp_files);
        }
        for falsy in ["0", "false", "no", "nope"] {
            assert!(!load(&[("LINK_VOLUME_MODELS", falsy)]).unwrap().storage.link_volume_models);
        }
    }

    #[test]
    fn invalid_numbers_are_reported() {
        assert_matches!(
            load(&[("COMFYUI_PORT", "eighty")]),
            Err(ConfigError::Invalid { key: "COMFYUI_PORT", value }) if value == "eighty"
        );
        assert_matches!(
            load(&[("POLL_INTERVAL_SECS", "-1")]),
            Err(ConfigError::Invalid { key: "POLL_INTERVAL_SECS", .. })
        );
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert_matches!(
            load(&[("POLL_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { key: "POLL_INTERVAL_SECS", value }) if value == "0"
        );
        assert_matches!(
            load(&[("HEALTH_CHECK_INTERVAL_SECS", "0")]),
            Err(ConfigError::Invalid { key: "HEALTH_CHECK_INTERVAL_SECS", .. })
        );
        // Other durations may legitimately be zero.
        assert!(load(&[("STARTUP_TIMEOUT_SECS", "0")]).is_ok());
    }

    #[test]
    fn unknown_addressing_style_is_rejected() {
        let result = load(&[
            ("S3_BUCKET", "b"),
            ("S3_ACCESS_KEY", "a"),
            ("S3_SECRET_KEY", "s"),
            ("S3_ADDRESSING_STYLE", "sideways"),
        ]);
        assert_matches!(result, Err(ConfigError::Invalid { key: "S3_ADDRESSING_STYLE", .. }));
    }
}
