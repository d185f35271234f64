use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_INTERVAL_SECONDS: f64 = 5.0;
const DEFAULT_SENSOR_REFRESH_SECONDS: f64 = 5.0;
const DEFAULT_SYSTEM_REFRESH_SECONDS: f64 = 60.0;
const SENSOR_STALE_SECONDS: f64 = 60.0;

// Pacing between readings inside one batch. The sensor cache is already
// asynchronous, so this is a throughput knob, not a sensor latency.
const INTRA_BATCH_DELAY_DEFAULT: Duration = Duration::from_millis(500);
const INTRA_BATCH_DELAY_FAST: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Deserialize)]
struct ConfigDocument {
    user: Option<String>,
    account: Option<String>,
    url: Option<String>,
    role: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    pipe: Option<String>,
    channel_name: Option<String>,
    pat: Option<String>,
    private_key_file: Option<PathBuf>,
    batch_size: Option<usize>,
    interval_seconds: Option<f64>,
    fast: Option<bool>,
    sensor_refresh_seconds: Option<f64>,
    system_refresh_seconds: Option<f64>,
}

/// Authentication mode: exactly one of the two must be configured.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    StaticBearer(String),
    KeyPair { private_key_file: PathBuf },
}

/// CLI flags that override values from the config document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub batch_size: Option<usize>,
    pub interval_seconds: Option<f64>,
    pub fast: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub user: String,
    pub account: String,
    pub url: String,
    pub role: String,
    pub database: String,
    pub schema: String,
    pub pipe: String,
    pub channel_name: String,
    pub auth: AuthConfig,
    pub batch_size: usize,
    pub interval_seconds: f64,
    pub fast: bool,
    pub sensor_refresh_seconds: f64,
    pub system_refresh_seconds: f64,
}

impl Config {
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let document: ConfigDocument = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in config file {}", path.display()))?;
        Self::from_document(document, overrides)
    }

    fn from_document(document: ConfigDocument, overrides: Overrides) -> Result<Self> {
        // Blank values count as absent so a filled-in template parses.
        let pat = document
            .pat
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let private_key_file = document
            .private_key_file
            .filter(|path| !path.as_os_str().is_empty());
        let auth = match (pat, private_key_file) {
            (Some(pat), None) => AuthConfig::StaticBearer(pat),
            (None, Some(private_key_file)) => AuthConfig::KeyPair {
                private_key_file,
            },
            (Some(_), Some(_)) => {
                bail!("config must set exactly one of 'pat' or 'private_key_file', not both")
            }
            (None, None) => bail!("config must set one of 'pat' or 'private_key_file'"),
        };

        let batch_size = overrides
            .batch_size
            .or(document.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        let interval_seconds = overrides
            .interval_seconds
            .or(document.interval_seconds)
            .unwrap_or(DEFAULT_INTERVAL_SECONDS);
        if !interval_seconds.is_finite() || interval_seconds < 0.0 {
            bail!("interval_seconds must be a non-negative number");
        }

        let url = required(document.url, "url")?
            .trim_end_matches('/')
            .to_string();
        Url::parse(&url).context("invalid 'url' in config")?;

        Ok(Self {
            user: required(document.user, "user")?,
            account: required(document.account, "account")?,
            url,
            role: required(document.role, "role")?,
            database: required(document.database, "database")?,
            schema: required(document.schema, "schema")?,
            pipe: required(document.pipe, "pipe")?,
            channel_name: required(document.channel_name, "channel_name")?,
            auth,
            batch_size,
            interval_seconds,
            fast: overrides.fast || document.fast.unwrap_or(false),
            sensor_refresh_seconds: document
                .sensor_refresh_seconds
                .unwrap_or(DEFAULT_SENSOR_REFRESH_SECONDS),
            system_refresh_seconds: document
                .system_refresh_seconds
                .unwrap_or(DEFAULT_SYSTEM_REFRESH_SECONDS),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_seconds)
    }

    pub fn intra_batch_delay(&self) -> Duration {
        if self.fast {
            INTRA_BATCH_DELAY_FAST
        } else {
            INTRA_BATCH_DELAY_DEFAULT
        }
    }

    pub fn sensor_refresh(&self) -> Duration {
        Duration::from_secs_f64(self.sensor_refresh_seconds.max(0.0))
    }

    pub fn sensor_stale_after(&self) -> Duration {
        Duration::from_secs_f64(SENSOR_STALE_SECONDS)
    }

    pub fn system_refresh(&self) -> Duration {
        Duration::from_secs_f64(self.system_refresh_seconds.max(0.0))
    }
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    value.with_context(|| format!("missing required config key '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_document() -> serde_json::Value {
        serde_json::json!({
            "user": "pi_agent",
            "account": "myorg-account1",
            "url": "https://myorg-account1.snowflakecomputing.com",
            "role": "ingest_role",
            "database": "sensors",
            "schema": "raw",
            "pipe": "thermal_pipe",
            "channel_name": "pi_channel_1",
            "pat": "secret-token"
        })
    }

    fn parse(value: serde_json::Value, overrides: Overrides) -> Result<Config> {
        let document: ConfigDocument = serde_json::from_value(value).unwrap();
        Config::from_document(document, overrides)
    }

    #[test]
    fn parses_minimal_document_with_defaults() {
        let config = parse(base_document(), Overrides::default()).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.interval_seconds, 5.0);
        assert!(!config.fast);
        assert_eq!(config.intra_batch_delay(), Duration::from_millis(500));
        assert!(matches!(config.auth, AuthConfig::StaticBearer(_)));
    }

    #[test]
    fn rejects_missing_required_key() {
        let mut doc = base_document();
        doc.as_object_mut().unwrap().remove("pipe");
        let err = parse(doc, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("pipe"));
    }

    #[test]
    fn rejects_both_auth_methods() {
        let mut doc = base_document();
        doc["private_key_file"] = serde_json::json!("/etc/keys/rsa_key.p8");
        let err = parse(doc, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn rejects_no_auth_method() {
        let mut doc = base_document();
        doc.as_object_mut().unwrap().remove("pat");
        assert!(parse(doc, Overrides::default()).is_err());
    }

    #[test]
    fn blank_auth_values_count_as_absent() {
        let mut doc = base_document();
        doc["pat"] = serde_json::json!("secret-token");
        doc["private_key_file"] = serde_json::json!("");
        let config = parse(doc, Overrides::default()).unwrap();
        assert!(matches!(config.auth, AuthConfig::StaticBearer(_)));

        let mut doc = base_document();
        doc["pat"] = serde_json::json!("   ");
        assert!(parse(doc, Overrides::default()).is_err());
    }

    #[test]
    fn key_pair_mode_selected_by_private_key_file() {
        let mut doc = base_document();
        doc.as_object_mut().unwrap().remove("pat");
        doc["private_key_file"] = serde_json::json!("/etc/keys/rsa_key.p8");
        let config = parse(doc, Overrides::default()).unwrap();
        assert!(matches!(config.auth, AuthConfig::KeyPair { .. }));
    }

    #[test]
    fn overrides_win_over_document_values() {
        let mut doc = base_document();
        doc["batch_size"] = serde_json::json!(50);
        doc["interval_seconds"] = serde_json::json!(30.0);
        let config = parse(
            doc,
            Overrides {
                batch_size: Some(3),
                interval_seconds: Some(1.5),
                fast: true,
            },
        )
        .unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.interval_seconds, 1.5);
        assert_eq!(config.intra_batch_delay(), Duration::from_millis(50));
    }

    #[test]
    fn trailing_slash_on_url_is_dropped() {
        let mut doc = base_document();
        doc["url"] = serde_json::json!("https://myorg-account1.snowflakecomputing.com/");
        let config = parse(doc, Overrides::default()).unwrap();
        assert!(!config.url.ends_with('/'));
    }

    #[test]
    fn rejects_unparseable_url() {
        let mut doc = base_document();
        doc["url"] = serde_json::json!("not a url");
        assert!(parse(doc, Overrides::default()).is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut doc = base_document();
        doc["batch_size"] = serde_json::json!(0);
        assert!(parse(doc, Overrides::default()).is_err());
    }
}
