use chrono::NaiveTime;
use serde::Deserialize;
use std::path::Path;

use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};

#[derive(Deserialize, Debug, Clone)]
pub struct Portainer {
    /// Host and optional port, e.g. "portainer.local:9443".
    pub host: String,
    pub api_key: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
pub struct Schedule {
    /// Seconds between refresh cycles.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Time of day ("HH:MM") for the daily registry check.
    #[serde(default = "default_update_check_time")]
    pub update_check_time: String,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            update_check_time: default_update_check_time(),
        }
    }
}

fn default_interval() -> u64 {
    30
}

fn default_update_check_time() -> String {
    "02:00".to_string()
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    #[serde(default)]
    pub health_check: bool,
    #[serde(default)]
    pub restart_policy: bool,
    #[serde(default)]
    pub update_check: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Registry {
    pub ghcr: Option<GithubRegistry>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GithubRegistry {
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Dispatcher {
    pub telegram: Option<Telegram>,
    pub slack: Option<Slack>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Telegram {
    pub chat: String,
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Slack {
    pub webhook: String,
    pub channel: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub portainer: Portainer,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub features: FeatureFlags,
    pub registry: Option<Registry>,
    pub dispatcher: Option<Dispatcher>,
}

impl Config {
    /// Time of day for the daily registry check; malformed values fall back
    /// to 02:00.
    pub fn update_check_time(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.schedule.update_check_time, "%H:%M")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(2, 0, 0).unwrap())
    }

    pub fn ghcr_token(&self) -> Option<String> {
        self.registry
            .as_ref()
            .and_then(|registry| registry.ghcr.as_ref())
            .map(|ghcr| ghcr.token.clone())
    }
}

pub fn load_config(config_path: &Path) -> Config {
    let config: Config = Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("PORTWATCH_").split("_"))
        .extract()
        .expect("Failed to load config");
    config
}

#[test]
fn test_load_config() {
    use figment2::Jail;
    Jail::expect_with(|jail: &mut Jail| {
        jail.create_file(
            "portwatch-test.toml",
            r#"
            [portainer]
            host = "portainer.local:9443"
            api_key = "ptr_xxx"
            ssl = true
            verify_ssl = false

            [schedule]
            interval = 10
            update_check_time = "04:30"

            [features]
            update_check = true

            [registry.ghcr]
            token = "ghp_asdfasdf"

            [dispatcher.telegram]
            token = "123456789:qwertyuiopasdfghjkl"
            chat = "123456789"
            "#,
        )?;

        jail.set_env("PORTWATCH_registry_ghcr_token", "ghp_fromenv");

        let config = load_config("portwatch-test.toml".as_ref());

        assert_eq!(config.portainer.host, "portainer.local:9443");
        assert!(config.portainer.ssl);
        assert!(!config.portainer.verify_ssl);
        assert_eq!(config.schedule.interval, 10);
        assert_eq!(
            config.update_check_time(),
            NaiveTime::from_hms_opt(4, 30, 0).unwrap()
        );
        assert!(config.features.update_check);
        assert!(!config.features.health_check);
        assert_eq!(config.ghcr_token(), Some("ghp_fromenv".to_string()));
        assert!(config.dispatcher.unwrap().telegram.is_some());

        Ok(())
    });
}

#[test]
fn test_malformed_check_time_falls_back() {
    let config = Config {
        portainer: Portainer {
            host: "localhost:9000".to_string(),
            api_key: "key".to_string(),
            ssl: false,
            verify_ssl: true,
        },
        schedule: Schedule {
            interval: 30,
            update_check_time: "late".to_string(),
        },
        features: FeatureFlags::default(),
        registry: None,
        dispatcher: None,
    };
    assert_eq!(
        config.update_check_time(),
        NaiveTime::from_hms_opt(2, 0, 0).unwrap()
    );
}
