//! ## Server Configuration Module
//!
//! Defines [`SserverConfig`], the TOML configuration surface of the server:
//! listen options, per-chain Kafka topics, difficulty bounds, the user-list
//! API, ZooKeeper for server-id acquisition, and the metrics exporter.
//!
//! `validate()` turns the raw file into a [`ValidatedConfig`], refusing to
//! start on anything out of range. Dev-only options are accepted but warned
//! about loudly.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{SserverError, SserverResult};

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_true() -> bool {
    true
}

fn default_tcp_read_timeout() -> u64 {
    600
}

fn default_mining_notify_interval() -> u64 {
    30
}

fn default_diff_adjust_period() -> u64 {
    300
}

fn default_share_avg_seconds() -> u64 {
    10
}

fn default_dev_fixed_difficulty() -> f64 {
    1.0
}

fn default_exporter_address() -> String {
    "0.0.0.0".to_string()
}

fn default_exporter_port() -> u16 {
    8080
}

fn default_exporter_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SserverConfig {
    pub sserver: ServerSection,
    #[serde(default)]
    pub kafka: Option<KafkaSection>,
    #[serde(default)]
    pub chains: Vec<ChainSection>,
    pub users: UsersSection,
    #[serde(default)]
    pub zookeeper: Option<ZookeeperSection>,
    #[serde(default)]
    pub prometheus: PrometheusSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 0 means "acquire a unique id from the coordination service".
    #[serde(default)]
    pub id: u32,
    #[serde(default = "default_true")]
    pub accept_stale: bool,
    #[serde(default = "default_tcp_read_timeout")]
    pub tcp_read_timeout: u64,
    /// New name; overrides `max_job_delay` when both are present.
    #[serde(default)]
    pub max_job_lifetime: Option<u64>,
    /// Legacy name for `max_job_lifetime`.
    #[serde(default)]
    pub max_job_delay: Option<u64>,
    #[serde(default = "default_mining_notify_interval")]
    pub mining_notify_interval: u64,

    /// Difficulty bounds, hex strings, all required and non-zero.
    pub default_difficulty: String,
    pub min_difficulty: String,
    pub max_difficulty: String,
    #[serde(default = "default_diff_adjust_period")]
    pub diff_adjust_period: u64,
    #[serde(default = "default_share_avg_seconds")]
    pub share_avg_seconds: u64,

    // dev-only switches
    #[serde(default)]
    pub enable_simulator: bool,
    #[serde(default)]
    pub enable_submit_invalid_block: bool,
    #[serde(default)]
    pub enable_dev_mode: bool,
    #[serde(default = "default_dev_fixed_difficulty")]
    pub dev_fixed_difficulty: f64,

    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    #[serde(default)]
    pub multi_chains: bool,
    // single-chain topic keys, used when multi_chains is false
    #[serde(default)]
    pub share_topic: Option<String>,
    #[serde(default)]
    pub solved_share_topic: Option<String>,
    #[serde(default)]
    pub common_events_topic: Option<String>,
    #[serde(default)]
    pub job_topic: Option<String>,
    #[serde(default)]
    pub file_last_notify_time: Option<PathBuf>,

    #[serde(default)]
    pub zookeeper_lock_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaSection {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSection {
    pub name: String,
    pub kafka_brokers: String,
    pub share_topic: String,
    pub solved_share_topic: String,
    pub common_events_topic: String,
    pub job_topic: String,
    #[serde(default)]
    pub file_last_notify_time: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UsersSection {
    pub list_id_api_url: String,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    /// When set, the updater also passes `last_time` to the user-list API so
    /// coinbase changes re-fetch otherwise unchanged users.
    #[serde(default)]
    pub user_defined_coinbase: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZookeeperSection {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrometheusSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_exporter_address")]
    pub address: String,
    #[serde(default = "default_exporter_port")]
    pub port: u16,
    #[serde(default = "default_exporter_path")]
    pub path: String,
}

impl Default for PrometheusSection {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_exporter_address(),
            port: default_exporter_port(),
            path: default_exporter_path(),
        }
    }
}

/// Difficulty bounds after hex parsing and range checks.
#[derive(Debug, Clone)]
pub struct DifficultyConfig {
    pub default_difficulty: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    pub diff_adjust_period: u64,
    pub share_avg_seconds: u64,
}

/// The configuration after validation: parsed difficulties, the resolved
/// per-chain list (a synthetic "default" chain in single-chain mode), and
/// the resolved job lifetime.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub difficulty: DifficultyConfig,
    pub chains: Vec<ChainSection>,
    pub max_job_lifetime: u64,
}

fn parse_difficulty(name: &str, hex: &str) -> SserverResult<u64> {
    let trimmed = hex.trim().trim_start_matches("0x");
    let value = u64::from_str_radix(trimmed, 16)
        .map_err(|e| SserverError::Config(format!("sserver.{}: bad hex `{}`: {}", name, hex, e)))?;
    if value == 0 {
        return Err(SserverError::Config(format!(
            "sserver.{} must not be zero",
            name
        )));
    }
    Ok(value)
}

impl SserverConfig {
    pub fn from_toml(raw: &str) -> SserverResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> SserverResult<ValidatedConfig> {
        let s = &self.sserver;

        if s.id > 0xff {
            return Err(SserverError::Config(
                "invalid server id, range: [0, 255]".to_string(),
            ));
        }
        if s.id == 0 && self.zookeeper.is_none() {
            return Err(SserverError::Config(
                "sserver.id is 0 but no [zookeeper] section to acquire one from".to_string(),
            ));
        }
        if s.id == 0 && s.zookeeper_lock_path.is_none() {
            return Err(SserverError::Config(
                "sserver.id is 0 but sserver.zookeeper_lock_path is missing".to_string(),
            ));
        }

        let difficulty = DifficultyConfig {
            default_difficulty: parse_difficulty("default_difficulty", &s.default_difficulty)?,
            min_difficulty: parse_difficulty("min_difficulty", &s.min_difficulty)?,
            max_difficulty: parse_difficulty("max_difficulty", &s.max_difficulty)?,
            diff_adjust_period: s.diff_adjust_period,
            share_avg_seconds: s.share_avg_seconds,
        };
        if difficulty.diff_adjust_period == 0 {
            return Err(SserverError::Config(
                "sserver.diff_adjust_period must not be zero".to_string(),
            ));
        }
        if difficulty.diff_adjust_period < difficulty.share_avg_seconds {
            return Err(SserverError::Config(
                "`diff_adjust_period` should not be less than `share_avg_seconds`".to_string(),
            ));
        }

        // the new option name overwrites the legacy one
        let max_job_lifetime = s.max_job_lifetime.or(s.max_job_delay).unwrap_or(300);
        if max_job_lifetime < 300 {
            warn!(
                "[Bad Option] sserver.max_job_lifetime ({} seconds) is too short, \
                 recommended to be 300 seconds or longer",
                max_job_lifetime
            );
        }
        if s.mining_notify_interval >= max_job_lifetime {
            return Err(SserverError::Config(
                "sserver.mining_notify_interval must be less than the job lifetime".to_string(),
            ));
        }

        if s.enable_simulator {
            warn!(
                "[Dev Option] Simulator is enabled, all shares will be accepted. \
                 This option should not be enabled in a production environment!"
            );
        }
        if s.enable_submit_invalid_block {
            warn!(
                "[Dev Option] Submit invalid block is enabled, all shares will become \
                 solved shares. This option should not be enabled in a production environment!"
            );
        }
        if s.enable_dev_mode {
            warn!(
                "[Dev Option] Development mode is enabled with fixed difficulty: {}. \
                 This option should not be enabled in a production environment!",
                s.dev_fixed_difficulty
            );
        }
        if s.accept_stale {
            info!("[Option] stale shares will be accepted");
        }

        if s.enable_tls && (s.tls_cert_file.is_none() || s.tls_key_file.is_none()) {
            return Err(SserverError::Config(
                "sserver.enable_tls requires tls_cert_file and tls_key_file".to_string(),
            ));
        }

        let chains = if s.multi_chains {
            if self.chains.is_empty() {
                return Err(SserverError::Config(
                    "sserver.multi_chains enabled but chains empty".to_string(),
                ));
            }
            self.chains.clone()
        } else {
            let brokers = self
                .kafka
                .as_ref()
                .map(|k| k.brokers.clone())
                .ok_or_else(|| SserverError::Config("kafka.brokers is missing".to_string()))?;
            let topic = |name: &str, value: &Option<String>| {
                value
                    .clone()
                    .ok_or_else(|| SserverError::Config(format!("sserver.{} is missing", name)))
            };
            vec![ChainSection {
                name: "default".to_string(),
                kafka_brokers: brokers,
                share_topic: topic("share_topic", &s.share_topic)?,
                solved_share_topic: topic("solved_share_topic", &s.solved_share_topic)?,
                common_events_topic: topic("common_events_topic", &s.common_events_topic)?,
                job_topic: topic("job_topic", &s.job_topic)?,
                file_last_notify_time: s.file_last_notify_time.clone(),
            }]
        };

        Ok(ValidatedConfig {
            difficulty,
            chains,
            max_job_lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
            [sserver]
            id = 1
            default_difficulty = "4000"
            min_difficulty = "40"
            max_difficulty = "4000000000"
            share_topic = "ShareLog"
            solved_share_topic = "SolvedShare"
            common_events_topic = "CommonEvents"
            job_topic = "StratumJob"

            [kafka]
            brokers = "127.0.0.1:9092"

            [users]
            list_id_api_url = "http://127.0.0.1:8000/userlist"
        "#
        .to_string()
    }

    #[test]
    fn test_defaults_applied() {
        let config = SserverConfig::from_toml(&base_toml()).unwrap();
        assert_eq!(config.sserver.ip, "0.0.0.0");
        assert_eq!(config.sserver.port, 3333);
        assert!(config.sserver.accept_stale);
        assert_eq!(config.sserver.tcp_read_timeout, 600);
        assert_eq!(config.sserver.mining_notify_interval, 30);
        assert!(config.users.case_insensitive);
        assert!(!config.prometheus.enabled);
        assert_eq!(config.prometheus.port, 8080);

        let validated = config.validate().unwrap();
        assert_eq!(validated.max_job_lifetime, 300);
        assert_eq!(validated.chains.len(), 1);
        assert_eq!(validated.chains[0].name, "default");
        assert_eq!(validated.difficulty.default_difficulty, 0x4000);
    }

    #[test]
    fn test_legacy_max_job_delay_is_recognized() {
        let toml = base_toml().replace("id = 1", "id = 1\nmax_job_delay = 600");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert_eq!(config.validate().unwrap().max_job_lifetime, 600);

        // the new name wins when both are given
        let toml = base_toml().replace("id = 1", "id = 1\nmax_job_delay = 600\nmax_job_lifetime = 900");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert_eq!(config.validate().unwrap().max_job_lifetime, 900);
    }

    #[test]
    fn test_zero_difficulty_rejected() {
        let toml = base_toml().replace("\"40\"", "\"0\"");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adjust_period_must_cover_avg_seconds() {
        let toml = base_toml().replace("id = 1", "id = 1\ndiff_adjust_period = 5");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notify_interval_must_be_below_lifetime() {
        let toml = base_toml().replace("id = 1", "id = 1\nmining_notify_interval = 300");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_chains_requires_chain_entries() {
        let toml = base_toml().replace("id = 1", "id = 1\nmulti_chains = true");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_chains_config() {
        let toml = r#"
            [sserver]
            id = 2
            multi_chains = true
            default_difficulty = "4000"
            min_difficulty = "40"
            max_difficulty = "4000000000"

            [[chains]]
            name = "btc"
            kafka_brokers = "10.0.0.1:9092"
            share_topic = "BtcShareLog"
            solved_share_topic = "BtcSolvedShare"
            common_events_topic = "BtcCommonEvents"
            job_topic = "BtcJob"
            file_last_notify_time = "/tmp/btc_notify"

            [[chains]]
            name = "bcc"
            kafka_brokers = "10.0.0.2:9092"
            share_topic = "BccShareLog"
            solved_share_topic = "BccSolvedShare"
            common_events_topic = "BccCommonEvents"
            job_topic = "BccJob"

            [users]
            list_id_api_url = "http://127.0.0.1:8000/userlist"
        "#;
        let config = SserverConfig::from_toml(toml).unwrap();
        let validated = config.validate().unwrap();
        assert_eq!(validated.chains.len(), 2);
        assert_eq!(validated.chains[1].name, "bcc");
        assert!(validated.chains[1].file_last_notify_time.is_none());
    }

    #[test]
    fn test_auto_server_id_requires_zookeeper() {
        let toml = base_toml().replace("id = 1", "id = 0");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let toml = base_toml().replace("id = 1", "id = 1\nenable_tls = true");
        let config = SserverConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }
}
