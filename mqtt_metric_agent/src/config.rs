//! Agent configuration from environment variables, with a few CLI overrides.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BROKER: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_USER: &str = "homeassistant";
pub const DEFAULT_TOPIC: &str = "routers/some_router/some_topic";
pub const DEFAULT_IFACE: &str = "wan";
pub const DEFAULT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_WIFI_CMD: &str = "/etc/config/snmp_wifi_clients.sh";
pub const DEFAULT_WIFI_TIMEOUT_MS: u64 = 3_000;

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WifiConfig {
    pub enabled: bool,
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub topic: String,
    pub interface: String,
    pub interval: Duration,
    pub publish_timeout: Duration,
    pub wifi: WifiConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let or = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let password = get("MQTT_PASS").ok_or(ConfigError::Missing("MQTT_PASS"))?;
        let broker = BrokerConfig {
            host: or("MQTT_BROKER", DEFAULT_BROKER),
            port: parse_num("MQTT_PORT", get("MQTT_PORT"), DEFAULT_PORT)?,
            username: or("MQTT_USER", DEFAULT_USER),
            password,
            // the mqtt client rejects ids with a leading space
            client_id: get("MQTT_CLIENT_ID")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(default_client_id),
        };

        let interval = positive_secs(
            "SLEEP_TIME",
            parse_num("SLEEP_TIME", get("SLEEP_TIME"), DEFAULT_INTERVAL_SECS)?,
        )?;
        let publish_timeout = positive_millis(
            "PUBLISH_TIMEOUT_MS",
            parse_num(
                "PUBLISH_TIMEOUT_MS",
                get("PUBLISH_TIMEOUT_MS"),
                DEFAULT_PUBLISH_TIMEOUT_MS,
            )?,
        )?;
        let wifi = WifiConfig {
            enabled: match get("WIFI_CLIENTS") {
                Some(v) => parse_flag("WIFI_CLIENTS", &v)?,
                None => false,
            },
            command: or("WIFI_CLIENTS_CMD", DEFAULT_WIFI_CMD),
            timeout: positive_millis(
                "WIFI_CLIENTS_TIMEOUT_MS",
                parse_num(
                    "WIFI_CLIENTS_TIMEOUT_MS",
                    get("WIFI_CLIENTS_TIMEOUT_MS"),
                    DEFAULT_WIFI_TIMEOUT_MS,
                )?,
            )?,
        };

        Ok(AgentConfig {
            broker,
            topic: or("MQTT_TOPIC", DEFAULT_TOPIC),
            interface: or("IFACE_NAME", DEFAULT_IFACE),
            interval,
            publish_timeout,
            wifi,
        })
    }

    pub fn apply_overrides(&mut self, o: CliOverrides) -> Result<(), ConfigError> {
        if let Some(iface) = o.iface {
            self.interface = iface;
        }
        if let Some(topic) = o.topic {
            self.topic = topic;
        }
        if let Some(secs) = o.interval {
            let secs = parse_num("--interval", Some(secs), DEFAULT_INTERVAL_SECS)?;
            self.interval = positive_secs("--interval", secs)?;
        }
        Ok(())
    }
}

fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "unknown".into());
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    format!("mqtt-metric-agent-{host}-{now}")
}

fn parse_num<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(zero(name));
    }
    Ok(Duration::from_secs(secs))
}

fn positive_millis(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(zero(name));
    }
    Ok(Duration::from_millis(ms))
}

fn zero(name: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: "0".into(),
        reason: "must be greater than zero".into(),
    }
}

fn parse_flag(name: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: v.to_string(),
            reason: "expected 0/1, true/false, yes/no or on/off".into(),
        }),
    }
}

// ---------- command line ----------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliOverrides {
    pub iface: Option<String>,
    pub topic: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    /// `--help` was given; the usage text.
    Help(String),
    Invalid(String),
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--iface NAME|-i NAME] [--topic TOPIC|-t TOPIC] [--interval SECS]\n\
         Broker settings come from MQTT_BROKER, MQTT_PORT, MQTT_USER, MQTT_PASS (required), \
         MQTT_TOPIC, MQTT_CLIENT_ID; sampling from IFACE_NAME, SLEEP_TIME, PUBLISH_TIMEOUT_MS, \
         WIFI_CLIENTS, WIFI_CLIENTS_CMD, WIFI_CLIENTS_TIMEOUT_MS."
    )
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliOverrides, ArgsError> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "mqtt_metric_agent".into());
    let mut out = CliOverrides::default();

    let missing =
        |flag: &str| ArgsError::Invalid(format!("{flag} needs a value\n{}", usage(&prog)));
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(ArgsError::Help(usage(&prog))),
            "--iface" | "-i" => {
                out.iface = Some(it.next().ok_or_else(|| missing(arg.as_str()))?);
            }
            "--topic" | "-t" => {
                out.topic = Some(it.next().ok_or_else(|| missing(arg.as_str()))?);
            }
            "--interval" => {
                out.interval = Some(it.next().ok_or_else(|| missing(arg.as_str()))?);
            }
            _ => match arg.split_once('=') {
                Some(("--iface", v)) if !v.is_empty() => out.iface = Some(v.to_string()),
                Some(("--topic", v)) if !v.is_empty() => out.topic = Some(v.to_string()),
                Some(("--interval", v)) if !v.is_empty() => out.interval = Some(v.to_string()),
                _ => {
                    return Err(ArgsError::Invalid(format!(
                        "Unexpected argument {arg:?}\n{}",
                        usage(&prog)
                    )))
                }
            },
        }
    }
    Ok(out)
}
