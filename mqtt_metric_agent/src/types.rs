//! The record published every cycle.
//! Keep this module minimal and stable: it defines the wire format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "UsagePayload", try_from = "UsagePayload")]
pub struct SystemUsage {
    pub cpu_usage_percent: u8,
    pub memory_usage_percent: u8,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub wifi_clients: u32,
}

impl SystemUsage {
    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// JSON shape consumers rely on: fixed field names, every value a string,
/// throughput with two decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsagePayload {
    #[serde(rename = "CPUUsage")]
    pub cpu_usage: String,
    #[serde(rename = "MemoryUsage")]
    pub memory_usage: String,
    #[serde(rename = "Download")]
    pub download: String,
    #[serde(rename = "Upload")]
    pub upload: String,
    #[serde(rename = "WifiClients")]
    pub wifi_clients: String,
}

impl From<SystemUsage> for UsagePayload {
    fn from(u: SystemUsage) -> Self {
        UsagePayload {
            cpu_usage: u.cpu_usage_percent.to_string(),
            memory_usage: u.memory_usage_percent.to_string(),
            download: format!("{:.2}", u.download_mbps),
            upload: format!("{:.2}", u.upload_mbps),
            wifi_clients: u.wifi_clients.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid {field} value {value:?}")]
pub struct PayloadFieldError {
    pub field: &'static str,
    pub value: String,
}

fn percent(field: &'static str, value: &str) -> Result<u8, PayloadFieldError> {
    value
        .parse::<u8>()
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| PayloadFieldError {
            field,
            value: value.to_string(),
        })
}

fn rate(field: &'static str, value: &str) -> Result<f64, PayloadFieldError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| PayloadFieldError {
            field,
            value: value.to_string(),
        })
}

impl TryFrom<UsagePayload> for SystemUsage {
    type Error = PayloadFieldError;

    fn try_from(p: UsagePayload) -> Result<Self, Self::Error> {
        Ok(SystemUsage {
            cpu_usage_percent: percent("CPUUsage", &p.cpu_usage)?,
            memory_usage_percent: percent("MemoryUsage", &p.memory_usage)?,
            download_mbps: rate("Download", &p.download)?,
            upload_mbps: rate("Upload", &p.upload)?,
            wifi_clients: p.wifi_clients.parse().map_err(|_| PayloadFieldError {
                field: "WifiClients",
                value: p.wifi_clients.clone(),
            })?,
        })
    }
}
