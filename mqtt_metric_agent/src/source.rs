//! Raw kernel counters: /proc/stat, /proc/meminfo and per-interface byte
//! counters under /sys/class/net.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SampleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    RxBytes,
    TxBytes,
}

impl CounterKind {
    pub fn file_name(self) -> &'static str {
        match self {
            CounterKind::RxBytes => "rx_bytes",
            CounterKind::TxBytes => "tx_bytes",
        }
    }
}

/// Read access to the counters the sampler needs. Implementations hold no
/// state of their own; every call goes back to the source.
pub trait CounterSource: Send + Sync {
    /// The aggregate `cpu ...` line of /proc/stat.
    fn read_cpu_line(&self) -> Result<String, SampleError>;

    /// /proc/meminfo as `key -> value` (kB), keys without the trailing colon.
    fn read_mem_info(&self) -> Result<HashMap<String, u64>, SampleError>;

    fn read_interface_counter(&self, iface: &str, kind: CounterKind) -> Result<u64, SampleError>;
}

/// Reads the real procfs/sysfs files. Roots are configurable so tests can
/// point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new("/proc", "/sys")
    }
}

impl ProcfsSource {
    pub fn new(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    fn interface_counter_path(&self, iface: &str, kind: CounterKind) -> PathBuf {
        self.sys_root
            .join("class/net")
            .join(iface)
            .join("statistics")
            .join(kind.file_name())
    }
}

fn read(path: &Path) -> Result<String, SampleError> {
    fs::read_to_string(path).map_err(|source| SampleError::CounterUnavailable {
        path: path.display().to_string(),
        source,
    })
}

impl CounterSource for ProcfsSource {
    fn read_cpu_line(&self) -> Result<String, SampleError> {
        let stat = read(&self.proc_root.join("stat"))?;
        // "cpu  user nice system idle iowait irq softirq steal ..."; per-core lines are "cpuN"
        stat.lines()
            .find(|line| line.split_whitespace().next() == Some("cpu"))
            .map(str::to_owned)
            .ok_or_else(|| SampleError::ParseFailure("no aggregate cpu line in stat".into()))
    }

    fn read_mem_info(&self) -> Result<HashMap<String, u64>, SampleError> {
        let meminfo = read(&self.proc_root.join("meminfo"))?;
        parse_meminfo(&meminfo)
    }

    fn read_interface_counter(&self, iface: &str, kind: CounterKind) -> Result<u64, SampleError> {
        if iface.is_empty() || iface.contains('/') || iface == "." || iface == ".." {
            return Err(SampleError::InvalidState(format!(
                "bad interface name {iface:?}"
            )));
        }
        let raw = read(&self.interface_counter_path(iface, kind))?;
        raw.trim().parse::<u64>().map_err(|e| {
            SampleError::ParseFailure(format!("{iface}/{}: {e}", kind.file_name()))
        })
    }
}

/// Keys whose values the sampler depends on. A garbled value here is a parse
/// failure; anywhere else the line is skipped.
const REQUIRED_MEMINFO_KEYS: [&str; 2] = ["MemTotal", "MemAvailable"];

/// Parses `Key:   value kB` lines into `key -> value`.
pub fn parse_meminfo(text: &str) -> Result<HashMap<String, u64>, SampleError> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let (Some(key), Some(value)) = (it.next(), it.next()) else {
            continue;
        };
        let key = key.trim_end_matches(':');
        match value.parse::<u64>() {
            Ok(v) => {
                out.insert(key.to_string(), v);
            }
            Err(e) if REQUIRED_MEMINFO_KEYS.contains(&key) => {
                return Err(SampleError::ParseFailure(format!("meminfo {key}: {e}")));
            }
            Err(_) => {}
        }
    }
    Ok(out)
}
