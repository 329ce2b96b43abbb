//! Converts raw counters into rates: CPU % from /proc/stat tick deltas,
//! memory % from meminfo, and interface throughput over a short window.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::SampleError;
use crate::source::{CounterKind, CounterSource};
use crate::state::{CpuCounterState, CpuTicks};

/// How long throughput sampling waits between the two byte snapshots.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

const BITS_PER_BYTE: f64 = 8.0;
const BYTES_PER_MEBIBYTE: f64 = 1_048_576.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Throughput {
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

#[derive(Debug, Clone, Copy)]
struct InterfaceByteSample {
    rx_bytes: u64,
    tx_bytes: u64,
    taken_at: Instant,
}

pub struct RateSampler<S> {
    source: S,
    cpu: CpuCounterState,
}

impl<S: CounterSource> RateSampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cpu: CpuCounterState::default(),
        }
    }

    /// Busy share of CPU time since the previous call, 0..=100.
    ///
    /// The stored baseline is replaced only once the line was read and parsed,
    /// so a bad read leaves the previous reading intact. The very first call
    /// records a baseline and fails with `InvalidState`.
    pub fn sample_cpu(&mut self) -> Result<u8, SampleError> {
        let line = self.source.read_cpu_line()?;
        let now = parse_cpu_line(&line)?;
        match self.cpu.replace(now) {
            Some(prev) => cpu_percent(prev, now),
            None => Err(SampleError::InvalidState(
                "no previous cpu reading, baseline recorded".into(),
            )),
        }
    }

    pub fn sample_memory(&self) -> Result<u8, SampleError> {
        let info = self.source.read_mem_info()?;
        let total = *info
            .get("MemTotal")
            .ok_or(SampleError::MissingField("MemTotal"))?;
        let available = *info
            .get("MemAvailable")
            .ok_or(SampleError::MissingField("MemAvailable"))?;
        memory_percent(total, available)
    }

    /// Blocks the calling task for the whole window.
    pub async fn sample_throughput(&self, iface: &str) -> Result<Throughput, SampleError> {
        let start = self.snapshot(iface)?;
        sleep(THROUGHPUT_WINDOW).await;
        let end = self.snapshot(iface)?;
        throughput_between(&start, &end)
    }

    fn snapshot(&self, iface: &str) -> Result<InterfaceByteSample, SampleError> {
        let taken_at = Instant::now();
        let rx_bytes = self
            .source
            .read_interface_counter(iface, CounterKind::RxBytes)?;
        let tx_bytes = self
            .source
            .read_interface_counter(iface, CounterKind::TxBytes)?;
        Ok(InterfaceByteSample {
            rx_bytes,
            tx_bytes,
            taken_at,
        })
    }
}

/// `cpu  user nice system idle iowait irq softirq steal guest guest_nice`:
/// total is the sum of every field after the label, idle the 4th.
pub fn parse_cpu_line(line: &str) -> Result<CpuTicks, SampleError> {
    let mut it = line.split_whitespace();
    if it.next() != Some("cpu") {
        return Err(SampleError::ParseFailure(format!(
            "not an aggregate cpu line: {line:?}"
        )));
    }
    let ticks = it
        .map(|tok| {
            tok.parse::<u64>()
                .map_err(|e| SampleError::ParseFailure(format!("cpu field {tok:?}: {e}")))
        })
        .collect::<Result<Vec<u64>, _>>()?;
    if ticks.len() < 4 {
        return Err(SampleError::ParseFailure(format!(
            "cpu line has {} fields, need at least 4",
            ticks.len()
        )));
    }
    let total = ticks.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
    Ok(CpuTicks {
        total,
        idle: ticks[3],
    })
}

pub fn cpu_percent(prev: CpuTicks, now: CpuTicks) -> Result<u8, SampleError> {
    if now.total < prev.total || now.idle < prev.idle {
        return Err(SampleError::InvalidState("cpu counters went backwards".into()));
    }
    let d_total = now.total - prev.total;
    if d_total == 0 {
        return Err(SampleError::DivisionByZero);
    }
    let d_busy = d_total.saturating_sub(now.idle - prev.idle);
    let pct = u128::from(d_busy) * 100 / u128::from(d_total);
    Ok(pct.min(100) as u8)
}

/// `100 * (1 - available/total)` truncated, done in integers so 70% used
/// does not come out as 69.
pub fn memory_percent(total: u64, available: u64) -> Result<u8, SampleError> {
    if total == 0 {
        return Err(SampleError::InvalidState("total memory is zero".into()));
    }
    let used = total.saturating_sub(available);
    Ok((u128::from(used) * 100 / u128::from(total)) as u8)
}

fn throughput_between(
    start: &InterfaceByteSample,
    end: &InterfaceByteSample,
) -> Result<Throughput, SampleError> {
    let secs = end.taken_at.duration_since(start.taken_at).as_secs_f64();
    if secs <= 0.0 {
        return Err(SampleError::InvalidState(
            "throughput window has zero length".into(),
        ));
    }
    // A counter that moved backwards was reset (interface bounced); report 0.
    let mbps = |from: u64, to: u64| {
        to.saturating_sub(from) as f64 / secs * BITS_PER_BYTE / BYTES_PER_MEBIBYTE
    };
    Ok(Throughput {
        download_mbps: mbps(start.rx_bytes, end.rx_bytes),
        upload_mbps: mbps(start.tx_bytes, end.tx_bytes),
    })
}
