//! Merges one cycle's samples into a `SystemUsage`, degrading each failed
//! measurement to zero on its own.

use tracing::warn;

use crate::error::SampleError;
use crate::sampler::Throughput;
use crate::types::SystemUsage;

/// Raw results of one sampling pass, failures included.
#[derive(Debug)]
pub struct CycleSamples {
    pub cpu: Result<u8, SampleError>,
    pub memory: Result<u8, SampleError>,
    pub throughput: Result<Throughput, SampleError>,
    pub wifi_clients: Result<u32, SampleError>,
}

pub fn assemble(samples: CycleSamples) -> SystemUsage {
    let throughput = or_zero("throughput", samples.throughput);
    SystemUsage {
        cpu_usage_percent: or_zero("cpu", samples.cpu).min(100),
        memory_usage_percent: or_zero("memory", samples.memory).min(100),
        download_mbps: throughput.download_mbps.max(0.0),
        upload_mbps: throughput.upload_mbps.max(0.0),
        wifi_clients: or_zero("wifi_clients", samples.wifi_clients),
    }
}

fn or_zero<T: Default>(field: &'static str, result: Result<T, SampleError>) -> T {
    result.unwrap_or_else(|e| {
        warn!(field, error = %e, "sample failed, reporting zero");
        T::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failure_only_zeroes_its_own_field() {
        let usage = assemble(CycleSamples {
            cpu: Err(SampleError::DivisionByZero),
            memory: Ok(61),
            throughput: Ok(Throughput {
                download_mbps: 12.5,
                upload_mbps: 0.75,
            }),
            wifi_clients: Ok(4),
        });
        assert_eq!(
            usage,
            SystemUsage {
                cpu_usage_percent: 0,
                memory_usage_percent: 61,
                download_mbps: 12.5,
                upload_mbps: 0.75,
                wifi_clients: 4,
            }
        );
    }

    #[test]
    fn everything_failing_still_assembles() {
        let usage = assemble(CycleSamples {
            cpu: Err(SampleError::InvalidState("first sample".into())),
            memory: Err(SampleError::MissingField("MemAvailable")),
            throughput: Err(SampleError::ParseFailure("rx_bytes".into())),
            wifi_clients: Err(SampleError::Timeout(std::time::Duration::from_secs(3))),
        });
        assert_eq!(usage, SystemUsage::default());
    }
}
