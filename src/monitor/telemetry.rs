//! Host telemetry sources

use crate::registry::descriptor::MachineStats;
use crate::Result;
use async_trait::async_trait;

/// Samples host resource usage for provider payloads
#[async_trait]
pub trait TelemetryProbe: Send + Sync {
    async fn sample(&self) -> Result<MachineStats>;
}

/// Fixed usage figures with the real processor count.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
}

impl StaticProbe {
    pub fn new(cpu_usage: f64, mem_usage: f64, disk_usage: f64) -> Self {
        Self {
            cpu_usage,
            mem_usage,
            disk_usage,
        }
    }
}

#[async_trait]
impl TelemetryProbe for StaticProbe {
    async fn sample(&self) -> Result<MachineStats> {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(MachineStats {
            cpu_usage: self.cpu_usage,
            mem_usage: self.mem_usage,
            disk_usage: self.disk_usage,
            processors,
        })
    }
}
