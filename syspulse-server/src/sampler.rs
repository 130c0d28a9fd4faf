use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use syspulse_proto::{
    AddressFamily, CoreMetric, CpuTimes, CpuUtilization, NetworkInfo, NetworkInterface, OsInfo,
    Snapshot, UNAVAILABLE, UsageMetric,
};
use time::OffsetDateTime;

use crate::{
    delta::DeltaEngine,
    format::{format_bytes, format_uptime, percent},
};

#[derive(Debug, Clone)]
pub struct CoreInfo {
    pub model: String,
    pub speed_mhz: u64,
}

/// Capacity and availability of one storage pool, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub total: u64,
    pub free: u64,
}

/// Where raw host counters come from. Implementations hide the platform.
pub trait TelemetrySource: Send + Sync {
    fn os_info(&self) -> OsInfo;

    fn cpu_info(&self) -> Vec<CoreInfo>;

    fn cpu_times(&self) -> Result<Vec<CpuTimes>, PartialDataError>;

    fn memory(&self) -> Result<Capacity, PartialDataError>;

    fn disk(&self) -> Result<Capacity, PartialDataError>;

    fn interfaces(&self) -> Result<Vec<NetworkInterface>, PartialDataError>;

    fn uptime(&self) -> u64;
}

/// One telemetry subsystem could not be read; its fields carry sentinels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartialDataError {
    #[error("cpu counters unavailable: {0}")]
    Cpu(String),
    #[error("memory unavailable: {0}")]
    Memory(String),
    #[error("disk usage unavailable: {0}")]
    Disk(String),
    #[error("network interfaces unavailable: {0}")]
    Network(String),
}

#[derive(Debug)]
pub struct Sampled {
    pub snapshot: Snapshot,
    pub degraded: Vec<PartialDataError>,
}

pub struct Sampler {
    source: Box<dyn TelemetrySource>,
    delta: DeltaEngine,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("mode", &self.delta.mode())
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(source: impl TelemetrySource + 'static, delta: DeltaEngine) -> Self {
        Sampler {
            source: Box::new(source),
            delta,
        }
    }

    /// Always yields a snapshot; subsystems that failed are listed in `degraded`.
    pub fn sample(&self) -> Sampled {
        let mut degraded = Vec::new();
        let os = self.source.os_info();

        let cpu = self.sample_cpu().unwrap_or_else(|e| {
            let cores = self.source.cpu_info();
            degraded.push(e);
            unavailable_cores(&cores)
        });

        let memory = self.source.memory().map(usage).unwrap_or_else(|e| {
            degraded.push(e);
            UsageMetric::unavailable()
        });

        let disk = self.source.disk().map(usage).unwrap_or_else(|e| {
            degraded.push(e);
            UsageMetric::unavailable()
        });

        let interface_table = self.source.interfaces().unwrap_or_else(|e| {
            degraded.push(e);
            Vec::new()
        });

        let uptime_seconds = self.source.uptime();

        let snapshot = Snapshot {
            sampled_at: OffsetDateTime::now_utc(),
            network: NetworkInfo {
                private_address: select_private_address(&interface_table),
                hostname: os.hostname.clone(),
                interface_table,
            },
            os,
            cpu,
            memory,
            disk,
            uptime_seconds,
            uptime_formatted: format_uptime(uptime_seconds),
        };

        Sampled { snapshot, degraded }
    }

    /// [`Sampler::sample`] on the blocking pool. Host reads touch procfs, mounts
    /// and interface tables, any of which can stall.
    pub async fn sample_blocking(self: Arc<Self>) -> Result<Sampled, tokio::task::JoinError> {
        tokio::task::spawn_blocking(move || self.sample()).await
    }

    fn sample_cpu(&self) -> Result<Vec<CoreMetric>, PartialDataError> {
        let times = self.source.cpu_times()?;
        let cores = self.source.cpu_info();
        let utilization = self.delta.utilization(&times, Instant::now());

        Ok(times
            .into_iter()
            .zip(utilization)
            .enumerate()
            .map(|(i, (times, utilization))| {
                let info = cores.get(i);
                CoreMetric {
                    core_index: i + 1,
                    model: info.map_or_else(|| UNAVAILABLE.to_owned(), |c| c.model.clone()),
                    clock_speed_mhz: info.map_or(0, |c| c.speed_mhz),
                    utilization,
                    times,
                }
            })
            .collect())
    }
}

fn unavailable_cores(cores: &[CoreInfo]) -> Vec<CoreMetric> {
    cores
        .iter()
        .enumerate()
        .map(|(i, info)| CoreMetric {
            core_index: i + 1,
            model: info.model.clone(),
            clock_speed_mhz: info.speed_mhz,
            utilization: CpuUtilization::default(),
            times: CpuTimes::default(),
        })
        .collect()
}

pub fn usage(Capacity { total, free }: Capacity) -> UsageMetric {
    let free = free.min(total);
    let used = total - free;
    UsageMetric {
        total: format_bytes(total),
        free: format_bytes(free),
        used: format_bytes(used),
        total_bytes: total,
        free_bytes: free,
        used_bytes: used,
        used_percent: percent(used, total),
        free_percent: percent(free, total),
    }
}

/// The last non-internal IPv4 address in enumeration order. Which interface
/// that is depends on how the host orders its interfaces.
pub fn select_private_address(interfaces: &[NetworkInterface]) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .flat_map(|iface| iface.addresses.iter())
        .filter(|addr| addr.family == AddressFamily::IPv4 && !addr.internal)
        .filter_map(|addr| match addr.address {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .last()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::IpAddr;

    use syspulse_proto::InterfaceAddress;

    use super::*;

    /// Fixed counters for deterministic sampling.
    #[derive(Debug, Clone)]
    pub struct FixedSource {
        pub cores: Vec<CoreInfo>,
        pub times: Result<Vec<CpuTimes>, PartialDataError>,
        pub memory: Result<Capacity, PartialDataError>,
        pub disk: Result<Capacity, PartialDataError>,
        pub interfaces: Result<Vec<NetworkInterface>, PartialDataError>,
        pub uptime: u64,
    }

    impl Default for FixedSource {
        fn default() -> Self {
            FixedSource {
                cores: vec![CoreInfo {
                    model: "Test CPU @ 2.40GHz".into(),
                    speed_mhz: 2400,
                }],
                times: Ok(vec![CpuTimes {
                    user: 200,
                    system: 100,
                    idle: 700,
                    ..Default::default()
                }]),
                memory: Ok(Capacity {
                    total: 8 * 1024 * 1024 * 1024,
                    free: 2 * 1024 * 1024 * 1024,
                }),
                disk: Ok(Capacity {
                    total: 500 * 1024 * 1024 * 1024,
                    free: 125 * 1024 * 1024 * 1024,
                }),
                interfaces: Ok(vec![
                    interface("lo", "127.0.0.1", true),
                    interface("eth0", "10.0.0.5", false),
                ]),
                uptime: 90_061,
            }
        }
    }

    pub fn interface(name: &str, address: &str, internal: bool) -> NetworkInterface {
        let address: IpAddr = address.parse().unwrap();
        let (family, netmask, prefix) = match address {
            IpAddr::V4(_) => (AddressFamily::IPv4, "255.255.255.0".parse().unwrap(), 24),
            IpAddr::V6(_) => (AddressFamily::IPv6, "ffff:ffff:ffff:ffff::".parse().unwrap(), 64),
        };
        NetworkInterface {
            name: name.to_owned(),
            addresses: vec![InterfaceAddress {
                address,
                netmask,
                family,
                mac: None,
                internal,
                cidr: format!("{address}/{prefix}"),
            }],
        }
    }

    impl TelemetrySource for FixedSource {
        fn os_info(&self) -> OsInfo {
            OsInfo {
                platform: "linux".into(),
                kernel_type: "Linux".into(),
                release_version: "6.1.0".into(),
                architecture: "x86_64".into(),
                hostname: "testbox".into(),
            }
        }

        fn cpu_info(&self) -> Vec<CoreInfo> {
            self.cores.clone()
        }

        fn cpu_times(&self) -> Result<Vec<CpuTimes>, PartialDataError> {
            self.times.clone()
        }

        fn memory(&self) -> Result<Capacity, PartialDataError> {
            self.memory.clone()
        }

        fn disk(&self) -> Result<Capacity, PartialDataError> {
            self.disk.clone()
        }

        fn interfaces(&self) -> Result<Vec<NetworkInterface>, PartialDataError> {
            self.interfaces.clone()
        }

        fn uptime(&self) -> u64 {
            self.uptime
        }
    }
}
