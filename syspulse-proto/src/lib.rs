use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod msg;

/// Sentinel shown in place of a formatted value when its subsystem could not be read.
pub const UNAVAILABLE: &str = "N/A";

/// One telemetry sample. Built once per tick and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub sampled_at: OffsetDateTime,
    pub os: OsInfo,
    pub cpu: Vec<CoreMetric>,
    pub memory: UsageMetric,
    pub disk: UsageMetric,
    pub network: NetworkInfo,
    pub uptime_seconds: u64,
    pub uptime_formatted: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub platform: String,
    pub kernel_type: String,
    pub release_version: String,
    pub architecture: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreMetric {
    /// 1-based.
    pub core_index: usize,
    pub model: String,
    pub clock_speed_mhz: u64,
    pub utilization: CpuUtilization,
    pub times: CpuTimes,
}

/// Time-in-state percentages, one decimal each.
///
/// `other` collects every state besides user, system and idle, so the four
/// fields add up to 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUtilization {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
    pub other: f64,
}

impl CpuUtilization {
    pub fn total(&self) -> f64 {
        self.user + self.system + self.idle + self.other
    }
}

/// Raw per-core time-in-state counters, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Everything outside user, system and idle.
    pub fn other(&self) -> u64 {
        self.nice + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Field-wise difference, clamped at zero for counters that went backwards.
    pub fn saturating_sub(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
        }
    }
}

/// Total/free/used triple for memory and disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetric {
    pub total: String,
    pub free: String,
    pub used: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
    pub free_percent: f64,
}

impl UsageMetric {
    pub fn unavailable() -> Self {
        UsageMetric {
            total: UNAVAILABLE.to_owned(),
            free: UNAVAILABLE.to_owned(),
            used: UNAVAILABLE.to_owned(),
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: 0,
            used_percent: 0.0,
            free_percent: 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.total != UNAVAILABLE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub private_address: Option<Ipv4Addr>,
    pub hostname: String,
    pub interface_table: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub netmask: IpAddr,
    pub family: AddressFamily,
    pub mac: Option<String>,
    pub internal: bool,
    pub cidr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}
