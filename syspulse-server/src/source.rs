use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use syspulse_proto::{
    AddressFamily, CpuTimes, InterfaceAddress, NetworkInterface, OsInfo, UNAVAILABLE,
};

use crate::sampler::{Capacity, CoreInfo, PartialDataError, TelemetrySource};

/// Reads the machine this process runs on.
#[derive(Debug, Clone)]
pub struct HostSource {
    disk_path: PathBuf,
}

impl HostSource {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }
}

impl TelemetrySource for HostSource {
    fn os_info(&self) -> OsInfo {
        OsInfo {
            platform: std::env::consts::OS.to_owned(),
            kernel_type: kernel_type(),
            release_version: System::kernel_version().unwrap_or_else(|| UNAVAILABLE.to_owned()),
            architecture: System::cpu_arch(),
            hostname: System::host_name().unwrap_or_else(|| UNAVAILABLE.to_owned()),
        }
    }

    fn cpu_info(&self) -> Vec<CoreInfo> {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_frequency()),
        );
        system
            .cpus()
            .iter()
            .map(|cpu| CoreInfo {
                model: cpu.brand().trim().to_owned(),
                speed_mhz: cpu.frequency(),
            })
            .collect()
    }

    #[cfg(target_os = "linux")]
    fn cpu_times(&self) -> Result<Vec<CpuTimes>, PartialDataError> {
        let content = std::fs::read_to_string("/proc/stat")
            .map_err(|e| PartialDataError::Cpu(format!("failed to read /proc/stat: {e}")))?;
        parse_proc_stat(&content)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_times(&self) -> Result<Vec<CpuTimes>, PartialDataError> {
        Err(PartialDataError::Cpu(format!(
            "per-core time counters are not supported on {}",
            std::env::consts::OS
        )))
    }

    fn memory(&self) -> Result<Capacity, PartialDataError> {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        let total = system.total_memory();
        if total == 0 {
            return Err(PartialDataError::Memory("host reported no memory".into()));
        }
        Ok(Capacity {
            total,
            free: system.available_memory(),
        })
    }

    fn disk(&self) -> Result<Capacity, PartialDataError> {
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.total_space(), d.available_space()));

        match containing_mount(&self.disk_path, mounts) {
            Some((total, free)) if total > 0 => Ok(Capacity { total, free }),
            Some(_) => Err(PartialDataError::Disk(format!(
                "filesystem holding {} reports zero capacity",
                self.disk_path.display()
            ))),
            None => Err(PartialDataError::Disk(format!(
                "no mounted filesystem holds {}",
                self.disk_path.display()
            ))),
        }
    }

    fn interfaces(&self) -> Result<Vec<NetworkInterface>, PartialDataError> {
        let interfaces = netdev::get_interfaces();
        if interfaces.is_empty() {
            return Err(PartialDataError::Network(
                "host reported no network interfaces".into(),
            ));
        }

        Ok(interfaces
            .into_iter()
            .map(|iface| {
                let mac = iface.mac_addr.map(|m| m.to_string());
                let loopback = iface.is_loopback();

                let v4 = iface.ipv4.iter().map(|net| {
                    (
                        IpAddr::V4(net.addr()),
                        IpAddr::V4(net.netmask()),
                        net.prefix_len(),
                        AddressFamily::IPv4,
                    )
                });
                let v6 = iface.ipv6.iter().map(|net| {
                    (
                        IpAddr::V6(net.addr()),
                        IpAddr::V6(net.netmask()),
                        net.prefix_len(),
                        AddressFamily::IPv6,
                    )
                });

                let addresses = v4
                    .chain(v6)
                    .map(|(address, netmask, prefix, family)| InterfaceAddress {
                        address,
                        netmask,
                        family,
                        mac: mac.clone(),
                        internal: loopback || address.is_loopback(),
                        cidr: format!("{address}/{prefix}"),
                    })
                    .collect();

                NetworkInterface {
                    name: iface.name,
                    addresses,
                }
            })
            .collect())
    }

    fn uptime(&self) -> u64 {
        System::uptime()
    }
}

fn kernel_type() -> String {
    match std::env::consts::OS {
        "linux" | "android" => "Linux".to_owned(),
        "macos" | "ios" => "Darwin".to_owned(),
        "windows" => "Windows_NT".to_owned(),
        "freebsd" => "FreeBSD".to_owned(),
        _ => System::name().unwrap_or_else(|| UNAVAILABLE.to_owned()),
    }
}

/// Capacity of the mount with the longest mount point that contains `path`.
fn containing_mount<'a>(
    path: &Path,
    mounts: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> Option<(u64, u64)> {
    mounts
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, free)| (total, free))
}

/// Per-core counters from the `cpuN` lines of `/proc/stat`, in file order.
///
/// Format: `cpuN user nice system idle iowait irq softirq steal [guest guest_nice]`.
/// Guest time is already folded into user/nice by the kernel and is skipped.
pub fn parse_proc_stat(content: &str) -> Result<Vec<CpuTimes>, PartialDataError> {
    let cores: Vec<CpuTimes> = content
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .map(parse_cpu_line)
        .collect::<Result<_, _>>()?;

    if cores.is_empty() {
        return Err(PartialDataError::Cpu("no per-core lines in /proc/stat".into()));
    }
    Ok(cores)
}

fn parse_cpu_line(line: &str) -> Result<CpuTimes, PartialDataError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(PartialDataError::Cpu(format!(
            "cpu line too short: expected at least 5 fields, got {}",
            fields.len()
        )));
    }

    let field = |idx: usize| -> Result<u64, PartialDataError> {
        let Some(raw) = fields.get(idx) else {
            return Ok(0);
        };
        raw.parse().map_err(|e| {
            PartialDataError::Cpu(format!("bad counter {raw:?} in {}: {e}", fields[0]))
        })
    };

    Ok(CpuTimes {
        user: field(1)?,
        nice: field(2)?,
        system: field(3)?,
        idle: field(4)?,
        iowait: field(5)?,
        irq: field(6)?,
        softirq: field(7)?,
        steal: field(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "\
cpu  10132153 290696 3084719 46828483 16683 0 25195 0 175628 0
cpu0 1393280 32966 572056 13343292 6130 0 17875 0 23933 0
cpu1 1335 0 300 7000 0 0 0 0
intr 199292 0 0 0
ctxt 1990473
btime 1062191376
processes 2915
cpu2 200 0 100 700
";

    #[test]
    fn test_parse_proc_stat_per_core() {
        let cores = parse_proc_stat(PROC_STAT).unwrap();
        assert_eq!(cores.len(), 3);
        assert_eq!(cores[0].user, 1393280);
        assert_eq!(cores[0].softirq, 17875);
        assert_eq!(cores[1].idle, 7000);
        assert_eq!(cores[2].total(), 1000);
        assert_eq!(cores[2].iowait, 0);
    }

    #[test]
    fn test_parse_proc_stat_rejects_garbage() {
        assert!(parse_proc_stat("cpu0 1 2 x 4\n").is_err());
        assert!(parse_proc_stat("cpu0 1 2\n").is_err());
        assert!(parse_proc_stat("cpu  1 2 3 4\nintr 0\n").is_err());
    }

    #[test]
    fn test_containing_mount_prefers_longest() {
        let mounts = vec![
            (Path::new("/"), 100, 50),
            (Path::new("/home"), 200, 20),
            (Path::new("/home/user/data"), 300, 30),
        ];
        let pick = |p: &str| containing_mount(Path::new(p), mounts.iter().copied());

        assert_eq!(pick("/"), Some((100, 50)));
        assert_eq!(pick("/home/other"), Some((200, 20)));
        assert_eq!(pick("/home/user/data/x"), Some((300, 30)));
        assert_eq!(pick("/homework"), Some((100, 50)));
    }

    #[test]
    fn test_containing_mount_none() {
        let mounts = vec![(Path::new("/mnt"), 100, 50)];
        assert_eq!(containing_mount(Path::new("/"), mounts.into_iter()), None);
    }

    #[test]
    fn test_host_os_info() {
        let os = HostSource::new("/").os_info();
        assert_eq!(os.platform, std::env::consts::OS);
        assert!(!os.architecture.is_empty());
    }

    #[test]
    fn test_host_memory() {
        let memory = HostSource::new("/").memory().expect("memory should be readable");
        assert!(memory.total > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_cpu_times() {
        let times = HostSource::new("/").cpu_times().expect("cpu counters");
        assert!(!times.is_empty());
    }
}
