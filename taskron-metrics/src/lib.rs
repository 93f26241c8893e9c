//! Point-in-time host metrics read from procfs and `statvfs`.
//!
//! Each source is read independently. A source that cannot be read or
//! parsed contributes zeroes and a warning; sampling itself never fails.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Utc;
use log::warn;
use taskron_models::core::SystemStats;

pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryInfo {
    total_kb: u64,
    free_kb: u64,
    available_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiskSpace {
    total: u64,
    free: u64,
    available: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct NetworkTotals {
    rx_bytes: u64,
    tx_bytes: u64,
}

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    proc_root: PathBuf,
    disk_root: PathBuf,
    sample_window: Duration,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

impl MetricsCollector {
    pub fn new(sample_window: Duration) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_root: PathBuf::from("/"),
            sample_window,
        }
    }

    /// Reads from another procfs mount, e.g. a host's `/proc` bind-mounted
    /// into a container.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Filesystem whose space is reported, `/` by default.
    pub fn with_disk_root(mut self, disk_root: impl Into<PathBuf>) -> Self {
        self.disk_root = disk_root.into();
        self
    }

    pub async fn sample(&self) -> SystemStats {
        if !cfg!(target_os = "linux") && self.proc_root == Path::new("/proc") {
            return SystemStats::zeroed(Utc::now());
        }

        let mut stats = SystemStats::zeroed(Utc::now());

        stats.cpu_usage = self.cpu_usage().await.unwrap_or_else(|reason| {
            warn!("CPU usage unavailable: {}", reason);
            0.0
        });

        match self.read("meminfo").await.and_then(|text| parse_meminfo(&text)) {
            Ok(memory) => {
                let used_kb = memory.total_kb.saturating_sub(memory.available_kb);
                stats.memory_total = memory.total_kb / 1024;
                stats.memory_used = used_kb / 1024;
                stats.memory_free = memory.free_kb / 1024;
                if memory.total_kb > 0 {
                    stats.memory_usage = round2(used_kb as f64 / memory.total_kb as f64 * 100.0);
                }
            }
            Err(reason) => warn!("Memory usage unavailable: {}", reason),
        }

        match self.read("loadavg").await.and_then(|text| parse_loadavg(&text)) {
            Ok(load) => {
                stats.system_load = load[0];
                stats.load_average = load;
            }
            Err(reason) => warn!("Load average unavailable: {}", reason),
        }

        match self.read("uptime").await.and_then(|text| parse_uptime(&text)) {
            Ok(uptime) => stats.uptime = uptime,
            Err(reason) => warn!("Uptime unavailable: {}", reason),
        }

        match self.count_processes().await {
            Ok(count) => stats.process_count = count,
            Err(reason) => warn!("Process count unavailable: {}", reason),
        }

        match disk_space(&self.disk_root) {
            Ok(disk) => {
                let used = disk.total.saturating_sub(disk.free);
                stats.disk_total = round2(disk.total as f64 / BYTES_PER_GB);
                stats.disk_used = round2(used as f64 / BYTES_PER_GB);
                stats.disk_free = round2(disk.available as f64 / BYTES_PER_GB);
                // Reserved blocks count as neither used nor usable, as df does.
                let usable = used + disk.available;
                if usable > 0 {
                    stats.disk_usage = round2(used as f64 / usable as f64 * 100.0);
                }
            }
            Err(reason) => warn!("Disk usage unavailable: {}", reason),
        }

        match self.read("net/dev").await.and_then(|text| parse_net_dev(&text)) {
            Ok(net) => {
                stats.network_rx_bytes = net.rx_bytes;
                stats.network_tx_bytes = net.tx_bytes;
            }
            Err(reason) => warn!("Network counters unavailable: {}", reason),
        }

        stats
    }

    async fn read(&self, name: &str) -> Result<String, String> {
        let path = self.proc_root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| format!("{}: {}", path.display(), err))
    }

    async fn cpu_usage(&self) -> Result<f64, String> {
        let before = parse_cpu_times(&self.read("stat").await?)?;
        tokio::time::sleep(self.sample_window).await;
        let after = parse_cpu_times(&self.read("stat").await?)?;
        Ok(cpu_percent(before, after))
    }

    async fn count_processes(&self) -> Result<u64, String> {
        let mut entries = tokio::fs::read_dir(&self.proc_root)
            .await
            .map_err(|err| format!("{}: {}", self.proc_root.display(), err))?;

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|err| err.to_string())? {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
            if is_pid {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(unix)]
fn disk_space(path: &Path) -> Result<DiskSpace, String> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| format!("invalid path for statvfs: {err}"))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(format!(
            "{}: {}",
            path.display(),
            std::io::Error::last_os_error()
        ));
    }

    // Field widths differ between platforms.
    let frsize: u64 = stat.f_frsize as _;
    let blocks: u64 = stat.f_blocks as _;
    let bfree: u64 = stat.f_bfree as _;
    let bavail: u64 = stat.f_bavail as _;
    Ok(DiskSpace {
        total: blocks.saturating_mul(frsize),
        free: bfree.saturating_mul(frsize),
        available: bavail.saturating_mul(frsize),
    })
}

#[cfg(not(unix))]
fn disk_space(path: &Path) -> Result<DiskSpace, String> {
    Err(format!("{}: statvfs is not available on this platform", path.display()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn cpu_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    let idle = after.idle.saturating_sub(before.idle);
    if total == 0 {
        return 0.0;
    }
    round2(total.saturating_sub(idle) as f64 / total as f64 * 100.0)
}

/// Aggregate `cpu` line of `/proc/stat`. Guest time is already counted in
/// user time, so only the first eight columns are summed.
fn parse_cpu_times(stat: &str) -> Result<CpuTimes, String> {
    let line = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or("no aggregate cpu line")?;

    let values = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>().map_err(|_| format!("bad cpu counter '{v}'")))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() < 4 {
        return Err(format!("cpu line has {} counters", values.len()));
    }

    let iowait = values.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        idle: values[3] + iowait,
        total: values.iter().sum(),
    })
}

fn parse_meminfo(meminfo: &str) -> Result<MemoryInfo, String> {
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let (key, rest) = line.split_once(':')?;
            if key.trim() != name {
                return None;
            }
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };

    let total_kb = field("MemTotal").ok_or("MemTotal missing")?;
    let free_kb = field("MemFree").ok_or("MemFree missing")?;
    // Kernels before 3.14 have no MemAvailable.
    let available_kb = field("MemAvailable").unwrap_or_else(|| {
        free_kb + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
    });

    Ok(MemoryInfo {
        total_kb,
        free_kb,
        available_kb,
    })
}

fn parse_loadavg(loadavg: &str) -> Result<[f64; 3], String> {
    let mut fields = loadavg.split_whitespace();
    let mut load = [0.0; 3];
    for slot in load.iter_mut() {
        let text = fields.next().ok_or("loadavg is truncated")?;
        *slot = text
            .parse::<f64>()
            .map_err(|_| format!("bad load value '{text}'"))?;
    }
    Ok(load)
}

/// Sums the byte counters of every interface in `/proc/net/dev` except
/// loopback.
fn parse_net_dev(net_dev: &str) -> Result<NetworkTotals, String> {
    let mut totals = NetworkTotals::default();
    let mut interfaces = 0;
    for line in net_dev.lines() {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }

        let counters: Vec<&str> = counters.split_whitespace().collect();
        if counters.len() < 9 {
            return Err(format!("interface {name} has {} counters", counters.len()));
        }
        let counter = |index: usize| {
            counters[index]
                .parse::<u64>()
                .map_err(|_| format!("bad counter '{}' for {name}", counters[index]))
        };
        totals.rx_bytes = totals.rx_bytes.saturating_add(counter(0)?);
        totals.tx_bytes = totals.tx_bytes.saturating_add(counter(8)?);
        interfaces += 1;
    }

    if interfaces == 0 && !net_dev.contains("lo:") {
        return Err("no interfaces listed".to_string());
    }
    Ok(totals)
}

fn parse_uptime(uptime: &str) -> Result<u64, String> {
    let text = uptime.split_whitespace().next().ok_or("uptime is empty")?;
    let seconds = text
        .parse::<f64>()
        .map_err(|_| format!("bad uptime '{text}'"))?;
    Ok(seconds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 100 0 50 800 50 0 0 0 0 0\nintr 1 2 3\n";

    #[test]
    fn cpu_percent_between_samples() {
        let before = parse_cpu_times(STAT).unwrap();
        assert_eq!(before, CpuTimes { idle: 850, total: 1000 });

        let after = parse_cpu_times("cpu  160 0 90 880 70 0 0 0 0 0\n").unwrap();
        // 200 ticks elapsed, 100 of them idle.
        assert_eq!(cpu_percent(before, after), 50.0);
        assert_eq!(cpu_percent(before, before), 0.0);
    }

    #[test]
    fn cpu_line_must_exist() {
        assert!(parse_cpu_times("intr 1 2 3\n").is_err());
        assert!(parse_cpu_times("cpu  1 2\n").is_err());
    }

    #[test]
    fn meminfo_prefers_available() {
        let info = parse_meminfo(
            "MemTotal:       16384000 kB\nMemFree:         2048000 kB\nMemAvailable:    8192000 kB\n",
        )
        .unwrap();
        assert_eq!(info.total_kb, 16_384_000);
        assert_eq!(info.available_kb, 8_192_000);

        let old = parse_meminfo(
            "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 250 kB\n",
        )
        .unwrap();
        assert_eq!(old.available_kb, 400);

        assert!(parse_meminfo("MemFree: 1 kB\n").is_err());
    }

    #[test]
    fn loadavg_and_uptime() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap(),
            [0.52, 0.58, 0.59]
        );
        assert!(parse_loadavg("0.52\n").is_err());
        assert_eq!(parse_uptime("350735.47 234388.90\n").unwrap(), 350_735);
        assert!(parse_uptime("").is_err());
    }

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000      50    0    0    0     0          0         0     5000      50    0    0    0     0       0          0
  eth0: 1200      10    0    0    0     0          0         0      800       8    0    0    0     0       0          0
 wlan0:   34       1    0    0    0     0          0         0       66       1    0    0    0     0       0          0
";

    #[test]
    fn net_dev_sums_all_but_loopback() {
        assert_eq!(
            parse_net_dev(NET_DEV).unwrap(),
            NetworkTotals {
                rx_bytes: 1234,
                tx_bytes: 866,
            }
        );
        assert!(parse_net_dev("  eth0: 1 2 3\n").is_err());
        assert!(parse_net_dev("Inter-|\n face |\n").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn disk_space_of_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let disk = disk_space(dir.path()).unwrap();
        assert!(disk.total > 0);
        assert!(disk.free <= disk.total);
        assert!(disk.available <= disk.free);

        assert!(disk_space(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn sample_from_fake_procfs() {
        let root = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| std::fs::write(root.path().join(name), body).unwrap();
        write("stat", STAT);
        write(
            "meminfo",
            "MemTotal: 2097152 kB\nMemFree: 524288 kB\nMemAvailable: 1048576 kB\n",
        );
        write("loadavg", "1.50 1.00 0.50 2/300 999\n");
        write("uptime", "3600.99 100.00\n");
        std::fs::create_dir(root.path().join("net")).unwrap();
        write("net/dev", NET_DEV);
        for pid in ["1", "42", "1337"] {
            std::fs::create_dir(root.path().join(pid)).unwrap();
        }
        std::fs::create_dir(root.path().join("self")).unwrap();

        let stats = MetricsCollector::new(Duration::from_millis(1))
            .with_proc_root(root.path())
            .with_disk_root(root.path())
            .sample()
            .await;

        assert_eq!(stats.cpu_usage, 0.0);
        assert_eq!(stats.memory_total, 2048);
        assert_eq!(stats.memory_used, 1024);
        assert_eq!(stats.memory_free, 512);
        assert_eq!(stats.memory_usage, 50.0);
        assert_eq!(stats.system_load, 1.5);
        assert_eq!(stats.load_average, [1.5, 1.0, 0.5]);
        assert_eq!(stats.uptime, 3600);
        assert_eq!(stats.process_count, 3);
        assert_eq!(stats.network_rx_bytes, 1234);
        assert_eq!(stats.network_tx_bytes, 866);
        if cfg!(unix) {
            assert!(stats.disk_total > 0.0);
            assert!((0.0..=100.0).contains(&stats.disk_usage));
        }
    }

    #[tokio::test]
    async fn missing_sources_are_zeroed() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("uptime"), "12.0 1.0\n").unwrap();

        let stats = MetricsCollector::new(Duration::from_millis(1))
            .with_proc_root(root.path())
            .with_disk_root(root.path().join("gone"))
            .sample()
            .await;

        assert_eq!(stats.uptime, 12);
        assert_eq!(stats.memory_total, 0);
        assert_eq!(stats.cpu_usage, 0.0);
        assert_eq!(stats.load_average, [0.0; 3]);
        assert_eq!(stats.process_count, 0);
        assert_eq!(stats.disk_total, 0.0);
        assert_eq!(stats.disk_usage, 0.0);
        assert_eq!(stats.network_rx_bytes, 0);
    }
}
