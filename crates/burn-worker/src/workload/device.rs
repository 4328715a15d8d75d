//! Host memory probing.
//!
//! The host backend sizes its batch from the memory the kernel reports as
//! available, split evenly across the devices under test.

use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// System memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemory {
    pub total: u64,
    pub available: u64,
}

impl SystemMemory {
    /// Bytes one of `devices` workers may claim at `fraction` of its share.
    pub fn budget_per_device(&self, devices: usize, fraction: f64) -> u64 {
        let share = self.available / devices.max(1) as u64;
        (share as f64 * fraction) as u64
    }
}

impl fmt::Display for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}GB total, {:.2}GB available",
            self.total as f64 / GIB,
            self.available as f64 / GIB
        )
    }
}

/// Read total and available memory.
pub fn system_memory() -> SystemMemory {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            return parse_meminfo(&content);
        }
    }

    #[cfg(target_os = "macos")]
    {
        use std::process::Command;
        if let Ok(output) = Command::new("sysctl").args(["-n", "hw.memsize"]).output() {
            let total_str = String::from_utf8_lossy(&output.stdout);
            if let Ok(total) = total_str.trim().parse::<u64>() {
                return SystemMemory {
                    total,
                    available: total / 2,
                };
            }
        }
    }

    SystemMemory {
        total: 16 * 1024 * 1024 * 1024,
        available: 8 * 1024 * 1024 * 1024,
    }
}

/// Parse the contents of `/proc/meminfo`.
pub fn parse_meminfo(content: &str) -> SystemMemory {
    let mut total = 0u64;
    let mut available = 0u64;

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            if let Some(kb) = parse_meminfo_value(line) {
                total = kb * 1024;
            }
        } else if line.starts_with("MemAvailable:") {
            if let Some(kb) = parse_meminfo_value(line) {
                available = kb * 1024;
            }
        }
    }

    SystemMemory { total, available }
}

/// Parse a value from a meminfo line (e.g., "MemTotal:       16000000 kB")
fn parse_meminfo_value(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse().ok()
}
