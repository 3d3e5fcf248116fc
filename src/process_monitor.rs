use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

/// Best-effort owner of a socket. Missing fields mean the lookup failed or was not allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub name: Option<String>,
    pub exe: Option<String>,
}

impl ProcessInfo {
    pub fn unknown(pid: Option<u32>) -> Self {
        ProcessInfo {
            pid,
            name: None,
            exe: None,
        }
    }
}

pub trait ProcessLookup: Send + Sync {
    /// Never fails: anything that goes wrong yields null fields.
    fn lookup(&self, pid: Option<u32>) -> ProcessInfo;
}

pub struct SystemProcessLookup {
    system: Mutex<System>,
    process_cache: Mutex<HashMap<u32, (ProcessInfo, Instant)>>,
    cache_duration: Duration,
}

impl SystemProcessLookup {
    pub fn new(cache_duration_seconds: u64) -> Self {
        SystemProcessLookup {
            system: Mutex::new(System::new()),
            process_cache: Mutex::new(HashMap::new()),
            cache_duration: Duration::from_secs(cache_duration_seconds),
        }
    }

    fn query(&self, pid: u32) -> ProcessInfo {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let sys_pid = Pid::from_u32(pid);
        if !system.refresh_process(sys_pid) {
            debug!("Process {} not visible", pid);
            return ProcessInfo::unknown(Some(pid));
        }
        match system.process(sys_pid) {
            Some(process) => ProcessInfo {
                pid: Some(pid),
                name: Some(process.name().to_string()).filter(|name| !name.is_empty()),
                exe: process.exe().map(|path| path.to_string_lossy().to_string()),
            },
            None => ProcessInfo::unknown(Some(pid)),
        }
    }
}

impl ProcessLookup for SystemProcessLookup {
    fn lookup(&self, pid: Option<u32>) -> ProcessInfo {
        // Pid 0 is the idle/system pseudo-process; nothing to ask the OS about
        let pid = match pid {
            Some(pid) if pid != 0 => pid,
            other => return ProcessInfo::unknown(other),
        };

        // Check cache first
        {
            let cache = self.process_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((info, timestamp)) = cache.get(&pid) {
                if timestamp.elapsed() < self.cache_duration {
                    return info.clone();
                }
            }
        }

        let info = self.query(pid);
        let mut cache = self.process_cache.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.cache_duration;
        cache.retain(|_, (_, cached_at)| cached_at.elapsed() < ttl);
        cache.insert(pid, (info.clone(), Instant::now()));
        info
    }
}

/// Identity of the machine, echoed in the `start` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub host: String,
    pub platform: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        let os = System::long_os_version()
            .or_else(System::name)
            .unwrap_or_else(|| std::env::consts::OS.to_string());
        HostInfo {
            host: System::host_name().unwrap_or_default(),
            platform: format!("{} ({})", os, std::env::consts::ARCH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pid_yields_nulls() {
        let lookup = SystemProcessLookup::new(60);
        assert_eq!(lookup.lookup(None), ProcessInfo::unknown(None));
        assert_eq!(lookup.lookup(Some(0)), ProcessInfo::unknown(Some(0)));
    }

    #[test]
    fn test_own_process_is_found_and_cached() {
        let lookup = SystemProcessLookup::new(60);
        let pid = std::process::id();
        let info = lookup.lookup(Some(pid));
        assert_eq!(info.pid, Some(pid));
        assert!(info.name.is_some());
        assert_eq!(lookup.lookup(Some(pid)), info);
        assert_eq!(lookup.process_cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_entries_are_evicted_on_insert() {
        let lookup = SystemProcessLookup::new(0);
        lookup.lookup(Some(u32::MAX - 1));
        lookup.lookup(Some(u32::MAX - 2));
        lookup.lookup(Some(u32::MAX - 3));
        assert_eq!(lookup.process_cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_vanished_pid_degrades_to_nulls() {
        let lookup = SystemProcessLookup::new(60);
        let info = lookup.lookup(Some(u32::MAX - 1));
        assert_eq!(info, ProcessInfo::unknown(Some(u32::MAX - 1)));
    }

    #[test]
    fn test_host_info_describes_platform() {
        let host = HostInfo::detect();
        assert!(host.platform.contains(std::env::consts::ARCH));
    }
}
