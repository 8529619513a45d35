//! Live OS port checks
//!
//! Bookkeeping alone cannot tell whether a port is free: anything else on
//! the host may have bound it. The probe answers by actually binding a
//! test socket, and on Linux can name the process holding a port.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// Result of a live bind test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Bind succeeded
    Free,
    /// Bind failed with "address already in use"
    InUse,
    /// Bind failed for another reason (permissions, no such address, ...)
    Unavailable(String),
}

impl Availability {
    pub fn is_free(&self) -> bool {
        matches!(self, Availability::Free)
    }
}

/// Process holding a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: Option<String>,
}

/// Source of truth about OS-level port usage
pub trait PortProbe: Send + Sync {
    /// Try to bind the port
    fn check(&self, port: u16) -> Availability;

    /// Identify the process listening on the port, if the platform allows
    fn owner(&self, port: u16) -> Option<PortOwner>;
}

/// Probe backed by real sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn check(&self, port: u16) -> Availability {
        match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                drop(listener);
                Availability::Free
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Availability::InUse,
            Err(e) => Availability::Unavailable(e.to_string()),
        }
    }

    fn owner(&self, port: u16) -> Option<PortOwner> {
        let pid = listening_pid(port)?;
        Some(PortOwner {
            pid,
            name: process_name(pid),
        })
    }
}

fn process_name(pid: u32) -> Option<String> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let pid = Pid::from(pid as usize);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system
        .process(pid)
        .map(|p| std::ffi::OsStr::new(p.name()).to_string_lossy().into_owned())
}

#[cfg(target_os = "linux")]
fn listening_pid(port: u16) -> Option<u32> {
    let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .find_map(|table| listening_inode(&table, port))?;
    pid_for_socket_inode(inode)
}

#[cfg(not(target_os = "linux"))]
fn listening_pid(_port: u16) -> Option<u32> {
    None
}

/// TCP state code for LISTEN in /proc/net/tcp
#[cfg(any(target_os = "linux", test))]
const TCP_LISTEN: &str = "0A";

/// Find the socket inode of a listener on `port` in a /proc/net/tcp table
#[cfg(any(target_os = "linux", test))]
fn listening_inode(table: &str, port: u16) -> Option<u64> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode
        if fields.len() < 10 || fields[3] != TCP_LISTEN {
            return None;
        }
        let (_, port_hex) = fields[1].rsplit_once(':')?;
        if u16::from_str_radix(port_hex, 16).ok()? != port {
            return None;
        }
        match fields[9].parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(inode) => Some(inode),
        }
    })
}

#[cfg(target_os = "linux")]
fn pid_for_socket_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{}]", inode);
    let procs = std::fs::read_dir("/proc").ok()?;

    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' fds are unreadable; skip them
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.as_os_str() == needle.as_str() {
                    return Some(pid);
                }
            }
        }
    }
    None
}
