//! Local machine identity
//!
//! Everything this node says about itself: id, hostname, the address
//! peers should dial, and resource hints. The cluster port is only known
//! once the link listener is bound, so it can be set after construction.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};

use sk_core::config::NodeConfig;
use sk_core::types::MachineId;
use sk_protocol::{Capabilities, MachineAdvert, ServiceEndpoint};
use sysinfo::System;

/// Anything that can describe the local node on the wire
pub trait AdvertSource: Send + Sync {
    fn current_advert(&self) -> MachineAdvert;
}

/// Static identity of the local node
#[derive(Debug)]
pub struct LocalIdentity {
    pub machine_id: MachineId,
    pub hostname: String,
    pub primary_ip: String,
    pub capabilities: Option<Capabilities>,
    /// Services from configuration, advertised unconditionally
    pub services: Vec<ServiceEndpoint>,
    cluster_port: AtomicU16,
}

impl LocalIdentity {
    /// Build the identity, detecting whatever the config leaves unset
    pub fn from_config(config: &NodeConfig) -> Self {
        let machine_id = config
            .node
            .machine_id
            .clone()
            .map(MachineId::new)
            .unwrap_or_else(MachineId::generate);
        let hostname = config.node.alias.clone().unwrap_or_else(detect_hostname);
        let primary_ip = config
            .node
            .advertise_ip
            .clone()
            .unwrap_or_else(|| detect_primary_ip().to_string());

        Self {
            machine_id,
            hostname,
            primary_ip,
            capabilities: Some(detect_capabilities()),
            services: config.node.services.clone(),
            cluster_port: AtomicU16::new(config.cluster.port),
        }
    }

    pub fn cluster_port(&self) -> u16 {
        self.cluster_port.load(Ordering::Relaxed)
    }

    /// Record the port the link listener actually bound
    pub fn set_cluster_port(&self, port: u16) {
        self.cluster_port.store(port, Ordering::Relaxed);
    }
}

impl AdvertSource for LocalIdentity {
    fn current_advert(&self) -> MachineAdvert {
        MachineAdvert {
            machine_id: self.machine_id.0.clone(),
            hostname: self.hostname.clone(),
            primary_ip: self.primary_ip.clone(),
            services: self.services.clone(),
            cluster_port: self.cluster_port(),
            capabilities: self.capabilities,
        }
    }
}

/// OS hostname, or "localhost" if it is not valid text
pub fn detect_hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}

/// Best LAN address for peers to reach us on
pub fn detect_primary_ip() -> Ipv4Addr {
    pick_primary_ip(&candidate_addresses())
}

/// Local addresses the kernel would route from toward a few well-known
/// private and public destinations. Connecting a UDP socket sends nothing.
fn candidate_addresses() -> Vec<Ipv4Addr> {
    const PROBES: [&str; 4] = [
        "10.255.255.255:1",
        "192.168.255.255:1",
        "172.31.255.255:1",
        "8.8.8.8:80",
    ];

    let mut found = Vec::new();
    for target in PROBES {
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
            continue;
        };
        if socket.connect(target).is_err() {
            continue;
        }
        if let Ok(addr) = socket.local_addr() {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ip.is_unspecified() && !found.contains(&ip) {
                    found.push(ip);
                }
            }
        }
    }
    found
}

/// Choose among candidate addresses: 10.x first, then 192.168.x, then
/// 172.16-31.x with the lowest second octet, then any other non-loopback
/// address, and loopback as a last resort.
pub fn pick_primary_ip(candidates: &[Ipv4Addr]) -> Ipv4Addr {
    let usable = || candidates.iter().copied().filter(|ip| !ip.is_loopback());

    if let Some(ip) = usable().find(|ip| ip.octets()[0] == 10) {
        return ip;
    }
    if let Some(ip) = usable().find(|ip| ip.octets()[..2] == [192, 168]) {
        return ip;
    }
    if let Some(ip) = usable()
        .filter(|ip| ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1]))
        .min_by_key(|ip| ip.octets()[1])
    {
        return ip;
    }
    usable().next().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// CPU and memory of this host
pub fn detect_capabilities() -> Capabilities {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    let mut sys = System::new();
    sys.refresh_memory();
    let memory_total_mb = sys.total_memory() / (1024 * 1024);

    Capabilities {
        cpu_cores,
        memory_total_mb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_prefers_ten_network() {
        let picked = pick_primary_ip(&[ip("192.168.1.4"), ip("10.0.0.7"), ip("172.16.0.2")]);
        assert_eq!(picked, ip("10.0.0.7"));
    }

    #[test]
    fn test_prefers_192_168_over_172() {
        let picked = pick_primary_ip(&[ip("172.16.0.2"), ip("192.168.1.4")]);
        assert_eq!(picked, ip("192.168.1.4"));
    }

    #[test]
    fn test_lowest_172_second_octet() {
        let picked = pick_primary_ip(&[ip("172.28.0.2"), ip("172.17.0.9"), ip("172.20.1.1")]);
        assert_eq!(picked, ip("172.17.0.9"));
    }

    #[test]
    fn test_falls_back_to_other_then_loopback() {
        assert_eq!(pick_primary_ip(&[ip("127.0.0.1"), ip("100.64.0.3")]), ip("100.64.0.3"));
        assert_eq!(pick_primary_ip(&[ip("127.0.0.1")]), Ipv4Addr::LOCALHOST);
        assert_eq!(pick_primary_ip(&[]), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_config_overrides() {
        let mut config = NodeConfig::default();
        config.node.machine_id = Some("m-fixed".into());
        config.node.alias = Some("alpha".into());
        config.node.advertise_ip = Some("10.1.2.3".into());
        config.node.services = vec![ServiceEndpoint::new("dashboard", 8090)];

        let identity = LocalIdentity::from_config(&config);
        let advert = identity.current_advert();
        assert_eq!(advert.machine_id, "m-fixed");
        assert_eq!(advert.hostname, "alpha");
        assert_eq!(advert.primary_ip, "10.1.2.3");
        assert_eq!(advert.cluster_port, 8080);
        assert_eq!(advert.service("dashboard").unwrap().port, 8090);

        identity.set_cluster_port(40123);
        assert_eq!(identity.current_advert().cluster_port, 40123);
    }

    #[test]
    fn test_capabilities_detected() {
        let caps = detect_capabilities();
        assert!(caps.cpu_cores >= 1);
    }
}
