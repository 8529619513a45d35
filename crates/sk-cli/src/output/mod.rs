//! Output formatting utilities for the CLI
//!
//! Tables for peers, links and the port table, the status summary, one
//! line per pushed event, and colored status messages.

use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use sk_core::ports::{PortOutcome, PortStatusReport, ServiceValidation};
use sk_core::time::elapsed_millis;

use crate::ipc::{LinkInfo, NodeEvent, NodeStatus, PeerInfo};

/// Format known machines as an ASCII table.
///
/// The detailed view adds capabilities, cluster port and last contact.
pub fn format_peers(peers: &[PeerInfo], detailed: bool) -> String {
    if peers.is_empty() {
        return "No machines discovered".to_string();
    }

    #[derive(Tabled)]
    struct PeerRow {
        #[tabled(rename = "MACHINE")]
        id: String,
        #[tabled(rename = "HOSTNAME")]
        hostname: String,
        #[tabled(rename = "ADDRESS")]
        address: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "LINK")]
        link: String,
        #[tabled(rename = "SERVICES")]
        services: String,
    }

    #[derive(Tabled)]
    struct PeerRowDetailed {
        #[tabled(rename = "MACHINE")]
        id: String,
        #[tabled(rename = "HOSTNAME")]
        hostname: String,
        #[tabled(rename = "ADDRESS")]
        address: String,
        #[tabled(rename = "CLUSTER PORT")]
        cluster_port: u16,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "LINK")]
        link: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "MEMORY")]
        memory: String,
        #[tabled(rename = "LAST SEEN")]
        last_seen: String,
        #[tabled(rename = "SERVICES")]
        services: String,
    }

    let name = |p: &PeerInfo| {
        let id = truncate(p.descriptor.machine_id.as_str(), 12);
        if p.is_local {
            format!("{} (local)", id)
        } else {
            id
        }
    };
    let link = |p: &PeerInfo| {
        if p.is_local {
            "-".to_string()
        } else {
            p.link_state.to_string()
        }
    };

    if detailed {
        let rows: Vec<PeerRowDetailed> = peers
            .iter()
            .map(|p| {
                let d = &p.descriptor;
                PeerRowDetailed {
                    id: name(p),
                    hostname: d.hostname.clone(),
                    address: d.primary_ip.clone(),
                    cluster_port: d.cluster_port,
                    status: d.status.to_string(),
                    link: link(p),
                    cpu: d
                        .capabilities
                        .map(|c| format!("{} cores", c.cpu_cores))
                        .unwrap_or_else(|| "-".to_string()),
                    memory: d
                        .capabilities
                        .map(|c| format!("{} MB", c.memory_total_mb))
                        .unwrap_or_else(|| "-".to_string()),
                    last_seen: if p.is_local {
                        "-".to_string()
                    } else {
                        format!("{} ago", format_duration(elapsed_millis(d.last_seen) / 1000))
                    },
                    services: format_services(p),
                }
            })
            .collect();

        Table::new(rows)
            .with(Style::rounded())
            .with(Width::wrap(140))
            .to_string()
    } else {
        let rows: Vec<PeerRow> = peers
            .iter()
            .map(|p| PeerRow {
                id: name(p),
                hostname: p.descriptor.hostname.clone(),
                address: p.descriptor.primary_ip.clone(),
                status: p.descriptor.status.to_string(),
                link: link(p),
                services: format_services(p),
            })
            .collect();

        Table::new(rows).with(Style::rounded()).to_string()
    }
}

fn format_services(peer: &PeerInfo) -> String {
    if peer.descriptor.services.is_empty() {
        return "-".to_string();
    }
    peer.descriptor
        .services
        .iter()
        .map(|s| format!("{}:{}", s.name, s.port))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format cluster links as an ASCII table
pub fn format_links(links: &[LinkInfo]) -> String {
    if links.is_empty() {
        return "No cluster links".to_string();
    }

    #[derive(Tabled)]
    struct LinkRow {
        #[tabled(rename = "ID")]
        id: u64,
        #[tabled(rename = "MACHINE")]
        machine: String,
        #[tabled(rename = "REMOTE")]
        remote: String,
        #[tabled(rename = "DIRECTION")]
        direction: String,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "UP")]
        up: String,
        #[tabled(rename = "RTT")]
        rtt: String,
    }

    let rows: Vec<LinkRow> = links
        .iter()
        .map(|l| LinkRow {
            id: l.link_id,
            machine: l
                .machine_id
                .as_deref()
                .map(|m| truncate(m, 12))
                .unwrap_or_else(|| "-".to_string()),
            remote: l.remote_addr.clone(),
            direction: l.direction.to_string(),
            state: l.state.to_string(),
            up: l
                .established_at
                .map(|t| format_duration(elapsed_millis(t) / 1000))
                .unwrap_or_else(|| "-".to_string()),
            rtt: l
                .rtt_ms
                .map(|r| format!("{} ms", r))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format node status as a human-readable string
pub fn format_status(status: &NodeStatus, detailed: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "Node: {} ({})\n",
        status.machine_id, status.hostname
    ));
    output.push_str(&format!("Address: {}\n", status.primary_ip));
    output.push_str(&format!("Version: {}\n", status.version));
    output.push_str(&format!("Uptime: {}\n", format_duration(status.uptime_secs)));
    output.push_str(&format!(
        "Peers: {} online, {} known\n",
        status.peers_online, status.peers_total
    ));
    output.push_str(&format!(
        "Links: {} established, {} degraded\n",
        status.links.established, status.links.degraded
    ));

    if detailed {
        output.push_str("\n--- Details ---\n");
        output.push_str(&format!("Beacon port: {}\n", status.beacon_port));
        output.push_str(&format!("Cluster port: {}\n", status.cluster_port));
        output.push_str(&format!(
            "Links pending: {} connecting, {} handshaking\n",
            status.links.connecting, status.links.handshake_pending
        ));
        output.push_str(&format!(
            "Cluster capacity: {} cores, {} MB\n",
            status.cluster_cpu_cores, status.cluster_memory_mb
        ));
        output.push_str(&format!(
            "Ports: {} reserved, {} claimed\n",
            status.reserved_ports, status.active_claims
        ));
    }

    output
}

/// Format the port table: reserved and active allocations, then ranges
pub fn format_port_status(report: &PortStatusReport) -> String {
    #[derive(Tabled)]
    struct AllocationRow {
        #[tabled(rename = "PORT")]
        port: u16,
        #[tabled(rename = "SERVICE")]
        service: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
    }

    #[derive(Tabled)]
    struct RangeRow {
        #[tabled(rename = "CATEGORY")]
        category: String,
        #[tabled(rename = "RANGE")]
        range: String,
    }

    let rows: Vec<AllocationRow> = report
        .reserved
        .iter()
        .chain(report.active.iter())
        .map(|a| AllocationRow {
            port: a.port,
            service: a.service.clone(),
            status: a.status.to_string(),
            pid: a
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let ranges: Vec<RangeRow> = report
        .ranges
        .iter()
        .map(|r| RangeRow {
            category: r.category.to_string(),
            range: format!("{}-{}", r.start, r.end),
        })
        .collect();

    let mut output = String::new();
    if rows.is_empty() {
        output.push_str("No allocated ports\n");
    } else {
        output.push_str(&Table::new(rows).with(Style::rounded()).to_string());
        output.push('\n');
    }
    if !ranges.is_empty() {
        output.push_str("\nSuggestion ranges:\n");
        output.push_str(&Table::new(ranges).with(Style::rounded()).to_string());
        output.push('\n');
    }
    output
}

/// One line for a claim or release result
pub fn format_port_outcome(outcome: &PortOutcome) -> String {
    match outcome.suggestion {
        Some(alt) if !outcome.success && !outcome.message.contains("Suggested") => {
            format!("{} Suggested alternative: {}", outcome.message, alt)
        }
        _ => outcome.message.clone(),
    }
}

/// One line for a validation result
pub fn format_validation(validation: &ServiceValidation) -> String {
    format!("[{}] {}", validation.category, validation.message)
}

/// One line per pushed event
pub fn format_event(event: &NodeEvent) -> String {
    match event {
        NodeEvent::PeerDiscovered(peer) => format!(
            "peer discovered: {} ({}, {})",
            peer.descriptor.machine_id, peer.descriptor.hostname, peer.descriptor.primary_ip
        ),
        NodeEvent::PeerOffline { machine_id } => format!("peer offline: {}", machine_id),
        NodeEvent::PeerAnomaly { machine_id, detail } => {
            format!("peer anomaly: {}: {}", machine_id, detail)
        }
        NodeEvent::LinkStateChanged {
            link_id,
            machine_id,
            state,
        } => format!(
            "link {} ({}): {}",
            link_id,
            machine_id.as_deref().unwrap_or("unknown"),
            state
        ),
        NodeEvent::StatusUpdate { machine_id, payload } => {
            format!("status from {}: {}", machine_id, payload)
        }
        NodeEvent::TaskCoordination { machine_id, payload } => {
            format!("task from {}: {}", machine_id, payload)
        }
        NodeEvent::PortClaimed(allocation) => {
            format!("port claimed: {} by {}", allocation.port, allocation.service)
        }
        NodeEvent::PortReleased { port, service } => {
            format!("port released: {} from {}", port, service)
        }
    }
}

/// Format duration in human-readable form
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix, to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow, to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
