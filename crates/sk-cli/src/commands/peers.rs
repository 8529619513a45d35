//! Peer listing and discovery commands

use anyhow::Result;

use crate::ipc::NodeClient;
use crate::output::{format_links, format_peers, print_error, print_info};

/// List known machines, optionally filtered by id, hostname or address
pub async fn peers_command(
    client: &mut NodeClient,
    filter: Option<&str>,
    long: bool,
) -> Result<()> {
    let peers = match client.list_peers().await {
        Ok(p) => p,
        Err(e) => {
            print_error(&format!("Failed to list peers: {}", e));
            return Err(e);
        }
    };

    let peers: Vec<_> = match filter {
        Some(filter) => peers
            .into_iter()
            .filter(|p| {
                p.descriptor.machine_id.as_str().contains(filter)
                    || p.descriptor.hostname.contains(filter)
                    || p.descriptor.primary_ip.contains(filter)
            })
            .collect(),
        None => peers,
    };

    println!("Machines:");
    println!("{}", format_peers(&peers, long));
    Ok(())
}

/// Show one machine in detail
pub async fn peer_command(client: &mut NodeClient, machine_id: &str) -> Result<()> {
    let peer = client.get_peer(machine_id).await?;
    println!("{}", format_peers(&[peer], true));
    Ok(())
}

/// Announce now and list machines that answered
pub async fn discover_command(client: &mut NodeClient) -> Result<()> {
    print_info("Discovering machines...");
    let found = client.discover().await?;
    if found.is_empty() {
        println!("No new machines found");
    } else {
        println!("Found {} new machine(s):", found.len());
        println!("{}", format_peers(&found, false));
    }
    Ok(())
}

/// List cluster links
pub async fn links_command(client: &mut NodeClient) -> Result<()> {
    let links = client.list_links().await?;
    println!("{}", format_links(&links));
    Ok(())
}
