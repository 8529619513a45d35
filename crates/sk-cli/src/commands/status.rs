//! Status command implementation

use anyhow::Result;

use crate::ipc::NodeClient;
use crate::output::{format_status, print_error};

/// Execute the status command
pub async fn status_command(client: &mut NodeClient, detailed: bool) -> Result<()> {
    let status = match client.status().await {
        Ok(s) => s,
        Err(e) => {
            print_error(&format!("Failed to get node status: {}", e));
            print_error("Is the node running? Try: skein serve");
            return Err(e);
        }
    };

    println!("{}", format_status(&status, detailed));

    Ok(())
}
