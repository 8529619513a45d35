//! Watch command: stream node events until interrupted

use anyhow::Result;

use crate::ipc::NodeClient;
use crate::output::{format_event, print_info, print_warning};

/// Print every event the node pushes. Returns when the node goes away or
/// on Ctrl+C.
pub async fn watch_command(client: &mut NodeClient) -> Result<()> {
    client.subscribe().await?;
    print_info("Watching node events (Ctrl+C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = client.next_event() => match event? {
                Some(event) => println!("{}", format_event(&event)),
                None => {
                    print_warning("Node closed the connection");
                    return Ok(());
                }
            },
        }
    }
}
