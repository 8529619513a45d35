//! Port arbitration commands
//!
//! Each returns whether the request was granted, so the binary can set
//! its exit status without treating a refusal as an internal error.

use anyhow::Result;

use crate::ipc::NodeClient;
use crate::output::{
    format_port_outcome, format_port_status, format_validation, print_error, print_success,
};

pub async fn ports_status(client: &mut NodeClient) -> Result<bool> {
    let report = client.port_status().await?;
    print!("{}", format_port_status(&report));
    Ok(true)
}

/// Is the port free at the OS level right now
pub async fn ports_check(client: &mut NodeClient, port: u16) -> Result<bool> {
    let available = client.check_port(port).await?;
    if available {
        print_success(&format!("Port {} is available", port));
    } else {
        print_error(&format!("Port {} is in use", port));
    }
    Ok(available)
}

pub async fn ports_claim(
    client: &mut NodeClient,
    port: u16,
    service: &str,
    pid: Option<u32>,
) -> Result<bool> {
    let outcome = client.claim_port(port, service, pid).await?;
    if outcome.success {
        print_success(&format_port_outcome(&outcome));
    } else {
        print_error(&format_port_outcome(&outcome));
    }
    Ok(outcome.success)
}

pub async fn ports_release(client: &mut NodeClient, port: u16) -> Result<bool> {
    let outcome = client.release_port(port).await?;
    if outcome.success {
        print_success(&format_port_outcome(&outcome));
    } else {
        print_error(&format_port_outcome(&outcome));
    }
    Ok(outcome.success)
}

/// Would this service get this port; with no port, which one should it use
pub async fn ports_validate(
    client: &mut NodeClient,
    service: &str,
    port: Option<u16>,
) -> Result<bool> {
    let validation = client.validate_service(service, port).await?;
    if validation.valid {
        print_success(&format_validation(&validation));
    } else {
        print_error(&format_validation(&validation));
    }
    Ok(validation.valid)
}
