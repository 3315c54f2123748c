//! The `rolegate provision` command.

use crate::daemon::ProvisionClient;
use crate::daemon::protocol::Status;
use crate::error::{Result, RolegateError};

/// Send one provisioning request and report the outcome. Anything other
/// than a success byte exits nonzero.
pub async fn provision(host: &str, port: u16, name: &str) -> Result<()> {
    let status = ProvisionClient::new(host, port).provision(name).await?;

    println!("{status}");

    if status == Status::Ok {
        Ok(())
    } else {
        Err(RolegateError::Refused(status))
    }
}
