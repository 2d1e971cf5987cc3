//! Portmapper (program 100000, version 2) lookups.

use super::rpc::RpcClient;
use super::xdr::XdrWriter;
use crate::utils::error::{Result, ScopeError};
use std::time::Duration;

pub const PORTMAP_PROGRAM: u32 = 100_000;
pub const PORTMAP_VERSION: u32 = 2;
pub const PORTMAP_GETPORT: u32 = 3;
pub const DEFAULT_PORTMAP_PORT: u16 = 111;

pub const IPPROTO_TCP: u32 = 6;

/// Ask the portmapper on `host` for the TCP port of `program`/`version`.
pub async fn get_port(
    host: &str,
    portmap_port: u16,
    program: u32,
    version: u32,
    timeout: Duration,
) -> Result<u16> {
    let mut client = RpcClient::connect(
        host,
        portmap_port,
        PORTMAP_PROGRAM,
        PORTMAP_VERSION,
        "portmap",
        timeout,
    )
    .await?;

    let mut args = XdrWriter::new();
    args.put_u32(program).put_u32(version).put_u32(IPPROTO_TCP).put_u32(0);

    let mut reply = client.call(PORTMAP_GETPORT, args).await?;
    let port = reply.get_u32()?;
    if let Err(e) = client.shutdown().await {
        tracing::debug!("Portmapper connection shutdown failed: {}", e);
    }

    match port {
        0 => Err(ScopeError::RpcRejected {
            program: "portmap".to_string(),
            reason: format!("program {:#x} version {} is not registered", program, version),
        }),
        port => u16::try_from(port)
            .map_err(|_| ScopeError::rpc(format!("portmapper returned invalid port {}", port))),
    }
}
