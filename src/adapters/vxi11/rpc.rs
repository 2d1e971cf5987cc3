//! Minimal ONC RPC v2 client (RFC 5531) over TCP with record marking.

use super::xdr::{XdrReader, XdrWriter};
use crate::utils::error::{Result, ScopeError};
use bytes::{Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub const RPC_VERSION: u32 = 2;

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

pub const MSG_ACCEPTED: u32 = 0;
pub const MSG_DENIED: u32 = 1;

pub const AUTH_NULL: u32 = 0;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7fff_ffff;

/// Write `payload` as a single, final record fragment.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let header = LAST_FRAGMENT | (payload.len() as u32 & FRAGMENT_LEN_MASK);
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.extend_from_slice(&header.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one record, concatenating fragments until the last-fragment bit.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut started = false;
    read_record_tracked(reader, &mut started).await
}

/// Like [`read_record`], setting `started` once the first fragment header is in.
async fn read_record_tracked<R: AsyncRead + Unpin>(
    reader: &mut R,
    started: &mut bool,
) -> Result<Bytes> {
    let mut record = BytesMut::new();
    loop {
        let header = reader.read_u32().await?;
        *started = true;
        let len = (header & FRAGMENT_LEN_MASK) as usize;
        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..]).await?;
        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

pub fn encode_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Bytes {
    let mut msg = XdrWriter::new();
    msg.put_u32(xid)
        .put_u32(MSG_CALL)
        .put_u32(RPC_VERSION)
        .put_u32(program)
        .put_u32(version)
        .put_u32(procedure)
        // credential, then verifier
        .put_u32(AUTH_NULL)
        .put_opaque(&[])
        .put_u32(AUTH_NULL)
        .put_opaque(&[])
        .put_raw(args);
    msg.into_bytes()
}

/// Check a reply header and return a reader positioned on the result body.
pub fn decode_reply(expected_xid: u32, program: &str, reply: Bytes) -> Result<XdrReader> {
    let mut reader = XdrReader::new(reply);

    let xid = reader.get_u32()?;
    if xid != expected_xid {
        return Err(ScopeError::rpc(format!(
            "reply xid {} does not match call xid {}",
            xid, expected_xid
        )));
    }
    if reader.get_u32()? != MSG_REPLY {
        return Err(ScopeError::rpc("expected a reply message"));
    }

    let rejected = |reason: String| ScopeError::RpcRejected {
        program: program.to_string(),
        reason,
    };

    match reader.get_u32()? {
        MSG_ACCEPTED => {
            let _verifier_flavor = reader.get_u32()?;
            let _verifier_body = reader.get_opaque()?;
            match reader.get_u32()? {
                0 => Ok(reader),
                1 => Err(rejected("program unavailable".to_string())),
                2 => {
                    let low = reader.get_u32()?;
                    let high = reader.get_u32()?;
                    Err(rejected(format!(
                        "program version mismatch (supported {}..={})",
                        low, high
                    )))
                }
                3 => Err(rejected("procedure unavailable".to_string())),
                4 => Err(rejected("garbage arguments".to_string())),
                5 => Err(rejected("system error".to_string())),
                other => Err(rejected(format!("unknown accept status {}", other))),
            }
        }
        MSG_DENIED => match reader.get_u32()? {
            0 => {
                let low = reader.get_u32()?;
                let high = reader.get_u32()?;
                Err(rejected(format!("RPC version mismatch (supported {}..={})", low, high)))
            }
            1 => {
                let stat = reader.get_u32()?;
                Err(rejected(format!("authentication error {}", stat)))
            }
            other => Err(rejected(format!("unknown reject status {}", other))),
        },
        other => Err(ScopeError::rpc(format!("unknown reply status {}", other))),
    }
}

fn reply_xid(reply: &[u8]) -> Option<u32> {
    reply.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn initial_xid() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(1)
}

/// RPC client bound to one program/version on one TCP connection.
///
/// A call that times out after its request was sent leaves a reply in flight.
/// Such late replies are dropped by the next call. A call that fails while the
/// request or reply is half transferred leaves the stream unusable, and every
/// later call fails fast.
#[derive(Debug)]
pub struct RpcClient {
    stream: TcpStream,
    program: u32,
    version: u32,
    name: &'static str,
    xid: u32,
    timeout: Duration,
    abandoned: u32,
    broken: bool,
}

impl RpcClient {
    pub async fn connect(
        host: &str,
        port: u16,
        program: u32,
        version: u32,
        name: &'static str,
        timeout: Duration,
    ) -> Result<Self> {
        tracing::debug!("Opening RPC connection to {}:{} ({})", host, port, name);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ScopeError::timeout(format!("connect {}", name)))??;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            program,
            version,
            name,
            xid: initial_xid(),
            timeout,
            abandoned: 0,
            broken: false,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn call(&mut self, procedure: u32, args: XdrWriter) -> Result<XdrReader> {
        let name = self.name;
        if self.broken {
            return Err(ScopeError::rpc(format!(
                "{} connection is unusable after an interrupted call",
                name
            )));
        }

        self.xid = self.xid.wrapping_add(1);
        let xid = self.xid;
        let message = encode_call(xid, self.program, self.version, procedure, &args.into_bytes());
        tracing::trace!("RPC call {} proc {} xid {} ({} bytes)", name, procedure, xid, message.len());

        let mut sent = false;
        let mut receiving = false;
        let stream = &mut self.stream;
        let abandoned = &mut self.abandoned;
        let exchange = async {
            write_record(stream, &message).await?;
            sent = true;
            loop {
                receiving = false;
                let reply = read_record_tracked(stream, &mut receiving).await?;
                match reply_xid(&reply) {
                    Some(reply_xid) if reply_xid != xid && *abandoned > 0 => {
                        tracing::debug!("Dropping late {} reply xid {}", name, reply_xid);
                        *abandoned -= 1;
                    }
                    _ => return Ok::<Bytes, ScopeError>(reply),
                }
            }
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.broken = true;
                return Err(e);
            }
            Err(_) => {
                if sent && !receiving {
                    self.abandoned += 1;
                } else {
                    self.broken = true;
                }
                return Err(ScopeError::timeout(format!("{} procedure {}", name, procedure)));
            }
        };

        decode_reply(xid, name, reply)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
