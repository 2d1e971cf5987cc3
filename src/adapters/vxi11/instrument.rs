use super::portmap::{self, DEFAULT_PORTMAP_PORT};
use super::rpc::RpcClient;
use super::xdr::{XdrReader, XdrWriter};
use crate::domain::ports::{Connector, Instrument};
use crate::utils::error::{Result, ScopeError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

pub const DEVICE_CORE_PROGRAM: u32 = 0x0607AF;
pub const DEVICE_CORE_VERSION: u32 = 1;

pub const CREATE_LINK: u32 = 10;
pub const DEVICE_WRITE: u32 = 11;
pub const DEVICE_READ: u32 = 12;
pub const DEVICE_READSTB: u32 = 13;
pub const DEVICE_TRIGGER: u32 = 14;
pub const DEVICE_CLEAR: u32 = 15;
pub const DEVICE_REMOTE: u32 = 16;
pub const DEVICE_LOCAL: u32 = 17;
pub const DEVICE_LOCK: u32 = 18;
pub const DEVICE_UNLOCK: u32 = 19;
pub const DESTROY_LINK: u32 = 23;

pub const OP_FLAG_WAIT_BLOCK: u32 = 1;
pub const OP_FLAG_END: u32 = 8;
pub const OP_FLAG_TERMCHAR_SET: u32 = 128;

pub const RX_REQCNT: u32 = 1;
pub const RX_CHR: u32 = 2;
pub const RX_END: u32 = 4;

/// Extra time given to the socket on top of the instrument io timeout,
/// so the device reports its own timeout first.
const SOCKET_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Vxi11Options {
    pub device_name: String,
    pub client_id: i32,
    pub io_timeout: Duration,
    pub lock_timeout: Duration,
    pub term_char: Option<u8>,
    pub max_read_len: u32,
    pub portmap_port: u16,
    /// Core channel port. Skips the portmapper lookup when set.
    pub core_port: Option<u16>,
}

impl Default for Vxi11Options {
    fn default() -> Self {
        Self {
            device_name: "inst0".to_string(),
            client_id: std::process::id() as i32 & 0x7fff_ffff,
            io_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(10),
            term_char: None,
            max_read_len: 1024 * 1024,
            portmap_port: DEFAULT_PORTMAP_PORT,
            core_port: None,
        }
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Fail on a non-zero VXI-11 error code.
fn check_error(reply: &mut XdrReader, operation: &str) -> Result<()> {
    match reply.get_u32()? {
        0 => Ok(()),
        code => Err(ScopeError::vxi11(code, operation)),
    }
}

/// Link to a device over a VXI-11 core channel.
#[derive(Debug)]
pub struct Vxi11Instrument {
    rpc: Option<RpcClient>,
    link_id: i32,
    max_recv_size: u32,
    options: Vxi11Options,
}

impl Vxi11Instrument {
    pub async fn open(host: &str, options: Vxi11Options) -> Result<Self> {
        let socket_timeout = options.io_timeout + SOCKET_GRACE;

        let port = match options.core_port {
            Some(port) => port,
            None => {
                portmap::get_port(
                    host,
                    options.portmap_port,
                    DEVICE_CORE_PROGRAM,
                    DEVICE_CORE_VERSION,
                    socket_timeout,
                )
                .await?
            }
        };

        let mut rpc = RpcClient::connect(
            host,
            port,
            DEVICE_CORE_PROGRAM,
            DEVICE_CORE_VERSION,
            "vxi11-core",
            socket_timeout,
        )
        .await?;

        let mut args = XdrWriter::new();
        args.put_i32(options.client_id)
            .put_bool(false)
            .put_u32(millis(options.lock_timeout))
            .put_string(&options.device_name);

        let mut reply = rpc.call(CREATE_LINK, args).await?;
        check_error(&mut reply, "create_link")?;
        let link_id = reply.get_i32()?;
        let _abort_port = reply.get_u32()?;
        let max_recv_size = reply.get_u32()?;

        tracing::debug!(
            "🔗 VXI-11 link {} to {}:{}/{} (max_recv_size {})",
            link_id,
            host,
            port,
            options.device_name,
            max_recv_size
        );

        Ok(Self {
            rpc: Some(rpc),
            link_id,
            // 0 代表裝置未限制，仍需要切塊
            max_recv_size: if max_recv_size == 0 { 1024 } else { max_recv_size },
            options,
        })
    }

    pub fn link_id(&self) -> i32 {
        self.link_id
    }

    pub fn max_recv_size(&self) -> u32 {
        self.max_recv_size
    }

    fn rpc(&mut self) -> Result<&mut RpcClient> {
        self.rpc.as_mut().ok_or(ScopeError::NotInstantiated)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.options.io_timeout = timeout;
        if let Some(rpc) = self.rpc.as_mut() {
            rpc.set_timeout(timeout + SOCKET_GRACE);
        }
    }

    /// Write raw bytes in chunks of at most `max_recv_size`, END set on the last one.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let chunk_size = self.max_recv_size as usize;
        let mut offset = 0;

        loop {
            let end = (offset + chunk_size).min(data.len());
            let chunk = &data[offset..end];
            let last = end == data.len();
            let flags = if last { OP_FLAG_END } else { 0 };

            let mut args = XdrWriter::new();
            args.put_i32(self.link_id)
                .put_u32(millis(self.options.io_timeout))
                .put_u32(millis(self.options.lock_timeout))
                .put_u32(flags)
                .put_opaque(chunk);

            let mut reply = self.rpc()?.call(DEVICE_WRITE, args).await?;
            check_error(&mut reply, "write")?;
            let written = reply.get_u32()? as usize;
            if written < chunk.len() {
                return Err(ScopeError::rpc(format!(
                    "device accepted {} of {} bytes",
                    written,
                    chunk.len()
                )));
            }

            offset = end;
            if last {
                return Ok(());
            }
        }
    }

    pub async fn read_bytes(&mut self) -> Result<Bytes> {
        let mut flags = 0;
        let mut term_char = 0;
        if let Some(c) = self.options.term_char {
            flags |= OP_FLAG_TERMCHAR_SET;
            term_char = u32::from(c);
        }

        let mut data = BytesMut::new();
        loop {
            let mut args = XdrWriter::new();
            args.put_i32(self.link_id)
                .put_u32(self.options.max_read_len)
                .put_u32(millis(self.options.io_timeout))
                .put_u32(millis(self.options.lock_timeout))
                .put_u32(flags)
                .put_u32(term_char);

            let mut reply = self.rpc()?.call(DEVICE_READ, args).await?;
            check_error(&mut reply, "read")?;
            let reason = reply.get_u32()?;
            let chunk = reply.get_opaque()?;
            data.extend_from_slice(&chunk);

            if reason & (RX_END | RX_CHR) != 0 {
                tracing::trace!("Read {} bytes from link {}", data.len(), self.link_id);
                return Ok(data.freeze());
            }
        }
    }

    /// Generic-params call (link, flags, lock timeout, io timeout) returning the error only.
    async fn generic_call(&mut self, procedure: u32, operation: &str) -> Result<XdrReader> {
        let mut args = XdrWriter::new();
        args.put_i32(self.link_id)
            .put_u32(0)
            .put_u32(millis(self.options.lock_timeout))
            .put_u32(millis(self.options.io_timeout));
        let mut reply = self.rpc()?.call(procedure, args).await?;
        check_error(&mut reply, operation)?;
        Ok(reply)
    }

    pub async fn read_stb(&mut self) -> Result<u8> {
        let mut reply = self.generic_call(DEVICE_READSTB, "read_stb").await?;
        Ok((reply.get_u32()? & 0xff) as u8)
    }

    pub async fn trigger(&mut self) -> Result<()> {
        self.generic_call(DEVICE_TRIGGER, "trigger").await.map(|_| ())
    }

    pub async fn device_clear(&mut self) -> Result<()> {
        self.generic_call(DEVICE_CLEAR, "clear").await.map(|_| ())
    }

    pub async fn remote(&mut self) -> Result<()> {
        self.generic_call(DEVICE_REMOTE, "remote").await.map(|_| ())
    }

    pub async fn local(&mut self) -> Result<()> {
        self.generic_call(DEVICE_LOCAL, "local").await.map(|_| ())
    }

    pub async fn lock(&mut self) -> Result<()> {
        let mut args = XdrWriter::new();
        args.put_i32(self.link_id)
            .put_u32(OP_FLAG_WAIT_BLOCK)
            .put_u32(millis(self.options.lock_timeout));
        let mut reply = self.rpc()?.call(DEVICE_LOCK, args).await?;
        check_error(&mut reply, "lock")
    }

    pub async fn unlock(&mut self) -> Result<()> {
        let mut args = XdrWriter::new();
        args.put_i32(self.link_id);
        let mut reply = self.rpc()?.call(DEVICE_UNLOCK, args).await?;
        check_error(&mut reply, "unlock")
    }

    /// Destroy the link and drop the connection. A second close does nothing.
    pub async fn destroy(&mut self) -> Result<()> {
        let Some(mut rpc) = self.rpc.take() else {
            return Ok(());
        };

        let mut args = XdrWriter::new();
        args.put_i32(self.link_id);
        let result = match rpc.call(DESTROY_LINK, args).await {
            Ok(mut reply) => check_error(&mut reply, "destroy_link"),
            Err(e) => Err(e),
        };

        if let Err(e) = rpc.shutdown().await {
            tracing::debug!("Core channel shutdown failed: {}", e);
        }
        tracing::debug!("VXI-11 link {} closed", self.link_id);
        result
    }
}

#[async_trait]
impl Instrument for Vxi11Instrument {
    async fn write(&mut self, command: &str) -> Result<()> {
        tracing::debug!("➡️  {}", command);
        self.write_raw(command.as_bytes()).await
    }

    async fn read_raw(&mut self) -> Result<Bytes> {
        self.read_bytes().await
    }

    async fn clear(&mut self) -> Result<()> {
        self.device_clear().await
    }

    async fn close(&mut self) -> Result<()> {
        self.destroy().await
    }
}

/// Opens [`Vxi11Instrument`] links to a fixed host.
#[derive(Debug, Clone)]
pub struct Vxi11Connector {
    host: String,
    options: Vxi11Options,
}

impl Vxi11Connector {
    pub fn new(host: impl Into<String>, options: Vxi11Options) -> Self {
        Self {
            host: host.into(),
            options,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn options(&self) -> &Vxi11Options {
        &self.options
    }
}

#[async_trait]
impl Connector for Vxi11Connector {
    type Instrument = Vxi11Instrument;

    async fn open(&self) -> Result<Vxi11Instrument> {
        Vxi11Instrument::open(&self.host, self.options.clone()).await
    }
}
