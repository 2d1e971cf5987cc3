#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rohdescope::adapters::vxi11::instrument::{
    CREATE_LINK, DESTROY_LINK, DEVICE_CLEAR, DEVICE_CORE_PROGRAM, DEVICE_LOCAL, DEVICE_LOCK,
    DEVICE_READ, DEVICE_READSTB, DEVICE_REMOTE, DEVICE_UNLOCK, DEVICE_WRITE, OP_FLAG_END, RX_END,
};
use rohdescope::adapters::vxi11::portmap::{PORTMAP_GETPORT, PORTMAP_PROGRAM};
use rohdescope::adapters::vxi11::rpc::{self, AUTH_NULL, MSG_ACCEPTED, MSG_REPLY};
use rohdescope::adapters::vxi11::xdr::{XdrReader, XdrWriter};
use rohdescope::domain::ports::{Connector, Instrument};
use rohdescope::{Result, ScopeError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub const RTM_IDN: &str = "Rohde&Schwarz,RTM2054,1317.5005k04/101234,05.502";
pub const RTO_IDN: &str = "Rohde&Schwarz,RTO1004,1316.1000k04/200345,2.15.2.0";

/// Build a definite-length IEEE 488.2 block around `payload`.
pub fn block(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut data = format!("#{}{}", length.len(), length).into_bytes();
    data.extend_from_slice(payload);
    data.push(b'\n');
    data
}

#[derive(Default)]
struct Script {
    writes: Vec<String>,
    answers: HashMap<String, VecDeque<Bytes>>,
    pending: VecDeque<Bytes>,
    opened: usize,
    closed: usize,
    device_clears: usize,
    fail_close: bool,
}

/// Scripted scope shared by a [`MockConnector`] and the instruments it opens.
///
/// Queries are answered from per-command queues. The last answer of a queue is
/// repeated once the others are used up.
#[derive(Clone, Default)]
pub struct MockScope {
    script: Arc<Mutex<Script>>,
}

impl MockScope {
    pub fn new(idn: &str) -> Self {
        let scope = Self::default();
        scope.answer("*IDN?", idn);
        scope
    }

    pub fn answer(&self, command: &str, answer: &str) -> &Self {
        self.answer_bytes(command, format!("{}\n", answer).into_bytes())
    }

    pub fn answer_bytes(&self, command: &str, answer: Vec<u8>) -> &Self {
        self.script
            .lock()
            .unwrap()
            .answers
            .entry(command.to_string())
            .or_default()
            .push_back(Bytes::from(answer));
        self
    }

    pub fn writes(&self) -> Vec<String> {
        self.script.lock().unwrap().writes.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.writes().iter().filter(|w| w.as_str() == command).count()
    }

    pub fn clear_writes(&self) {
        self.script.lock().unwrap().writes.clear();
    }

    pub fn opened(&self) -> usize {
        self.script.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.script.lock().unwrap().closed
    }

    pub fn device_clears(&self) -> usize {
        self.script.lock().unwrap().device_clears
    }

    /// Make closing the link fail, as a lost destroy_link reply would.
    pub fn fail_close(&self) -> &Self {
        self.script.lock().unwrap().fail_close = true;
        self
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            scope: self.clone(),
        }
    }
}

pub struct MockInstrument {
    scope: MockScope,
}

#[async_trait]
impl Instrument for MockInstrument {
    async fn write(&mut self, command: &str) -> Result<()> {
        let mut script = self.scope.script.lock().unwrap();
        script.writes.push(command.to_string());

        let answer = script.answers.get_mut(command).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        if let Some(answer) = answer {
            script.pending.push_back(answer);
        }
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<Bytes> {
        self.scope
            .script
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .ok_or_else(|| ScopeError::timeout("read"))
    }

    async fn clear(&mut self) -> Result<()> {
        let mut script = self.scope.script.lock().unwrap();
        script.pending.clear();
        script.device_clears += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut script = self.scope.script.lock().unwrap();
        script.closed += 1;
        if script.fail_close {
            return Err(ScopeError::timeout("destroy_link"));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockConnector {
    scope: MockScope,
}

#[async_trait]
impl Connector for MockConnector {
    type Instrument = MockInstrument;

    async fn open(&self) -> Result<MockInstrument> {
        self.scope.script.lock().unwrap().opened += 1;
        Ok(MockInstrument {
            scope: self.scope.clone(),
        })
    }
}

const LINK_ID: i32 = 7;
const ERR_IO_TIMEOUT: u32 = 15;
const ERR_NOT_SUPPORTED: u32 = 8;

#[derive(Default)]
pub struct DeviceState {
    pub max_recv_size: u32,
    /// Largest chunk returned by one device_read.
    pub read_chunk: usize,
    answers: HashMap<String, Vec<u8>>,
    /// One-shot delays applied to the reply of the write ending a command.
    delays: HashMap<String, Duration>,
    reply_delay: Option<Duration>,
    partial: Vec<u8>,
    output: Vec<u8>,
    pub commands: Vec<String>,
    pub write_chunks: Vec<usize>,
    pub portmap_lookups: usize,
    pub links_created: usize,
    pub links_destroyed: usize,
    pub locked: bool,
    pub remote: bool,
    pub device_name: Option<String>,
}

/// In-process VXI-11 device. The portmapper and the core channel share the
/// same TCP port.
pub struct FakeDevice {
    pub port: u16,
    pub state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub async fn start(max_recv_size: u32, read_chunk: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(DeviceState {
            max_recv_size,
            read_chunk,
            ..DeviceState::default()
        }));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, port, state).await;
                });
            }
        });

        Self { port, state }
    }

    pub fn answer(&self, command: &str, answer: &[u8]) -> &Self {
        self.state
            .lock()
            .unwrap()
            .answers
            .insert(command.to_string(), answer.to_vec());
        self
    }

    pub fn delay_reply(&self, command: &str, delay: Duration) -> &Self {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(command.to_string(), delay);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

async fn serve(mut stream: TcpStream, port: u16, state: Arc<Mutex<DeviceState>>) -> Result<()> {
    loop {
        let record = rpc::read_record(&mut stream).await?;
        let mut call = XdrReader::new(record);

        let xid = call.get_u32()?;
        let _message_type = call.get_u32()?;
        let _rpc_version = call.get_u32()?;
        let program = call.get_u32()?;
        let _version = call.get_u32()?;
        let procedure = call.get_u32()?;
        call.get_u32()?;
        call.get_opaque()?;
        call.get_u32()?;
        call.get_opaque()?;

        let mut reply = XdrWriter::new();
        reply
            .put_u32(xid)
            .put_u32(MSG_REPLY)
            .put_u32(MSG_ACCEPTED)
            .put_u32(AUTH_NULL)
            .put_opaque(&[]);

        let body = match program {
            PORTMAP_PROGRAM => portmap(&mut call, procedure, port, &state)?,
            DEVICE_CORE_PROGRAM => core(&mut call, procedure, &state)?,
            _ => None,
        };
        match body {
            Some(body) => {
                reply.put_u32(0).put_raw(&body.into_bytes());
            }
            // PROG_UNAVAIL
            None => {
                reply.put_u32(1);
            }
        }

        let delay = state.lock().unwrap().reply_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        rpc::write_record(&mut stream, &reply.into_bytes()).await?;
    }
}

fn portmap(
    call: &mut XdrReader,
    procedure: u32,
    port: u16,
    state: &Mutex<DeviceState>,
) -> Result<Option<XdrWriter>> {
    if procedure != PORTMAP_GETPORT {
        return Ok(None);
    }
    let program = call.get_u32()?;
    state.lock().unwrap().portmap_lookups += 1;

    let mut body = XdrWriter::new();
    body.put_u32(if program == DEVICE_CORE_PROGRAM {
        u32::from(port)
    } else {
        0
    });
    Ok(Some(body))
}

fn core(
    call: &mut XdrReader,
    procedure: u32,
    state: &Mutex<DeviceState>,
) -> Result<Option<XdrWriter>> {
    let mut state = state.lock().unwrap();
    let mut body = XdrWriter::new();

    match procedure {
        CREATE_LINK => {
            let _client_id = call.get_i32()?;
            let _lock = call.get_bool()?;
            let _lock_timeout = call.get_u32()?;
            state.device_name = Some(call.get_string()?);
            state.links_created += 1;
            body.put_u32(0)
                .put_i32(LINK_ID)
                .put_u32(0)
                .put_u32(state.max_recv_size);
        }
        DEVICE_WRITE => {
            let _link = call.get_i32()?;
            let _io_timeout = call.get_u32()?;
            let _lock_timeout = call.get_u32()?;
            let flags = call.get_u32()?;
            let data = call.get_opaque()?;

            state.write_chunks.push(data.len());
            state.partial.extend_from_slice(&data);
            if flags & OP_FLAG_END != 0 {
                let command = String::from_utf8_lossy(&state.partial).trim().to_string();
                state.partial.clear();
                if let Some(answer) = state.answers.get(&command).cloned() {
                    state.output.extend_from_slice(&answer);
                }
                state.reply_delay = state.delays.remove(&command);
                state.commands.push(command);
            }
            body.put_u32(0).put_u32(data.len() as u32);
        }
        DEVICE_READ => {
            if state.output.is_empty() {
                body.put_u32(ERR_IO_TIMEOUT).put_u32(0).put_opaque(&[]);
            } else {
                let take = state.read_chunk.min(state.output.len());
                let chunk: Vec<u8> = state.output.drain(..take).collect();
                let reason = if state.output.is_empty() { RX_END } else { 0 };
                body.put_u32(0).put_u32(reason).put_opaque(&chunk);
            }
        }
        DEVICE_READSTB => {
            body.put_u32(0).put_u32(0x10);
        }
        DEVICE_CLEAR => {
            state.output.clear();
            body.put_u32(0);
        }
        DEVICE_REMOTE | DEVICE_LOCAL => {
            state.remote = procedure == DEVICE_REMOTE;
            body.put_u32(0);
        }
        DEVICE_LOCK => {
            state.locked = true;
            body.put_u32(0);
        }
        // 12: no lock held by this link
        DEVICE_UNLOCK => {
            let held = std::mem::replace(&mut state.locked, false);
            body.put_u32(if held { 0 } else { 12 });
        }
        DESTROY_LINK => {
            state.links_destroyed += 1;
            body.put_u32(0);
        }
        _ => {
            body.put_u32(ERR_NOT_SUPPORTED);
        }
    }
    Ok(Some(body))
}
