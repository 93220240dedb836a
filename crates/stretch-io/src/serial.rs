use crate::ascii::{
    parse_line, Command, Message, Reply, Units, DEFAULT_MICROSTEP_MM, MAX_MESSAGE_ID,
};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stretch_core::{AxisAddress, Connection, DeviceError, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub microstep_mm: f64,
    /// How long a command may wait for its reply.
    pub reply_timeout: Duration,
    /// Discovery stops collecting replies after this much silence.
    pub discovery_window: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            microstep_mm: DEFAULT_MICROSTEP_MM,
            reply_timeout: Duration::from_millis(1000),
            discovery_window: Duration::from_millis(250),
        }
    }
}

struct Port<S> {
    stream: S,
    read_buf: Vec<u8>,
    next_id: u8,
}

impl<S> Port<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn take_id(&mut self) -> u8 {
        let id = self.next_id;
        self.next_id = if id >= MAX_MESSAGE_ID { 0 } else { id + 1 };
        id
    }

    async fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        trace!(line = line.trim_end(), "tx");
        self.stream.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.stream.flush().await.map_err(io_error)
    }

    /// Next complete line without its terminator.
    async fn read_line(&mut self) -> Result<String, DeviceError> {
        loop {
            if let Some(end) = self.read_buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.read_buf.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                trace!(line = %line, "rx");
                return Ok(line);
            }

            let mut temp_buf = [0u8; 64];
            let bytes_read = self.stream.read(&mut temp_buf[..]).await.map_err(io_error)?;
            if bytes_read == 0 {
                return Err(DeviceError::Closed);
            }
            self.read_buf.extend_from_slice(&temp_buf[..bytes_read]);
        }
    }

    /// Next reply from `device` carrying message `id`, skipping info and
    /// alert lines. Replies to earlier commands that arrived after their
    /// timeout are dropped here.
    async fn read_reply(&mut self, device: u8, id: u8) -> Result<Reply, DeviceError> {
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(Message::Reply(reply)) if reply.device == device && reply.id == Some(id) => {
                    return Ok(reply)
                }
                Ok(Message::Reply(reply)) if reply.device == device => {
                    debug!(device, expected = id, got = ?reply.id, "discarding stale reply");
                }
                Ok(Message::Reply(reply)) => {
                    debug!(device = reply.device, "ignoring reply from another device");
                }
                Ok(Message::Alert(alert)) => debug!(%alert, "device alert"),
                Ok(Message::Info(_)) => {}
                Err(e) => return Err(DeviceError::Malformed(format!("{e}: {line:?}"))),
            }
        }
    }
}

fn io_error(e: io::Error) -> DeviceError {
    DeviceError::Io(e.to_string())
}

/// A chain of controllers speaking the ASCII protocol over any byte stream.
///
/// Calls block the caller on the shared runtime; the port mutex keeps one
/// command and its reply on the wire at a time.
pub struct AsciiConnection<S> {
    runtime: Arc<Runtime>,
    port: Mutex<Option<Port<S>>>,
    units: Units,
    reply_timeout: Duration,
    discovery_window: Duration,
}

impl<S> AsciiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, runtime: Arc<Runtime>, config: &SerialConfig) -> Self {
        Self {
            runtime,
            port: Mutex::new(Some(Port {
                stream,
                read_buf: Vec::new(),
                next_id: 0,
            })),
            units: Units {
                microstep_mm: config.microstep_mm,
            },
            reply_timeout: config.reply_timeout,
            discovery_window: config.discovery_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Port<S>>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends one addressed command and returns its accepted reply.
    ///
    /// Each command carries a fresh message id and only the reply echoing it
    /// is accepted.
    fn transact(&self, target: AxisAddress, body: String) -> Result<Reply, DeviceError> {
        let limit = self.reply_timeout;

        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(DeviceError::Closed)?;
        let id = port.take_id();
        let command = Command::to(target, body).with_id(id);
        let line = command.encode();
        let reply = self.runtime.block_on(async {
            port.write_line(&line).await?;
            match timeout(limit, port.read_reply(target.device, id)).await {
                Ok(reply) => reply,
                Err(_) => Err(DeviceError::Timeout {
                    command: command.body.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            }
        })?;
        drop(guard);

        if let Some(flag) = &reply.warning {
            warn!(%target, %flag, command = %command.body, "device warning");
        }
        if !reply.accepted {
            return Err(DeviceError::Rejected {
                target,
                command: command.body,
                reason: reply.data,
            });
        }
        Ok(reply)
    }
}

impl<S> Connection for AsciiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn detect_devices(&self) -> Result<Vec<u8>, DeviceError> {
        let window = self.discovery_window;
        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(DeviceError::Closed)?;

        let mut devices = self.runtime.block_on(async {
            port.write_line(&Command::broadcast().encode()).await?;
            let mut found = Vec::new();
            loop {
                let line = match timeout(window, port.read_line()).await {
                    Ok(line) => line?,
                    Err(_) => break,
                };
                match parse_line(&line) {
                    Ok(Message::Reply(reply)) => found.push(reply.device),
                    Ok(_) => {}
                    Err(e) => warn!(%line, error = %e, "unparseable discovery reply"),
                }
            }
            Ok::<_, DeviceError>(found)
        })?;

        devices.sort_unstable();
        devices.dedup();
        debug!(?devices, "discovery finished");
        Ok(devices)
    }

    fn set_max_speed(&self, target: AxisAddress, mm_per_s: f64) -> Result<(), DeviceError> {
        let native = self.units.speed_to_native(mm_per_s);
        self.transact(target, format!("set maxspeed {native}"))?;
        Ok(())
    }

    fn home(&self, target: AxisAddress) -> Result<(), DeviceError> {
        self.transact(target, "home".to_string())?;
        Ok(())
    }

    fn stop(&self, target: AxisAddress) -> Result<(), DeviceError> {
        self.transact(target, "stop".to_string())?;
        Ok(())
    }

    fn move_absolute(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError> {
        let native = self.units.position_to_native(mm);
        self.transact(target, format!("move abs {native}"))?;
        Ok(())
    }

    fn move_relative(&self, target: AxisAddress, mm: f64) -> Result<(), DeviceError> {
        let native = self.units.position_to_native(mm);
        self.transact(target, format!("move rel {native}"))?;
        Ok(())
    }

    fn position(&self, target: AxisAddress) -> Result<f64, DeviceError> {
        let reply = self.transact(target, "get pos".to_string())?;
        let steps = reply
            .data_as_i64()
            .map_err(|e| DeviceError::Malformed(e.to_string()))?;
        Ok(self.units.native_to_position(steps))
    }

    fn is_busy(&self, target: AxisAddress) -> Result<bool, DeviceError> {
        Ok(self.transact(target, String::new())?.busy)
    }

    fn close(&self) -> Result<(), DeviceError> {
        let port = self.lock().take();
        if port.is_some() {
            debug!("serial port closed");
        }
        Ok(())
    }
}

/// Opens real serial ports.
///
/// All ports share one small runtime that drives their I/O.
pub struct SerialTransport {
    config: SerialConfig,
    runtime: Arc<Runtime>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("stretch-serial")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            runtime: Arc::new(runtime),
        })
    }
}

impl Transport for SerialTransport {
    fn open(&self, port: &str) -> Result<Box<dyn Connection>, DeviceError> {
        let _enter = self.runtime.enter();
        let stream = tokio_serial::new(port, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| DeviceError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        debug!(port, baud = self.config.baud_rate, "serial port opened");
        Ok(Box::new(AsciiConnection::new(
            stream,
            self.runtime.clone(),
            &self.config,
        )))
    }
}
