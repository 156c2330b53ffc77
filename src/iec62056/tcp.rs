//! Mode C session over a serial-to-TCP bridge.
//!
//! The bridge forwards raw meter bytes, so parity may have to be handled in
//! software when the converter is pinned to 8N1 (`sw_parity`). Timeouts are
//! fixed: 20s to connect, 10s per exchange.

use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Command, DataBlock, Dialer, Transport, TransportError};

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const RW_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_FRAME: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    pub sw_parity: bool,
    pub log_protocol: bool,
}

impl TcpDialer {
    pub fn new(sw_parity: bool, log_protocol: bool) -> Self {
        TcpDialer {
            sw_parity,
            log_protocol,
        }
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpTransport;

    async fn dial(&self, socket: &str, address: &str) -> Result<TcpTransport, TransportError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(socket))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        let mut conn = TcpTransport {
            stream,
            address: address.to_string(),
            sw_parity: self.sw_parity,
            log_protocol: self.log_protocol,
            idle_timeout: None,
            last_exchange: Instant::now(),
        };
        timeout(RW_TIMEOUT, conn.sign_on())
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(conn)
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    address: String,
    sw_parity: bool,
    log_protocol: bool,
    idle_timeout: Option<Duration>,
    last_exchange: Instant,
}

impl Transport for TcpTransport {
    fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
    }

    async fn command(&mut self, cmd: &Command) -> Result<DataBlock, TransportError> {
        timeout(RW_TIMEOUT, self.exchange(cmd))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn close(mut self) {
        let mut frame = vec![SOH, b'B', b'0', ETX];
        frame.push(block_check(&frame[1..]));
        let _ = timeout(RW_TIMEOUT, self.send_raw(&frame)).await;
        let _ = self.stream.shutdown().await;
    }
}

impl TcpTransport {
    /// Sign-on, identification and switch into programming mode.
    async fn sign_on(&mut self) -> Result<(), TransportError> {
        let request = format!("/?{}!\r\n", self.address);
        self.send_raw(request.as_bytes()).await?;

        let ident = self.read_line().await?;
        if !ident.starts_with('/') {
            return Err(TransportError::Unexpected(ident));
        }
        // /XXXZident... where Z is the proposed baud rate character.
        let baud = ident.as_bytes().get(4).copied().unwrap_or(b'5');
        self.send_raw(&[ACK, b'0', baud, b'1', CR, LF]).await?;

        // Programming mode answer: SOH P0 STX (operand) ETX BCC.
        let frame = self.read_frame().await?;
        if !frame.starts_with(&[SOH, b'P', b'0']) {
            return Err(TransportError::Unexpected(
                String::from_utf8_lossy(&frame).into_owned(),
            ));
        }
        self.last_exchange = Instant::now();
        Ok(())
    }

    async fn exchange(&mut self, cmd: &Command) -> Result<DataBlock, TransportError> {
        if let Some(idle) = self.idle_timeout {
            if self.last_exchange.elapsed() >= idle {
                debug!("session idle limit passed, signing on again");
                self.sign_on().await?;
            }
        }

        let mut frame = Vec::with_capacity(cmd.payload.address.len() + cmd.payload.value.len() + 8);
        frame.push(SOH);
        frame.extend_from_slice(&cmd.id.wire());
        frame.push(STX);
        frame.extend_from_slice(cmd.payload.address.as_bytes());
        frame.push(b'(');
        frame.extend_from_slice(cmd.payload.value.as_bytes());
        frame.push(b')');
        frame.push(ETX);
        frame.push(block_check(&frame[1..]));
        self.send_raw(&frame).await?;

        let reply = self.read_frame().await?;
        self.last_exchange = Instant::now();
        match reply.first() {
            Some(&STX) => {
                let payload = String::from_utf8_lossy(&reply[1..reply.len() - 1]);
                Ok(DataBlock::parse(&payload))
            }
            _ => Err(TransportError::Unexpected(
                String::from_utf8_lossy(&reply).into_owned(),
            )),
        }
    }

    /// Reads one framed message up to and including ETX, verifies the BCC
    /// and returns the frame without it.
    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut frame = Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if frame.is_empty() && byte == NAK {
                return Err(TransportError::Nak);
            }
            frame.push(byte);
            if byte == ETX {
                break;
            }
            if frame.len() > MAX_FRAME {
                return Err(TransportError::Unexpected("oversized frame".to_string()));
            }
        }
        let bcc = self.read_byte().await?;
        self.log_bytes("recv", &frame);
        if bcc != block_check(&frame[1..]) {
            return Err(TransportError::Bcc);
        }
        Ok(frame)
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if byte == LF {
                break;
            }
            if byte != CR {
                line.push(byte);
            }
            if line.len() > 128 {
                return Err(TransportError::Unexpected("oversized identification".to_string()));
            }
        }
        self.log_bytes("recv", &line);
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn read_byte(&mut self) -> Result<u8, TransportError> {
        let byte = self.stream.read_u8().await?;
        Ok(if self.sw_parity { byte & 0x7f } else { byte })
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.log_bytes("send", bytes);
        if self.sw_parity {
            let encoded: Vec<u8> = bytes.iter().map(|&b| with_even_parity(b)).collect();
            self.stream.write_all(&encoded).await?;
        } else {
            self.stream.write_all(bytes).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    fn log_bytes(&self, direction: &str, bytes: &[u8]) {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        if self.log_protocol {
            debug!("{direction} {hex}");
        } else {
            trace!("{direction} {hex}");
        }
    }
}

/// XOR over every byte after the leading control character through ETX.
fn block_check(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Even parity for 7E1 emulated over an 8N1 bridge.
fn with_even_parity(byte: u8) -> u8 {
    let byte = byte & 0x7f;
    if byte.count_ones() % 2 == 1 {
        byte | 0x80
    } else {
        byte
    }
}
