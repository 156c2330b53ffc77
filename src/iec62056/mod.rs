//! IEC 62056-21 request/response primitives for tariff devices.
//!
//! The meter is asked for single registers with `R1` read commands and
//! answers with data blocks of `ADDRESS(VALUE)` lines. This module owns the
//! data model and the [`Transport`]/[`Dialer`] seams; the byte-level mode C
//! session lives in [`tcp`].

use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod tcp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    R1,
}

impl CommandId {
    pub fn wire(self) -> [u8; 2] {
        match self {
            CommandId::R1 => *b"R1",
        }
    }
}

/// A single register read/write request. `value` is the optional operand
/// placed inside the parentheses (empty for plain reads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSet {
    pub address: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub payload: DataSet,
}

impl Command {
    pub fn read(address: &str) -> Self {
        Command {
            id: CommandId::R1,
            payload: DataSet {
                address: address.to_string(),
                value: String::new(),
            },
        }
    }

    pub fn read_arg(address: &str, value: &str) -> Self {
        Command {
            id: CommandId::R1,
            payload: DataSet {
                address: address.to_string(),
                value: value.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataLine {
    pub sets: Vec<DataSet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBlock {
    pub lines: Vec<DataLine>,
}

impl DataBlock {
    /// Parses the textual payload between STX and ETX into lines and sets.
    /// A `*` inside a value separates the unit, which is dropped.
    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let raw = raw.trim_end_matches('\r');
            if raw.is_empty() {
                continue;
            }
            let line = parse_line(raw);
            if !line.sets.is_empty() {
                lines.push(line);
            }
        }
        DataBlock { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() || self.lines[0].sets.is_empty()
    }

    /// First value of the first line, the usual shape of single-register answers.
    pub fn first_value(&self) -> Option<&str> {
        self.lines
            .first()
            .and_then(|l| l.sets.first())
            .map(|s| s.value.as_str())
    }
}

fn parse_line(line: &str) -> DataLine {
    let mut sets = Vec::new();
    let address = line.split('(').next().unwrap_or("").to_string();
    let mut rest = &line[address.len()..];
    while let Some(start) = rest.find('(') {
        let Some(len) = rest[start..].find(')') else {
            break;
        };
        let raw = &rest[start + 1..start + len];
        let value = raw.split('*').next().unwrap_or("").to_string();
        sets.push(DataSet {
            address: if sets.is_empty() {
                address.clone()
            } else {
                String::new()
            },
            value,
        });
        rest = &rest[start + len + 1..];
    }
    DataLine { sets }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("exchange timed out")]
    Timeout,
    #[error("block check mismatch")]
    Bcc,
    #[error("device rejected the command")]
    Nak,
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// One live protocol session with a meter.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Device-reported session inactivity limit; once set the transport
    /// re-runs the sign-on handshake when the link sat idle longer than this.
    fn set_idle_timeout(&mut self, timeout: Duration);

    async fn command(&mut self, cmd: &Command) -> Result<DataBlock, TransportError>;

    async fn close(self);
}

/// Opens [`Transport`] sessions against a serial-to-TCP bridge.
#[allow(async_fn_in_trait)]
pub trait Dialer {
    type Conn: Transport;

    async fn dial(&self, socket: &str, address: &str) -> Result<Self::Conn, TransportError>;
}
