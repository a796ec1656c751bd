// Wire format: a 12-byte ASCII command name, zero padded, followed by the
// bincode payload for that command. One message per connection.

use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize, MAX_RECORD_SIZE};
use log::warn;
use std::fmt;
use std::io::Read;

pub const COMMAND_LEN: usize = 12;
pub const NODE_VERSION: u32 = 1;

/// Largest envelope a node reads from one connection.
pub const MAX_MESSAGE_SIZE: usize = COMMAND_LEN + MAX_RECORD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum OpType {
    Tx,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Version {
    pub version: u32,
    pub best_height: u64,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetBlocks {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Inv {
    pub addr_from: String,
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct GetData {
    pub addr_from: String,
    pub op_type: OpType,
    pub id: Vec<u8>,
}

/// A serialized block.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockData {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// A serialized transaction.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxData {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    GetBlocks(GetBlocks),
    Inv(Inv),
    GetData(GetData),
    Block(BlockData),
    Tx(TxData),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
        }
    }

    pub fn addr_from(&self) -> &str {
        match self {
            Message::Version(m) => &m.addr_from,
            Message::GetBlocks(m) => &m.addr_from,
            Message::Inv(m) => &m.addr_from,
            Message::GetData(m) => &m.addr_from,
            Message::Block(m) => &m.addr_from,
            Message::Tx(m) => &m.addr_from,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Version(m) => serialize(m)?,
            Message::GetBlocks(m) => serialize(m)?,
            Message::Inv(m) => serialize(m)?,
            Message::GetData(m) => serialize(m)?,
            Message::Block(m) => serialize(m)?,
            Message::Tx(m) => serialize(m)?,
        };
        let mut bytes = command_to_bytes(self.command()).to_vec();
        bytes.extend(payload);
        Ok(bytes)
    }

    /// Decodes one envelope. Unknown commands yield `Ok(None)`.
    pub fn decode(bytes: &[u8]) -> Result<Option<Message>> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(BlockchainError::Serialization(format!(
                "Message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                bytes.len()
            )));
        }
        if bytes.len() < COMMAND_LEN {
            return Err(BlockchainError::Serialization(format!(
                "Message of {} bytes is shorter than its command header",
                bytes.len()
            )));
        }
        let (header, payload) = bytes.split_at(COMMAND_LEN);
        let command = bytes_to_command(header)?;

        let message = match command.as_str() {
            "version" => Message::Version(deserialize(payload)?),
            "getblocks" => Message::GetBlocks(deserialize(payload)?),
            "inv" => Message::Inv(deserialize(payload)?),
            "getdata" => Message::GetData(deserialize(payload)?),
            "block" => Message::Block(deserialize(payload)?),
            "tx" => Message::Tx(deserialize(payload)?),
            other => {
                warn!("Ignoring unknown command {other:?}");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Version(m) => write!(
                f,
                "version(v{}, height {}) from {}",
                m.version, m.best_height, m.addr_from
            ),
            Message::Inv(m) => write!(
                f,
                "inv({:?}, {} items) from {}",
                m.op_type,
                m.items.len(),
                m.addr_from
            ),
            Message::GetData(m) => write!(f, "getdata({:?}) from {}", m.op_type, m.addr_from),
            other => write!(f, "{} from {}", other.command(), other.addr_from()),
        }
    }
}

/// Reads one envelope to end of stream, refusing to buffer more than
/// [`MAX_MESSAGE_SIZE`] bytes.
pub fn read_envelope<R: Read>(reader: R) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut bytes)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(BlockchainError::Serialization(format!(
            "Message exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }
    Ok(bytes)
}

fn command_to_bytes(command: &str) -> [u8; COMMAND_LEN] {
    let mut bytes = [0u8; COMMAND_LEN];
    for (slot, byte) in bytes.iter_mut().zip(command.bytes()) {
        *slot = byte;
    }
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let name = &bytes[..end];
    if !name.is_ascii() {
        return Err(BlockchainError::Serialization(
            "Command name is not ASCII".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}
