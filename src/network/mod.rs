//! BACnet Network Layer Module
//!
//! Encoding and decoding of the NPDU header (ASHRAE 135 clause 6.2).
//!
//! # Overview
//!
//! The NPDU carries:
//! - Protocol version (always 1)
//! - Control information (priority, data expecting reply, network message)
//! - Destination network address (DNET, DADR) and hop count
//! - Source network address (SNET, SADR), filled in by routers
//!
//! Devices behind a BACnet router (an MS/TP trunk behind an IP gateway, for
//! example) are only reachable by putting their network number and MAC into
//! the destination specifier, and they are recognised by the source specifier
//! a router adds to their replies.
//!
//! # Example
//!
//! ```rust
//! use bacnet_recon::network::Npdu;
//!
//! let npdu = Npdu::global_broadcast();
//! assert_eq!(npdu.encode(), vec![0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
//! ```

use bytes::Bytes;

use crate::encoding::{EncodingError, Reader};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in network layer decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid NPDU: {0}")]
    InvalidNpdu(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Global broadcast network number
pub const BROADCAST_NETWORK: u16 = 0xFFFF;

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl NpduControl {
    /// Create control byte from flags
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte | (self.priority & 0x03)
    }

    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// Network address (network number + MAC address)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    /// Network number (65535 = broadcast)
    pub network: u16,
    /// MAC address on that network, empty for a broadcast on it
    pub mac: Bytes,
}

impl NetworkAddress {
    pub fn new(network: u16, mac: impl Into<Bytes>) -> Self {
        Self {
            network,
            mac: mac.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.network == BROADCAST_NETWORK || self.mac.is_empty()
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.network.to_be_bytes());
        buffer.push(self.mac.len() as u8);
        buffer.extend_from_slice(&self.mac);
    }

    fn decode(reader: &mut Reader<'_>, what: &str) -> Result<Self> {
        let network = reader.read_u16()?;
        let length = reader.read_u8()? as usize;
        let mac = reader.read_bytes(length)?;
        if network == 0 {
            return Err(NetworkError::InvalidNpdu(format!(
                "{} network number 0",
                what
            )));
        }
        Ok(Self::new(network, Bytes::copy_from_slice(mac)))
    }
}

/// Network Protocol Data Unit (NPDU) header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub control: NpduControl,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    /// Hop count (only meaningful with a destination)
    pub hop_count: u8,
    /// Network layer message type, when `control.network_message` is set
    pub message_type: Option<u8>,
}

impl Npdu {
    /// Local NPDU carrying an APDU
    pub fn new(expecting_reply: bool) -> Self {
        Self {
            control: NpduControl {
                expecting_reply,
                ..NpduControl::default()
            },
            destination: None,
            source: None,
            hop_count: 255,
            message_type: None,
        }
    }

    /// NPDU addressed to a remote network through a router
    pub fn routed(destination: NetworkAddress, expecting_reply: bool) -> Self {
        let mut npdu = Self::new(expecting_reply);
        npdu.control.destination_present = true;
        npdu.destination = Some(destination);
        npdu
    }

    /// NPDU for global broadcast (DNET 0xFFFF)
    pub fn global_broadcast() -> Self {
        Self::routed(NetworkAddress::new(BROADCAST_NETWORK, Bytes::new()), false)
    }

    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Encode the NPDU header
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(12);
        buffer.push(1);

        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();
        buffer.push(control.to_byte());

        if let Some(destination) = &self.destination {
            destination.encode(&mut buffer);
        }
        if let Some(source) = &self.source {
            source.encode(&mut buffer);
        }
        if self.destination.is_some() {
            buffer.push(self.hop_count);
        }
        if let Some(message_type) = self.message_type {
            buffer.push(message_type);
        }
        buffer
    }

    /// Decode an NPDU header, returning it with the offset of what follows
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader::new(data);

        let version = reader.read_u8()?;
        if version != 1 {
            return Err(NetworkError::InvalidNpdu(format!(
                "unsupported version {}",
                version
            )));
        }

        let control = NpduControl::from_byte(reader.read_u8()?);
        let destination = if control.destination_present {
            Some(NetworkAddress::decode(&mut reader, "destination")?)
        } else {
            None
        };
        let source = if control.source_present {
            Some(NetworkAddress::decode(&mut reader, "source")?)
        } else {
            None
        };
        let hop_count = if destination.is_some() {
            reader.read_u8()?
        } else {
            255
        };

        let message_type = if control.network_message {
            let message_type = reader.read_u8()?;
            // Proprietary network messages carry a vendor id
            if message_type >= 0x80 {
                reader.read_u16()?;
            }
            Some(message_type)
        } else {
            None
        };

        let npdu = Npdu {
            control,
            destination,
            source,
            hop_count,
            message_type,
        };
        Ok((npdu, reader.position()))
    }
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new(false)
    }
}
