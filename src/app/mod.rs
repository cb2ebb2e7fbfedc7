//! BACnet Application Layer Module
//!
//! APDU framing (ASHRAE 135 clause 20.1) plus invoke-id bookkeeping for the
//! confirmed requests this crate issues.
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! Segmented exchanges are recognised but never reassembled: requests always
//! go out with `segmented-response-accepted` cleared, and a segmented
//! ComplexACK is surfaced so the caller can abort it.
//!
//! # Example
//!
//! ```rust
//! use bacnet_recon::app::Apdu;
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: 8, // Who-Is
//!     service_data: Default::default(),
//! };
//! assert_eq!(apdu.encode(), vec![0x10, 0x08]);
//! ```

use bytes::Bytes;

use crate::encoding::{EncodingError, Reader};

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur while framing APDUs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplicationError {
    #[error("invalid APDU: {0}")]
    InvalidApdu(String),
    #[error("unsupported APDU type {0}")]
    UnsupportedApduType(u8),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        service_choice: u8,
        service_data: Bytes,
    },

    /// Unconfirmed service request
    UnconfirmedRequest { service_choice: u8, service_data: Bytes },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        service_choice: u8,
        service_data: Bytes,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u32,
        error_code: u32,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    #[default]
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Decode the 4-bit field of a confirmed request; reserved values fall back to 50
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }
}

impl Apdu {
    /// A confirmed request as this crate sends it: unsegmented, no segmented reply accepted
    pub fn confirmed(invoke_id: u8, service_choice: u8, service_data: impl Into<Bytes>) -> Self {
        Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: false,
            max_response_size: MaxApduSize::Up1476,
            invoke_id,
            sequence_number: None,
            service_choice,
            service_data: service_data.into(),
        }
    }

    /// Invoke id of a reply or confirmed request
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_response_size,
                invoke_id,
                sequence_number,
                service_choice,
                service_data,
            } => {
                let mut first = (ApduType::ConfirmedRequest as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                if *segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                // Max segments left unspecified
                buffer.push(*max_response_size as u8);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(1);
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.extend_from_slice(&[(ApduType::SimpleAck as u8) << 4, *invoke_id, *service_choice]);
            }
            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                service_choice,
                service_data,
            } => {
                let mut first = (ApduType::ComplexAck as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(1);
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                window_size,
            } => {
                let mut first = (ApduType::SegmentAck as u8) << 4;
                if *negative {
                    first |= 0x02;
                }
                if *server {
                    first |= 0x01;
                }
                buffer.extend_from_slice(&[first, *invoke_id, *sequence_number, *window_size]);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.extend_from_slice(&[(ApduType::Error as u8) << 4, *invoke_id, *service_choice]);
                crate::encoding::encode_enumerated(&mut buffer, *error_class);
                crate::encoding::encode_enumerated(&mut buffer, *error_code);
            }
            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.extend_from_slice(&[(ApduType::Reject as u8) << 4, *invoke_id, *reject_reason]);
            }
            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let first = ((ApduType::Abort as u8) << 4) | (*server as u8);
                buffer.extend_from_slice(&[first, *invoke_id, *abort_reason]);
            }
        }
        buffer
    }

    /// Decode APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let first = reader
            .read_u8()
            .map_err(|_| ApplicationError::InvalidApdu("empty APDU".to_string()))?;
        let rest = |reader: &Reader<'_>| Bytes::copy_from_slice(reader.rest());

        let apdu = match first >> 4 {
            0 => {
                let segmented = first & 0x08 != 0;
                let max_info = reader.read_u8()?;
                let invoke_id = reader.read_u8()?;
                let sequence_number = if segmented {
                    let sequence = reader.read_u8()?;
                    reader.read_u8()?; // proposed window size
                    Some(sequence)
                } else {
                    None
                };
                let service_choice = reader.read_u8()?;
                Apdu::ConfirmedRequest {
                    segmented,
                    more_follows: first & 0x04 != 0,
                    segmented_response_accepted: first & 0x02 != 0,
                    max_response_size: MaxApduSize::from_bits(max_info),
                    invoke_id,
                    sequence_number,
                    service_choice,
                    service_data: rest(&reader),
                }
            }
            1 => {
                let service_choice = reader.read_u8()?;
                Apdu::UnconfirmedRequest {
                    service_choice,
                    service_data: rest(&reader),
                }
            }
            2 => Apdu::SimpleAck {
                invoke_id: reader.read_u8()?,
                service_choice: reader.read_u8()?,
            },
            3 => {
                let segmented = first & 0x08 != 0;
                let invoke_id = reader.read_u8()?;
                let sequence_number = if segmented {
                    let sequence = reader.read_u8()?;
                    reader.read_u8()?;
                    Some(sequence)
                } else {
                    None
                };
                let service_choice = reader.read_u8()?;
                Apdu::ComplexAck {
                    segmented,
                    more_follows: first & 0x04 != 0,
                    invoke_id,
                    sequence_number,
                    service_choice,
                    service_data: rest(&reader),
                }
            }
            4 => Apdu::SegmentAck {
                negative: first & 0x02 != 0,
                server: first & 0x01 != 0,
                invoke_id: reader.read_u8()?,
                sequence_number: reader.read_u8()?,
                window_size: reader.read_u8()?,
            },
            5 => {
                let invoke_id = reader.read_u8()?;
                let service_choice = reader.read_u8()?;
                // Some services wrap the error pair in opening tag 0
                let wrapped = reader.is_opening_tag(0);
                if wrapped {
                    reader.expect_opening_tag(0)?;
                }
                let error_class = reader.enumerated()?;
                let error_code = reader.enumerated()?;
                if wrapped {
                    reader.expect_closing_tag(0)?;
                }
                Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class,
                    error_code,
                }
            }
            6 => Apdu::Reject {
                invoke_id: reader.read_u8()?,
                reject_reason: reader.read_u8()?,
            },
            7 => Apdu::Abort {
                server: first & 0x01 != 0,
                invoke_id: reader.read_u8()?,
                abort_reason: reader.read_u8()?,
            },
            other => return Err(ApplicationError::UnsupportedApduType(other)),
        };
        Ok(apdu)
    }
}

/// Allocates invoke ids for outstanding confirmed requests
#[derive(Debug)]
pub struct InvokeIdManager {
    next_id: u8,
    active: [bool; 256],
}

impl InvokeIdManager {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            active: [false; 256],
        }
    }

    /// Get the next free invoke id, or None when all 256 are outstanding
    pub fn next_id(&mut self) -> Option<u8> {
        for _ in 0..256 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.active[id as usize] {
                self.active[id as usize] = true;
                return Some(id);
            }
        }
        None
    }

    pub fn release_id(&mut self, id: u8) {
        self.active[id as usize] = false;
    }
}

impl Default for InvokeIdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_request_header() {
        let apdu = Apdu::confirmed(7, 12, vec![0x0C]);
        assert_eq!(apdu.encode(), vec![0x00, 0x05, 0x07, 0x0C, 0x0C]);
        assert_eq!(Apdu::decode(&apdu.encode()).unwrap(), apdu);
    }

    #[test]
    fn test_segmented_complex_ack_is_flagged() {
        let data = [0x3C, 0x09, 0x00, 0x04, 0x0C, 0xAA];
        match Apdu::decode(&data).unwrap() {
            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                service_choice,
                service_data,
            } => {
                assert!(segmented);
                assert!(more_follows);
                assert_eq!(invoke_id, 9);
                assert_eq!(sequence_number, Some(0));
                assert_eq!(service_choice, 12);
                assert_eq!(service_data.as_ref(), &[0xAA]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_pdu_plain_and_wrapped() {
        // property / unknown-property
        let plain = [0x50, 0x03, 0x0C, 0x91, 0x02, 0x91, 0x20];
        let wrapped = [0x50, 0x03, 0x0E, 0x0E, 0x91, 0x02, 0x91, 0x20, 0x0F];
        for data in [&plain[..], &wrapped[..]] {
            assert_eq!(
                Apdu::decode(data).unwrap(),
                Apdu::Error {
                    invoke_id: 3,
                    service_choice: data[2],
                    error_class: 2,
                    error_code: 32,
                }
            );
        }
    }

    #[test]
    fn test_reject_and_abort() {
        assert_eq!(
            Apdu::decode(&[0x60, 0x04, 0x09]).unwrap(),
            Apdu::Reject {
                invoke_id: 4,
                reject_reason: 9
            }
        );
        let abort = Apdu::Abort {
            server: true,
            invoke_id: 5,
            abort_reason: 4,
        };
        assert_eq!(abort.encode(), vec![0x71, 0x05, 0x04]);
        assert_eq!(Apdu::decode(&abort.encode()).unwrap(), abort);
        assert_eq!(abort.invoke_id(), Some(5));
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(matches!(
            Apdu::decode(&[0x00, 0x05]),
            Err(ApplicationError::Encoding(_))
        ));
        assert_eq!(
            Apdu::decode(&[0x90]),
            Err(ApplicationError::UnsupportedApduType(9))
        );
    }

    #[test]
    fn test_invoke_ids_wrap_and_skip_active() {
        let mut ids = InvokeIdManager::new();
        assert_eq!(ids.next_id(), Some(0));
        assert_eq!(ids.next_id(), Some(1));
        for _ in 2..256 {
            assert!(ids.next_id().is_some());
        }
        assert_eq!(ids.next_id(), None);

        ids.release_id(1);
        assert_eq!(ids.next_id(), Some(1));
        assert_eq!(ids.next_id(), None);
    }
}
