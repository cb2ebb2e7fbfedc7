//! BACnet Object Model
//!
//! The small slice of the BACnet object model that reconnaissance needs:
//! object identifiers (the elements of a device's object list), object types,
//! the property identifiers this crate reads, segmentation support as
//! advertised in I-Am, and decoded property values.
//!
//! # Examples
//!
//! ```rust
//! use bacnet_recon::object::{ObjectIdentifier, ObjectType};
//!
//! let device = ObjectIdentifier::new(ObjectType::Device, 123456);
//! assert!(device.is_valid());
//!
//! // Object identifiers travel as one 32-bit word: type << 22 | instance
//! let raw: u32 = device.into();
//! assert_eq!(raw, (8 << 22) | 123456);
//! assert_eq!(ObjectIdentifier::from(raw), device);
//! assert_eq!(device.to_string(), "Device:123456");
//! ```

use std::fmt;

mod object_type;
mod property_identifier;

pub use object_type::{ObjectType, ObjectTypeValue};
pub use property_identifier::{PropertyIdentifier, PropertyIdentifierValue};

/// Result type for object operations
pub type Result<T> = std::result::Result<T, ObjectError>;

/// Errors that can occur with object model values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// Segmentation value outside the BACnetSegmentation enumeration
    #[error("unknown segmentation value {0}")]
    UnknownSegmentation(u32),
    /// Instance number does not fit in 22 bits
    #[error("instance number {0} exceeds 4194303")]
    InstanceOutOfRange(u32),
}

/// Largest instance number an object identifier can carry
pub const MAX_INSTANCE: u32 = 0x3FFFFF;

/// Object identifier (type + instance number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "u32", from = "u32"))]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    /// Create a new object identifier
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// The device object of the given instance
    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    /// Check if instance number is valid (0-4194303)
    pub fn is_valid(&self) -> bool {
        self.instance <= MAX_INSTANCE
    }
}

impl From<u32> for ObjectIdentifier {
    /// Convert from 32-bit object identifier.
    /// See clause 20.2.14 of the BACnet specification.
    fn from(value: u32) -> Self {
        let object_type = ((value >> 22) & 0x3FF) as u16;
        Self::new(object_type.into(), value & MAX_INSTANCE)
    }
}

impl From<ObjectIdentifier> for u32 {
    fn from(value: ObjectIdentifier) -> Self {
        let object_type: u16 = value.object_type.into();
        ((object_type as u32 & 0x3FF) << 22) | (value.instance & MAX_INSTANCE)
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Segmentation support enumeration, as carried in I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    #[default]
    NoSegmentation = 3,
}

impl Segmentation {
    /// Whether the device can send a reply in several segments
    pub fn can_transmit(&self) -> bool {
        matches!(self, Self::Both | Self::Transmit)
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = ObjectError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            _ => Err(ObjectError::UnknownSegmentation(value)),
        }
    }
}

impl fmt::Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Both => write!(f, "Both"),
            Self::Transmit => write!(f, "Transmit"),
            Self::Receive => write!(f, "Receive"),
            Self::NoSegmentation => write!(f, "None"),
        }
    }
}

/// Property values can be of various types
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(Vec<bool>),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectIdentifier(ObjectIdentifier),
}

impl PropertyValue {
    pub fn as_object_identifier(&self) -> Option<ObjectIdentifier> {
        match self {
            Self::ObjectIdentifier(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Self::Unsigned(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::CharacterString(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Real(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::OctetString(v) => write!(f, "0x{}", hex::encode(v)),
            Self::CharacterString(v) => write!(f, "{:?}", v),
            Self::BitString(bits) => {
                let bits: String = bits.iter().map(|b| if *b { '1' } else { '0' }).collect();
                write!(f, "b{}", bits)
            }
            Self::Enumerated(v) => write!(f, "enum({})", v),
            Self::Date(d) => write!(f, "{}-{:02}-{:02}", d.year, d.month, d.day),
            Self::Time(t) => write!(
                f,
                "{:02}:{:02}:{:02}.{:02}",
                t.hour, t.minute, t.second, t.hundredths
            ),
            Self::ObjectIdentifier(id) => write!(f, "{}", id),
        }
    }
}

/// BACnet date representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: u16,   // 1900-2155, 255 = unspecified
    pub month: u8,   // 1-12, 13 = odd months, 14 = even months, 255 = unspecified
    pub day: u8,     // 1-31, 32 = last day of month, 255 = unspecified
    pub weekday: u8, // 1-7 (Mon-Sun), 255 = unspecified
}

/// BACnet time representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub hour: u8,       // 0-23, 255 = unspecified
    pub minute: u8,     // 0-59, 255 = unspecified
    pub second: u8,     // 0-59, 255 = unspecified
    pub hundredths: u8, // 0-99, 255 = unspecified
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identifier_word() {
        let id = ObjectIdentifier::new(ObjectType::AnalogInput, 7);
        assert_eq!(u32::from(id), 7);

        let id = ObjectIdentifier::from(0x0200_0001);
        assert_eq!(id.object_type, ObjectType::Device);
        assert_eq!(id.instance, 1);
        assert_eq!(id.to_string(), "Device:1");
    }

    #[test]
    fn test_proprietary_object_types_survive() {
        let raw = (700u32 << 22) | 12;
        let id = ObjectIdentifier::from(raw);
        assert!(matches!(id.object_type, ObjectType::Custom(_)));
        assert!(!id.object_type.is_standard());
        assert_eq!(u32::from(id), raw);
        assert_eq!(id.to_string(), "Custom(700):12");

        let reserved = ObjectIdentifier::from((100u32 << 22) | 1);
        assert!(matches!(reserved.object_type, ObjectType::Reserved(_)));
    }

    #[test]
    fn test_ordering_follows_type_then_instance() {
        let mut ids = vec![
            ObjectIdentifier::new(ObjectType::BinaryInput, 1),
            ObjectIdentifier::new(ObjectType::AnalogInput, 2),
            ObjectIdentifier::new(ObjectType::AnalogInput, 1),
        ];
        ids.sort();
        assert_eq!(ids[0], ObjectIdentifier::new(ObjectType::AnalogInput, 1));
        assert_eq!(ids[2].object_type, ObjectType::BinaryInput);
    }

    #[test]
    fn test_segmentation() {
        assert_eq!(Segmentation::try_from(0).unwrap(), Segmentation::Both);
        assert_eq!(
            Segmentation::try_from(9),
            Err(ObjectError::UnknownSegmentation(9))
        );
        assert!(Segmentation::Transmit.can_transmit());
        assert!(!Segmentation::Receive.can_transmit());
        assert_eq!(Segmentation::default(), Segmentation::NoSegmentation);
        assert_eq!(Segmentation::NoSegmentation.to_string(), "None");
    }

    #[test]
    fn test_property_value_accessors() {
        let id = ObjectIdentifier::device(5);
        assert_eq!(
            PropertyValue::ObjectIdentifier(id).as_object_identifier(),
            Some(id)
        );
        assert_eq!(PropertyValue::Unsigned(3).as_unsigned(), Some(3));
        assert_eq!(PropertyValue::Real(1.0).as_unsigned(), None);
        assert_eq!(
            PropertyValue::CharacterString("AHU-1".into()).as_str(),
            Some("AHU-1")
        );
        assert_eq!(PropertyValue::OctetString(vec![0xAB, 0x01]).to_string(), "0xab01");
    }
}
