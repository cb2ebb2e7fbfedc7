//! BACnet Application Layer Services
//!
//! Request and acknowledgement encodings (ASHRAE 135 clauses 13, 15 and 16)
//! for the services reconnaissance needs.
//!
//! # Service Categories
//!
//! ## Remote Device Management Services
//! - **Who-Is / I-Am**: device discovery, optionally limited to an instance range
//!
//! ## Object Access Services
//! - **ReadProperty**: one property, optionally one array element
//! - **ReadPropertyMultiple**: several properties of several objects in one exchange
//!
//! ## Alarm and Event Services
//! - **SubscribeCOV**: ask a device to report changes of value
//! - **COV notifications**: the confirmed and unconfirmed reports themselves
//!
//! # Examples
//!
//! ```rust
//! use bacnet_recon::device::InstanceRange;
//! use bacnet_recon::service::WhoIsRequest;
//!
//! let whois = WhoIsRequest::for_range(InstanceRange::new(100, 200).unwrap());
//! let mut buffer = Vec::new();
//! whois.encode(&mut buffer);
//! assert_eq!(buffer, vec![0x09, 100, 0x19, 200]);
//! assert!(whois.matches(150));
//! ```

use std::fmt;

use crate::device::{CapabilitySummary, InstanceRange};
use crate::encoding::{
    encode_closing_tag, encode_context_boolean, encode_context_enumerated,
    encode_context_object_id, encode_context_unsigned, encode_enumerated,
    encode_object_identifier, encode_opening_tag, encode_property_value, encode_unsigned,
    EncodingError, Reader,
};
use crate::object::{ObjectIdentifier, PropertyIdentifier, PropertyValue, Segmentation};

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur with service payloads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("unsupported service choice {0}")]
    UnsupportedServiceChoice(u8),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Confirmed service choices used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    ConfirmedCOVNotification = 1,
    SubscribeCOV = 5,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::ConfirmedCOVNotification),
            5 => Ok(Self::SubscribeCOV),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

/// Unconfirmed service choices used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCOVNotification = 2,
    WhoHas = 7,
    WhoIs = 8,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCOVNotification),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

/// Reject reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Other,
    BufferOverflow,
    InconsistentParameters,
    InvalidParameterDataType,
    InvalidTag,
    MissingRequiredParameter,
    ParameterOutOfRange,
    TooManyArguments,
    UndefinedEnumeration,
    UnrecognizedService,
    Proprietary(u8),
}

impl From<u8> for RejectReason {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::BufferOverflow,
            2 => Self::InconsistentParameters,
            3 => Self::InvalidParameterDataType,
            4 => Self::InvalidTag,
            5 => Self::MissingRequiredParameter,
            6 => Self::ParameterOutOfRange,
            7 => Self::TooManyArguments,
            8 => Self::UndefinedEnumeration,
            9 => Self::UnrecognizedService,
            other => Self::Proprietary(other),
        }
    }
}

impl From<RejectReason> for u8 {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::Other => 0,
            RejectReason::BufferOverflow => 1,
            RejectReason::InconsistentParameters => 2,
            RejectReason::InvalidParameterDataType => 3,
            RejectReason::InvalidTag => 4,
            RejectReason::MissingRequiredParameter => 5,
            RejectReason::ParameterOutOfRange => 6,
            RejectReason::TooManyArguments => 7,
            RejectReason::UndefinedEnumeration => 8,
            RejectReason::UnrecognizedService => 9,
            RejectReason::Proprietary(value) => value,
        }
    }
}

/// Abort reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Other,
    BufferOverflow,
    InvalidApduInThisState,
    PreemptedByHigherPriorityTask,
    SegmentationNotSupported,
    Proprietary(u8),
}

impl From<u8> for AbortReason {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::BufferOverflow,
            2 => Self::InvalidApduInThisState,
            3 => Self::PreemptedByHigherPriorityTask,
            4 => Self::SegmentationNotSupported,
            other => Self::Proprietary(other),
        }
    }
}

impl From<AbortReason> for u8 {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Other => 0,
            AbortReason::BufferOverflow => 1,
            AbortReason::InvalidApduInThisState => 2,
            AbortReason::PreemptedByHigherPriorityTask => 3,
            AbortReason::SegmentationNotSupported => 4,
            AbortReason::Proprietary(value) => value,
        }
    }
}

/// Error class and code values from the Error PDU and RPM access errors
pub mod error_codes {
    pub const CLASS_DEVICE: u32 = 0;
    pub const CLASS_OBJECT: u32 = 1;
    pub const CLASS_PROPERTY: u32 = 2;
    pub const CLASS_RESOURCES: u32 = 3;
    pub const CLASS_SERVICES: u32 = 5;
    pub const CLASS_COMMUNICATION: u32 = 7;

    pub const OTHER: u32 = 0;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const UNKNOWN_PROPERTY: u32 = 32;
    pub const INVALID_ARRAY_INDEX: u32 = 42;
    pub const SERVICE_REQUEST_DENIED: u32 = 29;
    pub const PROPERTY_IS_NOT_AN_ARRAY: u32 = 50;
}

/// An error reported by a device for a whole request or one RPM property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetError {
    pub class: u32,
    pub code: u32,
}

impl BacnetError {
    pub fn new(class: u32, code: u32) -> Self {
        Self { class, code }
    }
}

impl fmt::Display for BacnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use error_codes::*;

        let class = match self.class {
            CLASS_DEVICE => "device",
            CLASS_OBJECT => "object",
            CLASS_PROPERTY => "property",
            CLASS_RESOURCES => "resources",
            CLASS_SERVICES => "services",
            CLASS_COMMUNICATION => "communication",
            _ => "class",
        };
        match self.code {
            UNKNOWN_OBJECT => write!(f, "{}: unknown-object", class),
            UNKNOWN_PROPERTY => write!(f, "{}: unknown-property", class),
            INVALID_ARRAY_INDEX => write!(f, "{}: invalid-array-index", class),
            SERVICE_REQUEST_DENIED => write!(f, "{}: service-request-denied", class),
            PROPERTY_IS_NOT_AN_ARRAY => write!(f, "{}: property-is-not-an-array", class),
            code => write!(f, "{}: code {}", class, code),
        }
    }
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Instance range; None asks every device
    pub range: Option<InstanceRange>,
}

impl WhoIsRequest {
    /// Create a new Who-Is request for all devices
    pub fn new() -> Self {
        Self { range: None }
    }

    /// Create a new Who-Is request for a range of devices
    pub fn for_range(range: InstanceRange) -> Self {
        Self { range: Some(range) }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        if let Some(range) = self.range {
            encode_context_unsigned(buffer, 0, range.low() as u64);
            encode_context_unsigned(buffer, 1, range.high() as u64);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        if reader.is_empty() {
            return Ok(Self::new());
        }
        let low = reader.context_unsigned(0)?;
        let high = reader.context_unsigned(1).map_err(|_| {
            ServiceError::InvalidParameters("Who-Is low limit without high limit".to_string())
        })?;
        let range = u32::try_from(low)
            .ok()
            .zip(u32::try_from(high).ok())
            .and_then(|(low, high)| InstanceRange::new(low, high).ok())
            .ok_or_else(|| {
                ServiceError::InvalidParameters(format!("Who-Is range {}..={}", low, high))
            })?;
        Ok(Self::for_range(range))
    }

    /// Check if this request matches a device instance
    pub fn matches(&self, device_instance: u32) -> bool {
        self.range.map_or(true, |range| range.contains(device_instance))
    }
}

/// I-Am request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_identifier: ObjectIdentifier,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: Segmentation,
    pub vendor_identifier: u16,
}

impl IAmRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_object_identifier(buffer, self.device_identifier);
        encode_unsigned(buffer, self.max_apdu_length_accepted as u64);
        encode_enumerated(buffer, self.segmentation_supported as u32);
        encode_unsigned(buffer, self.vendor_identifier as u64);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let device_identifier = reader.object_id()?;
        let max_apdu_length_accepted = reader.unsigned()?;
        let segmentation = reader.enumerated()?;
        let vendor_identifier = reader.unsigned()?;

        // Sloppy devices send unknown segmentation values; treat them as none
        let segmentation_supported =
            Segmentation::try_from(segmentation).unwrap_or(Segmentation::NoSegmentation);

        Ok(Self {
            device_identifier,
            max_apdu_length_accepted: u32::try_from(max_apdu_length_accepted).unwrap_or(u32::MAX),
            segmentation_supported,
            vendor_identifier: u16::try_from(vendor_identifier).unwrap_or(u16::MAX),
        })
    }

    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            max_apdu: self.max_apdu_length_accepted,
            segmentation: self.segmentation_supported,
            vendor_id: self.vendor_identifier,
        }
    }
}

/// Read Property request (confirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object_identifier: ObjectIdentifier, property_identifier: PropertyIdentifier) -> Self {
        Self {
            object_identifier,
            property_identifier,
            property_array_index: None,
        }
    }

    pub fn with_array_index(
        object_identifier: ObjectIdentifier,
        property_identifier: PropertyIdentifier,
        array_index: u32,
    ) -> Self {
        Self {
            object_identifier,
            property_identifier,
            property_array_index: Some(array_index),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_context_object_id(buffer, 0, self.object_identifier);
        encode_context_enumerated(buffer, 1, self.property_identifier.into());
        if let Some(index) = self.property_array_index {
            encode_context_unsigned(buffer, 2, index as u64);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            object_identifier: reader.context_object_id(0)?,
            property_identifier: reader.context_enumerated(1)?.into(),
            property_array_index: optional_index(&mut reader, 2)?,
        })
    }
}

fn optional_index(reader: &mut Reader<'_>, tag: u8) -> Result<Option<u32>> {
    reader
        .optional_context_unsigned(tag)?
        .map(|index| {
            u32::try_from(index)
                .map_err(|_| ServiceError::InvalidParameters(format!("array index {}", index)))
        })
        .transpose()
}

/// Read Property acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    /// Every application value inside the property-value tag, in order
    pub values: Vec<PropertyValue>,
}

impl ReadPropertyAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_context_object_id(buffer, 0, self.object_identifier);
        encode_context_enumerated(buffer, 1, self.property_identifier.into());
        if let Some(index) = self.property_array_index {
            encode_context_unsigned(buffer, 2, index as u64);
        }
        encode_opening_tag(buffer, 3);
        for value in &self.values {
            encode_property_value(buffer, value);
        }
        encode_closing_tag(buffer, 3);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let object_identifier = reader.context_object_id(0)?;
        let property_identifier = reader.context_enumerated(1)?.into();
        let property_array_index = optional_index(&mut reader, 2)?;
        reader.expect_opening_tag(3)?;
        let values = reader.values_until_closing(3)?;
        Ok(Self {
            object_identifier,
            property_identifier,
            property_array_index,
            values,
        })
    }
}

/// Property reference for Read Property Multiple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(property_identifier: PropertyIdentifier) -> Self {
        Self {
            property_identifier,
            property_array_index: None,
        }
    }

    pub fn with_array_index(property_identifier: PropertyIdentifier, array_index: u32) -> Self {
        Self {
            property_identifier,
            property_array_index: Some(array_index),
        }
    }
}

/// Read access specification for Read Property Multiple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object_identifier: ObjectIdentifier,
    pub property_references: Vec<PropertyReference>,
}

impl ReadAccessSpecification {
    pub fn new(object_identifier: ObjectIdentifier, property_references: Vec<PropertyReference>) -> Self {
        Self {
            object_identifier,
            property_references,
        }
    }
}

/// Read Property Multiple request (confirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultipleRequest {
    pub read_access_specifications: Vec<ReadAccessSpecification>,
}

impl ReadPropertyMultipleRequest {
    pub fn new(read_access_specifications: Vec<ReadAccessSpecification>) -> Self {
        Self {
            read_access_specifications,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        for spec in &self.read_access_specifications {
            encode_context_object_id(buffer, 0, spec.object_identifier);
            encode_opening_tag(buffer, 1);
            for reference in &spec.property_references {
                encode_context_enumerated(buffer, 0, reference.property_identifier.into());
                if let Some(index) = reference.property_array_index {
                    encode_context_unsigned(buffer, 1, index as u64);
                }
            }
            encode_closing_tag(buffer, 1);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut read_access_specifications = Vec::new();
        while !reader.is_empty() {
            let object_identifier = reader.context_object_id(0)?;
            reader.expect_opening_tag(1)?;
            let mut property_references = Vec::new();
            while !reader.is_closing_tag(1) {
                property_references.push(PropertyReference {
                    property_identifier: reader.context_enumerated(0)?.into(),
                    property_array_index: optional_index(&mut reader, 1)?,
                });
            }
            reader.expect_closing_tag(1)?;
            read_access_specifications.push(ReadAccessSpecification::new(
                object_identifier,
                property_references,
            ));
        }
        Ok(Self::new(read_access_specifications))
    }
}

/// One property inside a Read Property Multiple acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyResult {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    /// The values, or the access error the device reported for this property
    pub value: std::result::Result<Vec<PropertyValue>, BacnetError>,
}

/// Results for one object inside a Read Property Multiple acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
    pub object_identifier: ObjectIdentifier,
    pub results: Vec<PropertyResult>,
}

/// Read Property Multiple acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyMultipleAck {
    pub results: Vec<ReadAccessResult>,
}

impl ReadPropertyMultipleAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        for access in &self.results {
            encode_context_object_id(buffer, 0, access.object_identifier);
            encode_opening_tag(buffer, 1);
            for result in &access.results {
                encode_context_enumerated(buffer, 2, result.property_identifier.into());
                if let Some(index) = result.property_array_index {
                    encode_context_unsigned(buffer, 3, index as u64);
                }
                match &result.value {
                    Ok(values) => {
                        encode_opening_tag(buffer, 4);
                        for value in values {
                            encode_property_value(buffer, value);
                        }
                        encode_closing_tag(buffer, 4);
                    }
                    Err(error) => {
                        encode_opening_tag(buffer, 5);
                        encode_enumerated(buffer, error.class);
                        encode_enumerated(buffer, error.code);
                        encode_closing_tag(buffer, 5);
                    }
                }
            }
            encode_closing_tag(buffer, 1);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut results = Vec::new();
        while !reader.is_empty() {
            let object_identifier = reader.context_object_id(0)?;
            reader.expect_opening_tag(1)?;
            let mut properties = Vec::new();
            while !reader.is_closing_tag(1) {
                properties.push(decode_property_result(&mut reader)?);
            }
            reader.expect_closing_tag(1)?;
            results.push(ReadAccessResult {
                object_identifier,
                results: properties,
            });
        }
        Ok(Self { results })
    }
}

fn decode_property_result(reader: &mut Reader<'_>) -> Result<PropertyResult> {
    let property_identifier = reader.context_enumerated(2)?.into();
    let property_array_index = optional_index(reader, 3)?;
    let value = if reader.is_opening_tag(4) {
        reader.expect_opening_tag(4)?;
        Ok(reader.values_until_closing(4)?)
    } else {
        reader.expect_opening_tag(5)?;
        let error = BacnetError::new(reader.enumerated()?, reader.enumerated()?);
        reader.expect_closing_tag(5)?;
        Err(error)
    };
    Ok(PropertyResult {
        property_identifier,
        property_array_index,
        value,
    })
}

/// Subscribe COV request (confirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCovRequest {
    pub subscriber_process_identifier: u32,
    pub monitored_object_identifier: ObjectIdentifier,
    /// None together with `lifetime` None cancels the subscription
    pub issue_confirmed_notifications: Option<bool>,
    /// Seconds; 0 means indefinite
    pub lifetime: Option<u32>,
}

impl SubscribeCovRequest {
    pub fn new(
        subscriber_process_identifier: u32,
        monitored_object_identifier: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
    ) -> Self {
        Self {
            subscriber_process_identifier,
            monitored_object_identifier,
            issue_confirmed_notifications: Some(confirmed),
            lifetime: Some(lifetime),
        }
    }

    /// A request cancelling an existing subscription
    pub fn cancellation(
        subscriber_process_identifier: u32,
        monitored_object_identifier: ObjectIdentifier,
    ) -> Self {
        Self {
            subscriber_process_identifier,
            monitored_object_identifier,
            issue_confirmed_notifications: None,
            lifetime: None,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_context_unsigned(buffer, 0, self.subscriber_process_identifier as u64);
        encode_context_object_id(buffer, 1, self.monitored_object_identifier);
        if let Some(confirmed) = self.issue_confirmed_notifications {
            encode_context_boolean(buffer, 2, confirmed);
        }
        if let Some(lifetime) = self.lifetime {
            encode_context_unsigned(buffer, 3, lifetime as u64);
        }
    }
}

/// One changed property inside a COV notification
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property_identifier: PropertyIdentifier,
    pub property_array_index: Option<u32>,
    pub values: Vec<PropertyValue>,
    pub priority: Option<u8>,
}

/// COV notification (confirmed or unconfirmed; same parameters)
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotificationRequest {
    pub subscriber_process_identifier: u32,
    pub initiating_device_identifier: ObjectIdentifier,
    pub monitored_object_identifier: ObjectIdentifier,
    pub time_remaining: u32,
    pub list_of_values: Vec<PropertyChange>,
}

impl CovNotificationRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_context_unsigned(buffer, 0, self.subscriber_process_identifier as u64);
        encode_context_object_id(buffer, 1, self.initiating_device_identifier);
        encode_context_object_id(buffer, 2, self.monitored_object_identifier);
        encode_context_unsigned(buffer, 3, self.time_remaining as u64);
        encode_opening_tag(buffer, 4);
        for change in &self.list_of_values {
            encode_context_enumerated(buffer, 0, change.property_identifier.into());
            if let Some(index) = change.property_array_index {
                encode_context_unsigned(buffer, 1, index as u64);
            }
            encode_opening_tag(buffer, 2);
            for value in &change.values {
                encode_property_value(buffer, value);
            }
            encode_closing_tag(buffer, 2);
            if let Some(priority) = change.priority {
                encode_context_unsigned(buffer, 3, priority as u64);
            }
        }
        encode_closing_tag(buffer, 4);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let subscriber_process_identifier = small(reader.context_unsigned(0)?, "process id")?;
        let initiating_device_identifier = reader.context_object_id(1)?;
        let monitored_object_identifier = reader.context_object_id(2)?;
        let time_remaining = small(reader.context_unsigned(3)?, "time remaining")?;

        reader.expect_opening_tag(4)?;
        let mut list_of_values = Vec::new();
        while !reader.is_closing_tag(4) {
            let property_identifier = reader.context_enumerated(0)?.into();
            let property_array_index = optional_index(&mut reader, 1)?;
            reader.expect_opening_tag(2)?;
            let values = reader.values_until_closing(2)?;
            let priority = reader
                .optional_context_unsigned(3)?
                .map(|p| p.min(u8::MAX as u64) as u8);
            list_of_values.push(PropertyChange {
                property_identifier,
                property_array_index,
                values,
                priority,
            });
        }
        reader.expect_closing_tag(4)?;

        Ok(Self {
            subscriber_process_identifier,
            initiating_device_identifier,
            monitored_object_identifier,
            time_remaining,
            list_of_values,
        })
    }
}

fn small(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| ServiceError::InvalidParameters(format!("{} {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;

    #[test]
    fn test_whois_request() {
        let whois_all = WhoIsRequest::new();
        assert!(whois_all.matches(123));

        let mut buffer = Vec::new();
        whois_all.encode(&mut buffer);
        assert!(buffer.is_empty());
        assert_eq!(WhoIsRequest::decode(&buffer).unwrap(), whois_all);

        let whois_range = WhoIsRequest::for_range(InstanceRange::new(100_000, 100_100).unwrap());
        assert!(whois_range.matches(100_050));
        assert!(!whois_range.matches(50));

        whois_range.encode(&mut buffer);
        assert_eq!(
            buffer,
            vec![0x0B, 0x01, 0x86, 0xA0, 0x1B, 0x01, 0x87, 0x04]
        );
        assert_eq!(WhoIsRequest::decode(&buffer).unwrap(), whois_range);
    }

    #[test]
    fn test_whois_rejects_half_range() {
        assert!(matches!(
            WhoIsRequest::decode(&[0x09, 0x05]),
            Err(ServiceError::InvalidParameters(_))
        ));
        assert!(matches!(
            WhoIsRequest::decode(&[0x09, 0x09, 0x19, 0x05]),
            Err(ServiceError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_iam_decode() {
        // device 1234, max APDU 1476, segmented-both, vendor 15
        let data = [
            0xC4, 0x02, 0x00, 0x04, 0xD2, 0x22, 0x05, 0xC4, 0x91, 0x00, 0x21, 0x0F,
        ];
        let iam = IAmRequest::decode(&data).unwrap();
        assert_eq!(iam.device_identifier, ObjectIdentifier::device(1234));
        assert_eq!(iam.max_apdu_length_accepted, 1476);
        assert_eq!(iam.segmentation_supported, Segmentation::Both);
        assert_eq!(iam.vendor_identifier, 15);

        let mut buffer = Vec::new();
        iam.encode(&mut buffer);
        assert_eq!(buffer, data);

        let summary = iam.summary();
        assert_eq!(summary.max_apdu, 1476);
        assert!(summary.segmentation.can_transmit());
    }

    #[test]
    fn test_iam_tolerates_bad_segmentation() {
        let data = [
            0xC4, 0x02, 0x00, 0x00, 0x01, 0x21, 0x80, 0x91, 0x07, 0x21, 0x00,
        ];
        let iam = IAmRequest::decode(&data).unwrap();
        assert_eq!(iam.segmentation_supported, Segmentation::NoSegmentation);
        assert!(IAmRequest::decode(&data[..3]).is_err());
    }

    #[test]
    fn test_read_property_request_encoding() {
        let request = ReadPropertyRequest::with_array_index(
            ObjectIdentifier::device(1234),
            PropertyIdentifier::ObjectList,
            0,
        );
        let mut buffer = Vec::new();
        request.encode(&mut buffer);
        assert_eq!(
            buffer,
            vec![0x0C, 0x02, 0x00, 0x04, 0xD2, 0x19, 0x4C, 0x29, 0x00]
        );
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn test_read_property_ack_object_list() {
        // object-list of device 1234: AI:1, AV:2
        let data = [
            0x0C, 0x02, 0x00, 0x04, 0xD2, 0x19, 0x4C, 0x3E, 0xC4, 0x00, 0x00, 0x00, 0x01, 0xC4,
            0x00, 0x80, 0x00, 0x02, 0x3F,
        ];
        let ack = ReadPropertyAck::decode(&data).unwrap();
        assert_eq!(ack.property_identifier, PropertyIdentifier::ObjectList);
        assert_eq!(ack.property_array_index, None);
        assert_eq!(
            ack.values,
            vec![
                PropertyValue::ObjectIdentifier(ObjectIdentifier::new(ObjectType::AnalogInput, 1)),
                PropertyValue::ObjectIdentifier(ObjectIdentifier::new(ObjectType::AnalogValue, 2)),
            ]
        );
    }

    #[test]
    fn test_read_property_ack_missing_closing_tag() {
        let data = [0x0C, 0x02, 0x00, 0x04, 0xD2, 0x19, 0x4D, 0x3E, 0x75, 0x02, 0x00, 0x41];
        assert!(ReadPropertyAck::decode(&data).is_err());
    }

    #[test]
    fn test_rpm_request_encoding() {
        let request = ReadPropertyMultipleRequest::new(vec![ReadAccessSpecification::new(
            ObjectIdentifier::device(5),
            vec![PropertyReference::new(PropertyIdentifier::ObjectList)],
        )]);
        let mut buffer = Vec::new();
        request.encode(&mut buffer);
        assert_eq!(
            buffer,
            vec![0x0C, 0x02, 0x00, 0x00, 0x05, 0x1E, 0x09, 0x4C, 0x1F]
        );
        assert_eq!(ReadPropertyMultipleRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn test_rpm_ack_with_values_and_error() {
        let ack = ReadPropertyMultipleAck {
            results: vec![ReadAccessResult {
                object_identifier: ObjectIdentifier::device(5),
                results: vec![
                    PropertyResult {
                        property_identifier: PropertyIdentifier::ObjectList,
                        property_array_index: None,
                        value: Ok(vec![PropertyValue::ObjectIdentifier(
                            ObjectIdentifier::device(5),
                        )]),
                    },
                    PropertyResult {
                        property_identifier: PropertyIdentifier::Description,
                        property_array_index: None,
                        value: Err(BacnetError::new(
                            error_codes::CLASS_PROPERTY,
                            error_codes::UNKNOWN_PROPERTY,
                        )),
                    },
                ],
            }],
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer);
        assert_eq!(&buffer[5..8], &[0x1E, 0x29, 0x4C]);
        assert_eq!(ReadPropertyMultipleAck::decode(&buffer).unwrap(), ack);

        let error = ack.results[0].results[1].value.clone().unwrap_err();
        assert_eq!(error.to_string(), "property: unknown-property");
    }

    #[test]
    fn test_subscribe_cov_encoding() {
        let request = SubscribeCovRequest::new(
            1,
            ObjectIdentifier::new(ObjectType::AnalogInput, 3),
            true,
            0,
        );
        let mut buffer = Vec::new();
        request.encode(&mut buffer);
        assert_eq!(
            buffer,
            vec![0x09, 0x01, 0x1C, 0x00, 0x00, 0x00, 0x03, 0x29, 0x01, 0x39, 0x00]
        );

        buffer.clear();
        SubscribeCovRequest::cancellation(1, request.monitored_object_identifier).encode(&mut buffer);
        assert_eq!(buffer.len(), 7);
    }

    #[test]
    fn test_cov_notification_decode() {
        let notification = CovNotificationRequest {
            subscriber_process_identifier: 1,
            initiating_device_identifier: ObjectIdentifier::device(1234),
            monitored_object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 3),
            time_remaining: 0,
            list_of_values: vec![
                PropertyChange {
                    property_identifier: PropertyIdentifier::PresentValue,
                    property_array_index: None,
                    values: vec![PropertyValue::Real(21.5)],
                    priority: None,
                },
                PropertyChange {
                    property_identifier: PropertyIdentifier::StatusFlags,
                    property_array_index: None,
                    values: vec![PropertyValue::BitString(vec![false; 4])],
                    priority: None,
                },
            ],
        };
        let mut buffer = Vec::new();
        notification.encode(&mut buffer);
        let decoded = CovNotificationRequest::decode(&buffer).unwrap();
        assert_eq!(decoded, notification);
        assert_eq!(decoded.list_of_values[0].values[0], PropertyValue::Real(21.5));
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RejectReason::from(9), RejectReason::UnrecognizedService);
        assert_eq!(u8::from(RejectReason::from(200)), 200);
        assert_eq!(AbortReason::from(4), AbortReason::SegmentationNotSupported);
        assert_eq!(
            ConfirmedServiceChoice::try_from(15),
            Err(ServiceError::UnsupportedServiceChoice(15))
        );
        assert_eq!(
            UnconfirmedServiceChoice::try_from(0).unwrap(),
            UnconfirmedServiceChoice::IAm
        );
    }
}
