//! BACnet Encoding/Decoding Module
//!
//! Tag-level encoding of BACnet data (ASHRAE 135 clause 20.2) for the service
//! payloads this crate speaks.
//!
//! # Overview
//!
//! Every value on the wire is preceded by a tag byte carrying the tag number,
//! the class (application or context) and a length/value/type field:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +---+---+---+---+---+---+---+---+
//! |  tag number   | C |    LVT    |
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! Context tags with LVT 6 and 7 open and close a constructed value. Tag
//! numbers above 14 and lengths above 4 spill into extension bytes.
//!
//! Encoders are free functions appending to a `Vec<u8>`; decoding goes
//! through [`Reader`], a cursor that knows how to step over tags.
//!
//! # Example
//!
//! ```rust
//! use bacnet_recon::encoding::{encode_context_unsigned, encode_opening_tag, Reader};
//!
//! let mut buffer = Vec::new();
//! encode_context_unsigned(&mut buffer, 1, 300);
//! encode_opening_tag(&mut buffer, 3);
//!
//! let mut reader = Reader::new(&buffer);
//! assert_eq!(reader.context_unsigned(1).unwrap(), 300);
//! assert!(reader.is_opening_tag(3));
//! ```

use encoding_rs::{UTF_16BE, WINDOWS_1252};

use crate::object::{Date, ObjectIdentifier, PropertyValue, Time};

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// Data ended in the middle of a tag or value
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEndOfData(usize),
    /// A different tag was found than the grammar requires
    #[error("expected {expected} at offset {offset}, found tag byte {found:#04x}")]
    UnexpectedTag {
        expected: &'static str,
        found: u8,
        offset: usize,
    },
    /// Length field is not valid for the value type
    #[error("invalid length {length} for {what}")]
    InvalidLength { what: &'static str, length: u32 },
    /// Structurally invalid data
    #[error("invalid encoding: {0}")]
    InvalidFormat(String),
}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Null,
            1 => Self::Boolean,
            2 => Self::UnsignedInt,
            3 => Self::SignedInt,
            4 => Self::Real,
            5 => Self::Double,
            6 => Self::OctetString,
            7 => Self::CharacterString,
            8 => Self::BitString,
            9 => Self::Enumerated,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::ObjectIdentifier,
            other => {
                return Err(EncodingError::InvalidFormat(format!(
                    "reserved application tag {}",
                    other
                )))
            }
        })
    }
}

/// Character set codes of a BACnet CharacterString
pub mod charset {
    pub const UTF8: u8 = 0;
    pub const DBCS: u8 = 1;
    pub const JIS_X0208: u8 = 2;
    pub const UCS4: u8 = 3;
    pub const UCS2: u8 = 4;
    pub const ISO_8859_1: u8 = 5;
}

/// What a tag header introduces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Primitive value of the given length (for application booleans, the value)
    Primitive(u32),
    Opening,
    Closing,
}

/// A decoded tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub kind: TagKind,
    /// Bytes taken by the header itself
    pub header_len: usize,
}

impl Tag {
    pub fn is_application(&self, tag: ApplicationTag) -> bool {
        !self.context && self.number == tag as u8 && matches!(self.kind, TagKind::Primitive(_))
    }

    fn length(&self) -> u32 {
        match self.kind {
            TagKind::Primitive(length) => length,
            _ => 0,
        }
    }
}

fn encode_tag(buffer: &mut Vec<u8>, number: u8, context: bool, length: usize) {
    let class = if context { 0x08 } else { 0x00 };
    let lvt = if length < 5 { length as u8 } else { 5 };

    if number < 15 {
        buffer.push((number << 4) | class | lvt);
    } else {
        buffer.push(0xF0 | class | lvt);
        buffer.push(number);
    }

    if length >= 5 {
        if length < 254 {
            buffer.push(length as u8);
        } else if length <= u16::MAX as usize {
            buffer.push(254);
            buffer.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            buffer.push(255);
            buffer.extend_from_slice(&(length as u32).to_be_bytes());
        }
    }
}

/// Minimal big-endian bytes of an unsigned value (at least one byte)
fn unsigned_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Minimal two's complement bytes of a signed value
fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Encode an opening tag
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    if tag_number < 15 {
        buffer.push((tag_number << 4) | 0x0E);
    } else {
        buffer.extend_from_slice(&[0xFE, tag_number]);
    }
}

/// Encode a closing tag
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    if tag_number < 15 {
        buffer.push((tag_number << 4) | 0x0F);
    } else {
        buffer.extend_from_slice(&[0xFF, tag_number]);
    }
}

/// Encode an application-tagged unsigned integer
pub fn encode_unsigned(buffer: &mut Vec<u8>, value: u64) {
    let bytes = unsigned_bytes(value);
    encode_tag(buffer, ApplicationTag::UnsignedInt as u8, false, bytes.len());
    buffer.extend_from_slice(&bytes);
}

/// Encode an application-tagged signed integer
pub fn encode_signed(buffer: &mut Vec<u8>, value: i64) {
    let bytes = signed_bytes(value);
    encode_tag(buffer, ApplicationTag::SignedInt as u8, false, bytes.len());
    buffer.extend_from_slice(&bytes);
}

/// Encode an application-tagged enumerated value
pub fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let bytes = unsigned_bytes(value as u64);
    encode_tag(buffer, ApplicationTag::Enumerated as u8, false, bytes.len());
    buffer.extend_from_slice(&bytes);
}

/// Encode an application-tagged boolean (the value lives in the LVT bits)
pub fn encode_boolean(buffer: &mut Vec<u8>, value: bool) {
    encode_tag(buffer, ApplicationTag::Boolean as u8, false, value as usize);
}

/// Encode an application-tagged REAL
pub fn encode_real(buffer: &mut Vec<u8>, value: f32) {
    encode_tag(buffer, ApplicationTag::Real as u8, false, 4);
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Encode an application-tagged object identifier
pub fn encode_object_identifier(buffer: &mut Vec<u8>, id: ObjectIdentifier) {
    encode_tag(buffer, ApplicationTag::ObjectIdentifier as u8, false, 4);
    buffer.extend_from_slice(&u32::from(id).to_be_bytes());
}

/// Encode an application-tagged UTF-8 character string
pub fn encode_character_string(buffer: &mut Vec<u8>, value: &str) {
    encode_tag(
        buffer,
        ApplicationTag::CharacterString as u8,
        false,
        value.len() + 1,
    );
    buffer.push(charset::UTF8);
    buffer.extend_from_slice(value.as_bytes());
}

/// Encode a context-tagged unsigned integer
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u64) {
    let bytes = unsigned_bytes(value);
    encode_tag(buffer, tag_number, true, bytes.len());
    buffer.extend_from_slice(&bytes);
}

/// Encode a context-tagged enumerated value
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    encode_context_unsigned(buffer, tag_number, value as u64);
}

/// Encode a context-tagged boolean (one content octet, unlike the application form)
pub fn encode_context_boolean(buffer: &mut Vec<u8>, tag_number: u8, value: bool) {
    encode_tag(buffer, tag_number, true, 1);
    buffer.push(value as u8);
}

/// Encode a context-tagged object identifier
pub fn encode_context_object_id(buffer: &mut Vec<u8>, tag_number: u8, id: ObjectIdentifier) {
    encode_tag(buffer, tag_number, true, 4);
    buffer.extend_from_slice(&u32::from(id).to_be_bytes());
}

/// Encode a property value with its application tag
pub fn encode_property_value(buffer: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => encode_tag(buffer, ApplicationTag::Null as u8, false, 0),
        PropertyValue::Boolean(v) => encode_boolean(buffer, *v),
        PropertyValue::Unsigned(v) => encode_unsigned(buffer, *v),
        PropertyValue::Signed(v) => encode_signed(buffer, *v),
        PropertyValue::Real(v) => encode_real(buffer, *v),
        PropertyValue::Double(v) => {
            encode_tag(buffer, ApplicationTag::Double as u8, false, 8);
            buffer.extend_from_slice(&v.to_be_bytes());
        }
        PropertyValue::OctetString(v) => {
            encode_tag(buffer, ApplicationTag::OctetString as u8, false, v.len());
            buffer.extend_from_slice(v);
        }
        PropertyValue::CharacterString(v) => encode_character_string(buffer, v),
        PropertyValue::BitString(bits) => {
            let byte_count = bits.len().div_ceil(8);
            let unused = (byte_count * 8 - bits.len()) as u8;
            encode_tag(buffer, ApplicationTag::BitString as u8, false, byte_count + 1);
            buffer.push(unused);
            for chunk in bits.chunks(8) {
                let byte = chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, bit)| acc | ((*bit as u8) << (7 - i)));
                buffer.push(byte);
            }
        }
        PropertyValue::Enumerated(v) => encode_enumerated(buffer, *v),
        PropertyValue::Date(d) => {
            encode_tag(buffer, ApplicationTag::Date as u8, false, 4);
            let year = if d.year == 255 {
                255
            } else {
                d.year.saturating_sub(1900) as u8
            };
            buffer.extend_from_slice(&[year, d.month, d.day, d.weekday]);
        }
        PropertyValue::Time(t) => {
            encode_tag(buffer, ApplicationTag::Time as u8, false, 4);
            buffer.extend_from_slice(&[t.hour, t.minute, t.second, t.hundredths]);
        }
        PropertyValue::ObjectIdentifier(id) => encode_object_identifier(buffer, *id),
    }
}

/// Decode the content octets of a CharacterString
pub fn decode_character_string_content(content: &[u8]) -> Result<String> {
    let (&set, text) = content
        .split_first()
        .ok_or(EncodingError::InvalidLength {
            what: "character string",
            length: 0,
        })?;

    let decoded = match set {
        charset::UTF8 | charset::DBCS | charset::JIS_X0208 => {
            String::from_utf8_lossy(text).into_owned()
        }
        charset::UCS2 => UTF_16BE.decode_without_bom_handling(text).0.into_owned(),
        charset::ISO_8859_1 => WINDOWS_1252.decode_without_bom_handling(text).0.into_owned(),
        charset::UCS4 => text
            .chunks(4)
            .map(|c| {
                let mut word = [0u8; 4];
                word[4 - c.len()..].copy_from_slice(c);
                char::from_u32(u32::from_be_bytes(word)).unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect(),
        other => {
            return Err(EncodingError::InvalidFormat(format!(
                "unknown character set {}",
                other
            )))
        }
    };
    Ok(decoded)
}

/// Decoding cursor over a BACnet byte stream
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not consumed yet
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(EncodingError::UnexpectedEndOfData(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or(EncodingError::UnexpectedEndOfData(self.data.len()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Decode the next tag header without consuming it
    pub fn peek_tag(&self) -> Result<Tag> {
        let mut probe = self.clone();
        probe.read_tag()
    }

    /// Decode and consume the next tag header
    pub fn read_tag(&mut self) -> Result<Tag> {
        let start = self.pos;
        let first = self.read_u8()?;
        let mut number = first >> 4;
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;

        if number == 15 {
            number = self.read_u8()?;
        }

        let kind = match (context, lvt) {
            (true, 6) => TagKind::Opening,
            (true, 7) => TagKind::Closing,
            (_, 5) => {
                let length = match self.read_u8()? {
                    254 => self.read_u16()? as u32,
                    255 => {
                        let bytes = self.read_bytes(4)?;
                        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                    }
                    short => short as u32,
                };
                TagKind::Primitive(length)
            }
            (_, lvt) => TagKind::Primitive(lvt as u32),
        };

        Ok(Tag {
            number,
            context,
            kind,
            header_len: self.pos - start,
        })
    }

    fn unexpected(&self, expected: &'static str) -> EncodingError {
        match self.data.get(self.pos) {
            Some(&found) => EncodingError::UnexpectedTag {
                expected,
                found,
                offset: self.pos,
            },
            None => EncodingError::UnexpectedEndOfData(self.pos),
        }
    }

    fn peek_matches(&self, number: u8, kind: fn(&TagKind) -> bool) -> bool {
        self.peek_tag()
            .map(|tag| tag.context && tag.number == number && kind(&tag.kind))
            .unwrap_or(false)
    }

    /// Whether the next item is the given opening tag
    pub fn is_opening_tag(&self, number: u8) -> bool {
        self.peek_matches(number, |k| matches!(k, TagKind::Opening))
    }

    /// Whether the next item is the given closing tag
    pub fn is_closing_tag(&self, number: u8) -> bool {
        self.peek_matches(number, |k| matches!(k, TagKind::Closing))
    }

    /// Whether the next item is a primitive context tag with this number
    pub fn is_context_tag(&self, number: u8) -> bool {
        self.peek_matches(number, |k| matches!(k, TagKind::Primitive(_)))
    }

    pub fn expect_opening_tag(&mut self, number: u8) -> Result<()> {
        if !self.is_opening_tag(number) {
            return Err(self.unexpected("opening tag"));
        }
        self.read_tag().map(|_| ())
    }

    pub fn expect_closing_tag(&mut self, number: u8) -> Result<()> {
        if !self.is_closing_tag(number) {
            return Err(self.unexpected("closing tag"));
        }
        self.read_tag().map(|_| ())
    }

    fn context_content(&mut self, number: u8) -> Result<&'a [u8]> {
        if !self.is_context_tag(number) {
            return Err(self.unexpected("context tag"));
        }
        let tag = self.read_tag()?;
        self.read_bytes(tag.length() as usize)
    }

    fn application_content(&mut self, tag: ApplicationTag, what: &'static str) -> Result<&'a [u8]> {
        let header = self.peek_tag().map_err(|_| self.unexpected(what))?;
        if !header.is_application(tag) {
            return Err(self.unexpected(what));
        }
        self.read_tag()?;
        self.read_bytes(header.length() as usize)
    }

    pub fn context_unsigned(&mut self, number: u8) -> Result<u64> {
        unsigned_from(self.context_content(number)?)
    }

    pub fn optional_context_unsigned(&mut self, number: u8) -> Result<Option<u64>> {
        if self.is_context_tag(number) {
            self.context_unsigned(number).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn context_enumerated(&mut self, number: u8) -> Result<u32> {
        u32::try_from(self.context_unsigned(number)?).map_err(|_| EncodingError::InvalidLength {
            what: "enumerated",
            length: 8,
        })
    }

    pub fn context_boolean(&mut self, number: u8) -> Result<bool> {
        let content = self.context_content(number)?;
        match content {
            [value] => Ok(*value != 0),
            other => Err(EncodingError::InvalidLength {
                what: "boolean",
                length: other.len() as u32,
            }),
        }
    }

    pub fn context_object_id(&mut self, number: u8) -> Result<ObjectIdentifier> {
        object_id_from(self.context_content(number)?)
    }

    pub fn unsigned(&mut self) -> Result<u64> {
        unsigned_from(self.application_content(ApplicationTag::UnsignedInt, "unsigned")?)
    }

    pub fn enumerated(&mut self) -> Result<u32> {
        let value = unsigned_from(self.application_content(ApplicationTag::Enumerated, "enumerated")?)?;
        u32::try_from(value).map_err(|_| EncodingError::InvalidLength {
            what: "enumerated",
            length: 8,
        })
    }

    pub fn object_id(&mut self) -> Result<ObjectIdentifier> {
        object_id_from(self.application_content(ApplicationTag::ObjectIdentifier, "object identifier")?)
    }

    /// Decode one application-tagged value
    pub fn property_value(&mut self) -> Result<PropertyValue> {
        let tag = self.peek_tag()?;
        if tag.context || !matches!(tag.kind, TagKind::Primitive(_)) {
            return Err(self.unexpected("application tag"));
        }
        let app = ApplicationTag::try_from(tag.number)?;
        self.read_tag()?;

        if app == ApplicationTag::Boolean {
            return Ok(PropertyValue::Boolean(tag.length() != 0));
        }

        let content = self.read_bytes(tag.length() as usize)?;
        let value = match app {
            ApplicationTag::Null => PropertyValue::Null,
            ApplicationTag::Boolean => PropertyValue::Boolean(tag.length() != 0),
            ApplicationTag::UnsignedInt => PropertyValue::Unsigned(unsigned_from(content)?),
            ApplicationTag::SignedInt => PropertyValue::Signed(signed_from(content)?),
            ApplicationTag::Real => {
                let bytes: [u8; 4] = content.try_into().map_err(|_| EncodingError::InvalidLength {
                    what: "real",
                    length: content.len() as u32,
                })?;
                PropertyValue::Real(f32::from_be_bytes(bytes))
            }
            ApplicationTag::Double => {
                let bytes: [u8; 8] = content.try_into().map_err(|_| EncodingError::InvalidLength {
                    what: "double",
                    length: content.len() as u32,
                })?;
                PropertyValue::Double(f64::from_be_bytes(bytes))
            }
            ApplicationTag::OctetString => PropertyValue::OctetString(content.to_vec()),
            ApplicationTag::CharacterString => {
                PropertyValue::CharacterString(decode_character_string_content(content)?)
            }
            ApplicationTag::BitString => PropertyValue::BitString(bits_from(content)?),
            ApplicationTag::Enumerated => {
                let value = unsigned_from(content)?;
                PropertyValue::Enumerated(value as u32)
            }
            ApplicationTag::Date => {
                let [year, month, day, weekday] = four(content, "date")?;
                PropertyValue::Date(Date {
                    year: if year == 255 { 255 } else { 1900 + year as u16 },
                    month,
                    day,
                    weekday,
                })
            }
            ApplicationTag::Time => {
                let [hour, minute, second, hundredths] = four(content, "time")?;
                PropertyValue::Time(Time {
                    hour,
                    minute,
                    second,
                    hundredths,
                })
            }
            ApplicationTag::ObjectIdentifier => PropertyValue::ObjectIdentifier(object_id_from(content)?),
        };
        Ok(value)
    }

    /// Decode application values until the closing tag `number`, consuming it.
    ///
    /// Context-tagged and nested constructed content (found in complex
    /// property types) is skipped, since only application values are modeled.
    pub fn values_until_closing(&mut self, number: u8) -> Result<Vec<PropertyValue>> {
        let mut values = Vec::new();
        loop {
            if self.is_closing_tag(number) {
                self.read_tag()?;
                return Ok(values);
            }
            let tag = self.peek_tag()?;
            match tag.kind {
                TagKind::Opening => self.skip_constructed()?,
                TagKind::Closing => return Err(self.unexpected("closing tag")),
                TagKind::Primitive(length) if tag.context => {
                    self.read_tag()?;
                    self.read_bytes(length as usize)?;
                }
                TagKind::Primitive(_) => values.push(self.property_value()?),
            }
        }
    }

    /// Skip one constructed value from its opening tag through the matching closing tag
    pub fn skip_constructed(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            let tag = self.read_tag()?;
            match tag.kind {
                TagKind::Opening => depth += 1,
                TagKind::Closing => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        EncodingError::InvalidFormat("unbalanced closing tag".to_string())
                    })?;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TagKind::Primitive(length) => {
                    // Application booleans carry no content octets
                    let is_app_boolean = !tag.context && tag.number == ApplicationTag::Boolean as u8;
                    if !is_app_boolean {
                        self.read_bytes(length as usize)?;
                    }
                }
            }
            if depth == 0 {
                return Ok(());
            }
        }
    }
}

fn unsigned_from(content: &[u8]) -> Result<u64> {
    if content.is_empty() || content.len() > 8 {
        return Err(EncodingError::InvalidLength {
            what: "unsigned",
            length: content.len() as u32,
        });
    }
    Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn signed_from(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(EncodingError::InvalidLength {
            what: "signed",
            length: content.len() as u32,
        });
    }
    let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut bytes = [fill; 8];
    bytes[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(bytes))
}

fn object_id_from(content: &[u8]) -> Result<ObjectIdentifier> {
    let bytes = four(content, "object identifier")?;
    Ok(ObjectIdentifier::from(u32::from_be_bytes(bytes)))
}

fn bits_from(content: &[u8]) -> Result<Vec<bool>> {
    let (&unused, bytes) = content.split_first().ok_or(EncodingError::InvalidLength {
        what: "bit string",
        length: 0,
    })?;
    if unused > 7 || (bytes.is_empty() && unused != 0) {
        return Err(EncodingError::InvalidFormat(format!(
            "bit string with {} unused bits",
            unused
        )));
    }
    let total = bytes.len() * 8 - unused as usize;
    Ok((0..total)
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect())
}

fn four(content: &[u8], what: &'static str) -> Result<[u8; 4]> {
    content.try_into().map_err(|_| EncodingError::InvalidLength {
        what,
        length: content.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use proptest::prelude::*;

    #[test]
    fn test_unsigned_uses_minimal_length() {
        let mut buffer = Vec::new();
        encode_unsigned(&mut buffer, 0);
        assert_eq!(buffer, [0x21, 0x00]);

        buffer.clear();
        encode_unsigned(&mut buffer, 256);
        assert_eq!(buffer, [0x22, 0x01, 0x00]);

        buffer.clear();
        encode_context_unsigned(&mut buffer, 2, 70_000);
        assert_eq!(buffer, [0x2B, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_signed_sign_extension() {
        let mut buffer = Vec::new();
        encode_signed(&mut buffer, -1);
        assert_eq!(buffer, [0x31, 0xFF]);

        buffer.clear();
        encode_signed(&mut buffer, 128);
        assert_eq!(buffer, [0x32, 0x00, 0x80]);

        let mut reader = Reader::new(&[0x32, 0xFF, 0x7F]);
        assert_eq!(reader.property_value().unwrap(), PropertyValue::Signed(-129));
    }

    #[test]
    fn test_extended_length_and_tag_number() {
        let text = "x".repeat(300);
        let mut buffer = Vec::new();
        encode_character_string(&mut buffer, &text);
        assert_eq!(&buffer[..4], &[0x75, 254, 0x01, 0x2D]);

        let mut reader = Reader::new(&buffer);
        assert_eq!(
            reader.property_value().unwrap(),
            PropertyValue::CharacterString(text)
        );
        assert!(reader.is_empty());

        // Context tag 20 needs the extended tag number byte
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 20, 5);
        assert_eq!(buffer, [0xF9, 20, 5]);
        assert_eq!(Reader::new(&buffer).context_unsigned(20).unwrap(), 5);
    }

    #[test]
    fn test_opening_and_closing_tags() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 3);
        encode_object_identifier(&mut buffer, ObjectIdentifier::new(ObjectType::AnalogInput, 1));
        encode_closing_tag(&mut buffer, 3);
        assert_eq!(buffer[0], 0x3E);
        assert_eq!(*buffer.last().unwrap(), 0x3F);

        let mut reader = Reader::new(&buffer);
        reader.expect_opening_tag(3).unwrap();
        let values = reader.values_until_closing(3).unwrap();
        assert_eq!(
            values,
            vec![PropertyValue::ObjectIdentifier(ObjectIdentifier::new(
                ObjectType::AnalogInput,
                1
            ))]
        );
        assert!(reader.is_empty());
    }

    #[test]
    fn test_values_skip_context_content() {
        // [ctx0 = 1] { ctx1 } REAL 1.5 close 3
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, 1);
        encode_opening_tag(&mut buffer, 1);
        encode_boolean(&mut buffer, true);
        encode_closing_tag(&mut buffer, 1);
        encode_real(&mut buffer, 1.5);
        encode_closing_tag(&mut buffer, 3);

        let mut reader = Reader::new(&buffer);
        assert_eq!(
            reader.values_until_closing(3).unwrap(),
            vec![PropertyValue::Real(1.5)]
        );
    }

    #[test]
    fn test_character_sets() {
        assert_eq!(
            decode_character_string_content(&[charset::UCS2, 0x00, 0x41, 0x00, 0xE9]).unwrap(),
            "Aé"
        );
        assert_eq!(
            decode_character_string_content(&[charset::ISO_8859_1, 0x42, 0xE9]).unwrap(),
            "Bé"
        );
        assert_eq!(
            decode_character_string_content(&[charset::UCS4, 0, 0, 0, 0x43]).unwrap(),
            "C"
        );
        assert!(decode_character_string_content(&[]).is_err());
        assert!(decode_character_string_content(&[9, 0x41]).is_err());
    }

    #[test]
    fn test_bit_string() {
        let value = PropertyValue::BitString(vec![true, false, false, true, false]);
        let mut buffer = Vec::new();
        encode_property_value(&mut buffer, &value);
        assert_eq!(buffer, [0x82, 0x03, 0x90]);
        assert_eq!(Reader::new(&buffer).property_value().unwrap(), value);
    }

    #[test]
    fn test_wrong_tag_is_reported() {
        let mut buffer = Vec::new();
        encode_enumerated(&mut buffer, 1);
        let mut reader = Reader::new(&buffer);
        match reader.unsigned() {
            Err(EncodingError::UnexpectedTag { found, offset, .. }) => {
                assert_eq!(found, 0x91);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_truncated_input() {
        let mut reader = Reader::new(&[0xC4, 0x02, 0x00]);
        assert!(matches!(
            reader.property_value(),
            Err(EncodingError::UnexpectedEndOfData(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_reader_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut reader = Reader::new(&data);
            let _ = reader.values_until_closing(3);
            let mut reader = Reader::new(&data);
            let _ = reader.skip_constructed();
        }

        #[test]
        fn prop_unsigned_decodes_to_encoded_value(value in any::<u64>()) {
            let mut buffer = Vec::new();
            encode_unsigned(&mut buffer, value);
            prop_assert_eq!(Reader::new(&buffer).unsigned().unwrap(), value);
        }
    }
}
