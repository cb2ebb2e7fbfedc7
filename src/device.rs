//! Device identity model
//!
//! Who a device is ([`DeviceIdentity`]), where it lives ([`DeviceAddress`]),
//! what it told us about itself when it announced ([`CapabilitySummary`]),
//! and the instance ranges discovery asks about ([`InstanceRange`]).
//!
//! # Example
//!
//! ```rust
//! use bacnet_recon::device::{DeviceAddress, InstanceRange};
//!
//! // A controller behind an IP gateway, on MS/TP network 1001 at MAC 0x0A
//! let address: DeviceAddress = "10.0.0.5/1001:0a".parse().unwrap();
//! assert_eq!(address.to_string(), "10.0.0.5:47808/1001:0a");
//!
//! let range = InstanceRange::new(100, 1000).unwrap();
//! assert!(range.contains(500));
//! assert!(InstanceRange::new(10, 5).is_err());
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use bytes::Bytes;

use crate::app::MaxApduSize;
use crate::object::{Segmentation, MAX_INSTANCE};

/// Standard BACnet/IP UDP port (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// Errors parsing a device address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid IP address or port in {0:?}")]
    InvalidHost(String),
    #[error("invalid network number in {0:?}")]
    InvalidNetwork(String),
    #[error("invalid MAC address in {0:?}")]
    InvalidMac(String),
}

/// Errors building an instance range
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid instance range {low}..={high}")]
pub struct RangeError {
    pub low: u32,
    pub high: u32,
}

/// Where a device can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    /// Directly on the BACnet/IP network
    Ip(SocketAddr),
    /// Behind a BACnet router reachable at `via`
    Routed {
        via: SocketAddr,
        network: u16,
        mac: Bytes,
    },
}

impl DeviceAddress {
    /// The UDP endpoint packets are sent to
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            DeviceAddress::Ip(addr) => *addr,
            DeviceAddress::Routed { via, .. } => *via,
        }
    }

    pub fn is_routed(&self) -> bool {
        matches!(self, DeviceAddress::Routed { .. })
    }
}

impl From<SocketAddr> for DeviceAddress {
    fn from(addr: SocketAddr) -> Self {
        DeviceAddress::Ip(addr)
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    /// Parses `host[:port][/network:machex]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, route) = match s.split_once('/') {
            Some((host, route)) => (host, Some(route)),
            None => (s, None),
        };

        let via = host
            .parse::<SocketAddr>()
            .or_else(|_| {
                host.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, BACNET_IP_PORT))
            })
            .map_err(|_| AddressParseError::InvalidHost(s.to_string()))?;

        let Some(route) = route else {
            return Ok(DeviceAddress::Ip(via));
        };

        let (network, mac) = route
            .split_once(':')
            .ok_or_else(|| AddressParseError::InvalidNetwork(s.to_string()))?;
        let network = network
            .parse::<u16>()
            .ok()
            .filter(|n| *n != 0 && *n != 0xFFFF)
            .ok_or_else(|| AddressParseError::InvalidNetwork(s.to_string()))?;
        let mac = hex::decode(mac)
            .ok()
            .filter(|mac| !mac.is_empty())
            .ok_or_else(|| AddressParseError::InvalidMac(s.to_string()))?;

        Ok(DeviceAddress::Routed {
            via,
            network,
            mac: Bytes::from(mac),
        })
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Ip(addr) => write!(f, "{}", addr),
            DeviceAddress::Routed { via, network, mac } => {
                write!(f, "{}/{}:{}", via, network, hex::encode(mac))
            }
        }
    }
}

/// Destination of an outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every device the transport can reach by broadcast
    Broadcast,
    /// One address, which may itself be a gateway fronting many devices
    Address(DeviceAddress),
}

impl From<DeviceAddress> for Target {
    fn from(address: DeviceAddress) -> Self {
        Target::Address(address)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Broadcast => write!(f, "broadcast"),
            Target::Address(address) => write!(f, "{}", address),
        }
    }
}

/// A device as established by its announcement. Instances are the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub instance: u32,
    pub address: DeviceAddress,
}

impl DeviceIdentity {
    pub fn new(instance: u32, address: DeviceAddress) -> Self {
        Self { instance, address }
    }

    /// Where confirmed requests for this device go
    pub fn target(&self) -> Target {
        Target::Address(self.address.clone())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} at {}", self.instance, self.address)
    }
}

/// What a device advertises in its I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySummary {
    pub max_apdu: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
}

impl Default for CapabilitySummary {
    fn default() -> Self {
        Self {
            max_apdu: MaxApduSize::Up1476.size() as u32,
            segmentation: Segmentation::NoSegmentation,
            vendor_id: 0,
        }
    }
}

/// An unsolicited I-Am
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub identity: DeviceIdentity,
    pub summary: CapabilitySummary,
}

/// Inclusive range of device instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "(u32, u32)", into = "(u32, u32)"))]
pub struct InstanceRange {
    low: u32,
    high: u32,
}

impl InstanceRange {
    pub fn new(low: u32, high: u32) -> Result<Self, RangeError> {
        if low > high || high > MAX_INSTANCE {
            return Err(RangeError { low, high });
        }
        Ok(Self { low, high })
    }

    /// The range holding a single instance
    pub fn single(instance: u32) -> Result<Self, RangeError> {
        Self::new(instance, instance)
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> u32 {
        self.high
    }

    pub fn contains(&self, instance: u32) -> bool {
        (self.low..=self.high).contains(&instance)
    }
}

impl TryFrom<(u32, u32)> for InstanceRange {
    type Error = RangeError;

    fn try_from((low, high): (u32, u32)) -> Result<Self, Self::Error> {
        Self::new(low, high)
    }
}

impl From<InstanceRange> for (u32, u32) {
    fn from(range: InstanceRange) -> Self {
        (range.low, range.high)
    }
}

impl fmt::Display for InstanceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_addresses() {
        let address: DeviceAddress = "192.168.1.10".parse().unwrap();
        assert_eq!(
            address,
            DeviceAddress::Ip("192.168.1.10:47808".parse().unwrap())
        );

        let address: DeviceAddress = "192.168.1.10:47809".parse().unwrap();
        assert_eq!(address.socket_addr().port(), 47809);
        assert!(!address.is_routed());
    }

    #[test]
    fn test_parse_routed_address() {
        let address: DeviceAddress = "10.0.0.5:47808/1001:0a1b".parse().unwrap();
        match &address {
            DeviceAddress::Routed { via, network, mac } => {
                assert_eq!(via.to_string(), "10.0.0.5:47808");
                assert_eq!(*network, 1001);
                assert_eq!(mac.as_ref(), &[0x0A, 0x1B]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(address.to_string(), "10.0.0.5:47808/1001:0a1b");
        assert_eq!(address.to_string().parse::<DeviceAddress>().unwrap(), address);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "not-an-ip".parse::<DeviceAddress>(),
            Err(AddressParseError::InvalidHost(_))
        ));
        assert!(matches!(
            "10.0.0.5/0:0a".parse::<DeviceAddress>(),
            Err(AddressParseError::InvalidNetwork(_))
        ));
        assert!(matches!(
            "10.0.0.5/12".parse::<DeviceAddress>(),
            Err(AddressParseError::InvalidNetwork(_))
        ));
        assert!(matches!(
            "10.0.0.5/12:zz".parse::<DeviceAddress>(),
            Err(AddressParseError::InvalidMac(_))
        ));
    }

    #[test]
    fn test_instance_range_bounds() {
        assert!(InstanceRange::new(0, MAX_INSTANCE).is_ok());
        assert_eq!(
            InstanceRange::new(0, MAX_INSTANCE + 1),
            Err(RangeError {
                low: 0,
                high: MAX_INSTANCE + 1
            })
        );
        let single = InstanceRange::single(42).unwrap();
        assert!(single.contains(42));
        assert!(!single.contains(43));
        assert_eq!(single.to_string(), "[42, 42]");
    }
}
