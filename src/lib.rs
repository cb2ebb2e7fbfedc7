#![doc = include_str!("../README.md")]

pub mod app;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod encoding;
pub mod enumerate;
pub mod error;
pub mod listener;
pub mod network;
pub mod object;
pub mod pacing;
pub mod probe;
pub mod retry;
pub mod service;
pub mod session;
pub mod transport;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use config::ReconConfig;
pub use device::{Announcement, CapabilitySummary, DeviceAddress, DeviceIdentity, InstanceRange, Target};
pub use enumerate::{ObjectListResult, Strategy};
pub use error::ReconError;
pub use object::{ObjectIdentifier, ObjectType, PropertyIdentifier, Segmentation};
pub use probe::{DeviceProfile, ProbeOutcome};
pub use session::Session;
pub use transport::{Request, Response, Transport, TransportError};

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;

#[cfg(test)]
mod tests {
    use crate::object::ObjectIdentifier;
    use crate::{ObjectType, ReconConfig, Session};
    use crate::transport::sim::SimulatedTransport;
    use std::sync::Arc;

    #[test]
    fn test_object_identifier_packing() {
        let id = ObjectIdentifier::new(ObjectType::Device, 123);
        assert_eq!(u32::from(id), (8 << 22) | 123);
        assert_eq!(ObjectIdentifier::from((8 << 22) | 123), id);
        assert!(id.is_valid());
    }

    #[test]
    fn test_session_is_usable_through_trait_object() {
        let transport: Arc<dyn crate::Transport> = Arc::new(SimulatedTransport::new(0));
        let session = Session::new(transport, ReconConfig::default()).unwrap();
        assert!(!session.is_shut_down());
        assert!(session.cache().is_empty());
    }
}
