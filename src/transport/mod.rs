//! BACnet Transport Layer Module
//!
//! The seam between the reconnaissance engine and the network. Everything the
//! engine does goes through the [`Transport`] trait: confirmed requests
//! resolve asynchronously to a [`Response`] or a classified
//! [`TransportError`], and unsolicited traffic (I-Am announcements, COV
//! notifications) is pushed to registered listeners.
//!
//! # Overview
//!
//! Two implementations ship with the crate:
//!
//! - [`bip::BacnetIpTransport`]: BACnet/IP (Annex J) over a tokio UDP socket,
//!   with optional foreign-device registration for reaching a BBMD
//! - [`sim::SimulatedTransport`]: a scriptable in-process network of devices,
//!   used by the test suite and available behind the `sim` feature
//!
//! # Listener contract
//!
//! Listeners run on the transport's dispatch context (the receive loop for
//! BACnet/IP). They must return quickly and never block; the engine's own
//! listeners only record and enqueue.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bacnet_recon::transport::Listeners;
//!
//! let listeners = Listeners::new();
//! let id = listeners.add_announcement(Arc::new(|announcement| {
//!     println!("I-Am from {}", announcement.identity);
//! }));
//! assert_eq!(listeners.len(), 1);
//! assert!(listeners.remove(id));
//! assert!(listeners.is_empty());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::device::{Announcement, DeviceIdentity, Target};
use crate::object::{ObjectIdentifier, PropertyValue};
use crate::service::{
    AbortReason, BacnetError, PropertyChange, ReadAccessResult, ReadPropertyAck,
    ReadPropertyMultipleRequest, ReadPropertyRequest, RejectReason, SubscribeCovRequest,
    WhoIsRequest,
};

#[cfg(feature = "bip")]
pub mod bip;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a device refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Error PDU (or an RPM access error for the requested property)
    Error(BacnetError),
    /// Reject PDU
    Reject(RejectReason),
    /// Abort PDU
    Abort(AbortReason),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Error(error) => write!(f, "error ({})", error),
            Rejection::Reject(reason) => write!(f, "reject ({:?})", reason),
            Rejection::Abort(reason) => write!(f, "abort ({:?})", reason),
        }
    }
}

/// Errors that can occur in transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No reply within the transport's own deadline
    #[error("request timed out")]
    Timeout,
    /// The device answered with Error, Reject or Abort
    #[error("request rejected: {0}")]
    Rejected(Rejection),
    /// A reply arrived that could not be decoded or did not fit the request
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The request cannot be sent to the given target
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// The transport is shut down or has run out of resources
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Only timeouts are worth retrying; everything else would fail the same way again
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// A request the engine can issue
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    WhoIs(WhoIsRequest),
    ReadProperty(ReadPropertyRequest),
    ReadPropertyMultiple(ReadPropertyMultipleRequest),
    SubscribeCov(SubscribeCovRequest),
}

impl Request {
    /// Whether the request expects a reply
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, Request::WhoIs(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::WhoIs(_) => "Who-Is",
            Request::ReadProperty(_) => "ReadProperty",
            Request::ReadPropertyMultiple(_) => "ReadPropertyMultiple",
            Request::SubscribeCov(_) => "SubscribeCOV",
        }
    }
}

/// Outcome of a successful exchange
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// An unconfirmed request went out
    Sent,
    /// SimpleACK
    Acknowledged,
    ReadProperty(ReadPropertyAck),
    ReadPropertyMultiple(Vec<ReadAccessResult>),
}

impl Response {
    /// The values of a ReadProperty acknowledgement
    pub fn into_property_values(self) -> Result<Vec<PropertyValue>> {
        match self {
            Response::ReadProperty(ack) => Ok(ack.values),
            other => Err(TransportError::Malformed(format!(
                "expected a ReadProperty acknowledgement, got {:?}",
                other
            ))),
        }
    }

    /// The values of one property inside a ReadPropertyMultiple acknowledgement.
    ///
    /// An access error for that property becomes a rejection.
    pub fn into_multiple_values(
        self,
        object: ObjectIdentifier,
        property: crate::object::PropertyIdentifier,
    ) -> Result<Vec<PropertyValue>> {
        let Response::ReadPropertyMultiple(results) = self else {
            return Err(TransportError::Malformed(
                "expected a ReadPropertyMultiple acknowledgement".to_string(),
            ));
        };
        let result = results
            .into_iter()
            .filter(|access| access.object_identifier == object)
            .flat_map(|access| access.results)
            .find(|result| result.property_identifier == property)
            .ok_or_else(|| {
                TransportError::Malformed(format!("{} missing from acknowledgement", property))
            })?;
        result
            .value
            .map_err(|error| TransportError::Rejected(Rejection::Error(error)))
    }
}

/// A change-of-value notification
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub subscriber_id: u32,
    pub source_device: DeviceIdentity,
    pub object: ObjectIdentifier,
    pub changed: Vec<PropertyChange>,
    pub time_remaining_secs: u32,
    /// The device expects an acknowledgement (sent by the transport)
    pub confirmed: bool,
}

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type AnnouncementListener = Arc<dyn Fn(Announcement) + Send + Sync>;
pub type ValueChangeListener = Arc<dyn Fn(ValueChange) + Send + Sync>;

/// Common trait for BACnet transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its outcome.
    ///
    /// Unconfirmed requests resolve to [`Response::Sent`] as soon as they are
    /// on the wire. Confirmed requests need a [`Target::Address`].
    async fn send(&self, target: &Target, request: Request) -> Result<Response>;

    /// Register a listener invoked once per received I-Am
    fn on_announcement(&self, listener: AnnouncementListener) -> ListenerId;

    /// Register a listener invoked once per received COV notification
    fn on_value_change(&self, listener: ValueChangeListener) -> ListenerId;

    /// Remove a listener; returns false if it was not registered
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Whether segmented replies are reassembled
    fn accepts_segmented_responses(&self) -> bool {
        false
    }

    /// Release network resources. Idempotent.
    async fn shutdown(&self);
}

/// Listener registry shared by the transport implementations
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    announcement: RwLock<Vec<(ListenerId, AnnouncementListener)>>,
    value_change: RwLock<Vec<(ListenerId, ValueChangeListener)>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_announcement(&self, listener: AnnouncementListener) -> ListenerId {
        let id = self.next_id();
        self.announcement
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn add_value_change(&self, listener: ValueChangeListener) -> ListenerId {
        let id = self.next_id();
        self.value_change
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut announcement = self
            .announcement
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = announcement.len();
        announcement.retain(|(existing, _)| *existing != id);
        if announcement.len() != before {
            return true;
        }
        drop(announcement);

        let mut value_change = self
            .value_change
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = value_change.len();
        value_change.retain(|(existing, _)| *existing != id);
        value_change.len() != before
    }

    /// Drop every registered listener
    pub fn clear(&self) {
        self.announcement
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.value_change
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        let announcement = self
            .announcement
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let value_change = self
            .value_change
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        announcement + value_change
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every announcement listener. The lock is not held during the calls.
    pub fn announce(&self, announcement: &Announcement) {
        let listeners: Vec<AnnouncementListener> = self
            .announcement
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(announcement.clone());
        }
    }

    /// Invoke every value-change listener. The lock is not held during the calls.
    pub fn value_changed(&self, change: &ValueChange) {
        let listeners: Vec<ValueChangeListener> = self
            .value_change
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change.clone());
        }
    }
}
