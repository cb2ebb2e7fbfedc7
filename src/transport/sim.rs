//! Simulated transport
//!
//! An in-process BACnet network made of scripted [`SimDevice`]s. Each device
//! answers Who-Is, ReadProperty and ReadPropertyMultiple from its object
//! table, and can be told to reject or time out on particular kinds of
//! request, to lose a random share of requests (from a seeded generator, so
//! runs repeat exactly), or to fail specific object-list indices.
//!
//! The transport records every request it is given and tracks how many
//! requests were in flight per device at once, which is what the pacing and
//! enumeration tests assert against.
//!
//! # Example
//!
//! ```rust
//! use bacnet_recon::transport::sim::{RequestKinds, SimDevice, SimulatedTransport};
//!
//! let transport = SimulatedTransport::new(7);
//! transport.add_device(
//!     SimDevice::new(1001)
//!         .with_name("AHU-1")
//!         .with_analog_inputs(20)
//!         .rejecting(RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE),
//! );
//! assert_eq!(transport.device_count(), 1);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Instant};

use super::{
    AnnouncementListener, ListenerId, Listeners, Rejection, Request, Response, Result, Transport,
    TransportError, ValueChange, ValueChangeListener,
};
use crate::device::{Announcement, CapabilitySummary, DeviceAddress, DeviceIdentity, Target};
use crate::object::{ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyValue};
use crate::service::{
    error_codes, AbortReason, BacnetError, PropertyResult, ReadAccessResult, ReadPropertyAck,
    ReadPropertyRequest, RejectReason,
};

bitflags! {
    /// Kinds of request a simulated device can be scripted to mishandle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestKinds: u8 {
        /// ReadProperty of the device object-name
        const OBJECT_NAME = 0x01;
        /// ReadProperty of the whole object-list
        const WHOLE_LIST = 0x02;
        /// ReadProperty of object-list[0]
        const LIST_SIZE = 0x04;
        /// ReadProperty of object-list[n], n > 0
        const LIST_ELEMENT = 0x08;
        /// Any ReadPropertyMultiple
        const READ_MULTIPLE = 0x10;
        /// Everything else
        const OTHER = 0x20;
    }
}

impl RequestKinds {
    /// The kind a request falls under
    pub fn of(request: &Request) -> Self {
        match request {
            Request::ReadProperty(read) => match (read.property_identifier, read.property_array_index) {
                (PropertyIdentifier::ObjectName, _) => RequestKinds::OBJECT_NAME,
                (PropertyIdentifier::ObjectList, None) => RequestKinds::WHOLE_LIST,
                (PropertyIdentifier::ObjectList, Some(0)) => RequestKinds::LIST_SIZE,
                (PropertyIdentifier::ObjectList, Some(_)) => RequestKinds::LIST_ELEMENT,
                _ => RequestKinds::OTHER,
            },
            Request::ReadPropertyMultiple(_) => RequestKinds::READ_MULTIPLE,
            Request::WhoIs(_) | Request::SubscribeCov(_) => RequestKinds::OTHER,
        }
    }
}

/// A scripted device
#[derive(Debug, Clone)]
pub struct SimDevice {
    instance: u32,
    address: DeviceAddress,
    name: String,
    summary: CapabilitySummary,
    objects: Vec<ObjectIdentifier>,
    answers_who_is: bool,
    rejects: RequestKinds,
    times_out: RequestKinds,
    timeout_rate: f64,
    failing_indices: BTreeSet<u32>,
    latency: Duration,
    announce_delay: Duration,
}

impl SimDevice {
    /// A responsive device whose object list holds only its device object
    pub fn new(instance: u32) -> Self {
        let octets = instance.to_be_bytes();
        Self {
            instance,
            address: DeviceAddress::Ip(SocketAddr::from((
                [10, octets[1], octets[2], octets[3]],
                crate::device::BACNET_IP_PORT,
            ))),
            name: format!("DEV-{}", instance),
            summary: CapabilitySummary::default(),
            objects: vec![ObjectIdentifier::device(instance)],
            answers_who_is: true,
            rejects: RequestKinds::empty(),
            times_out: RequestKinds::empty(),
            timeout_rate: 0.0,
            failing_indices: BTreeSet::new(),
            latency: Duration::from_millis(5),
            announce_delay: Duration::from_millis(10),
        }
    }

    pub fn with_address(mut self, address: DeviceAddress) -> Self {
        self.address = address;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_summary(mut self, summary: CapabilitySummary) -> Self {
        self.summary = summary;
        self
    }

    /// Replace the object list verbatim
    pub fn with_objects(mut self, objects: impl IntoIterator<Item = ObjectIdentifier>) -> Self {
        self.objects = objects.into_iter().collect();
        self
    }

    /// Device object followed by `count` analog inputs numbered from 1
    pub fn with_analog_inputs(self, count: u32) -> Self {
        let device = ObjectIdentifier::device(self.instance);
        let inputs = (1..=count).map(|i| ObjectIdentifier::new(ObjectType::AnalogInput, i));
        self.with_objects(std::iter::once(device).chain(inputs))
    }

    /// Never answer Who-Is
    pub fn silent(mut self) -> Self {
        self.answers_who_is = false;
        self
    }

    pub fn rejecting(mut self, kinds: RequestKinds) -> Self {
        self.rejects |= kinds;
        self
    }

    pub fn timing_out(mut self, kinds: RequestKinds) -> Self {
        self.times_out |= kinds;
        self
    }

    /// Share of requests (0.0 to 1.0) that are silently lost
    pub fn with_timeout_rate(mut self, rate: f64) -> Self {
        self.timeout_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// object-list indices that never answer
    pub fn failing_indices(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        self.failing_indices.extend(indices);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn announce_after(mut self, delay: Duration) -> Self {
        self.announce_delay = delay;
        self
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn objects(&self) -> &[ObjectIdentifier] {
        &self.objects
    }

    pub fn announcement(&self) -> Announcement {
        Announcement {
            identity: DeviceIdentity::new(self.instance, self.address.clone()),
            summary: self.summary,
        }
    }

    /// Value of one property, or the error a real device would report
    fn read(
        &self,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        index: Option<u32>,
    ) -> std::result::Result<Vec<PropertyValue>, BacnetError> {
        if object != ObjectIdentifier::device(self.instance) {
            return Err(BacnetError::new(
                error_codes::CLASS_OBJECT,
                error_codes::UNKNOWN_OBJECT,
            ));
        }

        let scalar = |value: PropertyValue| match index {
            None => Ok(vec![value]),
            Some(_) => Err(BacnetError::new(
                error_codes::CLASS_PROPERTY,
                error_codes::PROPERTY_IS_NOT_AN_ARRAY,
            )),
        };

        match property {
            PropertyIdentifier::ObjectName => scalar(PropertyValue::CharacterString(self.name.clone())),
            PropertyIdentifier::ObjectIdentifier => scalar(PropertyValue::ObjectIdentifier(object)),
            PropertyIdentifier::VendorIdentifier => {
                scalar(PropertyValue::Unsigned(self.summary.vendor_id as u64))
            }
            PropertyIdentifier::MaxApduLengthAccepted => {
                scalar(PropertyValue::Unsigned(self.summary.max_apdu as u64))
            }
            PropertyIdentifier::SegmentationSupported => {
                scalar(PropertyValue::Enumerated(self.summary.segmentation as u32))
            }
            PropertyIdentifier::ObjectList => match index {
                None => Ok(self
                    .objects
                    .iter()
                    .copied()
                    .map(PropertyValue::ObjectIdentifier)
                    .collect()),
                Some(0) => Ok(vec![PropertyValue::Unsigned(self.objects.len() as u64)]),
                Some(i) => self
                    .objects
                    .get(i as usize - 1)
                    .map(|object| vec![PropertyValue::ObjectIdentifier(*object)])
                    .ok_or_else(|| {
                        BacnetError::new(
                            error_codes::CLASS_PROPERTY,
                            error_codes::INVALID_ARRAY_INDEX,
                        )
                    }),
            },
            _ => Err(BacnetError::new(
                error_codes::CLASS_PROPERTY,
                error_codes::UNKNOWN_PROPERTY,
            )),
        }
    }

    /// Rough size of an unsegmented object-list reply
    fn whole_list_size(&self) -> usize {
        16 + self.objects.len() * 5
    }
}

/// One request as the transport saw it
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRequest {
    pub at: Instant,
    /// Instance of the device it was routed to, if any
    pub instance: Option<u32>,
    pub request: Request,
}

#[derive(Debug, Default, Clone, Copy)]
struct InFlight {
    current: usize,
    peak: usize,
}

struct Inner {
    devices: RwLock<HashMap<u32, SimDevice>>,
    listeners: Listeners,
    rng: Mutex<StdRng>,
    log: Mutex<Vec<LoggedRequest>>,
    in_flight: Mutex<HashMap<u32, InFlight>>,
    timeout_delay: Duration,
    segmented_responses: bool,
    shut_down: AtomicBool,
}

/// Scriptable in-process transport
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("devices", &self.device_count())
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<u32, InFlight>>,
    instance: u32,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&self.instance) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

impl SimulatedTransport {
    /// An empty network whose random losses are drawn from `seed`
    pub fn new(seed: u64) -> Self {
        Self::with_options(seed, Duration::from_millis(500), false)
    }

    /// `timeout_delay` is how long a lost request takes to fail
    pub fn with_options(seed: u64, timeout_delay: Duration, segmented_responses: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                devices: RwLock::new(HashMap::new()),
                listeners: Listeners::new(),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                log: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                timeout_delay,
                segmented_responses,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn add_device(&self, device: SimDevice) {
        self.inner
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.instance, device);
    }

    pub fn device(&self, instance: u32) -> Option<SimDevice> {
        self.inner
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&instance)
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        self.inner
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an unsolicited I-Am from a registered device
    pub fn announce(&self, instance: u32) -> bool {
        match self.device(instance) {
            Some(device) => {
                self.inner.listeners.announce(&device.announcement());
                true
            }
            None => false,
        }
    }

    /// Deliver an arbitrary announcement, registered device or not
    pub fn inject_announcement(&self, announcement: Announcement) {
        self.inner.listeners.announce(&announcement);
    }

    pub fn emit_value_change(&self, change: ValueChange) {
        self.inner.listeners.value_changed(&change);
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests_for(&self, instance: u32) -> Vec<LoggedRequest> {
        self.requests()
            .into_iter()
            .filter(|logged| logged.instance == Some(instance))
            .collect()
    }

    /// Highest number of concurrent requests one device has seen
    pub fn peak_in_flight(&self, instance: u32) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&instance)
            .map_or(0, |entry| entry.peak)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn log(&self, instance: Option<u32>, request: &Request) {
        self.inner
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoggedRequest {
                at: Instant::now(),
                instance,
                request: request.clone(),
            });
    }

    fn device_at(&self, address: &DeviceAddress) -> Option<SimDevice> {
        self.inner
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|device| &device.address == address)
            .cloned()
    }

    fn enter(&self, instance: u32) -> FlightGuard<'_> {
        let mut map = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(instance).or_default();
        entry.current += 1;
        entry.peak = entry.peak.max(entry.current);
        FlightGuard {
            in_flight: &self.inner.in_flight,
            instance,
        }
    }

    fn lost(&self, device: &SimDevice) -> bool {
        if device.timeout_rate <= 0.0 {
            return false;
        }
        self.inner
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(device.timeout_rate)
    }

    fn who_is(&self, target: &Target, request: &Request) {
        let Request::WhoIs(who_is) = request else {
            return;
        };
        let responders: Vec<SimDevice> = self
            .inner
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|device| device.answers_who_is && who_is.matches(device.instance))
            .filter(|device| match target {
                Target::Broadcast => true,
                Target::Address(address) => {
                    device.address.socket_addr() == address.socket_addr()
                }
            })
            .cloned()
            .collect();

        debug!("Who-Is {} answered by {} simulated devices", target, responders.len());
        for device in responders {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                sleep(device.announce_delay).await;
                if !inner.shut_down.load(Ordering::SeqCst) {
                    inner.listeners.announce(&device.announcement());
                }
            });
        }
    }

    fn rejection(kind: RequestKinds) -> Rejection {
        if kind == RequestKinds::WHOLE_LIST {
            Rejection::Abort(AbortReason::SegmentationNotSupported)
        } else if kind == RequestKinds::READ_MULTIPLE {
            Rejection::Reject(RejectReason::UnrecognizedService)
        } else {
            Rejection::Error(BacnetError::new(
                error_codes::CLASS_SERVICES,
                error_codes::SERVICE_REQUEST_DENIED,
            ))
        }
    }

    fn answer(&self, device: &SimDevice, request: Request) -> Result<Response> {
        match request {
            Request::ReadProperty(ReadPropertyRequest {
                object_identifier,
                property_identifier,
                property_array_index,
            }) => {
                if property_identifier == PropertyIdentifier::ObjectList
                    && property_array_index.is_none()
                    && device.whole_list_size() > device.summary.max_apdu as usize
                    && !(self.inner.segmented_responses && device.summary.segmentation.can_transmit())
                {
                    return Err(TransportError::Rejected(Rejection::Abort(
                        AbortReason::SegmentationNotSupported,
                    )));
                }
                let values = device
                    .read(object_identifier, property_identifier, property_array_index)
                    .map_err(|error| TransportError::Rejected(Rejection::Error(error)))?;
                Ok(Response::ReadProperty(ReadPropertyAck {
                    object_identifier,
                    property_identifier,
                    property_array_index,
                    values,
                }))
            }
            Request::ReadPropertyMultiple(rpm) => {
                let results = rpm
                    .read_access_specifications
                    .iter()
                    .map(|spec| ReadAccessResult {
                        object_identifier: spec.object_identifier,
                        results: spec
                            .property_references
                            .iter()
                            .map(|reference| PropertyResult {
                                property_identifier: reference.property_identifier,
                                property_array_index: reference.property_array_index,
                                value: device.read(
                                    spec.object_identifier,
                                    reference.property_identifier,
                                    reference.property_array_index,
                                ),
                            })
                            .collect(),
                    })
                    .collect();
                Ok(Response::ReadPropertyMultiple(results))
            }
            Request::SubscribeCov(subscribe) => {
                if device.objects.contains(&subscribe.monitored_object_identifier) {
                    Ok(Response::Acknowledged)
                } else {
                    Err(TransportError::Rejected(Rejection::Error(BacnetError::new(
                        error_codes::CLASS_OBJECT,
                        error_codes::UNKNOWN_OBJECT,
                    ))))
                }
            }
            Request::WhoIs(_) => Ok(Response::Sent),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, target: &Target, request: Request) -> Result<Response> {
        if self.is_shut_down() {
            return Err(TransportError::Unavailable("transport is shut down".to_string()));
        }

        if !request.is_confirmed() {
            self.log(None, &request);
            self.who_is(target, &request);
            return Ok(Response::Sent);
        }

        let Target::Address(address) = target else {
            return Err(TransportError::InvalidTarget(format!(
                "{} cannot be broadcast",
                request.name()
            )));
        };
        let Some(device) = self.device_at(address) else {
            self.log(None, &request);
            trace!("{} to {} has no simulated device", request.name(), address);
            sleep(self.inner.timeout_delay).await;
            return Err(TransportError::Timeout);
        };

        self.log(Some(device.instance), &request);
        let _flight = self.enter(device.instance);
        let kind = RequestKinds::of(&request);

        let lost = device.times_out.intersects(kind)
            || matches!(&request, Request::ReadProperty(read)
                if read.property_identifier == PropertyIdentifier::ObjectList
                    && read.property_array_index.is_some_and(|i| device.failing_indices.contains(&i)))
            || self.lost(&device);
        if lost {
            sleep(self.inner.timeout_delay).await;
            return Err(TransportError::Timeout);
        }

        sleep(device.latency).await;
        if device.rejects.intersects(kind) {
            return Err(TransportError::Rejected(Self::rejection(kind)));
        }
        self.answer(&device, request)
    }

    fn on_announcement(&self, listener: AnnouncementListener) -> ListenerId {
        self.inner.listeners.add_announcement(listener)
    }

    fn on_value_change(&self, listener: ValueChangeListener) -> ListenerId {
        self.inner.listeners.add_value_change(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    fn accepts_segmented_responses(&self) -> bool {
        self.inner.segmented_responses
    }

    async fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            self.inner.listeners.clear();
            debug!("Simulated transport shut down");
        }
    }
}
