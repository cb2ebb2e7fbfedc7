//! BACnet/IP transport (ASHRAE 135 Annex J)
//!
//! A [`Transport`] over one tokio UDP socket. The socket is opened through
//! `socket2` so it can share port 47808 with other BACnet software on the
//! host and send broadcasts. A background task owns the receive side: it
//! matches replies to outstanding confirmed requests by invoke id, and hands
//! I-Am and COV notifications to the registered listeners.
//!
//! Segmented replies are never reassembled. Requests go out with
//! `segmented-response-accepted` cleared, so a compliant device answers an
//! oversized read with an Abort; a device that segments anyway is aborted and
//! the request fails as malformed.
//!
//! When a BBMD is configured the transport registers as a foreign device,
//! renews the registration at half its time-to-live, and sends broadcasts
//! through the BBMD as Distribute-Broadcast-To-Network.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_recon::device::Target;
//! use bacnet_recon::service::WhoIsRequest;
//! use bacnet_recon::transport::bip::{BacnetIpConfig, BacnetIpTransport};
//! use bacnet_recon::transport::{Request, Transport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = BacnetIpTransport::bind(BacnetIpConfig::default()).await?;
//! transport
//!     .send(&Target::Broadcast, Request::WhoIs(WhoIsRequest::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{
    AnnouncementListener, ListenerId, Listeners, Rejection, Request, Response, Result, Transport,
    TransportError, ValueChange, ValueChangeListener,
};
use crate::app::{Apdu, InvokeIdManager};
use crate::device::{Announcement, DeviceAddress, DeviceIdentity, Target};
use crate::network::{NetworkAddress, Npdu};
use crate::object::ObjectType;
use crate::service::{
    AbortReason, BacnetError, ConfirmedServiceChoice, CovNotificationRequest, IAmRequest,
    ReadPropertyAck, ReadPropertyMultipleAck, RejectReason, UnconfirmedServiceChoice,
};

/// BACnet/IP specific constants
pub mod constants {
    use std::time::Duration;

    /// Default BACnet/IP UDP port
    pub const BACNET_IP_PORT: u16 = 0xBAC0; // 47808

    /// BVLL type octet for BACnet/IP
    pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

    /// Maximum BVLL length
    pub const MAX_BVLL_LENGTH: usize = 1497;

    /// BVLL header size
    pub const BVLL_HEADER_SIZE: usize = 4;

    /// Original source address carried by a Forwarded-NPDU
    pub const FORWARDED_ADDRESS_SIZE: usize = 6;

    /// Default foreign device TTL (seconds)
    pub const DEFAULT_FD_TTL: u16 = 900; // 15 minutes

    /// Default time to wait for a reply to a confirmed request
    pub const DEFAULT_APDU_TIMEOUT: Duration = Duration::from_secs(5);

    /// BVLC-Result code for a refused foreign device registration
    pub const REGISTER_FOREIGN_DEVICE_NAK: u16 = 0x0030;
}

/// BVLL function codes for BACnet/IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    /// Result of operation
    Result = 0x00,
    /// Write broadcast distribution table
    WriteBroadcastDistributionTable = 0x01,
    /// Read broadcast distribution table
    ReadBroadcastDistributionTable = 0x02,
    /// Acknowledge read BDT
    ReadBroadcastDistributionTableAck = 0x03,
    /// Forwarded NPDU
    ForwardedNpdu = 0x04,
    /// Register as foreign device
    RegisterForeignDevice = 0x05,
    /// Read foreign device table
    ReadForeignDeviceTable = 0x06,
    /// Acknowledge read FDT
    ReadForeignDeviceTableAck = 0x07,
    /// Delete foreign device table entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Distribute broadcast to remote network
    DistributeBroadcastToNetwork = 0x09,
    /// Pass NPDU to remote device
    OriginalUnicastNpdu = 0x0A,
    /// Broadcast NPDU to local network
    OriginalBroadcastNpdu = 0x0B,
    /// Secured NPDU
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvllFunction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        let function = match value {
            0x00 => BvllFunction::Result,
            0x01 => BvllFunction::WriteBroadcastDistributionTable,
            0x02 => BvllFunction::ReadBroadcastDistributionTable,
            0x03 => BvllFunction::ReadBroadcastDistributionTableAck,
            0x04 => BvllFunction::ForwardedNpdu,
            0x05 => BvllFunction::RegisterForeignDevice,
            0x06 => BvllFunction::ReadForeignDeviceTable,
            0x07 => BvllFunction::ReadForeignDeviceTableAck,
            0x08 => BvllFunction::DeleteForeignDeviceTableEntry,
            0x09 => BvllFunction::DistributeBroadcastToNetwork,
            0x0A => BvllFunction::OriginalUnicastNpdu,
            0x0B => BvllFunction::OriginalBroadcastNpdu,
            0x0C => BvllFunction::SecureBvll,
            other => {
                return Err(TransportError::Malformed(format!(
                    "invalid BVLL function 0x{:02X}",
                    other
                )))
            }
        };
        Ok(function)
    }
}

/// BVLL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvllHeader {
    pub function: BvllFunction,
    /// Total length including header
    pub length: u16,
}

impl BvllHeader {
    pub fn new(function: BvllFunction, length: u16) -> Self {
        Self { function, length }
    }

    pub fn encode(&self) -> [u8; 4] {
        let length = self.length.to_be_bytes();
        [
            constants::BVLL_TYPE_BACNET_IP,
            self.function as u8,
            length[0],
            length[1],
        ]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < constants::BVLL_HEADER_SIZE {
            return Err(TransportError::Malformed("BVLL header too short".into()));
        }
        if data[0] != constants::BVLL_TYPE_BACNET_IP {
            return Err(TransportError::Malformed(format!(
                "invalid BVLL type 0x{:02X}",
                data[0]
            )));
        }
        Ok(Self {
            function: BvllFunction::try_from(data[1])?,
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// BVLL message containing header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllMessage {
    pub header: BvllHeader,
    pub data: Bytes,
}

impl BvllMessage {
    pub fn new(function: BvllFunction, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = (constants::BVLL_HEADER_SIZE + data.len()) as u16;
        Self {
            header: BvllHeader::new(function, length),
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(constants::BVLL_HEADER_SIZE + self.data.len());
        result.extend_from_slice(&self.header.encode());
        result.extend_from_slice(&self.data);
        result
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BvllHeader::decode(data)?;
        let length = header.length as usize;
        if length < constants::BVLL_HEADER_SIZE || data.len() < length {
            return Err(TransportError::Malformed(format!(
                "BVLL length {} for a {} byte datagram",
                length,
                data.len()
            )));
        }
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(&data[constants::BVLL_HEADER_SIZE..length]),
        })
    }

    /// The NPDU and the address of the node that originated it
    pub fn npdu(&self, peer: SocketAddr) -> Result<Option<(Bytes, SocketAddr)>> {
        match self.header.function {
            BvllFunction::OriginalUnicastNpdu | BvllFunction::OriginalBroadcastNpdu => {
                Ok(Some((self.data.clone(), peer)))
            }
            BvllFunction::ForwardedNpdu => {
                if self.data.len() < constants::FORWARDED_ADDRESS_SIZE {
                    return Err(TransportError::Malformed(
                        "Forwarded-NPDU without originating address".into(),
                    ));
                }
                let d = &self.data;
                let origin = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(d[0], d[1], d[2], d[3])),
                    u16::from_be_bytes([d[4], d[5]]),
                );
                Ok(Some((self.data.slice(constants::FORWARDED_ADDRESS_SIZE..), origin)))
            }
            _ => Ok(None),
        }
    }
}

/// Foreign device registration settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ForeignDeviceConfig {
    /// BBMD (BACnet Broadcast Management Device) address
    pub bbmd: SocketAddr,
    /// Time-to-live in seconds
    pub ttl: u16,
}

impl ForeignDeviceConfig {
    pub fn new(bbmd: SocketAddr) -> Self {
        Self {
            bbmd,
            ttl: constants::DEFAULT_FD_TTL,
        }
    }
}

/// BACnet/IP transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BacnetIpConfig {
    /// Local bind address
    pub bind_address: SocketAddr,
    /// Broadcast destination; derived from the interfaces when unset
    pub broadcast_address: Option<SocketAddr>,
    /// How long a confirmed request waits for its reply
    pub apdu_timeout: Duration,
    /// Receive buffer size
    pub buffer_size: usize,
    /// Register with a BBMD and broadcast through it
    pub foreign_device: Option<ForeignDeviceConfig>,
}

impl Default for BacnetIpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                constants::BACNET_IP_PORT,
            ),
            broadcast_address: None,
            apdu_timeout: constants::DEFAULT_APDU_TIMEOUT,
            buffer_size: 1500,
            foreign_device: None,
        }
    }
}

/// Build a complete BACnet/IP frame
pub fn encode_frame(function: BvllFunction, npdu: &Npdu, apdu: &Apdu) -> Vec<u8> {
    let mut payload = npdu.encode();
    payload.extend_from_slice(&apdu.encode());
    BvllMessage::new(function, payload).encode()
}

/// NPDU header addressing a device, routed through a gateway when needed
fn npdu_for(address: &DeviceAddress, expecting_reply: bool) -> Npdu {
    match address {
        DeviceAddress::Ip(_) => Npdu::new(expecting_reply),
        DeviceAddress::Routed { network, mac, .. } => {
            Npdu::routed(NetworkAddress::new(*network, mac.clone()), expecting_reply)
        }
    }
}

/// Service choice and encoded parameters of a request
fn encode_request(request: &Request) -> (u8, Vec<u8>) {
    let mut buffer = Vec::new();
    let choice = match request {
        Request::WhoIs(who_is) => {
            who_is.encode(&mut buffer);
            UnconfirmedServiceChoice::WhoIs as u8
        }
        Request::ReadProperty(read) => {
            read.encode(&mut buffer);
            ConfirmedServiceChoice::ReadProperty as u8
        }
        Request::ReadPropertyMultiple(read) => {
            read.encode(&mut buffer);
            ConfirmedServiceChoice::ReadPropertyMultiple as u8
        }
        Request::SubscribeCov(subscribe) => {
            subscribe.encode(&mut buffer);
            ConfirmedServiceChoice::SubscribeCOV as u8
        }
    };
    (choice, buffer)
}

/// Turn the reply to a confirmed request into a response
fn interpret_reply(request: &Request, reply: Apdu) -> Result<Response> {
    match reply {
        Apdu::SimpleAck { .. } => Ok(Response::Acknowledged),
        Apdu::ComplexAck { segmented: true, .. } => Err(TransportError::Malformed(
            "segmented reply to an unsegmented request".into(),
        )),
        Apdu::ComplexAck { service_data, .. } => {
            let malformed = |e: crate::service::ServiceError| TransportError::Malformed(e.to_string());
            match request {
                Request::ReadProperty(_) => ReadPropertyAck::decode(&service_data)
                    .map(Response::ReadProperty)
                    .map_err(malformed),
                Request::ReadPropertyMultiple(_) => ReadPropertyMultipleAck::decode(&service_data)
                    .map(|ack| Response::ReadPropertyMultiple(ack.results))
                    .map_err(malformed),
                other => Err(TransportError::Malformed(format!(
                    "unexpected ComplexACK to {}",
                    other.name()
                ))),
            }
        }
        Apdu::Error {
            error_class,
            error_code,
            ..
        } => Err(TransportError::Rejected(Rejection::Error(BacnetError::new(
            error_class,
            error_code,
        )))),
        Apdu::Reject { reject_reason, .. } => Err(TransportError::Rejected(Rejection::Reject(
            RejectReason::from(reject_reason),
        ))),
        Apdu::Abort { abort_reason, .. } => Err(TransportError::Rejected(Rejection::Abort(
            AbortReason::from(abort_reason),
        ))),
        other => Err(TransportError::Malformed(format!(
            "unexpected reply {:?}",
            other
        ))),
    }
}

/// Reply waiting to be matched to its request
struct Pending {
    peer: SocketAddr,
    reply: oneshot::Sender<Apdu>,
}

struct Shared {
    socket: UdpSocket,
    config: BacnetIpConfig,
    broadcast_targets: Vec<SocketAddr>,
    invoke_ids: Mutex<InvokeIdManager>,
    pending: Mutex<HashMap<u8, Pending>>,
    listeners: Listeners,
    shut_down: AtomicBool,
}

/// Releases an invoke id however the request ends
struct PendingGuard<'a> {
    shared: &'a Shared,
    invoke_id: u8,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.invoke_id);
        self.shared
            .invoke_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release_id(self.invoke_id);
    }
}

/// BACnet/IP transport
pub struct BacnetIpTransport {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BacnetIpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacnetIpTransport")
            .field("config", &self.shared.config)
            .field("broadcast_targets", &self.shared.broadcast_targets)
            .finish()
    }
}

impl BacnetIpTransport {
    /// Open the socket, start the receive loop and, when configured, register with the BBMD
    pub async fn bind(config: BacnetIpConfig) -> Result<Self> {
        let socket = open_socket(config.bind_address)?;
        let broadcast_targets = broadcast_targets(&config);
        info!(
            "BACnet/IP transport bound to {} (broadcast to {:?})",
            socket.local_addr()?,
            broadcast_targets
        );

        let shared = Arc::new(Shared {
            socket,
            config,
            broadcast_targets,
            invoke_ids: Mutex::new(InvokeIdManager::new()),
            pending: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
            shut_down: AtomicBool::new(false),
        });

        let mut tasks = vec![tokio::spawn(receive_loop(Arc::clone(&shared)))];
        if let Some(foreign) = shared.config.foreign_device.clone() {
            shared.register_foreign_device(&foreign).await?;
            tasks.push(tokio::spawn(renew_registration(Arc::clone(&shared), foreign)));
        }

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    async fn send_unconfirmed(&self, target: &Target, request: &Request) -> Result<Response> {
        let (choice, data) = encode_request(request);
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: choice,
            service_data: Bytes::from(data),
        };

        match target {
            Target::Broadcast => {
                let npdu = Npdu::global_broadcast();
                match &self.shared.config.foreign_device {
                    Some(foreign) => {
                        let frame =
                            encode_frame(BvllFunction::DistributeBroadcastToNetwork, &npdu, &apdu);
                        self.shared.socket.send_to(&frame, foreign.bbmd).await?;
                    }
                    None => {
                        let frame = encode_frame(BvllFunction::OriginalBroadcastNpdu, &npdu, &apdu);
                        for destination in &self.shared.broadcast_targets {
                            self.shared.socket.send_to(&frame, destination).await?;
                        }
                    }
                }
            }
            Target::Address(address) => {
                // A gateway relays a global broadcast to the networks behind it
                let npdu = match address {
                    DeviceAddress::Ip(_) => Npdu::global_broadcast(),
                    DeviceAddress::Routed { network, .. } => {
                        Npdu::routed(NetworkAddress::new(*network, Bytes::new()), false)
                    }
                };
                let frame = encode_frame(BvllFunction::OriginalUnicastNpdu, &npdu, &apdu);
                self.shared.socket.send_to(&frame, address.socket_addr()).await?;
            }
        }
        trace!("{} sent to {}", request.name(), target);
        Ok(Response::Sent)
    }

    async fn send_confirmed(&self, address: &DeviceAddress, request: &Request) -> Result<Response> {
        let invoke_id = self
            .shared
            .invoke_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
            .ok_or_else(|| TransportError::Unavailable("no free invoke id".into()))?;
        let guard = PendingGuard {
            shared: &self.shared,
            invoke_id,
        };

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                invoke_id,
                Pending {
                    peer: address.socket_addr(),
                    reply: tx,
                },
            );

        let (choice, data) = encode_request(request);
        let apdu = Apdu::confirmed(invoke_id, choice, data);
        let frame = encode_frame(
            BvllFunction::OriginalUnicastNpdu,
            &npdu_for(address, true),
            &apdu,
        );
        self.shared.socket.send_to(&frame, address.socket_addr()).await?;
        trace!(
            "{} sent to {} with invoke id {}",
            request.name(),
            address,
            invoke_id
        );

        let reply = match tokio::time::timeout(self.shared.config.apdu_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(TransportError::Unavailable("transport is shut down".into()));
            }
            Err(_) => {
                debug!("{} to {} timed out", request.name(), address);
                return Err(TransportError::Timeout);
            }
        };
        drop(guard);

        if let Apdu::ComplexAck {
            segmented: true,
            invoke_id,
            ..
        } = &reply
        {
            warn!("{} answered with a segmented reply; aborting it", address);
            let abort = Apdu::Abort {
                server: false,
                invoke_id: *invoke_id,
                abort_reason: AbortReason::SegmentationNotSupported.into(),
            };
            self.shared.send_apdu(address, &abort).await?;
        }
        interpret_reply(request, reply)
    }
}

impl Shared {
    async fn send_apdu(&self, address: &DeviceAddress, apdu: &Apdu) -> Result<()> {
        let frame = encode_frame(
            BvllFunction::OriginalUnicastNpdu,
            &npdu_for(address, false),
            apdu,
        );
        self.socket.send_to(&frame, address.socket_addr()).await?;
        Ok(())
    }

    async fn register_foreign_device(&self, foreign: &ForeignDeviceConfig) -> Result<()> {
        let message = BvllMessage::new(
            BvllFunction::RegisterForeignDevice,
            foreign.ttl.to_be_bytes().to_vec(),
        );
        self.socket.send_to(&message.encode(), foreign.bbmd).await?;
        debug!(
            "Registering as foreign device with {} (ttl {} s)",
            foreign.bbmd, foreign.ttl
        );
        Ok(())
    }

    fn handle_frame(&self, data: &[u8], peer: SocketAddr) -> Result<Option<(DeviceAddress, Apdu)>> {
        let message = BvllMessage::decode(data)?;

        if message.header.function == BvllFunction::Result {
            if message.data.len() >= 2 {
                let code = u16::from_be_bytes([message.data[0], message.data[1]]);
                if code == constants::REGISTER_FOREIGN_DEVICE_NAK {
                    error!("BBMD {} refused foreign device registration", peer);
                } else if code != 0 {
                    warn!("BVLC-Result 0x{:04X} from {}", code, peer);
                }
            }
            return Ok(None);
        }

        let Some((payload, origin)) = message.npdu(peer)? else {
            trace!("Ignoring {:?} from {}", message.header.function, peer);
            return Ok(None);
        };

        let (npdu, offset) =
            Npdu::decode(&payload).map_err(|e| TransportError::Malformed(e.to_string()))?;
        if npdu.is_network_message() {
            trace!("Ignoring network layer message from {}", origin);
            return Ok(None);
        }

        let address = match npdu.source {
            Some(source) => DeviceAddress::Routed {
                via: origin,
                network: source.network,
                mac: source.mac,
            },
            None => DeviceAddress::Ip(origin),
        };
        let apdu = Apdu::decode(&payload[offset..])
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(Some((address, apdu)))
    }

    fn dispatch_unconfirmed(&self, address: DeviceAddress, service_choice: u8, data: &[u8]) {
        match UnconfirmedServiceChoice::try_from(service_choice) {
            Ok(UnconfirmedServiceChoice::IAm) => match IAmRequest::decode(data) {
                Ok(iam) if iam.device_identifier.object_type == ObjectType::Device => {
                    self.listeners.announce(&Announcement {
                        identity: DeviceIdentity::new(iam.device_identifier.instance, address),
                        summary: iam.summary(),
                    });
                }
                Ok(iam) => debug!("I-Am for non-device {} ignored", iam.device_identifier),
                Err(e) => debug!("Undecodable I-Am from {}: {}", address, e),
            },
            Ok(UnconfirmedServiceChoice::UnconfirmedCOVNotification) => {
                self.dispatch_value_change(address, data, false);
            }
            _ => trace!(
                "Unconfirmed service {} from {} ignored",
                service_choice,
                address
            ),
        }
    }

    fn dispatch_value_change(&self, address: DeviceAddress, data: &[u8], confirmed: bool) -> bool {
        match CovNotificationRequest::decode(data) {
            Ok(notification) => {
                self.listeners.value_changed(&ValueChange {
                    subscriber_id: notification.subscriber_process_identifier,
                    source_device: DeviceIdentity::new(
                        notification.initiating_device_identifier.instance,
                        address,
                    ),
                    object: notification.monitored_object_identifier,
                    changed: notification.list_of_values,
                    time_remaining_secs: notification.time_remaining,
                    confirmed,
                });
                true
            }
            Err(e) => {
                debug!("Undecodable COV notification from {}: {}", address, e);
                false
            }
        }
    }

    /// Answer a confirmed request from a device; only COV notifications are served
    async fn serve_confirmed(
        &self,
        address: DeviceAddress,
        invoke_id: u8,
        service_choice: u8,
        data: &[u8],
    ) -> Result<()> {
        let reply = match ConfirmedServiceChoice::try_from(service_choice) {
            Ok(ConfirmedServiceChoice::ConfirmedCOVNotification)
                if self.dispatch_value_change(address.clone(), data, true) =>
            {
                Apdu::SimpleAck {
                    invoke_id,
                    service_choice,
                }
            }
            Ok(ConfirmedServiceChoice::ConfirmedCOVNotification) => Apdu::Reject {
                invoke_id,
                reject_reason: RejectReason::InvalidTag.into(),
            },
            _ => Apdu::Reject {
                invoke_id,
                reject_reason: RejectReason::UnrecognizedService.into(),
            },
        };
        self.send_apdu(&address, &reply).await
    }

    fn complete(&self, address: &DeviceAddress, apdu: Apdu) {
        let Some(invoke_id) = apdu.invoke_id() else {
            return;
        };
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.get(&invoke_id) {
            Some(waiting) if waiting.peer == address.socket_addr() => {
                if let Some(waiting) = pending.remove(&invoke_id) {
                    // The requester may have given up already
                    let _ = waiting.reply.send(apdu);
                }
            }
            Some(_) => debug!(
                "Reply for invoke id {} from unexpected peer {}",
                invoke_id, address
            ),
            None => trace!("Late or unknown reply for invoke id {}", invoke_id),
        }
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buffer = vec![0u8; shared.config.buffer_size.max(constants::MAX_BVLL_LENGTH)];
    loop {
        let (length, peer) = match shared.socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                if shared.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                warn!("BACnet/IP receive failed: {}", e);
                continue;
            }
        };

        let (address, apdu) = match shared.handle_frame(&buffer[..length], peer) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                debug!("Dropping frame from {}: {}", peer, e);
                continue;
            }
        };

        match apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => shared.dispatch_unconfirmed(address, service_choice, &service_data),
            Apdu::ConfirmedRequest {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                if let Err(e) = shared
                    .serve_confirmed(address, invoke_id, service_choice, &service_data)
                    .await
                {
                    warn!("Failed to answer confirmed request from {}: {}", peer, e);
                }
            }
            reply => shared.complete(&address, reply),
        }
    }
}

async fn renew_registration(shared: Arc<Shared>, foreign: ForeignDeviceConfig) {
    let period = Duration::from_secs(u64::from(foreign.ttl / 2).max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        if shared.shut_down.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = shared.register_foreign_device(&foreign).await {
            warn!("Foreign device renewal with {} failed: {}", foreign.bbmd, e);
        }
    }
}

fn open_socket(bind_address: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(
        Domain::for_address(bind_address),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_address.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Directed broadcast address of every IPv4 interface the socket is bound to
fn broadcast_targets(config: &BacnetIpConfig) -> Vec<SocketAddr> {
    if let Some(address) = config.broadcast_address {
        return vec![address];
    }

    let bound_ip = config.bind_address.ip();
    let mut targets = Vec::new();
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces.iter().filter(|i| !i.is_loopback()) {
                let if_addrs::IfAddr::V4(v4) = &interface.addr else {
                    continue;
                };
                if !bound_ip.is_unspecified() && bound_ip != IpAddr::V4(v4.ip) {
                    continue;
                }
                if let Some(broadcast) = v4.broadcast {
                    let target = SocketAddr::new(IpAddr::V4(broadcast), constants::BACNET_IP_PORT);
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
        Err(e) => warn!("Could not list network interfaces: {}", e),
    }

    if targets.is_empty() {
        targets.push(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            constants::BACNET_IP_PORT,
        ));
    }
    targets
}

#[async_trait]
impl Transport for BacnetIpTransport {
    async fn send(&self, target: &Target, request: Request) -> Result<Response> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("transport is shut down".into()));
        }
        if !request.is_confirmed() {
            return self.send_unconfirmed(target, &request).await;
        }
        match target {
            Target::Address(address) => self.send_confirmed(address, &request).await,
            Target::Broadcast => Err(TransportError::InvalidTarget(format!(
                "{} cannot be broadcast",
                request.name()
            ))),
        }
    }

    fn on_announcement(&self, listener: AnnouncementListener) -> ListenerId {
        self.shared.listeners.add_announcement(listener)
    }

    fn on_value_change(&self, listener: ValueChangeListener) -> ListenerId {
        self.shared.listeners.add_value_change(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.shared.listeners.clear();
        // Waiting requesters see their reply channel close
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("BACnet/IP transport shut down");
    }
}

impl Drop for BacnetIpTransport {
    fn drop(&mut self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
