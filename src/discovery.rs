//! Device discovery
//!
//! [`DiscoveryOrchestrator::discover`] sends one Who-Is and returns a
//! [`Discovery`] handle that yields each announcing device once, until the
//! listening window closes. The transport listener registered for the call
//! only records the announcement in the [`DeviceCache`] and queues it; it is
//! removed when the window closes, when the handle is cancelled, or when the
//! handle is dropped.
//!
//! Two variations build on it: [`sweep`](DiscoveryOrchestrator::sweep) walks a
//! list of instance ranges one ranged Who-Is at a time, and
//! [`locate`](DiscoveryOrchestrator::locate) looks for a single instance and
//! falls back to reading the device directly when it stays silent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, sleep_until, Instant};

use crate::cache::DeviceCache;
use crate::cancel::CancelToken;
use crate::config::DiscoveryConfig;
use crate::device::{Announcement, DeviceIdentity, InstanceRange, Target};
use crate::error::{ReconError, Result};
use crate::object::{ObjectIdentifier, PropertyIdentifier};
use crate::retry::Requester;
use crate::service::WhoIsRequest;
use crate::transport::{ListenerId, Request, Transport};

/// Removes a transport listener exactly once
struct ListenerGuard {
    transport: Arc<dyn Transport>,
    id: Mutex<Option<ListenerId>>,
}

impl ListenerGuard {
    fn release(&self) {
        let id = self.id.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = id {
            self.transport.remove_listener(id);
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Devices announcing within one listening window
pub struct Discovery {
    receiver: Option<mpsc::Receiver<Announcement>>,
    guard: Option<ListenerGuard>,
    cache: Arc<DeviceCache>,
    deadline: Instant,
    seen: HashSet<u32>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("deadline", &self.deadline)
            .field("seen", &self.seen.len())
            .field("finished", &self.receiver.is_none())
            .finish()
    }
}

impl Discovery {
    fn empty(cache: Arc<DeviceCache>) -> Self {
        Self {
            receiver: None,
            guard: None,
            cache,
            deadline: Instant::now(),
            seen: HashSet::new(),
            cancel: CancelToken::new(),
        }
    }

    /// The next newly announced device, or None once the window has closed
    pub async fn next(&mut self) -> Option<DeviceIdentity> {
        self.next_announcement()
            .await
            .map(|announcement| announcement.identity)
    }

    /// Like [`next`](Self::next), keeping the capability summary
    pub async fn next_announcement(&mut self) -> Option<Announcement> {
        loop {
            let receiver = self.receiver.as_mut()?;
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                _ = sleep_until(self.deadline) => None,
                received = receiver.recv() => received,
            };

            let Some(mut announcement) = received else {
                self.finish();
                return None;
            };
            let instance = announcement.identity.instance;
            if !self.seen.insert(instance) {
                continue;
            }
            // Within a session the first address a device announced from is kept
            if let Some(bound) = self.cache.identity(instance) {
                announcement.identity = bound;
            }
            return Some(announcement);
        }
    }

    /// Stop listening now; nothing announced afterwards is returned
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.finish();
    }

    /// Wait for the window to close and return every device seen
    pub async fn collect(mut self) -> Vec<DeviceIdentity> {
        let mut devices = Vec::new();
        while let Some(identity) = self.next().await {
            devices.push(identity);
        }
        devices
    }

    pub fn is_finished(&self) -> bool {
        self.receiver.is_none()
    }

    fn finish(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
        self.receiver = None;
    }
}

/// Runs Who-Is based discovery against a transport
#[derive(Debug, Clone)]
pub struct DiscoveryOrchestrator {
    requester: Requester,
    cache: Arc<DeviceCache>,
    config: DiscoveryConfig,
    recording: Arc<AtomicBool>,
}

impl DiscoveryOrchestrator {
    pub fn new(requester: Requester, cache: Arc<DeviceCache>, config: DiscoveryConfig) -> Self {
        Self {
            requester,
            cache,
            config,
            recording: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Whether discovery windows record what they hear in the cache.
    ///
    /// Turned off while another listener already records every announcement,
    /// so each one is counted once. Shared by all clones.
    pub fn set_recording(&self, enabled: bool) {
        self.recording.store(enabled, Ordering::SeqCst);
    }

    /// Register the announcement listener for a window ending at `deadline`
    fn listen<F>(&self, accepts: F, deadline: Instant) -> Result<Discovery>
    where
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        let cancel = self.requester.cancel_token().child();
        if cancel.is_cancelled() {
            return Err(ReconError::Cancelled);
        }

        let (sender, receiver) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let cache = Arc::clone(&self.cache);
        let recording = Arc::clone(&self.recording);
        let transport = Arc::clone(self.requester.transport());
        let id = transport.on_announcement(Arc::new(move |announcement: Announcement| {
            if !accepts(announcement.identity.instance) {
                return;
            }
            if recording.load(Ordering::SeqCst) {
                cache.record(&announcement);
            }
            match sender.try_send(announcement) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(dropped)) => warn!(
                    "Discovery queue full, dropping announcement from {}",
                    dropped.identity
                ),
            }
        }));

        Ok(Discovery {
            receiver: Some(receiver),
            guard: Some(ListenerGuard {
                transport,
                id: Mutex::new(Some(id)),
            }),
            cache: Arc::clone(&self.cache),
            deadline,
            seen: HashSet::new(),
            cancel,
        })
    }

    async fn who_is(&self, target: &Target, range: Option<InstanceRange>) -> Result<()> {
        let request = Request::WhoIs(WhoIsRequest { range });
        self.requester.send_unpaced(target, request).await?;
        Ok(())
    }

    /// Send one Who-Is and listen for `window`
    pub async fn discover(
        &self,
        target: Target,
        range: Option<InstanceRange>,
        window: Duration,
    ) -> Result<Discovery> {
        if window.is_zero() {
            return Ok(Discovery::empty(Arc::clone(&self.cache)));
        }

        let discovery = self.listen(
            move |instance| range.map_or(true, |range| range.contains(instance)),
            Instant::now() + window,
        )?;
        let scope = range.map_or_else(|| "all".to_string(), |range| range.to_string());
        info!("Who-Is {} to {}, listening for {:?}", scope, target, window);
        // On failure the dropped handle removes the listener
        self.who_is(&target, range).await?;
        Ok(discovery)
    }

    /// One ranged Who-Is per range, in order, then listen for `window`.
    ///
    /// Uses the configured common ranges when `ranges` is empty. Cancellation
    /// stops further requests and returns what was heard so far.
    pub async fn sweep(
        &self,
        target: Target,
        ranges: &[InstanceRange],
        window: Duration,
    ) -> Result<Vec<DeviceIdentity>> {
        let ranges: Vec<InstanceRange> = if ranges.is_empty() {
            self.config.sweep_ranges.clone()
        } else {
            ranges.to_vec()
        };
        let accepted = ranges.clone();
        let mut discovery = self.listen(
            move |instance| accepted.iter().any(|range| range.contains(instance)),
            Instant::now() + Duration::from_secs(u64::from(u32::MAX)),
        )?;

        let mut sent = 0;
        for (position, range) in ranges.iter().enumerate() {
            if discovery.cancel.is_cancelled() {
                break;
            }
            if position > 0 {
                tokio::select! {
                    _ = sleep(self.config.inter_range_delay) => {}
                    _ = discovery.cancel.cancelled() => break,
                }
            }
            match self.who_is(&target, Some(*range)).await {
                Ok(()) => sent += 1,
                Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
                Err(e) => warn!("Who-Is {} to {} failed: {}", range, target, e),
            }
        }
        debug!("Sweep of {} sent {} of {} ranges", target, sent, ranges.len());

        discovery.deadline = Instant::now() + window;
        Ok(discovery.collect().await)
    }

    /// Look for one instance; read it directly if it does not announce
    pub async fn locate(
        &self,
        target: Target,
        instance: u32,
        window: Duration,
    ) -> Result<Option<DeviceIdentity>> {
        let range = InstanceRange::single(instance)?;
        let mut discovery = self.discover(target.clone(), Some(range), window).await?;
        if let Some(identity) = discovery.next().await {
            return Ok(Some(identity));
        }

        let Target::Address(address) = target else {
            return Ok(None);
        };
        debug!(
            "Device {} did not announce, trying {} directly",
            instance, address
        );
        let identity = DeviceIdentity::new(instance, address);
        match self
            .requester
            .read_property(
                &identity,
                ObjectIdentifier::device(instance),
                PropertyIdentifier::ObjectName,
                None,
            )
            .await
        {
            Ok(_) => {
                // A summary from an earlier announcement beats the defaults
                self.cache.insert_if_absent(&Announcement {
                    identity: identity.clone(),
                    summary: Default::default(),
                });
                Ok(self.cache.identity(instance).or(Some(identity)))
            }
            Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => Err(e),
            Err(e) => {
                debug!("Direct read of device {} failed: {}", instance, e);
                Ok(None)
            }
        }
    }
}
