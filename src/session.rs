//! Process-scoped engine state
//!
//! A [`Session`] owns everything the engine shares between calls: the
//! transport handle, the device cache, the rate limiter, the configuration
//! and the cancellation signal. Nothing is global; two sessions on two
//! transports are fully independent.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bacnet_recon::config::ReconConfig;
//! use bacnet_recon::device::Target;
//! use bacnet_recon::session::Session;
//! use bacnet_recon::transport::sim::{SimDevice, SimulatedTransport};
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> Result<(), bacnet_recon::ReconError> {
//! let network = SimulatedTransport::new(1);
//! network.add_device(SimDevice::new(1200).with_analog_inputs(8));
//!
//! let session = Session::new(Arc::new(network), ReconConfig::default())?;
//! let devices = session
//!     .discover(Target::Broadcast, None, Duration::from_secs(1))
//!     .await?
//!     .collect()
//!     .await;
//! let report = session.survey(&devices[0]).await?;
//! assert_eq!(report.objects?.objects.len(), 9);
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::cache::DeviceCache;
use crate::cancel::CancelToken;
use crate::config::ReconConfig;
use crate::device::{Announcement, DeviceIdentity, InstanceRange, Target};
use crate::discovery::{Discovery, DiscoveryOrchestrator};
use crate::enumerate::{ObjectListEnumerator, ObjectListResult};
use crate::error::{ReconError, Result};
use crate::listener::{ListenerChannels, NotificationListener, SurveyReport, Surveyor};
use crate::object::ObjectIdentifier;
use crate::pacing::RateLimiter;
use crate::probe::{CapabilityProbe, DeviceProfile, ProbeOutcome};
use crate::retry::Requester;
use crate::service::SubscribeCovRequest;
use crate::transport::{Request, Response, Transport};

/// Discovery and enumeration engine bound to one transport
pub struct Session {
    transport: Arc<dyn Transport>,
    config: ReconConfig,
    cache: Arc<DeviceCache>,
    limiter: Arc<RateLimiter>,
    cancel: CancelToken,
    requester: Requester,
    discovery: DiscoveryOrchestrator,
    surveyor: Surveyor,
    listener: Mutex<Option<Arc<NotificationListener>>>,
    next_subscriber: AtomicU32,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.cache.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Session {
    /// Validate `config` and build the engine around `transport`
    pub fn new(transport: Arc<dyn Transport>, config: ReconConfig) -> Result<Self> {
        let cache = Arc::new(DeviceCache::new(config.pacing.shard_count));
        Self::with_cache(transport, config, cache)
    }

    /// Like [`new`](Self::new), sharing an existing device cache
    pub fn with_cache(
        transport: Arc<dyn Transport>,
        config: ReconConfig,
        cache: Arc<DeviceCache>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(config.pacing.clone()));
        let cancel = CancelToken::new();
        let requester = Requester::new(
            Arc::clone(&transport),
            Arc::clone(&limiter),
            config.retry,
            cancel.clone(),
        );
        let discovery = DiscoveryOrchestrator::new(
            requester.clone(),
            Arc::clone(&cache),
            config.discovery.clone(),
        );
        let surveyor = Surveyor::new(
            CapabilityProbe::new(
                requester.clone(),
                Arc::clone(&cache),
                config.probe,
                &config.enumeration,
            ),
            ObjectListEnumerator::new(
                requester.clone(),
                config.enumeration,
                config.pacing.concurrency,
            ),
        );

        Ok(Self {
            transport,
            config,
            cache,
            limiter,
            cancel,
            requester,
            discovery,
            surveyor,
            listener: Mutex::new(None),
            next_subscriber: AtomicU32::new(1),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Cancelled when the session shuts down
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(ReconError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Start listening for unsolicited announcements and value changes
    ///
    /// Newly announced devices are surveyed by the worker pool when
    /// `workers.auto_survey` is set. Can be called once per session.
    pub fn start(&self) -> Result<ListenerChannels> {
        self.ensure_open()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReconError::AlreadyStarted);
        }
        let (listener, channels) = NotificationListener::start(
            Arc::clone(&self.transport),
            Arc::clone(&self.cache),
            self.surveyor.clone(),
            self.config.workers,
            self.config.discovery.event_queue_capacity,
            self.cancel.child(),
        );
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
        // The notification listener now caches every announcement
        self.discovery.set_recording(false);
        info!("Session started");
        Ok(channels)
    }

    /// See [`DiscoveryOrchestrator::discover`]
    pub async fn discover(
        &self,
        target: Target,
        range: Option<InstanceRange>,
        window: Duration,
    ) -> Result<Discovery> {
        self.ensure_open()?;
        self.discovery.discover(target, range, window).await
    }

    /// See [`DiscoveryOrchestrator::sweep`]
    pub async fn sweep(
        &self,
        target: Target,
        ranges: &[InstanceRange],
        window: Duration,
    ) -> Result<Vec<DeviceIdentity>> {
        self.ensure_open()?;
        self.discovery.sweep(target, ranges, window).await
    }

    /// Find one instance at `target` within the configured locate window
    pub async fn locate(&self, target: Target, instance: u32) -> Result<Option<DeviceIdentity>> {
        self.ensure_open()?;
        self.discovery
            .locate(target, instance, self.config.discovery.locate_window)
            .await
    }

    /// Probe a device; an unresponsive device is an error here
    pub async fn probe(&self, device: &DeviceIdentity) -> Result<DeviceProfile> {
        self.ensure_open()?;
        let profile = self.surveyor.probe().probe(device, None).await?;
        if profile.outcome() == ProbeOutcome::Unresponsive {
            return Err(ReconError::DeviceUnresponsive {
                instance: device.instance,
            });
        }
        Ok(profile)
    }

    pub async fn enumerate(
        &self,
        device: &DeviceIdentity,
        profile: &DeviceProfile,
    ) -> Result<ObjectListResult> {
        self.ensure_open()?;
        self.surveyor.enumerator().enumerate(device, profile).await
    }

    /// Probe and enumerate one device
    pub async fn survey(&self, device: &DeviceIdentity) -> Result<SurveyReport> {
        self.ensure_open()?;
        let summary = self
            .cache
            .get(device.instance)
            .map(|cached| cached.summary)
            .unwrap_or_default();
        self.surveyor
            .survey(&Announcement {
                identity: device.clone(),
                summary,
            })
            .await
    }

    /// Ask `device` to report changes of value of `object`
    ///
    /// `lifetime` is in seconds, 0 for indefinite. Notifications arrive on
    /// the `value_changes` channel returned by [`start`](Self::start).
    /// Returns the subscriber process identifier used for the subscription.
    pub async fn subscribe_cov(
        &self,
        device: &DeviceIdentity,
        object: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
    ) -> Result<u32> {
        self.ensure_open()?;
        let process_id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let request = SubscribeCovRequest::new(process_id, object, confirmed, lifetime);
        self.send_subscription(device, request).await?;
        info!(
            "Subscribed to {} on device {} as process {}",
            object, device.instance, process_id
        );
        Ok(process_id)
    }

    /// Cancel a subscription made by [`subscribe_cov`](Self::subscribe_cov)
    pub async fn unsubscribe_cov(
        &self,
        device: &DeviceIdentity,
        object: ObjectIdentifier,
        process_id: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        let request = SubscribeCovRequest::cancellation(process_id, object);
        self.send_subscription(device, request).await?;
        debug!("Cancelled subscription {} on device {}", process_id, device.instance);
        Ok(())
    }

    async fn send_subscription(
        &self,
        device: &DeviceIdentity,
        request: SubscribeCovRequest,
    ) -> Result<()> {
        match self
            .requester
            .send(device, Request::SubscribeCov(request))
            .await?
        {
            Response::Acknowledged => Ok(()),
            other => Err(ReconError::MalformedResponse(format!(
                "expected a SimpleACK to SubscribeCOV, got {:?}",
                other
            ))),
        }
    }

    /// Forget devices not heard from within `max_age`, cached pacing included
    pub fn evict_stale(&self, max_age: chrono::Duration) -> Vec<u32> {
        self.evict_older_than(Utc::now() - max_age)
    }

    /// Forget devices last heard before `cutoff`, cached pacing included
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Vec<u32> {
        let evicted = self.cache.evict_older_than(cutoff);
        for instance in &evicted {
            self.limiter.forget(*instance);
        }
        evicted
    }

    /// Stop issuing requests, stop the workers and release the transport.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down session");
        self.cancel.cancel();
        self.limiter.close();

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
        self.transport.shutdown().await;
        info!("Session shut down, {} devices known", self.cache.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::enumerate::Strategy;
    use crate::object::ObjectType;
    use crate::transport::sim::{RequestKinds, SimDevice, SimulatedTransport};

    fn session(transport: &SimulatedTransport) -> Session {
        Session::new(Arc::new(transport.clone()), ReconConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_then_survey() {
        let transport = SimulatedTransport::new(3);
        transport.add_device(SimDevice::new(400).with_analog_inputs(5));
        transport.add_device(
            SimDevice::new(401)
                .with_analog_inputs(3)
                .rejecting(RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE),
        );
        let session = session(&transport);

        let mut devices = session
            .discover(Target::Broadcast, None, Duration::from_secs(2))
            .await
            .unwrap()
            .collect()
            .await;
        devices.sort_by_key(|device| device.instance);
        assert_eq!(devices.len(), 2);
        assert_eq!(session.cache().len(), 2);

        let report = session.survey(&devices[1]).await.unwrap();
        let objects = report.objects.unwrap();
        assert_eq!(objects.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(objects.objects.len(), 4);

        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_reports_unresponsive_as_error() {
        let transport = SimulatedTransport::new(3);
        let device = SimDevice::new(402).timing_out(RequestKinds::OBJECT_NAME);
        let identity = DeviceIdentity::new(402, device.address().clone());
        transport.add_device(device);

        let result = session(&transport).probe(&identity).await;
        assert!(matches!(
            result,
            Err(ReconError::DeviceUnresponsive { instance: 402 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_once() {
        let transport = SimulatedTransport::new(3);
        let session = session(&transport);
        let _channels = session.start().unwrap();
        assert!(matches!(session.start(), Err(ReconError::AlreadyStarted)));
        assert_eq!(transport.listener_count(), 2);

        session.shutdown().await;
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_final() {
        let transport = SimulatedTransport::new(3);
        let session = session(&transport);
        session.shutdown().await;
        session.shutdown().await;

        assert!(transport.is_shut_down());
        assert!(session.limiter().is_closed());
        assert!(matches!(session.start(), Err(ReconError::ShutDown)));
        assert!(matches!(
            session
                .discover(Target::Broadcast, None, Duration::from_secs(1))
                .await,
            Err(ReconError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_survey_keeps_known_size() {
        let transport = SimulatedTransport::new(3);
        transport.add_device(
            SimDevice::new(405)
                .with_analog_inputs(30)
                .failing_indices(std::iter::once(1).chain(5..=16))
                .rejecting(RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE),
        );
        let session = session(&transport);
        let devices = session
            .discover(Target::Broadcast, None, Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;

        let report = session.survey(&devices[0]).await.unwrap();
        assert_eq!(report.profile.object_count(), Some(31));
        assert!(!report.profile.supports_array_indexing());
        let objects = report.objects.unwrap();
        assert_eq!(objects.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(objects.objects.len(), 18);
        assert_eq!(objects.failed_indices.len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_session_records_announcements_once() {
        let transport = SimulatedTransport::new(3);
        transport.add_device(SimDevice::new(406));
        let mut config = ReconConfig::default();
        config.workers.auto_survey = false;
        let session = Session::new(Arc::new(transport.clone()), config).unwrap();
        let _channels = session.start().unwrap();

        let devices = session
            .discover(Target::Broadcast, None, Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(devices.len(), 1);
        assert_eq!(session.cache().get(406).unwrap().announcements, 1);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_keeps_cached_summary() {
        let transport = SimulatedTransport::new(3);
        let device = SimDevice::new(407).silent();
        let address = device.address().clone();
        transport.add_device(device);
        let session = session(&transport);

        let mut announced = Announcement {
            identity: DeviceIdentity::new(407, address.clone()),
            summary: Default::default(),
        };
        announced.summary.max_apdu = 480;
        session.cache().record(&announced);

        let found = session.locate(Target::Address(address), 407).await.unwrap();
        assert!(found.is_some());
        assert_eq!(session.cache().get(407).unwrap().summary.max_apdu, 480);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_forgets_pacing() {
        let transport = SimulatedTransport::new(3);
        transport.add_device(SimDevice::new(408).with_analog_inputs(2));
        let session = session(&transport);
        let devices = session
            .discover(Target::Broadcast, None, Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;
        session.probe(&devices[0]).await.unwrap();
        assert_eq!(session.limiter().tracked(), 1);

        assert!(session.evict_stale(chrono::Duration::hours(1)).is_empty());
        let evicted = session.evict_older_than(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(evicted, vec![408]);
        assert!(session.cache().is_empty());
        assert_eq!(session.limiter().tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cov_subscription() {
        let transport = SimulatedTransport::new(3);
        let device = SimDevice::new(409).with_analog_inputs(2);
        let identity = DeviceIdentity::new(409, device.address().clone());
        transport.add_device(device);
        let session = session(&transport);
        let object = ObjectIdentifier::new(ObjectType::AnalogInput, 2);

        assert_eq!(
            session.subscribe_cov(&identity, object, true, 0).await.unwrap(),
            1
        );
        assert_eq!(
            session.subscribe_cov(&identity, object, false, 300).await.unwrap(),
            2
        );
        let last = transport.requests_for(409).last().cloned().unwrap();
        assert_eq!(
            last.request,
            Request::SubscribeCov(SubscribeCovRequest::new(2, object, false, 300))
        );

        session.unsubscribe_cov(&identity, object, 1).await.unwrap();
        let last = transport.requests_for(409).last().cloned().unwrap();
        assert_eq!(
            last.request,
            Request::SubscribeCov(SubscribeCovRequest::cancellation(1, object))
        );

        let missing = ObjectIdentifier::new(ObjectType::AnalogInput, 9);
        assert!(matches!(
            session.subscribe_cov(&identity, missing, true, 0).await,
            Err(ReconError::ProtocolRejection(_))
        ));

        session.shutdown().await;
        assert!(matches!(
            session.subscribe_cov(&identity, object, true, 0).await,
            Err(ReconError::ShutDown)
        ));
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = ReconConfig::default();
        config.workers.pool_size = 0;
        let result = Session::new(Arc::new(SimulatedTransport::new(3)), config);
        assert!(matches!(
            result,
            Err(ReconError::Config(ConfigError::Zero { .. }))
        ));
    }
}
