//! Capability probe
//!
//! Diagnoses how a device should be enumerated. The probe walks
//! [`ProbeStep`]s in order, each with its own retries:
//!
//! 1. read the device object-name; failure makes the device unresponsive
//! 2. read object-list[0], the list length
//! 3. read object-list[1], the first element
//! 4. time a series of single reads
//!
//! Only step 1 can end the probe early. Steps 2 and 3 decide whether the
//! device supports indexed reads, and the outcome is `Healthy` when either of
//! them succeeded. The latency estimate, the mean round trip of the sample
//! reads, re-tunes the device's request spacing in the shared
//! [`RateLimiter`](crate::pacing::RateLimiter).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::cache::DeviceCache;
use crate::config::{EnumerationConfig, ProbeConfig};
use crate::device::{CapabilitySummary, DeviceIdentity};
use crate::error::{ReconError, Result};
use crate::object::{ObjectIdentifier, PropertyIdentifier, Segmentation};
use crate::retry::Requester;
use crate::service::ReadPropertyRequest;
use crate::transport::Request;

/// Bytes of an unsegmented object-list reply besides the identifiers
const OBJECT_LIST_OVERHEAD: usize = 16;
/// Encoded size of one object identifier
const OBJECT_IDENTIFIER_SIZE: usize = 5;

/// Diagnostic steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    BasicRead,
    ArraySizeRead,
    ArrayElementRead,
    LatencySample,
}

impl ProbeStep {
    fn next(self) -> Option<Self> {
        match self {
            ProbeStep::BasicRead => Some(ProbeStep::ArraySizeRead),
            ProbeStep::ArraySizeRead => Some(ProbeStep::ArrayElementRead),
            ProbeStep::ArrayElementRead => Some(ProbeStep::LatencySample),
            ProbeStep::LatencySample => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProbeOutcome {
    /// Basic and at least one indexed read worked
    Healthy,
    /// Only the basic read worked
    Degraded,
    /// Not even the basic read worked
    Unresponsive,
}

/// What the probe learned about a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    identity: DeviceIdentity,
    device_name: Option<String>,
    max_apdu: u32,
    segmentation: Segmentation,
    object_count: Option<u32>,
    supports_whole_property_read: bool,
    supports_array_indexing: bool,
    average_latency_ms: f64,
    outcome: ProbeOutcome,
}

impl DeviceProfile {
    pub fn builder(identity: DeviceIdentity) -> DeviceProfileBuilder {
        DeviceProfileBuilder::new(identity)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    pub fn max_apdu(&self) -> u32 {
        self.max_apdu
    }

    pub fn segmentation(&self) -> Segmentation {
        self.segmentation
    }

    /// Number of objects the device reported, when it did
    pub fn object_count(&self) -> Option<u32> {
        self.object_count
    }

    pub fn supports_whole_property_read(&self) -> bool {
        self.supports_whole_property_read
    }

    pub fn supports_array_indexing(&self) -> bool {
        self.supports_array_indexing
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.average_latency_ms
    }

    pub fn outcome(&self) -> ProbeOutcome {
        self.outcome
    }
}

/// Builds a [`DeviceProfile`]; also handy for driving the enumerator directly
#[derive(Debug, Clone)]
pub struct DeviceProfileBuilder {
    profile: DeviceProfile,
}

impl DeviceProfileBuilder {
    /// A healthy profile with protocol defaults and no capabilities
    pub fn new(identity: DeviceIdentity) -> Self {
        let summary = CapabilitySummary::default();
        Self {
            profile: DeviceProfile {
                identity,
                device_name: None,
                max_apdu: summary.max_apdu,
                segmentation: summary.segmentation,
                object_count: None,
                supports_whole_property_read: false,
                supports_array_indexing: false,
                average_latency_ms: 0.0,
                outcome: ProbeOutcome::Healthy,
            },
        }
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.profile.device_name = Some(name.into());
        self
    }

    pub fn summary(mut self, summary: CapabilitySummary) -> Self {
        self.profile.max_apdu = summary.max_apdu;
        self.profile.segmentation = summary.segmentation;
        self
    }

    pub fn object_count(mut self, count: Option<u32>) -> Self {
        self.profile.object_count = count;
        self
    }

    pub fn whole_property_read(mut self, supported: bool) -> Self {
        self.profile.supports_whole_property_read = supported;
        self
    }

    pub fn array_indexing(mut self, supported: bool) -> Self {
        self.profile.supports_array_indexing = supported;
        self
    }

    pub fn average_latency_ms(mut self, latency: f64) -> Self {
        self.profile.average_latency_ms = latency;
        self
    }

    pub fn outcome(mut self, outcome: ProbeOutcome) -> Self {
        self.profile.outcome = outcome;
        self
    }

    pub fn build(self) -> DeviceProfile {
        self.profile
    }
}

/// Whether the whole object-list can come back in one reply
pub fn whole_read_fits(
    transport_reassembles: bool,
    segmentation: Segmentation,
    max_apdu: u32,
    object_count: Option<u32>,
) -> bool {
    if transport_reassembles && segmentation.can_transmit() {
        return true;
    }
    match object_count {
        Some(count) => {
            OBJECT_LIST_OVERHEAD + count as usize * OBJECT_IDENTIFIER_SIZE <= max_apdu as usize
        }
        // Unknown size: try it and let the enumerator fall back
        None => true,
    }
}

/// Runs the diagnostic sequence against one device
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    requester: Requester,
    cache: Arc<DeviceCache>,
    config: ProbeConfig,
    size_includes_index_zero: bool,
}

impl CapabilityProbe {
    pub fn new(
        requester: Requester,
        cache: Arc<DeviceCache>,
        config: ProbeConfig,
        enumeration: &EnumerationConfig,
    ) -> Self {
        Self {
            requester,
            cache,
            config,
            size_includes_index_zero: enumeration.size_includes_index_zero,
        }
    }

    async fn read_list(&self, identity: &DeviceIdentity, index: u32) -> Result<Vec<crate::object::PropertyValue>> {
        self.requester
            .read_property(
                identity,
                ObjectIdentifier::device(identity.instance),
                PropertyIdentifier::ObjectList,
                Some(index),
            )
            .await
    }

    /// Probe `identity`. `summary` is the capability summary of its
    /// announcement, when there was one.
    ///
    /// An unresponsive device is an outcome, not an error; only cancellation
    /// and shutdown fail the call.
    pub async fn probe(
        &self,
        identity: &DeviceIdentity,
        summary: Option<CapabilitySummary>,
    ) -> Result<DeviceProfile> {
        let summary = summary
            .or_else(|| self.cache.get(identity.instance).map(|cached| cached.summary))
            .unwrap_or_default();
        let mut builder = DeviceProfile::builder(identity.clone()).summary(summary);

        let mut size_read = false;
        let mut element_read = false;
        let mut object_count = None;
        let mut step = Some(ProbeStep::BasicRead);

        while let Some(current) = step {
            debug!("Probing device {}: {:?}", identity.instance, current);
            match current {
                ProbeStep::BasicRead => {
                    let read = self
                        .requester
                        .read_property(
                            identity,
                            ObjectIdentifier::device(identity.instance),
                            PropertyIdentifier::ObjectName,
                            None,
                        )
                        .await;
                    match read {
                        Ok(values) => {
                            if let Some(name) = values.first().and_then(|v| v.as_str()) {
                                builder = builder.device_name(name);
                            }
                        }
                        Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
                        Err(e) => {
                            warn!("{} is unresponsive: {}", identity, e);
                            return Ok(builder.outcome(ProbeOutcome::Unresponsive).build());
                        }
                    }
                }
                ProbeStep::ArraySizeRead => match self.read_list(identity, 0).await {
                    Ok(values) => {
                        size_read = true;
                        object_count = values
                            .first()
                            .and_then(|v| v.as_unsigned())
                            .map(|size| u32::try_from(size).unwrap_or(u32::MAX))
                            .map(|size| {
                                if self.size_includes_index_zero {
                                    size.saturating_sub(1)
                                } else {
                                    size
                                }
                            });
                    }
                    Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
                    Err(e) => debug!("Device {} object-list size: {}", identity.instance, e),
                },
                ProbeStep::ArrayElementRead => match self.read_list(identity, 1).await {
                    Ok(_) => element_read = true,
                    Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
                    Err(e) => debug!("Device {} object-list[1]: {}", identity.instance, e),
                },
                ProbeStep::LatencySample => {
                    let indexed = size_read && element_read;
                    let latency = self.sample_latency(identity, indexed, object_count).await?;
                    builder = builder.average_latency_ms(latency);
                }
            }
            step = current.next();
        }

        let supports_array_indexing = size_read && element_read;
        let outcome = if size_read || element_read {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Degraded
        };
        let whole = whole_read_fits(
            self.requester.transport().accepts_segmented_responses(),
            summary.segmentation,
            summary.max_apdu,
            object_count,
        );

        let profile = builder
            .object_count(object_count)
            .array_indexing(supports_array_indexing)
            .whole_property_read(whole)
            .outcome(outcome)
            .build();

        let spacing = self
            .requester
            .limiter()
            .tune(identity.instance, profile.average_latency_ms());
        if profile.average_latency_ms() > self.config.slow_threshold.as_secs_f64() * 1000.0 {
            warn!(
                "{} is slow: mean latency {:.0} ms, spacing {:?}",
                identity,
                profile.average_latency_ms(),
                spacing
            );
        }
        info!(
            "Probed {}: {:?}, {} objects, indexing {}, whole read {}",
            identity,
            profile.outcome(),
            profile
                .object_count()
                .map_or_else(|| "unknown".to_string(), |count| count.to_string()),
            profile.supports_array_indexing(),
            profile.supports_whole_property_read()
        );
        Ok(profile)
    }

    /// Mean round trip of the sample reads that succeeded, pacing waits
    /// excluded. When none succeed the elapsed time is spread over every
    /// sample.
    async fn sample_latency(
        &self,
        identity: &DeviceIdentity,
        indexed: bool,
        object_count: Option<u32>,
    ) -> Result<f64> {
        let samples = self.config.latency_samples;
        if samples == 0 {
            return Ok(0.0);
        }

        let started = Instant::now();
        let mut total = Duration::ZERO;
        let mut succeeded = 0u32;
        for sample in 0..samples {
            let request = match object_count.filter(|count| indexed && *count > 0) {
                Some(count) => ReadPropertyRequest::with_array_index(
                    ObjectIdentifier::device(identity.instance),
                    PropertyIdentifier::ObjectList,
                    1 + sample % count,
                ),
                None => ReadPropertyRequest::new(
                    ObjectIdentifier::device(identity.instance),
                    PropertyIdentifier::ObjectName,
                ),
            };
            match self
                .requester
                .send_timed(identity, Request::ReadProperty(request))
                .await
            {
                Ok((_, round_trip)) => {
                    total += round_trip;
                    succeeded += 1;
                }
                Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
                Err(e) => debug!("Latency sample {} of device {}: {}", sample, identity.instance, e),
            }
        }

        let mean = if succeeded > 0 {
            total.as_secs_f64() * 1000.0 / f64::from(succeeded)
        } else {
            started.elapsed().as_secs_f64() * 1000.0 / f64::from(samples)
        };
        Ok(mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::{PacingConfig, RetryPolicy};
    use crate::pacing::RateLimiter;
    use crate::transport::sim::{RequestKinds, SimDevice, SimulatedTransport};

    fn probe_for(transport: &SimulatedTransport) -> CapabilityProbe {
        let requester = Requester::new(
            Arc::new(transport.clone()),
            Arc::new(RateLimiter::new(PacingConfig::default())),
            RetryPolicy::default(),
            CancelToken::new(),
        );
        CapabilityProbe::new(
            requester,
            Arc::new(DeviceCache::default()),
            ProbeConfig::default(),
            &EnumerationConfig::default(),
        )
    }

    fn add(transport: &SimulatedTransport, device: SimDevice) -> DeviceIdentity {
        let identity = DeviceIdentity::new(device.instance(), device.address().clone());
        transport.add_device(device);
        identity
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_device() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(100).with_name("VAV-3").with_analog_inputs(9),
        );

        let profile = probe_for(&transport).probe(&identity, None).await.unwrap();
        assert_eq!(profile.outcome(), ProbeOutcome::Healthy);
        assert_eq!(profile.device_name(), Some("VAV-3"));
        assert_eq!(profile.object_count(), Some(10));
        assert!(profile.supports_array_indexing());
        assert!(profile.supports_whole_property_read());
        assert_eq!(profile.max_apdu(), 1476);
        // 3 diagnostic reads and 10 samples
        assert_eq!(transport.requests_for(100).len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_read_failure_stops_the_probe() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(101).timing_out(RequestKinds::OBJECT_NAME),
        );

        let profile = probe_for(&transport).probe(&identity, None).await.unwrap();
        assert_eq!(profile.outcome(), ProbeOutcome::Unresponsive);
        // Only the retried name read went out
        assert_eq!(transport.requests_for(101).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexing_failures_only_degrade() {
        let transport = SimulatedTransport::new(1);
        let degraded = add(
            &transport,
            SimDevice::new(102)
                .with_analog_inputs(3)
                .rejecting(RequestKinds::LIST_SIZE | RequestKinds::LIST_ELEMENT),
        );
        let partial = add(
            &transport,
            SimDevice::new(103)
                .with_analog_inputs(3)
                .rejecting(RequestKinds::LIST_SIZE),
        );
        let probe = probe_for(&transport);

        let profile = probe.probe(&degraded, None).await.unwrap();
        assert_eq!(profile.outcome(), ProbeOutcome::Degraded);
        assert!(!profile.supports_array_indexing());
        assert_eq!(profile.object_count(), None);
        // Unknown size is tried optimistically
        assert!(profile.supports_whole_property_read());

        let profile = probe.probe(&partial, None).await.unwrap();
        assert_eq!(profile.outcome(), ProbeOutcome::Healthy);
        assert!(!profile.supports_array_indexing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_read_depends_on_size_and_segmentation() {
        let small = CapabilitySummary {
            max_apdu: 480,
            segmentation: Segmentation::NoSegmentation,
            vendor_id: 0,
        };
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(104).with_analog_inputs(199).with_summary(small),
        );
        let profile = probe_for(&transport).probe(&identity, Some(small)).await.unwrap();
        assert_eq!(profile.max_apdu(), 480);
        assert!(!profile.supports_whole_property_read());

        assert!(whole_read_fits(true, Segmentation::Both, 480, Some(1000)));
        assert!(!whole_read_fits(false, Segmentation::Both, 480, Some(1000)));
        assert!(!whole_read_fits(true, Segmentation::Receive, 480, Some(1000)));
        assert!(whole_read_fits(false, Segmentation::NoSegmentation, 480, Some(90)));
        assert!(whole_read_fits(false, Segmentation::NoSegmentation, 50, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_excludes_pacing_waits() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(106)
                .with_analog_inputs(4)
                .with_latency(Duration::from_millis(10)),
        );
        let probe = probe_for(&transport);

        let started = Instant::now();
        let profile = probe.probe(&identity, None).await.unwrap();
        // Thirteen reads spaced at least 75 ms apart
        assert!(started.elapsed() >= Duration::from_millis(900));
        let latency = profile.average_latency_ms();
        assert!((10.0..20.0).contains(&latency), "latency {}", latency);
        assert_eq!(
            probe.requester.limiter().spacing(106),
            Duration::from_millis(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_tunes_spacing() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(105)
                .with_analog_inputs(4)
                .with_latency(Duration::from_millis(200)),
        );
        let probe = probe_for(&transport);

        let profile = probe.probe(&identity, None).await.unwrap();
        let latency = profile.average_latency_ms();
        assert!((200.0..210.0).contains(&latency), "latency {}", latency);
        assert_eq!(
            probe.requester.limiter().spacing(105),
            Duration::from_millis(100)
        );

        // Samples cycle over list elements once indexing works
        let sampled: Vec<Option<u32>> = transport.requests_for(105)[3..]
            .iter()
            .map(|logged| match &logged.request {
                Request::ReadProperty(read) => read.property_array_index,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sampled[..6], [Some(1), Some(2), Some(3), Some(4), Some(5), Some(1)]);
    }
}
