//! Object-list enumeration
//!
//! The enumerator retrieves the complete object list of a device through a
//! fixed table of [`Strategy`]s, falling through to the next one only when a
//! strategy fails outright:
//!
//! | Strategy | Requests |
//! |---|---|
//! | `WholeProperty` | one ReadProperty of the whole object-list |
//! | `BatchedMultiProperty` | one ReadPropertyMultiple carrying the object-list |
//! | `IndexedWithSize` | object-list\[0\], then \[1..=size\] concurrently |
//! | `IndexedWithoutSize` | \[1..=cap\] sequentially until too many failures in a row |
//!
//! Which strategies run is decided by the [`DeviceProfile`] the capability
//! probe built. A partially read list is returned as an [`ObjectListResult`]
//! with failed indices; only a device that yields nothing at all is an error.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use log::{debug, error, info, trace, warn};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;

use crate::config::EnumerationConfig;
use crate::device::DeviceIdentity;
use crate::error::{ReconError, Result};
use crate::object::{ObjectIdentifier, PropertyIdentifier, PropertyValue};
use crate::probe::{DeviceProfile, ProbeOutcome};
use crate::retry::Requester;
use crate::service::{PropertyReference, ReadAccessSpecification, ReadPropertyMultipleRequest};
use crate::transport::Request;

/// Ways of reading an object list, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strategy {
    WholeProperty,
    BatchedMultiProperty,
    IndexedWithSize,
    IndexedWithoutSize,
}

impl Strategy {
    /// Strategies worth trying against a device, in the order to try them
    pub fn plan(profile: &DeviceProfile) -> Vec<Strategy> {
        let mut plan = Vec::with_capacity(4);
        if profile.supports_whole_property_read() {
            plan.push(Strategy::WholeProperty);
            plan.push(Strategy::BatchedMultiProperty);
        }
        // A size read by the probe is enough to go index by index, even when
        // its element read failed
        if profile.supports_array_indexing() || profile.object_count().is_some() {
            plan.push(Strategy::IndexedWithSize);
        }
        plan.push(Strategy::IndexedWithoutSize);
        plan
    }

    pub fn is_indexed(self) -> bool {
        matches!(self, Strategy::IndexedWithSize | Strategy::IndexedWithoutSize)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::WholeProperty => "whole-property",
            Strategy::BatchedMultiProperty => "batched-multi-property",
            Strategy::IndexedWithSize => "indexed-with-size",
            Strategy::IndexedWithoutSize => "indexed-without-size",
        };
        f.write_str(name)
    }
}

/// The object list of one device, as far as it could be read
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectListResult {
    pub device: DeviceIdentity,
    /// Unique, in list order
    pub objects: Vec<ObjectIdentifier>,
    /// Identifiers read successfully, duplicates included
    pub success_count: u32,
    /// Indices that could not be read
    pub failed_indices: BTreeSet<u32>,
    pub strategy_used: Strategy,
    /// Index after which reading stopped: where a size-unknown scan gave up,
    /// or the configured bound on a reported size that exceeded it
    pub halted_at: Option<u32>,
    /// Every strategy tried, the successful one last
    pub attempted: Vec<Strategy>,
    /// Cancellation stopped the enumeration early
    pub interrupted: bool,
}

impl ObjectListResult {
    /// No index failed and nothing was cut short
    pub fn is_complete(&self) -> bool {
        self.failed_indices.is_empty() && !self.interrupted
    }
}

/// Keep the first occurrence of every identifier
pub fn dedup_objects(objects: Vec<ObjectIdentifier>) -> Vec<ObjectIdentifier> {
    let mut seen = HashSet::with_capacity(objects.len());
    objects
        .into_iter()
        .filter(|object| seen.insert(*object))
        .collect()
}

#[derive(Debug, Default)]
struct Collected {
    objects: Vec<ObjectIdentifier>,
    success_count: u32,
    failed_indices: BTreeSet<u32>,
    halted_at: Option<u32>,
    interrupted: bool,
}

impl Collected {
    fn from_values(values: Vec<PropertyValue>) -> Result<Self> {
        let objects = values
            .iter()
            .map(|value| {
                value.as_object_identifier().ok_or_else(|| {
                    ReconError::MalformedResponse(format!("object-list holds {:?}", value))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            success_count: objects.len() as u32,
            objects,
            ..Self::default()
        })
    }

    fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::default()
        }
    }
}

type ElementRead = (u32, Result<Vec<PropertyValue>>);

/// Outcomes of concurrent element reads, keyed by index
#[derive(Debug, Default)]
struct IndexedProgress {
    elements: BTreeMap<u32, ObjectIdentifier>,
    abandoned: BTreeSet<u32>,
    interrupted: bool,
    shut_down: bool,
}

impl IndexedProgress {
    fn record(&mut self, instance: u32, joined: std::result::Result<ElementRead, JoinError>) {
        match joined {
            Ok((index, Ok(values))) => match values.first().and_then(PropertyValue::as_object_identifier) {
                Some(object) => {
                    self.elements.insert(index, object);
                }
                None => debug!("Device {} object-list[{}] is not an identifier", instance, index),
            },
            Ok((index, Err(ReconError::Cancelled))) => {
                self.abandoned.insert(index);
                self.interrupted = true;
            }
            Ok((index, Err(ReconError::ShutDown))) => {
                self.abandoned.insert(index);
                self.shut_down = true;
            }
            Ok((index, Err(e))) => debug!("Device {} object-list[{}]: {}", instance, index, e),
            Err(e) => error!("Element read of device {} did not finish: {}", instance, e),
        }
    }
}

/// Reads object lists with the strategy table
#[derive(Debug, Clone)]
pub struct ObjectListEnumerator {
    requester: Requester,
    config: EnumerationConfig,
    concurrency: usize,
}

impl ObjectListEnumerator {
    /// `concurrency` bounds the element reads in flight per device
    pub fn new(requester: Requester, config: EnumerationConfig, concurrency: usize) -> Self {
        Self {
            requester,
            config,
            concurrency: concurrency.max(1),
        }
    }

    pub fn config(&self) -> &EnumerationConfig {
        &self.config
    }

    /// Retrieve the object list of `device`
    pub async fn enumerate(
        &self,
        device: &DeviceIdentity,
        profile: &DeviceProfile,
    ) -> Result<ObjectListResult> {
        if profile.outcome() == ProbeOutcome::Unresponsive {
            return Err(ReconError::DeviceUnresponsive {
                instance: device.instance,
            });
        }
        if self.requester.cancel_token().is_cancelled() {
            return Err(ReconError::Cancelled);
        }

        let plan = Strategy::plan(profile);
        let mut attempted = Vec::with_capacity(plan.len());
        for strategy in plan {
            attempted.push(strategy);
            debug!("Enumerating device {} with {}", device.instance, strategy);
            let run = match strategy {
                Strategy::WholeProperty => self.read_whole(device).await,
                Strategy::BatchedMultiProperty => self.read_batched(device).await,
                Strategy::IndexedWithSize => self.read_indexed(device).await,
                Strategy::IndexedWithoutSize => self.scan_indices(device).await,
            };
            match run {
                Ok(collected) => return Ok(self.finish(device, strategy, attempted, collected)),
                Err(ReconError::Cancelled) => {
                    return Ok(self.finish(device, strategy, attempted, Collected::interrupted()))
                }
                Err(ReconError::ShutDown) => return Err(ReconError::ShutDown),
                Err(e) => debug!("{} failed for device {}: {}", strategy, device.instance, e),
            }
        }

        warn!("No strategy could read the object list of {}", device);
        Err(ReconError::DeviceUnresponsive {
            instance: device.instance,
        })
    }

    fn finish(
        &self,
        device: &DeviceIdentity,
        strategy: Strategy,
        attempted: Vec<Strategy>,
        collected: Collected,
    ) -> ObjectListResult {
        let result = ObjectListResult {
            device: device.clone(),
            objects: dedup_objects(collected.objects),
            success_count: collected.success_count,
            failed_indices: collected.failed_indices,
            strategy_used: strategy,
            halted_at: collected.halted_at,
            attempted,
            interrupted: collected.interrupted,
        };
        if result.interrupted {
            info!(
                "Enumeration of {} cancelled after {} objects",
                device,
                result.objects.len()
            );
        } else {
            info!(
                "Enumerated {}: {} objects with {}, {} failed indices",
                device,
                result.objects.len(),
                strategy,
                result.failed_indices.len()
            );
        }
        result
    }

    async fn read_element(&self, device: &DeviceIdentity, index: u32) -> Result<Vec<PropertyValue>> {
        self.requester
            .read_property(
                device,
                ObjectIdentifier::device(device.instance),
                PropertyIdentifier::ObjectList,
                Some(index),
            )
            .await
    }

    async fn read_whole(&self, device: &DeviceIdentity) -> Result<Collected> {
        let values = self
            .requester
            .read_property(
                device,
                ObjectIdentifier::device(device.instance),
                PropertyIdentifier::ObjectList,
                None,
            )
            .await?;
        Collected::from_values(values)
    }

    async fn read_batched(&self, device: &DeviceIdentity) -> Result<Collected> {
        let object = ObjectIdentifier::device(device.instance);
        let request = ReadPropertyMultipleRequest::new(vec![ReadAccessSpecification::new(
            object,
            vec![PropertyReference::new(PropertyIdentifier::ObjectList)],
        )]);
        let values = self
            .requester
            .send(device, Request::ReadPropertyMultiple(request))
            .await?
            .into_multiple_values(object, PropertyIdentifier::ObjectList)?;
        Collected::from_values(values)
    }

    /// Fails only when the size cannot be read
    async fn read_indexed(&self, device: &DeviceIdentity) -> Result<Collected> {
        let reported = self
            .read_element(device, 0)
            .await?
            .first()
            .and_then(PropertyValue::as_unsigned)
            .ok_or_else(|| ReconError::MalformedResponse("object-list size is not unsigned".to_string()))?;
        let reported = u32::try_from(reported).unwrap_or(u32::MAX);
        let mut size = if self.config.size_includes_index_zero {
            reported.saturating_sub(1)
        } else {
            reported
        };
        debug!("Device {} reports {} objects", device.instance, size);
        let mut halted_at = None;
        if size > self.config.max_reported_size {
            warn!(
                "Device {} reports {} objects, reading only the first {}",
                device.instance, size, self.config.max_reported_size
            );
            size = self.config.max_reported_size;
            halted_at = Some(size);
        }

        let cancel = self.requester.cancel_token().clone();
        let mut tasks: JoinSet<ElementRead> = JoinSet::new();
        let mut progress = IndexedProgress::default();
        let mut issued = 0u32;

        for index in 1..=size {
            if cancel.is_cancelled() {
                progress.interrupted = true;
                break;
            }
            if self.config.throttle_every > 0 && issued > 0 && issued % self.config.throttle_every == 0 {
                trace!("Throttling device {} after {} reads", device.instance, issued);
                sleep(self.config.throttle_pause).await;
            }
            while tasks.len() >= self.concurrency {
                if let Some(joined) = tasks.join_next().await {
                    progress.record(device.instance, joined);
                }
            }
            if progress.shut_down {
                break;
            }

            let requester = self.requester.clone();
            let device = device.clone();
            tasks.spawn(async move {
                let result = requester
                    .read_property(
                        &device,
                        ObjectIdentifier::device(device.instance),
                        PropertyIdentifier::ObjectList,
                        Some(index),
                    )
                    .await;
                (index, result)
            });
            issued = index;
        }
        while let Some(joined) = tasks.join_next().await {
            progress.record(device.instance, joined);
        }

        if progress.shut_down {
            return Err(ReconError::ShutDown);
        }
        let failed_indices = (1..=issued)
            .filter(|index| {
                !progress.elements.contains_key(index) && !progress.abandoned.contains(index)
            })
            .collect();
        Ok(Collected {
            success_count: progress.elements.len() as u32,
            objects: progress.elements.into_values().collect(),
            failed_indices,
            halted_at,
            interrupted: progress.interrupted,
        })
    }

    /// Sequential scan for devices that will not report their list size
    async fn scan_indices(&self, device: &DeviceIdentity) -> Result<Collected> {
        let limit = self.config.consecutive_failure_limit.max(1) as usize;
        let cancel = self.requester.cancel_token();
        let mut collected = Collected::default();
        let mut run = Vec::new();

        for index in 1..=self.config.unknown_size_cap {
            if cancel.is_cancelled() {
                collected.interrupted = true;
                break;
            }
            let object = match self.read_element(device, index).await {
                Ok(values) => values.first().and_then(PropertyValue::as_object_identifier),
                Err(ReconError::Cancelled) => {
                    collected.interrupted = true;
                    break;
                }
                Err(ReconError::ShutDown) => return Err(ReconError::ShutDown),
                Err(e) => {
                    trace!("Device {} object-list[{}]: {}", device.instance, index, e);
                    None
                }
            };

            match object {
                Some(object) => {
                    // Failures followed by a success are holes in the list
                    collected.failed_indices.extend(run.drain(..));
                    collected.objects.push(object);
                    collected.success_count += 1;
                }
                None => {
                    run.push(index);
                    if run.len() >= limit {
                        debug!(
                            "Device {} scan halted at index {} after {} failures in a row",
                            device.instance,
                            index,
                            run.len()
                        );
                        collected.halted_at = Some(index);
                        run.clear();
                        break;
                    }
                }
            }
        }
        // A short run at the cap or at cancellation is not known to be the end
        collected.failed_indices.extend(run);

        if collected.objects.is_empty() && !collected.interrupted {
            return Err(ReconError::DeviceUnresponsive {
                instance: device.instance,
            });
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    use crate::cancel::CancelToken;
    use crate::config::{PacingConfig, RetryPolicy};
    use crate::object::ObjectType;
    use crate::pacing::RateLimiter;
    use crate::transport::sim::{RequestKinds, SimDevice, SimulatedTransport};

    fn enumerator(transport: &SimulatedTransport, config: EnumerationConfig) -> ObjectListEnumerator {
        let requester = Requester::new(
            Arc::new(transport.clone()),
            Arc::new(RateLimiter::new(PacingConfig::default())),
            RetryPolicy::default(),
            CancelToken::new(),
        );
        ObjectListEnumerator::new(requester, config, 3)
    }

    fn add(transport: &SimulatedTransport, device: SimDevice) -> DeviceIdentity {
        let identity = DeviceIdentity::new(device.instance(), device.address().clone());
        transport.add_device(device);
        identity
    }

    fn profile(identity: &DeviceIdentity, whole: bool, indexing: bool) -> DeviceProfile {
        DeviceProfile::builder(identity.clone())
            .whole_property_read(whole)
            .array_indexing(indexing)
            .build()
    }

    fn kinds(transport: &SimulatedTransport, instance: u32) -> Vec<RequestKinds> {
        transport
            .requests_for(instance)
            .iter()
            .map(|logged| RequestKinds::of(&logged.request))
            .collect()
    }

    #[test]
    fn test_plan_follows_profile() {
        let identity = DeviceIdentity::new(1, "10.0.0.1".parse().unwrap());
        assert_eq!(
            Strategy::plan(&profile(&identity, true, true)),
            vec![
                Strategy::WholeProperty,
                Strategy::BatchedMultiProperty,
                Strategy::IndexedWithSize,
                Strategy::IndexedWithoutSize
            ]
        );
        assert_eq!(
            Strategy::plan(&profile(&identity, true, false)),
            vec![
                Strategy::WholeProperty,
                Strategy::BatchedMultiProperty,
                Strategy::IndexedWithoutSize
            ]
        );
        assert_eq!(
            Strategy::plan(&profile(&identity, false, false)),
            vec![Strategy::IndexedWithoutSize]
        );

        // The size was read even though element 1 was not
        let sized = DeviceProfile::builder(identity.clone())
            .whole_property_read(false)
            .array_indexing(false)
            .object_count(Some(20))
            .build();
        assert_eq!(
            Strategy::plan(&sized),
            vec![Strategy::IndexedWithSize, Strategy::IndexedWithoutSize]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_size_survives_failing_runs() {
        let transport = SimulatedTransport::new(1);
        let failing: BTreeSet<u32> = std::iter::once(1).chain(5..=16).collect();
        let identity = add(
            &transport,
            SimDevice::new(213)
                .with_analog_inputs(30)
                .failing_indices(failing.iter().copied())
                .rejecting(RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE),
        );
        let profile = DeviceProfile::builder(identity.clone())
            .whole_property_read(true)
            .array_indexing(false)
            .object_count(Some(31))
            .build();

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile)
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(
            result.attempted,
            vec![
                Strategy::WholeProperty,
                Strategy::BatchedMultiProperty,
                Strategy::IndexedWithSize
            ]
        );
        assert_eq!(result.objects.len(), 18);
        assert_eq!(result.failed_indices, failing);
        assert_eq!(result.halted_at, None);
        assert_eq!(
            result.objects.last(),
            Some(&ObjectIdentifier::new(ObjectType::AnalogInput, 30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_size_is_bounded() {
        let transport = SimulatedTransport::new(1);
        let identity = add(&transport, SimDevice::new(214).with_analog_inputs(11));
        let config = EnumerationConfig {
            max_reported_size: 5,
            ..EnumerationConfig::default()
        };

        let result = enumerator(&transport, config)
            .enumerate(&identity, &profile(&identity, false, true))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(result.objects.len(), 5);
        assert_eq!(result.halted_at, Some(5));
        assert!(result.failed_indices.is_empty());
        // size, then five elements
        assert_eq!(transport.requests_for(214).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_property_read() {
        let transport = SimulatedTransport::new(1);
        let identity = add(&transport, SimDevice::new(200).with_analog_inputs(12));

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, true, true))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::WholeProperty);
        assert_eq!(result.objects.len(), 13);
        assert_eq!(result.objects[0], ObjectIdentifier::device(200));
        assert!(result.is_complete());
        assert_eq!(transport.requests_for(200).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_read_after_whole_read_rejected() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(201)
                .with_analog_inputs(4)
                .rejecting(RequestKinds::WHOLE_LIST),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, true, true))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::BatchedMultiProperty);
        assert_eq!(
            result.attempted,
            vec![Strategy::WholeProperty, Strategy::BatchedMultiProperty]
        );
        assert_eq!(result.objects.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexed_with_size_after_whole_reads_fail() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(202)
                .with_analog_inputs(4)
                .rejecting(RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, true, true))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(result.objects.len(), 5);
        assert_eq!(result.success_count, 5);
        assert!(result.failed_indices.is_empty());
        assert!(result.is_complete());

        let expected: Vec<ObjectIdentifier> = std::iter::once(ObjectIdentifier::device(202))
            .chain((1..=4).map(|i| ObjectIdentifier::new(ObjectType::AnalogInput, i)))
            .collect();
        assert_eq!(result.objects, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_reads_precede_indexed_reads() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(203).with_analog_inputs(4).rejecting(
                RequestKinds::WHOLE_LIST | RequestKinds::READ_MULTIPLE | RequestKinds::LIST_SIZE,
            ),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, true, false))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithoutSize);
        assert_eq!(result.objects.len(), 5);

        let kinds = kinds(&transport, 203);
        assert_eq!(kinds[0], RequestKinds::WHOLE_LIST);
        assert_eq!(kinds[1], RequestKinds::READ_MULTIPLE);
        assert!(kinds[2..].iter().all(|kind| *kind == RequestKinds::LIST_ELEMENT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_indices_are_recorded() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(204).with_analog_inputs(7).failing_indices([3, 6]),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, false, true))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithSize);
        assert_eq!(result.objects.len(), 6);
        assert_eq!(result.failed_indices, BTreeSet::from([3, 6]));
        assert!(!result.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_can_include_index_zero() {
        let transport = SimulatedTransport::new(1);
        let identity = add(&transport, SimDevice::new(205).with_analog_inputs(4));
        let config = EnumerationConfig {
            size_includes_index_zero: true,
            ..EnumerationConfig::default()
        };

        let result = enumerator(&transport, config)
            .enumerate(&identity, &profile(&identity, false, true))
            .await
            .unwrap();
        assert_eq!(result.objects.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_halts_after_consecutive_failures() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(206)
                .with_analog_inputs(4)
                .rejecting(RequestKinds::LIST_SIZE),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, false, false))
            .await
            .unwrap();
        assert_eq!(result.strategy_used, Strategy::IndexedWithoutSize);
        assert_eq!(result.objects.len(), 5);
        assert_eq!(result.halted_at, Some(15));
        assert!(result.failed_indices.is_empty());

        let last = transport.requests_for(206).last().cloned().unwrap();
        match last.request {
            Request::ReadProperty(read) => assert_eq!(read.property_array_index, Some(15)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_records_holes() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(207).with_analog_inputs(6).failing_indices([2, 3]),
        );
        let config = EnumerationConfig {
            consecutive_failure_limit: 3,
            ..EnumerationConfig::default()
        };

        let result = enumerator(&transport, config)
            .enumerate(&identity, &profile(&identity, false, false))
            .await
            .unwrap();
        assert_eq!(result.objects.len(), 5);
        assert_eq!(result.failed_indices, BTreeSet::from([2, 3]));
        assert_eq!(result.halted_at, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_stays_bounded() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(208)
                .with_analog_inputs(29)
                .with_latency(Duration::from_millis(400)),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, false, true))
            .await
            .unwrap();
        assert_eq!(result.objects.len(), 30);
        let peak = transport.peak_in_flight(208);
        assert!((2..=3).contains(&peak), "peak {}", peak);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_device_converges() {
        let transport = SimulatedTransport::new(42);
        let device = SimDevice::new(209)
            .with_analog_inputs(29)
            .with_timeout_rate(0.1);
        let expected = device.objects().to_vec();
        let identity = add(&transport, device);
        let enumerator = enumerator(&transport, EnumerationConfig::default());

        let mut found = BTreeSet::new();
        for _ in 0..3 {
            let result = enumerator
                .enumerate(&identity, &profile(&identity, false, true))
                .await
                .unwrap();
            let unique: HashSet<_> = result.objects.iter().collect();
            assert_eq!(unique.len(), result.objects.len());
            assert!(result.objects.iter().all(|object| expected.contains(object)));
            found.extend(result.objects);
        }
        assert_eq!(found, expected.into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_profile_is_refused() {
        let transport = SimulatedTransport::new(1);
        let identity = add(&transport, SimDevice::new(210));
        let unresponsive = DeviceProfile::builder(identity.clone())
            .outcome(ProbeOutcome::Unresponsive)
            .build();

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &unresponsive)
            .await;
        assert!(matches!(
            result,
            Err(ReconError::DeviceUnresponsive { instance: 210 })
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_is_an_error() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(211).rejecting(
                RequestKinds::WHOLE_LIST
                    | RequestKinds::READ_MULTIPLE
                    | RequestKinds::LIST_SIZE
                    | RequestKinds::LIST_ELEMENT,
            ),
        );

        let result = enumerator(&transport, EnumerationConfig::default())
            .enumerate(&identity, &profile(&identity, true, true))
            .await;
        assert!(matches!(
            result,
            Err(ReconError::DeviceUnresponsive { instance: 211 })
        ));
        // whole, batched, size, then ten element reads
        assert_eq!(transport.requests_for(211).len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let transport = SimulatedTransport::new(1);
        let identity = add(
            &transport,
            SimDevice::new(212)
                .with_analog_inputs(49)
                .with_latency(Duration::from_millis(100)),
        );
        let enumerator = enumerator(&transport, EnumerationConfig::default());
        let cancel = enumerator.requester.cancel_token().clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result = enumerator
            .enumerate(&identity, &profile(&identity, false, true))
            .await
            .unwrap();
        assert!(result.interrupted);
        assert!(!result.is_complete());
        assert!(!result.objects.is_empty());
        assert!(result.objects.len() < 50);
        assert!(result.failed_indices.is_empty());

        // Already cancelled before starting
        let result = enumerator
            .enumerate(&identity, &profile(&identity, false, true))
            .await;
        assert!(matches!(result, Err(ReconError::Cancelled)));
    }

    proptest! {
        #[test]
        fn prop_dedup_keeps_first_occurrences(raw in proptest::collection::vec((0u32..4, 0u32..20), 0..64)) {
            let objects: Vec<ObjectIdentifier> = raw
                .iter()
                .map(|&(object_type, instance)| ObjectIdentifier::from((object_type << 22) | instance))
                .collect();
            let unique = dedup_objects(objects.clone());

            let distinct: HashSet<_> = unique.iter().collect();
            prop_assert_eq!(distinct.len(), unique.len());
            prop_assert!(objects.iter().all(|object| unique.contains(object)));

            let mut first_seen = Vec::new();
            for object in objects {
                if !first_seen.contains(&object) {
                    first_seen.push(object);
                }
            }
            prop_assert_eq!(unique, first_seen);
        }
    }
}
