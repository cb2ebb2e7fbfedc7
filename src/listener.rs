//! Unsolicited notification handling
//!
//! The [`NotificationListener`] registers one announcement and one
//! value-change callback on the transport. Both run on the transport's
//! dispatch path, so they never wait: an announcement is recorded in the
//! device cache and offered to a bounded queue, a value change is offered to
//! the caller's channel. Anything that does not fit is dropped with a warning.
//!
//! A pool of workers drains the announcement queue. Each newly heard device
//! is surveyed once (probed, then enumerated) and the [`SurveyReport`] is
//! sent to the caller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cache::DeviceCache;
use crate::cancel::CancelToken;
use crate::config::WorkerConfig;
use crate::device::Announcement;
use crate::enumerate::{ObjectListEnumerator, ObjectListResult};
use crate::error::{ReconError, Result};
use crate::probe::{CapabilityProbe, DeviceProfile};
use crate::transport::{ListenerId, Transport, ValueChange};

/// Everything learned about one announced device
#[derive(Debug)]
pub struct SurveyReport {
    pub announcement: Announcement,
    pub profile: DeviceProfile,
    pub objects: std::result::Result<ObjectListResult, ReconError>,
}

/// Probe followed by enumeration
#[derive(Debug, Clone)]
pub struct Surveyor {
    probe: CapabilityProbe,
    enumerator: ObjectListEnumerator,
}

impl Surveyor {
    pub fn new(probe: CapabilityProbe, enumerator: ObjectListEnumerator) -> Self {
        Self { probe, enumerator }
    }

    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub fn enumerator(&self) -> &ObjectListEnumerator {
        &self.enumerator
    }

    /// Fails only on cancellation or shutdown; device failures are reported
    pub async fn survey(&self, announcement: &Announcement) -> Result<SurveyReport> {
        let identity = &announcement.identity;
        let profile = self
            .probe
            .probe(identity, Some(announcement.summary))
            .await?;
        let objects = match self.enumerator.enumerate(identity, &profile).await {
            Err(e @ (ReconError::Cancelled | ReconError::ShutDown)) => return Err(e),
            objects => objects,
        };
        Ok(SurveyReport {
            announcement: announcement.clone(),
            profile,
            objects,
        })
    }
}

/// Receiving ends handed to the caller by [`NotificationListener::start`]
#[derive(Debug)]
pub struct ListenerChannels {
    pub reports: mpsc::Receiver<SurveyReport>,
    pub value_changes: mpsc::Receiver<ValueChange>,
}

/// Queue-fed worker pool behind the transport callbacks
pub struct NotificationListener {
    transport: Arc<dyn Transport>,
    listener_ids: StdMutex<Vec<ListenerId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    surveyed: Arc<StdMutex<HashSet<u32>>>,
    cancel: CancelToken,
    stopped: AtomicBool,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl NotificationListener {
    /// Register the callbacks and spawn the workers
    ///
    /// Without `auto_survey` announcements are only cached and no worker is
    /// started.
    pub fn start(
        transport: Arc<dyn Transport>,
        cache: Arc<DeviceCache>,
        surveyor: Surveyor,
        config: WorkerConfig,
        queue_capacity: usize,
        cancel: CancelToken,
    ) -> (Self, ListenerChannels) {
        let capacity = queue_capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Announcement>(capacity);
        let (report_tx, report_rx) = mpsc::channel(capacity);
        let (change_tx, change_rx) = mpsc::channel(capacity);
        let auto_survey = config.auto_survey;

        let announcement_id = transport.on_announcement(Arc::new(move |announcement| {
            cache.record(&announcement);
            if !auto_survey {
                return;
            }
            match queue_tx.try_send(announcement) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(dropped)) => warn!(
                    "Survey queue full, dropping announcement from {}",
                    dropped.identity
                ),
            }
        }));
        let change_id = transport.on_value_change(Arc::new(move |change| {
            match change_tx.try_send(change) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(dropped)) => warn!(
                    "Value change queue full, dropping notification from {}",
                    dropped.source_device
                ),
            }
        }));

        let surveyed = Arc::new(StdMutex::new(HashSet::new()));
        let mut workers = Vec::new();
        if auto_survey {
            let queue = Arc::new(Mutex::new(queue_rx));
            for worker in 0..config.pool_size.max(1) {
                workers.push(tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&queue),
                    surveyor.clone(),
                    Arc::clone(&surveyed),
                    report_tx.clone(),
                    cancel.clone(),
                )));
            }
            info!("Started {} survey workers", workers.len());
        }

        let listener = Self {
            transport,
            listener_ids: StdMutex::new(vec![announcement_id, change_id]),
            workers: Mutex::new(workers),
            surveyed,
            cancel,
            stopped: AtomicBool::new(false),
        };
        (
            listener,
            ListenerChannels {
                reports: report_rx,
                value_changes: change_rx,
            },
        )
    }

    /// Instances a worker has taken up so far
    pub fn surveyed(&self) -> Vec<u32> {
        let mut instances: Vec<u32> = self
            .surveyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        instances.sort_unstable();
        instances
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Deregister the callbacks, then wait for the workers to wind down
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = std::mem::take(
            &mut *self
                .listener_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in ids {
            self.transport.remove_listener(id);
        }
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Survey worker ended abnormally: {}", e);
            }
        }
        debug!("Notification listener stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Announcement>>>,
    surveyor: Surveyor,
    surveyed: Arc<StdMutex<HashSet<u32>>>,
    reports: mpsc::Sender<SurveyReport>,
    cancel: CancelToken,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = queue.recv() => next,
            }
        };
        let Some(announcement) = next else {
            break;
        };

        let instance = announcement.identity.instance;
        let first = surveyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance);
        if !first {
            trace!("Worker {} skipping device {}, already surveyed", worker, instance);
            continue;
        }

        debug!("Worker {} surveying {}", worker, announcement.identity);
        let report = match surveyor.survey(&announcement).await {
            Ok(report) => report,
            Err(ReconError::Cancelled | ReconError::ShutDown) => break,
            Err(e) => {
                warn!("Survey of {} failed: {}", announcement.identity, e);
                continue;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = reports.send(report) => {
                if sent.is_err() {
                    trace!("Report receiver gone, worker {} keeps draining", worker);
                }
            }
        }
    }
    debug!("Survey worker {} stopped", worker);
}
