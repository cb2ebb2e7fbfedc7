//! Retry and pacing around single requests
//!
//! [`Requester`] is the only path from the engine to the transport for
//! confirmed requests. Each attempt waits for a [`RateLimiter`] permit, runs
//! under its own deadline, and is retried after a fixed backoff only when it
//! timed out. Rejections and malformed replies fail at once.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::time::{sleep, timeout_at, Instant};

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::device::{DeviceIdentity, Target};
use crate::error::{ReconError, Result};
use crate::object::{ObjectIdentifier, PropertyIdentifier, PropertyValue};
use crate::pacing::RateLimiter;
use crate::service::ReadPropertyRequest;
use crate::transport::{Request, Response, Transport, TransportError};

/// One try of a request
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    pub request: Request,
    /// Starting at 1
    pub attempt: u32,
    pub deadline: Instant,
}

/// Paced, retrying request issuer
#[derive(Clone)]
pub struct Requester {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("policy", &self.policy)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Requester {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            cancel,
        }
    }

    /// The same requester observing a different cancellation signal
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Send a confirmed request to `device`, retrying timeouts
    pub async fn send(&self, device: &DeviceIdentity, request: Request) -> Result<Response> {
        self.send_timed(device, request)
            .await
            .map(|(response, _)| response)
    }

    /// Like [`send`](Self::send), also returning the round trip of the
    /// attempt that succeeded (pacing waits excluded)
    pub async fn send_timed(
        &self,
        device: &DeviceIdentity,
        request: Request,
    ) -> Result<(Response, Duration)> {
        let target = device.target();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(ReconError::Cancelled);
            }
            let permit = self.limiter.acquire(device.instance).await?;
            let current = RequestAttempt {
                request: request.clone(),
                attempt,
                deadline: Instant::now() + self.policy.request_timeout,
            };
            trace!(
                "{} to device {} (attempt {}/{})",
                current.request.name(),
                device.instance,
                attempt,
                max_attempts
            );

            let started = Instant::now();
            let outcome = timeout_at(
                current.deadline,
                self.transport.send(&target, current.request),
            )
            .await;
            let round_trip = started.elapsed();
            drop(permit);

            match outcome {
                Ok(Ok(response)) => return Ok((response, round_trip)),
                Ok(Err(e)) if !e.is_retryable() => return Err(e.into()),
                Ok(Err(_)) | Err(_) => {
                    debug!(
                        "{} to device {} timed out (attempt {}/{})",
                        request.name(),
                        device.instance,
                        attempt,
                        max_attempts
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = sleep(self.policy.backoff) => {}
                    _ = self.cancel.cancelled() => return Err(ReconError::Cancelled),
                }
            }
        }

        Err(ReconError::TransportTimeout {
            attempts: max_attempts,
        })
    }

    /// Read one property (or one array element) of an object on `device`
    pub async fn read_property(
        &self,
        device: &DeviceIdentity,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        array_index: Option<u32>,
    ) -> Result<Vec<PropertyValue>> {
        let request = ReadPropertyRequest {
            object_identifier: object,
            property_identifier: property,
            property_array_index: array_index,
        };
        let response = self.send(device, Request::ReadProperty(request)).await?;
        Ok(response.into_property_values()?)
    }

    /// Send once, without pacing or retry. Used for unconfirmed requests.
    pub async fn send_unpaced(&self, target: &Target, request: Request) -> Result<Response> {
        if self.cancel.is_cancelled() {
            return Err(ReconError::Cancelled);
        }
        match timeout_at(
            Instant::now() + self.policy.request_timeout,
            self.transport.send(target, request),
        )
        .await
        {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }
}
