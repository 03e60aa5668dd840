//! Best-effort location fix, bounded by a timeout.
//!
//! The platform side is a [`LocationSource`] that streams readings. The fix
//! keeps the most accurate reading until one is good enough, enough samples
//! were seen, or time runs out. It never returns an error.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::models::Location;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    Unavailable,
    #[error("platform timed out")]
    Timeout,
}

/// Platform location capability.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Whether the platform can produce readings at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Starts a watch. Dropping the stream stops it.
    async fn watch(&self) -> BoxStream<'static, Result<Location, LocationError>>;
}

/// A platform with no location capability.
pub struct NoLocation;

#[async_trait]
impl LocationSource for NoLocation {
    fn is_available(&self) -> bool {
        false
    }

    async fn watch(&self) -> BoxStream<'static, Result<Location, LocationError>> {
        stream::empty().boxed()
    }
}

/// Always reports the same coordinates; used by hosts that know where they are.
pub struct FixedLocation {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_meters: f64,
}

#[async_trait]
impl LocationSource for FixedLocation {
    async fn watch(&self) -> BoxStream<'static, Result<Location, LocationError>> {
        let reading = Location {
            lat: self.lat,
            lon: self.lon,
            accuracy_meters: self.accuracy_meters,
            captured_at: Utc::now(),
        };
        stream::once(async move { Ok(reading) }).boxed()
    }
}

/// Readings pushed in by the host. Each watch subscribes a fresh channel;
/// readings published while nobody watches are dropped.
#[derive(Clone, Default)]
pub struct ChannelLocation {
    subscribers: Arc<std::sync::Mutex<Vec<mpsc::UnboundedSender<Result<Location, LocationError>>>>>,
}

impl ChannelLocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, reading: Result<Location, LocationError>) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(reading.clone()).is_ok());
    }
}

#[async_trait]
impl LocationSource for ChannelLocation {
    async fn watch(&self) -> BoxStream<'static, Result<Location, LocationError>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixSettings {
    pub target_accuracy_m: f64,
    pub max_samples: u32,
}

impl Default for FixSettings {
    fn default() -> Self {
        Self {
            target_accuracy_m: 5.0,
            max_samples: 8,
        }
    }
}

pub struct GeolocationFix {
    source: Arc<dyn LocationSource>,
    settings: FixSettings,
    // One platform watch at a time, however often the control is pressed.
    in_flight: Semaphore,
}

impl GeolocationFix {
    pub fn new(source: Arc<dyn LocationSource>, settings: FixSettings) -> Self {
        Self {
            source,
            settings,
            in_flight: Semaphore::new(1),
        }
    }

    /// Returns the best reading obtained within `timeout`, or `None`.
    /// Time spent waiting behind another acquisition counts toward the bound.
    pub async fn acquire(&self, opted_in: bool, timeout: Duration) -> Option<Location> {
        if !opted_in {
            return None;
        }
        if !self.source.is_available() {
            info!("No location capability, sending without a fix");
            return None;
        }

        let mut best: Option<Location> = None;
        let sampling = self.sample(&mut best);
        match tokio::time::timeout(timeout, sampling).await {
            Ok(()) => {}
            Err(_) => warn!("Location fix timed out after {:?}", timeout),
        }

        match &best {
            Some(location) => {
                info!("Location fix accuracy {:.1}m", location.accuracy_meters);
                debug!("Location fix {:.6},{:.6}", location.lat, location.lon);
            }
            None => info!("No location fix obtained"),
        }
        best
    }

    async fn sample(&self, best: &mut Option<Location>) {
        let Ok(_permit) = self.in_flight.acquire().await else {
            return;
        };

        let mut readings = self.source.watch().await;
        let mut seen = 0u32;
        while let Some(reading) = readings.next().await {
            match reading {
                Ok(location) => {
                    seen += 1;
                    let better = best
                        .map(|b| location.accuracy_meters < b.accuracy_meters)
                        .unwrap_or(true);
                    if better {
                        *best = Some(location);
                    }
                    debug!("Location sample {} accuracy {:.1}m", seen, location.accuracy_meters);

                    if location.accuracy_meters <= self.settings.target_accuracy_m
                        || seen >= self.settings.max_samples
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Location error: {}", e);
                    return;
                }
            }
        }
    }
}
