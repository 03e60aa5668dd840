use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::failover::{EndpointFailover, SendOutcome};
use crate::geolocation::GeolocationFix;
use crate::gesture::Activation;
use crate::models::{AlertPayload, AlertRecord, Situation};
use crate::store::AlertStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Preparing,
    LocatingOptional,
    Sending,
    Delivered,
    Pending,
}

/// What the page layer shows. Published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchStatus {
    pub state: DispatchState,
    pub alert_id: Option<Uuid>,
    pub text: String,
    pub durability_degraded: bool,
}

impl DispatchStatus {
    fn idle() -> Self {
        Self {
            state: DispatchState::Idle,
            alert_id: None,
            text: String::new(),
            durability_degraded: false,
        }
    }
}

/// The reporter's inputs, owned by the dispatcher instead of page globals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertForm {
    pub name: String,
    pub situation: Option<Situation>,
    pub message: String,
    pub share_location: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("select a situation before sending an alert")]
    NoSituation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered { record: AlertRecord, endpoint: String },
    /// Not delivered yet. `durable` is false when no store accepted the record.
    Pending { record: AlertRecord, durable: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub still_pending: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub location_timeout: Duration,
    pub share_location_default: bool,
}

pub struct AlertDispatcher {
    form: Mutex<AlertForm>,
    settings: DispatchSettings,
    store: Arc<dyn AlertStore>,
    failover: Arc<EndpointFailover>,
    geolocation: Arc<GeolocationFix>,
    status: watch::Sender<DispatchStatus>,
    // Records no store would take; retried from memory.
    volatile: Mutex<Vec<AlertRecord>>,
    in_flight: Mutex<HashSet<Uuid>>,
    retry_requested: Notify,
}

impl AlertDispatcher {
    pub fn new(
        settings: DispatchSettings,
        store: Arc<dyn AlertStore>,
        failover: Arc<EndpointFailover>,
        geolocation: Arc<GeolocationFix>,
    ) -> Self {
        let (status, _) = watch::channel(DispatchStatus::idle());
        Self {
            form: Mutex::new(AlertForm {
                share_location: settings.share_location_default,
                ..Default::default()
            }),
            settings,
            store,
            failover,
            geolocation,
            status,
            volatile: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            retry_requested: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DispatchStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> DispatchStatus {
        self.status.borrow().clone()
    }

    pub fn failover(&self) -> &EndpointFailover {
        &self.failover
    }

    pub fn form(&self) -> AlertForm {
        lock(&self.form).clone()
    }

    pub fn select_situation(&self, situation: Situation) {
        lock(&self.form).situation = Some(situation);
    }

    pub fn set_name(&self, name: &str) {
        lock(&self.form).name = name.to_string();
    }

    pub fn set_message(&self, message: &str) {
        lock(&self.form).message = message.to_string();
    }

    pub fn set_share_location(&self, share: bool) {
        lock(&self.form).share_location = share;
    }

    /// Clears the form back to its configured defaults.
    pub fn reset_form(&self) {
        *lock(&self.form) = AlertForm {
            share_location: self.settings.share_location_default,
            ..Default::default()
        };
        self.publish(DispatchStatus::idle());
    }

    /// Resolves when a dispatch ended up pending and wants a retry sweep.
    pub async fn retry_requested(&self) {
        self.retry_requested.notified().await
    }

    /// Runs one activation: validate, locate, persist, send.
    pub async fn activate(&self) -> Result<DispatchOutcome, DispatchError> {
        self.transition(DispatchState::Preparing, None, "Preparing alert...");
        let form = self.form();
        let Some(situation) = form.situation else {
            warn!("Activation rejected: no situation selected");
            self.publish(DispatchStatus {
                state: DispatchState::Idle,
                alert_id: None,
                text: DispatchError::NoSituation.to_string(),
                durability_degraded: false,
            });
            return Err(DispatchError::NoSituation);
        };

        let location = if form.share_location {
            self.transition(DispatchState::LocatingOptional, None, "Acquiring location...");
            self.geolocation
                .acquire(true, self.settings.location_timeout)
                .await
        } else {
            None
        };

        let record = AlertRecord::new(&form.name, situation, &form.message, location);
        // Claimed before it becomes visible to a concurrent retry sweep.
        lock(&self.in_flight).insert(record.id);
        let durable = match self.store.append(&record).await {
            Ok(_) => true,
            Err(e) => {
                error!("Alert {} could not be stored locally: {}", record.id, e);
                lock(&self.volatile).push(record.clone());
                false
            }
        };
        info!(
            "Alert {} created ({}, location: {})",
            record.id,
            situation,
            if location.is_some() { "yes" } else { "no" }
        );

        self.publish(DispatchStatus {
            state: DispatchState::Sending,
            alert_id: Some(record.id),
            text: "Sending SOS...".to_string(),
            durability_degraded: !durable,
        });

        let id = record.id;
        let outcome = self.failover.send(&AlertPayload::from(&record)).await;
        // Claim released only once delivery is recorded.
        let outcome = match outcome {
            SendOutcome::Delivered { endpoint, .. } => {
                let record = self.finish_delivery(record, &endpoint).await;
                self.publish(DispatchStatus {
                    state: DispatchState::Delivered,
                    alert_id: Some(record.id),
                    text: delivered_text(&record, &endpoint),
                    durability_degraded: !durable,
                });
                DispatchOutcome::Delivered { record, endpoint }
            }
            SendOutcome::Exhausted { errors } => {
                warn!(
                    "Alert {} pending after {} failed attempts",
                    record.id,
                    errors.len()
                );
                let text = if durable {
                    "No connection. Alert saved and will be resent automatically.".to_string()
                } else {
                    "No connection and local storage failed. Keep this page open; the alert will be retried.".to_string()
                };
                self.publish(DispatchStatus {
                    state: DispatchState::Pending,
                    alert_id: Some(record.id),
                    text,
                    durability_degraded: !durable,
                });
                DispatchOutcome::Pending { record, durable }
            }
        };
        lock(&self.in_flight).remove(&id);

        if matches!(outcome, DispatchOutcome::Pending { .. }) {
            self.retry_requested.notify_one();
        }
        Ok(outcome)
    }

    /// Pending alerts from the store plus any held only in memory.
    pub async fn pending(&self) -> Vec<AlertRecord> {
        let mut pending = self.stored_pending().await;
        pending.extend(lock(&self.volatile).iter().cloned());
        pending
    }

    /// Attempts every pending alert once. One failure does not stop the rest.
    pub async fn retry_pending(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut degraded = false;

        let stored = self.stored_pending().await;
        let held = lock(&self.volatile).clone();
        let candidates = stored
            .into_iter()
            .map(|r| (r, false))
            .chain(held.into_iter().map(|r| (r, true)));

        for (record, in_memory) in candidates {
            let claimed = lock(&self.in_flight).insert(record.id);
            if !claimed {
                continue;
            }
            // The listing is a snapshot; another dispatch may have delivered
            // the record and released its claim since.
            let pending = if in_memory {
                self.held_in_memory(record.id)
            } else {
                self.still_stored_as_pending(record.id).await
            };
            if !pending {
                lock(&self.in_flight).remove(&record.id);
                continue;
            }
            degraded |= in_memory;
            report.attempted += 1;

            let outcome = self.failover.send(&AlertPayload::from(&record)).await;
            match outcome {
                SendOutcome::Delivered { endpoint, .. } => {
                    self.finish_delivery(record.clone(), &endpoint).await;
                    report.delivered += 1;
                }
                SendOutcome::Exhausted { .. } => {
                    self.count_failed_retry(record.id).await;
                    report.still_pending += 1;
                }
            }
            lock(&self.in_flight).remove(&record.id);
        }

        if report.attempted > 0 {
            info!(
                "Retry sweep: {} attempted, {} delivered, {} still pending",
                report.attempted, report.delivered, report.still_pending
            );
        }
        if report.delivered > 0 {
            self.publish(DispatchStatus {
                state: if report.still_pending == 0 {
                    DispatchState::Delivered
                } else {
                    DispatchState::Pending
                },
                alert_id: None,
                text: format!("{} pending alert(s) delivered", report.delivered),
                durability_degraded: degraded,
            });
        }
        report
    }

    /// Turns gesture activations into independent dispatches.
    pub fn spawn_activation_loop(
        self: &Arc<Self>,
        mut activations: mpsc::UnboundedReceiver<Activation>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while activations.recv().await.is_some() {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.activate().await {
                        warn!("Activation ended without an alert: {}", e);
                    }
                });
            }
        })
    }

    async fn finish_delivery(&self, mut record: AlertRecord, endpoint: &str) -> AlertRecord {
        let at = Utc::now();
        let in_memory = {
            let mut volatile = lock(&self.volatile);
            let before = volatile.len();
            volatile.retain(|r| r.id != record.id);
            volatile.len() != before
        };
        if !in_memory {
            if let Err(e) = self.store.mark_delivered(record.id, endpoint, at).await {
                // The alert is out; at worst it is sent again and deduplicated by id.
                error!("Alert {} delivered but not marked locally: {}", record.id, e);
            }
        }
        record.mark_delivered(endpoint, at);
        record
    }

    fn held_in_memory(&self, id: Uuid) -> bool {
        lock(&self.volatile).iter().any(|r| r.id == id)
    }

    async fn stored_pending(&self) -> Vec<AlertRecord> {
        match self.store.list_undelivered().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not list stored pending alerts: {}", e);
                Vec::new()
            }
        }
    }

    /// A read failure counts as pending; resends are deduplicated by id.
    async fn still_stored_as_pending(&self, id: Uuid) -> bool {
        match self.store.get(id).await {
            Ok(Some(record)) => !record.delivered,
            Ok(None) => false,
            Err(e) => {
                warn!("Could not re-read alert {} before retry: {}", id, e);
                true
            }
        }
    }

    async fn count_failed_retry(&self, id: Uuid) {
        let in_memory = {
            let mut volatile = lock(&self.volatile);
            match volatile.iter_mut().find(|r| r.id == id) {
                Some(record) => {
                    record.retry_count = record.retry_count.saturating_add(1);
                    true
                }
                None => false,
            }
        };
        if !in_memory {
            if let Err(e) = self.store.increment_retry(id).await {
                warn!("Could not record retry for alert {}: {}", id, e);
            }
        }
    }

    fn transition(&self, state: DispatchState, alert_id: Option<Uuid>, text: &str) {
        self.publish(DispatchStatus {
            state,
            alert_id,
            text: text.to_string(),
            durability_degraded: false,
        });
    }

    fn publish(&self, status: DispatchStatus) {
        info!("Dispatch state {:?}: {}", status.state, status.text);
        self.status.send_replace(status);
    }
}

fn delivered_text(record: &AlertRecord, endpoint: &str) -> String {
    match &record.location {
        Some(location) => format!(
            "SOS sent via {}. Location accuracy {}m ({}).",
            endpoint,
            location.accuracy_meters.round(),
            location.accuracy_grade()
        ),
        None => format!("SOS sent via {} (no location).", endpoint),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
