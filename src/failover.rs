use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::payload::{AlertPayload, IntakeAck};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("endpoint answered HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// One POST of an alert body to one URL. Non-success statuses are errors.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &AlertPayload)
        -> Result<TransportResponse, AttemptError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("panic-alert/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: &AlertPayload,
    ) -> Result<TransportResponse, AttemptError> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status.as_u16()));
        }
        // The body is informational only; a failed read does not undo a 2xx.
        let body = resp.text().await.unwrap_or_default();
        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Ordered endpoint list that remembers which entry last succeeded.
#[derive(Debug, Clone)]
pub struct EndpointRing {
    endpoints: Vec<String>,
    preferred: usize,
    sticky: bool,
}

impl EndpointRing {
    pub fn new(endpoints: Vec<String>, sticky: bool) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            preferred: 0,
            sticky,
        })
    }

    /// Priority order, with the last successful endpoint moved to the
    /// front when sticky routing is on.
    pub fn attempt_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.endpoints.len());
        if self.sticky {
            order.push(self.preferred);
        }
        order.extend((0..self.endpoints.len()).filter(|&i| !(self.sticky && i == self.preferred)));
        order
    }

    pub fn promote(&mut self, index: usize) {
        if index < self.endpoints.len() {
            self.preferred = index;
        }
    }

    pub fn get(&self, index: usize) -> &str {
        &self.endpoints[index]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub successes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered {
        endpoint: String,
        response: TransportResponse,
        attempts: usize,
    },
    /// Every endpoint failed. Callers queue the alert for later.
    Exhausted { errors: Vec<(String, AttemptError)> },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

pub struct EndpointFailover {
    ring: Mutex<EndpointRing>,
    health: Mutex<Vec<EndpointHealth>>,
    path: String,
    attempt_timeout: Duration,
    transport: Arc<dyn AlertTransport>,
}

impl EndpointFailover {
    pub fn new(
        ring: EndpointRing,
        path: &str,
        attempt_timeout: Duration,
        transport: Arc<dyn AlertTransport>,
    ) -> Self {
        let health = ring
            .endpoints
            .iter()
            .map(|endpoint| EndpointHealth {
                endpoint: endpoint.clone(),
                ..Default::default()
            })
            .collect();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            ring: Mutex::new(ring),
            health: Mutex::new(health),
            path,
            attempt_timeout,
            transport,
        }
    }

    pub fn health(&self) -> Vec<EndpointHealth> {
        lock(&self.health).clone()
    }

    pub fn preferred_endpoint(&self) -> String {
        let ring = lock(&self.ring);
        ring.get(ring.preferred).to_string()
    }

    /// Tries each endpoint once, in order, until one accepts the alert.
    pub async fn send(&self, payload: &AlertPayload) -> SendOutcome {
        let order = lock(&self.ring).attempt_order();
        let mut errors = Vec::new();

        for (attempt, index) in order.into_iter().enumerate() {
            let endpoint = lock(&self.ring).get(index).to_string();
            let url = format!("{}{}", endpoint.trim_end_matches('/'), self.path);
            debug!("Attempt {} for alert {} via {}", attempt + 1, payload.alert_id, url);

            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.attempt_timeout,
                self.transport.post(&url, payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Timeout(self.attempt_timeout)),
            };
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    self.record(index, latency, None);
                    lock(&self.ring).promote(index);
                    if let Some(ack) = IntakeAck::parse(&response.body) {
                        debug!("Intake ack from {}: {:?}", endpoint, ack);
                    }
                    info!(
                        "Alert {} delivered via {} (HTTP {}, {}ms)",
                        payload.alert_id,
                        endpoint,
                        response.status,
                        latency.as_millis()
                    );
                    return SendOutcome::Delivered {
                        endpoint,
                        response,
                        attempts: attempt + 1,
                    };
                }
                Err(e) => {
                    warn!("Endpoint {} failed for alert {}: {}", endpoint, payload.alert_id, e);
                    self.record(index, latency, Some(&e));
                    errors.push((endpoint, e));
                }
            }
        }

        warn!(
            "All {} endpoints failed for alert {}",
            errors.len(),
            payload.alert_id
        );
        SendOutcome::Exhausted { errors }
    }

    fn record(&self, index: usize, latency: Duration, error: Option<&AttemptError>) {
        let mut health = lock(&self.health);
        if let Some(entry) = health.get_mut(index) {
            entry.last_checked = Some(Utc::now());
            entry.last_latency_ms = Some(latency.as_millis() as u64);
            match error {
                Some(e) => {
                    entry.failures += 1;
                    entry.last_error = Some(e.to_string());
                }
                None => entry.successes += 1,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Status(u16),
        Refused,
        Hang,
        /// Answers 200 after a delay.
        Slow(Duration),
    }

    /// Answers per base URL from a script. Unscripted URLs return 200.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<String>>,
        sent: Mutex<Vec<uuid::Uuid>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set(&self, base: &str, reply: Reply) {
            lock(&self.replies).insert(base.to_string(), reply);
        }

        pub fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        /// How many posts carried the given alert.
        pub fn posts_for(&self, id: uuid::Uuid) -> usize {
            lock(&self.sent).iter().filter(|&&sent| sent == id).count()
        }
    }

    #[async_trait]
    impl AlertTransport for ScriptedTransport {
        async fn post(
            &self,
            url: &str,
            payload: &AlertPayload,
        ) -> Result<TransportResponse, AttemptError> {
            lock(&self.calls).push(url.to_string());
            lock(&self.sent).push(payload.alert_id);
            let reply = lock(&self.replies)
                .iter()
                .find(|(base, _)| url.starts_with(base.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or(Reply::Status(200));

            match reply {
                Reply::Status(code) if (200..300).contains(&code) => Ok(TransportResponse {
                    status: code,
                    body: r#"{"status":"ok"}"#.to_string(),
                }),
                Reply::Status(code) => Err(AttemptError::Status(code)),
                Reply::Refused => Err(AttemptError::Transport("connection refused".into())),
                Reply::Hang => std::future::pending().await,
                Reply::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(TransportResponse {
                        status: 200,
                        body: r#"{"status":"ok"}"#.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedTransport};
    use super::*;
    use crate::models::{AlertRecord, Situation};

    const A: &str = "http://a.example";
    const B: &str = "http://b.example";
    const C: &str = "http://c.example";

    fn failover(transport: Arc<ScriptedTransport>, sticky: bool) -> EndpointFailover {
        let ring = EndpointRing::new(vec![A.into(), B.into(), C.into()], sticky).unwrap();
        EndpointFailover::new(ring, "/api/send_alert", Duration::from_secs(5), transport)
    }

    fn payload() -> AlertPayload {
        AlertPayload::from(&AlertRecord::new("", Situation::PhysicalViolence, "", None))
    }

    #[test]
    fn ring_rejects_empty_list_and_rotates_preferred_first() {
        assert!(EndpointRing::new(vec![], true).is_none());

        let mut ring = EndpointRing::new(vec![A.into(), B.into(), C.into()], true).unwrap();
        assert_eq!(ring.attempt_order(), vec![0, 1, 2]);
        ring.promote(2);
        assert_eq!(ring.attempt_order(), vec![2, 0, 1]);
        ring.promote(9);
        assert_eq!(ring.attempt_order(), vec![2, 0, 1]);

        let mut plain = EndpointRing::new(vec![A.into(), B.into()], false).unwrap();
        plain.promote(1);
        assert_eq!(plain.attempt_order(), vec![0, 1]);
    }

    #[tokio::test]
    async fn falls_through_to_last_endpoint() {
        let transport = ScriptedTransport::new();
        transport.set(A, Reply::Status(500));
        transport.set(B, Reply::Status(500));
        let failover = failover(transport.clone(), true);

        match failover.send(&payload()).await {
            SendOutcome::Delivered {
                endpoint, attempts, ..
            } => {
                assert_eq!(endpoint, C);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
        assert_eq!(
            transport.calls(),
            vec![
                format!("{}/api/send_alert", A),
                format!("{}/api/send_alert", B),
                format!("{}/api/send_alert", C),
            ]
        );
    }

    #[tokio::test]
    async fn all_failing_makes_exactly_one_attempt_each() {
        let transport = ScriptedTransport::new();
        transport.set(A, Reply::Refused);
        transport.set(B, Reply::Status(503));
        transport.set(C, Reply::Refused);
        let failover = failover(transport.clone(), true);

        match failover.send(&payload()).await {
            SendOutcome::Exhausted { errors } => {
                assert_eq!(errors.len(), 3);
                assert_eq!(errors[1], (B.to_string(), AttemptError::Status(503)));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(transport.calls().len(), 3);

        let health = failover.health();
        assert!(health.iter().all(|h| h.failures == 1 && h.successes == 0));
        assert_eq!(health[1].last_error.as_deref(), Some("endpoint answered HTTP 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_endpoint_is_abandoned_after_attempt_timeout() {
        let transport = ScriptedTransport::new();
        transport.set(A, Reply::Hang);
        let failover = failover(transport.clone(), false);

        let started = Instant::now();
        let outcome = failover.send(&payload()).await;
        assert!(outcome.is_delivered());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100));
        assert_eq!(
            failover.health()[0].last_error.as_deref(),
            Some("timed out after 5s")
        );
    }

    #[tokio::test]
    async fn sticky_routing_starts_with_last_success_but_still_falls_back() {
        let transport = ScriptedTransport::new();
        transport.set(A, Reply::Refused);
        let failover = failover(transport.clone(), true);

        assert!(failover.send(&payload()).await.is_delivered());
        assert_eq!(failover.preferred_endpoint(), B);

        transport.set(B, Reply::Refused);
        let outcome = failover.send(&payload()).await;
        match outcome {
            SendOutcome::Delivered { endpoint, .. } => assert_eq!(endpoint, C),
            other => panic!("expected delivery, got {:?}", other),
        }
        let calls = transport.calls();
        // First send: A, B. Second send starts at B, then A, then C.
        assert!(calls[2].starts_with(B));
        assert!(calls[3].starts_with(A));
        assert!(calls[4].starts_with(C));
    }
}
