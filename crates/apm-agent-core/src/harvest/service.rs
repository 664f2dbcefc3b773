//! The harvest scheduler service.
//!
//! One service task owns the registration map and reacts to commands from
//! its handle; every registered harvestable gets its own ticker task so a
//! slow harvest for one application never blocks ticks for another. All
//! tickers share a cancellation token and stop together at shutdown,
//! discarding whatever was in flight.

use crate::config::AgentConfig;
use crate::harvest::{HarvestOutcome, HarvestPayload, Harvestable, ReportSender, SendError};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum HarvestCommand {
    AddHarvestable(Arc<dyn Harvestable>),
    RemoveApp(String),
    /// Clears the suspension set by a permanent send failure, typically
    /// after a successful reconnect.
    Resume(String),
    /// Runs one immediate tick for every registered harvestable.
    HarvestNow(oneshot::Sender<()>),
    Shutdown,
}

impl std::fmt::Debug for dyn Harvestable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Harvestable({}/{})", self.app_name(), self.endpoint_name())
    }
}

#[derive(Clone)]
pub struct HarvestHandle {
    tx: mpsc::UnboundedSender<HarvestCommand>,
}

impl HarvestHandle {
    pub fn add_harvestable(
        &self,
        harvestable: Arc<dyn Harvestable>,
    ) -> Result<(), mpsc::error::SendError<HarvestCommand>> {
        self.tx.send(HarvestCommand::AddHarvestable(harvestable))
    }

    pub fn remove_app(
        &self,
        app_name: &str,
    ) -> Result<(), mpsc::error::SendError<HarvestCommand>> {
        self.tx
            .send(HarvestCommand::RemoveApp(app_name.to_string()))
    }

    pub fn resume(&self, app_name: &str) -> Result<(), mpsc::error::SendError<HarvestCommand>> {
        self.tx.send(HarvestCommand::Resume(app_name.to_string()))
    }

    /// Runs one tick for everything registered and waits for completion.
    pub async fn harvest_now(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HarvestCommand::HarvestNow(response_tx))
            .map_err(|e| format!("Failed to send harvest command: {e}"))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive harvest response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<HarvestCommand>> {
        self.tx.send(HarvestCommand::Shutdown)
    }
}

struct Registration {
    endpoint_name: String,
    harvestable: Arc<dyn Harvestable>,
    suspended: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

pub struct HarvestService {
    rx: mpsc::UnboundedReceiver<HarvestCommand>,
    config: Arc<AgentConfig>,
    sender: Arc<dyn ReportSender>,
    cancel: CancellationToken,
    registrations: HashMap<String, Vec<Registration>>,
}

impl HarvestService {
    pub fn new(config: Arc<AgentConfig>, sender: Arc<dyn ReportSender>) -> (Self, HarvestHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = HarvestService {
            rx,
            config,
            sender,
            cancel: CancellationToken::new(),
            registrations: HashMap::new(),
        };
        (service, HarvestHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Harvest service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                HarvestCommand::AddHarvestable(harvestable) => self.add(harvestable),

                HarvestCommand::RemoveApp(app_name) => {
                    if let Some(registrations) = self.registrations.remove(&app_name) {
                        for registration in registrations {
                            registration.ticker.abort();
                        }
                        debug!("Removed harvestables for {}", app_name);
                    }
                }

                HarvestCommand::Resume(app_name) => {
                    if let Some(registrations) = self.registrations.get(&app_name) {
                        for registration in registrations {
                            registration.suspended.store(false, Ordering::Relaxed);
                        }
                        debug!("Resumed harvest for {}", app_name);
                    }
                }

                HarvestCommand::HarvestNow(response_tx) => {
                    self.harvest_now().await;
                    if response_tx.send(()).is_err() {
                        error!("Failed to send harvest response - receiver dropped");
                    }
                }

                HarvestCommand::Shutdown => {
                    debug!("Harvest service shutting down");
                    break;
                }
            }
        }

        // Stop every ticker; in-flight data is discarded, not persisted.
        self.cancel.cancel();
        for registrations in self.registrations.values() {
            for registration in registrations {
                registration.ticker.abort();
            }
        }
        debug!("Harvest service stopped");
    }

    fn add(&mut self, harvestable: Arc<dyn Harvestable>) {
        let app_name = harvestable.app_name().to_string();
        let endpoint_name = harvestable.endpoint_name().to_string();
        let registrations = self.registrations.entry(app_name.clone()).or_default();
        if registrations
            .iter()
            .any(|r| r.endpoint_name == endpoint_name)
        {
            error!(
                "Harvestable already added to the harvest service: {}/{}",
                app_name, endpoint_name
            );
            return;
        }

        let suspended = Arc::new(AtomicBool::new(false));
        let ticker = tokio::spawn(run_ticker(
            harvestable.clone(),
            self.sender.clone(),
            self.config.clone(),
            suspended.clone(),
            self.cancel.child_token(),
        ));
        registrations.push(Registration {
            endpoint_name,
            harvestable,
            suspended,
            ticker,
        });
    }

    async fn harvest_now(&self) {
        for registrations in self.registrations.values() {
            for registration in registrations {
                run_tick(
                    registration.harvestable.as_ref(),
                    self.sender.as_ref(),
                    &self.config,
                    &registration.suspended,
                )
                .await;
            }
        }
    }
}

async fn run_ticker(
    harvestable: Arc<dyn Harvestable>,
    sender: Arc<dyn ReportSender>,
    config: Arc<AgentConfig>,
    suspended: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let period = harvestable.interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        run_tick(harvestable.as_ref(), sender.as_ref(), &config, &suspended).await;
    }
}

/// One tick: drain, send with bounded retries and per-attempt timeout,
/// report the outcome. A suspended harvestable skips its ticks until an
/// explicit resume.
async fn run_tick(
    harvestable: &dyn Harvestable,
    sender: &dyn ReportSender,
    config: &AgentConfig,
    suspended: &AtomicBool,
) {
    if suspended.load(Ordering::Relaxed) {
        debug!(
            "Harvest for {}/{} suspended; skipping tick",
            harvestable.app_name(),
            harvestable.endpoint_name()
        );
        return;
    }

    let payload = harvestable.before_harvest();
    if payload.is_empty() {
        harvestable.after_harvest(HarvestOutcome::Sent);
        return;
    }

    let attempts = config.send_attempts.max(1);
    let mut outcome = HarvestOutcome::TransientFailure;
    for attempt in 0..attempts {
        let send = send_payload(sender, harvestable, &payload);
        match tokio::time::timeout(config.send_timeout, send).await {
            Ok(Ok(())) => {
                outcome = HarvestOutcome::Sent;
                break;
            }
            Ok(Err(e)) if e.is_permanent() => {
                warn!(
                    "Permanent failure sending {} for {}: {}",
                    harvestable.endpoint_name(),
                    harvestable.app_name(),
                    e
                );
                outcome = HarvestOutcome::PermanentFailure;
                break;
            }
            Ok(Err(e)) => {
                warn!(
                    "Transient failure sending {} for {} (attempt {}/{}): {}",
                    harvestable.endpoint_name(),
                    harvestable.app_name(),
                    attempt + 1,
                    attempts,
                    e
                );
            }
            Err(_) => {
                warn!(
                    "Timed out sending {} for {} (attempt {}/{}) after {:?}",
                    harvestable.endpoint_name(),
                    harvestable.app_name(),
                    attempt + 1,
                    attempts,
                    config.send_timeout
                );
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(RETRY_BACKOFF_BASE * 2u32.pow(attempt)).await;
        }
    }

    harvestable.after_harvest(outcome);
    if outcome == HarvestOutcome::PermanentFailure {
        suspended.store(true, Ordering::Relaxed);
        warn!(
            "Suspending harvest for {}/{} until reconnect",
            harvestable.app_name(),
            harvestable.endpoint_name()
        );
    }
}

async fn send_payload(
    sender: &dyn ReportSender,
    harvestable: &dyn Harvestable,
    payload: &HarvestPayload,
) -> Result<(), SendError> {
    match payload {
        HarvestPayload::Metrics(batch) => {
            sender.send_metric_data(harvestable.app_name(), batch).await
        }
        HarvestPayload::Events(batch) => {
            sender
                .send_event_data(harvestable.app_name(), harvestable.endpoint_name(), batch)
                .await
        }
    }
}
