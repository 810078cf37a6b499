//! Published driver state
//!
//! The adapter between the acquisition core and whatever control surface
//! embeds it: a typed settings store, a status snapshot published over a
//! watch channel, three array outputs (1-D spectrum, 2-D image, 3-D volume)
//! plus the energy axis, and a broadcast channel for the completion frame.
//!
//! Writes to scalar settings are always accepted and only take effect at
//! the next acquisition start. Analyzer-parameter writes go to the hardware
//! and are refused while a session is running or paused.

use crate::acquisition::accumulators::DetectorFrame;
use crate::client::parameters::ParameterValue;
use crate::client::{ClientError, ClientMetrics, ProdigyClient};
use crate::common::state::DriverState;
use crate::common::{OrdinateRange, Progress, ServerIdentity};
use crate::config::DriverConfig;
use crate::spectrum::{self, AnalyzerSettings, SpectrumDomains, SpectrumShape};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

/// Errors surfaced by the published-state adapter
#[derive(Error, Debug)]
pub enum StoreError {
    /// Analyzer-parameter write attempted while acquiring
    #[error("acquisition busy: analyzer parameters are locked while running or paused")]
    Busy,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Scalar read-backs published alongside the state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Driver-side acquisition state
    pub state: DriverState,
    /// Human-readable reason for the current state
    pub status_message: String,
    /// Transport state
    pub connected: bool,
    /// Server identity from the Connect handshake
    pub server: ServerIdentity,
    /// Validated shape of the current/last session
    pub shape: Option<SpectrumShape>,
    /// Total samples over all iterations of the session
    pub total_samples: usize,
    /// `NumNonEnergyChannels` analyzer parameter, as last read
    pub non_energy_channels: i64,
    /// Ordinate-axis range and units
    pub ordinate: OrdinateRange,
    /// Session progress counters
    pub progress: Progress,
    /// Prodigy-side pause in effect
    pub paused: bool,
    /// Completed protocol exchanges on the connection
    pub messages: u64,
    /// Start time of the current/last session
    pub started_at: Option<DateTime<Utc>>,
    /// Lens-mode and scan-range domains enumerated at connect
    pub domains: SpectrumDomains,
}

/// The driver's published state
pub struct DriverStore {
    settings: RwLock<AnalyzerSettings>,
    status_tx: watch::Sender<StatusSnapshot>,
    spectrum_tx: watch::Sender<Arc<Vec<f64>>>,
    image_tx: watch::Sender<Arc<Vec<f64>>>,
    volume_tx: watch::Sender<Arc<Vec<f64>>>,
    energy_axis_tx: watch::Sender<Arc<Vec<f64>>>,
    frame_tx: broadcast::Sender<DetectorFrame>,
    acquire_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    metrics: RwLock<Option<Arc<ClientMetrics>>>,
}

impl Default for DriverStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverStore {
    /// Create a store with default settings, disconnected
    pub fn new() -> Self {
        let empty = Arc::new(Vec::new());
        let (status_tx, _) = watch::channel(StatusSnapshot {
            status_message: "Not connected".to_string(),
            ..StatusSnapshot::default()
        });
        let (frame_tx, _) = broadcast::channel(16);
        Self {
            settings: RwLock::new(AnalyzerSettings::default()),
            status_tx,
            spectrum_tx: watch::channel(Arc::clone(&empty)).0,
            image_tx: watch::channel(Arc::clone(&empty)).0,
            volume_tx: watch::channel(Arc::clone(&empty)).0,
            energy_axis_tx: watch::channel(empty).0,
            frame_tx,
            acquire_tx: watch::channel(false).0,
            pause_tx: watch::channel(false).0,
            metrics: RwLock::new(None),
        }
    }

    // --- settings -----------------------------------------------------------

    /// Snapshot of the scalar settings
    pub fn settings(&self) -> AnalyzerSettings {
        self.settings.read().unwrap().clone()
    }

    /// Mutate the scalar settings
    ///
    /// Always allowed; a running session keeps the values it started with
    /// and the change applies at the next start.
    pub fn update_settings(&self, f: impl FnOnce(&mut AnalyzerSettings)) {
        f(&mut self.settings.write().unwrap());
    }

    // --- status -------------------------------------------------------------

    /// Current published snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Current driver state
    pub fn state(&self) -> DriverState {
        self.status_tx.borrow().state
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let messages = self
            .metrics
            .read()
            .unwrap()
            .as_ref()
            .map(|m| m.exchanges.load(Ordering::Relaxed))
            .unwrap_or(0);
        self.status_tx.send_modify(|snapshot| {
            snapshot.messages = messages;
            f(snapshot);
        });
    }

    /// Move to a new driver state with a status message
    pub(crate) fn set_state(&self, state: DriverState, message: impl Into<String>) {
        let message = message.into();
        let previous = self.state();
        if previous != state && !previous.can_transition_to(state) {
            warn!(from = %previous, to = %state, "Unexpected state transition");
        }
        if previous != state {
            info!(from = %previous, to = %state, message = %message, "State");
        }
        self.update_status(|snapshot| {
            snapshot.state = state;
            snapshot.status_message = message;
        });
    }

    /// Record a successful connect
    pub fn mark_connected(&self, identity: ServerIdentity, metrics: Arc<ClientMetrics>) {
        *self.metrics.write().unwrap() = Some(metrics);
        self.update_status(|snapshot| {
            snapshot.connected = true;
            snapshot.server = identity;
        });
        self.set_state(DriverState::Idle, "Connected to KREIOS");
    }

    /// Record a lost or closed connection
    pub fn mark_disconnected(&self, reason: impl Into<String>) {
        self.update_status(|snapshot| snapshot.connected = false);
        self.set_state(DriverState::Disconnected, reason);
    }

    /// Publish the enumerated lens-mode/scan-range domains
    pub fn set_domains(&self, domains: SpectrumDomains) {
        self.update_status(|snapshot| snapshot.domains = domains);
    }

    // --- acquisition control ------------------------------------------------

    /// Request an acquisition start; no-op when a session is active
    pub fn start_acquisition(&self) {
        if self.state().is_active() {
            return;
        }
        let _ = self.acquire_tx.send(true);
    }

    /// Request an abort of the current session; idempotent
    pub fn stop_acquisition(&self) {
        let _ = self.acquire_tx.send(false);
    }

    /// Request a Prodigy-side pause or resume; best effort
    pub fn request_pause(&self, pause: bool) {
        let _ = self.pause_tx.send(pause);
    }

    /// Worker-side view of the acquire flag
    pub(crate) fn acquire_flag(&self) -> watch::Receiver<bool> {
        self.acquire_tx.subscribe()
    }

    /// Worker-side view of the pause flag
    pub(crate) fn pause_flag(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    /// Worker acknowledgement that the session ended
    pub(crate) fn clear_acquire(&self) {
        let _ = self.acquire_tx.send(false);
    }

    /// Clear the published pause flag (server rejected or session ended)
    pub(crate) fn clear_pause(&self) {
        let _ = self.pause_tx.send(false);
        self.update_status(|snapshot| snapshot.paused = false);
    }

    // --- connection ---------------------------------------------------------

    /// Re-open the single connection and re-enumerate the analyzer
    ///
    /// Never triggered implicitly: a silent reconnect during an acquisition
    /// would violate the server's single-connection model and lose its
    /// spectrum state, so a reconnect while a session is active is refused.
    pub async fn reconnect(
        &self,
        client: &Mutex<ProdigyClient>,
        config: &DriverConfig,
    ) -> Result<(), StoreError> {
        if self.state().is_active() {
            return Err(StoreError::Busy);
        }
        let mut fresh = ProdigyClient::connect(config).await?;
        fresh.load_parameters().await?;
        match spectrum::read_domains(&mut fresh).await {
            Ok(domains) => self.set_domains(domains),
            Err(e) => warn!(error = %e, "Could not enumerate lens modes / scan ranges"),
        }
        let identity = fresh.identity().clone();
        let metrics = fresh.metrics();
        *client.lock().await = fresh;
        self.mark_connected(identity, metrics);
        Ok(())
    }

    /// Close the connection; refused while a session is active
    pub async fn disconnect(&self, client: &Mutex<ProdigyClient>) -> Result<(), StoreError> {
        if self.state().is_active() {
            return Err(StoreError::Busy);
        }
        client.lock().await.disconnect().await?;
        self.mark_disconnected("Disconnected");
        Ok(())
    }

    // --- analyzer parameters ------------------------------------------------

    /// Write an analyzer parameter through the shared connection
    ///
    /// Refused while the state is Running or Paused; the mirror keeps its
    /// cached value in that case.
    pub async fn set_analyzer_parameter(
        &self,
        client: &Mutex<ProdigyClient>,
        name: &str,
        value: ParameterValue,
    ) -> Result<ParameterValue, StoreError> {
        if self.state().refuses_parameter_writes() {
            return Err(StoreError::Busy);
        }
        let mut client = client.lock().await;
        Ok(client.set_parameter(name, value).await?)
    }

    /// Read an analyzer parameter through the shared connection
    pub async fn get_analyzer_parameter(
        &self,
        client: &Mutex<ProdigyClient>,
        name: &str,
    ) -> Result<ParameterValue, StoreError> {
        let mut client = client.lock().await;
        Ok(client.get_parameter(name).await?)
    }

    // --- arrays -------------------------------------------------------------

    /// Subscribe to 1-D spectrum updates
    pub fn subscribe_spectrum(&self) -> watch::Receiver<Arc<Vec<f64>>> {
        self.spectrum_tx.subscribe()
    }

    /// Subscribe to 2-D image updates
    pub fn subscribe_image(&self) -> watch::Receiver<Arc<Vec<f64>>> {
        self.image_tx.subscribe()
    }

    /// Subscribe to 3-D volume updates
    pub fn subscribe_volume(&self) -> watch::Receiver<Arc<Vec<f64>>> {
        self.volume_tx.subscribe()
    }

    /// Subscribe to energy-axis updates
    pub fn subscribe_energy_axis(&self) -> watch::Receiver<Arc<Vec<f64>>> {
        self.energy_axis_tx.subscribe()
    }

    /// Subscribe to completion frames
    pub fn subscribe_frames(&self) -> broadcast::Receiver<DetectorFrame> {
        self.frame_tx.subscribe()
    }

    /// Latest published spectrum
    pub fn spectrum(&self) -> Arc<Vec<f64>> {
        self.spectrum_tx.borrow().clone()
    }

    /// Latest published image
    pub fn image(&self) -> Arc<Vec<f64>> {
        self.image_tx.borrow().clone()
    }

    /// Latest published volume
    pub fn volume(&self) -> Arc<Vec<f64>> {
        self.volume_tx.borrow().clone()
    }

    /// Latest published energy axis
    pub fn energy_axis(&self) -> Arc<Vec<f64>> {
        self.energy_axis_tx.borrow().clone()
    }

    pub(crate) fn publish_spectrum(&self, data: Arc<Vec<f64>>) {
        let _ = self.spectrum_tx.send(data);
    }

    pub(crate) fn publish_image(&self, data: Arc<Vec<f64>>) {
        let _ = self.image_tx.send(data);
    }

    pub(crate) fn publish_volume(&self, data: Arc<Vec<f64>>) {
        let _ = self.volume_tx.send(data);
    }

    pub(crate) fn publish_energy_axis(&self, data: Arc<Vec<f64>>) {
        let _ = self.energy_axis_tx.send(data);
    }

    pub(crate) fn publish_frame(&self, frame: DetectorFrame) {
        // no receiver is fine; the frame is a notification, not a queue
        let _ = self.frame_tx.send(frame);
    }
}
