//! Acquisition orchestration
//!
//! A single worker task owns the acquisition life cycle: it waits for the
//! acquire flag, then runs one session to termination — clear, define and
//! validate the spectrum, allocate accumulators, and loop iterations of
//! start / poll / read / absorb / publish. Stop and pause requests are
//! watch flags checked after every status poll.
//!
//! The worker never holds the connection mutex across the poll-interval
//! sleep or the initial data delay, so user-side parameter reads stay
//! responsive during a session.

pub mod accumulators;

use crate::client::{ClientError, ProdigyClient};
use crate::common::state::{ControllerState, DriverState};
use crate::common::Progress;
use crate::config::DriverConfig;
use crate::protocol::{ErrorClass, ProtocolError, Value};
use crate::spectrum::{self, AnalyzerSettings};
use crate::store::DriverStore;
use accumulators::Accumulators;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

/// Session failure modes
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The server rejected the spectrum definition or its validation
    #[error("spectrum validation failed: {0}")]
    Validation(String),

    /// The server delivered fewer values than the requested range holds
    #[error("receive short: expected {expected} values, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// `GetAcquisitionStatus` reported the error state
    #[error("controller reported error state")]
    ControllerError,
}

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Finished,
    Aborted,
}

/// The acquisition worker
///
/// Created once at driver startup; `run` loops sessions until shutdown.
pub struct AcquisitionWorker {
    client: Arc<Mutex<ProdigyClient>>,
    store: Arc<DriverStore>,
    config: DriverConfig,
    acquire_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl AcquisitionWorker {
    pub fn new(
        client: Arc<Mutex<ProdigyClient>>,
        store: Arc<DriverStore>,
        config: DriverConfig,
    ) -> Self {
        let acquire_rx = store.acquire_flag();
        let pause_rx = store.pause_flag();
        Self {
            client,
            store,
            config,
            acquire_rx,
            pause_rx,
        }
    }

    /// Run the worker until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Acquisition worker started");
        loop {
            if !*self.acquire_rx.borrow() {
                // keep a terminal failure visible until the next start
                let state = self.store.state();
                if matches!(state, DriverState::Idle | DriverState::Finished) {
                    self.store
                        .set_state(DriverState::Idle, "Waiting for acquire command");
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = self.acquire_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            match self.run_session().await {
                Ok(SessionEnd::Finished) => {
                    self.store
                        .set_state(DriverState::Finished, "Acquisition complete");
                }
                Ok(SessionEnd::Aborted) => {
                    self.store
                        .set_state(DriverState::Aborted, "Acquisition aborted");
                }
                Err(e) => {
                    error!(error = %e, "Acquisition session failed");
                    let lost = matches!(
                        e,
                        AcquisitionError::Client(
                            ClientError::ConnectionLost { .. }
                                | ClientError::NotConnected
                                | ClientError::Protocol(ProtocolError::Framing { .. })
                        )
                    );
                    self.store.set_state(DriverState::Error, e.to_string());
                    if lost {
                        self.store.update_status(|s| s.connected = false);
                    }
                }
            }

            self.store.clear_acquire();
            self.store.clear_pause();
        }
        info!("Acquisition worker stopped");
    }

    /// One session: define, validate, allocate, iterate
    async fn run_session(&mut self) -> Result<SessionEnd, AcquisitionError> {
        let settings = self.store.settings();
        let iterations = settings.iterations.max(1);

        self.store
            .set_state(DriverState::Initializing, "Executing pre-scan...");
        self.store.update_status(|s| {
            s.progress = Progress::default();
            s.shape = None;
            s.paused = false;
            s.started_at = Some(Utc::now());
        });

        let shape = {
            let mut client = self.client.lock().await;

            // the analyzer's own channel count, for cross-checking below
            let reported_channels = match client.get_integer_parameter("NumNonEnergyChannels").await
            {
                Ok(n) => {
                    self.store.update_status(|s| s.non_energy_channels = n);
                    Some(n)
                }
                Err(e) => {
                    warn!(error = %e, "Could not read NumNonEnergyChannels");
                    None
                }
            };

            client.exchange("ClearSpectrum", &[]).await?;

            let shape = spectrum::define_and_validate(&mut client, &settings)
                .await
                .map_err(validation_error)?;

            if let Some(n) = reported_channels {
                if n > 0 && n as usize != shape.values_per_sample {
                    warn!(
                        analyzer = n,
                        validated = shape.values_per_sample,
                        "NumNonEnergyChannels disagrees with validation; trusting validated value"
                    );
                }
            }
            shape
        };

        self.store.update_status(|s| {
            s.shape = Some(shape);
            s.total_samples = shape.samples_per_iteration() * iterations as usize;
        });
        self.store
            .publish_energy_axis(Arc::new(spectrum::energy_axis(&settings, &shape)));
        self.store.set_state(DriverState::Ready, "Spectrum validated");

        let mut acc = Accumulators::new(shape);
        let per_iteration = shape.samples_per_iteration();
        let values_per_sample = shape.values_per_sample;
        let max_samples_per_read = (self.config.max_values_per_read / values_per_sample).max(1);
        let mut paused = false;
        let mut first_data_of_session = true;

        for iteration in 0..iterations {
            // the accumulators carry the running sum, not the server
            {
                let mut client = self.client.lock().await;
                client.exchange("ClearSpectrum", &[]).await?;
                if settings.safe_after {
                    client.exchange("Start", &[]).await?;
                } else {
                    client
                        .exchange("Start", &[("SafeAfter", Value::Bool(false))])
                        .await?;
                }
            }
            info!(iteration, iterations, "Iteration started");
            let mut last_consumed = 0usize;

            loop {
                tokio::time::sleep(self.config.poll_interval()).await;

                if !*self.acquire_rx.borrow() {
                    self.abort_quietly().await;
                    return Ok(SessionEnd::Aborted);
                }

                let pause_requested = *self.pause_rx.borrow();
                if pause_requested != paused {
                    paused = self.apply_pause(pause_requested, paused).await?;
                }

                let status = { self.client.lock().await.acquisition_status().await? };

                if status.acquired_points > last_consumed {
                    if last_consumed == 0 {
                        self.store
                            .set_state(DriverState::Running, "Acquiring data...");
                        if first_data_of_session {
                            first_data_of_session = false;
                            self.initial_data_delay(&settings).await;
                        }
                    }

                    let target = status
                        .acquired_points
                        .min(per_iteration)
                        .min(last_consumed + max_samples_per_read);
                    let values = {
                        self.client
                            .lock()
                            .await
                            .read_data_range(last_consumed, target - 1)
                            .await?
                    };
                    let expected = (target - last_consumed) * values_per_sample;
                    if values.len() < expected {
                        self.abort_quietly().await;
                        return Err(AcquisitionError::ShortRead {
                            expected,
                            received: values.len(),
                        });
                    }

                    acc.absorb(iteration, last_consumed * values_per_sample, &values);
                    last_consumed = target;
                    self.publish_partial(&acc);
                }

                let progress = Progress::compute(
                    iteration,
                    iterations,
                    last_consumed,
                    per_iteration,
                    settings.dwell_time,
                );
                self.store.update_status(|s| s.progress = progress);

                match status.state {
                    ControllerState::Finished if last_consumed >= per_iteration => break,
                    ControllerState::Aborted => return Ok(SessionEnd::Aborted),
                    ControllerState::Error => return Err(AcquisitionError::ControllerError),
                    _ => {}
                }
            }
        }

        self.store
            .update_status(|s| s.progress = Progress::complete(iterations, per_iteration));
        self.publish_partial(&acc);
        self.store.publish_frame(acc.frame());
        Ok(SessionEnd::Finished)
    }

    /// Let the server buffer the first samples, then read the ordinate range
    async fn initial_data_delay(&self, settings: &AnalyzerSettings) {
        let delay = settings
            .dwell_time
            .min(settings.data_delay_max_s)
            .max(0.0);
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        match self.client.lock().await.ordinate_range().await {
            Ok(range) => self.store.update_status(|s| s.ordinate = range),
            Err(e) => warn!(error = %e, "Could not read ordinate range"),
        }
    }

    /// Forward a pause/resume request to the server
    ///
    /// Rejection is not fatal: the state stays Running and the published
    /// pause flag is cleared so the user sees the request did not take.
    async fn apply_pause(&self, requested: bool, current: bool) -> Result<bool, AcquisitionError> {
        let command = if requested { "Pause" } else { "Resume" };
        let result = { self.client.lock().await.exchange(command, &[]).await };
        match result {
            Ok(_) => {
                if requested {
                    self.store.set_state(DriverState::Paused, "Acquisition paused");
                } else {
                    self.store
                        .set_state(DriverState::Running, "Acquiring data...");
                }
                self.store.update_status(|s| s.paused = requested);
                Ok(requested)
            }
            Err(ClientError::Protocol(ProtocolError::Server { code, message })) => {
                warn!(command, code, message = %message, "Pause/resume rejected by server");
                if requested {
                    self.store.clear_pause();
                }
                Ok(current)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort `Abort`; after this the session issues no more requests
    async fn abort_quietly(&self) {
        if let Err(e) = self.client.lock().await.exchange("Abort", &[]).await {
            warn!(error = %e, "Abort command failed");
        }
    }

    fn publish_partial(&self, acc: &Accumulators) {
        self.store
            .publish_spectrum(Arc::new(acc.spectrum().to_vec()));
        if let Some(image) = acc.image() {
            self.store.publish_image(Arc::new(image.to_vec()));
        }
        if let Some(volume) = acc.volume() {
            self.store.publish_volume(Arc::new(volume.to_vec()));
        }
    }
}

/// Map a define/validate failure onto the session error taxonomy
fn validation_error(e: ClientError) -> AcquisitionError {
    match &e {
        ClientError::Protocol(p @ ProtocolError::Server { message, .. })
            if p.class() == ErrorClass::Acquisition =>
        {
            AcquisitionError::Validation(message.clone())
        }
        _ => AcquisitionError::Client(e),
    }
}
