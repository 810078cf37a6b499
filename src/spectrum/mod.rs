//! Spectrum definition and validation
//!
//! Each of the five run modes composes its own `DefineSpectrum<Mode>`
//! command from the current scalar settings; keys belonging to one mode are
//! never sent for another (FRR uses `RetardingRatio`, never `PassEnergy`).
//! `ValidateSpectrum` then fixes the data layout for the next acquisition as
//! the triple (S, V, N): samples per iteration, values per sample, number of
//! slices.

use crate::client::{ClientError, ProdigyClient};
use crate::protocol::{self, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Spectrum acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunMode {
    /// Fixed analyzer transmission
    #[default]
    Fat,
    /// Snapshot fixed analyzer transmission
    Sfat,
    /// Fixed retarding ratio
    Frr,
    /// Fixed energies
    Fe,
    /// Lens voltage scan
    Lvs,
}

impl RunMode {
    /// All run modes, in published enum order
    pub const ALL: [RunMode; 5] = [
        RunMode::Fat,
        RunMode::Sfat,
        RunMode::Frr,
        RunMode::Fe,
        RunMode::Lvs,
    ];

    /// The wire token ("FAT", "SFAT", ...)
    pub fn token(&self) -> &'static str {
        match self {
            RunMode::Fat => "FAT",
            RunMode::Sfat => "SFAT",
            RunMode::Frr => "FRR",
            RunMode::Fe => "FE",
            RunMode::Lvs => "LVS",
        }
    }

    /// The define command for this mode
    pub fn define_command(&self) -> &'static str {
        match self {
            RunMode::Fat => "DefineSpectrumFAT",
            RunMode::Sfat => "DefineSpectrumSFAT",
            RunMode::Frr => "DefineSpectrumFRR",
            RunMode::Fe => "DefineSpectrumFE",
            RunMode::Lvs => "DefineSpectrumLVS",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Analyzer operating mode (published enum; not part of the wire protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperatingMode {
    #[default]
    Spectroscopy,
    Momentum,
    Peem,
}

impl OperatingMode {
    pub const ALL: [OperatingMode; 3] = [
        OperatingMode::Spectroscopy,
        OperatingMode::Momentum,
        OperatingMode::Peem,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            OperatingMode::Spectroscopy => "Spectroscopy",
            OperatingMode::Momentum => "Momentum",
            OperatingMode::Peem => "PEEM",
        }
    }
}

/// Scalar spectrum inputs, consumed at define time
///
/// Writes during a session only change these cached values; they take
/// effect at the next acquisition start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    pub run_mode: RunMode,
    pub operating_mode: OperatingMode,
    pub start_energy: f64,
    pub end_energy: f64,
    pub step_width: f64,
    pub pass_energy: f64,
    pub kinetic_energy: f64,
    pub retarding_ratio: f64,
    /// Dwell time per energy point in seconds
    pub dwell_time: f64,
    /// Sample count for FE mode
    pub samples: u32,
    /// Lens mode token from the server's enumerated list; empty = omit
    pub lens_mode: String,
    /// Scan range token from the server's enumerated list; empty = omit
    pub scan_range: String,
    /// Iterations requested per acquisition
    pub iterations: u32,
    /// Apply the safe state after the session ends
    pub safe_after: bool,
    /// Upper bound on the initial data delay in seconds
    pub data_delay_max_s: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Fat,
            operating_mode: OperatingMode::Spectroscopy,
            start_energy: 0.0,
            end_energy: 0.0,
            step_width: 0.1,
            pass_energy: 20.0,
            kinetic_energy: 0.0,
            retarding_ratio: 1.0,
            dwell_time: 0.1,
            samples: 1,
            lens_mode: String::new(),
            scan_range: String::new(),
            iterations: 1,
            safe_after: true,
            data_delay_max_s: 5.0,
        }
    }
}

/// Validated spectrum shape: the (S, V, N) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumShape {
    /// Energy samples per iteration (S)
    pub samples: usize,
    /// Non-energy values per sample (V)
    pub values_per_sample: usize,
    /// Number of slices (N)
    pub slices: usize,
}

impl SpectrumShape {
    /// Dimensionality of the emitted detector frame
    pub fn ndims(&self) -> usize {
        if self.values_per_sample > 1 && self.slices > 1 {
            3
        } else if self.values_per_sample > 1 {
            2
        } else {
            1
        }
    }

    /// Frame dimensions: (S), (S, V) or (S, V, N)
    pub fn dims(&self) -> Vec<usize> {
        match self.ndims() {
            1 => vec![self.samples],
            2 => vec![self.samples, self.values_per_sample],
            _ => vec![self.samples, self.values_per_sample, self.slices],
        }
    }

    /// Sample-index range of one iteration (energy samples across slices)
    pub fn samples_per_iteration(&self) -> usize {
        self.samples * self.slices
    }

    /// Doubles delivered in one full iteration
    pub fn values_per_iteration(&self) -> usize {
        self.samples * self.values_per_sample * self.slices
    }

    /// A 2-D image accumulator is kept for this shape
    pub fn has_image(&self) -> bool {
        self.ndims() == 2
    }

    /// A 3-D volume accumulator is kept for this shape
    pub fn has_volume(&self) -> bool {
        self.ndims() == 3
    }
}

/// Lens-mode and scan-range domains enumerated from the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumDomains {
    pub lens_modes: Vec<String>,
    pub scan_ranges: Vec<String>,
}

/// SFAT sample count computed locally
///
/// For snapshot mode the server's `Samples` reply is not authoritative; the
/// driver sizes its buffers from the energy window instead.
pub fn sfat_samples(start_energy: f64, end_energy: f64, step_width: f64) -> Option<usize> {
    if step_width <= 0.0 {
        return None;
    }
    let n = ((end_energy - start_energy) / step_width + 0.5).floor() + 1.0;
    if n < 1.0 || !n.is_finite() {
        return None;
    }
    Some(n as usize)
}

fn mode_value(token: &str) -> Value {
    if token.chars().any(|c| c.is_whitespace()) {
        Value::Quoted(token.to_string())
    } else {
        Value::Token(token.to_string())
    }
}

/// Arguments for the mode's define command, in emission order
fn define_args(settings: &AnalyzerSettings) -> Vec<(&'static str, Value)> {
    let mut args: Vec<(&'static str, Value)> = match settings.run_mode {
        RunMode::Fat | RunMode::Sfat => vec![
            ("StartEnergy", Value::Double(settings.start_energy)),
            ("EndEnergy", Value::Double(settings.end_energy)),
            ("StepWidth", Value::Double(settings.step_width)),
            ("PassEnergy", Value::Double(settings.pass_energy)),
            ("DwellTime", Value::Double(settings.dwell_time)),
        ],
        RunMode::Frr => vec![
            ("StartEnergy", Value::Double(settings.start_energy)),
            ("EndEnergy", Value::Double(settings.end_energy)),
            ("StepWidth", Value::Double(settings.step_width)),
            ("RetardingRatio", Value::Double(settings.retarding_ratio)),
            ("DwellTime", Value::Double(settings.dwell_time)),
        ],
        RunMode::Fe => vec![
            ("KineticEnergy", Value::Double(settings.kinetic_energy)),
            ("PassEnergy", Value::Double(settings.pass_energy)),
            ("DwellTime", Value::Double(settings.dwell_time)),
            ("Samples", Value::Integer(settings.samples as i64)),
        ],
        RunMode::Lvs => vec![("DwellTime", Value::Double(settings.dwell_time))],
    };

    if !settings.lens_mode.is_empty() {
        args.push(("LensMode", mode_value(&settings.lens_mode)));
    }
    if !settings.scan_range.is_empty() {
        args.push(("ScanRange", mode_value(&settings.scan_range)));
    }
    args
}

/// Define the spectrum for the current settings and validate it
///
/// On success the returned shape fixes the data layout for the session.
/// Neither a rejected definition nor a failed validation is retried here;
/// the orchestrator decides the session outcome.
pub async fn define_and_validate(
    client: &mut ProdigyClient,
    settings: &AnalyzerSettings,
) -> Result<SpectrumShape, ClientError> {
    let command = settings.run_mode.define_command();
    let args = define_args(settings);
    debug!(command, run_mode = %settings.run_mode, "Defining spectrum");
    client.exchange(command, &args).await?;

    let outcome = client.exchange("ValidateSpectrum", &[]).await?;
    let mut samples: usize = outcome.parse("Samples")?;
    let values_per_sample: usize = outcome.parse_or("ValuesPerSample", 1)?;
    let slices: usize = outcome.parse_or("NumberOfSlices", 1)?;

    if settings.run_mode == RunMode::Sfat {
        if let Some(local) =
            sfat_samples(settings.start_energy, settings.end_energy, settings.step_width)
        {
            if local != samples {
                info!(
                    server = samples,
                    local, "Overriding SFAT sample count with local window calculation"
                );
            }
            samples = local;
        }
    }

    if samples < 1 || values_per_sample < 1 || slices < 1 {
        return Err(ClientError::BadValue {
            field: "Samples/ValuesPerSample/NumberOfSlices".to_string(),
            value: format!("{}/{}/{}", samples, values_per_sample, slices),
        });
    }

    let shape = SpectrumShape {
        samples,
        values_per_sample,
        slices,
    };
    info!(
        samples = shape.samples,
        values_per_sample = shape.values_per_sample,
        slices = shape.slices,
        ndims = shape.ndims(),
        "Spectrum validated"
    );
    Ok(shape)
}

/// Enumerate the lens-mode and scan-range domains
///
/// `GetSpectrumParameterInfo` returns the allowed tokens as a
/// comma-separated `Values` list (bracketed on newer servers).
pub async fn read_domains(client: &mut ProdigyClient) -> Result<SpectrumDomains, ClientError> {
    Ok(SpectrumDomains {
        lens_modes: read_value_domain(client, "LensMode").await?,
        scan_ranges: read_value_domain(client, "ScanRange").await?,
    })
}

async fn read_value_domain(
    client: &mut ProdigyClient,
    name: &str,
) -> Result<Vec<String>, ClientError> {
    let outcome = client
        .exchange(
            "GetSpectrumParameterInfo",
            &[("Name", Value::Token(name.to_string()))],
        )
        .await?;
    let raw = outcome.require("Values")?;
    let values = if raw.trim_start().starts_with('[') {
        protocol::parse_string_array(raw)?
    } else {
        protocol::parse_value_list(raw)
    };
    Ok(values)
}

/// Energy axis published alongside the 1-D spectrum
///
/// FAT/SFAT/FRR scan the window start..end; FE sits at one kinetic energy;
/// LVS has no energy axis, so the sample index is used.
pub fn energy_axis(settings: &AnalyzerSettings, shape: &SpectrumShape) -> Vec<f64> {
    (0..shape.samples)
        .map(|i| match settings.run_mode {
            RunMode::Fat | RunMode::Sfat | RunMode::Frr => {
                settings.start_energy + i as f64 * settings.step_width
            }
            RunMode::Fe => settings.kinetic_energy,
            RunMode::Lvs => i as f64,
        })
        .collect()
}
