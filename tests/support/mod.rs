//! In-process Prodigy server mock for integration tests
//!
//! Speaks the Remote In wire protocol over an ephemeral TCP port: `?HHHH
//! Cmd K:V ...` in, `!HHHH OK[: ...]` / `!HHHH Error: <code> "msg"` out.
//! Acquisition progress is deterministic: every `GetAcquisitionStatus` poll
//! while running advances the acquired-sample counter by a fixed stride, so
//! tests never depend on wall-clock dwell times.
//!
//! Fault injection covers the failure paths the driver must survive: error
//! replies, short data arrays, stale reply IDs and mid-exchange disconnects.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// What the synthetic detector reports at each (slice, sample, pixel)
#[derive(Debug, Clone, Copy)]
pub enum DataPattern {
    /// value == flat index (slice*S*V + sample*V + pixel); exposes mapping bugs
    FlatIndex,
    /// constant intensity; exposes accumulation bugs
    Constant(f64),
    /// reproducible pseudo-random intensities from a per-index seed
    Seeded(u64),
}

/// Scriptable server behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// ValuesPerSample reported by validation (detector pixels)
    pub values_per_sample: usize,
    /// NumberOfSlices reported by validation
    pub slices: usize,
    /// Samples advanced per status poll while running
    pub points_per_poll: usize,
    /// Synthetic data pattern
    pub pattern: DataPattern,
    /// Report this sample count from ValidateSpectrum instead of the
    /// computed one (for the SFAT override scenario)
    pub report_samples: Option<usize>,
    /// Protocol version string in the Connect reply
    pub protocol_version: &'static str,
    /// Token used for the finished controller state
    pub finished_token: &'static str,
    /// Emit one stale reply (wrong ID) before the real reply of the Nth
    /// request (1-based)
    pub stale_reply_at: Option<u64>,
    /// Drop the last element of every data array
    pub short_data: bool,
    /// Reject Pause with error 205
    pub reject_pause: bool,
    /// Close the connection instead of answering the Nth request (1-based)
    pub drop_connection_at: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            values_per_sample: 1,
            slices: 1,
            points_per_poll: 7,
            pattern: DataPattern::FlatIndex,
            report_samples: None,
            protocol_version: "1.22",
            finished_token: "finished",
            stale_reply_at: None,
            short_data: false,
            reject_pause: false,
            drop_connection_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AcqState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
}

#[derive(Debug)]
struct ServerState {
    config: MockConfig,
    requests_seen: u64,
    defined: bool,
    validated: bool,
    samples: usize,
    acq: AcqState,
    /// acquired sample indices, 0..samples*slices
    progress: usize,
    parameters: HashMap<String, (&'static str, String)>,
    /// log of every command name received, in order
    pub command_log: Vec<String>,
}

impl ServerState {
    fn new(config: MockConfig) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert(
            "NumNonEnergyChannels".to_string(),
            ("integer", config.values_per_sample.to_string()),
        );
        parameters.insert(
            "Detector Voltage [V]".to_string(),
            ("double", "1500".to_string()),
        );
        parameters.insert("Bias Voltage [V]".to_string(), ("double", "24".to_string()));
        parameters.insert("Use DLD".to_string(), ("bool", "true".to_string()));
        parameters.insert(
            "Serial Number".to_string(),
            ("string", "KR150-0042".to_string()),
        );
        Self {
            config,
            requests_seen: 0,
            defined: false,
            validated: false,
            samples: 0,
            acq: AcqState::Idle,
            progress: 0,
            parameters,
            command_log: Vec::new(),
        }
    }

    fn total_sample_indices(&self) -> usize {
        self.samples * self.config.slices
    }

    fn value_at(&self, flat: usize) -> f64 {
        match self.config.pattern {
            DataPattern::FlatIndex => flat as f64,
            DataPattern::Constant(c) => c,
            DataPattern::Seeded(seed) => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(flat as u64));
                rng.gen_range(0.0..1000.0)
            }
        }
    }
}

/// Handle to the running mock
#[derive(Clone)]
pub struct MockProdigy {
    state: Arc<Mutex<ServerState>>,
    pub addr: SocketAddr,
}

impl MockProdigy {
    /// Start the mock on an ephemeral port
    pub async fn spawn(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let state = Arc::new(Mutex::new(ServerState::new(config)));

        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            // one client at a time, per the Prodigy contract
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&state_clone);
                serve_connection(stream, state).await;
            }
        });

        Self { state, addr }
    }

    /// Commands received so far, in order
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().unwrap().command_log.clone()
    }

    /// Current value of a device parameter
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .parameters
            .get(name)
            .map(|(_, v)| v.clone())
    }

    /// True once an Abort has been received
    pub fn aborted(&self) -> bool {
        self.state.lock().unwrap().acq == AcqState::Aborted
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, state: Arc<Mutex<ServerState>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let replies = {
            let mut state = state.lock().unwrap();
            match handle_line(&mut state, line.trim()) {
                Some(replies) => replies,
                None => return, // scripted drop
            }
        };
        for reply in replies {
            if write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Parse `Key:Value` tokens, reassembling quoted values that contain spaces
fn parse_args(tokens: &[&str]) -> HashMap<String, String> {
    let mut args = HashMap::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        let Some((key, value)) = token.split_once(':') else {
            i += 1;
            continue;
        };
        let mut value = value.to_string();
        if value.starts_with('"') && !(value.len() > 1 && value.ends_with('"')) {
            while i + 1 < tokens.len() {
                i += 1;
                value.push(' ');
                value.push_str(tokens[i]);
                if tokens[i].ends_with('"') {
                    break;
                }
            }
        }
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1]
                .replace("\\\"", "\"")
                .replace("\\\\", "\\")
        } else {
            value
        };
        args.insert(key.to_string(), value);
        i += 1;
    }
    args
}

fn handle_line(state: &mut ServerState, line: &str) -> Option<Vec<String>> {
    if !line.starts_with('?') || line.len() < 6 {
        return Some(vec!["!FFFF Error: 4 \"Unknown message format.\"".to_string()]);
    }
    let id = &line[1..5];
    let rest = &line[6..];
    let tokens: Vec<&str> = rest.split(' ').filter(|t| !t.is_empty()).collect();
    let Some((&command, arg_tokens)) = tokens.split_first() else {
        return Some(vec![format!(
            "!{} Error: 4 \"Unknown message format.\"",
            id
        )]);
    };
    let args = parse_args(arg_tokens);

    state.requests_seen += 1;
    state.command_log.push(command.to_string());

    if state.config.drop_connection_at == Some(state.requests_seen) {
        return None;
    }

    let mut replies = Vec::new();
    if state.config.stale_reply_at == Some(state.requests_seen) {
        replies.push("!FFFE OK: Leftover:1".to_string());
    }
    replies.push(execute(state, id, command, &args));
    Some(replies)
}

fn execute(
    state: &mut ServerState,
    id: &str,
    command: &str,
    args: &HashMap<String, String>,
) -> String {
    let ok = |payload: &str| {
        if payload.is_empty() {
            format!("!{} OK", id)
        } else {
            format!("!{} OK: {}", id, payload)
        }
    };
    let err = |code: u16, message: &str| format!("!{} Error: {} \"{}\"", id, code, message);

    match command {
        "Connect" => ok(&format!(
            "ServerName:\"Prodigy Mock\" ProtocolVersion:{}",
            state.config.protocol_version
        )),
        "Disconnect" => ok(""),
        "GetAnalyzerVisibleName" => ok("VisibleName:\"KREIOS 150\""),

        "GetAllAnalyzerParameterNames" => {
            let mut names: Vec<&String> = state.parameters.keys().collect();
            names.sort();
            let list = names
                .iter()
                .map(|n| format!("\"{}\"", n))
                .collect::<Vec<_>>()
                .join(",");
            ok(&format!("ParameterNames:[{}]", list))
        }
        "GetAnalyzerParameterInfo" => {
            let name = args.get("ParameterName").cloned().unwrap_or_default();
            match state.parameters.get(&name) {
                Some((value_type, _)) => ok(&format!("ValueType:{}", value_type)),
                None => err(301, &format!("Parameter {} not found.", name)),
            }
        }
        "GetAnalyzerParameterValue" => {
            let name = args.get("ParameterName").cloned().unwrap_or_default();
            match state.parameters.get(&name) {
                Some((_, value)) => ok(&format!("Name:\"{}\" Value:{}", name, value)),
                None => err(301, &format!("Parameter {} not found.", name)),
            }
        }
        "SetAnalyzerParameterValue" => {
            let name = args.get("ParameterName").cloned().unwrap_or_default();
            let value = args.get("Value").cloned().unwrap_or_default();
            match state.parameters.get_mut(&name) {
                Some(entry) => {
                    entry.1 = value;
                    ok("")
                }
                None => err(301, &format!("Parameter {} not found.", name)),
            }
        }

        "GetSpectrumParameterInfo" => match args.get("Name").map(String::as_str) {
            Some("LensMode") => ok("Values:HighMagnification,MediumMagnification,WideAngleMode"),
            Some("ScanRange") => ok("Values:SmallArea,MediumArea,LargeArea"),
            _ => err(101, "Unknown spectrum parameter"),
        },
        "GetSpectrumDataInfo" => ok("Min:-15 Max:15 Units:\"deg\""),

        "DefineSpectrumFAT" | "DefineSpectrumSFAT" | "DefineSpectrumFRR" => {
            let start: f64 = args
                .get("StartEnergy")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            let end: f64 = args
                .get("EndEnergy")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            let step: f64 = args
                .get("StepWidth")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0);
            if step <= 0.0 || end < start {
                return err(201, "Invalid spectrum parameters");
            }
            state.samples = ((end - start) / step + 0.5).floor() as usize + 1;
            state.defined = true;
            state.validated = false;
            ok("")
        }
        "DefineSpectrumFE" => {
            state.samples = args
                .get("Samples")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            state.defined = true;
            state.validated = false;
            ok("")
        }
        "DefineSpectrumLVS" => {
            state.samples = 16;
            state.defined = true;
            state.validated = false;
            ok("")
        }
        "ValidateSpectrum" => {
            if !state.defined {
                return err(202, "No spectrum defined.");
            }
            state.validated = true;
            let samples = state.config.report_samples.unwrap_or(state.samples);
            let mut payload = format!("Samples:{}", samples);
            if state.config.values_per_sample > 1 {
                payload.push_str(&format!(
                    " ValuesPerSample:{}",
                    state.config.values_per_sample
                ));
            }
            if state.config.slices > 1 {
                payload.push_str(&format!(" NumberOfSlices:{}", state.config.slices));
            }
            ok(&payload)
        }
        "ClearSpectrum" => {
            state.progress = 0;
            state.acq = AcqState::Idle;
            ok("")
        }

        "Start" => {
            if !state.validated {
                return err(203, "Spectrum not validated.");
            }
            if state.acq == AcqState::Running {
                return err(204, "Acquisition already running.");
            }
            state.acq = AcqState::Running;
            state.progress = 0;
            ok("")
        }
        "Pause" => {
            if state.config.reject_pause {
                return err(205, "Pause not supported.");
            }
            if state.acq != AcqState::Running {
                return err(205, "No acquisition running.");
            }
            state.acq = AcqState::Paused;
            ok("")
        }
        "Resume" => {
            if state.acq != AcqState::Paused {
                return err(206, "Acquisition not paused.");
            }
            state.acq = AcqState::Running;
            ok("")
        }
        "Abort" => {
            if !matches!(state.acq, AcqState::Running | AcqState::Paused) {
                return err(207, "No acquisition to abort.");
            }
            state.acq = AcqState::Aborted;
            ok("")
        }
        "GetAcquisitionStatus" => {
            // deterministic progression: advance on every poll while running
            if state.acq == AcqState::Running {
                state.progress = (state.progress + state.config.points_per_poll)
                    .min(state.total_sample_indices());
                if state.progress >= state.total_sample_indices() {
                    state.acq = AcqState::Finished;
                }
            }
            let token = match state.acq {
                AcqState::Idle => "idle",
                AcqState::Running => "running",
                AcqState::Paused => "paused",
                AcqState::Finished => state.config.finished_token,
                AcqState::Aborted => "aborted",
            };
            ok(&format!(
                "ControllerState:{} NumberOfAcquiredPoints:{}",
                token, state.progress
            ))
        }
        "GetAcquisitionData" => {
            let from: i64 = args
                .get("FromIndex")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let to: i64 = args
                .get("ToIndex")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            if from < 0 || to < from || to as usize >= state.progress {
                return err(208, "Invalid data range.");
            }
            let v = state.config.values_per_sample;
            let mut values: Vec<String> = ((from as usize * v)..((to as usize + 1) * v))
                .map(|flat| format!("{:.6}", state.value_at(flat)))
                .collect();
            if state.config.short_data {
                values.pop();
            }
            ok(&format!(
                "FromIndex:{} ToIndex:{} Data:[{}]",
                from,
                to,
                values.join(",")
            ))
        }
        "SetSafeState" => ok(""),

        _ => err(101, &format!("Unknown command: {}", command)),
    }
}
