use crate::instrument_link::{InstrumentLink, LinkError};
use crate::sequencer::CaptureScope;
use polars::prelude::*;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

/// Largest window `:WAV:DATA?` returns in BYTE format.
const MAX_POINTS_PER_READ: usize = 250_000;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const ARM_POLL_INTERVAL: Duration = Duration::from_millis(10);
const TIME_COLUMN_NAME: &str = "time";

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Channel {channel} does not exist (1-4)")]
    InvalidChannel { channel: u8 },

    #[error("Unrecognised trigger status '{reply}'")]
    Status { reply: String },

    #[error("Malformed waveform preamble '{reply}'")]
    Preamble { reply: String },

    #[error("Malformed waveform block: {0}")]
    Block(String),

    #[error("Scope {scope} still reports STOP {waited:?} after :SING")]
    NotArmed { scope: String, waited: Duration },
}

/// Reply of `:TRIG:STAT?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Triggered,
    Waiting,
    Running,
    Auto,
    Stopped,
}

impl FromStr for TriggerStatus {
    type Err = ScopeError;

    fn from_str(reply: &str) -> Result<Self, Self::Err> {
        match reply.trim().to_ascii_uppercase().as_str() {
            "TD" => Ok(Self::Triggered),
            "WAIT" => Ok(Self::Waiting),
            "RUN" => Ok(Self::Running),
            "AUTO" => Ok(Self::Auto),
            "STOP" => Ok(Self::Stopped),
            _ => Err(ScopeError::Status {
                reply: reply.to_string(),
            }),
        }
    }
}

/// Scaling information returned by `:WAV:PRE?`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preamble {
    pub format: u8,
    pub kind: u8,
    pub points: usize,
    pub count: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl Preamble {
    pub fn parse(reply: &str) -> Result<Self, ScopeError> {
        let malformed = || ScopeError::Preamble {
            reply: reply.to_string(),
        };
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        if fields.len() != 10 {
            return Err(malformed());
        }

        let float = |i: usize| fields[i].parse::<f64>().map_err(|_| malformed());
        let integer = |i: usize| fields[i].parse::<u64>().map_err(|_| malformed());
        let byte = |i: usize| u8::try_from(integer(i)?).map_err(|_| malformed());

        Ok(Self {
            format: byte(0)?,
            kind: byte(1)?,
            points: usize::try_from(integer(2)?).map_err(|_| malformed())?,
            count: u32::try_from(integer(3)?).map_err(|_| malformed())?,
            x_increment: float(4)?,
            x_origin: float(5)?,
            x_reference: float(6)?,
            y_increment: float(7)?,
            y_origin: float(8)?,
            y_reference: float(9)?,
        })
    }

    pub fn raw_to_volts(&self, raw: u8) -> f64 {
        (f64::from(raw) - self.y_reference) * self.y_increment + self.y_origin
    }

    pub fn sample_time(&self, index: usize) -> f64 {
        (index as f64 - self.x_reference) * self.x_increment + self.x_origin
    }

    pub fn scale(&self, channel: u8, raw: &[u8]) -> ChannelTrace {
        ChannelTrace {
            channel,
            time: (0..raw.len()).map(|i| self.sample_time(i)).collect(),
            volts: raw.iter().map(|&r| self.raw_to_volts(r)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTrace {
    pub channel: u8,
    pub time: Vec<f64>,
    pub volts: Vec<f64>,
}

impl ChannelTrace {
    pub fn column_name(&self) -> String {
        format!("CH{}", self.channel)
    }
}

/// Everything one scope recorded for one shot.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCapture {
    pub scope: String,
    pub traces: Vec<ChannelTrace>,
}

impl ScopeCapture {
    pub fn trace(&self, channel: u8) -> Option<&ChannelTrace> {
        self.traces.iter().find(|t| t.channel == channel)
    }

    /// One `time` column taken from the first trace plus one `CHn` column per trace.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let Some(first) = self.traces.first() else {
            return Ok(DataFrame::empty());
        };

        let mut columns: Vec<Column> =
            vec![Series::new(TIME_COLUMN_NAME.into(), first.time.as_slice()).into()];
        for trace in &self.traces {
            columns.push(Series::new(trace.column_name().into(), trace.volts.as_slice()).into());
        }
        DataFrame::new(columns)
    }

    /// Minimum and maximum voltage of every channel.
    pub fn channel_extrema(&self) -> Result<Vec<(u8, f64, f64)>, PolarsError> {
        if self.traces.is_empty() {
            return Ok(Vec::new());
        }

        let exprs: Vec<Expr> = self
            .traces
            .iter()
            .flat_map(|t| {
                let name = t.column_name();
                [
                    col(name.as_str()).min().alias(format!("{name}_min")),
                    col(name.as_str()).max().alias(format!("{name}_max")),
                ]
            })
            .collect();
        let summary = self.to_dataframe()?.lazy().select(exprs).collect()?;

        self.traces
            .iter()
            .map(|t| -> Result<(u8, f64, f64), PolarsError> {
                let name = t.column_name();
                let min = summary.column(&format!("{name}_min"))?.f64()?.get(0);
                let max = summary.column(&format!("{name}_max"))?.f64()?.get(0);
                Ok((t.channel, min.unwrap_or(f64::NAN), max.unwrap_or(f64::NAN)))
            })
            .collect()
    }
}

/// Read one IEEE 488.2 definite-length block (`#<n><len><data>`) plus its trailing newline.
fn read_tmc_block<L: InstrumentLink>(link: &mut L) -> Result<Vec<u8>, ScopeError> {
    let header = link.read_exact(2, BLOCK_TIMEOUT)?;
    if header[0] != b'#' {
        return Err(ScopeError::Block(format!(
            "expected '#', got {:?}",
            header[0] as char
        )));
    }

    let digits = match (header[1] as char).to_digit(10) {
        Some(0) | None => {
            return Err(ScopeError::Block(format!(
                "unsupported length digit {:?}",
                header[1] as char
            )))
        }
        Some(n) => n as usize,
    };

    let length_field = String::from_utf8(link.read_exact(digits, BLOCK_TIMEOUT)?)
        .map_err(LinkError::from)?;
    let length: usize = length_field
        .parse()
        .map_err(|_| ScopeError::Block(format!("bad length field '{length_field}'")))?;

    let data = link.read_exact(length, BLOCK_TIMEOUT)?;
    match link.read_until(b'\n', QUERY_TIMEOUT) {
        Ok(_) | Err(LinkError::Timeout { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(data)
}

/// Rigol DS/MSO oscilloscope.
pub struct RigolScope<L> {
    link: L,
    name: String,
    identity: String,
    channels: Vec<u8>,
    arm_timeout: Duration,
    window_points: usize,
}

impl<L: InstrumentLink> RigolScope<L> {
    /// Identify the scope and remember which channels to read after each shot.
    pub fn new(name: &str, mut link: L, channels: &[u8]) -> Result<Self, ScopeError> {
        if let Some(&channel) = channels.iter().find(|c| !(1..=4).contains(*c)) {
            return Err(ScopeError::InvalidChannel { channel });
        }

        link.clear_input()?;
        let identity = link.query_line("*IDN?", "\n", QUERY_TIMEOUT)?;
        log::debug!("Scope {} identifies as {}", name, identity);

        Ok(Self {
            link,
            name: name.to_string(),
            identity,
            channels: channels.to_vec(),
            arm_timeout: Duration::from_secs(1),
            window_points: MAX_POINTS_PER_READ,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    pub fn set_arm_timeout(&mut self, timeout: Duration) {
        self.arm_timeout = timeout;
    }

    /// Points fetched per `:WAV:DATA?`, capped at what the scope allows.
    pub fn set_window_points(&mut self, points: usize) {
        self.window_points = points.clamp(1, MAX_POINTS_PER_READ);
    }

    fn write(&mut self, command: &str) -> Result<(), ScopeError> {
        self.link.send_line(command, "\n")?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, ScopeError> {
        Ok(self.link.query_line(command, "\n", QUERY_TIMEOUT)?)
    }

    /// Stop acquiring and wait for exactly one trigger.
    ///
    /// Fails with `NotArmed` if the status never leaves STOP: the memory then
    /// still holds the previous acquisition.
    pub fn arm_single(&mut self) -> Result<(), ScopeError> {
        self.write(":STOP")?;
        self.write(":SING")?;

        // The status keeps reading STOP for a moment after :SING.
        let start = Instant::now();
        loop {
            let status = self.trigger_status()?;
            if status != TriggerStatus::Stopped {
                log::debug!("Scope {} armed ({:?})", self.name, status);
                return Ok(());
            }
            if start.elapsed() >= self.arm_timeout {
                return Err(ScopeError::NotArmed {
                    scope: self.name.clone(),
                    waited: self.arm_timeout,
                });
            }
            thread::sleep(ARM_POLL_INTERVAL);
        }
    }

    pub fn trigger_status(&mut self) -> Result<TriggerStatus, ScopeError> {
        self.query(":TRIG:STAT?")?.parse()
    }

    /// Back to continuous acquisition.
    pub fn run(&mut self) -> Result<(), ScopeError> {
        self.write(":RUN")
    }

    pub fn preamble(&mut self) -> Result<Preamble, ScopeError> {
        Preamble::parse(&self.query(":WAV:PRE?")?)
    }

    /// Read the full memory depth of `channel` and convert it to volts.
    pub fn fetch_channel(&mut self, channel: u8) -> Result<ChannelTrace, ScopeError> {
        if !(1..=4).contains(&channel) {
            return Err(ScopeError::InvalidChannel { channel });
        }

        self.write(&format!(":WAV:SOUR CHAN{channel}"))?;
        self.write(":WAV:MODE RAW")?;
        self.write(":WAV:FORM BYTE")?;
        let preamble = self.preamble()?;

        let mut raw = Vec::with_capacity(preamble.points);
        let mut start = 1;
        while start <= preamble.points {
            let stop = (start + self.window_points - 1).min(preamble.points);
            self.write(&format!(":WAV:STAR {start}"))?;
            self.write(&format!(":WAV:STOP {stop}"))?;
            self.write(":WAV:DATA?")?;
            raw.extend(read_tmc_block(&mut self.link)?);
            start = stop + 1;
        }

        if raw.len() != preamble.points {
            log::warn!(
                "Scope {} CH{}: preamble announced {} points, received {}",
                self.name,
                channel,
                preamble.points,
                raw.len()
            );
        }

        Ok(preamble.scale(channel, &raw))
    }

    pub fn fetch_capture(&mut self) -> Result<ScopeCapture, ScopeError> {
        let channels = self.channels.clone();
        let traces = channels
            .into_iter()
            .map(|channel| self.fetch_channel(channel))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScopeCapture {
            scope: self.name.clone(),
            traces,
        })
    }
}

impl<L: InstrumentLink> CaptureScope for RigolScope<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn arm_single(&mut self) -> Result<(), ScopeError> {
        Self::arm_single(self)
    }

    fn trigger_status(&mut self) -> Result<TriggerStatus, ScopeError> {
        Self::trigger_status(self)
    }

    fn fetch_capture(&mut self) -> Result<ScopeCapture, ScopeError> {
        Self::fetch_capture(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{line_responder, ScriptedLink};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub const PREAMBLE: &str = "0,0,4,1,1.000000e-06,-2.000000e-06,0,4.000000e-02,-1.000000e+00,128";

    fn block(data: &[u8]) -> Vec<u8> {
        let length = data.len().to_string();
        let mut out = format!("#{}{}", length.len(), length).into_bytes();
        out.extend_from_slice(data);
        out.push(b'\n');
        out
    }

    /// A scope that reports WAIT once armed and STOP once `fired` is set, then
    /// serves `samples` for every channel.
    pub fn simulated_scope(fired: Arc<AtomicBool>, samples: Vec<u8>) -> ScriptedLink {
        let mut armed = false;
        ScriptedLink::new(move |written| {
            let command = String::from_utf8_lossy(written).trim().to_string();
            match command.as_str() {
                "*IDN?" => Some(b"RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04\n".to_vec()),
                ":SING" => {
                    armed = true;
                    None
                }
                ":TRIG:STAT?" => {
                    let status = if armed && !fired.load(Ordering::SeqCst) {
                        "WAIT"
                    } else {
                        "STOP"
                    };
                    Some(format!("{status}\n").into_bytes())
                }
                ":WAV:PRE?" => Some(
                    PREAMBLE
                        .replacen(",4,", &format!(",{},", samples.len()), 1)
                        .into_bytes()
                        .into_iter()
                        .chain(*b"\n")
                        .collect(),
                ),
                ":WAV:DATA?" => Some(block(&samples)),
                _ => None,
            }
        })
    }

    #[test]
    fn test_trigger_status_parse() {
        assert_eq!("TD".parse::<TriggerStatus>().unwrap(), TriggerStatus::Triggered);
        assert_eq!("wait\n".parse::<TriggerStatus>().unwrap(), TriggerStatus::Waiting);
        assert_eq!("STOP".parse::<TriggerStatus>().unwrap(), TriggerStatus::Stopped);
        assert!("DONE".parse::<TriggerStatus>().is_err());
    }

    #[test]
    fn test_preamble_parse() {
        let preamble = Preamble::parse(PREAMBLE).unwrap();
        assert_eq!(preamble.points, 4);
        assert_eq!(preamble.y_reference, 128.0);
        assert_eq!(preamble.x_origin, -2e-6);
        assert!(Preamble::parse("0,0,4").is_err());
        assert!(Preamble::parse("0,0,x,1,1,1,1,1,1,1").is_err());
        assert!(Preamble::parse("256,0,4,1,1,1,1,1,1,1").is_err());
        assert!(Preamble::parse("0,0,4,4294967296,1,1,1,1,1,1").is_err());
    }

    #[test]
    fn test_scaling_reproduces_voltage_range() {
        // yinc 40 mV, yorig -1 V, yref 128: full byte range spans -6.12 V to +4.08 V.
        let preamble = Preamble::parse(PREAMBLE).unwrap();
        let trace = preamble.scale(1, &[0, 128, 255, 153]);

        let expected = [-6.12, -1.0, 4.08, 0.0];
        for (volts, want) in trace.volts.iter().zip(expected) {
            assert!((volts - want).abs() < 1e-9, "{volts} != {want}");
        }
        assert!((trace.time[0] + 2e-6).abs() < 1e-15);
        assert!((trace.time[3] - 1e-6).abs() < 1e-15);
    }

    #[test]
    fn test_read_tmc_block() {
        let mut link = ScriptedLink::silent();
        link.push_input(&block(&[1, 2, 3, 10, 13]));
        assert_eq!(read_tmc_block(&mut link).unwrap(), vec![1, 2, 3, 10, 13]);

        link.push_input(b"X1234");
        assert!(matches!(read_tmc_block(&mut link), Err(ScopeError::Block(_))));
    }

    #[test]
    fn test_rejects_invalid_channels() {
        let link = simulated_scope(Arc::new(AtomicBool::new(false)), vec![]);
        assert!(matches!(
            RigolScope::new("scope1", link, &[1, 5]),
            Err(ScopeError::InvalidChannel { channel: 5 })
        ));
    }

    #[test]
    fn test_arm_single_stops_then_arms() {
        let link = simulated_scope(Arc::new(AtomicBool::new(false)), vec![]);
        let mut scope = RigolScope::new("scope1", link.clone(), &[1]).unwrap();
        assert!(scope.identity().starts_with("RIGOL"));

        scope.arm_single().unwrap();

        let lines = link.written_lines();
        assert_eq!(&lines[1..4], &[":STOP", ":SING", ":TRIG:STAT?"]);
        assert_eq!(scope.trigger_status().unwrap(), TriggerStatus::Waiting);
    }

    #[test]
    fn test_arm_single_fails_when_scope_stays_stopped() {
        let link = ScriptedLink::new(line_responder(vec![
            ("*IDN?", "RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04"),
            (":TRIG:STAT?", "STOP"),
        ]));
        let mut scope = RigolScope::new("scope1", link, &[1]).unwrap();
        scope.set_arm_timeout(Duration::from_millis(20));

        assert!(matches!(
            scope.arm_single(),
            Err(ScopeError::NotArmed { ref scope, .. }) if scope == "scope1"
        ));
    }

    /// Serves `samples[start - 1..stop]` for the window last set with
    /// `:WAV:STAR`/`:WAV:STOP`, withholding the final `missing` samples.
    fn windowed_scope(samples: Vec<u8>, missing: usize) -> ScriptedLink {
        let points = samples.len();
        let mut window = (1usize, 1usize);
        ScriptedLink::new(move |written| {
            let command = String::from_utf8_lossy(written).trim().to_string();
            if let Some(start) = command.strip_prefix(":WAV:STAR ") {
                window.0 = start.parse().ok()?;
                return None;
            }
            if let Some(stop) = command.strip_prefix(":WAV:STOP ") {
                window.1 = stop.parse().ok()?;
                return None;
            }
            match command.as_str() {
                "*IDN?" => Some(b"RIGOL TECHNOLOGIES,DS1104Z,DS1ZA0001,00.04.04\n".to_vec()),
                ":WAV:PRE?" => Some(
                    format!("{}\n", PREAMBLE.replacen(",4,", &format!(",{points},"), 1))
                        .into_bytes(),
                ),
                ":WAV:DATA?" => {
                    let end = window.1.min(points - missing);
                    let start = (window.0 - 1).min(end);
                    Some(block(&samples[start..end]))
                }
                _ => None,
            }
        })
    }

    fn window_commands(link: &ScriptedLink) -> Vec<String> {
        link.written_lines()
            .into_iter()
            .filter(|l| l.starts_with(":WAV:STAR") || l.starts_with(":WAV:STOP"))
            .collect()
    }

    #[test]
    fn test_fetch_channel_reads_in_windows() {
        let samples: Vec<u8> = (100..105).collect();
        let link = windowed_scope(samples.clone(), 0);
        let mut scope = RigolScope::new("scope1", link.clone(), &[1]).unwrap();
        scope.set_window_points(2);

        let trace = scope.fetch_channel(1).unwrap();

        assert_eq!(
            window_commands(&link),
            vec![
                ":WAV:STAR 1",
                ":WAV:STOP 2",
                ":WAV:STAR 3",
                ":WAV:STOP 4",
                ":WAV:STAR 5",
                ":WAV:STOP 5",
            ]
        );
        let preamble = Preamble::parse(&PREAMBLE.replacen(",4,", ",5,", 1)).unwrap();
        let expected: Vec<f64> = samples.iter().map(|&r| preamble.raw_to_volts(r)).collect();
        assert_eq!(trace.volts, expected);
        assert_eq!(trace.time.len(), 5);
    }

    #[test]
    fn test_fetch_channel_keeps_short_reads() {
        let link = windowed_scope((0..6).collect(), 1);
        let mut scope = RigolScope::new("scope1", link.clone(), &[1]).unwrap();
        scope.set_window_points(4);

        let trace = scope.fetch_channel(1).unwrap();

        assert_eq!(
            window_commands(&link),
            vec![":WAV:STAR 1", ":WAV:STOP 4", ":WAV:STAR 5", ":WAV:STOP 6"]
        );
        assert_eq!(trace.volts.len(), 5);
        assert_eq!(trace.time.len(), 5);
    }

    #[test]
    fn test_fetch_capture_scales_every_channel() {
        let fired = Arc::new(AtomicBool::new(true));
        let link = simulated_scope(fired, vec![128, 153, 178]);
        let mut scope = RigolScope::new("scope2", link.clone(), &[1, 3]).unwrap();

        let capture = scope.fetch_capture().unwrap();

        assert_eq!(capture.scope, "scope2");
        assert_eq!(capture.traces.len(), 2);
        let ch3 = capture.trace(3).unwrap();
        assert_eq!(ch3.volts.len(), 3);
        assert!((ch3.volts[2] - 1.0).abs() < 1e-9);
        assert!(link
            .written_lines()
            .contains(&":WAV:SOUR CHAN3".to_string()));
        assert!(link.written_lines().contains(&":WAV:STOP 3".to_string()));
    }

    #[test]
    fn test_capture_dataframe_and_extrema() {
        let capture = ScopeCapture {
            scope: "scope1".to_string(),
            traces: vec![
                ChannelTrace {
                    channel: 1,
                    time: vec![0.0, 1.0, 2.0],
                    volts: vec![-1.0, 0.5, 3.0],
                },
                ChannelTrace {
                    channel: 2,
                    time: vec![0.0, 1.0, 2.0],
                    volts: vec![0.0, 0.0, 0.25],
                },
            ],
        };

        let df = capture.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.width(), 3);

        let extrema = capture.channel_extrema().unwrap();
        assert_eq!(extrema, vec![(1, -1.0, 3.0), (2, 0.0, 0.25)]);
    }
}
