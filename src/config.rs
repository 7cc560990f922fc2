use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::channel::{Channel, Direction};
use crate::consts::READY_TIMEOUT_SECS;
use crate::duplex::{RxParams, Sweep, SweepParams, TxParams};
use crate::error::{Error, Result};
use crate::sample::Format;
use crate::stream::StreamConfig;

/// Log verbosity, from most to least chatty.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Silent,
}

impl Verbosity {
    /// Log filter directive selecting this level.
    pub fn directive(self) -> &'static str {
        match self {
            Verbosity::Verbose => "trace",
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warning => "warn",
            Verbosity::Error | Verbosity::Critical => "error",
            Verbosity::Silent => "off",
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self { Verbosity::Info }
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_lowercase()[..] {
            "verbose" => Verbosity::Verbose,
            "debug" => Verbosity::Debug,
            "info" => Verbosity::Info,
            "warning" => Verbosity::Warning,
            "error" => Verbosity::Error,
            "critical" => Verbosity::Critical,
            "silent" => Verbosity::Silent,
            _ => return Err(Error::Config(format!("invalid verbosity '{}'", s))),
        })
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn default_enable() -> bool { true }
fn default_ready_timeout() -> u64 { READY_TIMEOUT_SECS }

/// Top-level configuration file.
///
/// Named sections, each a single-direction run or a duplex sweep, run in order:
///
/// ```json
/// {
///     "verbosity": "info",
///     "sections": [
///         {"name": "loopback", "mode": "txrx", "enable": true,
///          "rx_channel": [0, 1], "tx_channel": [0, 1],
///          "rx_frequency": [915000000], "tx_frequency": [915000000],
///          "rx_samplerate": 2000000, "rx_gain": 30, "rx_num_samples": 1000000,
///          "rx_file": "auto",
///          "tx_samplerate": 2000000, "tx_gain": 10, "tx_repeats": 0,
///          "tx_file": "burst.bin"}
///     ]
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Device identifier; empty picks the only attached device.
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub stream: StreamConfig,
    /// Bound on the transmitter's wait for its receiver (s).
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,
    pub sections: Vec<Section>,
}

/// One named unit of work.
#[derive(Clone, Debug, Deserialize)]
pub struct Section {
    pub name: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(flatten)]
    pub task: Task,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Task {
    Tx(TxSection),
    Rx(RxSection),
    Txrx(TxRxSection),
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxSection {
    pub tx_channel: u32,
    pub tx_frequency: u64,
    pub tx_samplerate: u32,
    pub tx_gain: i32,
    pub tx_repeats: i32,
    pub tx_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RxSection {
    pub rx_channel: u32,
    pub rx_frequency: u64,
    pub rx_samplerate: u32,
    pub rx_gain: i32,
    pub rx_num_samples: u64,
    pub rx_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxRxSection {
    pub rx_channel: Vec<u32>,
    pub tx_channel: Vec<u32>,
    pub rx_frequency: Vec<u64>,
    pub tx_frequency: Vec<u64>,
    pub rx_samplerate: u32,
    pub rx_gain: i32,
    pub rx_num_samples: u64,
    /// Capture path, or `auto`.
    pub rx_file: String,
    pub tx_samplerate: u32,
    pub tx_gain: i32,
    pub tx_repeats: i32,
    pub tx_file: PathBuf,
}

impl Config {
    pub fn from_reader<R: Read>(src: R) -> Result<Config> {
        let cfg: Config = serde_json::from_reader(src)?;
        cfg.stream.validate(Format::Sc16Q11)?;

        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Config> {
        Config::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout)
    }
}

impl TxSection {
    pub fn params(&self, cfg: &Config) -> Result<TxParams> {
        let mut p = TxParams::new(Channel::checked(Direction::Tx, self.tx_channel)?,
                                  self.tx_frequency, self.tx_samplerate, self.tx_gain,
                                  self.tx_repeats);
        p.stream = cfg.stream;
        p.ready_timeout = cfg.ready_timeout();
        Ok(p)
    }
}

impl RxSection {
    pub fn params(&self, cfg: &Config) -> Result<RxParams> {
        let mut p = RxParams::new(Channel::checked(Direction::Rx, self.rx_channel)?,
                                  self.rx_frequency, self.rx_samplerate, self.rx_gain,
                                  self.rx_num_samples);
        p.stream = cfg.stream;
        Ok(p)
    }
}

impl TxRxSection {
    /// Validate the channel and frequency lists into a sweep plan.
    pub fn sweep(&self, cfg: &Config) -> Result<Sweep> {
        Sweep::new(&self.rx_channel, &self.tx_channel, &self.rx_frequency, &self.tx_frequency,
                   SweepParams {
                       rx_sample_rate: self.rx_samplerate,
                       rx_gain: self.rx_gain,
                       rx_num_samples: self.rx_num_samples,
                       rx_file: self.rx_file.clone(),
                       tx_sample_rate: self.tx_samplerate,
                       tx_gain: self.tx_gain,
                       tx_repeats: self.tx_repeats,
                       tx_file: self.tx_file.clone(),
                       stream: cfg.stream,
                       ready_timeout: cfg.ready_timeout(),
                   })
    }
}

/// Parse a comma-separated list such as `915e6, 2.4e9` into integers.
///
/// Values may use float notation but must be whole numbers.
pub fn parse_list(s: &str) -> Result<Vec<u64>> {
    s.split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            let err = || Error::Config(format!("invalid value '{}'", v));

            if let Ok(n) = v.parse::<u64>() {
                return Ok(n);
            }

            let f = v.parse::<f64>().map_err(|_| err())?;

            if f < 0.0 || f.fract() != 0.0 || f > u64::max_value() as f64 {
                return Err(err());
            }

            Ok(f as u64)
        })
        .collect()
}
