use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use crate::channel::{Channel, ChannelLayout, Direction};
use crate::error::{Error, Result};
use crate::sample::Format;
use crate::sim::{SimDevice, NOISE_LEVEL};
use crate::stream::StreamConfig;

/// Identifies one attached transceiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevInfo {
    /// Driver backend name.
    pub backend: String,
    /// Device serial number.
    pub serial: String,
    pub bus: u8,
    pub addr: u8,
}

impl DevInfo {
    /// Device identifier string accepted by `open`.
    pub fn devstr(&self) -> String {
        format!("{}:device={}:{}", self.backend, self.bus, self.addr)
    }
}

impl fmt::Display for DevInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (serial {})", self.devstr(), self.serial)
    }
}

/// Loopback paths selectable on the RFIC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Loopback {
    Disabled,
    Firmware,
    BbTxlpfRxvga2,
    BbTxvga1Rxvga2,
    BbTxlpfRxlpf,
    BbTxvga1Rxlpf,
    RfLna1,
    RfLna2,
    RfLna3,
    RficBist,
}

impl TryFrom<u32> for Loopback {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        use self::Loopback::*;

        Ok(match raw {
            0 => Disabled,
            1 => Firmware,
            2 => BbTxlpfRxvga2,
            3 => BbTxvga1Rxvga2,
            4 => BbTxlpfRxlpf,
            5 => BbTxvga1Rxlpf,
            6 => RfLna1,
            7 => RfLna2,
            8 => RfLna3,
            9 => RficBist,
            _ => return Err(Error::Config(format!("unknown loopback mode {}", raw))),
        })
    }
}

impl FromStr for Loopback {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        use self::Loopback::*;

        Ok(match &s.to_lowercase()[..] {
            "none" | "disabled" => Disabled,
            "firmware" => Firmware,
            "bb_txlpf_rxvga2" => BbTxlpfRxvga2,
            "bb_txvga1_rxvga2" => BbTxvga1Rxvga2,
            "bb_txlpf_rxlpf" => BbTxlpfRxlpf,
            "bb_txvga1_rxlpf" => BbTxvga1Rxlpf,
            "rf_lna1" => RfLna1,
            "rf_lna2" => RfLna2,
            "rf_lna3" => RfLna3,
            "rfic_bist" => RficBist,
            other => match other.parse::<u32>() {
                Ok(raw) => return Loopback::try_from(raw),
                Err(_) => return Err(Error::Config(format!("unknown loopback mode '{}'", s))),
            },
        })
    }
}

/// Source of samples delivered on the RX datapath.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RxMux {
    Baseband,
    Counter12Bit,
    Counter32Bit,
    DigitalLoopback,
}

impl TryFrom<i32> for RxMux {
    type Error = Error;

    fn try_from(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => RxMux::Baseband,
            1 => RxMux::Counter12Bit,
            2 => RxMux::Counter32Bit,
            4 => RxMux::DigitalLoopback,
            _ => return Err(Error::Config(format!("unknown rx mux {}", raw))),
        })
    }
}

impl FromStr for RxMux {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_lowercase()[..] {
            "baseband" => RxMux::Baseband,
            "12bit" => RxMux::Counter12Bit,
            "32bit" => RxMux::Counter32Bit,
            "digital" => RxMux::DigitalLoopback,
            other => match other.parse::<i32>() {
                Ok(raw) => return RxMux::try_from(raw),
                Err(_) => return Err(Error::Config(format!("unknown rx mux '{}'", s))),
            },
        })
    }
}

/// IQ correction parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Correction {
    DcOffI,
    DcOffQ,
    Phase,
    Gain,
}

impl TryFrom<u32> for Correction {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Correction::DcOffI,
            1 => Correction::DcOffQ,
            2 => Correction::Phase,
            3 => Correction::Gain,
            _ => return Err(Error::Config(format!("unknown correction {}", raw))),
        })
    }
}

impl FromStr for Correction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match &s.to_lowercase()[..] {
            "dc_i" => Correction::DcOffI,
            "dc_q" => Correction::DcOffQ,
            "phase" => Correction::Phase,
            "gain" => Correction::Gain,
            other => match other.parse::<u32>() {
                Ok(raw) => return Correction::try_from(raw),
                Err(_) => return Err(Error::Config(format!("unknown correction '{}'", s))),
            },
        })
    }
}

/// Operations the core needs from a transceiver driver.
///
/// Implementations synchronize internally: one handle may serve an RX session and a
/// TX session from two threads at once, as long as each only touches its own
/// channel.
pub trait Device: Send + Sync {
    fn info(&self) -> &DevInfo;

    /// Number of channels available in the given direction.
    fn channel_count(&self, dir: Direction) -> u32;

    fn set_frequency(&self, ch: Channel, hz: u64) -> Result<()>;
    fn frequency(&self, ch: Channel) -> Result<u64>;

    /// Set the sample rate, returning the rate actually applied.
    fn set_sample_rate(&self, ch: Channel, hz: u32) -> Result<u32>;

    fn set_gain(&self, ch: Channel, db: i32) -> Result<()>;

    /// Establish the buffer pool for the direction of `layout`.
    fn configure_stream(&self, layout: ChannelLayout, format: Format, cfg: &StreamConfig)
        -> Result<()>;

    fn enable_channel(&self, ch: Channel, enable: bool) -> Result<()>;

    /// Block until `samples` samples from `buf` are queued for transmission.
    fn blocking_write(&self, buf: &[u8], samples: usize, timeout_ms: u32) -> Result<()>;

    /// Block until `samples` samples are received into `buf`.
    fn blocking_read(&self, buf: &mut [u8], samples: usize, timeout_ms: u32) -> Result<()>;

    fn set_loopback(&self, lb: Loopback) -> Result<()> {
        Err(Error::Unsupported(format!("loopback {:?}", lb)))
    }

    fn set_rx_mux(&self, mux: RxMux) -> Result<()> {
        Err(Error::Unsupported(format!("rx mux {:?}", mux)))
    }

    fn set_correction(&self, ch: Channel, corr: Correction, _value: i16) -> Result<()> {
        Err(Error::Unsupported(format!("{:?} correction on {}", corr, ch)))
    }
}

/// Verify `ch` exists on the device.
pub fn check_channel<D: Device + ?Sized>(dev: &D, ch: Channel) -> Result<Channel> {
    if ch.index() < dev.channel_count(ch.direction()) {
        Ok(ch)
    } else {
        Err(Error::Unsupported(format!("invalid channel: {}", ch)))
    }
}

/// Pick the single attached device out of a discovery list.
pub fn probe(devs: &[DevInfo]) -> Result<&DevInfo> {
    match devs.len() {
        0 => Err(Error::NoDevice("no devices found".to_string())),
        1 => Ok(&devs[0]),
        n => Err(Error::NoDevice(format!("{} devices found, specify one", n))),
    }
}

/// Devices visible to the available drivers.
pub fn devices() -> Vec<DevInfo> {
    vec![SimDevice::default_info()]
}

/// Open the device named by `ident`, or the only attached device when `ident` is
/// empty.
pub fn open(ident: &str) -> Result<Box<dyn Device>> {
    let list = devices();

    let info = if ident.is_empty() {
        probe(&list)?.clone()
    } else {
        let found = list.iter()
            .filter(|d| d.devstr() == ident || d.backend == ident || d.serial == ident)
            .cloned()
            .collect::<Vec<_>>();

        probe(&found)
            .map_err(|_| Error::NoDevice(format!("no device matches '{}'", ident)))?
            .clone()
    };

    info!("opening {}", info);

    Ok(Box::new(SimDevice::with_info(info).with_noise(NOISE_LEVEL)))
}
