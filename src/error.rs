use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Negative status codes returned by the transceiver driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatusCode {
    Unexpected,
    Range,
    Inval,
    Mem,
    Io,
    Timeout,
    NoDev,
    Unsupported,
    Misaligned,
    Checksum,
    NoFile,
    UpdateFpga,
    UpdateFw,
    TimePast,
    QueueFull,
    FpgaOp,
    Permission,
    WouldBlock,
    NotInit,
}

impl StatusCode {
    /// Raw driver value for this code.
    pub fn raw(self) -> i32 {
        use self::StatusCode::*;

        match self {
            Unexpected => -1,
            Range => -2,
            Inval => -3,
            Mem => -4,
            Io => -5,
            Timeout => -6,
            NoDev => -7,
            Unsupported => -8,
            Misaligned => -9,
            Checksum => -10,
            NoFile => -11,
            UpdateFpga => -12,
            UpdateFw => -13,
            TimePast => -14,
            QueueFull => -15,
            FpgaOp => -16,
            Permission => -17,
            WouldBlock => -18,
            NotInit => -19,
        }
    }

    /// Device-style description of the code.
    pub fn message(self) -> &'static str {
        use self::StatusCode::*;

        match self {
            Unexpected => "An unexpected error occurred",
            Range => "Provided parameter was out of the allowable range",
            Inval => "Invalid operation or parameter",
            Mem => "A memory allocation error occurred",
            Io => "File or device I/O failure",
            Timeout => "Operation timed out",
            NoDev => "No devices available",
            Unsupported => "Operation not supported",
            Misaligned => "Misaligned flash access",
            Checksum => "Invalid checksum",
            NoFile => "File not found",
            UpdateFpga => "An FPGA update is required",
            UpdateFw => "A firmware update is required",
            TimePast => "Requested timestamp is in the past",
            QueueFull => "Could not enqueue data into full queue",
            FpgaOp => "An FPGA operation reported a failure",
            Permission => "Insufficient permissions for the requested operation",
            WouldBlock => "The operation would block, but has been requested to be non-blocking",
            NotInit => "Insufficient initialization for the requested operation",
        }
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = i32;

    fn try_from(raw: i32) -> std::result::Result<Self, i32> {
        use self::StatusCode::*;

        Ok(match raw {
            -1 => Unexpected,
            -2 => Range,
            -3 => Inval,
            -4 => Mem,
            -5 => Io,
            -6 => Timeout,
            -7 => NoDev,
            -8 => Unsupported,
            -9 => Misaligned,
            -10 => Checksum,
            -11 => NoFile,
            -12 => UpdateFpga,
            -13 => UpdateFw,
            -14 => TimePast,
            -15 => QueueFull,
            -16 => FpgaOp,
            -17 => Permission,
            -18 => WouldBlock,
            -19 => NotInit,
            other => return Err(other),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.raw())
    }
}

/// Errors produced by the streaming engine, the duplex coordinator and the tools
/// around them.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid buffer, timeout, layout or sweep parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// No matching hardware, or more than one ambiguous match.
    #[error("no device: {0}")]
    NoDevice(String),

    /// A blocking call exceeded its deadline without corrupting data.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Underlying transport fault.
    #[error("device I/O error: {0}")]
    Io(String),

    /// Transmitter never saw its receiver become ready.
    #[error("receiver not ready after {0:?}")]
    CoordinationTimeout(Duration),

    /// Receiver exited before it reported ready.
    #[error("receiver exited before becoming ready")]
    CoordinationAborted,

    /// Feature not available on this hardware variant.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Any other driver status code.
    #[error("{code}: {msg}")]
    Driver { code: StatusCode, msg: String },

    /// Stopped at a chunk boundary by a cancellation request.
    #[error("interrupted")]
    Interrupted,

    /// Host file I/O failure.
    #[error("file error: {0}")]
    File(#[from] io::Error),

    /// Malformed JSON configuration.
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed CSV sample line.
    #[error("line {line}: {msg}")]
    Csv { line: usize, msg: String },

    /// A worker thread panicked.
    #[error("{0} worker panicked")]
    WorkerPanic(&'static str),
}

impl Error {
    /// Map a raw driver status code onto an error, attaching the given context.
    pub fn from_status(raw: i32, ctx: &str) -> Error {
        match StatusCode::try_from(raw) {
            Ok(code) => Error::from_code(code, ctx),
            Err(raw) => Error::Driver {
                code: StatusCode::Unexpected,
                msg: format!("{}: unknown status code {}", ctx, raw),
            },
        }
    }

    /// Map a known driver status code onto an error.
    pub fn from_code(code: StatusCode, ctx: &str) -> Error {
        let msg = format!("{} ({})", code.message(), ctx);

        match code {
            StatusCode::Range | StatusCode::Inval => Error::Config(msg),
            StatusCode::NoDev => Error::NoDevice(msg),
            StatusCode::Timeout => Error::Timeout(msg),
            StatusCode::Io => Error::Io(msg),
            StatusCode::Unsupported => Error::Unsupported(msg),
            code => Error::Driver { code: code, msg: ctx.to_string() },
        }
    }

    /// Whether the failed call may simply be retried.
    pub fn is_retryable(&self) -> bool {
        match *self {
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Negative status value reported for this error.
    pub fn status(&self) -> i32 {
        match *self {
            Error::Config(_) => StatusCode::Inval.raw(),
            Error::NoDevice(_) => StatusCode::NoDev.raw(),
            Error::Timeout(_) | Error::CoordinationTimeout(_) => StatusCode::Timeout.raw(),
            Error::Io(_) | Error::File(_) => StatusCode::Io.raw(),
            Error::Unsupported(_) => StatusCode::Unsupported.raw(),
            Error::Driver { code, .. } => code.raw(),
            Error::Json(_) | Error::Csv { .. } => StatusCode::Inval.raw(),
            Error::CoordinationAborted | Error::Interrupted | Error::WorkerPanic(_) =>
                StatusCode::Unexpected.raw(),
        }
    }
}

/// Check a raw driver return value, mapping negative codes to errors.
pub fn check(ret: i32, ctx: &str) -> Result<u32> {
    if ret < 0 {
        Err(Error::from_status(ret, ctx))
    } else {
        Ok(ret as u32)
    }
}
