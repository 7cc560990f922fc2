use std::convert::TryFrom;
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use collect_slice::CollectSlice;
use num::complex::Complex;

use crate::consts::{SC16Q11_BYTES, SC16Q11_MAX, SC16Q11_MIN, SC8Q7_BYTES};
use crate::error::{Error, Result};

/// One complex IQ pair. Each component holds a fixed-point integer value.
pub type Sample = Complex<i16>;

/// Wire/disk sample formats understood by the driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Format {
    /// 12-bit I/Q in 16-bit little-endian containers.
    #[serde(rename = "sc16q11")]
    Sc16Q11,
    /// `Sc16Q11` with per-buffer metadata.
    #[serde(rename = "sc16q11_meta")]
    Sc16Q11Meta,
    /// Raw packets with metadata.
    #[serde(rename = "packet_meta")]
    PacketMeta,
    /// 8-bit I/Q.
    #[serde(rename = "sc8q7")]
    Sc8Q7,
    /// `Sc8Q7` with per-buffer metadata.
    #[serde(rename = "sc8q7_meta")]
    Sc8Q7Meta,
}

impl Format {
    pub fn raw(self) -> u32 {
        match self {
            Format::Sc16Q11 => 0,
            Format::Sc16Q11Meta => 1,
            Format::PacketMeta => 2,
            Format::Sc8Q7 => 3,
            Format::Sc8Q7Meta => 4,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Format::Sc8Q7 | Format::Sc8Q7Meta => SC8Q7_BYTES,
            Format::Sc16Q11 | Format::Sc16Q11Meta | Format::PacketMeta => SC16Q11_BYTES,
        }
    }

    /// Whether transfers in this format carry a metadata block.
    pub fn has_metadata(self) -> bool {
        match self {
            Format::Sc16Q11 | Format::Sc8Q7 => false,
            _ => true,
        }
    }

    /// Number of whole samples contained in `bytes` bytes, rounding down.
    pub fn whole_samples(self, bytes: usize) -> usize {
        bytes / self.bytes_per_sample()
    }
}

impl TryFrom<u32> for Format {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Format::Sc16Q11,
            1 => Format::Sc16Q11Meta,
            2 => Format::PacketMeta,
            3 => Format::Sc8Q7,
            4 => Format::Sc8Q7Meta,
            _ => return Err(Error::Config(format!("unknown sample format {}", raw))),
        })
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sc16q11" | "sc16_q11" => Ok(Format::Sc16Q11),
            "sc16q11_meta" => Ok(Format::Sc16Q11Meta),
            "packet_meta" => Ok(Format::PacketMeta),
            "sc8q7" | "sc8_q7" => Ok(Format::Sc8Q7),
            "sc8q7_meta" => Ok(Format::Sc8Q7Meta),
            _ => Err(Error::Config(format!("unknown sample format '{}'", s))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Format::Sc16Q11 => "SC16Q11",
            Format::Sc16Q11Meta => "SC16Q11_META",
            Format::PacketMeta => "PACKET_META",
            Format::Sc8Q7 => "SC8Q7",
            Format::Sc8Q7Meta => "SC8Q7_META",
        })
    }
}

/// Clamp a component to the 12-bit SC16Q11 range, returning whether it was clipped.
pub fn clamp_sc16q11(v: i32) -> (i16, bool) {
    if v < SC16Q11_MIN as i32 {
        (SC16Q11_MIN, true)
    } else if v > SC16Q11_MAX as i32 {
        (SC16Q11_MAX, true)
    } else {
        (v as i16, false)
    }
}

/// Encode samples as little-endian SC16Q11, returning the number of bytes written.
pub fn encode_sc16q11(samples: &[Sample], out: &mut [u8]) -> usize {
    let mut n = 0;

    for (s, b) in samples.iter().zip(out.chunks_exact_mut(SC16Q11_BYTES)) {
        b[..2].copy_from_slice(&s.re.to_le_bytes());
        b[2..].copy_from_slice(&s.im.to_le_bytes());
        n += SC16Q11_BYTES;
    }

    n
}

/// Decode little-endian SC16Q11 bytes into `out`, returning the number of samples.
pub fn decode_sc16q11(bytes: &[u8], out: &mut [Sample]) -> usize {
    bytes.chunks_exact(SC16Q11_BYTES)
         .map(|b| Complex::new(i16::from_le_bytes([b[0], b[1]]),
                               i16::from_le_bytes([b[2], b[3]])))
         .collect_slice(out)
}

/// Fixed-capacity byte arena holding a whole number of samples.
///
/// Allocated once per stream session and reused for every transfer call.
pub struct TransferBuffer {
    bytes: Vec<u8>,
    format: Format,
    /// Number of valid samples currently held.
    len: usize,
}

impl TransferBuffer {
    /// Create a buffer able to hold `samples` samples of the given format.
    pub fn new(format: Format, samples: usize) -> Self {
        TransferBuffer {
            bytes: vec![0; samples * format.bytes_per_sample()],
            format: format,
            len: 0,
        }
    }

    /// Capacity in samples.
    pub fn capacity(&self) -> usize {
        self.format.whole_samples(self.bytes.len())
    }

    /// Bytes of the valid samples.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len * self.format.bytes_per_sample()]
    }

    /// Prepare the first `samples` samples for a device read, returning their bytes.
    ///
    /// The valid length is only updated by `commit` once the read succeeds.
    pub fn stage(&mut self, samples: usize) -> &mut [u8] {
        assert!(samples <= self.capacity());
        &mut self.bytes[..samples * self.format.bytes_per_sample()]
    }

    /// Mark the first `samples` samples as valid.
    pub fn commit(&mut self, samples: usize) {
        assert!(samples <= self.capacity());
        self.len = samples;
    }

    /// Fill the buffer from a byte source until full or end of stream.
    ///
    /// A trailing partial sample at end of stream is dropped. Returns the number of
    /// whole samples now held.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut pos = 0;

        while pos < self.bytes.len() {
            match src.read(&mut self.bytes[pos..]) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.len = self.format.whole_samples(pos);

        Ok(self.len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_format_raw() {
        for raw in 0..5 {
            assert_eq!(Format::try_from(raw).unwrap().raw(), raw);
        }

        assert!(Format::try_from(5).is_err());
        assert_eq!("SC16Q11".parse::<Format>().unwrap(), Format::Sc16Q11);
        assert!("sc12".parse::<Format>().is_err());
        assert_eq!(Format::Sc8Q7.bytes_per_sample(), 2);
        assert_eq!(Format::Sc16Q11.whole_samples(4097), 1024);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_sc16q11(0), (0, false));
        assert_eq!(clamp_sc16q11(2047), (2047, false));
        assert_eq!(clamp_sc16q11(2048), (2047, true));
        assert_eq!(clamp_sc16q11(-2048), (-2048, false));
        assert_eq!(clamp_sc16q11(-3000), (-2048, true));
    }

    #[test]
    fn test_sc16q11_layout() {
        let samples = [Complex::new(1, -1), Complex::new(-2048, 2047)];
        let mut bytes = [0u8; 8];

        assert_eq!(encode_sc16q11(&samples, &mut bytes), 8);
        assert_eq!(bytes, [0x01, 0x00, 0xff, 0xff, 0x00, 0xf8, 0xff, 0x07]);

        let mut out = [Complex::new(0, 0); 2];
        assert_eq!(decode_sc16q11(&bytes, &mut out), 2);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_fill_rounds_down() {
        let mut buf = TransferBuffer::new(Format::Sc16Q11, 4);
        assert_eq!(buf.capacity(), 4);

        let mut src = Cursor::new(vec![7u8; 10]);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 2);
        assert_eq!(buf.as_bytes().len(), 8);

        let mut src = Cursor::new(vec![1u8; 40]);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 4);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 4);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 2);
        assert_eq!(buf.fill_from(&mut src).unwrap(), 0);
        assert!(buf.as_bytes().is_empty());
    }
}
