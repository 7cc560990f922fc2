use std::io::{BufRead, Read, Write};

use num::complex::Complex;

use crate::consts::SC16Q11_BYTES;
use crate::error::{Error, Result};
use crate::sample::{clamp_sc16q11, decode_sc16q11, encode_sc16q11, Sample};

/// Characters separating values on a line.
const DELIMS: &[char] = &[' ', '\r', '\n', '\t', ',', '.', ':'];

/// Samples converted per block when decoding binary input.
const BLOCK_SAMPLES: usize = 4096;

/// Totals from a text-to-binary conversion.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CsvStats {
    /// Samples written.
    pub samples: u64,
    /// Values pulled into the SC16Q11 range.
    pub clamped: u64,
}

fn parse_value(tok: &str, line: usize, what: &str) -> Result<(i16, bool)> {
    match tok.parse::<i16>() {
        Ok(v) => Ok(clamp_sc16q11(v as i32)),
        Err(_) => Err(Error::Csv {
            line: line,
            msg: format!("invalid {} value '{}'", what, tok),
        }),
    }
}

/// Parse one line, returning `None` for a blank line.
fn parse_line(text: &str, line: usize) -> Result<Option<(Sample, u32)>> {
    let mut toks = text.split(DELIMS).filter(|t| !t.is_empty());

    let i = match toks.next() {
        Some(t) => parse_value(t, line, "I")?,
        None => return Ok(None),
    };

    let q = match toks.next() {
        Some(t) => parse_value(t, line, "Q")?,
        None => return Err(Error::Csv { line: line, msg: "Q value missing".to_string() }),
    };

    if toks.next().is_some() {
        return Err(Error::Csv { line: line, msg: "extra tokens".to_string() });
    }

    Ok(Some((Complex::new(i.0, q.0), i.1 as u32 + q.1 as u32)))
}

/// Convert `I, Q` lines from `src` into SC16Q11 bytes on `dst`.
///
/// Conversion stops at the first malformed line, after everything before it has
/// been written.
pub fn csv_to_bin<R: BufRead, W: Write>(src: R, dst: &mut W) -> Result<CsvStats> {
    let mut stats = CsvStats::default();
    let mut bytes = [0u8; SC16Q11_BYTES];

    for (idx, text) in src.lines().enumerate() {
        let text = text?;

        if let Some((s, clamped)) = parse_line(&text, idx + 1)? {
            encode_sc16q11(&[s], &mut bytes);
            dst.write_all(&bytes)?;

            stats.samples += 1;
            stats.clamped += clamped as u64;
        }
    }

    dst.flush()?;

    if stats.clamped > 0 {
        warn!("{} values clamped within SC16Q11 range", stats.clamped);
    }

    Ok(stats)
}

/// Convert SC16Q11 bytes from `src` into `I, Q` lines on `dst`, returning the
/// number of samples written. A trailing partial sample is ignored.
pub fn bin_to_csv<R: Read, W: Write>(src: &mut R, dst: &mut W) -> Result<u64> {
    let mut bytes = vec![0u8; BLOCK_SAMPLES * SC16Q11_BYTES];
    let mut samples = vec![Sample::default(); BLOCK_SAMPLES];
    let mut fill = 0;
    let mut total = 0;

    loop {
        let n = src.read(&mut bytes[fill..])?;
        fill += n;

        let whole = fill / SC16Q11_BYTES * SC16Q11_BYTES;

        if n == 0 || fill == bytes.len() {
            let count = decode_sc16q11(&bytes[..whole], &mut samples);

            for s in &samples[..count] {
                writeln!(dst, "{}, {}", s.re, s.im)?;
            }

            total += count as u64;

            if n == 0 {
                if fill != whole {
                    warn!("ignoring {} trailing bytes", fill - whole);
                }

                break;
            }

            fill = 0;
        }
    }

    dst.flush()?;

    Ok(total)
}
