use std::cell::Cell;
use std::cmp;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::cancel::Cancel;
use crate::channel::{Channel, ChannelLayout, Direction};
use crate::consts::{CHANNEL_INDEX_MAX, READY_POLL_MS, READY_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::sample::Format;
use crate::sdr::{check_channel, Device};
use crate::stream::{Stream, StreamConfig};

/// Sending half of the ready token.
pub struct Ready(Sender<()>);

/// Receiving half of the ready token.
pub struct ReadyWait(Receiver<()>);

/// Sending half of the done token.
pub struct Done(Sender<()>);

/// Receiving half of the done token.
pub struct DoneWatch {
    chan: Receiver<()>,
    seen: Cell<bool>,
}

/// Create a fresh ready handshake.
///
/// The receiver sends *ready* once its channel is enabled, and the transmitter does
/// not emit a sample before taking that token. Dropping the sender counts as
/// aborting, so a failed receiver never leaves the transmitter waiting.
pub fn ready() -> (Ready, ReadyWait) {
    let (tx, rx) = bounded(1);
    (Ready(tx), ReadyWait(rx))
}

/// Create a fresh done handshake.
///
/// The receiver sends *done* after capturing its target, which stops an open-ended
/// transmitter. Dropping the sender counts as sending it.
pub fn done() -> (Done, DoneWatch) {
    let (tx, rx) = bounded(1);
    (Done(tx), DoneWatch { chan: rx, seen: Cell::new(false) })
}

impl Ready {
    pub fn signal(self) {
        // The waiter may already have given up.
        self.0.send(()).ok();
    }
}

impl ReadyWait {
    /// Block until the receiver is ready, for at most `timeout`.
    ///
    /// `cancel` is checked every `READY_POLL_MS` while waiting.
    pub fn wait(&self, timeout: Duration, cancel: &Cancel) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(READY_POLL_MS);

        loop {
            let left = deadline.saturating_duration_since(Instant::now());

            match self.0.recv_timeout(cmp::min(left, poll)) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::CoordinationAborted),
                Err(RecvTimeoutError::Timeout) => {},
            }

            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }

            if Instant::now() >= deadline {
                return Err(Error::CoordinationTimeout(timeout));
            }
        }
    }
}

impl Done {
    pub fn signal(self) {
        self.0.send(()).ok();
    }
}

impl DoneWatch {
    /// Whether the receiver has finished, successfully or not.
    pub fn is_set(&self) -> bool {
        if !self.seen.get() {
            match self.chan.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => self.seen.set(true),
                Err(TryRecvError::Empty) => {},
            }
        }

        self.seen.get()
    }
}

/// Receive-side run parameters.
#[derive(Copy, Clone, Debug)]
pub struct RxParams {
    pub channel: Channel,
    pub frequency: u64,
    pub sample_rate: u32,
    pub gain: i32,
    /// Samples to capture; zero captures until cancelled.
    pub num_samples: u64,
    pub stream: StreamConfig,
}

/// Transmit-side run parameters.
#[derive(Copy, Clone, Debug)]
pub struct TxParams {
    pub channel: Channel,
    pub frequency: u64,
    pub sample_rate: u32,
    pub gain: i32,
    /// Passes over the source; below one repeats until the receiver is done.
    pub repeat: i32,
    pub stream: StreamConfig,
    /// Bound on the wait for the receiver's ready token.
    pub ready_timeout: Duration,
}

impl RxParams {
    pub fn new(channel: Channel, frequency: u64, sample_rate: u32, gain: i32, num_samples: u64)
        -> Self
    {
        RxParams {
            channel: channel,
            frequency: frequency,
            sample_rate: sample_rate,
            gain: gain,
            num_samples: num_samples,
            stream: StreamConfig::default(),
        }
    }
}

impl TxParams {
    pub fn new(channel: Channel, frequency: u64, sample_rate: u32, gain: i32, repeat: i32)
        -> Self
    {
        TxParams {
            channel: channel,
            frequency: frequency,
            sample_rate: sample_rate,
            gain: gain,
            repeat: repeat,
            stream: StreamConfig::default(),
            ready_timeout: Duration::from_secs(READY_TIMEOUT_SECS),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RxReport {
    pub samples: u64,
    /// Blocking transfer calls made.
    pub transfers: u64,
    pub sample_rate: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TxReport {
    pub samples: u64,
    /// Complete passes over the source.
    pub passes: u32,
    pub transfers: u64,
    pub sample_rate: u32,
}

/// Apply frequency, rate and gain to `ch`, returning the actual sample rate.
fn tune<D: Device + ?Sized>(dev: &D, ch: Channel, dir: Direction, freq: u64, rate: u32,
                            gain: i32)
    -> Result<u32>
{
    if ch.direction() != dir {
        return Err(Error::Config(format!("{} is not a {} channel", ch, dir)));
    }

    check_channel(dev, ch)?;
    dev.set_frequency(ch, freq)?;

    let actual = dev.set_sample_rate(ch, rate)?;

    if actual != rate {
        warn!("{}: requested {} Hz sample rate, got {} Hz", ch, rate, actual);
    }

    dev.set_gain(ch, gain)?;

    Ok(actual)
}

/// Captures samples from one RX channel.
pub struct RxTask<'d, D: Device + ?Sized> {
    dev: &'d D,
    params: RxParams,
    ready: Option<Ready>,
    done: Option<Done>,
    cancel: Cancel,
}

impl<'d, D: Device + ?Sized> RxTask<'d, D> {
    pub fn new(dev: &'d D, params: RxParams) -> Self {
        RxTask {
            dev: dev,
            params: params,
            ready: None,
            done: None,
            cancel: Cancel::new(),
        }
    }

    /// Report readiness and completion through the given tokens.
    pub fn handshake(mut self, ready: Ready, done: Done) -> Self {
        self.ready = Some(ready);
        self.done = Some(done);
        self
    }

    pub fn cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    /// Capture into `sink`, blocking the current thread.
    pub fn run<W: Write>(mut self, sink: &mut W) -> Result<RxReport> {
        let p = self.params;
        let rate = tune(self.dev, p.channel, Direction::Rx, p.frequency, p.sample_rate,
                        p.gain)?;

        let mut stream = Stream::new(self.dev, p.channel);
        stream.configure(ChannelLayout::siso(Direction::Rx), Format::Sc16Q11, p.stream)?;
        stream.enable()?;

        if let Some(ready) = self.ready.take() {
            ready.signal();
        }

        let total = if p.num_samples > 0 { Some(p.num_samples) } else { None };
        let samples = stream.receive_into(sink, total, &self.cancel)?;

        if let Some(done) = self.done.take() {
            done.signal();
        }

        stream.disable()?;
        info!("RX: done, {} samples", samples);

        Ok(RxReport {
            samples: samples,
            transfers: stream.stats().transfers,
            sample_rate: rate,
        })
    }

    /// Capture into a newly created file at `path`.
    pub fn run_file(self, path: &Path) -> Result<RxReport> {
        let mut sink = BufWriter::new(File::create(path)?);
        self.run(&mut sink)
    }
}

/// Transmits a sample source on one TX channel.
pub struct TxTask<'d, D: Device + ?Sized> {
    dev: &'d D,
    params: TxParams,
    ready: Option<ReadyWait>,
    done: Option<DoneWatch>,
    cancel: Cancel,
}

impl<'d, D: Device + ?Sized> TxTask<'d, D> {
    pub fn new(dev: &'d D, params: TxParams) -> Self {
        TxTask {
            dev: dev,
            params: params,
            ready: None,
            done: None,
            cancel: Cancel::new(),
        }
    }

    /// Wait for the receiver's tokens before and during transmission.
    pub fn handshake(mut self, ready: ReadyWait, done: DoneWatch) -> Self {
        self.ready = Some(ready);
        self.done = Some(done);
        self
    }

    pub fn cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transmit `src`, blocking the current thread.
    pub fn run<R: Read + Seek>(self, src: &mut R) -> Result<TxReport> {
        let p = self.params;

        if self.done.is_none() && p.repeat < 1 {
            return Err(Error::Config(
                "repeating forever requires a receiver to signal completion".to_string()));
        }

        if let Some(ref ready) = self.ready {
            info!("TX: waiting until receive thread is ready...");
            ready.wait(p.ready_timeout, &self.cancel)?;
        }

        let rate = tune(self.dev, p.channel, Direction::Tx, p.frequency, p.sample_rate,
                        p.gain)?;

        let mut stream = Stream::new(self.dev, p.channel);
        stream.configure(ChannelLayout::siso(Direction::Tx), Format::Sc16Q11, p.stream)?;
        stream.enable()?;

        // A bounded burst always completes its passes.
        let done = &self.done;
        let finished = || p.repeat < 1 && done.as_ref().map_or(false, |d| d.is_set());

        let mut report = TxReport { sample_rate: rate, ..TxReport::default() };

        loop {
            let sent = stream.send_from(src, &self.cancel, &finished)?;
            report.samples += sent.samples;

            if sent.stopped {
                debug!("TX: receiver done, stopping");
                break;
            }

            if sent.samples == 0 {
                warn!("TX: source holds no whole samples");
                break;
            }

            report.passes += 1;

            if p.repeat >= 1 && report.passes >= p.repeat as u32 {
                break;
            }

            src.seek(SeekFrom::Start(0))?;
        }

        stream.disable()?;
        report.transfers = stream.stats().transfers;
        info!("TX: done, {} samples in {} passes", report.samples, report.passes);

        Ok(report)
    }

    /// Transmit the file at `path`.
    pub fn run_file(self, path: &Path) -> Result<TxReport> {
        let mut src = BufReader::new(File::open(path)?);
        self.run(&mut src)
    }
}

/// Capture `params.num_samples` samples from one channel into `sink`.
pub fn run_rx<D: Device + ?Sized>(dev: &D, params: RxParams, sink: &Path,
                                  ready: Option<Ready>, done: Option<Done>, cancel: &Cancel)
    -> Result<RxReport>
{
    let mut task = RxTask::new(dev, params).cancel(cancel.clone());
    task.ready = ready;
    task.done = done;
    task.run_file(sink)
}

/// Transmit `source` on one channel, `params.repeat` times.
pub fn run_tx<D: Device + ?Sized>(dev: &D, params: TxParams, source: &Path,
                                  ready: Option<ReadyWait>, done: Option<DoneWatch>,
                                  cancel: &Cancel)
    -> Result<TxReport>
{
    let mut task = TxTask::new(dev, params).cancel(cancel.clone());
    task.ready = ready;
    task.done = done;
    task.run_file(source)
}

/// Run one handshaked receive/transmit pair to completion on two worker threads.
///
/// The receiver is launched first. Both workers are joined before returning.
pub fn run_duplex<'d, R, T, F, G>(rx: RxTask<'d, R>, tx: TxTask<'d, T>, capture: F, burst: G)
    -> (Result<RxReport>, Result<TxReport>)
    where R: Device + ?Sized,
          T: Device + ?Sized,
          F: FnOnce(RxTask<'d, R>) -> Result<RxReport> + Send,
          G: FnOnce(TxTask<'d, T>) -> Result<TxReport> + Send,
{
    let (ready, ready_wait) = ready();
    let (done, done_watch) = done();

    let rx = rx.handshake(ready, done);
    let tx = tx.handshake(ready_wait, done_watch);

    let res = crossbeam::scope(|scope| {
        let rx = scope.builder()
            .name("rx".to_string())
            .spawn(move |_| capture(rx));

        let tx = scope.builder()
            .name("tx".to_string())
            .spawn(move |_| burst(tx));

        let rx = match rx {
            Ok(h) => h.join().unwrap_or(Err(Error::WorkerPanic("rx"))),
            Err(e) => Err(Error::File(e)),
        };

        let tx = match tx {
            Ok(h) => h.join().unwrap_or(Err(Error::WorkerPanic("tx"))),
            Err(e) => Err(Error::File(e)),
        };

        (rx, tx)
    });

    res.unwrap_or((Err(Error::WorkerPanic("rx")), Err(Error::WorkerPanic("tx"))))
}

/// Settings shared by every iteration of a sweep.
#[derive(Clone, Debug)]
pub struct SweepParams {
    pub rx_sample_rate: u32,
    pub rx_gain: i32,
    pub rx_num_samples: u64,
    /// Capture path, or `auto` to name each capture after its channels and frequency.
    pub rx_file: String,
    pub tx_sample_rate: u32,
    pub tx_gain: i32,
    pub tx_repeats: i32,
    pub tx_file: PathBuf,
    pub stream: StreamConfig,
    pub ready_timeout: Duration,
}

/// One (channel pair, frequency pair) step of a sweep.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Iteration {
    pub rx_channel: u32,
    pub tx_channel: u32,
    pub rx_frequency: u64,
    pub tx_frequency: u64,
    pub rx_file: PathBuf,
}

/// Result of one sweep iteration.
pub struct Outcome {
    pub iteration: Iteration,
    pub rx: Result<RxReport>,
    pub tx: Result<TxReport>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Serializable summary of an `Outcome`.
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    #[serde(flatten)]
    pub iteration: Iteration,
    pub started: String,
    pub elapsed_ms: u64,
    pub rx_status: i32,
    pub rx_samples: u64,
    pub tx_status: i32,
    pub tx_samples: u64,
    pub errors: Vec<String>,
}

impl Outcome {
    /// Zero when both sides succeeded, otherwise the first failing side's status.
    pub fn status(&self) -> i32 {
        match (&self.rx, &self.tx) {
            (Err(e), _) | (_, Err(e)) => e.status(),
            _ => 0,
        }
    }

    pub fn summary(&self) -> Summary {
        let errors = [("rx", self.rx.as_ref().err()), ("tx", self.tx.as_ref().err())]
            .iter()
            .filter_map(|&(side, e)| e.map(|e| format!("{}: {}", side, e)))
            .collect();

        Summary {
            iteration: self.iteration.clone(),
            started: self.started.to_rfc3339(),
            elapsed_ms: self.elapsed.as_millis() as u64,
            rx_status: self.rx.as_ref().err().map_or(0, |e| e.status()),
            rx_samples: self.rx.as_ref().map_or(0, |r| r.samples),
            tx_status: self.tx.as_ref().err().map_or(0, |e| e.status()),
            tx_samples: self.tx.as_ref().map_or(0, |r| r.samples),
            errors: errors,
        }
    }
}

/// A validated plan of duplex runs over channel and frequency pairs.
#[derive(Clone, Debug)]
pub struct Sweep {
    channels: Vec<(u32, u32)>,
    freqs: Vec<(u64, u64)>,
    params: SweepParams,
}

impl Sweep {
    /// Pair up the RX and TX lists, rejecting lists of unequal length.
    pub fn new(rx_channels: &[u32], tx_channels: &[u32], rx_freqs: &[u64], tx_freqs: &[u64],
               params: SweepParams)
        -> Result<Sweep>
    {
        if rx_channels.len() != tx_channels.len() {
            return Err(Error::Config(format!(
                "rx and tx channel lists must be the same length ({} != {})",
                rx_channels.len(), tx_channels.len())));
        }

        if rx_freqs.len() != tx_freqs.len() {
            return Err(Error::Config(format!(
                "rx and tx frequency lists must be the same length ({} != {})",
                rx_freqs.len(), tx_freqs.len())));
        }

        if rx_channels.is_empty() || rx_freqs.is_empty() {
            return Err(Error::Config("sweep needs at least one channel and frequency"
                                     .to_string()));
        }

        if let Some(ch) = rx_channels.iter().chain(tx_channels).find(|&&c| c > CHANNEL_INDEX_MAX) {
            return Err(Error::Config(format!("invalid channel index {}", ch)));
        }

        if params.tx_repeats < 1 && params.rx_num_samples == 0 {
            return Err(Error::Config(
                "unbounded capture with unbounded transmission would never finish".to_string()));
        }

        params.stream.validate(Format::Sc16Q11)?;

        Ok(Sweep {
            channels: rx_channels.iter().cloned().zip(tx_channels.iter().cloned()).collect(),
            freqs: rx_freqs.iter().cloned().zip(tx_freqs.iter().cloned()).collect(),
            params: params,
        })
    }

    /// Iterations in execution order: every frequency pair for each channel pair.
    pub fn iterations(&self) -> Vec<Iteration> {
        let mut out = Vec::with_capacity(self.channels.len() * self.freqs.len());

        for &(rx_ch, tx_ch) in &self.channels {
            for &(rx_freq, tx_freq) in &self.freqs {
                out.push(Iteration {
                    rx_channel: rx_ch,
                    tx_channel: tx_ch,
                    rx_frequency: rx_freq,
                    tx_frequency: tx_freq,
                    rx_file: self.capture_path(rx_ch, tx_ch, rx_freq),
                });
            }
        }

        out
    }

    fn capture_path(&self, rx_ch: u32, tx_ch: u32, rx_freq: u64) -> PathBuf {
        if self.params.rx_file == "auto" {
            PathBuf::from(format!("rx_r{}t{}_{}M.bin", rx_ch, tx_ch, rx_freq / 1_000_000))
        } else {
            PathBuf::from(&self.params.rx_file)
        }
    }

    /// Run every iteration in order, each to completion before the next starts.
    ///
    /// A failed iteration is recorded and the sweep moves on; cancellation stops the
    /// sweep after the current iteration.
    pub fn run<R, T>(&self, rx_dev: &R, tx_dev: &T, cancel: &Cancel) -> Vec<Outcome>
        where R: Device + ?Sized, T: Device + ?Sized
    {
        let p = &self.params;
        let mut outcomes = Vec::new();

        for it in self.iterations() {
            if cancel.is_cancelled() {
                warn!("sweep cancelled");
                break;
            }

            info!("rx_ch = {:2} tx_ch = {:2} rx_freq = {:10} tx_freq = {:10} rx_file = {}",
                  it.rx_channel, it.tx_channel, it.rx_frequency, it.tx_frequency,
                  it.rx_file.display());

            let mut rx = RxParams::new(Channel::rx(it.rx_channel), it.rx_frequency,
                                       p.rx_sample_rate, p.rx_gain, p.rx_num_samples);
            rx.stream = p.stream;

            let mut tx = TxParams::new(Channel::tx(it.tx_channel), it.tx_frequency,
                                       p.tx_sample_rate, p.tx_gain, p.tx_repeats);
            tx.stream = p.stream;
            tx.ready_timeout = p.ready_timeout;

            let started = Utc::now();
            let clock = Instant::now();

            let rx_file = it.rx_file.clone();
            let tx_file = p.tx_file.clone();

            let (rx, tx) = run_duplex(
                RxTask::new(rx_dev, rx).cancel(cancel.clone()),
                TxTask::new(tx_dev, tx).cancel(cancel.clone()),
                move |task| task.run_file(&rx_file),
                move |task| task.run_file(&tx_file));

            if let Err(ref e) = rx {
                error!("Receive operation failed with error {}", e);
            }

            if let Err(ref e) = tx {
                error!("Transmit operation failed with error {}", e);
            }

            outcomes.push(Outcome {
                iteration: it,
                rx: rx,
                tx: tx,
                started: started,
                elapsed: clock.elapsed(),
            });
        }

        outcomes
    }
}

/// Validate a sweep over channel and frequency pairs and run it.
///
/// Lists of unequal length are rejected before any worker starts.
pub fn run_duplex_sweep<R, T>(rx_dev: &R, tx_dev: &T,
                              channels: (&[u32], &[u32]), freqs: (&[u64], &[u64]),
                              params: SweepParams, cancel: &Cancel)
    -> Result<Vec<Outcome>>
    where R: Device + ?Sized, T: Device + ?Sized
{
    let sweep = Sweep::new(channels.0, channels.1, freqs.0, freqs.1, params)?;
    Ok(sweep.run(rx_dev, tx_dev, cancel))
}
