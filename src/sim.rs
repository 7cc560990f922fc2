use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use rand::Rng;

use crate::channel::{Channel, ChannelLayout, Direction};
use crate::consts::{BUF_COUNT, BUF_SAMPLES, DMA_ALIGN_BYTES, SC16Q11_BYTES};
use crate::error::{check, Result, StatusCode};
use crate::sample::Format;
use crate::sdr::{check_channel, DevInfo, Device};
use crate::stream::StreamConfig;

/// Channels per direction.
const NUM_CHANNELS: u32 = 2;

const FREQ_MIN: u64 = 70_000_000;
const FREQ_MAX: u64 = 6_000_000_000;
const RATE_MIN: u32 = 520_834;
const RATE_MAX: u32 = 61_440_000;
const RX_GAIN: (i32, i32) = (-15, 60);
const TX_GAIN: (i32, i32) = (-24, 66);

/// Peak amplitude of the noise heard when nothing is transmitting.
pub const NOISE_LEVEL: i16 = 16;

const OK: i32 = 0;

/// Something observed on the air, in the order it happened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Enabled(Channel),
    Disabled(Channel),
    /// Samples queued by a transmitter.
    Wrote(usize),
    /// Samples transmitted while no receiver was listening.
    Lost(usize),
    /// Samples delivered to a receiver.
    Read(usize),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Event::Enabled(ch) => write!(f, "{} enabled", ch),
            Event::Disabled(ch) => write!(f, "{} disabled", ch),
            Event::Wrote(n) => write!(f, "wrote {} samples", n),
            Event::Lost(n) => write!(f, "lost {} samples", n),
            Event::Read(n) => write!(f, "read {} samples", n),
        }
    }
}

struct AirState {
    queue: VecDeque<u8>,
    /// Queue bound in bytes.
    capacity: usize,
    /// Number of enabled RX channels.
    listeners: usize,
    /// Number of enabled TX channels.
    talkers: usize,
    #[cfg(test)]
    events: Vec<Event>,
}

impl AirState {
    fn record(&mut self, e: Event) {
        trace!("air: {}", e);

        #[cfg(test)]
        self.events.push(e);
    }
}

/// Shared medium connecting simulated devices.
pub struct Air {
    state: Mutex<AirState>,
    cond: Condvar,
}

impl Air {
    /// Create a medium buffering at most `samples` SC16Q11 samples.
    pub fn new(samples: usize) -> Arc<Air> {
        Arc::new(Air {
            state: Mutex::new(AirState {
                queue: VecDeque::new(),
                capacity: samples * SC16Q11_BYTES,
                listeners: 0,
                talkers: 0,
                #[cfg(test)]
                events: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        // A panicking test thread must not wedge the other worker.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything observed so far.
    #[cfg(test)]
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Total samples transmitted with no receiver listening.
    #[cfg(test)]
    pub fn lost(&self) -> usize {
        self.lock().events.iter().map(|e| match *e {
            Event::Lost(n) => n,
            _ => 0,
        }).sum()
    }
}

/// Fill `buf` with random components of at most `level` in magnitude.
fn hiss(buf: &mut [u8], format: Format, level: i16) {
    let mut rng = rand::thread_rng();

    if format.bytes_per_sample() == SC16Q11_BYTES {
        for b in buf.chunks_exact_mut(2) {
            b.copy_from_slice(&rng.gen_range(-level..=level).to_le_bytes());
        }
    } else {
        let level = level.min(i8::max_value() as i16) as i8;

        for b in buf.iter_mut() {
            *b = rng.gen_range(-level..=level) as u8;
        }
    }
}

#[derive(Copy, Clone)]
struct ChannelState {
    frequency: u64,
    sample_rate: u32,
    gain: i32,
    enabled: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState {
            frequency: 2_400_000_000,
            sample_rate: 1_000_000,
            gain: 0,
            enabled: false,
        }
    }
}

#[derive(Copy, Clone)]
struct StreamSetup {
    format: Format,
}

#[derive(Default)]
struct DevState {
    /// Keyed by encoded channel.
    channels: FnvHashMap<u32, ChannelState>,
    rx: Option<StreamSetup>,
    tx: Option<StreamSetup>,
}

impl DevState {
    fn stream(&self, dir: Direction) -> Option<StreamSetup> {
        match dir {
            Direction::Rx => self.rx,
            Direction::Tx => self.tx,
        }
    }

    fn streaming(&self, dir: Direction) -> bool {
        self.channels.iter().any(|(&raw, st)| Channel::from(raw).direction() == dir && st.enabled)
    }

    /// Sample rate of the first enabled channel in `dir`.
    fn rate(&self, dir: Direction) -> Option<u32> {
        self.channels.iter()
            .find(|&(&raw, st)| Channel::from(raw).direction() == dir && st.enabled)
            .map(|(_, st)| st.sample_rate)
    }
}

/// In-process stand-in for an attached transceiver.
///
/// Every `SimDevice` attached to the same `Air` hears what the others transmit:
/// bytes written on a TX stream are queued for any enabled RX channel, and are lost
/// when no receiver is listening. The queue is bounded, so transmitters see
/// back-pressure from a receiver that falls behind. Internally the device speaks
/// raw driver values and libbladeRF-style status codes, which are converted at the
/// `Device` boundary.
pub struct SimDevice {
    info: DevInfo,
    state: Mutex<DevState>,
    air: Arc<Air>,
    /// Noise amplitude heard while no transmitter is on the air.
    noise: Option<i16>,
    /// Upper bound of a random delay applied when an RX channel is enabled.
    rx_jitter: Option<Duration>,
}

impl SimDevice {
    /// Discovery entry for the default simulated device.
    pub fn default_info() -> DevInfo {
        DevInfo {
            backend: "sim".to_string(),
            serial: "0000000000000000000000000000sim0".to_string(),
            bus: 0,
            addr: 0,
        }
    }

    pub fn new() -> Self {
        SimDevice::with_info(SimDevice::default_info())
    }

    pub fn with_info(info: DevInfo) -> Self {
        SimDevice::on_air(info, Air::new(BUF_COUNT as usize * BUF_SAMPLES))
    }

    /// Attach a device to an existing medium.
    pub fn on_air(info: DevInfo, air: Arc<Air>) -> Self {
        SimDevice {
            info: info,
            state: Mutex::new(DevState::default()),
            air: air,
            noise: None,
            rx_jitter: None,
        }
    }

    /// Deliver noise of the given amplitude to receivers while nothing transmits.
    ///
    /// Without it, a receive on a silent medium waits for a transmitter and times
    /// out.
    pub fn with_noise(mut self, level: i16) -> Self {
        self.noise = Some(level);
        self
    }

    /// Two devices sharing one medium, as with separate TX and RX boards.
    #[cfg(test)]
    pub fn pair() -> (SimDevice, SimDevice) {
        let air = Air::new(BUF_COUNT as usize * BUF_SAMPLES);
        let mut a = SimDevice::default_info();
        let mut b = SimDevice::default_info();

        a.serial = "0000000000000000000000000000sim1".to_string();
        a.addr = 1;
        b.serial = "0000000000000000000000000000sim2".to_string();
        b.addr = 2;

        (SimDevice::on_air(a, air.clone()), SimDevice::on_air(b, air))
    }

    /// Delay RX channel enables by a random amount up to `max`.
    #[cfg(test)]
    pub fn with_rx_jitter(mut self, max: Duration) -> Self {
        self.rx_jitter = Some(max);
        self
    }

    #[cfg(test)]
    pub fn air(&self) -> &Arc<Air> { &self.air }

    fn lock(&self) -> MutexGuard<'_, DevState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_channel<F>(&self, ch: u32, f: F) -> i32
        where F: FnOnce(&mut ChannelState) -> i32
    {
        let mut st = self.lock();
        f(st.channels.entry(ch).or_insert_with(ChannelState::default))
    }

    fn sync_config(&self, layout: u32, format: u32, cfg: &StreamConfig) -> i32 {
        let (layout, format) = match (ChannelLayout::try_from(layout), Format::try_from(format)) {
            (Ok(l), Ok(f)) => (l, f),
            _ => return StatusCode::Inval.raw(),
        };

        if cfg.num_transfers >= cfg.num_buffers {
            return StatusCode::Inval.raw();
        }

        if format.has_metadata() {
            return StatusCode::Unsupported.raw();
        }

        if format.bytes_per_sample() * cfg.buffer_size % DMA_ALIGN_BYTES != 0 {
            return StatusCode::Inval.raw();
        }

        let dir = layout.direction();
        let mut st = self.lock();

        if st.streaming(dir) {
            return StatusCode::Inval.raw();
        }

        let setup = Some(StreamSetup { format: format });

        match dir {
            Direction::Rx => st.rx = setup,
            Direction::Tx => st.tx = setup,
        }

        OK
    }

    fn enable_module(&self, raw: u32, enable: bool) -> i32 {
        let ch = Channel::from(raw);
        let dir = ch.direction();

        {
            let mut st = self.lock();

            if enable && st.stream(dir).is_none() {
                return StatusCode::Inval.raw();
            }

            let state = st.channels.entry(raw).or_insert_with(ChannelState::default);

            if state.enabled == enable {
                return OK;
            }
        }

        if enable && dir == Direction::Rx {
            if let Some(max) = self.rx_jitter {
                let us = max.as_micros() as u64;
                thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(0..=us)));
            }
        }

        let mut air = self.air.lock();

        // Re-check under both locks so a racing enable/disable stays balanced.
        {
            let mut st = self.lock();
            let state = st.channels.entry(raw).or_insert_with(ChannelState::default);

            if state.enabled == enable {
                return OK;
            }

            if enable {
                debug!("{}: {} Hz, {} S/s, {} dB", ch, state.frequency, state.sample_rate,
                       state.gain);
            }

            state.enabled = enable;
        }

        match (dir, enable) {
            (Direction::Rx, true) => air.listeners += 1,
            (Direction::Rx, false) => {
                air.listeners -= 1;

                if air.listeners == 0 {
                    air.queue.clear();
                }
            },
            (Direction::Tx, true) => air.talkers += 1,
            (Direction::Tx, false) => air.talkers -= 1,
        }

        air.record(if enable { Event::Enabled(ch) } else { Event::Disabled(ch) });
        self.air.cond.notify_all();

        OK
    }

    /// Stream setup for `dir`, if a channel in that direction is enabled.
    fn active(&self, dir: Direction) -> Option<StreamSetup> {
        let st = self.lock();

        if st.streaming(dir) {
            st.stream(dir)
        } else {
            None
        }
    }

    fn sync_tx(&self, buf: &[u8], samples: usize, timeout_ms: u32) -> i32 {
        let setup = match self.active(Direction::Tx) {
            Some(s) => s,
            None => return StatusCode::Inval.raw(),
        };

        let bytes = samples * setup.format.bytes_per_sample();

        if buf.len() < bytes {
            return StatusCode::Inval.raw();
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut air = self.air.lock();

        loop {
            if air.listeners == 0 {
                air.record(Event::Lost(samples));
                return OK;
            }

            if air.queue.is_empty() || air.queue.len() + bytes <= air.capacity {
                break;
            }

            let now = Instant::now();

            if now >= deadline {
                return StatusCode::Timeout.raw();
            }

            air = self.air.cond.wait_timeout(air, deadline - now)
                .unwrap_or_else(|e| e.into_inner()).0;
        }

        air.queue.extend(&buf[..bytes]);
        air.record(Event::Wrote(samples));
        self.air.cond.notify_all();

        OK
    }

    fn sync_rx(&self, buf: &mut [u8], samples: usize, timeout_ms: u32) -> i32 {
        let setup = match self.active(Direction::Rx) {
            Some(s) => s,
            None => return StatusCode::Inval.raw(),
        };

        let bytes = samples * setup.format.bytes_per_sample();

        if buf.len() < bytes {
            return StatusCode::Inval.raw();
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut air = self.air.lock();

        while air.queue.len() < bytes {
            if let (0, Some(level)) = (air.talkers, self.noise) {
                // Whatever is still queued comes first, then the noise floor.
                let have = air.queue.len();

                for (dst, src) in buf[..have].iter_mut().zip(air.queue.drain(..)) {
                    *dst = src;
                }

                hiss(&mut buf[have..bytes], setup.format, level);

                air.record(Event::Read(samples));
                self.air.cond.notify_all();
                drop(air);

                self.pace(samples);

                return OK;
            }

            let now = Instant::now();

            // Nothing is consumed on timeout, so a retry sees the same data.
            if now >= deadline {
                return StatusCode::Timeout.raw();
            }

            air = self.air.cond.wait_timeout(air, deadline - now)
                .unwrap_or_else(|e| e.into_inner()).0;
        }

        for (dst, src) in buf[..bytes].iter_mut().zip(air.queue.drain(..bytes)) {
            *dst = src;
        }

        air.record(Event::Read(samples));
        self.air.cond.notify_all();

        OK
    }

    /// Hold a noise read for as long as `samples` take at the RX sample rate.
    fn pace(&self, samples: usize) {
        if let Some(rate) = self.lock().rate(Direction::Rx) {
            thread::sleep(Duration::from_micros(samples as u64 * 1_000_000 / rate as u64));
        }
    }
}

impl Default for SimDevice {
    fn default() -> Self { SimDevice::new() }
}

impl Device for SimDevice {
    fn info(&self) -> &DevInfo { &self.info }

    fn channel_count(&self, _: Direction) -> u32 { NUM_CHANNELS }

    fn set_frequency(&self, ch: Channel, hz: u64) -> Result<()> {
        let ch = check_channel(self, ch)?;

        check(self.with_channel(ch.raw(), |st| {
            if hz < FREQ_MIN || hz > FREQ_MAX {
                return StatusCode::Range.raw();
            }

            st.frequency = hz;
            OK
        }), "set_frequency").map(|_| ())
    }

    fn frequency(&self, ch: Channel) -> Result<u64> {
        let ch = check_channel(self, ch)?;
        let mut hz = 0;

        self.with_channel(ch.raw(), |st| { hz = st.frequency; OK });

        Ok(hz)
    }

    fn set_sample_rate(&self, ch: Channel, hz: u32) -> Result<u32> {
        let ch = check_channel(self, ch)?;

        check(self.with_channel(ch.raw(), |st| {
            if hz < RATE_MIN || hz > RATE_MAX {
                return StatusCode::Range.raw();
            }

            st.sample_rate = hz;
            hz as i32
        }), "set_sample_rate")
    }

    fn set_gain(&self, ch: Channel, db: i32) -> Result<()> {
        let ch = check_channel(self, ch)?;
        let (min, max) = match ch.direction() {
            Direction::Rx => RX_GAIN,
            Direction::Tx => TX_GAIN,
        };

        check(self.with_channel(ch.raw(), |st| {
            if db < min || db > max {
                return StatusCode::Range.raw();
            }

            st.gain = db;
            OK
        }), "set_gain").map(|_| ())
    }

    fn configure_stream(&self, layout: ChannelLayout, format: Format, cfg: &StreamConfig)
        -> Result<()>
    {
        check(self.sync_config(layout.raw(), format.raw(), cfg), "sync_config").map(|_| ())
    }

    fn enable_channel(&self, ch: Channel, enable: bool) -> Result<()> {
        let ch = check_channel(self, ch)?;
        check(self.enable_module(ch.raw(), enable), "enable_module").map(|_| ())
    }

    fn blocking_write(&self, buf: &[u8], samples: usize, timeout_ms: u32) -> Result<()> {
        check(self.sync_tx(buf, samples, timeout_ms), "sync_tx").map(|_| ())
    }

    fn blocking_read(&self, buf: &mut [u8], samples: usize, timeout_ms: u32) -> Result<()> {
        check(self.sync_rx(buf, samples, timeout_ms), "sync_rx").map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    fn setup(dev: &SimDevice, dir: Direction) {
        dev.configure_stream(ChannelLayout::siso(dir), Format::Sc16Q11,
                             &StreamConfig::default()).unwrap();
    }

    #[test]
    fn test_attributes() {
        let dev = SimDevice::new();
        let ch = Channel::rx(0);

        dev.set_frequency(ch, 915_000_000).unwrap();
        assert_eq!(dev.frequency(ch).unwrap(), 915_000_000);
        assert_eq!(dev.set_sample_rate(ch, 2_000_000).unwrap(), 2_000_000);
        dev.set_gain(ch, 30).unwrap();

        assert!(match dev.set_frequency(ch, 10) { Err(Error::Config(_)) => true, _ => false });
        assert!(dev.set_sample_rate(ch, 100).is_err());
        assert!(dev.set_gain(Channel::rx(0), 61).is_err());
        assert!(dev.set_gain(Channel::tx(0), 61).is_ok());
        assert!(dev.set_frequency(Channel::rx(2), 915_000_000).is_err());
    }

    #[test]
    fn test_config_rules() {
        let dev = SimDevice::new();
        let mut cfg = StreamConfig::default();

        cfg.num_transfers = cfg.num_buffers;
        assert!(dev.configure_stream(ChannelLayout::RxX1, Format::Sc16Q11, &cfg).is_err());

        let cfg = StreamConfig { buffer_size: 1000, ..StreamConfig::default() };
        assert!(dev.configure_stream(ChannelLayout::RxX1, Format::Sc16Q11, &cfg).is_err());

        assert!(match dev.configure_stream(ChannelLayout::RxX1, Format::Sc16Q11Meta,
                                           &StreamConfig::default()) {
            Err(Error::Unsupported(_)) => true,
            _ => false,
        });
    }

    #[test]
    fn test_enable_requires_config() {
        let dev = SimDevice::new();
        assert!(dev.enable_channel(Channel::rx(0), true).is_err());
        assert!(dev.enable_channel(Channel::rx(0), false).is_ok());

        setup(&dev, Direction::Rx);
        dev.enable_channel(Channel::rx(0), true).unwrap();
        dev.enable_channel(Channel::rx(0), true).unwrap();
        assert_eq!(dev.air().events(), vec![Event::Enabled(Channel::rx(0))]);
    }

    #[test]
    fn test_loopback() {
        let dev = SimDevice::new();
        setup(&dev, Direction::Rx);
        setup(&dev, Direction::Tx);

        dev.enable_channel(Channel::tx(0), true).unwrap();
        dev.blocking_write(&[1; 8], 2, 10).unwrap();
        assert_eq!(dev.air().lost(), 2);

        dev.enable_channel(Channel::rx(0), true).unwrap();
        dev.blocking_write(&[1, 2, 3, 4, 5, 6, 7, 8], 2, 10).unwrap();

        let mut buf = [0u8; 8];
        dev.blocking_read(&mut buf, 2, 10).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(match dev.blocking_read(&mut buf, 1, 5) {
            Err(Error::Timeout(_)) => true,
            _ => false,
        });
    }

    #[test]
    fn test_silent_air() {
        let quiet = SimDevice::new();
        setup(&quiet, Direction::Rx);
        quiet.enable_channel(Channel::rx(0), true).unwrap();

        let mut buf = [0u8; 64];
        assert!(match quiet.blocking_read(&mut buf, 16, 5) {
            Err(Error::Timeout(_)) => true,
            _ => false,
        });

        let dev = SimDevice::new().with_noise(NOISE_LEVEL);
        setup(&dev, Direction::Rx);
        dev.set_sample_rate(Channel::rx(0), 2_000_000).unwrap();
        dev.enable_channel(Channel::rx(0), true).unwrap();

        dev.blocking_read(&mut buf, 16, 5).unwrap();

        for b in buf.chunks(2) {
            let v = i16::from_le_bytes([b[0], b[1]]);
            assert!(v >= -NOISE_LEVEL && v <= NOISE_LEVEL);
        }

        assert_eq!(dev.air().events().last(), Some(&Event::Read(16)));
    }

    #[test]
    fn test_noise_after_queued() {
        let dev = SimDevice::new().with_noise(NOISE_LEVEL);
        setup(&dev, Direction::Rx);
        setup(&dev, Direction::Tx);
        dev.enable_channel(Channel::rx(0), true).unwrap();
        dev.enable_channel(Channel::tx(0), true).unwrap();

        dev.blocking_write(&[0x7f; 4], 1, 10).unwrap();

        // A receiver still waits while a transmitter is on the air.
        let mut buf = [0u8; 8];
        assert!(dev.blocking_read(&mut buf, 2, 5).is_err());

        dev.enable_channel(Channel::tx(0), false).unwrap();
        dev.blocking_read(&mut buf, 2, 5).unwrap();
        assert_eq!(&buf[..4], &[0x7f; 4]);
    }

    #[test]
    fn test_bad_raw_values() {
        let dev = SimDevice::new();
        let cfg = StreamConfig::default();

        assert_eq!(dev.sync_config(4, Format::Sc16Q11.raw(), &cfg), StatusCode::Inval.raw());
        assert_eq!(dev.sync_config(ChannelLayout::RxX1.raw(), 9, &cfg), StatusCode::Inval.raw());
        assert_eq!(dev.sync_config(ChannelLayout::TxX1.raw(), Format::Sc16Q11.raw(), &cfg), OK);
    }

    #[test]
    fn test_backpressure() {
        let air = Air::new(2);
        let dev = SimDevice::on_air(SimDevice::default_info(), air);
        setup(&dev, Direction::Rx);
        setup(&dev, Direction::Tx);
        dev.enable_channel(Channel::rx(0), true).unwrap();
        dev.enable_channel(Channel::tx(0), true).unwrap();

        dev.blocking_write(&[0; 8], 2, 10).unwrap();
        assert!(match dev.blocking_write(&[0; 4], 1, 10) {
            Err(Error::Timeout(_)) => true,
            _ => false,
        });

        // Disabling the only receiver releases the transmitter.
        dev.enable_channel(Channel::rx(0), false).unwrap();
        dev.blocking_write(&[0; 4], 1, 10).unwrap();
        assert_eq!(dev.air().lost(), 1);
    }

    #[test]
    fn test_pair_shares_air() {
        let (tx, rx) = SimDevice::pair();
        setup(&tx, Direction::Tx);
        setup(&rx, Direction::Rx);
        rx.enable_channel(Channel::rx(1), true).unwrap();
        tx.enable_channel(Channel::tx(1), true).unwrap();

        tx.blocking_write(&[9; 4], 1, 10).unwrap();

        let mut buf = [0u8; 4];
        rx.blocking_read(&mut buf, 1, 10).unwrap();
        assert_eq!(buf, [9; 4]);
        assert!(tx.blocking_read(&mut buf, 1, 10).is_err());
    }
}
