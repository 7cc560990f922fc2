use std::cmp;
use std::io::{Read, Write};

use crate::cancel::Cancel;
use crate::channel::{Channel, ChannelLayout, Direction, LayoutChannels};
use crate::consts::{BUF_COUNT, BUF_SAMPLES, CHUNK_SAMPLES, STREAM_TIMEOUT_MS, XFER_COUNT};
use crate::error::{Error, Result};
use crate::sample::{Format, TransferBuffer};
use crate::sdr::{check_channel, Device};

/// Buffering and timeout parameters of a stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Driver buffers in the pool.
    pub num_buffers: u32,
    /// Samples per driver buffer.
    pub buffer_size: usize,
    /// Buffers allowed in flight at once.
    pub num_transfers: u32,
    /// Default timeout of one blocking call (ms).
    pub timeout_ms: u32,
    /// Samples per blocking call during bulk transfers.
    pub chunk_samples: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            num_buffers: BUF_COUNT,
            buffer_size: BUF_SAMPLES,
            num_transfers: XFER_COUNT,
            timeout_ms: STREAM_TIMEOUT_MS,
            chunk_samples: CHUNK_SAMPLES,
        }
    }
}

impl StreamConfig {
    /// Check the pool geometry and the sample format.
    pub fn validate(&self, format: Format) -> Result<()> {
        if format.has_metadata() {
            return Err(Error::Config(format!("format {} is not supported for sync streams",
                                             format)));
        }

        if self.num_buffers < 2 {
            return Err(Error::Config(format!("need at least 2 buffers, got {}",
                                             self.num_buffers)));
        }

        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be nonzero".to_string()));
        }

        if self.num_transfers < 1 || self.num_transfers > self.num_buffers / 2 {
            return Err(Error::Config(format!(
                "{} transfers in flight is invalid for {} buffers (need 1..={})",
                self.num_transfers, self.num_buffers, self.num_buffers / 2)));
        }

        if self.chunk_samples == 0 {
            return Err(Error::Config("chunk size must be nonzero".to_string()));
        }

        Ok(())
    }
}

/// Splits a transfer of `total` samples into chunk-sized calls.
///
/// The last chunk carries the exact remainder. With no total the chunks never end.
#[derive(Copy, Clone, Debug)]
pub struct Chunks {
    left: Option<u64>,
    chunk: usize,
}

impl Chunks {
    pub fn new(total: Option<u64>, chunk: usize) -> Self {
        assert!(chunk > 0);

        Chunks {
            left: total,
            chunk: chunk,
        }
    }
}

impl Iterator for Chunks {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self.left {
            None => Some(self.chunk),
            Some(0) => None,
            Some(ref mut left) => {
                let n = cmp::min(*left, self.chunk as u64);
                *left -= n;
                Some(n as usize)
            },
        }
    }
}

/// Stream lifecycle.
///
/// ```text
/// Unconfigured --configure--> Configured --enable--> Streaming
///                                  ^                     |
///                                  +-------disable-------+
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Unconfigured,
    Configured,
    Streaming,
}

/// Counters kept across enable/disable cycles.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Blocking calls completed.
    pub transfers: u64,
    /// Samples moved.
    pub samples: u64,
}

/// Outcome of a bulk send.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sent {
    pub samples: u64,
    /// The stop condition was observed before the source ran dry.
    pub stopped: bool,
}

/// One direction of a sample stream on a device.
///
/// Owns a single transfer buffer sized to one chunk and reuses it for every
/// blocking call.
pub struct Stream<'d, D: Device + ?Sized> {
    dev: &'d D,
    dir: Direction,
    channels: LayoutChannels,
    format: Format,
    cfg: StreamConfig,
    state: State,
    buf: TransferBuffer,
    stats: Stats,
}

impl<'d, D: Device + ?Sized> Stream<'d, D> {
    /// Create a single-channel stream on `ch`.
    pub fn new(dev: &'d D, ch: Channel) -> Self {
        let mut channels = LayoutChannels::new();
        channels.push(ch);

        Stream::with_channels(dev, ch.direction(), channels)
    }

    fn with_channels(dev: &'d D, dir: Direction, channels: LayoutChannels) -> Self {
        Stream {
            dev: dev,
            dir: dir,
            channels: channels,
            format: Format::Sc16Q11,
            cfg: StreamConfig::default(),
            state: State::Unconfigured,
            buf: TransferBuffer::new(Format::Sc16Q11, 0),
            stats: Stats::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> State { self.state }

    pub fn stats(&self) -> Stats { self.stats }

    /// Establish the driver buffer pool. Allowed once per stream.
    pub fn configure(&mut self, layout: ChannelLayout, format: Format, cfg: StreamConfig)
        -> Result<()>
    {
        if self.state != State::Unconfigured {
            return Err(Error::Config(format!("{} stream is already configured", self.dir)));
        }

        if layout.direction() != self.dir || layout.num_channels() != self.channels.len() {
            return Err(Error::Config(format!("layout {:?} does not match {} stream on {:?}",
                                             layout, self.dir, &self.channels[..])));
        }

        cfg.validate(format)?;

        for &ch in self.channels.iter() {
            check_channel(self.dev, ch)?;
        }

        self.dev.configure_stream(layout, format, &cfg)?;

        debug!("{} stream configured: {:?} {} {:?}", self.dir, layout, format, cfg);

        self.format = format;
        self.cfg = cfg;
        self.buf = TransferBuffer::new(format, cfg.chunk_samples);
        self.state = State::Configured;

        Ok(())
    }

    /// Enable the datapath. Enabling a streaming stream does nothing.
    pub fn enable(&mut self) -> Result<()> {
        match self.state {
            State::Unconfigured =>
                Err(Error::Config(format!("{} stream enabled before configure", self.dir))),
            State::Streaming => Ok(()),
            State::Configured => {
                for &ch in self.channels.iter() {
                    self.dev.enable_channel(ch, true)?;
                }

                info!("{}: start", self.dir);
                self.state = State::Streaming;

                Ok(())
            },
        }
    }

    /// Disable the datapath. Disabling an idle stream does nothing.
    pub fn disable(&mut self) -> Result<()> {
        if self.state != State::Streaming {
            return Ok(());
        }

        // Leave the stream idle even if the driver refuses, so no further transfers
        // are attempted on it.
        self.state = State::Configured;

        for &ch in self.channels.iter() {
            self.dev.enable_channel(ch, false)?;
        }

        info!("{}: stop", self.dir);

        Ok(())
    }

    fn check_transfer(&self, dir: Direction, samples: usize, len: usize) -> Result<()> {
        if self.state != State::Streaming {
            return Err(Error::Config(format!("{} transfer on a stream that is not enabled",
                                             self.dir)));
        }

        if dir != self.dir {
            return Err(Error::Config(format!("{} transfer on a {} stream", dir, self.dir)));
        }

        if samples == 0 || samples * self.format.bytes_per_sample() > len {
            return Err(Error::Config(format!("{} samples do not fit a {} byte buffer",
                                             samples, len)));
        }

        Ok(())
    }

    fn timeout(&self, timeout_ms: u32) -> u32 {
        if timeout_ms == 0 { self.cfg.timeout_ms } else { timeout_ms }
    }

    fn record(&mut self, samples: usize) {
        self.stats.transfers += 1;
        self.stats.samples += samples as u64;
    }

    /// Receive exactly `samples` samples into `buf`.
    ///
    /// A `timeout_ms` of zero uses the configured stream timeout.
    pub fn rx(&mut self, buf: &mut [u8], samples: usize, timeout_ms: u32) -> Result<()> {
        self.check_transfer(Direction::Rx, samples, buf.len())?;
        self.dev.blocking_read(buf, samples, self.timeout(timeout_ms))?;
        self.record(samples);

        Ok(())
    }

    /// Transmit exactly `samples` samples from `buf`, blocking on back-pressure.
    ///
    /// A `timeout_ms` of zero uses the configured stream timeout.
    pub fn tx(&mut self, buf: &[u8], samples: usize, timeout_ms: u32) -> Result<()> {
        self.check_transfer(Direction::Tx, samples, buf.len())?;
        self.dev.blocking_write(buf, samples, self.timeout(timeout_ms))?;
        self.record(samples);

        Ok(())
    }

    /// Receive `samples` samples into the stream's own buffer and return their bytes.
    ///
    /// On failure the buffer holds nothing, so stale data is never handed out.
    pub fn read(&mut self, samples: usize) -> Result<&[u8]> {
        if samples > self.buf.capacity() {
            return Err(Error::Config(format!("{} samples exceed the {} sample chunk",
                                             samples, self.buf.capacity())));
        }

        self.buf.commit(0);
        self.check_transfer(Direction::Rx, samples, samples * self.format.bytes_per_sample())?;

        let dev = self.dev;
        let timeout = self.cfg.timeout_ms;

        dev.blocking_read(self.buf.stage(samples), samples, timeout)?;

        self.buf.commit(samples);
        self.record(samples);

        Ok(self.buf.as_bytes())
    }

    /// Transmit the whole of `src` chunk by chunk.
    ///
    /// `stop` is polled after every transfer call; once it returns true no further
    /// call is made. `cancel` is polled before every chunk.
    pub fn send_from<R, F>(&mut self, src: &mut R, cancel: &Cancel, mut stop: F)
        -> Result<Sent>
        where R: Read, F: FnMut() -> bool
    {
        let mut sent = Sent::default();

        loop {
            if cancel.is_cancelled() {
                self.disable()?;
                return Err(Error::Interrupted);
            }

            let n = self.buf.fill_from(src)?;

            if n == 0 {
                break;
            }

            self.check_transfer(Direction::Tx, n, self.buf.as_bytes().len())?;

            let dev = self.dev;
            let timeout = self.cfg.timeout_ms;

            dev.blocking_write(self.buf.as_bytes(), n, timeout)?;

            self.record(n);
            sent.samples += n as u64;

            if stop() {
                sent.stopped = true;
                break;
            }
        }

        Ok(sent)
    }

    /// Capture `total` samples (or until cancelled, when `None`) into `sink`.
    ///
    /// A chunk is written to the sink only after its transfer call succeeded.
    pub fn receive_into<W: Write>(&mut self, sink: &mut W, total: Option<u64>, cancel: &Cancel)
        -> Result<u64>
    {
        let mut got = 0;

        for n in Chunks::new(total, self.cfg.chunk_samples) {
            if cancel.is_cancelled() {
                sink.flush()?;
                self.disable()?;
                return Err(Error::Interrupted);
            }

            sink.write_all(self.read(n)?)?;
            got += n as u64;
        }

        sink.flush()?;

        Ok(got)
    }
}

impl<'d, D: Device + ?Sized> Drop for Stream<'d, D> {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            warn!("unable to disable {} stream: {}", self.dir, e);
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    use crate::sdr::DevInfo;
    use crate::sim::SimDevice;

    /// Device that records every call and loops TX bytes into an RX source.
    pub struct Recorder {
        info: DevInfo,
        pub calls: Mutex<Vec<(bool, usize)>>,
        pub written: Mutex<Vec<u8>>,
        pub enables: Mutex<Vec<(Channel, bool)>>,
        pub fail_reads: Mutex<usize>,
    }

    impl Recorder {
        pub fn new() -> Self {
            Recorder {
                info: SimDevice::default_info(),
                calls: Mutex::new(vec![]),
                written: Mutex::new(vec![]),
                enables: Mutex::new(vec![]),
                fail_reads: Mutex::new(0),
            }
        }

        pub fn write_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().filter(|c| c.0).map(|c| c.1).collect()
        }
    }

    impl Device for Recorder {
        fn info(&self) -> &DevInfo { &self.info }
        fn channel_count(&self, _: Direction) -> u32 { 2 }
        fn set_frequency(&self, _: Channel, _: u64) -> Result<()> { Ok(()) }
        fn frequency(&self, _: Channel) -> Result<u64> { Ok(0) }
        fn set_sample_rate(&self, _: Channel, hz: u32) -> Result<u32> { Ok(hz) }
        fn set_gain(&self, _: Channel, _: i32) -> Result<()> { Ok(()) }

        fn configure_stream(&self, _: ChannelLayout, _: Format, _: &StreamConfig)
            -> Result<()>
        {
            Ok(())
        }

        fn enable_channel(&self, ch: Channel, enable: bool) -> Result<()> {
            self.enables.lock().unwrap().push((ch, enable));
            Ok(())
        }

        fn blocking_write(&self, buf: &[u8], samples: usize, _: u32) -> Result<()> {
            self.calls.lock().unwrap().push((true, samples));
            self.written.lock().unwrap().extend_from_slice(&buf[..samples * 4]);
            Ok(())
        }

        fn blocking_read(&self, buf: &mut [u8], samples: usize, _: u32) -> Result<()> {
            let mut fail = self.fail_reads.lock().unwrap();

            if *fail > 0 {
                *fail -= 1;
                return Err(Error::from_status(-6, "sync_rx"));
            }

            self.calls.lock().unwrap().push((false, samples));

            for (i, b) in buf[..samples * 4].iter_mut().enumerate() {
                *b = i as u8;
            }

            Ok(())
        }
    }

    fn tx_stream(dev: &Recorder) -> Stream<Recorder> {
        let mut s = Stream::new(dev, Channel::tx(0));
        s.configure(ChannelLayout::TxX1, Format::Sc16Q11, StreamConfig::default()).unwrap();
        s.enable().unwrap();
        s
    }

    fn pattern(samples: usize) -> Vec<u8> {
        (0..samples * 4).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_chunks() {
        assert_eq!(Chunks::new(Some(2048), 1024).collect::<Vec<_>>(), vec![1024, 1024]);
        assert_eq!(Chunks::new(Some(2050), 1024).collect::<Vec<_>>(), vec![1024, 1024, 2]);
        assert_eq!(Chunks::new(Some(0), 1024).count(), 0);
        assert_eq!(Chunks::new(None, 8).take(3).collect::<Vec<_>>(), vec![8, 8, 8]);

        for &(n, c) in &[(1u64, 1usize), (1000, 7), (4096, 1024), (5, 10)] {
            let sizes = Chunks::new(Some(n), c).collect::<Vec<_>>();
            assert_eq!(sizes.len() as u64, (n + c as u64 - 1) / c as u64);
            assert_eq!(sizes.iter().sum::<usize>() as u64, n);
            let last = if n % c as u64 == 0 { c as u64 } else { n % c as u64 };
            assert_eq!(*sizes.last().unwrap() as u64, last);
        }
    }

    #[test]
    fn test_validate() {
        let f = Format::Sc16Q11;
        assert!(StreamConfig::default().validate(f).is_ok());
        assert!(StreamConfig { num_buffers: 1, ..Default::default() }.validate(f).is_err());
        assert!(StreamConfig { buffer_size: 0, ..Default::default() }.validate(f).is_err());
        assert!(StreamConfig { num_transfers: 0, ..Default::default() }.validate(f).is_err());
        assert!(StreamConfig { num_transfers: 9, ..Default::default() }.validate(f).is_err());
        assert!(StreamConfig { num_buffers: 2, num_transfers: 1, ..Default::default() }
                    .validate(f).is_ok());
        assert!(StreamConfig::default().validate(Format::PacketMeta).is_err());
        assert!(StreamConfig::default().validate(Format::Sc8Q7).is_ok());
    }

    #[test]
    fn test_send_2048() {
        let dev = Recorder::new();
        let src = pattern(2048);
        let mut s = tx_stream(&dev);

        let sent = s.send_from(&mut Cursor::new(&src), &Cancel::new(), || false).unwrap();
        assert_eq!(sent, Sent { samples: 2048, stopped: false });
        assert_eq!(dev.write_sizes(), vec![1024, 1024]);
        assert_eq!(*dev.written.lock().unwrap(), src);
    }

    #[test]
    fn test_send_2050() {
        let dev = Recorder::new();
        let src = pattern(2050);
        let mut s = tx_stream(&dev);

        s.send_from(&mut Cursor::new(&src), &Cancel::new(), || false).unwrap();
        assert_eq!(dev.write_sizes(), vec![1024, 1024, 2]);
        assert_eq!(*dev.written.lock().unwrap(), src);
        assert_eq!(s.stats(), Stats { transfers: 3, samples: 2050 });
    }

    #[test]
    fn test_send_drops_partial_sample() {
        let dev = Recorder::new();
        let mut src = pattern(10);
        src.truncate(39);
        let mut s = tx_stream(&dev);

        let sent = s.send_from(&mut Cursor::new(&src), &Cancel::new(), || false).unwrap();
        assert_eq!(sent.samples, 9);
        assert_eq!(*dev.written.lock().unwrap(), &src[..36]);
    }

    #[test]
    fn test_send_stop() {
        let dev = Recorder::new();
        let src = pattern(4096);
        let mut s = tx_stream(&dev);
        let mut polls = 0;

        let sent = s.send_from(&mut Cursor::new(&src), &Cancel::new(), || {
            polls += 1;
            polls == 2
        }).unwrap();

        assert_eq!(sent, Sent { samples: 2048, stopped: true });
        assert_eq!(dev.write_sizes(), vec![1024, 1024]);
    }

    #[test]
    fn test_send_cancel() {
        let dev = Recorder::new();
        let src = pattern(4096);
        let cancel = Cancel::new();
        let mut s = tx_stream(&dev);

        let c = cancel.clone();
        let res = s.send_from(&mut Cursor::new(&src), &cancel, || { c.cancel(); false });

        assert!(match res { Err(Error::Interrupted) => true, _ => false });
        assert_eq!(dev.write_sizes(), vec![1024]);
        assert_eq!(s.state(), State::Configured);
        assert_eq!(dev.enables.lock().unwrap().last(), Some(&(Channel::tx(0), false)));
    }

    #[test]
    fn test_receive_cancel_keeps_whole_chunks() {
        let dev = Recorder::new();
        let cancel = Cancel::new();
        let mut s = Stream::new(&dev, Channel::rx(0));
        s.configure(ChannelLayout::RxX1, Format::Sc16Q11, StreamConfig::default()).unwrap();
        s.enable().unwrap();

        let mut sink = Vec::new();
        s.receive_into(&mut sink, Some(3000), &cancel).unwrap();
        assert_eq!(sink.len(), 3000 * 4);

        cancel.cancel();
        let mut sink = Vec::new();
        assert!(match s.receive_into(&mut sink, None, &cancel) {
            Err(Error::Interrupted) => true,
            _ => false,
        });
        assert!(sink.is_empty());
        assert_eq!(s.state(), State::Configured);
    }

    #[test]
    fn test_receive_failure_writes_nothing() {
        let dev = Recorder::new();
        *dev.fail_reads.lock().unwrap() = 1;

        let mut s = Stream::new(&dev, Channel::rx(0));
        s.configure(ChannelLayout::RxX1, Format::Sc16Q11, StreamConfig::default()).unwrap();
        s.enable().unwrap();

        let mut sink = Vec::new();
        let err = s.receive_into(&mut sink, Some(10), &Cancel::new()).unwrap_err();
        assert!(err.is_retryable());
        assert!(sink.is_empty());

        assert_eq!(s.receive_into(&mut sink, Some(10), &Cancel::new()).unwrap(), 10);
        assert_eq!(sink.len(), 40);
    }

    #[test]
    fn test_state_machine() {
        let dev = Recorder::new();
        let mut s = Stream::new(&dev, Channel::rx(0));

        assert!(match s.enable() { Err(Error::Config(_)) => true, _ => false });
        assert!(s.disable().is_ok());
        assert!(s.configure(ChannelLayout::TxX1, Format::Sc16Q11,
                            StreamConfig::default()).is_err());
        assert!(s.configure(ChannelLayout::RxX2, Format::Sc16Q11,
                            StreamConfig::default()).is_err());

        s.configure(ChannelLayout::RxX1, Format::Sc16Q11, StreamConfig::default()).unwrap();
        assert!(s.configure(ChannelLayout::RxX1, Format::Sc16Q11,
                            StreamConfig::default()).is_err());

        let mut buf = [0u8; 16];
        assert!(match s.rx(&mut buf, 4, 0) { Err(Error::Config(_)) => true, _ => false });

        s.enable().unwrap();
        s.rx(&mut buf, 4, 0).unwrap();
        s.enable().unwrap();
        assert_eq!(s.stats().transfers, 1);
        assert!(s.rx(&mut buf, 5, 0).is_err());
        assert!(s.tx(&buf, 4, 0).is_err());

        s.disable().unwrap();
        s.disable().unwrap();
        assert!(s.rx(&mut buf, 4, 0).is_err());

        assert_eq!(*dev.enables.lock().unwrap(),
                   vec![(Channel::rx(0), true), (Channel::rx(0), false)]);

        // Symmetric re-enable keeps the counters.
        s.enable().unwrap();
        s.rx(&mut buf, 4, 0).unwrap();
        assert_eq!(s.stats(), Stats { transfers: 2, samples: 8 });
    }

    #[test]
    fn test_mimo_enables_both() {
        let dev = Recorder::new();
        let mut s = Stream::with_channels(&dev, Direction::Tx,
                                          [Channel::tx(0), Channel::tx(1)].into());

        assert!(s.configure(ChannelLayout::TxX1, Format::Sc16Q11,
                            StreamConfig::default()).is_err());
        s.configure(ChannelLayout::TxX2, Format::Sc16Q11, StreamConfig::default()).unwrap();
        s.enable().unwrap();
        drop(s);

        assert_eq!(*dev.enables.lock().unwrap(), vec![
            (Channel::tx(0), true), (Channel::tx(1), true),
            (Channel::tx(0), false), (Channel::tx(1), false),
        ]);
    }

    #[test]
    fn test_timeout_isolation() {
        let dev = SimDevice::new();
        let cfg = StreamConfig { timeout_ms: 20, ..StreamConfig::default() };

        let mut rx = Stream::new(&dev, Channel::rx(0));
        rx.configure(ChannelLayout::RxX1, Format::Sc16Q11, cfg).unwrap();
        rx.enable().unwrap();

        let mut tx = Stream::new(&dev, Channel::tx(0));
        tx.configure(ChannelLayout::TxX1, Format::Sc16Q11, cfg).unwrap();
        tx.enable().unwrap();

        let first = pattern(8);
        tx.tx(&first, 8, 0).unwrap();
        assert_eq!(rx.read(8).unwrap(), &first[..]);

        // Only half of the next request is available.
        let second: Vec<u8> = pattern(16).iter().map(|b| b ^ 0xff).collect();
        tx.tx(&second[..32], 8, 0).unwrap();

        let err = rx.read(16).unwrap_err();
        assert!(err.is_retryable());

        tx.tx(&second[32..], 8, 0).unwrap();
        assert_eq!(rx.read(16).unwrap(), &second[..]);
    }
}
