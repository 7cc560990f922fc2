/// Bytes occupied by one SC16Q11 sample (16-bit I, 16-bit Q).
pub const SC16Q11_BYTES: usize = 4;
/// Bytes occupied by one SC8Q7 sample (8-bit I, 8-bit Q).
pub const SC8Q7_BYTES: usize = 2;

/// Smallest value representable by a 12-bit SC16Q11 component.
pub const SC16Q11_MIN: i16 = -2048;
/// Largest value representable by a 12-bit SC16Q11 component.
pub const SC16Q11_MAX: i16 = 2047;

/// Number of driver sample buffers to allocate per stream.
pub const BUF_COUNT: u32 = 16;
/// Size of each driver sample buffer (samples).
pub const BUF_SAMPLES: usize = 8192;
/// Number of buffers allowed in flight at once.
pub const XFER_COUNT: u32 = 8;
/// Default timeout for a single blocking transfer call (ms).
pub const STREAM_TIMEOUT_MS: u32 = 3500;

/// Driver DMA transfers must be a multiple of this many bytes.
pub const DMA_ALIGN_BYTES: usize = 4096;

/// Samples moved per blocking call during bulk file transfers.
pub const CHUNK_SAMPLES: usize = 1024;

/// How long a transmitter waits for its receiver to report ready (seconds).
pub const READY_TIMEOUT_SECS: u64 = 60;
/// Interval between cancellation checks while waiting for ready (ms).
pub const READY_POLL_MS: u64 = 50;

/// Largest channel index that fits beside the direction bit.
pub const CHANNEL_INDEX_MAX: u32 = u32::MAX >> 1;
