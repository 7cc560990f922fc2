use std::convert::TryFrom;
use std::fmt;

use arrayvec::ArrayVec;

use crate::consts::CHANNEL_INDEX_MAX;
use crate::error::{Error, Result};

/// Datapath direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    /// Direction bit used in channel encoding.
    pub fn bit(self) -> u32 {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Direction::Rx => "RX",
            Direction::Tx => "TX",
        })
    }
}

/// An addressable RX or TX datapath, encoded as `(index << 1) | direction`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Channel(u32);

impl Channel {
    pub fn rx(index: u32) -> Self { Channel(index << 1 | Direction::Rx.bit()) }
    pub fn tx(index: u32) -> Self { Channel(index << 1 | Direction::Tx.bit()) }

    pub fn new(dir: Direction, index: u32) -> Self {
        match dir {
            Direction::Rx => Channel::rx(index),
            Direction::Tx => Channel::tx(index),
        }
    }

    /// Like `new`, but rejects indices whose top bit would be shifted out.
    pub fn checked(dir: Direction, index: u32) -> Result<Self> {
        if index > CHANNEL_INDEX_MAX {
            return Err(Error::Config(format!("invalid {} channel index {}", dir, index)));
        }

        Ok(Channel::new(dir, index))
    }

    /// Encoded driver value.
    pub fn raw(self) -> u32 { self.0 }

    /// Zero-based index within the direction.
    pub fn index(self) -> u32 { self.0 >> 1 }

    pub fn direction(self) -> Direction {
        if self.0 & 1 == 0 { Direction::Rx } else { Direction::Tx }
    }
}

impl From<u32> for Channel {
    fn from(raw: u32) -> Self { Channel(raw) }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.direction(), self.index() + 1)
    }
}

/// Channels streamed by one layout: one for SISO, two for MIMO.
pub type LayoutChannels = ArrayVec<Channel, 2>;

/// Stream channel layouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelLayout {
    RxX1,
    TxX1,
    RxX2,
    TxX2,
}

impl ChannelLayout {
    /// Single-channel layout for the given direction.
    pub fn siso(dir: Direction) -> Self {
        match dir {
            Direction::Rx => ChannelLayout::RxX1,
            Direction::Tx => ChannelLayout::TxX1,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            ChannelLayout::RxX1 => 0,
            ChannelLayout::TxX1 => 1,
            ChannelLayout::RxX2 => 2,
            ChannelLayout::TxX2 => 3,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::RxX2 => Direction::Rx,
            ChannelLayout::TxX1 | ChannelLayout::TxX2 => Direction::Tx,
        }
    }

    pub fn num_channels(self) -> usize {
        match self {
            ChannelLayout::RxX1 | ChannelLayout::TxX1 => 1,
            ChannelLayout::RxX2 | ChannelLayout::TxX2 => 2,
        }
    }
}

impl TryFrom<u32> for ChannelLayout {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => ChannelLayout::RxX1,
            1 => ChannelLayout::TxX1,
            2 => ChannelLayout::RxX2,
            3 => ChannelLayout::TxX2,
            _ => return Err(Error::Config(format!("unknown channel layout {}", raw))),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(Channel::rx(0).raw(), 0);
        assert_eq!(Channel::tx(0).raw(), 1);
        assert_eq!(Channel::rx(1).raw(), 2);
        assert_eq!(Channel::tx(1).raw(), 3);

        let ch = Channel::from(3);
        assert_eq!(ch.index(), 1);
        assert_eq!(ch.direction(), Direction::Tx);
        assert_eq!(ch.to_string(), "TX2");
        assert_eq!(Channel::rx(0).to_string(), "RX1");
    }

    #[test]
    fn test_checked_index() {
        assert_eq!(Channel::checked(Direction::Tx, 1).unwrap(), Channel::tx(1));
        assert_eq!(Channel::checked(Direction::Rx, CHANNEL_INDEX_MAX).unwrap().index(),
                   CHANNEL_INDEX_MAX);

        // 0x8000_0000 would otherwise alias channel 0.
        assert!(match Channel::checked(Direction::Rx, 0x8000_0000) {
            Err(Error::Config(_)) => true,
            _ => false,
        });
        assert!(Channel::checked(Direction::Tx, u32::max_value()).is_err());
    }

    #[test]
    fn test_layout() {
        for raw in 0..4 {
            assert_eq!(ChannelLayout::try_from(raw).unwrap().raw(), raw);
        }

        assert!(ChannelLayout::try_from(4).is_err());

        assert_eq!(ChannelLayout::siso(Direction::Tx), ChannelLayout::TxX1);
        assert_eq!(ChannelLayout::RxX2.direction(), Direction::Rx);
        assert_eq!(ChannelLayout::TxX2.num_channels(), 2);
    }
}
