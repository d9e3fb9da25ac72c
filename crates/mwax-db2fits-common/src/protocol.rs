use std::{
    backtrace::Backtrace,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};

use bytemuck::{Pod, Zeroable};
use snafu::Snafu;

#[derive(Snafu, Debug)]
pub enum RingError {
    #[snafu(display("I/O error: {source}"), visibility(pub(crate)))]
    Io {
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("Shared memory error: {source}"), visibility(pub(crate)))]
    Shm {
        source: rustix::io::Errno,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Ring buffer magic mismatch (found {found:#018x})"),
        visibility(pub(crate))
    )]
    BadMagic {
        found: u64,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Ring buffer version mismatch (found {found})"),
        visibility(pub(crate))
    )]
    BadVersion {
        found: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Ring length {ring_len} cannot hold a record of {needed} bytes"),
        visibility(pub(crate))
    )]
    RecordTooLarge {
        needed: u32,
        ring_len: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Ring length {ring_len} is not a positive multiple of {align}"),
        visibility(pub(crate))
    )]
    BadRingLength {
        ring_len: u32,
        align: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Timed out waiting for {needed} free bytes in the ring"),
        visibility(pub(crate))
    )]
    RingFull {
        needed: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Corrupt ring record at offset {offset} (seq {seq}, expected {expected})"),
        visibility(pub(crate))
    )]
    CorruptRecord {
        offset: u32,
        seq: u32,
        expected: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(
        display("Unknown record kind {kind} at offset {offset}"),
        visibility(pub(crate))
    )]
    UnknownKind {
        kind: u32,
        offset: u32,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl From<rustix::io::Errno> for RingError {
    fn from(source: rustix::io::Errno) -> Self {
        RingError::Shm {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<std::io::Error> for RingError {
    fn from(source: std::io::Error) -> Self {
        RingError::Io {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

/// Align `x` up to the next multiple of 2^`align_pow` bytes.
#[inline]
#[must_use]
pub const fn align_up_pow2(num_bytes: u32, align_pow: u32) -> u32 {
    let align = 1u32 << align_pow;
    (num_bytes + (align - 1)) & !(align - 1)
}

/// Records start on 16 byte boundaries so the tail of the ring always has
/// room for at least a padding record header.
pub const RING_ALIGN_SHIFT: u32 = 4;
pub const RING_ALIGN: u32 = 1 << RING_ALIGN_SHIFT;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug)]
pub struct ShmHeader {
    pub(crate) magic: u64,
    pub(crate) version: u32,
    pub(crate) ring_len: u32,
    pub(crate) write_seq: u32,
    pub(crate) write_off: u32,
    pub(crate) read_seq: u32,
    pub(crate) read_off: u32,
}

impl ShmHeader {
    pub const MAGIC: u64 = u64::from_be_bytes(*b"MWAXRING");
    pub const VERSION: u32 = 1;
}

pub const SHM_HDR_SIZE: u32 = size_of::<ShmHeader>() as u32;

/// Fixed-size prefix of each record in the ring buffer.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod, Debug)]
pub struct RecordHeader {
    pub kind: u32,
    pub payload_len: u32,
    pub seq: u32,
}

pub const RECORD_HDR_SIZE: u32 = size_of::<RecordHeader>() as u32;

/// Total aligned footprint of a record carrying `payload_len` bytes.
#[inline]
#[must_use]
pub const fn record_size(payload_len: u32) -> u32 {
    align_up_pow2(RECORD_HDR_SIZE + payload_len, RING_ALIGN_SHIFT)
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Wrap marker: the rest of the ring up to the end is dead space.
    Padding = 0,
    /// ASCII sub-observation header page.
    SubobsHeader = 1,
    /// One integration: visibilities then weights, contiguous.
    Data = 2,
    /// End of the sub-observation transfer.
    Eod = 3,
}

impl TryFrom<u32> for Kind {
    type Error = ();
    fn try_from(v: u32) -> Result<Self, ()> {
        Ok(match v {
            0 => Kind::Padding,
            1 => Kind::SubobsHeader,
            2 => Kind::Data,
            3 => Kind::Eod,
            _ => return Err(()),
        })
    }
}

impl From<Kind> for u32 {
    fn from(value: Kind) -> Self {
        value as u32
    }
}

pub(crate) struct ShmHeaderView<'a> {
    hdr: *const ShmHeader,
    _pd: PhantomData<&'a ShmHeader>,
}

impl ShmHeaderView<'_> {
    pub(crate) fn new(hdr: *const ShmHeader) -> Self {
        Self {
            hdr,
            _pd: PhantomData,
        }
    }

    #[inline]
    pub fn write_seq(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!((*self.hdr).write_seq) as *const AtomicU32) }
    }

    #[inline]
    pub fn write_off(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!((*self.hdr).write_off) as *const AtomicU32) }
    }

    #[inline]
    pub fn read_seq(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!((*self.hdr).read_seq) as *const AtomicU32) }
    }

    #[inline]
    pub fn read_off(&self) -> &AtomicU32 {
        unsafe { &*(std::ptr::addr_of!((*self.hdr).read_off) as *const AtomicU32) }
    }

    /// safe because this never changes after creation
    #[inline]
    pub fn magic(&self) -> u64 {
        unsafe { (*self.hdr).magic }
    }

    /// safe because this never changes after creation
    #[inline]
    pub fn version(&self) -> u32 {
        unsafe { (*self.hdr).version }
    }

    /// safe because this never changes after creation
    #[inline]
    pub fn ring_len(&self) -> u32 {
        unsafe { (*self.hdr).ring_len }
    }

    /// Bytes currently occupied by unconsumed records (padding included).
    pub fn used(&self) -> u32 {
        let ws = self.write_seq().load(Ordering::Acquire);
        let rs = self.read_seq().load(Ordering::Acquire);
        if ws == rs {
            return 0;
        }
        let wo = self.write_off().load(Ordering::Acquire);
        let ro = self.read_off().load(Ordering::Acquire);
        if wo == ro {
            // non-empty with equal offsets means completely full
            self.ring_len()
        } else if wo > ro {
            wo - ro
        } else {
            self.ring_len() - ro + wo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_land_on_alignment_boundaries() {
        assert_eq!(record_size(0), 16);
        assert_eq!(record_size(4), 16);
        assert_eq!(record_size(5), 32);
        assert_eq!(record_size(100), 112);
    }

    #[test]
    fn kinds_round_trip_through_u32() {
        for kind in [Kind::Padding, Kind::SubobsHeader, Kind::Data, Kind::Eod] {
            assert_eq!(Kind::try_from(u32::from(kind)), Ok(kind));
        }
        assert!(Kind::try_from(17).is_err());
    }

    #[test]
    fn control_header_is_pod_sized() {
        assert_eq!(SHM_HDR_SIZE, 32);
        assert_eq!(RECORD_HDR_SIZE, 12);
    }
}
