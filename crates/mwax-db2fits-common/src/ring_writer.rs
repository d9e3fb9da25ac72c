use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use bytemuck::{bytes_of, Pod};
use psx_shm::Shm;
use rustix::{fs::Mode, shm::OFlags};
use snafu::ensure;

use crate::protocol::{
    record_size, Kind, RecordHeader, RingError, ShmHeader, ShmHeaderView, BadRingLengthSnafu,
    RecordTooLargeSnafu, RingFullSnafu, RECORD_HDR_SIZE, RING_ALIGN, SHM_HDR_SIZE,
};

/// How long the producer will wait for the consumer to free space before
/// giving up on a write.
pub const DEFAULT_SPACE_TIMEOUT: Duration = Duration::from_secs(5);

const SPACE_POLL: Duration = Duration::from_millis(1);

/// Producer end of the ring. One per shared memory region; the upstream
/// correlator owns it in production, test data generators own it in tests.
pub struct RingWriter {
    _shm: Shm, // Keep shm alive but don't use it directly
    base_ptr: *mut u8,
    hdr: *mut ShmHeader,
    pub ring_len: u32,
    pub name: String,
    pub space_timeout: Duration,
}

// SAFETY: the raw pointers point into a shared memory mapping that stays
// valid for the lifetime of RingWriter; the Shm handle keeps it alive.
unsafe impl Send for RingWriter {}

impl RingWriter {
    pub fn create(name: &str, ring_len: u32) -> Result<Self, RingError> {
        ensure!(
            ring_len >= RING_ALIGN && ring_len % RING_ALIGN == 0,
            BadRingLengthSnafu {
                ring_len,
                align: RING_ALIGN,
            }
        );

        let total_len = SHM_HDR_SIZE + ring_len;

        let mut shm = Shm::open(
            name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::from_bits_truncate(0o600),
        )?;
        shm.set_size(total_len as usize)?;

        let mut mapped = unsafe { shm.map(0x0)? };
        let base = mapped.map().as_mut_ptr();
        let hdr = base.cast::<ShmHeader>();

        unsafe {
            (*hdr).magic = ShmHeader::MAGIC;
            (*hdr).version = ShmHeader::VERSION;
            (*hdr).ring_len = ring_len;
        }

        let hv = ShmHeaderView::new(hdr);
        hv.write_seq().store(0, Ordering::Relaxed);
        hv.write_off().store(0, Ordering::Relaxed);
        hv.read_seq().store(0, Ordering::Relaxed);
        hv.read_off().store(0, Ordering::Release);

        // The mapping must outlive `mapped`; the Shm handle keeps the region
        // alive and we never unmap until drop.
        std::mem::forget(mapped);

        Ok(Self {
            _shm: shm,
            base_ptr: base,
            hdr,
            ring_len,
            name: name.to_string(),
            space_timeout: DEFAULT_SPACE_TIMEOUT,
        })
    }

    #[inline]
    fn header_view(&self) -> ShmHeaderView<'_> {
        ShmHeaderView::new(self.hdr)
    }

    fn ring_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base_ptr.add(SHM_HDR_SIZE as usize),
                self.ring_len as usize,
            )
        }
    }

    #[inline]
    fn put_pod_at<T: Pod>(&mut self, ring_off: u32, v: &T) {
        self.put_bytes_at(ring_off, bytes_of(v));
    }

    #[inline]
    fn put_bytes_at(&mut self, ring_off: u32, v: &[u8]) {
        let ring = self.ring_mut();
        ring[ring_off as usize..ring_off as usize + v.len()].copy_from_slice(v);
    }

    pub fn write_subobs_header(&mut self, header: &[u8]) -> Result<u32, RingError> {
        self.write_record(Kind::SubobsHeader, header)
    }

    pub fn write_block(&mut self, block: &[u8]) -> Result<u32, RingError> {
        self.write_record(Kind::Data, block)
    }

    pub fn write_eod(&mut self) -> Result<u32, RingError> {
        self.write_record(Kind::Eod, &[])
    }

    /// Append one record, blocking (bounded poll) while the consumer has not
    /// yet freed enough space. This is the cooperative back-pressure point.
    pub fn write_record(&mut self, kind: Kind, payload: &[u8]) -> Result<u32, RingError> {
        let rec_size = record_size(payload.len() as u32);
        ensure!(
            rec_size <= self.ring_len,
            RecordTooLargeSnafu {
                needed: rec_size,
                ring_len: self.ring_len,
            }
        );

        let (mut seq, mut off) = {
            let hv = self.header_view();
            (
                hv.write_seq().load(Ordering::Acquire),
                hv.write_off().load(Ordering::Acquire),
            )
        };

        // A record never straddles the end of the ring; the tail is filled
        // with a padding record instead.
        let remain = self.ring_len - off;
        let needed = if rec_size <= remain {
            rec_size
        } else {
            remain + rec_size
        };

        self.wait_for_space(needed)?;

        if rec_size > remain {
            let pad = RecordHeader {
                kind: Kind::Padding.into(),
                payload_len: remain - RECORD_HDR_SIZE,
                seq,
            };
            self.put_pod_at(off, &pad);
            std::sync::atomic::fence(Ordering::Release);
            let hv = self.header_view();
            seq = seq.wrapping_add(1);
            hv.write_off().store(0, Ordering::Relaxed);
            hv.write_seq().store(seq, Ordering::Release);
            off = 0;
        }

        let header = RecordHeader {
            kind: kind.into(),
            payload_len: payload.len() as u32,
            seq,
        };

        // payload first, then header, then the control words
        self.put_bytes_at(off + RECORD_HDR_SIZE, payload);
        self.put_pod_at(off, &header);
        std::sync::atomic::fence(Ordering::Release);

        let hv = self.header_view();
        hv.write_off()
            .store((off + rec_size) % self.ring_len, Ordering::Relaxed);
        hv.write_seq().store(seq.wrapping_add(1), Ordering::Release);

        Ok(seq)
    }

    fn wait_for_space(&self, needed: u32) -> Result<(), RingError> {
        let deadline = Instant::now() + self.space_timeout;
        loop {
            let free = self.ring_len - self.header_view().used();
            if free >= needed {
                return Ok(());
            }
            ensure!(Instant::now() < deadline, RingFullSnafu { needed });
            std::thread::sleep(SPACE_POLL);
        }
    }
}
