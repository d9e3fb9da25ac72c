use std::{os::fd::AsRawFd, sync::atomic::Ordering, time::Duration};

use bytemuck::pod_read_unaligned;
use memmap2::MmapMut;
use psx_shm::Shm;
use rustix::{fs::Mode, shm::OFlags};
use snafu::ensure;

use crate::protocol::{
    record_size, BadMagicSnafu, BadVersionSnafu, CorruptRecordSnafu, Kind, RecordHeader,
    RingError, ShmHeader, ShmHeaderView, UnknownKindSnafu, RECORD_HDR_SIZE, SHM_HDR_SIZE,
};

const READ_POLL: Duration = Duration::from_millis(10);

/// One record ready for consumption. The payload stays inside the mapped
/// ring until [`RingReader::release`] is called for it.
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    pub kind: Kind,
    pub seq: u32,
    off: u32,
    len: u32,
}

/// Consumer end of the ring. Owned by the writer thread for the lifetime of
/// the process.
pub struct RingReader {
    _shm: Shm, // Keep shm alive but don't use it directly
    base_ptr: *mut u8,
    hdr: *mut ShmHeader,
    pub ring_len: u32,
    pub name: String,
}

// SAFETY: the raw pointers point into a shared memory mapping that stays
// valid for the lifetime of RingReader; the Shm handle keeps it alive.
unsafe impl Send for RingReader {}

impl RingReader {
    /// Attach to an existing ring created by [`crate::ring_writer::RingWriter`].
    pub fn attach(name: &str) -> Result<Self, RingError> {
        // Read-write: the consumer publishes its progress through the
        // control header so the producer can apply back-pressure.
        let shm = Shm::open(name, OFlags::RDWR, Mode::from_bits_truncate(0o600))?;

        // Map using memmap2 directly on the file descriptor
        let fd = shm.as_fd();
        let mut mapped: MmapMut = unsafe { MmapMut::map_mut(fd.as_raw_fd())? };
        let base = mapped.as_mut_ptr();
        let hdr = base.cast::<ShmHeader>();

        std::sync::atomic::fence(Ordering::Acquire);
        let (magic, version, ring_len) = {
            let hv = ShmHeaderView::new(hdr);
            (hv.magic(), hv.version(), hv.ring_len())
        };
        ensure!(magic == ShmHeader::MAGIC, BadMagicSnafu { found: magic });
        ensure!(
            version == ShmHeader::VERSION,
            BadVersionSnafu { found: version }
        );

        std::mem::forget(mapped);

        Ok(Self {
            _shm: shm,
            base_ptr: base,
            hdr,
            ring_len,
            name: name.to_string(),
        })
    }

    #[inline]
    fn header_view(&self) -> ShmHeaderView<'_> {
        ShmHeaderView::new(self.hdr)
    }

    #[inline]
    fn ring_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.base_ptr.add(SHM_HDR_SIZE as usize),
                self.ring_len as usize,
            )
        }
    }

    /// Borrow the payload of a record previously returned by
    /// [`Self::try_next`]. The borrow must end before [`Self::release`].
    #[inline]
    pub fn payload(&self, meta: &RecordMeta) -> &[u8] {
        let start = (meta.off + RECORD_HDR_SIZE) as usize;
        &self.ring_bytes()[start..start + meta.len as usize]
    }

    /// Non-blocking: fetch the next non-padding record, or None when the
    /// producer has not published anything new.
    pub fn try_next(&mut self) -> Result<Option<RecordMeta>, RingError> {
        loop {
            std::sync::atomic::fence(Ordering::Acquire);
            let hv = self.header_view();
            let rs = hv.read_seq().load(Ordering::Acquire);
            let ws = hv.write_seq().load(Ordering::Acquire);
            if rs == ws {
                return Ok(None);
            }

            let off = hv.read_off().load(Ordering::Acquire);
            let hdr_start = off as usize;
            let hdr_bytes = &self.ring_bytes()[hdr_start..hdr_start + RECORD_HDR_SIZE as usize];
            let rec_hdr: RecordHeader = pod_read_unaligned(hdr_bytes);

            ensure!(
                rec_hdr.seq == rs,
                CorruptRecordSnafu {
                    offset: off,
                    seq: rec_hdr.seq,
                    expected: rs,
                }
            );

            let kind = Kind::try_from(rec_hdr.kind).map_err(|()| {
                UnknownKindSnafu {
                    kind: rec_hdr.kind,
                    offset: off,
                }
                .build()
            })?;

            if kind == Kind::Padding {
                // dead tail, wrap to the start of the ring
                let hv = self.header_view();
                hv.read_off().store(0, Ordering::Relaxed);
                hv.read_seq().store(rs.wrapping_add(1), Ordering::Release);
                continue;
            }

            return Ok(Some(RecordMeta {
                kind,
                seq: rec_hdr.seq,
                off,
                len: rec_hdr.payload_len,
            }));
        }
    }

    /// Blocking fetch with a cooperative quit check between polls. Returns
    /// None when `should_quit` fires before a record arrives.
    pub fn wait_next(
        &mut self,
        should_quit: &mut dyn FnMut() -> bool,
    ) -> Result<Option<RecordMeta>, RingError> {
        loop {
            if let Some(meta) = self.try_next()? {
                return Ok(Some(meta));
            }
            if should_quit() {
                return Ok(None);
            }
            std::thread::sleep(READ_POLL);
        }
    }

    /// Hand the record's space back to the producer. Must only be called
    /// once per record, after all borrows of its payload have ended.
    pub fn release(&mut self, meta: &RecordMeta) {
        let rec_size = record_size(meta.len);
        let hv = self.header_view();
        let rs = hv.read_seq().load(Ordering::Acquire);
        debug_assert_eq!(rs, meta.seq);
        hv.read_off()
            .store((meta.off + rec_size) % self.ring_len, Ordering::Relaxed);
        hv.read_seq().store(rs.wrapping_add(1), Ordering::Release);
    }
}
