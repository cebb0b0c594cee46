//! Demultiplexer for the shared bulk TS endpoint.
//!
//! Every receiver's transport stream leaves the device through one bulk
//! endpoint. The bridge rewrites each packet's sync byte into a marker:
//! the low nibble stays 0x7, the high nibble carries the index of the
//! receiver the packet belongs to. Receiver 4 therefore emits packets
//! whose marker is the canonical 0x47.
//!
//! ```text
//!   wire:  [x7 .. 187 bytes ..][x7 .. 187 bytes ..][x7 ..
//!            ^ high nibble x = receiver index
//!   out:   ring[x] <- [47 .. 187 bytes ..]
//! ```
//!
//! Sync is declared only after [`SYNC_LOOKAHEAD`] packet-aligned marker
//! bytes, so payload bytes that merely look like markers do not trap the
//! scanner. One instance serves one streaming session; a new session
//! starts with a fresh instance and an empty residual.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use log::warn;

use ptx_hal::{TS_PACKET_SIZE, TS_SYNC_BYTE};

use crate::buffer::RingBuffer;

/// Consecutive packet-aligned markers required to declare sync.
pub const SYNC_LOOKAHEAD: usize = 4;

/// Upper bound on bytes carried between chunks.
pub const MAX_RESIDUAL: usize = TS_PACKET_SIZE * SYNC_LOOKAHEAD;

/// Receiver indexes expressible in the marker's high nibble.
const MAX_ROUTES: usize = 16;

/// Routing counters of one streaming session. Shared with the device
/// group so callers can watch a live session.
#[derive(Debug, Default)]
pub struct DemuxStats {
    delivered: [AtomicU64; MAX_ROUTES],
    dropped_unroutable: AtomicU64,
    dropped_buffer_full: AtomicU64,
    resync_bytes: AtomicU64,
    sync_losses: AtomicU64,
}

impl DemuxStats {
    /// Packets delivered to the given receiver index.
    pub fn delivered(&self, index: u8) -> u64 {
        self.delivered[usize::from(index & 0x0F)].load(Ordering::Relaxed)
    }

    /// Packets dropped because no ring is registered for their index.
    pub fn dropped_unroutable(&self) -> u64 {
        self.dropped_unroutable.load(Ordering::Relaxed)
    }

    /// Packets dropped because the destination ring refused them.
    pub fn dropped_buffer_full(&self) -> u64 {
        self.dropped_buffer_full.load(Ordering::Relaxed)
    }

    /// Bytes skipped while hunting for sync.
    pub fn resync_bytes(&self) -> u64 {
        self.resync_bytes.load(Ordering::Relaxed)
    }

    /// Times sync was lost after having been acquired.
    pub fn sync_losses(&self) -> u64 {
        self.sync_losses.load(Ordering::Relaxed)
    }
}

enum Candidate {
    /// All lookahead positions carry markers.
    Valid,
    /// A lookahead position carries a non-marker byte.
    Invalid,
    /// Ran out of data with every visible position still a marker.
    Undecidable,
}

/// Splits the device's bulk stream into per-receiver ring buffers.
///
/// Driven from the bus I/O thread only, hence `&mut self` and no
/// internal locking; the rings do their own synchronization.
pub struct StreamDemultiplexer {
    sinks: Vec<Option<Arc<RingBuffer>>>,
    stats: Arc<DemuxStats>,
    residual: BytesMut,
    synced: bool,
}

impl StreamDemultiplexer {
    /// `routes` pairs each wire index with the ring that should receive
    /// its packets. Indexes without a route drop their packets counted.
    pub fn new(routes: Vec<(u8, Arc<RingBuffer>)>, stats: Arc<DemuxStats>) -> Self {
        let mut sinks: Vec<Option<Arc<RingBuffer>>> = (0..MAX_ROUTES).map(|_| None).collect();
        for (index, ring) in routes {
            sinks[usize::from(index & 0x0F)] = Some(ring);
        }
        Self {
            sinks,
            stats,
            residual: BytesMut::with_capacity(MAX_RESIDUAL),
            synced: false,
        }
    }

    /// Counters of this session.
    pub fn stats(&self) -> Arc<DemuxStats> {
        Arc::clone(&self.stats)
    }

    /// Consume one bulk chunk of arbitrary size.
    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.residual.is_empty() {
            let consumed = self.scan(chunk);
            self.residual.extend_from_slice(&chunk[consumed..]);
        } else {
            let mut work = std::mem::take(&mut self.residual);
            work.extend_from_slice(chunk);
            let consumed = self.scan(&work);
            work.advance(consumed);
            self.residual = work;
        }
        debug_assert!(self.residual.len() <= MAX_RESIDUAL);
    }

    /// Marker byte: low nibble pinned to 0x7, high nibble free.
    fn is_marker(byte: u8) -> bool {
        byte & 0x0F == 0x07
    }

    /// Deliver every packet that validates out of `data`. Returns the
    /// number of bytes consumed; the undecided tail stays buffered.
    fn scan(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;
        loop {
            let remaining = data.len() - pos;
            if remaining < TS_PACKET_SIZE {
                return pos;
            }
            if self.synced {
                let marker = data[pos];
                if Self::is_marker(marker) {
                    self.deliver(marker, &data[pos..pos + TS_PACKET_SIZE]);
                    pos += TS_PACKET_SIZE;
                    continue;
                }
                self.synced = false;
                self.stats.sync_losses.fetch_add(1, Ordering::Relaxed);
                warn!("[demux] sync lost, hunting");
            }
            match self.candidate(&data[pos..]) {
                Candidate::Valid => {
                    self.synced = true;
                }
                Candidate::Undecidable => {
                    return pos;
                }
                Candidate::Invalid => {
                    pos += 1;
                    self.stats.resync_bytes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn candidate(&self, window: &[u8]) -> Candidate {
        for i in 0..SYNC_LOOKAHEAD {
            let offset = i * TS_PACKET_SIZE;
            if offset >= window.len() {
                return Candidate::Undecidable;
            }
            if !Self::is_marker(window[offset]) {
                return Candidate::Invalid;
            }
        }
        Candidate::Valid
    }

    fn deliver(&self, marker: u8, packet: &[u8]) {
        let index = usize::from(marker >> 4);
        let ring = match self.sinks[index].as_ref() {
            Some(ring) => ring,
            None => {
                self.stats.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let mut out = [0u8; TS_PACKET_SIZE];
        out.copy_from_slice(packet);
        out[0] = TS_SYNC_BYTE;
        if ring.write(&out) == 0 {
            self.stats.dropped_buffer_full.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.delivered[index].fetch_add(1, Ordering::Relaxed);
        }
    }
}
