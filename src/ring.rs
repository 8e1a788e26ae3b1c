// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Four-slot frame ring with an oldest-drop admission policy.
//!
//! The ring never blocks: `acquire_for_fill` always succeeds, dropping the
//! oldest non-`FREE` slot under pressure rather than waiting for the
//! consumer. Each slot owns a fixed-capacity buffer allocated once at
//! construction and never reallocated; producer and consumer copy into and
//! out of a slot while holding that slot's buffer lock only for the
//! duration of the copy, never across a socket or capture call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::StateFault;

/// Fixed ring size. Not configurable — REQ-FW-050 / spec.md §1 Non-goals.
pub const RING_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filling,
    Ready,
    Sending,
}

struct SlotMeta {
    state: SlotState,
    frame_number: u32,
    total_packets: u16,
    sent_packets: u16,
}

impl SlotMeta {
    fn free() -> Self {
        Self { state: SlotState::Free, frame_number: 0, total_packets: 0, sent_packets: 0 }
    }
}

struct RingMeta {
    slots: [SlotMeta; RING_SLOTS],
    oldest_index: usize,
}

/// Point-in-time counters for the ring. `frames_received`/`frames_sent`
/// count successful `FILLING->READY` / `SENDING->FREE` transitions;
/// `frames_dropped`/`overruns` count involuntary transitions back to
/// `FREE` caused by the oldest-drop policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameRingStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub overruns: u64,
}

#[derive(Default)]
struct RingCounters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    overruns: AtomicU64,
}

/// A four-slot producer/consumer frame buffer with oldest-drop admission.
pub struct FrameRing {
    capacity: usize,
    meta: Mutex<RingMeta>,
    buffers: [Mutex<Vec<u8>>; RING_SLOTS],
    counters: RingCounters,
}

/// A frame copied out of a `READY` slot, now owned by the consumer while
/// the slot sits in `SENDING`.
pub struct ReadyFrame {
    pub frame_number: u32,
    pub payload: Vec<u8>,
}

impl FrameRing {
    /// Build a ring whose slot capacity is `rows * cols * ceil(bit_depth / 8)`,
    /// computed once and fixed for the ring's lifetime.
    pub fn new(rows: u16, cols: u16, bit_depth: u8) -> Self {
        let bytes_per_pixel = (bit_depth as usize).div_ceil(8);
        let capacity = rows as usize * cols as usize * bytes_per_pixel;
        Self::with_capacity(capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            meta: Mutex::new(RingMeta {
                slots: std::array::from_fn(|_| SlotMeta::free()),
                oldest_index: 0,
            }),
            buffers: std::array::from_fn(|_| Mutex::new(vec![0u8; capacity])),
            counters: RingCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index_of(frame_number: u32) -> usize {
        (frame_number % RING_SLOTS as u32) as usize
    }

    /// Acquire a slot to fill with `frame_number`, applying the oldest-drop
    /// policy if the mapped slot is not `FREE`. Never fails; returns the
    /// slot's fixed capacity.
    pub fn acquire_for_fill(&self, frame_number: u32) -> usize {
        let index = Self::index_of(frame_number);
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());

        if meta.slots[index].state != SlotState::Free {
            let oldest = meta.oldest_index;
            // Prefer a SENDING victim; fall back to any non-FREE slot at or
            // after oldest_index, walking forward.
            let mut drop_index = oldest;
            let mut found_sending = false;
            for step in 0..RING_SLOTS {
                let idx = (oldest + step) % RING_SLOTS;
                if meta.slots[idx].state == SlotState::Sending {
                    drop_index = idx;
                    found_sending = true;
                    break;
                }
            }
            if !found_sending {
                for step in 0..RING_SLOTS {
                    let idx = (oldest + step) % RING_SLOTS;
                    if meta.slots[idx].state != SlotState::Free {
                        drop_index = idx;
                        break;
                    }
                }
            }

            meta.slots[drop_index] = SlotMeta::free();
            meta.oldest_index = (drop_index + 1) % RING_SLOTS;
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            self.counters.overruns.fetch_add(1, Ordering::Relaxed);

            let slot = &mut meta.slots[drop_index];
            slot.state = SlotState::Filling;
            slot.frame_number = frame_number;
            // The victim slot is not necessarily `index` (drop_index may
            // differ when frame_number's natural slot was already FREE by
            // the time we got here — impossible in this branch, but keep
            // the invariant explicit: the slot we fill is the one we drop).
            return self.capacity;
        }

        let slot = &mut meta.slots[index];
        slot.state = SlotState::Filling;
        slot.frame_number = frame_number;
        self.capacity
    }

    /// Copy `data` into the slot currently `FILLING` for `frame_number`.
    /// `data` must not exceed the ring's fixed capacity.
    pub fn write_fill(&self, frame_number: u32, data: &[u8]) -> Result<(), StateFault> {
        let index = self.filling_index(frame_number)?;
        let mut buf = self.buffers[index].lock().unwrap_or_else(|e| e.into_inner());
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn filling_index(&self, frame_number: u32) -> Result<usize, StateFault> {
        let index = Self::index_of(frame_number);
        let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &meta.slots[index];
        if slot.state != SlotState::Filling || slot.frame_number != frame_number {
            return Err(StateFault::InvalidSlotState);
        }
        Ok(index)
    }

    /// Transition the slot holding `frame_number` from `FILLING` to `READY`.
    pub fn commit_filled(&self, frame_number: u32) -> Result<(), StateFault> {
        let index = Self::index_of(frame_number);
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut meta.slots[index];
        if slot.state != SlotState::Filling || slot.frame_number != frame_number {
            return Err(StateFault::InvalidSlotState);
        }
        slot.state = SlotState::Ready;
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Acquire the oldest `READY` slot (FIFO by frame number, walking from
    /// `oldest_index` forward), transitioning it to `SENDING` and copying
    /// its payload out so the consumer can send without holding the ring
    /// lock.
    pub fn acquire_ready(&self) -> Result<ReadyFrame, StateFault> {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let oldest = meta.oldest_index;
        let mut chosen: Option<(usize, u32)> = None;
        for step in 0..RING_SLOTS {
            let idx = (oldest + step) % RING_SLOTS;
            let slot = &meta.slots[idx];
            if slot.state == SlotState::Ready {
                let better = match chosen {
                    Some((_, best_frame)) => slot.frame_number < best_frame,
                    None => true,
                };
                if better {
                    chosen = Some((idx, slot.frame_number));
                }
            }
        }

        let (index, frame_number) = chosen.ok_or(StateFault::NoneReady)?;
        meta.slots[index].state = SlotState::Sending;
        drop(meta);

        let buf = self.buffers[index].lock().unwrap_or_else(|e| e.into_inner());
        Ok(ReadyFrame { frame_number, payload: buf.clone() })
    }

    /// Transition the slot holding `frame_number` from `SENDING` to `FREE`.
    pub fn release_sent(&self, frame_number: u32) -> Result<(), StateFault> {
        let index = Self::index_of(frame_number);
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut meta.slots[index];
        if slot.state != SlotState::Sending || slot.frame_number != frame_number {
            return Err(StateFault::InvalidSlotState);
        }
        *slot = SlotMeta::free();
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        if index == meta.oldest_index {
            meta.oldest_index = (index + 1) % RING_SLOTS;
        }
        Ok(())
    }

    pub fn slot_state(&self, frame_number: u32) -> SlotState {
        let index = Self::index_of(frame_number);
        self.meta.lock().unwrap_or_else(|e| e.into_inner()).slots[index].state
    }

    pub fn snapshot_stats(&self) -> FrameRingStats {
        FrameRingStats {
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            overruns: self.counters.overruns.load(Ordering::Relaxed),
        }
    }
}
