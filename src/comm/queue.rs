//! # Packet Queue
//!
//! One fixed-size circular byte buffer holding variable-length packets, shared
//! by any number of producers (receive paths, transmit callers) and exactly one
//! consumer (the manager task).
//!
//! ## Slot layout
//!
//! ```text
//! [status:1][direction:1][interface:1][size:2 LE][timestamp:4 LE][payload:size]
//! ```
//!
//! ## Cursors
//!
//! - `push_index` is only written while holding the push lock.
//! - `pop_index` is only written by the [`QueueConsumer`].
//!
//! The queue is empty when both cursors are equal. A reservation never makes
//! them equal, so a full queue is never mistaken for an empty one. When the
//! tail is too short for a reservation, an `EndOfQueue` marker is left at the
//! old tail and the slot starts again at offset 0.
//!
//! Producers write slot metadata before publishing `push_index` (release) and
//! set the status byte last (release). The consumer reads `push_index` and the
//! status byte with acquire ordering, so it never sees a half-written slot.
//!
//! ## Ordering
//!
//! Packets are delivered in the order their slots were reserved. Between
//! producers racing for the push lock that order is whatever the lock grants
//! and is not deterministic; only each producer's own packets keep their
//! relative order.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{FlightLinkError, Result};

/// Metadata bytes preceding every payload
pub const SLOT_METADATA_SIZE: usize = 9;

/// Smallest usable buffer (one metadata block plus one payload byte)
pub const MIN_BUFFER_SIZE: usize = SLOT_METADATA_SIZE + 2;

const STATUS_OFFSET: usize = 0;
const DIRECTION_OFFSET: usize = 1;
const INTERFACE_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 3;
const TIMESTAMP_OFFSET: usize = 5;

/// Slot status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    /// Physical end of data; the next slot is at offset 0
    EndOfQueue = 0,
    /// Producer owns the slot and is filling it
    Reserved = 1,
    /// Complete and waiting for the consumer
    Ready = 2,
    /// Cancelled before it became ready
    Deleted = 3,
}

impl SlotStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SlotStatus::EndOfQueue),
            1 => Some(SlotStatus::Reserved),
            2 => Some(SlotStatus::Ready),
            3 => Some(SlotStatus::Deleted),
            _ => None,
        }
    }
}

/// Which way a queued packet travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Received on `interface`, waiting for dispatch to handlers
    Inbound = 0,
    /// Waiting to be sent on `interface`
    Outbound = 1,
}

impl Direction {
    fn from_u8(value: u8) -> Self {
        if value == Direction::Outbound as u8 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

/// Opaque reference to a slot, valid from a successful `*_begin` until the
/// matching end or cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHandle(usize);

impl PacketHandle {
    /// Byte offset of the slot inside the queue buffer
    pub fn offset(&self) -> usize {
        self.0
    }
}

/// Snapshot of a slot's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub status: SlotStatus,
    pub direction: Direction,
    pub interface: u8,
    pub size: usize,
    /// Milliseconds since queue creation when the slot was reserved
    pub timestamp: u32,
}

/// Events raised towards the waiting side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    PacketPushed,
    PacketPopped,
}

/// Wake-up signal between producers and the consumer
///
/// `notify` never blocks and may be called from any thread. A notification
/// with nobody waiting is stored as a permit, so a wake-up is never lost.
#[derive(Debug, Default)]
pub struct QueueSignal {
    pushed: Notify,
    popped: Notify,
}

impl QueueSignal {
    /// Raise `event`
    pub fn notify(&self, event: QueueEvent) {
        match event {
            QueueEvent::PacketPushed => self.pushed.notify_one(),
            QueueEvent::PacketPopped => self.popped.notify_one(),
        }
    }

    /// Suspend until `event` is raised
    pub async fn wait(&self, event: QueueEvent) {
        match event {
            QueueEvent::PacketPushed => self.pushed.notified().await,
            QueueEvent::PacketPopped => self.popped.notified().await,
        }
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    pushed: AtomicU64,
    popped: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

/// Producer side of the packet queue
///
/// Shared through an `Arc`; every method takes `&self` and may be called
/// concurrently. Only the cursor update in [`PacketQueue::push_begin_with`]
/// (with its hook) and the tail check in [`PacketQueue::push_cancel`] run
/// under the push lock; metadata and payload writes to a reserved slot need
/// no lock because the slot belongs to its producer until it is ended or
/// cancelled.
#[derive(Debug)]
pub struct PacketQueue {
    buffer: Box<[AtomicU8]>,
    push_lock: Mutex<()>,
    push_index: AtomicUsize,
    pop_index: AtomicUsize,
    signal: QueueSignal,
    epoch: Instant,
    counters: QueueCounters,
}

impl PacketQueue {
    /// Initialize a queue over `buffer_size` bytes
    ///
    /// Returns the shared producer side and the single consumer. Sizes below
    /// [`MIN_BUFFER_SIZE`] are raised to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use flightlink::comm::queue::{Direction, PacketQueue};
    ///
    /// let (queue, mut consumer) = PacketQueue::new(256);
    /// let handle = queue.push_begin(4, 0, Direction::Inbound)?;
    /// queue.store_bytes(handle, 0, &[1, 2, 3, 4])?;
    /// queue.push_end(handle)?;
    ///
    /// assert_eq!(consumer.pop_begin(), Some(handle));
    /// consumer.pop_end();
    /// assert!(queue.is_empty());
    /// # Ok::<(), flightlink::error::FlightLinkError>(())
    /// ```
    pub fn new(buffer_size: usize) -> (Arc<Self>, QueueConsumer) {
        let size = buffer_size.max(MIN_BUFFER_SIZE);
        let buffer = (0..size).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();

        let queue = Arc::new(Self {
            buffer: buffer.into_boxed_slice(),
            push_lock: Mutex::new(()),
            push_index: AtomicUsize::new(0),
            pop_index: AtomicUsize::new(0),
            signal: QueueSignal::default(),
            epoch: Instant::now(),
            counters: QueueCounters::default(),
        });

        let consumer = QueueConsumer {
            queue: Arc::clone(&queue),
            current: None,
        };

        (queue, consumer)
    }

    /// Total buffer size in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Largest payload a single slot can ever hold
    pub fn max_packet_size(&self) -> usize {
        (self.capacity() - SLOT_METADATA_SIZE - 1).min(u16::MAX as usize)
    }

    /// Reserve a slot for `size` payload bytes
    ///
    /// # Arguments
    ///
    /// * `size` - Payload bytes to reserve
    /// * `interface` - Source interface (inbound) or target interface (outbound)
    /// * `direction` - Which way the packet travels
    ///
    /// # Returns
    ///
    /// * `Result<PacketHandle>` - Handle to the reserved slot
    ///
    /// # Errors
    ///
    /// - `PacketTooLarge` if the slot could never fit the buffer
    /// - `QueueFull` if there is currently no contiguous free space; the queue
    ///   is left untouched
    pub fn push_begin(&self, size: usize, interface: u8, direction: Direction) -> Result<PacketHandle> {
        self.push_begin_with(size, interface, direction, |_| ())
            .map(|(handle, ())| handle)
    }

    /// Reserve a slot and run `on_reserved` before the push lock is released
    ///
    /// `on_reserved` only runs when the reservation succeeds. Anything it
    /// assigns is therefore ordered exactly like the slots themselves, which
    /// is how sequence numbers stay monotonic in delivery order.
    ///
    /// # Errors
    ///
    /// Same as [`PacketQueue::push_begin`]
    pub fn push_begin_with<T, F>(
        &self,
        size: usize,
        interface: u8,
        direction: Direction,
        on_reserved: F,
    ) -> Result<(PacketHandle, T)>
    where
        F: FnOnce(PacketHandle) -> T,
    {
        if size > self.max_packet_size() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(FlightLinkError::PacketTooLarge {
                size,
                max: self.max_packet_size(),
            });
        }

        let need = SLOT_METADATA_SIZE + size;
        let capacity = self.capacity();

        let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let push = self.push_index.load(Ordering::Relaxed);
        let pop = self.pop_index.load(Ordering::Acquire);

        let offset = if push >= pop {
            let end = push + need;
            if end < capacity || (end == capacity && pop != 0) {
                push
            } else if need < pop {
                self.buffer[push].store(SlotStatus::EndOfQueue as u8, Ordering::Relaxed);
                0
            } else {
                return Err(self.reject(size));
            }
        } else if push + need < pop {
            push
        } else {
            return Err(self.reject(size));
        };

        self.write_u8(offset + DIRECTION_OFFSET, direction as u8);
        self.write_u8(offset + INTERFACE_OFFSET, interface);
        self.write_u16(offset + SIZE_OFFSET, size as u16);
        self.write_u32(offset + TIMESTAMP_OFFSET, self.tick());
        self.set_status(offset, SlotStatus::Reserved);

        let handle = PacketHandle(offset);
        let value = on_reserved(handle);

        let next = if offset + need == capacity { 0 } else { offset + need };
        self.push_index.store(next, Ordering::Release);

        Ok((handle, value))
    }

    /// Mark a reserved slot ready and wake the consumer
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is not currently reserved
    pub fn push_end(&self, handle: PacketHandle) -> Result<()> {
        self.reserved_info(handle)?;
        self.set_status(handle.0, SlotStatus::Ready);
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        self.signal.notify(QueueEvent::PacketPushed);
        Ok(())
    }

    /// Abandon a reserved slot without delivering it
    ///
    /// If the slot is the newest reservation its space is handed straight back
    /// to the next `push_begin`. Otherwise it is marked `Deleted` and the
    /// consumer skips it; the consumer is woken in that case so packets queued
    /// behind the cancelled slot are not stranded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is not currently reserved
    pub fn push_cancel(&self, handle: PacketHandle) -> Result<()> {
        self.reserved_info(handle)?;

        {
            let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.push_index.load(Ordering::Relaxed) == self.slot_end(handle.0) {
                // Status stays Reserved: a consumer holding a stale push_index
                // must block on it rather than skip past the rolled-back cursor
                self.push_index.store(handle.0, Ordering::Release);
            } else {
                self.set_status(handle.0, SlotStatus::Deleted);
                self.signal.pushed.notify_one();
            }
        }

        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write one payload byte of a reserved slot
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is not reserved or `index` is past
    /// the reserved size
    pub fn store_byte(&self, handle: PacketHandle, index: usize, data: u8) -> Result<()> {
        let info = self.reserved_info(handle)?;
        if index >= info.size {
            return Err(FlightLinkError::InvalidHandle(handle.0));
        }
        self.write_u8(handle.0 + SLOT_METADATA_SIZE + index, data);
        Ok(())
    }

    /// Write a run of payload bytes of a reserved slot starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is not reserved or the run does not
    /// fit inside the reserved size
    pub fn store_bytes(&self, handle: PacketHandle, offset: usize, data: &[u8]) -> Result<()> {
        let info = self.reserved_info(handle)?;
        if offset + data.len() > info.size {
            return Err(FlightLinkError::InvalidHandle(handle.0));
        }

        let start = handle.0 + SLOT_METADATA_SIZE + offset;
        for (i, &byte) in data.iter().enumerate() {
            self.write_u8(start + i, byte);
        }
        Ok(())
    }

    /// Read a slot's metadata
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle or its recorded size falls
    /// outside the buffer
    pub fn packet_info(&self, handle: PacketHandle) -> Result<PacketInfo> {
        let offset = handle.0;
        if offset + SLOT_METADATA_SIZE > self.capacity() {
            return Err(FlightLinkError::InvalidHandle(offset));
        }

        let status = SlotStatus::from_u8(self.buffer[offset + STATUS_OFFSET].load(Ordering::Acquire))
            .ok_or(FlightLinkError::InvalidHandle(offset))?;
        let size = self.read_u16(offset + SIZE_OFFSET) as usize;
        if offset + SLOT_METADATA_SIZE + size > self.capacity() {
            return Err(FlightLinkError::InvalidHandle(offset));
        }

        Ok(PacketInfo {
            status,
            direction: Direction::from_u8(self.read_u8(offset + DIRECTION_OFFSET)),
            interface: self.read_u8(offset + INTERFACE_OFFSET),
            size,
            timestamp: self.read_u32(offset + TIMESTAMP_OFFSET),
        })
    }

    /// Copy a slot's payload into `dst`
    ///
    /// # Returns
    ///
    /// * `Result<usize>` - Bytes copied, `min(size, dst.len())`
    pub fn read_payload(&self, handle: PacketHandle, dst: &mut [u8]) -> Result<usize> {
        let info = self.packet_info(handle)?;
        let len = info.size.min(dst.len());
        let start = handle.0 + SLOT_METADATA_SIZE;

        for (i, byte) in dst[..len].iter_mut().enumerate() {
            *byte = self.read_u8(start + i);
        }
        Ok(len)
    }

    /// True when nothing is reserved or queued
    pub fn is_empty(&self) -> bool {
        self.push_index.load(Ordering::Acquire) == self.pop_index.load(Ordering::Acquire)
    }

    /// Unused bytes in the buffer
    ///
    /// Not necessarily contiguous, so a slot of this size may still not fit.
    pub fn free_space(&self) -> usize {
        let push = self.push_index.load(Ordering::Acquire);
        let pop = self.pop_index.load(Ordering::Acquire);

        if push >= pop {
            self.capacity() - push + pop
        } else {
            pop - push
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Signal raised on push and pop
    pub fn signal(&self) -> &QueueSignal {
        &self.signal
    }

    fn reject(&self, size: usize) -> FlightLinkError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("Packet queue full, rejecting {} byte reservation", size);
        FlightLinkError::QueueFull { requested: size }
    }

    fn reserved_info(&self, handle: PacketHandle) -> Result<PacketInfo> {
        let info = self.packet_info(handle)?;
        if info.status != SlotStatus::Reserved {
            return Err(FlightLinkError::InvalidHandle(handle.0));
        }
        Ok(info)
    }

    /// Offset just past the slot at `offset`, wrapped to 0 at the buffer end
    fn slot_end(&self, offset: usize) -> usize {
        let end = offset + SLOT_METADATA_SIZE + self.read_u16(offset + SIZE_OFFSET) as usize;
        if end >= self.capacity() {
            0
        } else {
            end
        }
    }

    fn tick(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn set_status(&self, offset: usize, status: SlotStatus) {
        self.buffer[offset + STATUS_OFFSET].store(status as u8, Ordering::Release);
    }

    fn read_u8(&self, at: usize) -> u8 {
        self.buffer[at].load(Ordering::Relaxed)
    }

    fn write_u8(&self, at: usize, value: u8) {
        self.buffer[at].store(value, Ordering::Relaxed);
    }

    fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.read_u8(at), self.read_u8(at + 1)])
    }

    fn write_u16(&self, at: usize, value: u16) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(at + i, byte);
        }
    }

    fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.read_u8(at),
            self.read_u8(at + 1),
            self.read_u8(at + 2),
            self.read_u8(at + 3),
        ])
    }

    fn write_u32(&self, at: usize, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(at + i, byte);
        }
    }
}

/// The single consumer of a [`PacketQueue`]
///
/// Not `Clone`; every draining method takes `&mut self`, so the
/// single-consumer rule the free-space accounting relies on is enforced by
/// ownership.
#[derive(Debug)]
pub struct QueueConsumer {
    queue: Arc<PacketQueue>,
    current: Option<PacketHandle>,
}

impl QueueConsumer {
    /// The queue this consumer drains
    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Find the next ready packet
    ///
    /// Skips `Deleted` slots and `EndOfQueue` markers, advancing the pop
    /// cursor over them. A still-`Reserved` slot at the head stops the scan so
    /// packets come out in reservation order.
    ///
    /// # Returns
    ///
    /// * `Option<PacketHandle>` - The ready packet, or `None` if nothing is
    ///   ready yet
    pub fn pop_begin(&mut self) -> Option<PacketHandle> {
        let queue = &self.queue;
        let mut pop = queue.pop_index.load(Ordering::Relaxed);

        loop {
            if pop == queue.push_index.load(Ordering::Acquire) {
                return None;
            }

            let raw = queue.buffer[pop + STATUS_OFFSET].load(Ordering::Acquire);

            // The newest reservation may have been rolled back under us
            if pop == queue.push_index.load(Ordering::Acquire) {
                return None;
            }

            match SlotStatus::from_u8(raw) {
                Some(SlotStatus::Ready) => {
                    let handle = PacketHandle(pop);
                    self.current = Some(handle);
                    return Some(handle);
                }
                Some(SlotStatus::Reserved) => return None,
                Some(SlotStatus::EndOfQueue) if pop == 0 => {
                    warn!("EndOfQueue marker at offset 0, queue state inconsistent");
                    return None;
                }
                Some(SlotStatus::EndOfQueue) => pop = 0,
                Some(SlotStatus::Deleted) => pop = queue.slot_end(pop),
                None => {
                    warn!("Corrupt slot status 0x{:02X} at offset {}", raw, pop);
                    return None;
                }
            }

            queue.pop_index.store(pop, Ordering::Release);
        }
    }

    /// Release the packet returned by the last `pop_begin`
    ///
    /// Does nothing if no packet is currently popped.
    pub fn pop_end(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };

        let next = self.queue.slot_end(handle.0);
        self.queue.pop_index.store(next, Ordering::Release);
        self.queue.counters.popped.fetch_add(1, Ordering::Relaxed);
        self.queue.signal.notify(QueueEvent::PacketPopped);
    }

    /// Suspend until a packet is ready, then return it as if by `pop_begin`
    pub async fn wait_for_packet(&mut self) -> PacketHandle {
        loop {
            if let Some(handle) = self.pop_begin() {
                return handle;
            }
            self.queue.signal.wait(QueueEvent::PacketPushed).await;
        }
    }

    /// Drop every queued packet and zero the buffer
    ///
    /// Any handle still held by a producer becomes invalid.
    pub fn reset(&mut self) {
        let queue = &self.queue;
        let _guard = queue.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        for byte in queue.buffer.iter() {
            byte.store(0, Ordering::Relaxed);
        }
        queue.push_index.store(0, Ordering::Release);
        queue.pop_index.store(0, Ordering::Release);
        self.current = None;
    }
}
