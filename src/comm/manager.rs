//! # Communication Manager
//!
//! Binds the packet queue to the registered interfaces.
//!
//! This module handles:
//! - The interface table and the shared transmit packet counter
//! - Storing validated inbound packets from interface receive tasks
//! - Reserving, filling and committing outbound packets
//! - The manager task that drains the queue, dispatches inbound packets to
//!   handlers and frames outbound packets onto their interface
//!
//! Producers call into [`CommManager`] from any task or thread. The single
//! [`ManagerTask`] owns the queue consumer.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::builder::{encode_frame, max_frame_len, write_header};
use super::protocol::{PacketHeader, PacketType, HEADER_SIZE, MAX_PACKET_SIZE};
use super::queue::{Direction, PacketHandle, PacketInfo, PacketQueue, QueueConsumer};
use crate::error::{FlightLinkError, Result};
use crate::interface::{Interface, InterfaceDescriptor, InterfaceIndex, InterfaceTable};

/// How often the manager task flushes buffered handler output
pub const HANDLER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Inbound packets dropped because the queue was full
    pub dropped_inbound: u64,
    /// Outbound reservations refused because the queue was full
    pub dropped_outbound: u64,
    /// Frames handed to an interface successfully
    pub sent: u64,
    /// Frames an interface failed to send
    pub send_failures: u64,
    /// Inbound packets no handler accepted
    pub unhandled: u64,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    dropped_inbound: AtomicU64,
    dropped_outbound: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    unhandled: AtomicU64,
}

/// Communication manager context
///
/// Created once with [`CommManager::init`] and shared through an `Arc`.
pub struct CommManager {
    queue: Arc<PacketQueue>,
    interfaces: RwLock<InterfaceTable>,
    tx_counter: AtomicU8,
    counters: ManagerCounters,
}

impl std::fmt::Debug for CommManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommManager")
            .field("queue_capacity", &self.queue.capacity())
            .field("interfaces", &self.interface_count())
            .finish_non_exhaustive()
    }
}

impl CommManager {
    /// Create the manager and its packet queue
    ///
    /// # Arguments
    ///
    /// * `buffer_size` - Queue buffer size in bytes
    /// * `max_interfaces` - Interface table capacity (clamped to
    ///   [`crate::interface::MAX_INTERFACES`])
    ///
    /// # Returns
    ///
    /// * `(Arc<CommManager>, QueueConsumer)` - Shared manager plus the queue
    ///   consumer to hand to [`ManagerTask::new`]
    pub fn init(buffer_size: usize, max_interfaces: usize) -> (Arc<Self>, QueueConsumer) {
        let (queue, consumer) = PacketQueue::new(buffer_size);

        info!(
            "Communication manager initialized: {} byte queue, up to {} interfaces",
            queue.capacity(),
            max_interfaces
        );

        let manager = Arc::new(Self {
            queue,
            interfaces: RwLock::new(InterfaceTable::new(max_interfaces)),
            tx_counter: AtomicU8::new(0),
            counters: ManagerCounters::default(),
        });

        (manager, consumer)
    }

    /// Register an interface
    ///
    /// # Errors
    ///
    /// Returns `InterfaceTableFull` once the table is at capacity
    pub fn add_interface(&self, name: impl Into<String>, link: Arc<dyn Interface>) -> Result<InterfaceIndex> {
        let name = name.into();
        let mut table = self.interfaces.write().unwrap_or_else(PoisonError::into_inner);
        let index = table.add(InterfaceDescriptor {
            name: name.clone(),
            link,
        })?;

        info!("Registered interface {} as index {}", name, index);
        Ok(index)
    }

    /// Look up a registered interface
    pub fn interface(&self, index: InterfaceIndex) -> Option<InterfaceDescriptor> {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    /// Indices of every registered interface
    pub fn interface_indices(&self) -> Vec<InterfaceIndex> {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(index, _)| index)
            .collect()
    }

    /// Number of registered interfaces
    pub fn interface_count(&self) -> usize {
        self.interfaces.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The underlying packet queue
    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    fn ensure_interface(&self, index: InterfaceIndex) -> Result<()> {
        if self.interfaces.read().unwrap_or_else(PoisonError::into_inner).get(index).is_none() {
            return Err(FlightLinkError::UnknownInterface(index));
        }
        Ok(())
    }

    /// Queue a validated inbound packet (header + payload, CRC stripped)
    ///
    /// Called from interface receive tasks. A full queue drops the packet.
    ///
    /// # Errors
    ///
    /// - `UnknownInterface` if `interface` is not registered
    /// - `PacketTooLarge` if the packet exceeds the wire maximum
    /// - `QueueFull` if there is no room; the drop is logged and counted
    pub fn store_received_packet(&self, interface: InterfaceIndex, packet: &[u8]) -> Result<()> {
        self.ensure_interface(interface)?;

        if packet.len() > MAX_PACKET_SIZE {
            return Err(FlightLinkError::PacketTooLarge {
                size: packet.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let handle = match self.queue.push_begin(packet.len(), interface, Direction::Inbound) {
            Ok(handle) => handle,
            Err(e) => {
                self.counters.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping inbound packet from interface {}: {}", interface, e);
                return Err(e);
            }
        };

        if let Err(e) = self.queue.store_bytes(handle, 0, packet) {
            self.queue.push_cancel(handle)?;
            return Err(e);
        }
        self.queue.push_end(handle)?;

        debug!("Stored {} byte packet from interface {}", packet.len(), interface);
        Ok(())
    }

    /// Reserve an outbound packet and write its header
    ///
    /// The header carries the next transmit counter value; the counter only
    /// advances once the reservation succeeds. Counter values follow queue
    /// order, so the far end sees them without gaps or reordering even when
    /// several threads transmit at once.
    ///
    /// # Arguments
    ///
    /// * `size` - Payload bytes the caller will write
    /// * `interface` - Target interface
    /// * `packet_type` - Header packet type
    ///
    /// # Returns
    ///
    /// * `Result<TxSlot>` - Payload region to fill, then commit with
    ///   [`CommManager::transmit_packet_push_end`]
    ///
    /// # Errors
    ///
    /// - `UnknownInterface` if `interface` is not registered
    /// - `PacketTooLarge` if `size` exceeds the maximum payload
    /// - `QueueFull` if there is no room; the refusal is logged and counted
    pub fn transmit_packet_push_start(
        &self,
        size: usize,
        interface: InterfaceIndex,
        packet_type: PacketType,
    ) -> Result<TxSlot<'_>> {
        self.ensure_interface(interface)?;

        // Validates the payload size before anything is reserved
        let mut header = PacketHeader::new(size, packet_type, 0)?;

        // The counter is taken under the push lock so counter order matches
        // slot order across racing producers
        let reserved = self.queue.push_begin_with(HEADER_SIZE + size, interface, Direction::Outbound, |_| {
            self.increment_and_get_transmitted_packet_counter()
        });
        let handle = match reserved {
            Ok((handle, counter)) => {
                header.counter = counter;
                handle
            }
            Err(e) => {
                self.counters.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                warn!("Cannot queue {:?} packet for interface {}: {}", packet_type, interface, e);
                return Err(e);
            }
        };

        if let Err(e) = write_header(&self.queue, handle, &header) {
            self.queue.push_cancel(handle)?;
            return Err(e);
        }

        Ok(TxSlot {
            queue: &self.queue,
            handle,
            size,
            counter: header.counter,
        })
    }

    /// Commit an outbound packet
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is no longer reserved
    pub fn transmit_packet_push_end(&self, handle: PacketHandle) -> Result<()> {
        self.queue.push_end(handle)
    }

    /// Abandon an outbound packet
    ///
    /// The counter value it consumed is not reused.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the slot is no longer reserved
    pub fn transmit_packet_push_cancel(&self, handle: PacketHandle) -> Result<()> {
        self.queue.push_cancel(handle)
    }

    /// Queue a complete outbound packet
    ///
    /// # Returns
    ///
    /// * `Result<u8>` - Counter value carried by the packet
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use flightlink::comm::manager::CommManager;
    /// use flightlink::comm::protocol::PacketType;
    /// use flightlink::interface::udp::UdpInterface;
    ///
    /// #[tokio::main]
    /// async fn main() -> flightlink::error::Result<()> {
    ///     let (manager, _consumer) = CommManager::init(1024, 1);
    ///     let udp = UdpInterface::bind("127.0.0.1:0", None).await?;
    ///     let index = manager.add_interface("udp", Arc::new(udp))?;
    ///
    ///     let counter = manager.transmit_packet(index, PacketType::Heartbeat, &[])?;
    ///     assert_eq!(counter, 1);
    ///     Ok(())
    /// }
    /// ```
    pub fn transmit_packet(&self, interface: InterfaceIndex, packet_type: PacketType, payload: &[u8]) -> Result<u8> {
        let slot = self.transmit_packet_push_start(payload.len(), interface, packet_type)?;

        if let Err(e) = slot.write(0, payload) {
            self.transmit_packet_push_cancel(slot.handle())?;
            return Err(e);
        }

        let counter = slot.counter();
        self.transmit_packet_push_end(slot.handle())?;
        Ok(counter)
    }

    /// Advance the shared transmit counter and return the new value
    ///
    /// Wraps from 255 to 0. Shared by every interface.
    pub fn increment_and_get_transmitted_packet_counter(&self) -> u8 {
        self.tx_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Drop every queued packet and restart the transmit counter
    pub fn reset(&self, consumer: &mut QueueConsumer) {
        consumer.reset();
        self.tx_counter.store(0, Ordering::Relaxed);
        debug!("Communication manager reset");
    }

    /// Counter snapshot
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            dropped_inbound: self.counters.dropped_inbound.load(Ordering::Relaxed),
            dropped_outbound: self.counters.dropped_outbound.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// Reserved outbound packet awaiting its payload
#[derive(Debug)]
pub struct TxSlot<'a> {
    queue: &'a PacketQueue,
    handle: PacketHandle,
    size: usize,
    counter: u8,
}

impl TxSlot<'_> {
    /// Queue handle to pass to push end or cancel
    pub fn handle(&self) -> PacketHandle {
        self.handle
    }

    /// Counter value written into the header
    pub fn counter(&self) -> u8 {
        self.counter
    }

    /// Payload size reserved
    pub fn len(&self) -> usize {
        self.size
    }

    /// True for a header-only packet
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Write payload bytes starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the run does not fit the reserved payload
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.size {
            return Err(FlightLinkError::InvalidHandle(self.handle.offset()));
        }
        self.queue.store_bytes(self.handle, HEADER_SIZE + offset, data)
    }

    /// Write one payload byte
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if `index` is past the reserved payload
    pub fn store_byte(&self, index: usize, data: u8) -> Result<()> {
        if index >= self.size {
            return Err(FlightLinkError::InvalidHandle(self.handle.offset()));
        }
        self.queue.store_byte(self.handle, HEADER_SIZE + index, data)
    }
}

/// Inbound packet as seen by handlers
#[derive(Debug, Clone, Copy)]
pub struct ReceivedPacket<'a> {
    /// Interface it arrived on
    pub interface: InterfaceIndex,
    /// Parsed header
    pub header: PacketHeader,
    /// Payload bytes
    pub payload: &'a [u8],
    /// Queue timestamp (ms since queue creation)
    pub timestamp: u32,
}

/// Consumer of inbound packets
pub trait PacketHandler: Send {
    /// Whether this handler wants packets of `packet_type`
    fn accepts(&self, packet_type: PacketType) -> bool;

    /// Process one packet
    fn handle(&mut self, packet: &ReceivedPacket<'_>) -> Result<()>;

    /// Push out anything buffered by `handle`
    ///
    /// Called periodically by the manager task and once more when it stops.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Queue-draining task
///
/// Owns the queue consumer, so at most one exists per manager.
pub struct ManagerTask {
    manager: Arc<CommManager>,
    consumer: QueueConsumer,
    handlers: Vec<Box<dyn PacketHandler>>,
    packet_buf: Vec<u8>,
    frame_buf: Vec<u8>,
}

impl ManagerTask {
    pub fn new(manager: Arc<CommManager>, consumer: QueueConsumer) -> Self {
        Self {
            manager,
            consumer,
            handlers: Vec::new(),
            packet_buf: vec![0u8; MAX_PACKET_SIZE],
            frame_buf: vec![0u8; max_frame_len(MAX_PACKET_SIZE)],
        }
    }

    /// Add an inbound packet handler
    pub fn register_handler(&mut self, handler: Box<dyn PacketHandler>) {
        self.handlers.push(handler);
    }

    /// Drain every ready packet
    ///
    /// # Returns
    ///
    /// * `usize` - Number of packets popped
    pub async fn process_pending(&mut self) -> usize {
        let mut processed = 0;

        while let Some(handle) = self.consumer.pop_begin() {
            let copied = self.copy_out(handle);
            self.consumer.pop_end();
            processed += 1;

            let (info, len) = match copied {
                Ok(copied) => copied,
                Err(e) => {
                    error!("Failed to read queued packet: {}", e);
                    continue;
                }
            };

            if len < info.size {
                warn!("Dropping {} byte packet larger than {} byte buffer", info.size, len);
                continue;
            }

            match info.direction {
                Direction::Inbound => self.dispatch_inbound(&info, len),
                Direction::Outbound => self.transmit(&info, len).await,
            }
        }

        processed
    }

    fn copy_out(&mut self, handle: PacketHandle) -> Result<(PacketInfo, usize)> {
        let queue = self.manager.queue();
        let info = queue.packet_info(handle)?;
        let len = queue.read_payload(handle, &mut self.packet_buf)?;
        Ok((info, len))
    }

    fn dispatch_inbound(&mut self, info: &PacketInfo, len: usize) {
        let packet = &self.packet_buf[..len];
        let header = match PacketHeader::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping inbound packet from interface {}: {}", info.interface, e);
                return;
            }
        };

        let received = ReceivedPacket {
            interface: info.interface,
            header,
            payload: &packet[HEADER_SIZE..],
            timestamp: info.timestamp,
        };

        let mut handled = false;
        for handler in self.handlers.iter_mut().filter(|h| h.accepts(header.packet_type)) {
            handled = true;
            if let Err(e) = handler.handle(&received) {
                warn!("Handler failed on {:?} packet: {}", header.packet_type, e);
            }
        }

        if !handled {
            self.manager.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            debug!("No handler for {:?} packet from interface {}", header.packet_type, info.interface);
        }
    }

    async fn transmit(&mut self, info: &PacketInfo, len: usize) {
        let Some(descriptor) = self.manager.interface(info.interface) else {
            warn!("Dropping outbound packet for unknown interface {}", info.interface);
            return;
        };

        let frame_len = match encode_frame(&self.packet_buf[..len], &mut self.frame_buf) {
            Ok(frame_len) => frame_len,
            Err(e) => {
                error!("Failed to frame outbound packet: {}", e);
                return;
            }
        };

        match descriptor.link.send(&self.frame_buf[..frame_len]).await {
            Ok(()) => {
                self.manager.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!("Sent {} byte frame on {}", frame_len, descriptor.name);
            }
            Err(e) => {
                self.manager.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Send on {} failed: {}", descriptor.name, e);
            }
        }
    }

    /// Flush every registered handler
    pub fn flush_handlers(&mut self) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.flush() {
                warn!("Handler flush failed: {}", e);
            }
        }
    }

    /// Process packets until `shutdown` resolves
    ///
    /// Handlers are flushed every [`HANDLER_FLUSH_INTERVAL`] and once more
    /// before returning.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Manager task started");

        let mut flush_tick = tokio::time::interval(HANDLER_FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.consumer.wait_for_packet() => {
                    self.process_pending().await;
                }
                _ = flush_tick.tick() => self.flush_handlers(),
            }
        }

        self.flush_handlers();
        info!("Manager task stopped: {:?}", self.manager.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::receiver::FrameReceiver;
    use crate::interface::MockInterface;
    use std::sync::Mutex;

    fn mock_link() -> Arc<MockInterface> {
        let mut mock = MockInterface::new();
        mock.expect_send().returning(|_| Ok(()));
        Arc::new(mock)
    }

    /// Records every packet it accepts
    struct Recorder {
        types: Vec<PacketType>,
        seen: Arc<Mutex<Vec<(InterfaceIndex, u8, Vec<u8>)>>>,
    }

    impl PacketHandler for Recorder {
        fn accepts(&self, packet_type: PacketType) -> bool {
            self.types.contains(&packet_type)
        }

        fn handle(&mut self, packet: &ReceivedPacket<'_>) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((packet.interface, packet.header.counter, packet.payload.to_vec()));
            Ok(())
        }
    }

    /// Counts flushes and buffers nothing
    struct FlushCounter(Arc<AtomicU64>);

    impl PacketHandler for FlushCounter {
        fn accepts(&self, _packet_type: PacketType) -> bool {
            false
        }

        fn handle(&mut self, _packet: &ReceivedPacket<'_>) -> Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn decode_all(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut receiver = FrameReceiver::new();
        let mut packets = Vec::new();
        for frame in frames {
            receiver.feed(frame, |p| packets.push(p.to_vec()));
        }
        packets
    }

    #[test]
    fn test_counter_starts_at_one_and_wraps() {
        let (manager, _consumer) = CommManager::init(256, 1);
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 1);

        for _ in 0..253 {
            manager.increment_and_get_transmitted_packet_counter();
        }
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 255);
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 0);
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 1);
    }

    #[test]
    fn test_add_interface_table_full() {
        let (manager, _consumer) = CommManager::init(256, 2);
        assert_eq!(manager.add_interface("a", mock_link()).unwrap(), 0);
        assert_eq!(manager.add_interface("b", mock_link()).unwrap(), 1);

        let result = manager.add_interface("c", mock_link());
        assert!(matches!(result, Err(FlightLinkError::InterfaceTableFull(2))));
        assert_eq!(manager.interface_count(), 2);
        assert_eq!(manager.interface(1).unwrap().name, "b");
    }

    #[test]
    fn test_store_received_packet_unknown_interface() {
        let (manager, _consumer) = CommManager::init(256, 2);
        let result = manager.store_received_packet(3, &[5, 0, 0]);
        assert!(matches!(result, Err(FlightLinkError::UnknownInterface(3))));
    }

    #[test]
    fn test_store_received_packet_drops_when_full() {
        let (manager, mut consumer) = CommManager::init(64, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        let packet = [25u8; 20];
        manager.store_received_packet(index, &packet).unwrap();
        manager.store_received_packet(index, &packet).unwrap();

        let result = manager.store_received_packet(index, &packet);
        assert!(matches!(result, Err(FlightLinkError::QueueFull { .. })));
        assert_eq!(manager.stats().dropped_inbound, 1);

        // The queued packets are intact
        let queue = Arc::clone(consumer.queue());
        for _ in 0..2 {
            let handle = consumer.pop_begin().unwrap();
            let mut buf = [0u8; 20];
            queue.read_payload(handle, &mut buf).unwrap();
            assert_eq!(buf, packet);
            consumer.pop_end();
        }
        assert!(consumer.pop_begin().is_none());
    }

    #[test]
    fn test_push_start_writes_header() {
        let (manager, mut consumer) = CommManager::init(256, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        let slot = manager
            .transmit_packet_push_start(3, index, PacketType::Telemetry)
            .unwrap();
        assert_eq!(slot.counter(), 1);
        slot.store_byte(0, 0x11).unwrap();
        slot.write(1, &[0x22, 0x33]).unwrap();
        assert!(slot.write(2, &[0x44, 0x55]).is_err());
        manager.transmit_packet_push_end(slot.handle()).unwrap();

        let handle = consumer.pop_begin().unwrap();
        let queue = manager.queue();
        let info = queue.packet_info(handle).unwrap();
        assert_eq!(info.direction, Direction::Outbound);
        assert_eq!(info.interface, index);

        let mut buf = vec![0u8; info.size];
        queue.read_payload(handle, &mut buf).unwrap();
        assert_eq!(buf, vec![8, 0x01, 1, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_push_start_rejects_oversized_payload() {
        let (manager, _consumer) = CommManager::init(1024, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        let result = manager.transmit_packet_push_start(251, index, PacketType::Command);
        assert!(matches!(result, Err(FlightLinkError::PacketTooLarge { .. })));
        // Nothing reserved, counter untouched
        assert!(manager.queue().is_empty());
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 1);
    }

    #[test]
    fn test_failed_reservation_keeps_counter() {
        let (manager, _consumer) = CommManager::init(64, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        assert!(manager.transmit_packet_push_start(60, index, PacketType::Command).is_err());
        assert_eq!(manager.stats().dropped_outbound, 1);
        assert_eq!(manager.transmit_packet(index, PacketType::Command, &[]).unwrap(), 1);
    }

    #[test]
    fn test_counter_follows_queue_order_across_threads() {
        const THREADS: usize = 4;
        const PACKETS_PER_THREAD: usize = 5000;

        let (manager, mut consumer) = CommManager::init(1 << 20, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..PACKETS_PER_THREAD {
                        manager.transmit_packet(index, PacketType::Telemetry, &[]).unwrap();
                    }
                });
            }
        });

        let queue = Arc::clone(manager.queue());
        let mut counters = Vec::with_capacity(THREADS * PACKETS_PER_THREAD);
        let mut buf = [0u8; HEADER_SIZE];
        while let Some(handle) = consumer.pop_begin() {
            queue.read_payload(handle, &mut buf).unwrap();
            counters.push(buf[2]);
            consumer.pop_end();
        }

        assert_eq!(counters.len(), THREADS * PACKETS_PER_THREAD);
        assert_eq!(counters[0], 1);
        for pair in counters.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1), "counter out of queue order");
        }
    }

    #[tokio::test]
    async fn test_cancelled_packet_is_never_sent() {
        let mut mock = MockInterface::new();
        mock.expect_send().times(1).returning(|_| Ok(()));
        let (manager, consumer) = CommManager::init(256, 1);
        let index = manager.add_interface("uart", Arc::new(mock)).unwrap();

        let slot = manager
            .transmit_packet_push_start(4, index, PacketType::Configuration)
            .unwrap();
        manager.transmit_packet_push_cancel(slot.handle()).unwrap();
        manager.transmit_packet(index, PacketType::Heartbeat, &[]).unwrap();

        let mut task = ManagerTask::new(Arc::clone(&manager), consumer);
        assert_eq!(task.process_pending().await, 1);
        assert_eq!(manager.stats().sent, 1);
    }

    #[tokio::test]
    async fn test_counter_shared_across_interfaces() {
        let sent: Arc<Mutex<Vec<(usize, Vec<u8>)>>> = Arc::default();
        let (manager, consumer) = CommManager::init(4096, 2);

        for id in 0..2 {
            let mut mock = MockInterface::new();
            let sent = Arc::clone(&sent);
            mock.expect_send().returning(move |frame| {
                sent.lock().unwrap().push((id, frame.to_vec()));
                Ok(())
            });
            manager.add_interface(format!("if{}", id), Arc::new(mock)).unwrap();
        }

        let mut task = ManagerTask::new(Arc::clone(&manager), consumer);

        // Burn through to just below the wrap point
        for _ in 0..254 {
            manager.increment_and_get_transmitted_packet_counter();
        }

        manager.transmit_packet(0, PacketType::Telemetry, &[0xA0]).unwrap();
        manager.transmit_packet(1, PacketType::Telemetry, &[0xB0]).unwrap();
        manager.transmit_packet(0, PacketType::Telemetry, &[0xA1]).unwrap();
        task.process_pending().await;

        let sent = sent.lock().unwrap().clone();
        let targets: Vec<_> = sent.iter().map(|(id, _)| *id).collect();
        assert_eq!(targets, vec![0, 1, 0]);

        let frames: Vec<_> = sent.into_iter().map(|(_, frame)| frame).collect();
        let counters: Vec<_> = decode_all(&frames).iter().map(|p| p[2]).collect();
        assert_eq!(counters, vec![255, 0, 1]);
    }

    #[tokio::test]
    async fn test_inbound_dispatch_to_accepting_handlers() {
        let (manager, consumer) = CommManager::init(1024, 2);
        let index = manager.add_interface("uart", mock_link()).unwrap();

        let telemetry: Arc<Mutex<Vec<_>>> = Arc::default();
        let commands: Arc<Mutex<Vec<_>>> = Arc::default();

        let mut task = ManagerTask::new(Arc::clone(&manager), consumer);
        task.register_handler(Box::new(Recorder {
            types: vec![PacketType::Telemetry],
            seen: Arc::clone(&telemetry),
        }));
        task.register_handler(Box::new(Recorder {
            types: vec![PacketType::Telemetry, PacketType::Command],
            seen: Arc::clone(&commands),
        }));

        manager.store_received_packet(index, &[7, 0x01, 10, 0xAA, 0xBB]).unwrap();
        manager.store_received_packet(index, &[6, 0x04, 11, 0xCC]).unwrap();
        manager.store_received_packet(index, &[5, 0x00, 12]).unwrap();

        assert_eq!(task.process_pending().await, 3);

        assert_eq!(*telemetry.lock().unwrap(), vec![(index, 10, vec![0xAA, 0xBB])]);
        assert_eq!(
            *commands.lock().unwrap(),
            vec![(index, 10, vec![0xAA, 0xBB]), (index, 11, vec![0xCC])]
        );
        assert_eq!(manager.stats().unhandled, 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_counted() {
        let mut mock = MockInterface::new();
        mock.expect_send()
            .returning(|_| Err(FlightLinkError::Interface("link down".to_string())));
        let (manager, consumer) = CommManager::init(256, 1);
        let index = manager.add_interface("uart", Arc::new(mock)).unwrap();

        manager.transmit_packet(index, PacketType::Heartbeat, &[]).unwrap();
        let mut task = ManagerTask::new(Arc::clone(&manager), consumer);
        task.process_pending().await;

        assert_eq!(manager.stats().send_failures, 1);
        assert!(manager.queue().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_queue_and_counter() {
        let (manager, mut consumer) = CommManager::init(256, 1);
        let index = manager.add_interface("uart", mock_link()).unwrap();
        manager.transmit_packet(index, PacketType::Heartbeat, &[]).unwrap();

        manager.reset(&mut consumer);

        assert!(manager.queue().is_empty());
        assert!(consumer.pop_begin().is_none());
        assert_eq!(manager.increment_and_get_transmitted_packet_counter(), 1);
    }

    #[tokio::test]
    async fn test_run_flushes_handlers_on_shutdown() {
        let flushes = Arc::new(AtomicU64::new(0));
        let (manager, consumer) = CommManager::init(256, 1);
        let mut task = ManagerTask::new(manager, consumer);
        task.register_handler(Box::new(FlushCounter(Arc::clone(&flushes))));

        tokio::time::timeout(Duration::from_secs(2), task.run(async {}))
            .await
            .expect("task did not stop");

        assert!(flushes.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_run_sends_until_shutdown() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockInterface::new();
        {
            let sent = Arc::clone(&sent);
            mock.expect_send().returning(move |frame| {
                sent.lock().unwrap().push(frame.to_vec());
                Ok(())
            });
        }

        let (manager, consumer) = CommManager::init(256, 1);
        let index = manager.add_interface("uart", Arc::new(mock)).unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = ManagerTask::new(Arc::clone(&manager), consumer);
        let handle = tokio::spawn(task.run(async {
            let _ = shutdown_rx.await;
        }));

        manager.transmit_packet(index, PacketType::Heartbeat, &[1]).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.stats().sent == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("packet not sent");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task did not stop")
            .unwrap();

        assert_eq!(decode_all(&sent.lock().unwrap()), vec![vec![6, 0x00, 1, 1]]);
    }
}
