//! Master/shadow ring pair mirroring one ring across a memory segment.
//!
//! The master creates the ring and registers it on a well-known port of a
//! [`SegmentHost`]; the shadow constructor blocks until the master has
//! accepted the connection. Bulk writes from the shadow side go through
//! [`SegmentShadow::copy_to_ring`], the stand-in for the DMA primitive of a
//! real inter-node transport: the copy is chunked over a fixed set of
//! channels, transient channel errors retry up to a cap, and teardown drops
//! every channel before the ring mapping goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::{ByteRing, PutGuard};

pub const SEGMENT_DMA_CHANNELS: usize = 8;

/// Per-call retry cap for transient channel failures.
pub const SEGMENT_COPY_RETRY_CAP: u32 = 8;

const DMA_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("segment transport failed on port {port} after {retries} retries")]
pub struct TransportError {
    pub port: u16,
    pub retries: u32,
}

struct PortEntry {
    ring: ByteRing,
    accepted: bool,
}

/// Rendezvous point for master/shadow pairs. One host is created by the
/// process owner and handed to both sides; there is no process-global
/// registry.
#[derive(Default)]
pub struct SegmentHost {
    ports: Mutex<HashMap<u16, PortEntry>>,
    connected: Condvar,
}

impl SegmentHost {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The owning side of a mirrored ring. Consumes elements like a plain ring.
pub struct SegmentMaster {
    ring: ByteRing,
    port: u16,
}

impl SegmentMaster {
    /// Creates the backing ring and makes it connectable on `port`.
    ///
    /// Panics if the port is already bound on this host.
    pub fn create(host: &SegmentHost, port: u16, capacity: usize, align: usize) -> Self {
        let ring = ByteRing::with_capacity(capacity, align);
        let mut ports = host.ports.lock().unwrap();
        let previous = ports.insert(
            port,
            PortEntry {
                ring: ring.clone(),
                accepted: false,
            },
        );
        assert!(previous.is_none(), "segment port {port} already bound");
        drop(ports);
        host.connected.notify_all();
        Self { ring, port }
    }

    /// Blocks until a shadow has connected.
    pub fn wait_for_shadow(&self, host: &SegmentHost) {
        let mut ports = host.ports.lock().unwrap();
        while !ports.get(&self.port).is_some_and(|entry| entry.accepted) {
            ports = host.connected.wait(ports).unwrap();
        }
    }

    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

struct DmaChannel {
    /// Injected failure budget; each failed chunk consumes one.
    failures_remaining: AtomicU32,
}

/// The remote side of a mirrored ring. Produces elements through the bulk
/// copy primitive.
pub struct SegmentShadow {
    ring: ByteRing,
    channels: Vec<DmaChannel>,
    port: u16,
}

impl SegmentShadow {
    /// Blocks until a master has bound `port`, then connects.
    pub fn connect(host: &SegmentHost, port: u16) -> Self {
        let mut ports = host.ports.lock().unwrap();
        loop {
            if let Some(entry) = ports.get_mut(&port) {
                entry.accepted = true;
                let ring = entry.ring.clone();
                host.connected.notify_all();
                let channels = (0..SEGMENT_DMA_CHANNELS)
                    .map(|_| DmaChannel {
                        failures_remaining: AtomicU32::new(0),
                    })
                    .collect();
                return Self {
                    ring,
                    channels,
                    port,
                };
            }
            ports = host.connected.wait(ports).unwrap();
        }
    }

    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bulk copy into a reserved element, chunked across the channel set.
    /// Transient channel failures retry the chunk; the per-call budget is
    /// `SEGMENT_COPY_RETRY_CAP`.
    pub fn copy_to_ring(
        &self,
        guard: &mut PutGuard,
        offset: usize,
        src: &[u8],
    ) -> Result<(), TransportError> {
        let mut retries = 0u32;
        for (chunk_index, chunk) in src.chunks(DMA_CHUNK_BYTES).enumerate() {
            let channel = &self.channels[chunk_index % self.channels.len()];
            loop {
                if channel
                    .failures_remaining
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |failures| {
                        failures.checked_sub(1)
                    })
                    .is_ok()
                {
                    retries += 1;
                    if retries > SEGMENT_COPY_RETRY_CAP {
                        return Err(TransportError {
                            port: self.port,
                            retries,
                        });
                    }
                    continue;
                }
                break;
            }
            let chunk_offset = offset + chunk_index * DMA_CHUNK_BYTES;
            guard.write_at(chunk_offset, chunk);
        }
        Ok(())
    }

    /// Test hook: makes the next `count` chunk transfers fail once each.
    pub fn inject_channel_failures(&self, count: u32) {
        for channel in &self.channels {
            channel.failures_remaining.store(0, Ordering::Relaxed);
        }
        self.channels[0]
            .failures_remaining
            .store(count, Ordering::Relaxed);
    }
}

impl Drop for SegmentShadow {
    fn drop(&mut self) {
        // Channels go first, then the ring mapping.
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shadow_blocks_until_master_binds() {
        let host = Arc::new(SegmentHost::new());
        let connector = {
            let host = Arc::clone(&host);
            thread::spawn(move || SegmentShadow::connect(&host, 7))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        let master = SegmentMaster::create(&host, 7, 4096, 64);
        let shadow = connector.join().unwrap();
        master.wait_for_shadow(&host);
        assert_eq!(shadow.port(), master.port());
    }

    #[test]
    fn bulk_copy_round_trips_through_the_pair() {
        let host = SegmentHost::new();
        let master = SegmentMaster::create(&host, 11, 1 << 20, 64);
        let shadow = SegmentShadow::connect(&host, 11);

        let payload: Vec<u8> = (0..200_000u32).map(|value| value as u8).collect();
        let mut guard = shadow.ring().put(payload.len(), Mode::Blocking).unwrap();
        shadow.copy_to_ring(&mut guard, 0, &payload).unwrap();
        guard.set_ready();

        let element = master.ring().get(Mode::Blocking).unwrap();
        assert_eq!(&*element, payload.as_slice());
    }

    #[test]
    fn transient_channel_failures_retry_within_cap() {
        let host = SegmentHost::new();
        let master = SegmentMaster::create(&host, 3, 1 << 20, 64);
        let shadow = SegmentShadow::connect(&host, 3);
        shadow.inject_channel_failures(SEGMENT_COPY_RETRY_CAP);

        let payload = vec![0xAAu8; 100_000];
        let mut guard = shadow.ring().put(payload.len(), Mode::Blocking).unwrap();
        shadow.copy_to_ring(&mut guard, 0, &payload).unwrap();
        guard.set_ready();
        assert_eq!(&*master.ring().get(Mode::Blocking).unwrap(), &payload[..]);
    }

    #[test]
    fn exhausted_retry_budget_is_a_transport_error() {
        let host = SegmentHost::new();
        let _master = SegmentMaster::create(&host, 4, 1 << 20, 64);
        let shadow = SegmentShadow::connect(&host, 4);
        shadow.inject_channel_failures(SEGMENT_COPY_RETRY_CAP + 1);

        let payload = vec![0u8; 16];
        let mut guard = shadow.ring().put(payload.len(), Mode::Blocking).unwrap();
        let error = shadow.copy_to_ring(&mut guard, 0, &payload).unwrap_err();
        assert_eq!(error.port, 4);
        assert!(error.retries > SEGMENT_COPY_RETRY_CAP);
    }

    #[test]
    fn shadow_connect_port_is_shared_state_not_global() {
        let host_a = SegmentHost::new();
        let host_b = SegmentHost::new();
        let _master_a = SegmentMaster::create(&host_a, 9, 4096, 64);
        let _master_b = SegmentMaster::create(&host_b, 9, 4096, 64);
        let shadow_a = SegmentShadow::connect(&host_a, 9);
        let shadow_b = SegmentShadow::connect(&host_b, 9);
        assert_eq!(shadow_a.port(), shadow_b.port());
    }
}
