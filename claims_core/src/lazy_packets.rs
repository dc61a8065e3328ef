//! Per-destination packet queues drained under a global byte budget.
//!
//! A destination that has received `bytes_per_confirmation` bytes without
//! acknowledging them stops receiving packets until it confirms, unless the
//! total queued volume exceeds capacity. A destination that stays silent for
//! the confirmation timeout loses its queue and is marked dropped until it
//! reconnects.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use bevy::prelude::Resource;
use tracing::{info, warn};

use claims_proto::{encode_clientbound, ClientboundPacket};

use crate::config::LazyPacketSettings;
use crate::ids::PlayerId;

/// Outgoing transport seam; the host decides how bytes reach a player.
pub trait PacketSink {
    fn send(&mut self, player: PlayerId, bytes: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyPacket {
    bytes: Vec<u8>,
}

impl LazyPacket {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Default)]
struct DestinationQueue {
    packets: VecDeque<LazyPacket>,
    bytes_enqueued: usize,
    sent_since_confirmation: usize,
    waiting_since_ms: Option<u64>,
    dropped: bool,
}

impl DestinationQueue {
    fn eligible(&self, overflow: bool) -> bool {
        !self.dropped && !self.packets.is_empty() && (overflow || self.waiting_since_ms.is_none())
    }
}

#[derive(Resource)]
pub struct LazyPacketSender {
    settings: LazyPacketSettings,
    queues: BTreeMap<PlayerId, DestinationQueue>,
    last_served: Option<PlayerId>,
    total_enqueued: usize,
    confirmation_request: Vec<u8>,
}

impl LazyPacketSender {
    pub fn new(settings: LazyPacketSettings) -> Self {
        let confirmation_request = encode_clientbound(&ClientboundPacket::ConfirmationRequest)
            .unwrap_or_else(|err| {
                warn!(target: "claims::lazy", error = %err, "confirmation_request.encode_failed");
                Vec::new()
            });
        Self {
            settings,
            queues: BTreeMap::new(),
            last_served: None,
            total_enqueued: 0,
            confirmation_request,
        }
    }

    pub fn settings(&self) -> &LazyPacketSettings {
        &self.settings
    }

    /// Opens a fresh queue for a (re)connecting player.
    pub fn register(&mut self, player: PlayerId) {
        self.clear_for_player(player);
        self.queues.insert(player, DestinationQueue::default());
    }

    pub fn clear_for_player(&mut self, player: PlayerId) {
        if let Some(queue) = self.queues.remove(&player) {
            self.total_enqueued -= queue.bytes_enqueued;
        }
        if self.last_served == Some(player) {
            self.last_served = None;
        }
    }

    /// Queues a packet. Refused for unknown or dropped destinations.
    pub fn enqueue(&mut self, player: PlayerId, bytes: Vec<u8>) -> bool {
        let Some(queue) = self.queues.get_mut(&player) else {
            return false;
        };
        if queue.dropped {
            return false;
        }
        let packet = LazyPacket::new(bytes);
        queue.bytes_enqueued += packet.size();
        self.total_enqueued += packet.size();
        queue.packets.push_back(packet);
        true
    }

    pub fn enqueue_packet(&mut self, player: PlayerId, packet: &ClientboundPacket) -> bool {
        match encode_clientbound(packet) {
            Ok(bytes) => self.enqueue(player, bytes),
            Err(err) => {
                warn!(
                    target: "claims::lazy",
                    %player,
                    kind = packet.kind(),
                    error = %err,
                    "lazy_packet.encode_failed"
                );
                false
            }
        }
    }

    pub fn on_confirmation(&mut self, player: PlayerId) {
        if let Some(queue) = self.queues.get_mut(&player) {
            queue.sent_since_confirmation = 0;
            queue.waiting_since_ms = None;
        }
    }

    pub fn is_waiting(&self, player: PlayerId) -> bool {
        self.queues
            .get(&player)
            .is_some_and(|queue| queue.waiting_since_ms.is_some())
    }

    /// Waiting on a confirmation for longer than the clog threshold.
    pub fn is_clogged(&self, player: PlayerId, now_ms: u64) -> bool {
        match self.queues.get(&player) {
            Some(queue) if queue.dropped => true,
            Some(queue) => queue.waiting_since_ms.is_some_and(|since| {
                now_ms.saturating_sub(since) > self.settings.clogged_after_ms
            }),
            None => false,
        }
    }

    pub fn is_dropped(&self, player: PlayerId) -> bool {
        self.queues.get(&player).is_some_and(|queue| queue.dropped)
    }

    pub fn queued_bytes(&self, player: PlayerId) -> usize {
        self.queues
            .get(&player)
            .map(|queue| queue.bytes_enqueued)
            .unwrap_or(0)
    }

    pub fn queued_packets(&self, player: PlayerId) -> usize {
        self.queues
            .get(&player)
            .map(|queue| queue.packets.len())
            .unwrap_or(0)
    }

    pub fn total_enqueued(&self) -> usize {
        self.total_enqueued
    }

    fn is_over_capacity(&self) -> bool {
        self.total_enqueued > self.settings.capacity
    }

    fn bytes_to_send(&self) -> usize {
        let base = self.settings.bytes_per_tick_limit;
        if self.settings.capacity == 0 || self.settings.speed_up_at_occupancy <= 0.0 {
            return base;
        }
        let occupancy = self.total_enqueued as f64 / self.settings.capacity as f64;
        if occupancy <= self.settings.speed_up_at_occupancy {
            return base;
        }
        (base as f64 * occupancy / self.settings.speed_up_at_occupancy) as usize
    }

    fn next_eligible(&self, overflow: bool) -> Option<PlayerId> {
        let after = match self.last_served {
            Some(player) => Bound::Excluded(player),
            None => Bound::Unbounded,
        };
        self.queues
            .range((after, Bound::Unbounded))
            .chain(self.queues.iter())
            .find(|(_, queue)| queue.eligible(overflow))
            .map(|(player, _)| *player)
    }

    fn drop_timed_out(&mut self, now_ms: u64) -> Vec<PlayerId> {
        let timeout = self.settings.confirmation_timeout_ms;
        let mut dropped = Vec::new();
        for (player, queue) in &mut self.queues {
            let timed_out = !queue.dropped
                && queue
                    .waiting_since_ms
                    .is_some_and(|since| now_ms.saturating_sub(since) > timeout);
            if !timed_out {
                continue;
            }
            self.total_enqueued -= queue.bytes_enqueued;
            info!(
                target: "claims::lazy",
                %player,
                discarded_packets = queue.packets.len(),
                discarded_bytes = queue.bytes_enqueued,
                "lazy_packets.dropped=confirmation_timeout"
            );
            queue.packets.clear();
            queue.bytes_enqueued = 0;
            queue.dropped = true;
            dropped.push(*player);
        }
        dropped
    }

    /// Drains queued packets into `sink` for one server tick and returns the
    /// destinations dropped during it.
    pub fn on_server_tick(&mut self, now_ms: u64, sink: &mut dyn PacketSink) -> Vec<PlayerId> {
        let dropped = self.drop_timed_out(now_ms);
        let bytes_to_send = self.bytes_to_send();
        let mut bytes_sent = 0usize;
        loop {
            let overflow = self.is_over_capacity();
            if !overflow && bytes_sent >= bytes_to_send {
                break;
            }
            let Some(player) = self.next_eligible(overflow) else {
                break;
            };
            self.last_served = Some(player);
            let Some(queue) = self.queues.get_mut(&player) else {
                break;
            };
            let Some(packet) = queue.packets.pop_front() else {
                continue;
            };
            let size = packet.size();
            queue.bytes_enqueued -= size;
            queue.sent_since_confirmation += size;
            self.total_enqueued -= size;
            bytes_sent += size;
            sink.send(player, packet.bytes());

            if queue.waiting_since_ms.is_none()
                && queue.sent_since_confirmation >= self.settings.bytes_per_confirmation
            {
                queue.waiting_since_ms = Some(now_ms);
                sink.send(player, &self.confirmation_request);
            }
        }
        dropped
    }
}
