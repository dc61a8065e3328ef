use std::collections::{BTreeMap, VecDeque};

use bevy::prelude::*;
use tracing::warn;

use claims_proto::{encode_clientbound, ClaimAction, ClientboundPacket, ServerboundPacket};

use crate::ids::{ChunkPos, DimensionId, PlayerId};
use crate::lazy_packets::PacketSink;

/// Server tick counter; wall time is derived from it.
#[derive(Resource, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTick(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Joined(PlayerId),
    Left(PlayerId),
}

/// Joins and leaves reported by the host since the last tick.
#[derive(Resource, Debug, Default)]
pub struct ConnectionEvents {
    events: Vec<ConnectionEvent>,
}

impl ConnectionEvents {
    pub fn join(&mut self, player: PlayerId) {
        self.events.push(ConnectionEvent::Joined(player));
    }

    pub fn leave(&mut self, player: PlayerId) {
        self.events.push(ConnectionEvent::Left(player));
    }

    pub fn drain(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Where a player stands when asking for a claim action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerLocation {
    pub dimension: DimensionId,
    pub chunk: ChunkPos,
}

impl PlayerLocation {
    pub fn new(dimension: DimensionId, chunk: ChunkPos) -> Self {
        Self { dimension, chunk }
    }
}

/// A claim action received from a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub player: PlayerId,
    pub location: PlayerLocation,
    pub action: ClaimAction,
    /// Target dimension; the player's own when `None`.
    pub dimension: Option<DimensionId>,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub by_server: bool,
}

impl ClaimRequest {
    pub fn single(player: PlayerId, location: PlayerLocation, action: ClaimAction, pos: ChunkPos) -> Self {
        Self {
            player,
            location,
            action,
            dimension: None,
            left: pos.x,
            top: pos.z,
            right: pos.x,
            bottom: pos.z,
            by_server: false,
        }
    }

    pub fn target_dimension(&self) -> &DimensionId {
        self.dimension.as_ref().unwrap_or(&self.location.dimension)
    }

    pub fn is_single_cell(&self) -> bool {
        self.left == self.right && self.top == self.bottom
    }
}

/// Pending claim requests; each player gets at most one handled per tick.
#[derive(Resource, Debug, Default)]
pub struct ClaimRequestQueue {
    pending: BTreeMap<PlayerId, VecDeque<ClaimRequest>>,
}

impl ClaimRequestQueue {
    pub fn push(&mut self, request: ClaimRequest) {
        self.pending
            .entry(request.player)
            .or_default()
            .push_back(request);
    }

    /// The oldest request of every player with something pending.
    pub fn next_batch(&mut self) -> Vec<ClaimRequest> {
        let mut batch = Vec::new();
        self.pending.retain(|_, queue| {
            if let Some(request) = queue.pop_front() {
                batch.push(request);
            }
            !queue.is_empty()
        });
        batch
    }

    pub fn forget(&mut self, player: PlayerId) {
        self.pending.remove(&player);
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Players that acknowledged a confirmation request.
#[derive(Resource, Debug, Default)]
pub struct ConfirmationQueue {
    players: Vec<PlayerId>,
}

impl ConfirmationQueue {
    pub fn push(&mut self, player: PlayerId) {
        self.players.push(player);
    }

    pub fn drain(&mut self) -> Vec<PlayerId> {
        std::mem::take(&mut self.players)
    }
}

/// Routes a decoded serverbound packet to the queue that handles it.
pub fn receive_serverbound(
    requests: &mut ClaimRequestQueue,
    confirmations: &mut ConfirmationQueue,
    player: PlayerId,
    location: PlayerLocation,
    packet: ServerboundPacket,
) {
    match packet {
        ServerboundPacket::ClaimAction {
            action,
            dimension,
            left,
            top,
            right,
            bottom,
            by_server,
        } => requests.push(ClaimRequest {
            player,
            location,
            action,
            dimension: dimension.map(DimensionId::new),
            left,
            top,
            right,
            bottom,
            by_server,
        }),
        ServerboundPacket::LazyPacketConfirmation => confirmations.push(player),
    }
}

/// Encoded packets ready for the host to deliver, in send order.
#[derive(Resource, Debug, Default)]
pub struct PacketOutbox {
    frames: Vec<(PlayerId, Vec<u8>)>,
}

impl PacketOutbox {
    /// Sends a packet directly, bypassing the lazy pipeline.
    pub fn send_packet(&mut self, player: PlayerId, packet: &ClientboundPacket) {
        match encode_clientbound(packet) {
            Ok(bytes) => self.frames.push((player, bytes)),
            Err(err) => warn!(
                target: "claims::server",
                %player,
                kind = packet.kind(),
                error = %err,
                "packet.encode_failed"
            ),
        }
    }

    pub fn drain(&mut self) -> Vec<(PlayerId, Vec<u8>)> {
        std::mem::take(&mut self.frames)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl PacketSink for PacketOutbox {
    fn send(&mut self, player: PlayerId, bytes: &[u8]) {
        self.frames.push((player, bytes.to_vec()));
    }
}
