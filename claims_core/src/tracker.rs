//! Fan-out of claim mutations to registered listeners.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::claim::ChunkClaim;
use crate::ids::{ChunkPos, DimensionId, RegionPos};

/// Receives claim change notifications on the tick thread.
pub trait ClaimsListener: Send + Sync {
    fn on_chunk_change(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        claim: Option<ChunkClaim>,
        previous: Option<ChunkClaim>,
    );

    /// Emitted instead of per-chunk changes after bulk loads.
    fn on_whole_region_change(&mut self, dimension: &DimensionId, region: RegionPos);

    fn on_claim_state_created(&mut self, _claim: ChunkClaim) {}

    fn on_claim_state_removed(&mut self, _claim: ChunkClaim) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEvent {
    ChunkChanged {
        dimension: DimensionId,
        pos: ChunkPos,
        claim: Option<ChunkClaim>,
        previous: Option<ChunkClaim>,
    },
    RegionChanged {
        dimension: DimensionId,
        region: RegionPos,
    },
    StateCreated(ChunkClaim),
    StateRemoved(ChunkClaim),
}

#[derive(Default)]
pub struct ChangeTracker {
    listeners: Vec<Box<dyn ClaimsListener>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Box<dyn ClaimsListener>) {
        self.listeners.push(listener);
    }

    pub fn chunk_changed(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        claim: Option<ChunkClaim>,
        previous: Option<ChunkClaim>,
    ) {
        for listener in &mut self.listeners {
            listener.on_chunk_change(dimension, pos, claim, previous);
        }
    }

    pub fn whole_region_changed(&mut self, dimension: &DimensionId, region: RegionPos) {
        for listener in &mut self.listeners {
            listener.on_whole_region_change(dimension, region);
        }
    }

    pub fn claim_state_created(&mut self, claim: ChunkClaim) {
        for listener in &mut self.listeners {
            listener.on_claim_state_created(claim);
        }
    }

    pub fn claim_state_removed(&mut self, claim: ChunkClaim) {
        for listener in &mut self.listeners {
            listener.on_claim_state_removed(claim);
        }
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Forwards every notification into a channel, preserving order.
pub struct ChannelListener {
    sender: Sender<ClaimEvent>,
}

impl ChannelListener {
    pub fn channel() -> (Self, Receiver<ClaimEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: ClaimEvent) {
        if self.sender.send(event).is_err() {
            tracing::warn!(target: "claims::tracker", "claim_event.receiver_gone");
        }
    }
}

impl ClaimsListener for ChannelListener {
    fn on_chunk_change(
        &mut self,
        dimension: &DimensionId,
        pos: ChunkPos,
        claim: Option<ChunkClaim>,
        previous: Option<ChunkClaim>,
    ) {
        self.forward(ClaimEvent::ChunkChanged {
            dimension: dimension.clone(),
            pos,
            claim,
            previous,
        });
    }

    fn on_whole_region_change(&mut self, dimension: &DimensionId, region: RegionPos) {
        self.forward(ClaimEvent::RegionChanged {
            dimension: dimension.clone(),
            region,
        });
    }

    fn on_claim_state_created(&mut self, claim: ChunkClaim) {
        self.forward(ClaimEvent::StateCreated(claim));
    }

    fn on_claim_state_removed(&mut self, claim: ChunkClaim) {
        self.forward(ClaimEvent::StateRemoved(claim));
    }
}
