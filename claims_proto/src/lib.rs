//! Wire packets exchanged between the claims server and its clients.
//!
//! Every frame carries exactly one bincode-encoded [`ClientboundPacket`] or
//! [`ServerboundPacket`]. JSON encoders exist for debugging tools.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on a single decoded frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("packet codec failure: {0}")]
    Codec(#[from] bincode::Error),
    #[error("json codec failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// Requested claim mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimAction {
    Claim,
    Unclaim,
    ForceloadOn,
    ForceloadOff,
}

impl ClaimAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimAction::Claim => "claim",
            ClaimAction::Unclaim => "unclaim",
            ClaimAction::ForceloadOn => "forceload",
            ClaimAction::ForceloadOff => "unforceload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claim" => Some(ClaimAction::Claim),
            "unclaim" => Some(ClaimAction::Unclaim),
            "forceload" => Some(ClaimAction::ForceloadOn),
            "unforceload" => Some(ClaimAction::ForceloadOff),
            _ => None,
        }
    }
}

/// Defines one palette value; later packets refer to it by `sync_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStateData {
    pub sync_index: u32,
    pub owner: Uuid,
    pub sub_config_index: i32,
    pub forceloadable: bool,
}

/// Full snapshot of one 32x32 region.
///
/// `palette[i]` holds the sync index of palette slot `i`; `None` marks the
/// reserved slot 0 and any vacated slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBulkData {
    pub dimension: String,
    pub region_x: i32,
    pub region_z: i32,
    pub palette: Vec<Option<u32>>,
    pub bits: u8,
    pub words: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDeltaData {
    pub dimension: String,
    pub x: i32,
    pub z: i32,
    pub sync_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLimitsData {
    pub loading_claim_count: u32,
    pub loading_forceload_count: u32,
    pub claim_limit: i32,
    pub forceload_limit: i32,
    pub max_distance: i32,
    pub always_use_loading_values: bool,
}

/// Outcome of a player-issued claim request. `outcomes` holds the bits of
/// the server's outcome set, lowest bit first in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimActionResultData {
    pub outcomes: u32,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientboundPacket {
    ClaimState(ClaimStateData),
    RemoveClaimState { sync_index: u32 },
    RegionBulk(RegionBulkData),
    ChunkDelta(ChunkDeltaData),
    ClaimLimits(ClaimLimitsData),
    ClaimActionResult(ClaimActionResultData),
    /// Asks the client to answer with [`ServerboundPacket::LazyPacketConfirmation`].
    ConfirmationRequest,
    /// Marks the end of the initial region sync.
    SyncFinished,
}

impl ClientboundPacket {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientboundPacket::ClaimState(_) => "claim_state",
            ClientboundPacket::RemoveClaimState { .. } => "remove_claim_state",
            ClientboundPacket::RegionBulk(_) => "region_bulk",
            ClientboundPacket::ChunkDelta(_) => "chunk_delta",
            ClientboundPacket::ClaimLimits(_) => "claim_limits",
            ClientboundPacket::ClaimActionResult(_) => "claim_action_result",
            ClientboundPacket::ConfirmationRequest => "confirmation_request",
            ClientboundPacket::SyncFinished => "sync_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerboundPacket {
    ClaimAction {
        action: ClaimAction,
        /// `None` targets the dimension the player stands in.
        dimension: Option<String>,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        by_server: bool,
    },
    LazyPacketConfirmation,
}

pub fn encode_clientbound(packet: &ClientboundPacket) -> Result<Vec<u8>, ProtoError> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_clientbound(data: &[u8]) -> Result<ClientboundPacket, ProtoError> {
    check_frame_size(data)?;
    Ok(bincode::deserialize(data)?)
}

pub fn encode_serverbound(packet: &ServerboundPacket) -> Result<Vec<u8>, ProtoError> {
    Ok(bincode::serialize(packet)?)
}

pub fn decode_serverbound(data: &[u8]) -> Result<ServerboundPacket, ProtoError> {
    check_frame_size(data)?;
    Ok(bincode::deserialize(data)?)
}

pub fn encode_clientbound_json(packet: &ClientboundPacket) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(packet)?)
}

pub fn decode_clientbound_json(data: &str) -> Result<ClientboundPacket, ProtoError> {
    Ok(serde_json::from_str(data)?)
}

fn check_frame_size(data: &[u8]) -> Result<(), ProtoError> {
    if data.len() > MAX_FRAME_BYTES {
        return Err(ProtoError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_bulk_survives_bincode() {
        let packet = ClientboundPacket::RegionBulk(RegionBulkData {
            dimension: "minecraft:overworld".to_string(),
            region_x: -1,
            region_z: 3,
            palette: vec![None, Some(4), None, Some(9)],
            bits: 2,
            words: vec![0x1b, 0, 7],
        });
        let bytes = encode_clientbound(&packet).expect("encode");
        assert_eq!(decode_clientbound(&bytes).expect("decode"), packet);
    }

    #[test]
    fn serverbound_claim_action_decodes() {
        let packet = ServerboundPacket::ClaimAction {
            action: ClaimAction::ForceloadOn,
            dimension: None,
            left: -2,
            top: -2,
            right: 2,
            bottom: 2,
            by_server: false,
        };
        let bytes = encode_serverbound(&packet).expect("encode");
        assert_eq!(decode_serverbound(&bytes).expect("decode"), packet);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let data = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            decode_clientbound(&data),
            Err(ProtoError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn claim_action_names_parse_back() {
        for action in [
            ClaimAction::Claim,
            ClaimAction::Unclaim,
            ClaimAction::ForceloadOn,
            ClaimAction::ForceloadOff,
        ] {
            assert_eq!(ClaimAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ClaimAction::parse("grief"), None);
    }

    #[test]
    fn json_encoding_names_the_variant() {
        let packet = ClientboundPacket::ChunkDelta(ChunkDeltaData {
            dimension: "minecraft:the_nether".into(),
            x: 5,
            z: -7,
            sync_index: None,
        });
        let json = encode_clientbound_json(&packet).expect("json");
        assert!(json.contains("ChunkDelta"));
        assert_eq!(decode_clientbound_json(&json).expect("decode"), packet);
    }
}
