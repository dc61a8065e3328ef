//! Player claim requests turned into manager calls and direct replies.

use tracing::info;

use claims_proto::ClientboundPacket;

use crate::ids::ChunkPos;
use crate::manager::{ClaimActor, ClaimsManager};
use crate::outcome::{AreaClaimResult, ClaimOutcome};
use crate::resources::{ClaimRequest, PacketOutbox};

/// Evaluates one request. Server-owned requests need server permission.
pub fn handle_claim_request(manager: &mut ClaimsManager, request: &ClaimRequest) -> AreaClaimResult {
    let (left, top, right, bottom) = (request.left, request.top, request.right, request.bottom);
    if request.by_server && !manager.has_server_permission(request.player) {
        return AreaClaimResult::rejected(ClaimOutcome::NoServerPermission, left, top, right, bottom);
    }
    let actor = if request.by_server {
        ClaimActor::server(request.location.chunk)
    } else {
        ClaimActor::player(request.player, request.location.chunk)
    };
    let dimension = request.target_dimension().clone();
    if request.is_single_cell() {
        let pos = ChunkPos::new(left, top);
        let outcome = manager.try_single_claim_action(&dimension, &actor, pos, request.action);
        return AreaClaimResult {
            outcomes: outcome.flag(),
            left,
            top,
            right,
            bottom,
            cells_evaluated: if matches!(
                outcome,
                ClaimOutcome::ClaimsAreDisabled | ClaimOutcome::ReplacementInProgress
            ) {
                0
            } else {
                1
            },
        };
    }
    manager.try_claim_action_over_area(&dimension, &actor, (left, top, right, bottom), request.action)
}

/// Handles a request and sends the result and fresh limits straight to the player.
pub fn answer_claim_request(
    manager: &mut ClaimsManager,
    outbox: &mut PacketOutbox,
    request: &ClaimRequest,
) -> AreaClaimResult {
    let result = handle_claim_request(manager, request);
    info!(
        target: "claims::server",
        player = %request.player,
        action = request.action.as_str(),
        by_server = request.by_server,
        outcome = result.outcomes.highest_priority().map(ClaimOutcome::as_str),
        "claim_request.answered"
    );
    outbox.send_packet(
        request.player,
        &ClientboundPacket::ClaimActionResult(result.to_packet()),
    );
    outbox.send_packet(
        request.player,
        &ClientboundPacket::ClaimLimits(manager.limits_packet(request.player)),
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims_proto::{decode_clientbound, ClaimAction};

    use crate::config::ClaimsConfig;
    use crate::ids::{DimensionId, PlayerId};
    use crate::outcome::OutcomeSet;
    use crate::resources::PlayerLocation;

    fn request(player: PlayerId, action: ClaimAction, by_server: bool) -> ClaimRequest {
        ClaimRequest {
            by_server,
            ..ClaimRequest::single(
                player,
                PlayerLocation::new(DimensionId::overworld(), ChunkPos::new(0, 0)),
                action,
                ChunkPos::new(1, 1),
            )
        }
    }

    #[test]
    fn server_claims_need_permission() {
        let mut manager = ClaimsManager::new(&ClaimsConfig::default());
        let player = PlayerId::from_u128(1);
        let result = handle_claim_request(&mut manager, &request(player, ClaimAction::Claim, true));
        assert_eq!(result.outcomes, OutcomeSet::NO_SERVER_PERMISSION);

        manager.grant_server_permission(player);
        let result = handle_claim_request(&mut manager, &request(player, ClaimAction::Claim, true));
        assert_eq!(result.outcomes, OutcomeSet::SUCCESSFUL_CLAIM);
        let claim = manager
            .get(&DimensionId::overworld(), ChunkPos::new(1, 1))
            .expect("claimed");
        assert_eq!(claim.owner, PlayerId::SERVER);
    }

    #[test]
    fn answers_carry_result_then_limits() {
        let mut manager = ClaimsManager::new(&ClaimsConfig::default());
        let mut outbox = PacketOutbox::default();
        let player = PlayerId::from_u128(2);
        answer_claim_request(&mut manager, &mut outbox, &request(player, ClaimAction::Claim, false));

        let frames = outbox.drain();
        assert_eq!(frames.len(), 2);
        let kinds: Vec<&str> = frames
            .iter()
            .map(|(_, bytes)| decode_clientbound(bytes).expect("decodes").kind())
            .collect();
        assert_eq!(kinds, vec!["claim_action_result", "claim_limits"]);
        match decode_clientbound(&frames[1].1).expect("decodes") {
            ClientboundPacket::ClaimLimits(limits) => {
                assert_eq!(limits.loading_claim_count, 1);
                assert_eq!(limits.claim_limit, 500);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
