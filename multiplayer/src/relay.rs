//! Server-side routing of application packets by their signed target.

use shared::{PeerId, ProtocolError, RoutingTarget, SERVER_PEER_ID};
use std::collections::BTreeSet;

/// Where one received packet goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDecision {
    pub deliver_locally: bool,
    /// Peers the packet is forwarded to, unmodified.
    pub forward_to: Vec<PeerId>,
}

/// Decides delivery for a packet from `source` addressed to `target`.
/// `connected` holds the server's client peers.
///
/// With relaying disabled only packets for the server itself are honoured.
pub fn route(
    source: PeerId,
    target: RoutingTarget,
    connected: &BTreeSet<PeerId>,
    relay_enabled: bool,
) -> RouteDecision {
    if target == RoutingTarget::SERVER {
        return RouteDecision {
            deliver_locally: true,
            forward_to: Vec::new(),
        };
    }
    if !relay_enabled {
        return RouteDecision::default();
    }

    match (target.unicast(), target.excluded()) {
        (Some(peer), _) => RouteDecision {
            deliver_locally: false,
            forward_to: connected.contains(&peer).then_some(peer).into_iter().collect(),
        },
        (None, Some(excluded)) => RouteDecision {
            // Only a target excluding the server itself is delivered here.
            deliver_locally: excluded == SERVER_PEER_ID,
            forward_to: connected
                .iter()
                .copied()
                .filter(|&peer| peer != source && peer != excluded)
                .collect(),
        },
        // Broadcast.
        (None, None) => RouteDecision {
            deliver_locally: true,
            forward_to: connected.iter().copied().filter(|&peer| peer != source).collect(),
        },
    }
}

/// A client may only send packets carrying its own id as the source.
pub fn verify_source(claimed: PeerId, actual: PeerId) -> Result<(), ProtocolError> {
    if claimed != actual {
        return Err(ProtocolError::SourceMismatch { claimed, actual });
    }
    Ok(())
}
