// Deterministic leader election over the registered peer list

use toporoute_common::{Result, ServiceDescriptor, ToporouteError};

/// Pick the leader every node agrees on.
///
/// A single explicit leadership claim wins. Without claims the smallest id wins.
/// Several claims are a misconfiguration and are reported instead of resolved.
pub fn elect_leader(services: &[ServiceDescriptor]) -> Result<&ServiceDescriptor> {
    if services.is_empty() {
        return Err(ToporouteError::NoPeers);
    }

    let claims: Vec<&ServiceDescriptor> = services.iter().filter(|s| s.is_leader).collect();
    match claims.as_slice() {
        [leader] => Ok(*leader),
        [] => services
            .iter()
            .min_by(|a, b| a.id.cmp(&b.id))
            .ok_or(ToporouteError::NoPeers),
        _ => {
            let mut ids: Vec<String> = claims.iter().map(|s| s.id.clone()).collect();
            ids.sort();
            Err(ToporouteError::ConflictingLeaders(ids))
        }
    }
}
