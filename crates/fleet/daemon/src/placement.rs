//! Placement decisions
//!
//! Pure selection over rows already loaded by the services, so the rules
//! can be checked without a store.

use fleet_types::{ClusterId, ClusterPhase, ConnectorCluster, ConnectorNamespace, NamespaceId, NamespacePhase};
use rand::Rng;

/// The most recently updated Ready cluster visible to the requester.
/// With `explicit`, only that cluster qualifies.
pub fn select_ready_cluster<'a>(
    clusters: &'a [ConnectorCluster],
    owner: &str,
    organisation_id: &str,
    explicit: Option<&ClusterId>,
) -> Option<&'a ConnectorCluster> {
    clusters
        .iter()
        .filter(|c| c.phase == ClusterPhase::Ready)
        .filter(|c| c.is_visible_to(owner, organisation_id))
        .filter(|c| explicit.map_or(true, |id| &c.id == id))
        .max_by_key(|c| (c.updated_at, c.version))
}

/// A Ready namespace dedicated to the requester's tenant.
/// With `namespace_id`, only that namespace qualifies.
pub fn select_available_namespace<'a>(
    namespaces: &'a [ConnectorNamespace],
    owner: &str,
    organisation_id: &str,
    namespace_id: Option<&NamespaceId>,
) -> Option<&'a ConnectorNamespace> {
    namespaces
        .iter()
        .filter(|ns| ns.phase == NamespacePhase::Ready)
        .filter(|ns| ns.tenant.matches(owner, organisation_id))
        .filter(|ns| namespace_id.map_or(true, |id| &ns.id == id))
        .max_by_key(|ns| (ns.updated_at, ns.version))
}

/// Uniform choice among evaluation clusters. A single candidate is
/// returned without consulting `rng`.
pub fn pick_eval_cluster<'a, R: Rng + ?Sized>(
    candidates: &'a [ClusterId],
    rng: &mut R,
) -> Option<&'a ClusterId> {
    match candidates {
        [] => None,
        [only] => Some(only),
        _ => candidates.get(rng.gen_range(0..candidates.len())),
    }
}
