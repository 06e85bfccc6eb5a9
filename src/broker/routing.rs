use crate::protocol::{AddressLevel, SimulatorAddress};

/// Where a request addressed to `destination` goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    /// Fan out to these registered children. Empty when a wildcard matches
    /// nobody, which answers like an empty broadcast.
    Children(Vec<SimulatorAddress>),
    Parent,
    /// The concrete destination is below this node but not registered.
    Unreachable,
}

/// Resolves the next hop for `destination` as seen from `local`.
///
/// Wildcard slots match every registered child at that level. Workers
/// dispatch test-level destinations themselves.
pub fn resolve_route<'a, I>(
    local: &SimulatorAddress,
    destination: &SimulatorAddress,
    children: I,
) -> Route
where
    I: IntoIterator<Item = &'a SimulatorAddress>,
{
    let Some(scope) = destination.truncate(local.level()) else {
        return Route::Parent;
    };
    if !scope.contains(local) {
        return Route::Parent;
    }
    if destination.level() == local.level() || local.level() == AddressLevel::Worker {
        return Route::Local;
    }
    let Some(child_level) = local.level().child() else {
        return Route::Local;
    };
    let Some(target) = destination.truncate(child_level) else {
        return Route::Unreachable;
    };
    let mut matched: Vec<SimulatorAddress> = children
        .into_iter()
        .filter(|child| target.contains(child))
        .copied()
        .collect();
    if matched.is_empty() && !target.is_wildcard() {
        return Route::Unreachable;
    }
    matched.sort();
    Route::Children(matched)
}
