//! Constraint-driven path selection
//!
//! Chooses an ordered relay path from a directory snapshot, filtering
//! position by position: bans, no relay twice, country diversity, AS
//! disjointness against live circuits, guard at the front, exit at the
//! back. Among eligible candidates favorites always win; otherwise the
//! pick is random, weighted by advertised bandwidth.

use std::collections::HashSet;

use rand::Rng;

use crate::config::EngineConfig;
use crate::directory::{DirectorySnapshot, Fingerprint, RelayDescriptor};
use crate::error::SelectionError;

/// Longest path the engine will build.
pub const MAX_PATH_LEN: usize = 10;

/// Constraints for one path selection.
#[derive(Debug, Clone)]
pub struct PathConstraints {
    /// Number of hops (1 to [`MAX_PATH_LEN`]).
    pub length: usize,

    /// Every hop in a different country.
    pub distinct_countries: bool,

    /// No hop may share an AS number with another hop or with the AS
    /// numbers passed as in-use.
    pub no_as_intersection: bool,

    /// Never selected.
    pub banned: HashSet<Fingerprint>,

    /// Preferred whenever eligible for a position.
    pub favorites: Vec<Fingerprint>,

    /// Pin the last hop to this relay.
    pub required_exit: Option<Fingerprint>,

    /// The last hop must be exit-capable.
    pub needs_exit: bool,
}

impl PathConstraints {
    pub fn from_config(config: &EngineConfig, needs_exit: bool) -> Self {
        Self {
            length: config.default_circuit_length as usize,
            distinct_countries: config.distinct_countries,
            no_as_intersection: config.no_as_intersection,
            banned: config.banned_relays.clone(),
            favorites: config.favorite_relays.clone(),
            required_exit: None,
            needs_exit,
        }
    }
}

/// Select a path satisfying `constraints`.
///
/// `as_in_use` carries the AS numbers of the live circuits the new path
/// must stay disjoint from (empty when the check is off). The snapshot is
/// immutable for the duration of the call, so the result is consistent
/// even if the directory is republished concurrently.
pub fn select_path(
    constraints: &PathConstraints,
    snapshot: &DirectorySnapshot,
    as_in_use: &HashSet<u32>,
    rng: &mut impl Rng,
) -> std::result::Result<Vec<RelayDescriptor>, SelectionError> {
    if constraints.length == 0 || constraints.length > MAX_PATH_LEN {
        return Err(SelectionError::ConstraintUnsatisfiable(format!(
            "path length {} outside 1-{}",
            constraints.length, MAX_PATH_LEN
        )));
    }
    if constraints.distinct_countries && snapshot.distinct_countries() < constraints.length {
        return Err(SelectionError::ConstraintUnsatisfiable(format!(
            "{} hops requested but only {} countries available",
            constraints.length,
            snapshot.distinct_countries()
        )));
    }

    let favorites: HashSet<&Fingerprint> = constraints.favorites.iter().collect();

    let mut path: Vec<RelayDescriptor> = Vec::with_capacity(constraints.length);
    let mut chosen: HashSet<Fingerprint> = HashSet::new();
    let mut chosen_countries = HashSet::new();
    let mut chosen_as = HashSet::new();

    for position in 0..constraints.length {
        let last = position == constraints.length - 1;

        let candidates: Vec<&RelayDescriptor> = snapshot
            .relays()
            .iter()
            .filter(|r| eligible(r, position, last, constraints, &chosen, &chosen_countries, &chosen_as, as_in_use))
            .collect();

        if candidates.is_empty() {
            log::debug!(
                "path selection: no candidate for hop {} ({} relays in snapshot)",
                position,
                snapshot.len()
            );
            return Err(SelectionError::InsufficientRelays { position });
        }

        // Favorites dominate: if any favorite survived the filters, choose
        // among favorites only.
        let preferred: Vec<&RelayDescriptor> = candidates
            .iter()
            .copied()
            .filter(|r| favorites.contains(&r.fingerprint))
            .collect();
        let pool = if preferred.is_empty() {
            &candidates
        } else {
            &preferred
        };

        let pick = weighted_pick(pool, rng);
        chosen.insert(pick.fingerprint);
        chosen_countries.insert(pick.country);
        chosen_as.insert(pick.as_number);
        path.push(pick.clone());
    }

    Ok(path)
}

#[allow(clippy::too_many_arguments)]
fn eligible(
    relay: &RelayDescriptor,
    position: usize,
    last: bool,
    constraints: &PathConstraints,
    chosen: &HashSet<Fingerprint>,
    chosen_countries: &HashSet<crate::directory::CountryCode>,
    chosen_as: &HashSet<u32>,
    as_in_use: &HashSet<u32>,
) -> bool {
    if !relay.usable() {
        return false;
    }
    if constraints.banned.contains(&relay.fingerprint) {
        return false;
    }
    if chosen.contains(&relay.fingerprint) {
        return false;
    }
    if position == 0 && !relay.guard_eligible() {
        return false;
    }
    if last {
        if let Some(required) = &constraints.required_exit {
            if relay.fingerprint != *required {
                return false;
            }
        }
        if constraints.needs_exit && !relay.exit_capable() {
            return false;
        }
    }
    if constraints.distinct_countries && chosen_countries.contains(&relay.country) {
        return false;
    }
    if constraints.no_as_intersection
        && (chosen_as.contains(&relay.as_number) || as_in_use.contains(&relay.as_number))
    {
        return false;
    }
    true
}

/// Bandwidth-weighted random pick. A pool whose total advertised
/// bandwidth is zero degrades to a uniform pick.
fn weighted_pick<'a>(pool: &[&'a RelayDescriptor], rng: &mut impl Rng) -> &'a RelayDescriptor {
    debug_assert!(!pool.is_empty());
    let total: u128 = pool.iter().map(|r| r.bandwidth as u128).sum();
    if total == 0 {
        return pool[rng.gen_range(0..pool.len())];
    }
    let mut point = rng.gen_range(0..total);
    for relay in pool {
        let weight = relay.bandwidth as u128;
        if point < weight {
            return relay;
        }
        point -= weight;
    }
    // Unreachable while weights sum to `total`.
    pool[pool.len() - 1]
}
