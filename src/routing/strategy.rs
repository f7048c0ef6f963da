//! Routing strategies and pool selection

use crate::core::{OrchestratorError, PoolId, Result, Task};
use crate::pool::PoolHealth;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How the router picks one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Lowest `active / max_workers`; ties go to the earliest registered
    #[default]
    LeastLoaded,
    /// Strict cycle over the eligible list
    RoundRobin,
    /// Uniform over eligible pools
    Random,
    /// Stable hash of the affinity key
    Affinity,
}

impl RoutingStrategy {
    /// Every strategy
    pub const ALL: [RoutingStrategy; 4] = [
        RoutingStrategy::LeastLoaded,
        RoutingStrategy::RoundRobin,
        RoutingStrategy::Random,
        RoutingStrategy::Affinity,
    ];

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::LeastLoaded => "least_loaded",
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::Random => "random",
            RoutingStrategy::Affinity => "affinity",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                OrchestratorError::invalid_config(
                    "strategy",
                    format!("unknown routing strategy '{}'", s),
                )
            })
    }
}

/// FNV-1a, 64 bit
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Chosen candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Selection {
    /// Index into the candidate slice
    pub(crate) index: usize,
    pub(crate) strategy_used: RoutingStrategy,
    pub(crate) score: f64,
}

/// State shared by successive selections
#[derive(Debug, Default)]
pub(crate) struct SelectionState {
    cursor: Mutex<usize>,
    affinity: DashMap<String, PoolId>,
}

impl SelectionState {
    pub(crate) fn forget(&self, key: &str) -> bool {
        self.affinity.remove(key).is_some()
    }

    pub(crate) fn cached(&self, key: &str) -> Option<PoolId> {
        self.affinity.get(key).map(|entry| *entry)
    }
}

/// Load of a pool counting work already planned onto it
fn load(pool: &PoolHealth, planned: &HashMap<PoolId, usize>) -> f64 {
    if pool.max_workers == 0 {
        return 1.0;
    }
    let active = pool.active_tasks + planned.get(&pool.pool_id).copied().unwrap_or(0);
    active as f64 / pool.max_workers as f64
}

fn least_loaded(candidates: &[&PoolHealth], planned: &HashMap<PoolId, usize>) -> Selection {
    let mut best = Selection {
        index: 0,
        strategy_used: RoutingStrategy::LeastLoaded,
        score: load(candidates[0], planned),
    };
    for (index, pool) in candidates.iter().enumerate().skip(1) {
        let score = load(pool, planned);
        if score < best.score {
            best.index = index;
            best.score = score;
        }
    }
    best
}

/// Pick one of `candidates`, which are already filtered to eligible pools
///
/// Returns `None` when there is no candidate.
pub(crate) fn select(
    strategy: RoutingStrategy,
    candidates: &[&PoolHealth],
    task: &Task,
    state: &SelectionState,
    planned: &HashMap<PoolId, usize>,
) -> Option<Selection> {
    if candidates.is_empty() {
        return None;
    }
    let count = candidates.len();

    let selection = match strategy {
        RoutingStrategy::LeastLoaded => least_loaded(candidates, planned),
        RoutingStrategy::RoundRobin => {
            let mut cursor = state.cursor.lock();
            // Clamp after membership changes
            let index = *cursor % count;
            *cursor = (index + 1) % count;
            Selection {
                index,
                strategy_used: strategy,
                score: load(candidates[index], planned),
            }
        }
        RoutingStrategy::Random => {
            let index = fastrand::usize(..count);
            Selection {
                index,
                strategy_used: strategy,
                score: load(candidates[index], planned),
            }
        }
        RoutingStrategy::Affinity => match task.affinity_key() {
            None => least_loaded(candidates, planned),
            Some(key) => {
                let tagged: Vec<usize> = (0..count)
                    .filter(|i| candidates[*i].tags.iter().any(|tag| tag == key))
                    .collect();
                let pool_set: Vec<usize> = if tagged.is_empty() {
                    (0..count).collect()
                } else {
                    tagged
                };

                let cached = state.cached(key).and_then(|pool_id| {
                    pool_set
                        .iter()
                        .copied()
                        .find(|i| candidates[*i].pool_id == pool_id)
                });
                let index = cached.unwrap_or_else(|| {
                    let slot = (fnv1a_64(key.as_bytes()) % pool_set.len() as u64) as usize;
                    let index = pool_set[slot];
                    state
                        .affinity
                        .insert(key.to_string(), candidates[index].pool_id);
                    index
                });
                Selection {
                    index,
                    strategy_used: strategy,
                    score: load(candidates[index], planned),
                }
            }
        },
    };
    Some(selection)
}
