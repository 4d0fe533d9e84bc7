// # Eviction Strategies
//
// Pluggable victim selection for when the cache exceeds its entry or
// memory budget. Only unreferenced entries are ever offered as candidates;
// live data is never evicted even if the cap stays exceeded.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::memory_pressure::MemoryPressure;

/// Victim selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionStrategy {
    /// Ascending last access time
    Lru,

    /// Ascending access count
    Lfu,

    /// Ascending creation time
    Fifo,

    /// LRU normally; under memory pressure also drops stale inactive
    /// entries (low) or all inactive entries (critical)
    Adaptive,
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::Lru
    }
}

/// Snapshot of an evictable entry offered to the strategy.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub estimated_size: usize,
    pub is_fresh: bool,
}

impl EvictionStrategy {
    /// Select keys whose cumulative size restores the budget.
    ///
    /// `bytes_to_free` and `entries_to_free` are both satisfied before
    /// selection stops; the returned set is minimal in the strategy's
    /// ordering.
    pub fn select_victims(
        &self,
        mut candidates: Vec<EvictionCandidate>,
        bytes_to_free: usize,
        entries_to_free: usize,
        pressure: Option<MemoryPressure>,
    ) -> Vec<String> {
        if bytes_to_free == 0 && entries_to_free == 0 {
            return Vec::new();
        }

        if *self == EvictionStrategy::Adaptive {
            match pressure {
                Some(MemoryPressure::Critical) => {
                    return candidates.into_iter().map(|c| c.key).collect();
                }
                Some(MemoryPressure::Low) => {
                    // Stale entries go first, then fall through to LRU
                    // ordering for the remainder.
                    candidates.sort_by_key(|c| (c.is_fresh, c.last_accessed_at));
                    return take_until_satisfied(candidates, bytes_to_free, entries_to_free);
                }
                None => {}
            }
        }

        match self {
            EvictionStrategy::Lru | EvictionStrategy::Adaptive => {
                candidates.sort_by_key(|c| c.last_accessed_at);
            }
            EvictionStrategy::Lfu => {
                candidates.sort_by_key(|c| (c.access_count, c.last_accessed_at));
            }
            EvictionStrategy::Fifo => {
                candidates.sort_by_key(|c| c.created_at);
            }
        }

        take_until_satisfied(candidates, bytes_to_free, entries_to_free)
    }
}

fn take_until_satisfied(
    candidates: Vec<EvictionCandidate>,
    bytes_to_free: usize,
    entries_to_free: usize,
) -> Vec<String> {
    let mut victims = Vec::new();
    let mut freed_bytes = 0usize;

    for candidate in candidates {
        if freed_bytes >= bytes_to_free && victims.len() >= entries_to_free {
            break;
        }
        freed_bytes += candidate.estimated_size;
        victims.push(candidate.key);
    }

    victims
}
