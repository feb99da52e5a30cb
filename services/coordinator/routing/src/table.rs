//! Multi-entry source-route table with scoring and pruning

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, info};

/// Relay short addresses in route-record order (index 0 is nearest the destination)
pub type RelayList = SmallVec<[u16; 8]>;

/// Tunables for route selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteScoringConfig {
    /// Entries older than this are pruned
    pub expiry_ms: u64,
    /// Age after which a staleness penalty applies
    pub staleness_ms: u64,
    /// Age increment per additional staleness penalty point
    pub staleness_step_ms: u64,
    /// Cap on the staleness penalty
    pub max_staleness_penalty: i32,
    /// Failure count at which an entry is blacklisted
    pub max_failures: u8,
    /// Score penalty per recorded failure
    pub failure_penalty: i32,
    /// Window in which a successful use earns the recency bonus
    pub recent_use_window_ms: u64,
    /// Score bonus for recently used entries
    pub recent_use_bonus: i32,
    /// Maximum candidate routes kept per destination
    pub max_entries_per_destination: usize,
}

impl Default for RouteScoringConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 300_000,
            staleness_ms: 120_000,
            staleness_step_ms: 30_000,
            max_staleness_penalty: 5,
            max_failures: 3,
            failure_penalty: 2,
            recent_use_window_ms: 30_000,
            recent_use_bonus: 1,
            max_entries_per_destination: 4,
        }
    }
}

/// One candidate route to a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRouteEntry {
    /// Relays; empty means the destination is reached directly
    pub relays: RelayList,
    /// Path cost as reported or computed
    pub path_cost: u8,
    /// Last time the route was learned or refreshed
    pub last_updated_ms: u64,
    /// Consecutive failures
    pub failure_count: u8,
    /// Last successful use
    pub last_used_ms: Option<u64>,
}

impl SourceRouteEntry {
    /// Fresh entry
    pub fn new(relays: RelayList, path_cost: u8, now_ms: u64) -> Self {
        Self {
            relays,
            path_cost,
            last_updated_ms: now_ms,
            failure_count: 0,
            last_used_ms: None,
        }
    }

    fn is_expired(&self, config: &RouteScoringConfig, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_updated_ms) > config.expiry_ms
    }

    fn is_blacklisted(&self, config: &RouteScoringConfig) -> bool {
        self.failure_count >= config.max_failures
    }

    /// Composite score; lower is better
    pub fn score(&self, config: &RouteScoringConfig, now_ms: u64) -> i32 {
        let age = now_ms.saturating_sub(self.last_updated_ms);
        let staleness = if age > config.staleness_ms {
            let steps = (age - config.staleness_ms) / config.staleness_step_ms.max(1) + 1;
            (steps.min(config.max_staleness_penalty as u64)) as i32
        } else {
            0
        };
        let recent = match self.last_used_ms {
            Some(used) if now_ms.saturating_sub(used) <= config.recent_use_window_ms => {
                config.recent_use_bonus
            }
            _ => 0,
        };

        self.path_cost as i32 + staleness + self.failure_count as i32 * config.failure_penalty
            - recent
    }
}

/// Route chosen for a transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRoute {
    /// Relays in route-record order
    pub relays: RelayList,
    /// Path cost of the entry
    pub path_cost: u8,
}

impl SelectedRoute {
    /// MAC next hop: the relay nearest the coordinator, or the destination itself
    pub fn next_hop(&self, destination16: u16) -> u16 {
        self.relays.last().copied().unwrap_or(destination16)
    }
}

/// Candidate source routes keyed by destination short address
#[derive(Debug, Default)]
pub struct SourceRouteTable {
    routes: HashMap<u16, Vec<SourceRouteEntry>>,
    /// Relay list handed out by the last selection, per destination
    selected: HashMap<u16, RelayList>,
    config: RouteScoringConfig,
}

impl SourceRouteTable {
    /// Create an empty table
    pub fn new(config: RouteScoringConfig) -> Self {
        Self {
            routes: HashMap::new(),
            selected: HashMap::new(),
            config,
        }
    }

    /// Scoring configuration
    pub fn config(&self) -> &RouteScoringConfig {
        &self.config
    }

    /// Learn or refresh a route. Returns true if a new entry was created.
    pub fn add_route(&mut self, destination16: u16, relays: &[u16], path_cost: u8, now_ms: u64) -> bool {
        let config = self.config.clone();
        let entries = self.routes.entry(destination16).or_default();

        if let Some(existing) = entries.iter_mut().find(|e| e.relays.as_slice() == relays) {
            existing.path_cost = path_cost;
            existing.last_updated_ms = now_ms;
            existing.failure_count = 0;
            return false;
        }

        entries.push(SourceRouteEntry::new(RelayList::from_slice(relays), path_cost, now_ms));

        if entries.len() > config.max_entries_per_destination {
            if let Some((worst, _)) = entries
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| (e.is_blacklisted(&config), e.score(&config, now_ms)))
            {
                let evicted = entries.remove(worst);
                debug!(
                    "Evicted route to 0x{:04x} via {:?} (table full)",
                    destination16, evicted.relays
                );
            }
        }

        debug!(
            "Added route to 0x{:04x} via {:?} (cost: {})",
            destination16, relays, path_cost
        );
        true
    }

    /// Insert a fully formed entry, used when restoring persisted state
    pub fn insert_entry(&mut self, destination16: u16, entry: SourceRouteEntry) {
        self.routes.entry(destination16).or_default().push(entry);
    }

    /// Prune and pick the best entry for `destination16`.
    ///
    /// `unreliable` reports relays whose recent no-ACK count is excessive;
    /// entries through them are skipped but kept.
    pub fn select(
        &mut self,
        destination16: u16,
        now_ms: u64,
        ignore_staleness: bool,
        unreliable: impl Fn(u16) -> bool,
    ) -> Option<SelectedRoute> {
        let config = &self.config;
        let entries = self.routes.get_mut(&destination16)?;

        entries.retain(|e| {
            !e.is_blacklisted(config) && (ignore_staleness || !e.is_expired(config, now_ms))
        });

        let best = entries
            .iter()
            .filter(|e| !e.relays.iter().any(|relay| unreliable(*relay)))
            .min_by_key(|e| (e.score(config, now_ms), e.relays.len()))
            .map(|e| SelectedRoute {
                relays: e.relays.clone(),
                path_cost: e.path_cost,
            });

        if entries.is_empty() {
            self.routes.remove(&destination16);
        }
        match &best {
            Some(route) => {
                self.selected.insert(destination16, route.relays.clone());
            }
            None => {
                self.selected.remove(&destination16);
            }
        }
        best
    }

    fn marked_entry(&mut self, destination16: u16) -> Option<&mut SourceRouteEntry> {
        let relays = self.selected.get(&destination16).cloned();
        let entries = self.routes.get_mut(&destination16)?;
        match relays {
            Some(relays) => entries.iter_mut().find(|e| e.relays == relays),
            None => entries.iter_mut().min_by_key(|e| e.failure_count),
        }
    }

    /// Reset the failure count of the last selected entry
    pub fn mark_success(&mut self, destination16: u16, now_ms: u64) {
        if let Some(entry) = self.marked_entry(destination16) {
            entry.failure_count = 0;
            entry.last_used_ms = Some(now_ms);
        }
    }

    /// Count a failure on the last selected entry; returns true once it is blacklisted
    pub fn mark_failure(&mut self, destination16: u16) -> bool {
        let max_failures = self.config.max_failures;
        match self.marked_entry(destination16) {
            Some(entry) => {
                entry.failure_count = entry.failure_count.saturating_add(1);
                let blacklisted = entry.failure_count >= max_failures;
                if blacklisted {
                    info!(
                        "Route to 0x{:04x} via {:?} blacklisted after {} failures",
                        destination16, entry.relays, entry.failure_count
                    );
                }
                blacklisted
            }
            None => false,
        }
    }

    /// Remove every entry relaying through `relay16`; returns the number removed
    pub fn purge_relay(&mut self, relay16: u16) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| !e.relays.contains(&relay16));
            removed += before - entries.len();
            !entries.is_empty()
        });
        self.selected.retain(|_, relays| !relays.contains(&relay16));
        if removed > 0 {
            debug!("Purged {} routes relaying through 0x{:04x}", removed, relay16);
        }
        removed
    }

    /// Forget all routes to a destination
    pub fn remove_destination(&mut self, destination16: u16) {
        self.routes.remove(&destination16);
        self.selected.remove(&destination16);
    }

    /// Move routes after a short-address reassignment
    pub fn rename_destination(&mut self, old16: u16, new16: u16) {
        if let Some(entries) = self.routes.remove(&old16) {
            self.routes.insert(new16, entries);
        }
        self.selected.remove(&old16);
    }

    /// Drop expired and blacklisted entries everywhere
    pub fn prune(&mut self, now_ms: u64) {
        let config = &self.config;
        self.routes.retain(|_, entries| {
            entries.retain(|e| !e.is_blacklisted(config) && !e.is_expired(config, now_ms));
            !entries.is_empty()
        });
    }

    /// Lowest path cost among usable entries
    pub fn best_path_cost(&self, destination16: u16, now_ms: u64) -> Option<u8> {
        self.routes.get(&destination16).and_then(|entries| {
            entries
                .iter()
                .filter(|e| !e.is_blacklisted(&self.config) && !e.is_expired(&self.config, now_ms))
                .map(|e| e.path_cost)
                .min()
        })
    }

    /// Candidate entries for a destination
    pub fn routes(&self, destination16: u16) -> &[SourceRouteEntry] {
        self.routes
            .get(&destination16)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any entry exists for the destination
    pub fn has_routes(&self, destination16: u16) -> bool {
        self.routes.contains_key(&destination16)
    }

    /// Total number of entries
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SourceRouteTable {
        SourceRouteTable::new(RouteScoringConfig::default())
    }

    #[test]
    fn test_blacklisted_entry_never_selected() {
        let mut table = table();
        table.insert_entry(0x1234, SourceRouteEntry::new(RelayList::from_slice(&[0x0001]), 1, 0));
        let mut failing = SourceRouteEntry::new(RelayList::from_slice(&[0x0002]), 1, 0);
        failing.failure_count = 3;
        table.insert_entry(0x1234, failing);

        let route = table.select(0x1234, 1_000, false, |_| false).unwrap();
        assert_eq!(route.relays.as_slice(), &[0x0001]);
        assert_eq!(table.routes(0x1234).len(), 1);
    }

    #[test]
    fn test_mark_success_is_idempotent() {
        let mut table = table();
        table.add_route(0x1234, &[0x0001], 2, 0);
        table.select(0x1234, 0, false, |_| false);
        table.mark_failure(0x1234);
        table.mark_failure(0x1234);

        table.mark_success(0x1234, 10);
        assert_eq!(table.routes(0x1234)[0].failure_count, 0);
        table.mark_success(0x1234, 20);
        assert_eq!(table.routes(0x1234)[0].failure_count, 0);
        assert_eq!(table.routes(0x1234).len(), 1);
    }

    #[test]
    fn test_exhausted_entries_return_none() {
        let mut table = table();
        table.add_route(0x1234, &[0x0001], 1, 0);
        table.select(0x1234, 0, false, |_| false);
        assert!(!table.mark_failure(0x1234));
        assert!(!table.mark_failure(0x1234));
        assert!(table.mark_failure(0x1234));

        assert!(table.select(0x1234, 0, false, |_| false).is_none());
        assert!(!table.has_routes(0x1234));
    }

    #[test]
    fn test_expired_entries_pruned_unless_ignoring_staleness() {
        let mut table = table();
        table.add_route(0x1234, &[0x0001], 1, 0);

        assert!(table.select(0x1234, 400_000, true, |_| false).is_some());
        assert!(table.select(0x1234, 400_000, false, |_| false).is_none());
    }

    #[test]
    fn test_staleness_and_recency_shape_score() {
        let mut table = table();
        table.add_route(0x1234, &[0x0001], 2, 0);
        table.add_route(0x1234, &[0x0002], 3, 200_000);

        // the cost-2 route is stale by now and loses to the fresh cost-3 route
        let route = table.select(0x1234, 250_000, false, |_| false).unwrap();
        assert_eq!(route.relays.as_slice(), &[0x0002]);

        let config = RouteScoringConfig::default();
        let mut entry = SourceRouteEntry::new(RelayList::new(), 4, 0);
        assert_eq!(entry.score(&config, 1_000), 4);
        entry.last_used_ms = Some(900);
        assert_eq!(entry.score(&config, 1_000), 3);
        assert_eq!(entry.score(&config, 1_000_000), 4 + config.max_staleness_penalty);
    }

    #[test]
    fn test_unreliable_relay_skipped() {
        let mut table = table();
        table.add_route(0x1234, &[0x0001], 1, 0);
        table.add_route(0x1234, &[0x0002, 0x0003], 5, 0);

        let route = table.select(0x1234, 0, false, |relay| relay == 0x0001).unwrap();
        assert_eq!(route.relays.as_slice(), &[0x0002, 0x0003]);
        assert_eq!(route.next_hop(0x1234), 0x0003);
    }

    #[test]
    fn test_purge_relay_and_capacity() {
        let mut table = table();
        for relay in 1..=5u16 {
            table.add_route(0x1234, &[relay], relay as u8, 0);
        }
        assert_eq!(table.routes(0x1234).len(), 4);
        assert!(table.routes(0x1234).iter().all(|e| e.relays[0] != 5));

        table.add_route(0x5678, &[0x0002], 1, 0);
        assert_eq!(table.purge_relay(0x0002), 2);
        assert!(!table.has_routes(0x5678));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_refresh_resets_failures() {
        let mut table = table();
        assert!(table.add_route(0x1234, &[0x0001], 1, 0));
        table.select(0x1234, 0, false, |_| false);
        table.mark_failure(0x1234);
        assert!(!table.add_route(0x1234, &[0x0001], 2, 10));
        assert_eq!(table.routes(0x1234)[0].failure_count, 0);
        assert_eq!(table.best_path_cost(0x1234, 10), Some(2));
    }
}
