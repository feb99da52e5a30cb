//! The coordinator acts as a many-to-one concentrator: devices report the
//! relay chain back to it through ROUTE_RECORD and the coordinator keeps
//! several candidate source routes per destination. Candidates are aged,
//! blacklisted after repeated failures and ranked by a composite score so a
//! bad path heals itself without waiting for a full rediscovery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod failure_tracker;
pub mod table;

pub use failure_tracker::NoAckTracker;
pub use table::{
    RelayList, RouteScoringConfig, SelectedRoute, SourceRouteEntry, SourceRouteTable,
};

use thiserror::Error;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The destination is neither a known device nor a broadcast address
    #[error("Unknown destination 0x{0:04x}")]
    UnknownDestination(u16),
}
