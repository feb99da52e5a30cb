//! Zigbee coordinator and Trust Center protocol engine.
//!
//! The engine owns all coordinator state in a single [`StackContext`] and
//! drives it from one task: inbound PSDUs go through the dispatcher to the
//! MAC, NWK, APS and Green Power handlers, application commands arrive over
//! a [`StackHandle`], and periodic work runs from the scheduler. Outbound
//! frames leave through a [`FrameTransport`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aps;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gp;
pub mod link_quality;
pub mod mac;
pub mod nwk;
pub mod scheduler;
pub mod stack;
pub mod transport;

pub use aps::{ApsDataRequest, ApsHandler, KeyDelivery};
pub use config::{
    AppKeyRequestPolicy, InstallCodePolicy, KeyUpdateMethod, LinkQualityConfig, StackConfig,
    TcKeyRequestPolicy, TimingConfig, TrustCenterPolicies,
};
pub use context::{AssociationOutcome, AssociationRequest, StackContext};
pub use device::Device;
pub use dispatcher::Layers;
pub use error::{StackError, StackResult};
pub use events::StackEvent;
pub use gp::GpHandler;
pub use mac::{MacHandler, RouteOutcomeSink};
pub use nwk::{NwkHandler, NwkTxOptions, RouteChoice};
pub use scheduler::{Scheduler, TimerKind};
pub use stack::{InboundFrame, Stack, StackCommand, StackHandle};
pub use transport::{FrameTransport, TransportError};
