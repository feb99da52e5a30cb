//! Zigbee PRO frame codecs for the coordinator stack.
//!
//! This crate covers the on-air formats the coordinator speaks: IEEE 802.15.4
//! MAC frames and commands, the Zigbee NWK and APS layers, Green Power NWK
//! frames, and the CCM* security that protects NWK and APS payloads.
//!
//! ## Frame Layout
//!
//! ```text
//! +-----------------+----------------------------------------+
//! | MAC header      | frame control, sequence, PAN, addresses|
//! +-----------------+----------------------------------------+
//! | NWK header      | frame control, dst16, src16, radius,   |
//! |                 | sequence, optional IEEE/source route   |
//! +-----------------+----------------------------------------+
//! | NWK aux header  | when NWK security is on                |
//! +-----------------+----------------------------------------+
//! | APS header      | (encrypted together with APS payload)  |
//! +-----------------+----------------------------------------+
//! | APS aux header  | when APS security is on                |
//! +-----------------+----------------------------------------+
//! | payload + MIC   |                                        |
//! +-----------------+----------------------------------------+
//! ```
//!
//! The radio computes the FCS; frames here never include it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aps;
pub mod error;
pub mod fragment;
pub mod gp;
pub mod mac;
pub mod nwk;
pub mod security;

// Re-export main types
pub use aps::{
    ApsCommand, ApsCommandId, ApsDeliveryMode, ApsFragmentation, ApsFrameFlags, ApsFrameType,
    ApsHeader, ApsKeyType, FragmentKind, RequestKeyType, TransportKey, UpdateDeviceStatus,
};
pub use error::WireError;
pub use fragment::{Fragmenter, Reassembler, MAX_UNFRAGMENTED_PAYLOAD};
pub use gp::{decode_gp_frame, GpFrame, NwkGpHeader};
pub use mac::{
    decode_mac_frame, encode_beacon_payload, encode_mac_frame, MacAddress, MacAssociationStatus,
    MacCapabilities, MacCommand, MacCommandId, MacFrameFlags, MacFrameType, MacHeader,
    SuperframeSpec, ZigbeeBeaconPayload,
};
pub use nwk::{
    is_broadcast, LeaveOptions, LinkStatusEntry, NwkCommand, NwkCommandId, NwkFrameFlags,
    NwkFrameType, NwkHeader, NwkStatusCode, SourceRoute,
};
pub use security::{AuxSecurityHeader, Key, KeyIdentifier, SecurityControl};
