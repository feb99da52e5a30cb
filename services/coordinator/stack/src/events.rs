//! Events emitted to the surrounding application

use bytes::Bytes;
use serde::Serialize;
use zb_wire::{ApsHeader, NwkGpHeader};

/// Upward notifications from the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StackEvent {
    /// A device joined for the first time
    DeviceJoined {
        /// Short address
        address16: u16,
        /// IEEE address
        address64: u64,
        /// Parent router when joined through one
        parent16: Option<u16>,
    },
    /// A known device rejoined
    DeviceRejoined {
        /// Short address
        address16: u16,
        /// IEEE address
        address64: u64,
        /// Rejoin was NWK-secured
        secured: bool,
    },
    /// A device verified its Trust Center link key
    DeviceAuthorized {
        /// Short address
        address16: u16,
        /// IEEE address
        address64: u64,
    },
    /// A device left or was removed
    DeviceLeft {
        /// Short address
        address16: u16,
        /// IEEE address
        address64: u64,
    },
    /// Application payload delivered
    FrameReceived {
        /// Sender short address
        sender16: u16,
        /// Sender IEEE address, when known
        sender64: Option<u64>,
        /// Decoded APS header
        aps_header: ApsHeader,
        /// Reassembled payload
        payload: Bytes,
        /// Link quality assessment of the last hop
        lqa: u8,
    },
    /// Green Power frame delivered
    GreenPowerFrame {
        /// Decoded GP header
        header: NwkGpHeader,
        /// GPD command
        command_id: u8,
        /// Command payload
        payload: Bytes,
        /// Link quality assessment
        lqa: u8,
    },
    /// Raw MAC frame, for diagnostics
    MacFrame {
        /// PSDU without FCS
        frame: Bytes,
        /// Received signal strength
        rssi: i8,
    },
    /// The engine cannot continue
    FatalError {
        /// Description
        message: String,
    },
}
