//! Green Power NWK frames (protocol version 3).
//!
//! Only decoding is needed: the coordinator receives GPD frames and passes
//! them upward after the duplicate and commissioning checks. Security is not
//! verified here; the MIC is stripped from the payload.

use crate::error::{ensure, WireError};
use crate::nwk::GP_PROTOCOL_VERSION;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

/// GPD commissioning command
pub const GP_CMD_COMMISSIONING: u8 = 0xe0;
/// GPD decommissioning command
pub const GP_CMD_DECOMMISSIONING: u8 = 0xe1;
/// GPD commissioning success command
pub const GP_CMD_SUCCESS: u8 = 0xe2;
/// GPD channel request command
pub const GP_CMD_CHANNEL_REQUEST: u8 = 0xe3;

/// Whether `command_id` is only accepted inside a commissioning window
pub fn is_commissioning_command(command_id: u8) -> bool {
    matches!(
        command_id,
        GP_CMD_COMMISSIONING | GP_CMD_SUCCESS | GP_CMD_CHANNEL_REQUEST
    )
}

/// GP frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpFrameType {
    /// Data frame
    Data = 0,
    /// Maintenance frame
    Maintenance = 1,
}

impl TryFrom<u8> for GpFrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GpFrameType::Data),
            1 => Ok(GpFrameType::Maintenance),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Decoded GP NWK header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwkGpHeader {
    /// Frame type
    pub frame_type: GpFrameType,
    /// Auto-commissioning flag
    pub auto_commissioning: bool,
    /// Application identifier (0 = source id, 2 = IEEE address)
    pub application_id: u8,
    /// Security level (0 none, 1 short MIC, 2 MIC, 3 encrypted + MIC)
    pub security_level: u8,
    /// Individual key in use
    pub security_key: bool,
    /// GPD keeps its receiver on after transmitting
    pub rx_after_tx: bool,
    /// Direction (false = from GPD)
    pub direction: bool,
    /// GPD source identifier
    pub source_id: Option<u32>,
    /// GPD endpoint (IEEE addressing)
    pub endpoint: Option<u8>,
    /// Security frame counter
    pub frame_counter: Option<u32>,
}

/// A decoded GP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpFrame {
    /// NWK GP header
    pub header: NwkGpHeader,
    /// GPD command identifier
    pub command_id: u8,
    /// Command payload without the MIC
    pub payload: Bytes,
}

/// Decode a GP NWK frame from a MAC data payload
pub fn decode_gp_frame(mut buf: Bytes) -> Result<GpFrame, WireError> {
    ensure(&buf, 1)?;
    let fcf = buf.get_u8();
    let protocol_version = (fcf >> 2) & 0x0f;
    if protocol_version != GP_PROTOCOL_VERSION {
        return Err(WireError::Version(protocol_version));
    }
    let frame_type = GpFrameType::try_from(fcf & 0x03)?;
    let auto_commissioning = fcf & 0x40 != 0;
    let has_extension = fcf & 0x80 != 0;

    let mut header = NwkGpHeader {
        frame_type,
        auto_commissioning,
        application_id: 0,
        security_level: 0,
        security_key: false,
        rx_after_tx: false,
        direction: false,
        source_id: None,
        endpoint: None,
        frame_counter: None,
    };

    if has_extension {
        ensure(&buf, 1)?;
        let ext = buf.get_u8();
        header.application_id = ext & 0x07;
        header.security_level = (ext >> 3) & 0x03;
        header.security_key = ext & 0x20 != 0;
        header.rx_after_tx = ext & 0x40 != 0;
        header.direction = ext & 0x80 != 0;
    }

    match header.application_id {
        0 => {
            if frame_type == GpFrameType::Data || has_extension {
                ensure(&buf, 4)?;
                header.source_id = Some(buf.get_u32_le());
            }
        }
        2 => {
            ensure(&buf, 1)?;
            header.endpoint = Some(buf.get_u8());
        }
        _ => return Err(WireError::Unsupported("GP application id")),
    }

    if header.security_level >= 2 {
        ensure(&buf, 4)?;
        header.frame_counter = Some(buf.get_u32_le());
    }

    let mic_len = match header.security_level {
        0 => 0,
        1 => 2,
        _ => 4,
    };

    ensure(&buf, 1 + mic_len)?;
    let command_id = buf.get_u8();
    let payload = buf.slice(..buf.len() - mic_len);

    Ok(GpFrame {
        header,
        command_id,
        payload,
    })
}
