//! IEEE 802.15.4 MAC framing as used by Zigbee PRO.
//!
//! Frames handled here never carry the FCS; the radio transport appends and
//! strips it. Only 2003/2006 frame versions are decoded, and MAC-level
//! security is rejected since Zigbee secures frames at NWK/APS instead.

use crate::error::{ensure, WireError};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Broadcast PAN identifier
pub const BROADCAST_PAN_ID: u16 = 0xffff;
/// MAC broadcast short address
pub const BROADCAST_ADDRESS: u16 = 0xffff;
/// Largest MAC payload that fits a 127-byte PSDU with a minimal header and FCS
pub const MAX_MAC_PAYLOAD: usize = 127 - 9 - 2;

/// MAC frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacFrameType {
    /// Beacon frame
    Beacon = 0,
    /// Data frame
    Data = 1,
    /// Acknowledgment frame
    Ack = 2,
    /// MAC command frame
    Command = 3,
    /// Multipurpose frame (802.15.4-2015)
    Multipurpose = 5,
}

impl TryFrom<u8> for MacFrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MacFrameType::Beacon),
            1 => Ok(MacFrameType::Data),
            2 => Ok(MacFrameType::Ack),
            3 => Ok(MacFrameType::Command),
            5 => Ok(MacFrameType::Multipurpose),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Boolean bits of the MAC frame control field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MacFrameFlags: u16 {
        /// Auxiliary security header present
        const SECURITY = 1 << 3;
        /// More frames are pending for the recipient
        const FRAME_PENDING = 1 << 4;
        /// Recipient must acknowledge
        const ACK_REQUEST = 1 << 5;
        /// Source PAN omitted, equal to destination PAN
        const PAN_ID_COMPRESSION = 1 << 6;
        /// Sequence number omitted (2015 frames)
        const SEQUENCE_SUPPRESSION = 1 << 8;
        /// Information elements present (2015 frames)
        const IE_PRESENT = 1 << 9;
    }
}

/// MAC address field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacAddress {
    /// Address not present
    None,
    /// 16-bit short address
    Short(u16),
    /// 64-bit extended address
    Extended(u64),
}

impl MacAddress {
    /// Addressing mode as encoded in the frame control field
    pub fn mode(&self) -> u8 {
        match self {
            MacAddress::None => 0,
            MacAddress::Short(_) => 2,
            MacAddress::Extended(_) => 3,
        }
    }

    /// Short address, if this is one
    pub fn short(&self) -> Option<u16> {
        match self {
            MacAddress::Short(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Extended address, if this is one
    pub fn extended(&self) -> Option<u64> {
        match self {
            MacAddress::Extended(addr) => Some(*addr),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            MacAddress::None => 0,
            MacAddress::Short(_) => 2,
            MacAddress::Extended(_) => 8,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            MacAddress::None => {}
            MacAddress::Short(addr) => buf.put_u16_le(*addr),
            MacAddress::Extended(addr) => buf.put_u64_le(*addr),
        }
    }

    fn decode(mode: u8, buf: &mut Bytes) -> Result<Self, WireError> {
        match mode {
            0 => Ok(MacAddress::None),
            2 => {
                ensure(buf, 2)?;
                Ok(MacAddress::Short(buf.get_u16_le()))
            }
            3 => {
                ensure(buf, 8)?;
                Ok(MacAddress::Extended(buf.get_u64_le()))
            }
            other => Err(WireError::AddressMode(other)),
        }
    }
}

/// Decoded MAC header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacHeader {
    /// Frame type
    pub frame_type: MacFrameType,
    /// Frame control flags
    pub flags: MacFrameFlags,
    /// Frame version (0 = 2003, 1 = 2006, 2 = 2015)
    pub frame_version: u8,
    /// Sequence number
    pub sequence_number: u8,
    /// Destination PAN identifier
    pub destination_pan: Option<u16>,
    /// Destination address
    pub destination: MacAddress,
    /// Source PAN identifier
    pub source_pan: Option<u16>,
    /// Source address
    pub source: MacAddress,
}

impl MacHeader {
    /// Header for a unicast or broadcast data frame inside `pan_id`
    pub fn data(sequence_number: u8, pan_id: u16, destination: u16, source: u16) -> Self {
        let mut flags = MacFrameFlags::PAN_ID_COMPRESSION;
        if destination != BROADCAST_ADDRESS {
            flags |= MacFrameFlags::ACK_REQUEST;
        }

        Self {
            frame_type: MacFrameType::Data,
            flags,
            frame_version: 0,
            sequence_number,
            destination_pan: Some(pan_id),
            destination: MacAddress::Short(destination),
            source_pan: Some(pan_id),
            source: MacAddress::Short(source),
        }
    }

    /// Header for a MAC command frame
    pub fn command(
        sequence_number: u8,
        pan_id: u16,
        destination: MacAddress,
        source: MacAddress,
    ) -> Self {
        let mut flags = MacFrameFlags::PAN_ID_COMPRESSION;
        if destination != MacAddress::Short(BROADCAST_ADDRESS) && destination != MacAddress::None {
            flags |= MacFrameFlags::ACK_REQUEST;
        }

        Self {
            frame_type: MacFrameType::Command,
            flags,
            frame_version: 0,
            sequence_number,
            destination_pan: Some(pan_id),
            destination,
            source_pan: Some(pan_id),
            source,
        }
    }

    /// Header for a beacon frame
    pub fn beacon(sequence_number: u8, pan_id: u16, source: u16) -> Self {
        Self {
            frame_type: MacFrameType::Beacon,
            flags: MacFrameFlags::empty(),
            frame_version: 0,
            sequence_number,
            destination_pan: None,
            destination: MacAddress::None,
            source_pan: Some(pan_id),
            source: MacAddress::Short(source),
        }
    }

    /// Encoded length of this header
    pub fn encoded_len(&self) -> usize {
        let mut len = 3 + self.destination.encoded_len() + self.source.encoded_len();
        if self.destination != MacAddress::None {
            len += 2;
        }
        if self.has_source_pan() {
            len += 2;
        }
        len
    }

    fn has_source_pan(&self) -> bool {
        self.source != MacAddress::None
            && !(self.flags.contains(MacFrameFlags::PAN_ID_COMPRESSION)
                && self.destination != MacAddress::None)
    }

    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let fcf = (self.frame_type as u16 & 0x07)
            | self.flags.bits()
            | ((self.destination.mode() as u16) << 10)
            | (((self.frame_version & 0x03) as u16) << 12)
            | ((self.source.mode() as u16) << 14);
        buf.put_u16_le(fcf);
        buf.put_u8(self.sequence_number);

        if self.destination != MacAddress::None {
            buf.put_u16_le(self.destination_pan.unwrap_or(BROADCAST_PAN_ID));
            self.destination.encode(buf);
        }
        if self.has_source_pan() {
            buf.put_u16_le(self.source_pan.unwrap_or(BROADCAST_PAN_ID));
        }
        self.source.encode(buf);
    }

    /// Decode a header, leaving `buf` positioned at the MAC payload
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 2)?;
        let fcf = buf.get_u16_le();
        let frame_type = MacFrameType::try_from((fcf & 0x07) as u8)?;
        let flags = MacFrameFlags::from_bits_truncate(fcf);
        let dst_mode = ((fcf >> 10) & 0x03) as u8;
        let frame_version = ((fcf >> 12) & 0x03) as u8;
        let src_mode = ((fcf >> 14) & 0x03) as u8;

        if frame_version > 1 && flags.intersects(MacFrameFlags::SEQUENCE_SUPPRESSION | MacFrameFlags::IE_PRESENT) {
            return Err(WireError::Unsupported("802.15.4-2015 header fields"));
        }
        if flags.contains(MacFrameFlags::SECURITY) {
            return Err(WireError::Unsupported("MAC security"));
        }

        ensure(buf, 1)?;
        let sequence_number = buf.get_u8();

        let mut destination_pan = None;
        if dst_mode != 0 {
            ensure(buf, 2)?;
            destination_pan = Some(buf.get_u16_le());
        }
        let destination = MacAddress::decode(dst_mode, buf)?;

        let mut source_pan = None;
        if src_mode != 0 {
            if flags.contains(MacFrameFlags::PAN_ID_COMPRESSION) && destination_pan.is_some() {
                source_pan = destination_pan;
            } else {
                ensure(buf, 2)?;
                source_pan = Some(buf.get_u16_le());
            }
        }
        let source = MacAddress::decode(src_mode, buf)?;

        Ok(Self {
            frame_type,
            flags,
            frame_version,
            sequence_number,
            destination_pan,
            destination,
            source_pan,
            source,
        })
    }
}

/// Encode a complete MAC frame (header followed by payload, no FCS)
pub fn encode_mac_frame(header: &MacHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a complete MAC frame into its header and payload
pub fn decode_mac_frame(mut frame: Bytes) -> Result<(MacHeader, Bytes), WireError> {
    let header = MacHeader::decode(&mut frame)?;
    Ok((header, frame))
}

/// MAC command identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacCommandId {
    /// Association request
    AssociationRequest = 0x01,
    /// Association response
    AssociationResponse = 0x02,
    /// Disassociation notification
    DisassociationNotify = 0x03,
    /// Data request (poll)
    DataRequest = 0x04,
    /// PAN identifier conflict notification
    PanIdConflict = 0x05,
    /// Orphan notification
    OrphanNotify = 0x06,
    /// Beacon request
    BeaconRequest = 0x07,
    /// Coordinator realignment
    CoordinatorRealign = 0x08,
    /// GTS request
    GtsRequest = 0x09,
}

impl TryFrom<u8> for MacCommandId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MacCommandId::AssociationRequest),
            0x02 => Ok(MacCommandId::AssociationResponse),
            0x03 => Ok(MacCommandId::DisassociationNotify),
            0x04 => Ok(MacCommandId::DataRequest),
            0x05 => Ok(MacCommandId::PanIdConflict),
            0x06 => Ok(MacCommandId::OrphanNotify),
            0x07 => Ok(MacCommandId::BeaconRequest),
            0x08 => Ok(MacCommandId::CoordinatorRealign),
            0x09 => Ok(MacCommandId::GtsRequest),
            _ => Err(WireError::Command(value)),
        }
    }
}

bitflags! {
    /// Capability information carried in association requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MacCapabilities: u8 {
        /// Device can act as alternate PAN coordinator
        const ALTERNATE_PAN_COORDINATOR = 1 << 0;
        /// Full function device (router)
        const FULL_FUNCTION_DEVICE = 1 << 1;
        /// Powered from mains
        const MAINS_POWERED = 1 << 2;
        /// Receiver stays on while idle
        const RX_ON_WHEN_IDLE = 1 << 3;
        /// Device supports MAC security
        const SECURITY_CAPABLE = 1 << 6;
        /// Device asks the coordinator to allocate a short address
        const ALLOCATE_ADDRESS = 1 << 7;
    }
}

impl MacCapabilities {
    /// Whether frames to this device can be sent directly
    pub fn rx_on_when_idle(&self) -> bool {
        self.contains(MacCapabilities::RX_ON_WHEN_IDLE)
    }

    /// Whether the device is a router
    pub fn is_router(&self) -> bool {
        self.contains(MacCapabilities::FULL_FUNCTION_DEVICE)
    }
}

/// Association status codes returned to joining devices
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacAssociationStatus {
    /// Association successful
    Success = 0x00,
    /// PAN at capacity
    PanFull = 0x01,
    /// Access denied
    PanAccessDenied = 0x02,
}

impl TryFrom<u8> for MacAssociationStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MacAssociationStatus::Success),
            0x01 => Ok(MacAssociationStatus::PanFull),
            0x02 => Ok(MacAssociationStatus::PanAccessDenied),
            _ => Err(WireError::Code(value)),
        }
    }
}

/// Decoded MAC command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    /// Association request with the device capabilities
    AssociationRequest {
        /// Capability information
        capabilities: MacCapabilities,
    },
    /// Association response
    AssociationResponse {
        /// Short address assigned to the device
        short_address: u16,
        /// Outcome of the association
        status: MacAssociationStatus,
    },
    /// Disassociation notification
    DisassociationNotify {
        /// Disassociation reason code
        reason: u8,
    },
    /// Data request (poll for pending frames)
    DataRequest,
    /// Beacon request
    BeaconRequest,
    /// Command recognized but carrying nothing this coordinator acts on
    Other(MacCommandId),
}

impl MacCommand {
    /// Command identifier of this command
    pub fn id(&self) -> MacCommandId {
        match self {
            MacCommand::AssociationRequest { .. } => MacCommandId::AssociationRequest,
            MacCommand::AssociationResponse { .. } => MacCommandId::AssociationResponse,
            MacCommand::DisassociationNotify { .. } => MacCommandId::DisassociationNotify,
            MacCommand::DataRequest => MacCommandId::DataRequest,
            MacCommand::BeaconRequest => MacCommandId::BeaconRequest,
            MacCommand::Other(id) => *id,
        }
    }

    /// Decode a command from a MAC payload
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 1)?;
        let id = MacCommandId::try_from(buf.get_u8())?;

        match id {
            MacCommandId::AssociationRequest => {
                ensure(buf, 1)?;
                Ok(MacCommand::AssociationRequest {
                    capabilities: MacCapabilities::from_bits_truncate(buf.get_u8()),
                })
            }
            MacCommandId::AssociationResponse => {
                ensure(buf, 3)?;
                let short_address = buf.get_u16_le();
                let status = MacAssociationStatus::try_from(buf.get_u8())?;
                Ok(MacCommand::AssociationResponse {
                    short_address,
                    status,
                })
            }
            MacCommandId::DisassociationNotify => {
                ensure(buf, 1)?;
                Ok(MacCommand::DisassociationNotify {
                    reason: buf.get_u8(),
                })
            }
            MacCommandId::DataRequest => Ok(MacCommand::DataRequest),
            MacCommandId::BeaconRequest => Ok(MacCommand::BeaconRequest),
            other => Ok(MacCommand::Other(other)),
        }
    }

    /// Encode the command (identifier and payload)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id() as u8);
        match self {
            MacCommand::AssociationRequest { capabilities } => buf.put_u8(capabilities.bits()),
            MacCommand::AssociationResponse {
                short_address,
                status,
            } => {
                buf.put_u16_le(*short_address);
                buf.put_u8(*status as u8);
            }
            MacCommand::DisassociationNotify { reason } => buf.put_u8(*reason),
            MacCommand::DataRequest | MacCommand::BeaconRequest | MacCommand::Other(_) => {}
        }
    }
}

/// Superframe specification advertised in beacons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperframeSpec {
    /// Beacon order (15 = non-beacon network)
    pub beacon_order: u8,
    /// Superframe order
    pub superframe_order: u8,
    /// Final CAP slot
    pub final_cap_slot: u8,
    /// Battery life extension
    pub battery_life_extension: bool,
    /// Sender is the PAN coordinator
    pub pan_coordinator: bool,
    /// Sender accepts association requests
    pub association_permit: bool,
}

impl SuperframeSpec {
    /// Non-beacon superframe of a PAN coordinator
    pub fn coordinator(association_permit: bool) -> Self {
        Self {
            beacon_order: 0x0f,
            superframe_order: 0x0f,
            final_cap_slot: 0x0f,
            battery_life_extension: false,
            pan_coordinator: true,
            association_permit,
        }
    }

    /// Pack into the 16-bit wire field
    pub fn pack(&self) -> u16 {
        (self.beacon_order as u16 & 0x0f)
            | ((self.superframe_order as u16 & 0x0f) << 4)
            | ((self.final_cap_slot as u16 & 0x0f) << 8)
            | ((self.battery_life_extension as u16) << 12)
            | ((self.pan_coordinator as u16) << 14)
            | ((self.association_permit as u16) << 15)
    }

    /// Unpack from the 16-bit wire field
    pub fn unpack(value: u16) -> Self {
        Self {
            beacon_order: (value & 0x0f) as u8,
            superframe_order: ((value >> 4) & 0x0f) as u8,
            final_cap_slot: ((value >> 8) & 0x0f) as u8,
            battery_life_extension: value & (1 << 12) != 0,
            pan_coordinator: value & (1 << 14) != 0,
            association_permit: value & (1 << 15) != 0,
        }
    }
}

/// Zigbee beacon payload following the MAC beacon fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZigbeeBeaconPayload {
    /// Stack profile (2 = Zigbee PRO)
    pub stack_profile: u8,
    /// NWK protocol version
    pub protocol_version: u8,
    /// Room for router children
    pub router_capacity: bool,
    /// Depth of the sender in the network
    pub device_depth: u8,
    /// Room for end device children
    pub end_device_capacity: bool,
    /// Extended PAN identifier
    pub extended_pan_id: u64,
    /// Update identifier
    pub update_id: u8,
}

/// Encode a beacon MAC payload: superframe, empty GTS and pending fields, Zigbee payload
pub fn encode_beacon_payload(superframe: &SuperframeSpec, beacon: &ZigbeeBeaconPayload) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    buf.put_u16_le(superframe.pack());
    buf.put_u8(0); // GTS specification
    buf.put_u8(0); // pending address specification
    buf.put_u8(0); // protocol id
    buf.put_u8((beacon.stack_profile & 0x0f) | ((beacon.protocol_version & 0x0f) << 4));
    buf.put_u8(
        ((beacon.router_capacity as u8) << 2)
            | ((beacon.device_depth & 0x0f) << 3)
            | ((beacon.end_device_capacity as u8) << 7),
    );
    buf.put_u64_le(beacon.extended_pan_id);
    buf.put_slice(&[0xff, 0xff, 0xff]); // tx offset
    buf.put_u8(beacon.update_id);
    buf.freeze()
}
