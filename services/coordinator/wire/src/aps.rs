//! Application support sublayer header and Trust Center command frames.

use crate::error::{ensure, WireError};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// ZDO endpoint
pub const ZDO_ENDPOINT: u8 = 0x00;
/// ZDO profile identifier
pub const ZDO_PROFILE_ID: u16 = 0x0000;
/// Confirm key status: key verified
pub const CONFIRM_KEY_SUCCESS: u8 = 0x00;
/// Confirm key status: hash mismatch
pub const CONFIRM_KEY_SECURITY_FAILURE: u8 = 0xad;

/// APS frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApsFrameType {
    /// Data frame
    Data = 0,
    /// APS command frame
    Command = 1,
    /// Acknowledgment
    Ack = 2,
    /// Inter-PAN frame
    InterPan = 3,
}

impl From<u8> for ApsFrameType {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0 => ApsFrameType::Data,
            1 => ApsFrameType::Command,
            2 => ApsFrameType::Ack,
            _ => ApsFrameType::InterPan,
        }
    }
}

/// APS delivery modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApsDeliveryMode {
    /// Unicast to an endpoint
    Unicast = 0,
    /// Broadcast to all endpoints
    Broadcast = 2,
    /// Group addressed
    Group = 3,
}

impl TryFrom<u8> for ApsDeliveryMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ApsDeliveryMode::Unicast),
            2 => Ok(ApsDeliveryMode::Broadcast),
            3 => Ok(ApsDeliveryMode::Group),
            _ => Err(WireError::Code(value)),
        }
    }
}

bitflags! {
    /// Boolean bits of the APS frame control field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ApsFrameFlags: u8 {
        /// Acknowledgment of a command frame (no endpoint fields)
        const ACK_FORMAT = 1 << 4;
        /// APS auxiliary security header present
        const SECURITY = 1 << 5;
        /// Recipient must acknowledge
        const ACK_REQUEST = 1 << 6;
        /// Extended header present
        const EXTENDED_HEADER = 1 << 7;
    }
}

/// Position of a block within a fragmented transfer
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    /// First block, `block_number` carries the total block count
    First = 1,
    /// Any later block, `block_number` is its index
    Subsequent = 2,
}

/// Extended header fragmentation fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApsFragmentation {
    /// Block position
    pub kind: FragmentKind,
    /// Total block count for the first block, block index otherwise
    pub block_number: u8,
    /// Acknowledged blocks (ACK frames only)
    pub ack_bitfield: Option<u8>,
}

/// Decoded APS header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApsHeader {
    /// Frame type
    pub frame_type: ApsFrameType,
    /// Delivery mode
    pub delivery_mode: ApsDeliveryMode,
    /// Frame control flags; `EXTENDED_HEADER` is derived from `fragmentation` on encode
    pub flags: ApsFrameFlags,
    /// Destination endpoint
    pub destination_endpoint: Option<u8>,
    /// Group address
    pub group: Option<u16>,
    /// Cluster identifier
    pub cluster_id: Option<u16>,
    /// Profile identifier
    pub profile_id: Option<u16>,
    /// Source endpoint
    pub source_endpoint: Option<u8>,
    /// APS counter
    pub counter: u8,
    /// Fragmentation fields
    pub fragmentation: Option<ApsFragmentation>,
}

impl ApsHeader {
    /// Header of a unicast or broadcast data frame
    pub fn data(
        delivery_mode: ApsDeliveryMode,
        destination_endpoint: u8,
        cluster_id: u16,
        profile_id: u16,
        source_endpoint: u8,
        counter: u8,
    ) -> Self {
        Self {
            frame_type: ApsFrameType::Data,
            delivery_mode,
            flags: ApsFrameFlags::empty(),
            destination_endpoint: Some(destination_endpoint),
            group: None,
            cluster_id: Some(cluster_id),
            profile_id: Some(profile_id),
            source_endpoint: Some(source_endpoint),
            counter,
            fragmentation: None,
        }
    }

    /// Header of a command frame
    pub fn command(delivery_mode: ApsDeliveryMode, counter: u8) -> Self {
        Self {
            frame_type: ApsFrameType::Command,
            delivery_mode,
            flags: ApsFrameFlags::empty(),
            destination_endpoint: None,
            group: None,
            cluster_id: None,
            profile_id: None,
            source_endpoint: None,
            counter,
            fragmentation: None,
        }
    }

    /// Acknowledgment mirroring `acked`: endpoints swap, counter and cluster are kept
    pub fn ack_for(acked: &ApsHeader) -> Self {
        let command_ack = acked.frame_type == ApsFrameType::Command;
        let mut flags = ApsFrameFlags::empty();
        if command_ack {
            flags |= ApsFrameFlags::ACK_FORMAT;
        }

        Self {
            frame_type: ApsFrameType::Ack,
            delivery_mode: ApsDeliveryMode::Unicast,
            flags,
            destination_endpoint: if command_ack { None } else { acked.source_endpoint },
            group: None,
            cluster_id: if command_ack { None } else { acked.cluster_id },
            profile_id: if command_ack { None } else { acked.profile_id },
            source_endpoint: if command_ack { None } else { acked.destination_endpoint },
            counter: acked.counter,
            fragmentation: acked.fragmentation.map(|fragment| ApsFragmentation {
                kind: fragment.kind,
                block_number: if fragment.kind == FragmentKind::First {
                    0
                } else {
                    fragment.block_number
                },
                ack_bitfield: Some(1),
            }),
        }
    }

    /// Whether the payload is APS secured
    pub fn is_secured(&self) -> bool {
        self.flags.contains(ApsFrameFlags::SECURITY)
    }

    /// Whether the sender requested an acknowledgment
    pub fn ack_requested(&self) -> bool {
        self.flags.contains(ApsFrameFlags::ACK_REQUEST)
    }

    fn has_endpoints(&self) -> bool {
        match self.frame_type {
            ApsFrameType::Data => true,
            ApsFrameType::Ack => !self.flags.contains(ApsFrameFlags::ACK_FORMAT),
            ApsFrameType::Command | ApsFrameType::InterPan => false,
        }
    }

    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = self.flags;
        flags.set(ApsFrameFlags::EXTENDED_HEADER, self.fragmentation.is_some());
        buf.put_u8((self.frame_type as u8) | ((self.delivery_mode as u8) << 2) | flags.bits());

        if self.has_endpoints() {
            if self.delivery_mode == ApsDeliveryMode::Group {
                buf.put_u16_le(self.group.unwrap_or_default());
            } else {
                buf.put_u8(self.destination_endpoint.unwrap_or_default());
            }
            buf.put_u16_le(self.cluster_id.unwrap_or_default());
            buf.put_u16_le(self.profile_id.unwrap_or_default());
            buf.put_u8(self.source_endpoint.unwrap_or_default());
        }
        buf.put_u8(self.counter);

        if let Some(fragment) = &self.fragmentation {
            buf.put_u8(fragment.kind as u8);
            buf.put_u8(fragment.block_number);
            if self.frame_type == ApsFrameType::Ack {
                buf.put_u8(fragment.ack_bitfield.unwrap_or(1));
            }
        }
    }

    /// Decode a header, leaving `buf` positioned at the APS payload
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 1)?;
        let fcf = buf.get_u8();
        let frame_type = ApsFrameType::from(fcf);
        let delivery_mode = ApsDeliveryMode::try_from((fcf >> 2) & 0x03)?;
        let flags = ApsFrameFlags::from_bits_truncate(fcf);

        let mut header = Self {
            frame_type,
            delivery_mode,
            flags,
            destination_endpoint: None,
            group: None,
            cluster_id: None,
            profile_id: None,
            source_endpoint: None,
            counter: 0,
            fragmentation: None,
        };

        if frame_type == ApsFrameType::InterPan {
            return Err(WireError::Unsupported("APS inter-PAN frame"));
        }

        if header.has_endpoints() {
            if delivery_mode == ApsDeliveryMode::Group {
                ensure(buf, 2)?;
                header.group = Some(buf.get_u16_le());
            } else {
                ensure(buf, 1)?;
                header.destination_endpoint = Some(buf.get_u8());
            }
            ensure(buf, 5)?;
            header.cluster_id = Some(buf.get_u16_le());
            header.profile_id = Some(buf.get_u16_le());
            header.source_endpoint = Some(buf.get_u8());
        }

        ensure(buf, 1)?;
        header.counter = buf.get_u8();

        if flags.contains(ApsFrameFlags::EXTENDED_HEADER) {
            ensure(buf, 1)?;
            let kind = match buf.get_u8() & 0x03 {
                0 => None,
                1 => Some(FragmentKind::First),
                2 => Some(FragmentKind::Subsequent),
                other => return Err(WireError::Code(other)),
            };
            if let Some(kind) = kind {
                ensure(buf, 1)?;
                let block_number = buf.get_u8();
                let ack_bitfield = if frame_type == ApsFrameType::Ack {
                    ensure(buf, 1)?;
                    Some(buf.get_u8())
                } else {
                    None
                };
                header.fragmentation = Some(ApsFragmentation {
                    kind,
                    block_number,
                    ack_bitfield,
                });
            }
        }

        Ok(header)
    }
}

/// APS command identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApsCommandId {
    /// Transport key
    TransportKey = 0x05,
    /// Update device
    UpdateDevice = 0x06,
    /// Remove device
    RemoveDevice = 0x07,
    /// Request key
    RequestKey = 0x08,
    /// Switch key
    SwitchKey = 0x09,
    /// Tunnel
    Tunnel = 0x0e,
    /// Verify key
    VerifyKey = 0x0f,
    /// Confirm key
    ConfirmKey = 0x10,
    /// Relay message downstream (R23)
    RelayMessageDownstream = 0x11,
    /// Relay message upstream (R23)
    RelayMessageUpstream = 0x12,
}

impl TryFrom<u8> for ApsCommandId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x05 => Ok(ApsCommandId::TransportKey),
            0x06 => Ok(ApsCommandId::UpdateDevice),
            0x07 => Ok(ApsCommandId::RemoveDevice),
            0x08 => Ok(ApsCommandId::RequestKey),
            0x09 => Ok(ApsCommandId::SwitchKey),
            0x0e => Ok(ApsCommandId::Tunnel),
            0x0f => Ok(ApsCommandId::VerifyKey),
            0x10 => Ok(ApsCommandId::ConfirmKey),
            0x11 => Ok(ApsCommandId::RelayMessageDownstream),
            0x12 => Ok(ApsCommandId::RelayMessageUpstream),
            _ => Err(WireError::Command(value)),
        }
    }
}

/// Key types carried by TRANSPORT_KEY, VERIFY_KEY and CONFIRM_KEY
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApsKeyType {
    /// Standard network key
    Network = 0x01,
    /// Application link key
    ApplicationLink = 0x03,
    /// Trust Center link key
    TrustCenterLink = 0x04,
}

impl TryFrom<u8> for ApsKeyType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ApsKeyType::Network),
            0x03 => Ok(ApsKeyType::ApplicationLink),
            0x04 => Ok(ApsKeyType::TrustCenterLink),
            _ => Err(WireError::Code(value)),
        }
    }
}

/// Key types a device may ask for with REQUEST_KEY
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKeyType {
    /// Application link key shared with a partner
    ApplicationLink = 0x02,
    /// Trust Center link key
    TrustCenterLink = 0x04,
}

impl TryFrom<u8> for RequestKeyType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(RequestKeyType::ApplicationLink),
            0x04 => Ok(RequestKeyType::TrustCenterLink),
            _ => Err(WireError::Code(value)),
        }
    }
}

/// UPDATE_DEVICE status values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateDeviceStatus {
    /// Secured rejoin through the parent
    SecuredRejoin = 0x00,
    /// Unsecured join through the parent
    UnsecuredJoin = 0x01,
    /// Device left
    DeviceLeft = 0x02,
    /// Trust Center rejoin through the parent
    UnsecuredRejoin = 0x03,
}

impl TryFrom<u8> for UpdateDeviceStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(UpdateDeviceStatus::SecuredRejoin),
            0x01 => Ok(UpdateDeviceStatus::UnsecuredJoin),
            0x02 => Ok(UpdateDeviceStatus::DeviceLeft),
            0x03 => Ok(UpdateDeviceStatus::UnsecuredRejoin),
            _ => Err(WireError::Code(value)),
        }
    }
}

/// Key material carried by TRANSPORT_KEY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKey {
    /// Network key with its sequence number
    Network {
        /// Key material
        key: [u8; 16],
        /// Key sequence number
        sequence: u8,
        /// Final recipient, 0 for broadcast
        destination64: u64,
        /// Trust Center address
        source64: u64,
    },
    /// Trust Center link key
    TrustCenterLink {
        /// Key material
        key: [u8; 16],
        /// Final recipient
        destination64: u64,
        /// Trust Center address
        source64: u64,
    },
    /// Application link key
    ApplicationLink {
        /// Key material
        key: [u8; 16],
        /// Other member of the pair
        partner64: u64,
        /// Recipient initiated the request
        initiator: bool,
    },
}

impl TransportKey {
    /// Key type of this payload
    pub fn key_type(&self) -> ApsKeyType {
        match self {
            TransportKey::Network { .. } => ApsKeyType::Network,
            TransportKey::TrustCenterLink { .. } => ApsKeyType::TrustCenterLink,
            TransportKey::ApplicationLink { .. } => ApsKeyType::ApplicationLink,
        }
    }
}

/// Decoded APS command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApsCommand {
    /// Transport key
    TransportKey(TransportKey),
    /// Update device, sent by a parent router to the Trust Center
    UpdateDevice {
        /// Device that joined, rejoined or left
        device64: u64,
        /// Short address of that device
        device16: u16,
        /// What happened
        status: UpdateDeviceStatus,
    },
    /// Remove device, sent by the Trust Center to a parent router
    RemoveDevice {
        /// Child to remove
        target64: u64,
    },
    /// Request key
    RequestKey {
        /// Requested key type
        key_type: RequestKeyType,
        /// Partner for application link keys
        partner64: Option<u64>,
    },
    /// Switch to the staged network key
    SwitchKey {
        /// Sequence number of the key to activate
        sequence: u8,
    },
    /// Tunnel an APS frame through a parent router
    Tunnel {
        /// Final recipient
        destination64: u64,
        /// Tunneled APS frame (header, auxiliary header, secured payload)
        frame: Bytes,
    },
    /// Verify key
    VerifyKey {
        /// Key type being verified
        key_type: ApsKeyType,
        /// Device that sent the hash
        source64: u64,
        /// Keyed hash of the link key
        hash: [u8; 16],
    },
    /// Confirm key
    ConfirmKey {
        /// Verification outcome
        status: u8,
        /// Key type that was verified
        key_type: ApsKeyType,
        /// Device the confirmation is for
        destination64: u64,
    },
    /// Command recognized but not interpreted
    Other {
        /// Command identifier
        id: ApsCommandId,
        /// Raw payload
        payload: Bytes,
    },
}

fn get_key(buf: &mut Bytes) -> Result<[u8; 16], WireError> {
    ensure(buf, 16)?;
    let mut key = [0u8; 16];
    buf.copy_to_slice(&mut key);
    Ok(key)
}

impl ApsCommand {
    /// Command identifier of this command
    pub fn id(&self) -> ApsCommandId {
        match self {
            ApsCommand::TransportKey(_) => ApsCommandId::TransportKey,
            ApsCommand::UpdateDevice { .. } => ApsCommandId::UpdateDevice,
            ApsCommand::RemoveDevice { .. } => ApsCommandId::RemoveDevice,
            ApsCommand::RequestKey { .. } => ApsCommandId::RequestKey,
            ApsCommand::SwitchKey { .. } => ApsCommandId::SwitchKey,
            ApsCommand::Tunnel { .. } => ApsCommandId::Tunnel,
            ApsCommand::VerifyKey { .. } => ApsCommandId::VerifyKey,
            ApsCommand::ConfirmKey { .. } => ApsCommandId::ConfirmKey,
            ApsCommand::Other { id, .. } => *id,
        }
    }

    /// Decode a command (identifier and payload)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 1)?;
        let id = ApsCommandId::try_from(buf.get_u8())?;

        let command = match id {
            ApsCommandId::TransportKey => {
                ensure(buf, 1)?;
                let key_type = ApsKeyType::try_from(buf.get_u8())?;
                let key = get_key(buf)?;
                let transport = match key_type {
                    ApsKeyType::Network => {
                        ensure(buf, 17)?;
                        TransportKey::Network {
                            key,
                            sequence: buf.get_u8(),
                            destination64: buf.get_u64_le(),
                            source64: buf.get_u64_le(),
                        }
                    }
                    ApsKeyType::TrustCenterLink => {
                        ensure(buf, 16)?;
                        TransportKey::TrustCenterLink {
                            key,
                            destination64: buf.get_u64_le(),
                            source64: buf.get_u64_le(),
                        }
                    }
                    ApsKeyType::ApplicationLink => {
                        ensure(buf, 9)?;
                        TransportKey::ApplicationLink {
                            key,
                            partner64: buf.get_u64_le(),
                            initiator: buf.get_u8() == 1,
                        }
                    }
                };
                ApsCommand::TransportKey(transport)
            }
            ApsCommandId::UpdateDevice => {
                ensure(buf, 11)?;
                let device64 = buf.get_u64_le();
                let device16 = buf.get_u16_le();
                ApsCommand::UpdateDevice {
                    device64,
                    device16,
                    status: UpdateDeviceStatus::try_from(buf.get_u8())?,
                }
            }
            ApsCommandId::RemoveDevice => {
                ensure(buf, 8)?;
                ApsCommand::RemoveDevice {
                    target64: buf.get_u64_le(),
                }
            }
            ApsCommandId::RequestKey => {
                ensure(buf, 1)?;
                let key_type = RequestKeyType::try_from(buf.get_u8())?;
                let partner64 = if key_type == RequestKeyType::ApplicationLink {
                    ensure(buf, 8)?;
                    Some(buf.get_u64_le())
                } else {
                    None
                };
                ApsCommand::RequestKey {
                    key_type,
                    partner64,
                }
            }
            ApsCommandId::SwitchKey => {
                ensure(buf, 1)?;
                ApsCommand::SwitchKey {
                    sequence: buf.get_u8(),
                }
            }
            ApsCommandId::Tunnel => {
                ensure(buf, 8)?;
                let destination64 = buf.get_u64_le();
                ApsCommand::Tunnel {
                    destination64,
                    frame: buf.split_to(buf.len()),
                }
            }
            ApsCommandId::VerifyKey => {
                ensure(buf, 9)?;
                let key_type = ApsKeyType::try_from(buf.get_u8())?;
                let source64 = buf.get_u64_le();
                ApsCommand::VerifyKey {
                    key_type,
                    source64,
                    hash: get_key(buf)?,
                }
            }
            ApsCommandId::ConfirmKey => {
                ensure(buf, 10)?;
                let status = buf.get_u8();
                let key_type = ApsKeyType::try_from(buf.get_u8())?;
                ApsCommand::ConfirmKey {
                    status,
                    key_type,
                    destination64: buf.get_u64_le(),
                }
            }
            other => ApsCommand::Other {
                id: other,
                payload: buf.split_to(buf.len()),
            },
        };

        Ok(command)
    }

    /// Encode the command (identifier and payload)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id() as u8);
        match self {
            ApsCommand::TransportKey(transport) => {
                buf.put_u8(transport.key_type() as u8);
                match transport {
                    TransportKey::Network {
                        key,
                        sequence,
                        destination64,
                        source64,
                    } => {
                        buf.put_slice(key);
                        buf.put_u8(*sequence);
                        buf.put_u64_le(*destination64);
                        buf.put_u64_le(*source64);
                    }
                    TransportKey::TrustCenterLink {
                        key,
                        destination64,
                        source64,
                    } => {
                        buf.put_slice(key);
                        buf.put_u64_le(*destination64);
                        buf.put_u64_le(*source64);
                    }
                    TransportKey::ApplicationLink {
                        key,
                        partner64,
                        initiator,
                    } => {
                        buf.put_slice(key);
                        buf.put_u64_le(*partner64);
                        buf.put_u8(*initiator as u8);
                    }
                }
            }
            ApsCommand::UpdateDevice {
                device64,
                device16,
                status,
            } => {
                buf.put_u64_le(*device64);
                buf.put_u16_le(*device16);
                buf.put_u8(*status as u8);
            }
            ApsCommand::RemoveDevice { target64 } => buf.put_u64_le(*target64),
            ApsCommand::RequestKey {
                key_type,
                partner64,
            } => {
                buf.put_u8(*key_type as u8);
                if let Some(partner64) = partner64 {
                    buf.put_u64_le(*partner64);
                }
            }
            ApsCommand::SwitchKey { sequence } => buf.put_u8(*sequence),
            ApsCommand::Tunnel {
                destination64,
                frame,
            } => {
                buf.put_u64_le(*destination64);
                buf.put_slice(frame);
            }
            ApsCommand::VerifyKey {
                key_type,
                source64,
                hash,
            } => {
                buf.put_u8(*key_type as u8);
                buf.put_u64_le(*source64);
                buf.put_slice(hash);
            }
            ApsCommand::ConfirmKey {
                status,
                key_type,
                destination64,
            } => {
                buf.put_u8(*status);
                buf.put_u8(*key_type as u8);
                buf.put_u64_le(*destination64);
            }
            ApsCommand::Other { payload, .. } => buf.put_slice(payload),
        }
    }
}
