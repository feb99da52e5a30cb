//! Zigbee PRO network layer header and command frames.
//!
//! Relay lists are kept in wire order: index 0 is the relay closest to the
//! final destination, so the first hop from the coordinator is the last
//! element. Route records arrive in the same order.

use crate::error::{ensure, WireError};
use crate::mac::{MacAssociationStatus, MacCapabilities};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Short address of the coordinator
pub const COORDINATOR_ADDRESS: u16 = 0x0000;
/// Broadcast to every device
pub const BROADCAST_ALL: u16 = 0xffff;
/// Broadcast to devices with the receiver on when idle
pub const BROADCAST_RX_ON_WHEN_IDLE: u16 = 0xfffd;
/// Broadcast to routers and the coordinator
pub const BROADCAST_ROUTERS: u16 = 0xfffc;
/// Lowest reserved broadcast address
pub const BROADCAST_MIN: u16 = 0xfff8;
/// Highest short address that may be allocated to a device
pub const MAX_UNICAST_ADDRESS: u16 = 0xfff7;
/// Zigbee PRO NWK protocol version
pub const PROTOCOL_VERSION: u8 = 2;
/// Protocol version carried by Green Power frames
pub const GP_PROTOCOL_VERSION: u8 = 3;
/// Default NWK radius (twice the maximum depth)
pub const DEFAULT_RADIUS: u8 = 30;

/// Whether `address` is a NWK broadcast address
pub fn is_broadcast(address: u16) -> bool {
    address >= BROADCAST_MIN
}

/// Protocol version of a NWK or NWK GP frame, read from the first byte
pub fn peek_protocol_version(payload: &[u8]) -> Option<u8> {
    payload.first().map(|fcf| (fcf >> 2) & 0x0f)
}

/// NWK frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NwkFrameType {
    /// Data frame
    Data = 0,
    /// NWK command frame
    Command = 1,
    /// Inter-PAN frame
    InterPan = 3,
}

impl TryFrom<u8> for NwkFrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NwkFrameType::Data),
            1 => Ok(NwkFrameType::Command),
            3 => Ok(NwkFrameType::InterPan),
            _ => Err(WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Boolean bits of the NWK frame control field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NwkFrameFlags: u16 {
        /// Multicast control present
        const MULTICAST = 1 << 8;
        /// NWK auxiliary security header present
        const SECURITY = 1 << 9;
        /// Source route subframe present
        const SOURCE_ROUTE = 1 << 10;
        /// 64-bit destination present
        const EXTENDED_DESTINATION = 1 << 11;
        /// 64-bit source present
        const EXTENDED_SOURCE = 1 << 12;
        /// Frame originated by an end device to its parent
        const END_DEVICE_INITIATOR = 1 << 13;
    }
}

/// Source route subframe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoute {
    /// Index of the next relay to forward the frame
    pub relay_index: u8,
    /// Relays, closest to the destination first
    pub relays: SmallVec<[u16; 8]>,
}

impl SourceRoute {
    /// Subframe as sent by the originator: index points at the first hop
    pub fn outbound(relays: &[u16]) -> Self {
        Self {
            relay_index: relays.len().saturating_sub(1) as u8,
            relays: relays.iter().copied().collect(),
        }
    }
}

/// Decoded NWK header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwkHeader {
    /// Frame type
    pub frame_type: NwkFrameType,
    /// Protocol version
    pub protocol_version: u8,
    /// Route discovery option (0 suppress, 1 enable)
    pub discover_route: u8,
    /// Frame control flags; presence flags are derived from the optional fields on encode
    pub flags: NwkFrameFlags,
    /// Destination short address
    pub destination16: u16,
    /// Source short address
    pub source16: u16,
    /// Remaining radius
    pub radius: u8,
    /// NWK sequence number
    pub sequence_number: u8,
    /// Destination extended address
    pub destination64: Option<u64>,
    /// Source extended address
    pub source64: Option<u64>,
    /// Multicast control byte
    pub multicast_control: Option<u8>,
    /// Source route subframe
    pub source_route: Option<SourceRoute>,
}

impl NwkHeader {
    /// Create a header with no optional fields
    pub fn new(
        frame_type: NwkFrameType,
        destination16: u16,
        source16: u16,
        radius: u8,
        sequence_number: u8,
    ) -> Self {
        Self {
            frame_type,
            protocol_version: PROTOCOL_VERSION,
            discover_route: 0,
            flags: NwkFrameFlags::empty(),
            destination16,
            source16,
            radius,
            sequence_number,
            destination64: None,
            source64: None,
            multicast_control: None,
            source_route: None,
        }
    }

    /// Whether the NWK payload is secured
    pub fn is_secured(&self) -> bool {
        self.flags.contains(NwkFrameFlags::SECURITY)
    }

    fn frame_control(&self) -> u16 {
        let mut flags = self.flags
            & (NwkFrameFlags::SECURITY | NwkFrameFlags::END_DEVICE_INITIATOR);
        flags.set(NwkFrameFlags::MULTICAST, self.multicast_control.is_some());
        flags.set(NwkFrameFlags::SOURCE_ROUTE, self.source_route.is_some());
        flags.set(NwkFrameFlags::EXTENDED_DESTINATION, self.destination64.is_some());
        flags.set(NwkFrameFlags::EXTENDED_SOURCE, self.source64.is_some());

        (self.frame_type as u16 & 0x03)
            | (((self.protocol_version & 0x0f) as u16) << 2)
            | (((self.discover_route & 0x03) as u16) << 6)
            | flags.bits()
    }

    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.frame_control());
        buf.put_u16_le(self.destination16);
        buf.put_u16_le(self.source16);
        buf.put_u8(self.radius);
        buf.put_u8(self.sequence_number);
        if let Some(destination64) = self.destination64 {
            buf.put_u64_le(destination64);
        }
        if let Some(source64) = self.source64 {
            buf.put_u64_le(source64);
        }
        if let Some(control) = self.multicast_control {
            buf.put_u8(control);
        }
        if let Some(route) = &self.source_route {
            buf.put_u8(route.relays.len() as u8);
            buf.put_u8(route.relay_index);
            for relay in &route.relays {
                buf.put_u16_le(*relay);
            }
        }
    }

    /// Decode a standard (non-GP) NWK header
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 8)?;
        let fcf = buf.get_u16_le();
        let frame_type = NwkFrameType::try_from((fcf & 0x03) as u8)?;
        let protocol_version = ((fcf >> 2) & 0x0f) as u8;
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::Version(protocol_version));
        }
        let discover_route = ((fcf >> 6) & 0x03) as u8;
        let flags = NwkFrameFlags::from_bits_truncate(fcf);

        let destination16 = buf.get_u16_le();
        let source16 = buf.get_u16_le();
        let radius = buf.get_u8();
        let sequence_number = buf.get_u8();

        let destination64 = if flags.contains(NwkFrameFlags::EXTENDED_DESTINATION) {
            ensure(buf, 8)?;
            Some(buf.get_u64_le())
        } else {
            None
        };
        let source64 = if flags.contains(NwkFrameFlags::EXTENDED_SOURCE) {
            ensure(buf, 8)?;
            Some(buf.get_u64_le())
        } else {
            None
        };
        let multicast_control = if flags.contains(NwkFrameFlags::MULTICAST) {
            ensure(buf, 1)?;
            Some(buf.get_u8())
        } else {
            None
        };
        let source_route = if flags.contains(NwkFrameFlags::SOURCE_ROUTE) {
            ensure(buf, 2)?;
            let count = buf.get_u8() as usize;
            let relay_index = buf.get_u8();
            ensure(buf, count * 2)?;
            let relays = (0..count).map(|_| buf.get_u16_le()).collect();
            Some(SourceRoute {
                relay_index,
                relays,
            })
        } else {
            None
        };

        Ok(Self {
            frame_type,
            protocol_version,
            discover_route,
            flags,
            destination16,
            source16,
            radius,
            sequence_number,
            destination64,
            source64,
            multicast_control,
            source_route,
        })
    }
}

/// NWK command identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NwkCommandId {
    /// Route request
    RouteRequest = 0x01,
    /// Route reply
    RouteReply = 0x02,
    /// Network status
    NetworkStatus = 0x03,
    /// Leave
    Leave = 0x04,
    /// Route record
    RouteRecord = 0x05,
    /// Rejoin request
    RejoinRequest = 0x06,
    /// Rejoin response
    RejoinResponse = 0x07,
    /// Link status
    LinkStatus = 0x08,
    /// Network report
    NetworkReport = 0x09,
    /// Network update
    NetworkUpdate = 0x0a,
    /// End device timeout request
    EndDeviceTimeoutRequest = 0x0b,
    /// End device timeout response
    EndDeviceTimeoutResponse = 0x0c,
    /// Link power delta
    LinkPowerDelta = 0x0d,
    /// Commissioning request (R23)
    CommissioningRequest = 0x0e,
    /// Commissioning response (R23)
    CommissioningResponse = 0x0f,
}

impl TryFrom<u8> for NwkCommandId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NwkCommandId::RouteRequest),
            0x02 => Ok(NwkCommandId::RouteReply),
            0x03 => Ok(NwkCommandId::NetworkStatus),
            0x04 => Ok(NwkCommandId::Leave),
            0x05 => Ok(NwkCommandId::RouteRecord),
            0x06 => Ok(NwkCommandId::RejoinRequest),
            0x07 => Ok(NwkCommandId::RejoinResponse),
            0x08 => Ok(NwkCommandId::LinkStatus),
            0x09 => Ok(NwkCommandId::NetworkReport),
            0x0a => Ok(NwkCommandId::NetworkUpdate),
            0x0b => Ok(NwkCommandId::EndDeviceTimeoutRequest),
            0x0c => Ok(NwkCommandId::EndDeviceTimeoutResponse),
            0x0d => Ok(NwkCommandId::LinkPowerDelta),
            0x0e => Ok(NwkCommandId::CommissioningRequest),
            0x0f => Ok(NwkCommandId::CommissioningResponse),
            _ => Err(WireError::Command(value)),
        }
    }
}

/// NWK status codes carried by NETWORK_STATUS
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NwkStatusCode {
    /// No route available
    NoRouteAvailable = 0x00,
    /// Tree link failure
    TreeLinkFailure = 0x01,
    /// Non-tree link failure
    NonTreeLinkFailure = 0x02,
    /// Low battery
    LowBatteryLevel = 0x03,
    /// No routing capacity
    NoRoutingCapacity = 0x04,
    /// No indirect capacity
    NoIndirectCapacity = 0x05,
    /// Indirect transaction expired
    IndirectTransactionExpiry = 0x06,
    /// Target device unavailable
    TargetDeviceUnavailable = 0x07,
    /// Target address unallocated
    TargetAddressUnallocated = 0x08,
    /// Parent link failure
    ParentLinkFailure = 0x09,
    /// Validate route
    ValidateRoute = 0x0a,
    /// Source route failure
    SourceRouteFailure = 0x0b,
    /// Many-to-one route failure
    ManyToOneRouteFailure = 0x0c,
    /// Address conflict
    AddressConflict = 0x0d,
    /// Verify addresses
    VerifyAddresses = 0x0e,
    /// PAN identifier update
    PanIdentifierUpdate = 0x0f,
    /// Network address update
    NetworkAddressUpdate = 0x10,
    /// Bad frame counter
    BadFrameCounter = 0x11,
    /// Bad key sequence number
    BadKeySequenceNumber = 0x12,
    /// Unknown command
    UnknownCommand = 0x13,
}

impl TryFrom<u8> for NwkStatusCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NwkStatusCode::*;
        let code = match value {
            0x00 => NoRouteAvailable,
            0x01 => TreeLinkFailure,
            0x02 => NonTreeLinkFailure,
            0x03 => LowBatteryLevel,
            0x04 => NoRoutingCapacity,
            0x05 => NoIndirectCapacity,
            0x06 => IndirectTransactionExpiry,
            0x07 => TargetDeviceUnavailable,
            0x08 => TargetAddressUnallocated,
            0x09 => ParentLinkFailure,
            0x0a => ValidateRoute,
            0x0b => SourceRouteFailure,
            0x0c => ManyToOneRouteFailure,
            0x0d => AddressConflict,
            0x0e => VerifyAddresses,
            0x0f => PanIdentifierUpdate,
            0x10 => NetworkAddressUpdate,
            0x11 => BadFrameCounter,
            0x12 => BadKeySequenceNumber,
            0x13 => UnknownCommand,
            _ => return Err(WireError::Code(value)),
        };
        Ok(code)
    }
}

impl NwkStatusCode {
    /// Status reports a broken path to the destination
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            NwkStatusCode::NoRouteAvailable
                | NwkStatusCode::TreeLinkFailure
                | NwkStatusCode::NonTreeLinkFailure
                | NwkStatusCode::TargetDeviceUnavailable
                | NwkStatusCode::ParentLinkFailure
                | NwkStatusCode::SourceRouteFailure
                | NwkStatusCode::ManyToOneRouteFailure
        )
    }
}

/// Route request option: many-to-one with route record table
pub const ROUTE_REQUEST_MANY_TO_ONE: u8 = 0x08;
/// Route request option: many-to-one without route record table
pub const ROUTE_REQUEST_MANY_TO_ONE_NO_CACHE: u8 = 0x10;
/// Route request option: 64-bit destination present
pub const ROUTE_REQUEST_DESTINATION_IEEE: u8 = 0x20;
/// Route reply option: 64-bit originator present
pub const ROUTE_REPLY_ORIGINATOR_IEEE: u8 = 0x10;
/// Route reply option: 64-bit responder present
pub const ROUTE_REPLY_RESPONDER_IEEE: u8 = 0x20;

bitflags! {
    /// LEAVE command options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LeaveOptions: u8 {
        /// Device should rejoin after leaving
        const REJOIN = 1 << 5;
        /// Leave is a request to the recipient, not an indication from the sender
        const REQUEST = 1 << 6;
        /// Children of the device leave too
        const REMOVE_CHILDREN = 1 << 7;
    }
}

/// End device timeout response: accepted
pub const ED_TIMEOUT_SUCCESS: u8 = 0x00;
/// End device timeout response: index out of range
pub const ED_TIMEOUT_INCORRECT_VALUE: u8 = 0x01;
/// Parent info: MAC data poll keepalive supported
pub const ED_KEEPALIVE_MAC_DATA_POLL: u8 = 0x01;
/// Parent info: end device timeout request keepalive supported
pub const ED_KEEPALIVE_TIMEOUT_REQUEST: u8 = 0x02;

/// One neighbor entry of a LINK_STATUS command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatusEntry {
    /// Neighbor short address
    pub address: u16,
    /// Incoming link cost (1..7, 0 = unknown)
    pub incoming_cost: u8,
    /// Outgoing link cost (1..7, 0 = unknown)
    pub outgoing_cost: u8,
}

/// Maximum entries in one LINK_STATUS frame
pub const MAX_LINK_STATUS_ENTRIES: usize = 0x1f;

/// Decoded NWK command payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NwkCommand {
    /// Route request
    RouteRequest {
        /// Options bitfield
        options: u8,
        /// Route request identifier
        request_id: u8,
        /// Destination of the requested route
        destination16: u16,
        /// Accumulated path cost
        path_cost: u8,
        /// Extended destination
        destination64: Option<u64>,
    },
    /// Route reply
    RouteReply {
        /// Options bitfield
        options: u8,
        /// Route request identifier being answered
        request_id: u8,
        /// Originator of the route request
        originator16: u16,
        /// Responder
        responder16: u16,
        /// Accumulated path cost
        path_cost: u8,
        /// Extended originator
        originator64: Option<u64>,
        /// Extended responder
        responder64: Option<u64>,
    },
    /// Network status
    NetworkStatus {
        /// Status code
        status: NwkStatusCode,
        /// Address the status refers to
        destination16: u16,
    },
    /// Leave
    Leave {
        /// Leave options
        options: LeaveOptions,
    },
    /// Route record
    RouteRecord {
        /// Relays traversed, closest to the originator first
        relays: SmallVec<[u16; 8]>,
    },
    /// Rejoin request
    RejoinRequest {
        /// Capability information
        capabilities: MacCapabilities,
    },
    /// Rejoin response
    RejoinResponse {
        /// Address the device must use
        network_address: u16,
        /// Rejoin status
        status: MacAssociationStatus,
    },
    /// Link status
    LinkStatus {
        /// First frame of a link status set
        first_frame: bool,
        /// Last frame of a link status set
        last_frame: bool,
        /// Neighbor costs
        entries: Vec<LinkStatusEntry>,
    },
    /// End device timeout request
    EndDeviceTimeoutRequest {
        /// Requested timeout index
        timeout_index: u8,
        /// End device configuration
        configuration: u8,
    },
    /// End device timeout response
    EndDeviceTimeoutResponse {
        /// Response status
        status: u8,
        /// Parent information bits
        parent_info: u8,
    },
    /// Commissioning request (R23)
    CommissioningRequest {
        /// 0x00 initial join, 0x01 rejoin
        association_type: u8,
        /// Capability information
        capabilities: MacCapabilities,
        /// Trailing TLVs, not interpreted
        tlvs: Bytes,
    },
    /// Commissioning response (R23)
    CommissioningResponse {
        /// Address the device must use
        network_address: u16,
        /// Status, same code space as association
        status: MacAssociationStatus,
    },
    /// Command recognized but not interpreted
    Other {
        /// Command identifier
        id: NwkCommandId,
        /// Raw payload
        payload: Bytes,
    },
}

impl NwkCommand {
    /// Command identifier of this command
    pub fn id(&self) -> NwkCommandId {
        match self {
            NwkCommand::RouteRequest { .. } => NwkCommandId::RouteRequest,
            NwkCommand::RouteReply { .. } => NwkCommandId::RouteReply,
            NwkCommand::NetworkStatus { .. } => NwkCommandId::NetworkStatus,
            NwkCommand::Leave { .. } => NwkCommandId::Leave,
            NwkCommand::RouteRecord { .. } => NwkCommandId::RouteRecord,
            NwkCommand::RejoinRequest { .. } => NwkCommandId::RejoinRequest,
            NwkCommand::RejoinResponse { .. } => NwkCommandId::RejoinResponse,
            NwkCommand::LinkStatus { .. } => NwkCommandId::LinkStatus,
            NwkCommand::EndDeviceTimeoutRequest { .. } => NwkCommandId::EndDeviceTimeoutRequest,
            NwkCommand::EndDeviceTimeoutResponse { .. } => NwkCommandId::EndDeviceTimeoutResponse,
            NwkCommand::CommissioningRequest { .. } => NwkCommandId::CommissioningRequest,
            NwkCommand::CommissioningResponse { .. } => NwkCommandId::CommissioningResponse,
            NwkCommand::Other { id, .. } => *id,
        }
    }

    /// Decode a command (identifier and payload)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        ensure(buf, 1)?;
        let id = NwkCommandId::try_from(buf.get_u8())?;

        let command = match id {
            NwkCommandId::RouteRequest => {
                ensure(buf, 5)?;
                let options = buf.get_u8();
                let request_id = buf.get_u8();
                let destination16 = buf.get_u16_le();
                let path_cost = buf.get_u8();
                let destination64 = if options & ROUTE_REQUEST_DESTINATION_IEEE != 0 {
                    ensure(buf, 8)?;
                    Some(buf.get_u64_le())
                } else {
                    None
                };
                NwkCommand::RouteRequest {
                    options,
                    request_id,
                    destination16,
                    path_cost,
                    destination64,
                }
            }
            NwkCommandId::RouteReply => {
                ensure(buf, 7)?;
                let options = buf.get_u8();
                let request_id = buf.get_u8();
                let originator16 = buf.get_u16_le();
                let responder16 = buf.get_u16_le();
                let path_cost = buf.get_u8();
                let originator64 = if options & ROUTE_REPLY_ORIGINATOR_IEEE != 0 {
                    ensure(buf, 8)?;
                    Some(buf.get_u64_le())
                } else {
                    None
                };
                let responder64 = if options & ROUTE_REPLY_RESPONDER_IEEE != 0 {
                    ensure(buf, 8)?;
                    Some(buf.get_u64_le())
                } else {
                    None
                };
                NwkCommand::RouteReply {
                    options,
                    request_id,
                    originator16,
                    responder16,
                    path_cost,
                    originator64,
                    responder64,
                }
            }
            NwkCommandId::NetworkStatus => {
                ensure(buf, 3)?;
                let status = NwkStatusCode::try_from(buf.get_u8())?;
                NwkCommand::NetworkStatus {
                    status,
                    destination16: buf.get_u16_le(),
                }
            }
            NwkCommandId::Leave => {
                ensure(buf, 1)?;
                NwkCommand::Leave {
                    options: LeaveOptions::from_bits_truncate(buf.get_u8()),
                }
            }
            NwkCommandId::RouteRecord => {
                ensure(buf, 1)?;
                let count = buf.get_u8() as usize;
                ensure(buf, count * 2)?;
                NwkCommand::RouteRecord {
                    relays: (0..count).map(|_| buf.get_u16_le()).collect(),
                }
            }
            NwkCommandId::RejoinRequest => {
                ensure(buf, 1)?;
                NwkCommand::RejoinRequest {
                    capabilities: MacCapabilities::from_bits_truncate(buf.get_u8()),
                }
            }
            NwkCommandId::RejoinResponse => {
                ensure(buf, 3)?;
                let network_address = buf.get_u16_le();
                NwkCommand::RejoinResponse {
                    network_address,
                    status: MacAssociationStatus::try_from(buf.get_u8())?,
                }
            }
            NwkCommandId::LinkStatus => {
                ensure(buf, 1)?;
                let options = buf.get_u8();
                let count = (options & 0x1f) as usize;
                ensure(buf, count * 3)?;
                let entries = (0..count)
                    .map(|_| {
                        let address = buf.get_u16_le();
                        let link = buf.get_u8();
                        LinkStatusEntry {
                            address,
                            incoming_cost: link & 0x07,
                            outgoing_cost: (link >> 4) & 0x07,
                        }
                    })
                    .collect();
                NwkCommand::LinkStatus {
                    first_frame: options & 0x20 != 0,
                    last_frame: options & 0x40 != 0,
                    entries,
                }
            }
            NwkCommandId::EndDeviceTimeoutRequest => {
                ensure(buf, 2)?;
                NwkCommand::EndDeviceTimeoutRequest {
                    timeout_index: buf.get_u8(),
                    configuration: buf.get_u8(),
                }
            }
            NwkCommandId::EndDeviceTimeoutResponse => {
                ensure(buf, 2)?;
                NwkCommand::EndDeviceTimeoutResponse {
                    status: buf.get_u8(),
                    parent_info: buf.get_u8(),
                }
            }
            NwkCommandId::CommissioningRequest => {
                ensure(buf, 2)?;
                let association_type = buf.get_u8();
                let capabilities = MacCapabilities::from_bits_truncate(buf.get_u8());
                NwkCommand::CommissioningRequest {
                    association_type,
                    capabilities,
                    tlvs: buf.split_to(buf.remaining()),
                }
            }
            NwkCommandId::CommissioningResponse => {
                ensure(buf, 3)?;
                let network_address = buf.get_u16_le();
                NwkCommand::CommissioningResponse {
                    network_address,
                    status: MacAssociationStatus::try_from(buf.get_u8())?,
                }
            }
            other => NwkCommand::Other {
                id: other,
                payload: buf.split_to(buf.remaining()),
            },
        };

        Ok(command)
    }

    /// Encode the command (identifier and payload)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id() as u8);
        match self {
            NwkCommand::RouteRequest {
                options,
                request_id,
                destination16,
                path_cost,
                destination64,
            } => {
                let mut options = *options & !ROUTE_REQUEST_DESTINATION_IEEE;
                if destination64.is_some() {
                    options |= ROUTE_REQUEST_DESTINATION_IEEE;
                }
                buf.put_u8(options);
                buf.put_u8(*request_id);
                buf.put_u16_le(*destination16);
                buf.put_u8(*path_cost);
                if let Some(destination64) = destination64 {
                    buf.put_u64_le(*destination64);
                }
            }
            NwkCommand::RouteReply {
                options,
                request_id,
                originator16,
                responder16,
                path_cost,
                originator64,
                responder64,
            } => {
                let mut options =
                    *options & !(ROUTE_REPLY_ORIGINATOR_IEEE | ROUTE_REPLY_RESPONDER_IEEE);
                if originator64.is_some() {
                    options |= ROUTE_REPLY_ORIGINATOR_IEEE;
                }
                if responder64.is_some() {
                    options |= ROUTE_REPLY_RESPONDER_IEEE;
                }
                buf.put_u8(options);
                buf.put_u8(*request_id);
                buf.put_u16_le(*originator16);
                buf.put_u16_le(*responder16);
                buf.put_u8(*path_cost);
                if let Some(originator64) = originator64 {
                    buf.put_u64_le(*originator64);
                }
                if let Some(responder64) = responder64 {
                    buf.put_u64_le(*responder64);
                }
            }
            NwkCommand::NetworkStatus {
                status,
                destination16,
            } => {
                buf.put_u8(*status as u8);
                buf.put_u16_le(*destination16);
            }
            NwkCommand::Leave { options } => buf.put_u8(options.bits()),
            NwkCommand::RouteRecord { relays } => {
                buf.put_u8(relays.len() as u8);
                for relay in relays {
                    buf.put_u16_le(*relay);
                }
            }
            NwkCommand::RejoinRequest { capabilities } => buf.put_u8(capabilities.bits()),
            NwkCommand::RejoinResponse {
                network_address,
                status,
            }
            | NwkCommand::CommissioningResponse {
                network_address,
                status,
            } => {
                buf.put_u16_le(*network_address);
                buf.put_u8(*status as u8);
            }
            NwkCommand::LinkStatus {
                first_frame,
                last_frame,
                entries,
            } => {
                let count = entries.len().min(MAX_LINK_STATUS_ENTRIES);
                buf.put_u8(
                    count as u8 | ((*first_frame as u8) << 5) | ((*last_frame as u8) << 6),
                );
                for entry in &entries[..count] {
                    buf.put_u16_le(entry.address);
                    buf.put_u8((entry.incoming_cost & 0x07) | ((entry.outgoing_cost & 0x07) << 4));
                }
            }
            NwkCommand::EndDeviceTimeoutRequest {
                timeout_index,
                configuration,
            } => {
                buf.put_u8(*timeout_index);
                buf.put_u8(*configuration);
            }
            NwkCommand::EndDeviceTimeoutResponse {
                status,
                parent_info,
            } => {
                buf.put_u8(*status);
                buf.put_u8(*parent_info);
            }
            NwkCommand::CommissioningRequest {
                association_type,
                capabilities,
                tlvs,
            } => {
                buf.put_u8(*association_type);
                buf.put_u8(capabilities.bits());
                buf.put_slice(tlvs);
            }
            NwkCommand::Other { payload, .. } => buf.put_slice(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_source_route() {
        let mut header = NwkHeader::new(NwkFrameType::Data, 0x4567, COORDINATOR_ADDRESS, 30, 9);
        header.flags = NwkFrameFlags::SECURITY;
        header.destination64 = Some(0x1122334455667788);
        header.source_route = Some(SourceRoute::outbound(&[0x1111, 0x2222]));

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        // type data, version 2, security, source route, extended destination
        assert_eq!(&buf[..2], &[0x08, 0x0e]);

        let decoded = NwkHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.destination64, Some(0x1122334455667788));
        assert!(decoded.is_secured());
        let route = decoded.source_route.unwrap();
        assert_eq!(route.relay_index, 1);
        assert_eq!(route.relays.as_slice(), &[0x1111, 0x2222]);
    }

    #[test]
    fn test_rejects_gp_version() {
        let raw: &[u8] = &[0x0c, 0x00, 0xfd, 0xff, 0x00, 0x00, 0x1e, 0x01];
        assert_eq!(peek_protocol_version(raw), Some(GP_PROTOCOL_VERSION));
        assert_eq!(
            NwkHeader::decode(&mut Bytes::from_static(raw)).unwrap_err(),
            WireError::Version(3)
        );
    }

    #[test]
    fn test_route_record_decode() {
        let raw: &[u8] = &[0x05, 0x02, 0x34, 0x12, 0x78, 0x56];
        match NwkCommand::decode(&mut Bytes::from_static(raw)).unwrap() {
            NwkCommand::RouteRecord { relays } => assert_eq!(relays.as_slice(), &[0x1234, 0x5678]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_link_status_encoding() {
        let command = NwkCommand::LinkStatus {
            first_frame: true,
            last_frame: true,
            entries: vec![LinkStatusEntry {
                address: 0x1234,
                incoming_cost: 1,
                outgoing_cost: 3,
            }],
        };
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        assert_eq!(&buf[..], &[0x08, 0x61, 0x34, 0x12, 0x31]);
        assert_eq!(NwkCommand::decode(&mut buf.freeze()).unwrap(), command);
    }

    #[test]
    fn test_network_status_decode() {
        let raw: &[u8] = &[0x03, 0x0d, 0xcd, 0xab];
        let command = NwkCommand::decode(&mut Bytes::from_static(raw)).unwrap();
        assert_eq!(
            command,
            NwkCommand::NetworkStatus {
                status: NwkStatusCode::AddressConflict,
                destination16: 0xabcd
            }
        );
        assert!(!NwkStatusCode::AddressConflict.is_routing_failure());
        assert!(NwkStatusCode::SourceRouteFailure.is_routing_failure());
    }

    #[test]
    fn test_unknown_command() {
        let raw: &[u8] = &[0x42];
        assert_eq!(
            NwkCommand::decode(&mut Bytes::from_static(raw)).unwrap_err(),
            WireError::Command(0x42)
        );
    }

    #[test]
    fn test_route_request_sets_ieee_option() {
        let mut buf = BytesMut::new();
        NwkCommand::RouteRequest {
            options: ROUTE_REQUEST_MANY_TO_ONE,
            request_id: 7,
            destination16: BROADCAST_ROUTERS,
            path_cost: 0,
            destination64: None,
        }
        .encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x08, 0x07, 0xfc, 0xff, 0x00]);
    }
}
