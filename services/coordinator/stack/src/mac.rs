//! MAC layer: association, polls, beacons and frame transmission

use crate::aps::KeyDelivery;
use crate::context::{AssociationRequest, PendingAssociation, StackContext};
use crate::error::StackResult;
use crate::transport::FrameTransport;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};
use zb_wire::mac::BROADCAST_ADDRESS;
use zb_wire::nwk::COORDINATOR_ADDRESS;
use zb_wire::{
    encode_beacon_payload, encode_mac_frame, MacAddress, MacCommand, MacHeader, SuperframeSpec,
    ZigbeeBeaconPayload,
};

/// Zigbee PRO stack profile
const STACK_PROFILE: u8 = 2;
/// Zigbee protocol version advertised in beacons
const BEACON_PROTOCOL_VERSION: u8 = 2;

/// Receives the outcome of every unicast transmission.
///
/// Implemented by the NWK handler so MAC delivery results feed route scoring
/// without the MAC layer knowing about routes.
pub trait RouteOutcomeSink: Send {
    /// The frame towards `destination16` was acknowledged
    fn mark_route_success(&mut self, ctx: &mut StackContext, destination16: u16);

    /// The frame towards `destination16` failed; `repair` purges routes
    /// relaying through it and asks for rediscovery
    fn mark_route_failure(&mut self, ctx: &mut StackContext, destination16: u16, repair: bool);
}

/// MAC layer handler, owner of the radio transport
pub struct MacHandler {
    transport: Box<dyn FrameTransport>,
}

impl MacHandler {
    /// Create a handler over `transport`
    pub fn new(transport: Box<dyn FrameTransport>) -> Self {
        Self { transport }
    }

    /// Transmit an encoded frame now.
    ///
    /// Returns `Ok(false)` when the next hop did not acknowledge or the
    /// channel was busy; only a broken transport is an error.
    pub async fn send_frame_direct(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
        frame: Bytes,
        mac_destination16: u16,
        nwk_destination16: Option<u16>,
    ) -> StackResult<bool> {
        let unicast = mac_destination16 != BROADCAST_ADDRESS;

        match self.transport.send_frame(frame).await {
            Ok(()) => {
                if unicast {
                    ctx.no_ack_mut().record_success(mac_destination16);
                    if let Some(destination16) = nwk_destination16 {
                        sink.mark_route_success(ctx, destination16);
                    }
                }
                Ok(true)
            }
            Err(e) if e.is_delivery_failure() => {
                if !unicast {
                    debug!("Broadcast transmission failed: {}", e);
                    return Ok(false);
                }

                let now_ms = ctx.now_ms();
                let (count, crossed) = ctx.no_ack_mut().record_failure(mac_destination16, now_ms);
                debug!(
                    "No delivery to 0x{:04x} ({}), {} consecutive",
                    mac_destination16, e, count
                );
                if let Some(destination16) = nwk_destination16 {
                    sink.mark_route_failure(ctx, destination16, false);
                }
                if crossed {
                    debug!("Repairing routes through 0x{:04x}", mac_destination16);
                    sink.mark_route_failure(ctx, mac_destination16, true);
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Transmit, or hold the frame for the next poll when the destination
    /// is a child with its receiver off
    pub async fn send_frame(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
        frame: Bytes,
        mac_destination16: u16,
        nwk_destination16: Option<u16>,
    ) -> StackResult<bool> {
        let sleepy = ctx
            .device_by_address16(mac_destination16)
            .filter(|d| d.is_sleepy_child())
            .map(|d| d.address64);

        if let Some(address64) = sleepy {
            ctx.queue_indirect(address64, frame, mac_destination16);
            debug!(
                "Queued indirect frame for 0x{:04x} ({} pending)",
                mac_destination16,
                ctx.indirect_len(address64)
            );
            return Ok(true);
        }

        self.send_frame_direct(ctx, sink, frame, mac_destination16, nwk_destination16)
            .await
    }

    /// Build and transmit a MAC command frame
    pub async fn send_command(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
        command: &MacCommand,
        destination: MacAddress,
        source: MacAddress,
    ) -> StackResult<bool> {
        let header = MacHeader::command(ctx.next_mac_sequence(), ctx.pan_id(), destination, source);
        let mut payload = BytesMut::with_capacity(4);
        command.encode(&mut payload);
        let frame = encode_mac_frame(&header, &payload);

        let mac_destination16 = match destination {
            MacAddress::Short(address16) => address16,
            MacAddress::Extended(address64) => {
                ctx.address16_of(address64).unwrap_or(BROADCAST_ADDRESS)
            }
            MacAddress::None => BROADCAST_ADDRESS,
        };
        self.send_frame_direct(ctx, sink, frame, mac_destination16, None)
            .await
    }

    /// Answer a beacon request
    pub async fn send_beacon(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
    ) -> StackResult<bool> {
        let superframe = SuperframeSpec::coordinator(ctx.mac_association_permit());
        let beacon = ZigbeeBeaconPayload {
            stack_profile: STACK_PROFILE,
            protocol_version: BEACON_PROTOCOL_VERSION,
            router_capacity: true,
            device_depth: 0,
            end_device_capacity: true,
            extended_pan_id: ctx.network().extended_pan_id,
            update_id: ctx.network().update_id,
        };
        let header = MacHeader::beacon(ctx.next_mac_sequence(), ctx.pan_id(), COORDINATOR_ADDRESS);
        let frame = encode_mac_frame(&header, &encode_beacon_payload(&superframe, &beacon));

        debug!(
            "Sending beacon (association permit: {})",
            superframe.association_permit
        );
        self.send_frame_direct(ctx, sink, frame, BROADCAST_ADDRESS, None)
            .await
    }

    /// Handle an inbound MAC command.
    ///
    /// A returned [`KeyDelivery`] is the network key transport the caller
    /// still owes a freshly associated device.
    pub async fn process_command(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
        header: &MacHeader,
        command: MacCommand,
    ) -> StackResult<Option<KeyDelivery>> {
        match command {
            MacCommand::AssociationRequest { capabilities } => {
                let Some(address64) = header.source.extended() else {
                    warn!("Association request without extended source, ignoring");
                    return Ok(None);
                };

                let outcome = ctx.associate(AssociationRequest::join(address64, capabilities));
                info!(
                    "Association request from {:016x}: {:?} (0x{:04x})",
                    address64, outcome.status, outcome.address16
                );
                let created_ms = ctx.now_ms();
                ctx.store_pending_association(
                    address64,
                    PendingAssociation {
                        address16: outcome.address16,
                        status: outcome.status,
                        requires_transport_key: outcome.requires_transport_key,
                        created_ms,
                    },
                );
                Ok(None)
            }
            MacCommand::AssociationResponse { .. } => {
                debug!("Ignoring association response from {:?}", header.source);
                Ok(None)
            }
            MacCommand::BeaconRequest => {
                self.send_beacon(ctx, sink).await?;
                Ok(None)
            }
            MacCommand::DataRequest => self.process_data_request(ctx, sink, header).await,
            MacCommand::DisassociationNotify { reason } => {
                let address64 = match header.source {
                    MacAddress::Extended(address64) => Some(address64),
                    MacAddress::Short(address16) => ctx.address64_of(address16),
                    MacAddress::None => None,
                };
                match address64 {
                    Some(address64) => {
                        info!(
                            "Disassociation notification from {:016x} (reason {})",
                            address64, reason
                        );
                        ctx.disassociate(address64);
                    }
                    None => debug!("Disassociation from unknown {:?}", header.source),
                }
                Ok(None)
            }
            MacCommand::Other(id) => {
                debug!("Unsupported MAC command {:?} from {:?}", id, header.source);
                Ok(None)
            }
        }
    }

    async fn process_data_request(
        &mut self,
        ctx: &mut StackContext,
        sink: &mut dyn RouteOutcomeSink,
        header: &MacHeader,
    ) -> StackResult<Option<KeyDelivery>> {
        let address64 = match header.source {
            MacAddress::Extended(address64) => address64,
            MacAddress::Short(address16) => match ctx.address64_of(address16) {
                Some(address64) => address64,
                None => {
                    debug!("Poll from unknown device 0x{:04x}", address16);
                    return Ok(None);
                }
            },
            MacAddress::None => return Ok(None),
        };
        ctx.touch_end_device(address64);

        if let Some(pending) = ctx.take_pending_association(address64) {
            let response = MacCommand::AssociationResponse {
                short_address: pending.address16,
                status: pending.status,
            };
            let eui64 = ctx.eui64();
            let delivered = self
                .send_command(
                    ctx,
                    sink,
                    &response,
                    MacAddress::Extended(address64),
                    MacAddress::Extended(eui64),
                )
                .await?;

            if delivered && pending.requires_transport_key {
                return Ok(Some(KeyDelivery {
                    address16: pending.address16,
                    address64,
                    via_parent: None,
                }));
            }
            return Ok(None);
        }

        if let Some(indirect) = ctx.pop_indirect(address64) {
            debug!(
                "Serving indirect frame to 0x{:04x} ({} left)",
                indirect.destination16,
                ctx.indirect_len(address64)
            );
            self.send_frame_direct(
                ctx,
                sink,
                indirect.frame,
                indirect.destination16,
                Some(indirect.destination16),
            )
            .await?;
        }
        Ok(None)
    }
}
