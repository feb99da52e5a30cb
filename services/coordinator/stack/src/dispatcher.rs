//! Inbound frame pipeline.
//!
//! Every PSDU from the radio enters here. The pipeline validates the MAC
//! header, branches between Green Power and standard NWK frames, removes
//! NWK security and checks the frame counter before any layer sees the
//! payload. Follow-up work returned by a layer (network key delivery) runs
//! before the next frame is taken.

use crate::aps::{ApsHandler, KeyDelivery};
use crate::context::StackContext;
use crate::error::{StackError, StackResult};
use crate::events::StackEvent;
use crate::gp::GpHandler;
use crate::mac::MacHandler;
use crate::nwk::NwkHandler;
use crate::transport::FrameTransport;
use bytes::Bytes;
use tracing::{debug, trace};
use zb_wire::mac::{BROADCAST_ADDRESS, BROADCAST_PAN_ID};
use zb_wire::nwk::{peek_protocol_version, COORDINATOR_ADDRESS, GP_PROTOCOL_VERSION};
use zb_wire::security::unsecure_payload;
use zb_wire::{
    decode_gp_frame, decode_mac_frame, is_broadcast, AuxSecurityHeader, MacAddress, MacCommand,
    MacFrameType, MacHeader, NwkCommand, NwkCommandId, NwkFrameType, NwkHeader, WireError,
};

/// The four protocol handlers, owned together so the pipeline can lend
/// them to each other
pub struct Layers {
    /// MAC handler, owner of the transport
    pub mac: MacHandler,
    /// NWK handler
    pub nwk: NwkHandler,
    /// APS handler
    pub aps: ApsHandler,
    /// Green Power handler
    pub gp: GpHandler,
}

/// Unsecured NWK commands a device may send before it holds the network key
fn accepted_unsecured(header: &NwkHeader, payload: &[u8]) -> bool {
    header.frame_type == NwkFrameType::Command
        && payload
            .first()
            .and_then(|id| NwkCommandId::try_from(*id).ok())
            .map_or(false, |id| {
                matches!(
                    id,
                    NwkCommandId::RejoinRequest | NwkCommandId::CommissioningRequest
                )
            })
}

impl Layers {
    /// Create the handlers around a transport
    pub fn new(transport: Box<dyn FrameTransport>) -> Self {
        Self {
            mac: MacHandler::new(transport),
            nwk: NwkHandler::new(),
            aps: ApsHandler::new(),
            gp: GpHandler::new(),
        }
    }

    /// Process one received PSDU.
    ///
    /// Malformed frames are logged and dropped; only engine failures are
    /// returned.
    pub async fn dispatch_frame(
        &mut self,
        ctx: &mut StackContext,
        frame: Bytes,
        rssi: i8,
    ) -> StackResult<()> {
        if ctx.config().emit_raw_frames {
            ctx.emit(StackEvent::MacFrame {
                frame: frame.clone(),
                rssi,
            });
        }

        let follow_up = match self.dispatch(ctx, frame, rssi).await {
            Ok(follow_up) => follow_up,
            Err(StackError::Wire(e)) => {
                debug!("Dropping malformed frame: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(delivery) = follow_up {
            self.aps
                .deliver_network_key(ctx, &mut self.mac, &mut self.nwk, delivery)
                .await?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        ctx: &mut StackContext,
        frame: Bytes,
        rssi: i8,
    ) -> StackResult<Option<KeyDelivery>> {
        let (mac_header, payload) = decode_mac_frame(frame)?;
        if !matches!(
            mac_header.frame_type,
            MacFrameType::Data | MacFrameType::Command
        ) {
            trace!("Ignoring MAC {:?} frame", mac_header.frame_type);
            return Ok(None);
        }
        if !self.addressed_to_us(ctx, &mac_header) {
            trace!(
                "Ignoring frame for PAN {:?} / {:?}",
                mac_header.destination_pan,
                mac_header.destination
            );
            return Ok(None);
        }

        let mac_source64 = match mac_header.source {
            MacAddress::Extended(address64) => Some(address64),
            MacAddress::Short(address16) => ctx.address64_of(address16),
            MacAddress::None => None,
        };
        let lqa = ctx.record_link_sample(mac_source64, rssi);

        if mac_header.frame_type == MacFrameType::Command {
            let mut payload = payload;
            let command = MacCommand::decode(&mut payload)?;
            return self
                .mac
                .process_command(ctx, &mut self.nwk, &mac_header, command)
                .await;
        }

        if peek_protocol_version(&payload) == Some(GP_PROTOCOL_VERSION) {
            let gp_frame = decode_gp_frame(payload)?;
            self.gp
                .process_frame(ctx, mac_header.sequence_number, gp_frame, lqa);
            return Ok(None);
        }

        let mut buf = payload.clone();
        let header = NwkHeader::decode(&mut buf)?;
        if header.source16 == COORDINATOR_ADDRESS {
            trace!("Dropping own frame relayed back (seq {})", header.sequence_number);
            return Ok(None);
        }
        if header.destination16 != COORDINATOR_ADDRESS && !is_broadcast(header.destination16) {
            debug!(
                "Not relaying NWK frame 0x{:04x} -> 0x{:04x}",
                header.source16, header.destination16
            );
            return Ok(None);
        }
        let source64 = header
            .source64
            .or_else(|| ctx.address64_of(header.source16));

        let nwk_payload = if header.is_secured() {
            let header_len = payload.len() - buf.len();
            let aux = AuxSecurityHeader::decode(&mut buf)?;
            let Some(key) = aux
                .key_sequence
                .and_then(|sequence| ctx.network_key_for_sequence(sequence))
            else {
                debug!(
                    "Frame from 0x{:04x} uses unknown key sequence {:?}",
                    header.source16, aux.key_sequence
                );
                return Ok(None);
            };
            let Some(sender64) = aux.source64.or(mac_source64) else {
                debug!("Secured frame from 0x{:04x} without sender address", header.source16);
                return Ok(None);
            };
            let plain = match unsecure_payload(&payload[..header_len], &aux, sender64, &key, &buf) {
                Ok(plain) => plain,
                Err(WireError::Mic) => {
                    debug!("NWK MIC check failed for frame from {:016x}", sender64);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            if !ctx.validate_incoming_frame_counter(sender64, aux.frame_counter) {
                return Ok(None);
            }
            plain
        } else if accepted_unsecured(&header, &buf) {
            buf
        } else {
            debug!(
                "Dropping unsecured {:?} frame from 0x{:04x}",
                header.frame_type, header.source16
            );
            return Ok(None);
        };

        if let Some(source64) = source64 {
            ctx.touch_end_device(source64);
        }

        match header.frame_type {
            NwkFrameType::Data => {
                self.aps
                    .process_frame(
                        ctx,
                        &mut self.mac,
                        &mut self.nwk,
                        &header,
                        source64,
                        nwk_payload,
                        lqa,
                    )
                    .await
            }
            NwkFrameType::Command => {
                let mut nwk_payload = nwk_payload;
                let command = NwkCommand::decode(&mut nwk_payload)?;
                self.nwk
                    .process_command(ctx, &mut self.mac, &mac_header, &header, source64, command)
                    .await
            }
            NwkFrameType::InterPan => {
                debug!("Inter-PAN frame from 0x{:04x} not supported", header.source16);
                Ok(None)
            }
        }
    }

    fn addressed_to_us(&self, ctx: &StackContext, header: &MacHeader) -> bool {
        let pan_ok = match header.destination_pan {
            Some(pan) => pan == ctx.pan_id() || pan == BROADCAST_PAN_ID,
            None => true,
        };
        let destination_ok = match header.destination {
            MacAddress::Short(address16) => {
                address16 == COORDINATOR_ADDRESS || address16 == BROADCAST_ADDRESS
            }
            MacAddress::Extended(address64) => address64 == ctx.eui64(),
            MacAddress::None => false,
        };
        pan_ok && destination_ok
    }
}
