//! APS layer: data delivery, acknowledgments, duplicates, fragmentation and
//! the Trust Center command set.

use crate::config::{AppKeyRequestPolicy, TcKeyRequestPolicy};
use crate::context::{AssociationRequest, StackContext};
use crate::error::{StackError, StackResult};
use crate::events::StackEvent;
use crate::mac::{MacHandler, RouteOutcomeSink};
use crate::nwk::{NwkHandler, NwkTxOptions};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zb_wire::aps::{CONFIRM_KEY_SECURITY_FAILURE, CONFIRM_KEY_SUCCESS};
use zb_wire::nwk::BROADCAST_RX_ON_WHEN_IDLE;
use zb_wire::security::{
    key_load_key, key_transport_key, secure_payload, unsecure_payload, verify_key_hash,
};
use zb_wire::{
    is_broadcast, ApsCommand, ApsDeliveryMode, ApsFrameFlags, ApsFrameType, ApsHeader, ApsKeyType,
    AuxSecurityHeader, Fragmenter, Key, KeyIdentifier, MacAddress, MacCapabilities, NwkFrameType,
    NwkHeader, Reassembler, RequestKeyType, TransportKey, UpdateDeviceStatus, WireError,
    MAX_UNFRAGMENTED_PAYLOAD,
};

/// Network key transport still owed to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDelivery {
    /// Device short address
    pub address16: u16,
    /// Device IEEE address
    pub address64: u64,
    /// Parent router to tunnel through, when the device is not our child
    pub via_parent: Option<u16>,
}

/// Application data to send
#[derive(Debug, Clone)]
pub struct ApsDataRequest {
    /// Destination short address or broadcast address
    pub destination16: u16,
    /// Destination endpoint
    pub destination_endpoint: u8,
    /// Cluster identifier
    pub cluster_id: u16,
    /// Profile identifier
    pub profile_id: u16,
    /// Source endpoint
    pub source_endpoint: u8,
    /// Payload, fragmented when too large for one frame
    pub payload: Bytes,
    /// Request an APS acknowledgment (unicast only)
    pub ack_request: bool,
}

/// Outstanding acknowledgment, keyed by destination and APS counter
pub type AckKey = (u16, u8);

/// Sent frames awaiting an acknowledgment; a fragmented transfer keeps
/// every block and is retransmitted whole
struct PendingAck {
    frames: Vec<Bytes>,
    retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DuplicateKey {
    source: MacAddress,
    destination_endpoint: Option<u8>,
    cluster_id: Option<u16>,
    counter: u8,
    block: Option<u8>,
}

/// APS layer handler
pub struct ApsHandler {
    duplicates: HashMap<DuplicateKey, u64>,
    pending_acks: HashMap<AckKey, PendingAck>,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    verify_hash: Option<(Key, Key)>,
}

impl Default for ApsHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn link_key(ctx: &StackContext, key_id: KeyIdentifier) -> Option<Key> {
    let tc_key = ctx.tc_key();
    match key_id {
        KeyIdentifier::Data => Some(*tc_key),
        KeyIdentifier::KeyTransport => Some(key_transport_key(tc_key)),
        KeyIdentifier::KeyLoad => Some(key_load_key(tc_key)),
        KeyIdentifier::Network => None,
    }
}

impl ApsHandler {
    /// Create a handler
    pub fn new() -> Self {
        Self {
            duplicates: HashMap::new(),
            pending_acks: HashMap::new(),
            fragmenter: Fragmenter::new(),
            reassembler: Reassembler::new(),
            verify_hash: None,
        }
    }

    /// Number of frames waiting for an acknowledgment
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Drop stale duplicate entries, partial transfers and acknowledgment
    /// waits for devices that have left
    pub fn expire(&mut self, ctx: &StackContext) {
        let now_ms = ctx.now_ms();
        let window_ms = ctx.config().timing.aps_duplicate_window_ms;
        self.duplicates
            .retain(|_, seen_ms| now_ms.saturating_sub(*seen_ms) <= window_ms);
        self.reassembler.expire(now_ms);
        self.pending_acks
            .retain(|(destination16, _), _| ctx.address64_of(*destination16).is_some());
    }

    /// Forget every acknowledgment wait for `destination16`
    pub fn drop_pending_acks(&mut self, destination16: u16) -> usize {
        let before = self.pending_acks.len();
        self.pending_acks
            .retain(|(address16, _), _| *address16 != destination16);
        let dropped = before - self.pending_acks.len();
        if dropped > 0 {
            debug!(
                "Dropped {} pending APS acknowledgments for 0x{:04x}",
                dropped, destination16
            );
        }
        dropped
    }

    /// Send application data.
    ///
    /// Returns the key of the acknowledgment to wait for, if one was requested.
    /// Fragmented transfers always request one.
    pub async fn send_data(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        request: ApsDataRequest,
    ) -> StackResult<Option<AckKey>> {
        let broadcast = is_broadcast(request.destination16);
        let mode = if broadcast {
            ApsDeliveryMode::Broadcast
        } else {
            ApsDeliveryMode::Unicast
        };
        let counter = ctx.next_aps_counter();
        let mut header = ApsHeader::data(
            mode,
            request.destination_endpoint,
            request.cluster_id,
            request.profile_id,
            request.source_endpoint,
            counter,
        );

        if request.payload.len() > MAX_UNFRAGMENTED_PAYLOAD {
            if broadcast || request.payload.len() > self.fragmenter.max_payload() {
                return Err(StackError::PayloadTooLarge(request.payload.len()));
            }
            let blocks = self.fragmenter.split(request.payload)?;
            debug!(
                "Sending {} blocks to 0x{:04x} (counter {})",
                blocks.len(),
                request.destination16,
                counter
            );
            header.flags |= ApsFrameFlags::ACK_REQUEST;
            let mut frames = Vec::with_capacity(blocks.len());
            for (fragmentation, block) in blocks {
                header.fragmentation = Some(fragmentation);
                let mut frame = BytesMut::with_capacity(12 + block.len());
                header.encode(&mut frame);
                frame.put_slice(&block);
                let frame = frame.freeze();
                nwk.send_frame(
                    ctx,
                    mac,
                    NwkFrameType::Data,
                    request.destination16,
                    &frame,
                    NwkTxOptions::secured(),
                )
                .await?;
                frames.push(frame);
            }
            let key = (request.destination16, counter);
            self.pending_acks
                .insert(key, PendingAck { frames, retries: 0 });
            return Ok(Some(key));
        }

        let ack = request.ack_request && !broadcast;
        if ack {
            header.flags |= ApsFrameFlags::ACK_REQUEST;
        }
        let mut frame = BytesMut::with_capacity(8 + request.payload.len());
        header.encode(&mut frame);
        frame.put_slice(&request.payload);
        let frame = frame.freeze();

        nwk.send_frame(
            ctx,
            mac,
            NwkFrameType::Data,
            request.destination16,
            &frame,
            NwkTxOptions::secured(),
        )
        .await?;

        if !ack {
            return Ok(None);
        }
        let key = (request.destination16, counter);
        self.pending_acks.insert(
            key,
            PendingAck {
                frames: vec![frame],
                retries: 0,
            },
        );
        Ok(Some(key))
    }

    /// Acknowledgment wait expired: retransmit, or give up and blame the route.
    ///
    /// Returns true when the frame was sent again and the wait must be re-armed.
    /// A failed retransmission ends the wait and counts against the route.
    pub async fn handle_ack_timeout(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        key: AckKey,
    ) -> StackResult<bool> {
        let max_retries = ctx.config().timing.aps_max_retries;
        let (destination16, counter) = key;
        if ctx.address64_of(destination16).is_none() {
            if self.pending_acks.remove(&key).is_some() {
                debug!(
                    "0x{:04x} left, no longer waiting for APS counter {}",
                    destination16, counter
                );
            }
            return Ok(false);
        }
        let Some(pending) = self.pending_acks.get_mut(&key) else {
            return Ok(false);
        };

        if pending.retries >= max_retries {
            self.pending_acks.remove(&key);
            warn!(
                "No APS acknowledgment from 0x{:04x} for counter {} after {} retries",
                destination16, counter, max_retries
            );
            nwk.mark_route_failure(ctx, destination16, false);
            return Ok(false);
        }

        pending.retries += 1;
        let frames = pending.frames.clone();
        debug!(
            "Retransmitting APS counter {} to 0x{:04x} (retry {})",
            counter, destination16, pending.retries
        );
        for frame in &frames {
            let result = nwk
                .send_frame(
                    ctx,
                    mac,
                    NwkFrameType::Data,
                    destination16,
                    frame,
                    NwkTxOptions::secured(),
                )
                .await;
            if let Err(e) = result {
                self.pending_acks.remove(&key);
                nwk.mark_route_failure(ctx, destination16, false);
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(
                    "Giving up on APS counter {} to 0x{:04x}: {}",
                    counter, destination16, e
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn send_ack(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        acked: &ApsHeader,
        destination16: u16,
        secured: bool,
    ) -> StackResult<()> {
        let mut frame = BytesMut::with_capacity(10);
        ApsHeader::ack_for(acked).encode(&mut frame);
        let options = NwkTxOptions {
            secured,
            ..NwkTxOptions::secured()
        };
        nwk.send_frame(ctx, mac, NwkFrameType::Data, destination16, &frame, options)
            .await?;
        Ok(())
    }

    fn build_command_frame(
        &mut self,
        ctx: &mut StackContext,
        command: &ApsCommand,
        mode: ApsDeliveryMode,
        security: Option<KeyIdentifier>,
    ) -> StackResult<Bytes> {
        let mut header = ApsHeader::command(mode, ctx.next_aps_counter());
        if security.is_some() {
            header.flags |= ApsFrameFlags::SECURITY;
        }
        let mut frame = BytesMut::with_capacity(64);
        header.encode(&mut frame);
        let mut payload = BytesMut::with_capacity(48);
        command.encode(&mut payload);

        match security {
            Some(key_id) => {
                let key = link_key(ctx, key_id).ok_or_else(|| {
                    StackError::InvalidParameter(format!("no link key for {:?}", key_id))
                })?;
                let eui64 = ctx.eui64();
                let aux = AuxSecurityHeader::link(key_id, ctx.next_tc_frame_counter(), Some(eui64));
                let secured = secure_payload(&frame, &aux, eui64, &key, &payload)?;
                frame.put_slice(&secured);
            }
            None => frame.put_slice(&payload),
        }
        Ok(frame.freeze())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_command(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        command: &ApsCommand,
        destination16: u16,
        security: Option<KeyIdentifier>,
        options: NwkTxOptions,
    ) -> StackResult<bool> {
        let mode = if is_broadcast(destination16) {
            ApsDeliveryMode::Broadcast
        } else {
            ApsDeliveryMode::Unicast
        };
        let frame = self.build_command_frame(ctx, command, mode, security)?;
        nwk.send_frame(ctx, mac, NwkFrameType::Data, destination16, &frame, options)
            .await
    }

    /// Hand the active network key to a device, directly or tunneled through its parent
    pub async fn deliver_network_key(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        delivery: KeyDelivery,
    ) -> StackResult<bool> {
        let sequence = ctx.network_key_sequence();
        let command = ApsCommand::TransportKey(TransportKey::Network {
            key: *ctx.network_key(),
            sequence,
            destination64: delivery.address64,
            source64: ctx.eui64(),
        });
        let inner = self.build_command_frame(
            ctx,
            &command,
            ApsDeliveryMode::Unicast,
            Some(KeyIdentifier::KeyTransport),
        )?;

        let sent = match delivery.via_parent {
            None => {
                // The device cannot decrypt NWK frames before it has the key
                let options = NwkTxOptions {
                    destination64: Some(delivery.address64),
                    ..NwkTxOptions::unsecured()
                };
                nwk.send_frame(ctx, mac, NwkFrameType::Data, delivery.address16, &inner, options)
                    .await?
            }
            Some(parent16) => {
                let tunnel = ApsCommand::Tunnel {
                    destination64: delivery.address64,
                    frame: inner,
                };
                self.send_command(ctx, mac, nwk, &tunnel, parent16, None, NwkTxOptions::secured())
                    .await?
            }
        };

        if sent {
            info!(
                "Network key {} sent to {:016x} (0x{:04x}{})",
                sequence,
                delivery.address64,
                delivery.address16,
                delivery
                    .via_parent
                    .map(|p| format!(" via 0x{:04x}", p))
                    .unwrap_or_default()
            );
            ctx.mark_key_delivered(delivery.address64, sequence);
        }
        Ok(sent)
    }

    /// Ask a parent router to drop one of its children
    pub async fn send_remove_device(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        parent16: u16,
        target64: u64,
    ) -> StackResult<bool> {
        info!("Asking 0x{:04x} to remove {:016x}", parent16, target64);
        self.send_command(
            ctx,
            mac,
            nwk,
            &ApsCommand::RemoveDevice { target64 },
            parent16,
            Some(KeyIdentifier::Data),
            NwkTxOptions::secured(),
        )
        .await
    }

    /// Distribute a staged network key with one NWK-secured broadcast
    pub async fn broadcast_network_key(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        key: Key,
        sequence: u8,
    ) -> StackResult<bool> {
        let command = ApsCommand::TransportKey(TransportKey::Network {
            key,
            sequence,
            destination64: 0,
            source64: ctx.eui64(),
        });
        self.send_command(
            ctx,
            mac,
            nwk,
            &command,
            BROADCAST_RX_ON_WHEN_IDLE,
            None,
            NwkTxOptions::secured(),
        )
        .await
    }

    /// Distribute a staged network key to one device, APS-secured
    #[allow(clippy::too_many_arguments)]
    pub async fn send_network_key_update(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        destination16: u16,
        destination64: u64,
        key: Key,
        sequence: u8,
    ) -> StackResult<bool> {
        let command = ApsCommand::TransportKey(TransportKey::Network {
            key,
            sequence,
            destination64,
            source64: ctx.eui64(),
        });
        self.send_command(
            ctx,
            mac,
            nwk,
            &command,
            destination16,
            Some(KeyIdentifier::KeyTransport),
            NwkTxOptions::secured(),
        )
        .await
    }

    /// Tell every device to activate network key `sequence`
    pub async fn broadcast_switch_key(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        sequence: u8,
    ) -> StackResult<bool> {
        self.send_command(
            ctx,
            mac,
            nwk,
            &ApsCommand::SwitchKey { sequence },
            BROADCAST_RX_ON_WHEN_IDLE,
            None,
            NwkTxOptions::secured(),
        )
        .await
    }

    /// Record `key` and report whether it was already seen inside the window
    fn is_duplicate_frame(&mut self, ctx: &StackContext, key: DuplicateKey) -> bool {
        let now_ms = ctx.now_ms();
        let window_ms = ctx.config().timing.aps_duplicate_window_ms;
        match self.duplicates.insert(key, now_ms) {
            Some(seen_ms) if now_ms.saturating_sub(seen_ms) <= window_ms => {
                // the window runs from the first sighting
                self.duplicates.insert(key, seen_ms);
                true
            }
            _ => false,
        }
    }

    /// Handle an inbound APS frame carried in a NWK data frame
    #[allow(clippy::too_many_arguments)]
    pub async fn process_frame(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        nwk_header: &NwkHeader,
        source64: Option<u64>,
        payload: Bytes,
        lqa: u8,
    ) -> StackResult<Option<KeyDelivery>> {
        let source16 = nwk_header.source16;
        let mut buf = payload.clone();
        let header = match ApsHeader::decode(&mut buf) {
            Ok(header) => header,
            Err(WireError::Unsupported(what)) => {
                debug!("Dropping {} from 0x{:04x}", what, source16);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let header_bytes = payload.slice(..payload.len() - buf.len());

        if header.frame_type == ApsFrameType::Ack {
            let key = (source16, header.counter);
            let complete = match (self.pending_acks.get(&key), header.fragmentation) {
                (Some(pending), Some(fragment)) => {
                    // bitfield bits cover the blocks from block_number on
                    let covered = 8 - fragment.ack_bitfield.unwrap_or(1).leading_zeros() as usize;
                    fragment.block_number as usize + covered >= pending.frames.len()
                }
                (Some(_), None) => true,
                (None, _) => false,
            };
            if complete {
                self.pending_acks.remove(&key);
                debug!("APS counter {} acknowledged by 0x{:04x}", header.counter, source16);
            }
            return Ok(None);
        }

        let body = if header.is_secured() {
            let aux = AuxSecurityHeader::decode(&mut buf)?;
            let Some(nonce_source64) = aux.source64.or(source64) else {
                debug!("APS-secured frame from 0x{:04x} without IEEE address", source16);
                return Ok(None);
            };
            let Some(key) = link_key(ctx, aux.control.key_id) else {
                debug!("APS frame from 0x{:04x} secured with the network key", source16);
                return Ok(None);
            };
            match unsecure_payload(&header_bytes, &aux, nonce_source64, &key, &buf) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!("APS decryption from 0x{:04x} failed: {}", source16, e);
                    return Ok(None);
                }
            }
        } else {
            buf
        };

        let duplicate_key = DuplicateKey {
            source: source64
                .map(MacAddress::Extended)
                .unwrap_or(MacAddress::Short(source16)),
            destination_endpoint: header.destination_endpoint,
            cluster_id: header.cluster_id,
            counter: header.counter,
            block: header.fragmentation.map(|f| f.block_number),
        };
        if self.is_duplicate_frame(ctx, duplicate_key) {
            debug!(
                "Duplicate APS counter {} from 0x{:04x} dropped",
                header.counter, source16
            );
            return Ok(None);
        }
        let now_ms = ctx.now_ms();

        if header.ack_requested() {
            let result = self
                .send_ack(ctx, mac, nwk, &header, source16, nwk_header.is_secured())
                .await;
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    "Cannot acknowledge APS counter {} from 0x{:04x}: {}",
                    header.counter, source16, e
                ),
                Ok(()) => {}
            }
        }

        match header.frame_type {
            ApsFrameType::Data => {
                let payload = match header.fragmentation {
                    Some(fragmentation) => {
                        match self.reassembler.add_block(
                            source16,
                            header.counter,
                            &fragmentation,
                            body,
                            now_ms,
                        ) {
                            Some(complete) => complete,
                            None => return Ok(None),
                        }
                    }
                    None => body,
                };
                ctx.emit(StackEvent::FrameReceived {
                    sender16: source16,
                    sender64: source64.or_else(|| ctx.address64_of(source16)),
                    aps_header: header,
                    payload,
                    lqa,
                });
                Ok(None)
            }
            ApsFrameType::Command => {
                let mut body = body;
                let command = ApsCommand::decode(&mut body)?;
                let secured = nwk_header.is_secured() || header.is_secured();
                self.process_command(ctx, mac, nwk, source16, source64, command, secured)
                    .await
            }
            ApsFrameType::Ack | ApsFrameType::InterPan => Ok(None),
        }
    }

    /// Trust Center commands are only taken from network members: the frame
    /// must carry NWK or APS security. Joining devices never send APS
    /// commands before they hold the network key.
    #[allow(clippy::too_many_arguments)]
    async fn process_command(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        source16: u16,
        source64: Option<u64>,
        command: ApsCommand,
        secured: bool,
    ) -> StackResult<Option<KeyDelivery>> {
        if !secured {
            warn!(
                "Dropping unsecured APS command {:?} from 0x{:04x}",
                command.id(),
                source16
            );
            return Ok(None);
        }
        match command {
            ApsCommand::UpdateDevice {
                device64,
                device16,
                status,
            } => {
                return self
                    .process_update_device(ctx, mac, nwk, source16, device64, device16, status)
                    .await;
            }
            ApsCommand::RequestKey {
                key_type,
                partner64,
            } => {
                let Some(requester64) = source64.or_else(|| ctx.address64_of(source16)) else {
                    debug!("Key request from unknown 0x{:04x}", source16);
                    return Ok(None);
                };
                match key_type {
                    RequestKeyType::TrustCenterLink => {
                        self.process_tc_key_request(ctx, mac, nwk, source16, requester64)
                            .await?;
                    }
                    RequestKeyType::ApplicationLink => {
                        let Some(partner64) = partner64 else {
                            debug!("Application key request without partner");
                            return Ok(None);
                        };
                        self.process_app_key_request(ctx, mac, nwk, requester64, partner64)
                            .await?;
                    }
                }
            }
            ApsCommand::VerifyKey {
                key_type,
                source64: claimed64,
                hash,
            } => {
                self.process_verify_key(ctx, mac, nwk, source16, key_type, claimed64, hash)
                    .await?;
            }
            ApsCommand::SwitchKey { sequence } => {
                ctx.activate_pending_network_key(sequence);
            }
            ApsCommand::Tunnel { destination64, .. } => {
                debug!(
                    "Ignoring tunnel from 0x{:04x} for {:016x}",
                    source16, destination64
                );
            }
            other => {
                debug!("Ignoring APS command {:?} from 0x{:04x}", other.id(), source16);
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_update_device(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        parent16: u16,
        device64: u64,
        device16: u16,
        status: UpdateDeviceStatus,
    ) -> StackResult<Option<KeyDelivery>> {
        info!(
            "Update device from 0x{:04x}: {:016x} (0x{:04x}) {:?}",
            parent16, device64, device16, status
        );
        if status == UpdateDeviceStatus::DeviceLeft {
            if let Some(device) = ctx.disassociate(device64) {
                self.drop_pending_acks(device.address16);
            }
            return Ok(None);
        }

        let secured = status == UpdateDeviceStatus::SecuredRejoin;
        let rejoin = status != UpdateDeviceStatus::UnsecuredJoin;
        let deny = status == UpdateDeviceStatus::UnsecuredRejoin
            && !ctx.allows_trust_center_rejoin(device64);
        let capabilities = ctx
            .device(device64)
            .map(|d| d.capabilities)
            .unwrap_or(MacCapabilities::ALLOCATE_ADDRESS);

        let outcome = ctx.associate(AssociationRequest {
            address16: Some(device16),
            address64: device64,
            rejoin,
            capabilities,
            neighbor: false,
            parent16: Some(parent16),
            deny_override: deny,
            allow_override: secured,
        });
        if !outcome.is_success() {
            self.send_remove_device(ctx, mac, nwk, parent16, device64)
                .await?;
            return Ok(None);
        }
        if outcome.address16 != device16 {
            warn!(
                "{:016x} keeps 0x{:04x} but the coordinator assigned 0x{:04x}",
                device64, device16, outcome.address16
            );
        }

        if rejoin {
            ctx.emit(StackEvent::DeviceRejoined {
                address16: outcome.address16,
                address64: device64,
                secured,
            });
        }
        if !secured || outcome.requires_transport_key {
            return Ok(Some(KeyDelivery {
                address16: outcome.address16,
                address64: device64,
                via_parent: Some(parent16),
            }));
        }
        Ok(None)
    }

    async fn process_tc_key_request(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        source16: u16,
        requester64: u64,
    ) -> StackResult<()> {
        let authorized = ctx.device(requester64).map_or(false, |d| d.authorized);
        let allowed = match ctx.policies().allow_tc_key_request {
            TcKeyRequestPolicy::Disallowed => false,
            TcKeyRequestPolicy::Allowed => true,
            TcKeyRequestPolicy::OnlyProvisional => !authorized,
        };
        if !allowed {
            info!("Trust Center key request from {:016x} refused", requester64);
            return Ok(());
        }

        let command = ApsCommand::TransportKey(TransportKey::TrustCenterLink {
            key: *ctx.tc_key(),
            destination64: requester64,
            source64: ctx.eui64(),
        });
        self.send_command(
            ctx,
            mac,
            nwk,
            &command,
            source16,
            Some(KeyIdentifier::KeyLoad),
            NwkTxOptions::secured(),
        )
        .await?;
        debug!("Trust Center key sent to {:016x}", requester64);
        Ok(())
    }

    async fn process_app_key_request(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        requester64: u64,
        partner64: u64,
    ) -> StackResult<()> {
        let allowed = match ctx.policies().allow_app_key_request {
            AppKeyRequestPolicy::Disallowed => false,
            AppKeyRequestPolicy::Allowed => true,
            AppKeyRequestPolicy::OnlyApproved => {
                ctx.is_approved_app_key_pair(requester64, partner64)
            }
        };
        let (Some(requester16), Some(partner16)) =
            (ctx.address16_of(requester64), ctx.address16_of(partner64))
        else {
            debug!(
                "Application key request for unknown pair {:016x}/{:016x}",
                requester64, partner64
            );
            return Ok(());
        };
        if !allowed {
            info!(
                "Application key request {:016x}/{:016x} refused",
                requester64, partner64
            );
            return Ok(());
        }

        let key = match ctx.app_link_key(requester64, partner64) {
            Some(key) => key,
            None => {
                let key: Key = rand::random();
                ctx.set_app_link_key(requester64, partner64, key);
                key
            }
        };

        for (destination16, partner, initiator) in [
            (requester16, partner64, true),
            (partner16, requester64, false),
        ] {
            let command = ApsCommand::TransportKey(TransportKey::ApplicationLink {
                key,
                partner64: partner,
                initiator,
            });
            self.send_command(
                ctx,
                mac,
                nwk,
                &command,
                destination16,
                Some(KeyIdentifier::KeyTransport),
                NwkTxOptions::secured(),
            )
            .await?;
        }
        info!(
            "Application key distributed to {:016x} and {:016x}",
            requester64, partner64
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_verify_key(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        nwk: &mut NwkHandler,
        source16: u16,
        key_type: ApsKeyType,
        claimed64: u64,
        hash: Key,
    ) -> StackResult<()> {
        if key_type != ApsKeyType::TrustCenterLink {
            debug!("Ignoring verify key for {:?} from 0x{:04x}", key_type, source16);
            return Ok(());
        }

        let tc_key = *ctx.tc_key();
        let expected = match self.verify_hash {
            Some((key, expected)) if key == tc_key => expected,
            _ => {
                let expected = verify_key_hash(&tc_key);
                self.verify_hash = Some((tc_key, expected));
                expected
            }
        };
        let verified = hash == expected;
        let status = if verified {
            CONFIRM_KEY_SUCCESS
        } else {
            CONFIRM_KEY_SECURITY_FAILURE
        };
        info!(
            "Key verification from {:016x}: {}",
            claimed64,
            if verified { "ok" } else { "hash mismatch" }
        );

        let command = ApsCommand::ConfirmKey {
            status,
            key_type,
            destination64: claimed64,
        };
        let destination16 = ctx.address16_of(claimed64).unwrap_or(source16);
        self.send_command(
            ctx,
            mac,
            nwk,
            &command,
            destination16,
            Some(KeyIdentifier::Data),
            NwkTxOptions::secured(),
        )
        .await?;

        if verified {
            ctx.authorize(claimed64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{join, rx_on, test_context, COORDINATOR_EUI64};
    use crate::nwk::tests::open_frame;
    use crate::transport::mock::MockTransport;
    use std::time::Duration;
    use zb_wire::nwk::COORDINATOR_ADDRESS;
    use zb_wire::security::WELL_KNOWN_TC_LINK_KEY;
    use zb_wire::{FragmentKind, NwkFrameFlags};

    struct Harness {
        ctx: StackContext,
        events: tokio::sync::mpsc::UnboundedReceiver<StackEvent>,
        transport: MockTransport,
        mac: MacHandler,
        nwk: NwkHandler,
        aps: ApsHandler,
    }

    impl Harness {
        fn new() -> Self {
            let (ctx, events, _) = test_context();
            let transport = MockTransport::new();
            Self {
                ctx,
                events,
                mac: MacHandler::new(Box::new(transport.clone())),
                transport,
                nwk: NwkHandler::new(),
                aps: ApsHandler::new(),
            }
        }

        async fn receive(&mut self, source16: u16, source64: Option<u64>, frame: Bytes) -> Option<KeyDelivery> {
            self.receive_with(source16, source64, frame, true).await
        }

        async fn receive_with(
            &mut self,
            source16: u16,
            source64: Option<u64>,
            frame: Bytes,
            nwk_secured: bool,
        ) -> Option<KeyDelivery> {
            let mut header = NwkHeader::new(NwkFrameType::Data, COORDINATOR_ADDRESS, source16, 30, 1);
            if nwk_secured {
                header.flags |= NwkFrameFlags::SECURITY;
            }
            self.aps
                .process_frame(&mut self.ctx, &mut self.mac, &mut self.nwk, &header, source64, frame, 200)
                .await
                .unwrap()
        }

        fn drain_events(&mut self) -> Vec<StackEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Decode a sent frame down to the APS layer, decrypting both layers
        fn open_aps(&self, index: usize) -> (NwkHeader, ApsHeader, Bytes) {
            let (_, nwk_header, payload) = open_frame(&self.ctx, self.transport.frames()[index].clone());
            let mut buf = payload.clone();
            let header = ApsHeader::decode(&mut buf).unwrap();
            if !header.is_secured() {
                return (nwk_header, header, buf);
            }
            let header_bytes = payload.slice(..payload.len() - buf.len());
            let aux = AuxSecurityHeader::decode(&mut buf).unwrap();
            let key = link_key(&self.ctx, aux.control.key_id).unwrap();
            let plain =
                unsecure_payload(&header_bytes, &aux, aux.source64.unwrap(), &key, &buf).unwrap();
            (nwk_header, header, plain)
        }

        fn sent_command(&self, index: usize) -> ApsCommand {
            let (_, header, mut payload) = self.open_aps(index);
            assert_eq!(header.frame_type, ApsFrameType::Command);
            ApsCommand::decode(&mut payload).unwrap()
        }
    }

    fn data_frame(counter: u8, ack: bool, payload: &[u8]) -> Bytes {
        let mut header = ApsHeader::data(ApsDeliveryMode::Unicast, 1, 0x0006, 0x0104, 1, counter);
        if ack {
            header.flags |= ApsFrameFlags::ACK_REQUEST;
        }
        let mut frame = BytesMut::new();
        header.encode(&mut frame);
        frame.put_slice(payload);
        frame.freeze()
    }

    fn command_frame(command: &ApsCommand) -> Bytes {
        let mut frame = BytesMut::new();
        ApsHeader::command(ApsDeliveryMode::Unicast, 0x40).encode(&mut frame);
        command.encode(&mut frame);
        frame.freeze()
    }

    #[tokio::test]
    async fn test_duplicate_is_dropped_without_second_ack() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.drain_events();

        h.receive(address16, Some(0xd1), data_frame(0x10, true, &[1, 2, 3])).await;
        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StackEvent::FrameReceived {
                sender16,
                sender64,
                payload,
                lqa,
                ..
            } => {
                assert_eq!(*sender16, address16);
                assert_eq!(*sender64, Some(0xd1));
                assert_eq!(&payload[..], &[1, 2, 3]);
                assert_eq!(*lqa, 200);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.transport.frames().len(), 1);
        let (nwk_header, ack, _) = h.open_aps(0);
        assert_eq!(nwk_header.destination16, address16);
        assert_eq!(ack.frame_type, ApsFrameType::Ack);
        assert_eq!(ack.counter, 0x10);

        h.receive(address16, Some(0xd1), data_frame(0x10, true, &[1, 2, 3])).await;
        assert!(h.drain_events().is_empty());
        assert_eq!(h.transport.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_window_expires() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.drain_events();

        h.receive(address16, Some(0xd1), data_frame(0x11, false, &[1])).await;
        tokio::time::advance(Duration::from_secs(9)).await;
        h.aps.expire(&h.ctx);
        h.receive(address16, Some(0xd1), data_frame(0x11, false, &[1])).await;
        assert_eq!(h.drain_events().len(), 2);
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                ApsDataRequest {
                    destination16: address16,
                    destination_endpoint: 1,
                    cluster_id: 0x0006,
                    profile_id: 0x0104,
                    source_endpoint: 1,
                    payload: Bytes::from_static(&[0x01, 0x00, 0x02]),
                    ack_request: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.0, address16);
        assert_eq!(h.aps.pending_ack_count(), 1);

        let (_, sent, _) = h.open_aps(0);
        let mut ack = BytesMut::new();
        ApsHeader::ack_for(&sent).encode(&mut ack);
        h.receive(address16, Some(0xd1), ack.freeze()).await;
        assert_eq!(h.aps.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_timeout_retries_then_gives_up() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let now = h.ctx.now_ms();
        h.ctx.routes_mut().add_route(address16, &[], 1, now);

        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                ApsDataRequest {
                    destination16: address16,
                    destination_endpoint: 1,
                    cluster_id: 0x0006,
                    profile_id: 0x0104,
                    source_endpoint: 1,
                    payload: Bytes::from_static(&[0x01]),
                    ack_request: true,
                },
            )
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            assert!(h
                .aps
                .handle_ack_timeout(&mut h.ctx, &mut h.mac, &mut h.nwk, key)
                .await
                .unwrap());
        }
        assert!(!h
            .aps
            .handle_ack_timeout(&mut h.ctx, &mut h.mac, &mut h.nwk, key)
            .await
            .unwrap());
        assert_eq!(h.transport.frames().len(), 4);
        assert_eq!(h.aps.pending_ack_count(), 0);
        assert_eq!(h.ctx.routes().routes(address16)[0].failure_count, 1);
    }

    #[tokio::test]
    async fn test_fragmented_send_and_receive() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.drain_events();

        let payload = Bytes::from(vec![0xab; 150]);
        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                ApsDataRequest {
                    destination16: address16,
                    destination_endpoint: 1,
                    cluster_id: 0x0019,
                    profile_id: 0x0104,
                    source_endpoint: 1,
                    payload: payload.clone(),
                    ack_request: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(key.map(|(destination16, _)| destination16), Some(address16));
        assert_eq!(h.aps.pending_ack_count(), 1);
        assert_eq!(h.transport.frames().len(), 3);
        let (_, first, body) = h.open_aps(0);
        let fragmentation = first.fragmentation.unwrap();
        assert_eq!(fragmentation.kind, FragmentKind::First);
        assert_eq!(fragmentation.block_number, 3);
        assert_eq!(body.len(), 64);
        let (_, last, body) = h.open_aps(2);
        assert_eq!(last.fragmentation.unwrap().block_number, 2);
        assert_eq!(body.len(), 22);

        for (fragmentation, block) in Fragmenter::new().split(payload.clone()).unwrap() {
            let mut header = ApsHeader::data(ApsDeliveryMode::Unicast, 1, 0x0019, 0x0104, 1, 0x20);
            header.fragmentation = Some(fragmentation);
            let mut frame = BytesMut::new();
            header.encode(&mut frame);
            frame.put_slice(&block);
            h.receive(address16, Some(0xd1), frame.freeze()).await;
        }
        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StackEvent::FrameReceived { payload: received, .. } => assert_eq!(received, &payload),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn unicast_request(destination16: u16, payload: Bytes) -> ApsDataRequest {
        ApsDataRequest {
            destination16,
            destination_endpoint: 1,
            cluster_id: 0x0019,
            profile_id: 0x0104,
            source_endpoint: 1,
            payload,
            ack_request: true,
        }
    }

    #[tokio::test]
    async fn test_fragmented_timeout_resends_every_block() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from(vec![0x5a; 150])),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.transport.frames().len(), 3);

        assert!(h
            .aps
            .handle_ack_timeout(&mut h.ctx, &mut h.mac, &mut h.nwk, key)
            .await
            .unwrap());
        assert_eq!(h.transport.frames().len(), 6);
        let (_, resent, _) = h.open_aps(3);
        assert_eq!(resent.counter, key.1);
        assert_eq!(resent.fragmentation.unwrap().kind, FragmentKind::First);

        // first block only, the transfer stays pending
        let mut ack = ApsHeader::ack_for(&resent);
        let mut frame = BytesMut::new();
        ack.encode(&mut frame);
        h.receive(address16, Some(0xd1), frame.freeze()).await;
        assert_eq!(h.aps.pending_ack_count(), 1);

        if let Some(fragment) = ack.fragmentation.as_mut() {
            fragment.ack_bitfield = Some(0b0000_0111);
        }
        let mut frame = BytesMut::new();
        ack.encode(&mut frame);
        h.receive(address16, Some(0xd1), frame.freeze()).await;
        assert_eq!(h.aps.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn test_unicast_beyond_block_limit_is_rejected() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let limit = Fragmenter::new().max_payload();

        let result = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from(vec![0; limit + 1])),
            )
            .await;
        assert!(matches!(result, Err(StackError::PayloadTooLarge(n)) if n == limit + 1));
        assert!(h.transport.frames().is_empty());

        h.aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from(vec![0; limit])),
            )
            .await
            .unwrap();
        assert_eq!(h.transport.frames().len(), 255);
        let (_, first, _) = h.open_aps(0);
        assert_eq!(first.fragmentation.unwrap().block_number, 255);
    }

    #[tokio::test]
    async fn test_ack_wait_ends_when_destination_leaves() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from_static(&[0x01])),
            )
            .await
            .unwrap()
            .unwrap();

        h.ctx.disassociate(0xd1);
        assert!(!h
            .aps
            .handle_ack_timeout(&mut h.ctx, &mut h.mac, &mut h.nwk, key)
            .await
            .unwrap());
        assert_eq!(h.aps.pending_ack_count(), 0);
        assert_eq!(h.transport.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_drops_acks_for_departed_devices() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from_static(&[0x01])),
            )
            .await
            .unwrap();

        h.ctx.disassociate(0xd1);
        h.aps.expire(&h.ctx);
        assert_eq!(h.aps.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_retransmission_ends_wait() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let now = h.ctx.now_ms();
        h.ctx.routes_mut().add_route(address16, &[], 1, now);
        let key = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                unicast_request(address16, Bytes::from_static(&[0x01])),
            )
            .await
            .unwrap()
            .unwrap();

        h.transport
            .fail_next(crate::transport::TransportError::Io("link down".into()));
        let result = h
            .aps
            .handle_ack_timeout(&mut h.ctx, &mut h.mac, &mut h.nwk, key)
            .await;
        assert!(matches!(result, Err(StackError::Transport(_))));
        assert_eq!(h.aps.pending_ack_count(), 0);
        assert_eq!(h.ctx.routes().routes(address16)[0].failure_count, 1);
    }

    #[tokio::test]
    async fn test_data_delivered_when_ack_cannot_be_routed() {
        let mut h = Harness::new();
        h.receive(0x7777, None, data_frame(0x12, true, &[9, 8])).await;

        assert!(h.transport.frames().is_empty());
        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StackEvent::FrameReceived {
                sender16, payload, ..
            } => {
                assert_eq!(*sender16, 0x7777);
                assert_eq!(&payload[..], &[9, 8]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsecured_trust_center_command_is_dropped() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.drain_events();

        let frame = command_frame(&ApsCommand::VerifyKey {
            key_type: ApsKeyType::TrustCenterLink,
            source64: 0xd1,
            hash: verify_key_hash(&WELL_KNOWN_TC_LINK_KEY),
        });
        h.receive_with(address16, Some(0xd1), frame, false).await;
        assert!(!h.ctx.device(0xd1).unwrap().authorized);
        assert!(h.transport.frames().is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_too_large_is_rejected() {
        let mut h = Harness::new();
        let result = h
            .aps
            .send_data(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                ApsDataRequest {
                    destination16: 0xfffd,
                    destination_endpoint: 0xff,
                    cluster_id: 0x0006,
                    profile_id: 0x0104,
                    source_endpoint: 1,
                    payload: Bytes::from(vec![0; 100]),
                    ack_request: false,
                },
            )
            .await;
        assert!(matches!(result, Err(StackError::PayloadTooLarge(100))));
    }

    #[tokio::test]
    async fn test_direct_key_delivery() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());

        let sent = h
            .aps
            .deliver_network_key(
                &mut h.ctx,
                &mut h.mac,
                &mut h.nwk,
                KeyDelivery {
                    address16,
                    address64: 0xd1,
                    via_parent: None,
                },
            )
            .await
            .unwrap();
        assert!(sent);

        let (nwk_header, aps_header, _) = h.open_aps(0);
        assert!(!nwk_header.is_secured());
        assert_eq!(nwk_header.destination64, Some(0xd1));
        assert!(aps_header.is_secured());
        assert_eq!(
            h.sent_command(0),
            ApsCommand::TransportKey(TransportKey::Network {
                key: [0x11; 16],
                sequence: 0,
                destination64: 0xd1,
                source64: COORDINATOR_EUI64,
            })
        );
        assert_eq!(h.ctx.device(0xd1).unwrap().last_key_sequence, Some(0));
    }

    #[tokio::test]
    async fn test_update_device_join_tunnels_key_through_parent() {
        let mut h = Harness::new();
        let parent16 = join(&mut h.ctx, 0xa1, rx_on());
        h.ctx.open_join_window(Duration::from_secs(60), true);
        h.drain_events();

        let update = command_frame(&ApsCommand::UpdateDevice {
            device64: 0xc1,
            device16: 0x4321,
            status: UpdateDeviceStatus::UnsecuredJoin,
        });
        let delivery = h.receive(parent16, Some(0xa1), update).await.unwrap();
        assert_eq!(
            delivery,
            KeyDelivery {
                address16: 0x4321,
                address64: 0xc1,
                via_parent: Some(parent16)
            }
        );
        let child = h.ctx.device(0xc1).unwrap();
        assert_eq!(child.parent16, Some(parent16));
        assert!(!child.neighbor);
        assert!(matches!(
            h.drain_events()[..],
            [StackEvent::DeviceJoined {
                address64: 0xc1,
                parent16: Some(_),
                ..
            }]
        ));

        h.aps
            .deliver_network_key(&mut h.ctx, &mut h.mac, &mut h.nwk, delivery)
            .await
            .unwrap();
        let (nwk_header, _, _) = h.open_aps(0);
        assert!(nwk_header.is_secured());
        assert_eq!(nwk_header.destination16, parent16);
        match h.sent_command(0) {
            ApsCommand::Tunnel {
                destination64,
                frame,
            } => {
                assert_eq!(destination64, 0xc1);
                let mut inner = frame.clone();
                let header = ApsHeader::decode(&mut inner).unwrap();
                assert!(header.is_secured());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_device_denied_sends_remove() {
        let mut h = Harness::new();
        let parent16 = join(&mut h.ctx, 0xa1, rx_on());

        let update = command_frame(&ApsCommand::UpdateDevice {
            device64: 0xc2,
            device16: 0x5555,
            status: UpdateDeviceStatus::UnsecuredJoin,
        });
        assert!(h.receive(parent16, Some(0xa1), update).await.is_none());
        assert!(h.ctx.device(0xc2).is_none());
        assert_eq!(
            h.sent_command(0),
            ApsCommand::RemoveDevice { target64: 0xc2 }
        );
    }

    #[tokio::test]
    async fn test_verify_key_authorizes() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        h.drain_events();

        // Device-side APS security with the Trust Center link key
        let command = ApsCommand::VerifyKey {
            key_type: ApsKeyType::TrustCenterLink,
            source64: 0xd1,
            hash: verify_key_hash(&WELL_KNOWN_TC_LINK_KEY),
        };
        let mut header = ApsHeader::command(ApsDeliveryMode::Unicast, 0x41);
        header.flags |= ApsFrameFlags::SECURITY;
        let mut frame = BytesMut::new();
        header.encode(&mut frame);
        let mut payload = BytesMut::new();
        command.encode(&mut payload);
        let aux = AuxSecurityHeader::link(KeyIdentifier::Data, 7, Some(0xd1));
        let secured =
            secure_payload(&frame, &aux, 0xd1, &WELL_KNOWN_TC_LINK_KEY, &payload).unwrap();
        frame.put_slice(&secured);

        h.receive(address16, Some(0xd1), frame.freeze()).await;
        assert!(h.ctx.device(0xd1).unwrap().authorized);
        assert!(matches!(
            h.drain_events()[..],
            [StackEvent::DeviceAuthorized { address64: 0xd1, .. }]
        ));
        assert_eq!(
            h.sent_command(0),
            ApsCommand::ConfirmKey {
                status: CONFIRM_KEY_SUCCESS,
                key_type: ApsKeyType::TrustCenterLink,
                destination64: 0xd1,
            }
        );
    }

    #[tokio::test]
    async fn test_verify_key_mismatch() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());

        let frame = command_frame(&ApsCommand::VerifyKey {
            key_type: ApsKeyType::TrustCenterLink,
            source64: 0xd1,
            hash: [0; 16],
        });
        h.receive(address16, Some(0xd1), frame).await;
        assert!(!h.ctx.device(0xd1).unwrap().authorized);
        assert!(matches!(
            h.sent_command(0),
            ApsCommand::ConfirmKey {
                status: CONFIRM_KEY_SECURITY_FAILURE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tc_key_request_policy() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xd1, rx_on());
        let request = ApsCommand::RequestKey {
            key_type: RequestKeyType::TrustCenterLink,
            partner64: None,
        };

        h.receive(address16, Some(0xd1), command_frame(&request)).await;
        assert!(matches!(
            h.sent_command(0),
            ApsCommand::TransportKey(TransportKey::TrustCenterLink {
                destination64: 0xd1,
                ..
            })
        ));

        let mut policies = h.ctx.policies().clone();
        policies.allow_tc_key_request = TcKeyRequestPolicy::OnlyProvisional;
        h.ctx.set_policies(policies);
        h.ctx.authorize(0xd1);
        h.transport.clear();
        let mut repeat = BytesMut::new();
        ApsHeader::command(ApsDeliveryMode::Unicast, 0x42).encode(&mut repeat);
        request.encode(&mut repeat);
        h.receive(address16, Some(0xd1), repeat.freeze()).await;
        assert!(h.transport.frames().is_empty());
    }

    #[tokio::test]
    async fn test_app_key_request_only_approved() {
        let mut h = Harness::new();
        let a16 = join(&mut h.ctx, 0xd1, rx_on());
        join(&mut h.ctx, 0xd2, rx_on());
        let mut policies = h.ctx.policies().clone();
        policies.allow_app_key_request = AppKeyRequestPolicy::OnlyApproved;
        policies.approved_app_key_pairs = vec![(0xd2, 0xd1)];
        h.ctx.set_policies(policies);

        let request = command_frame(&ApsCommand::RequestKey {
            key_type: RequestKeyType::ApplicationLink,
            partner64: Some(0xd2),
        });
        h.receive(a16, Some(0xd1), request).await;
        assert_eq!(h.transport.frames().len(), 2);
        let key = h.ctx.app_link_key(0xd1, 0xd2).unwrap();
        assert_eq!(
            h.sent_command(1),
            ApsCommand::TransportKey(TransportKey::ApplicationLink {
                key,
                partner64: 0xd1,
                initiator: false,
            })
        );
    }

    #[tokio::test]
    async fn test_switch_key_without_staged_key_keeps_active() {
        let mut h = Harness::new();
        let address16 = join(&mut h.ctx, 0xa1, rx_on());
        h.receive(address16, Some(0xa1), command_frame(&ApsCommand::SwitchKey { sequence: 4 }))
            .await;
        assert_eq!(h.ctx.network_key_sequence(), 0);
        assert_eq!(h.ctx.network_key(), &[0x11; 16]);
    }
}
