//! NWK layer: routing decisions, NWK security and NWK command handling

use crate::aps::KeyDelivery;
use crate::context::{AssociationRequest, StackContext};
use crate::error::StackResult;
use crate::events::StackEvent;
use crate::link_quality::lqa_to_link_cost;
use crate::mac::{MacHandler, RouteOutcomeSink};
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tracing::{debug, info, warn};
use zb_routing::{RoutingError, SelectedRoute};
use zb_wire::mac::BROADCAST_ADDRESS;
use zb_wire::nwk::{
    BROADCAST_ROUTERS, BROADCAST_RX_ON_WHEN_IDLE, COORDINATOR_ADDRESS, DEFAULT_RADIUS,
    ED_KEEPALIVE_MAC_DATA_POLL, ED_KEEPALIVE_TIMEOUT_REQUEST, ED_TIMEOUT_INCORRECT_VALUE,
    ED_TIMEOUT_SUCCESS, MAX_LINK_STATUS_ENTRIES, ROUTE_REPLY_RESPONDER_IEEE,
    ROUTE_REQUEST_MANY_TO_ONE,
};
use zb_wire::security::secure_payload;
use zb_wire::{
    encode_mac_frame, is_broadcast, AuxSecurityHeader, LeaveOptions, LinkStatusEntry,
    MacAssociationStatus, MacCapabilities, MacHeader, NwkCommand, NwkFrameFlags, NwkFrameType,
    NwkHeader, NwkStatusCode, SourceRoute,
};

/// Highest Zigbee link cost
const MAX_LINK_COST: u8 = 7;

/// How a unicast reaches its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChoice {
    /// Broadcast destination, no route involved
    Broadcast,
    /// Destination heard directly
    Direct,
    /// Source-routed through relays
    Relayed(SelectedRoute),
    /// No usable route; rediscovery was requested
    Unknown,
}

/// Per-frame NWK transmit options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NwkTxOptions {
    /// Secure with the active network key
    pub secured: bool,
    /// Hop limit
    pub radius: u8,
    /// Include the destination IEEE address
    pub destination64: Option<u64>,
    /// Send to this MAC neighbor without a route lookup
    pub next_hop: Option<u16>,
}

impl NwkTxOptions {
    /// Network-key secured, default radius
    pub fn secured() -> Self {
        Self {
            secured: true,
            radius: DEFAULT_RADIUS,
            destination64: None,
            next_hop: None,
        }
    }

    /// Unsecured, for devices that do not hold the network key yet
    pub fn unsecured() -> Self {
        Self {
            secured: false,
            ..Self::secured()
        }
    }
}

/// NWK layer handler
#[derive(Debug, Default)]
pub struct NwkHandler {
    discovery_requested: bool,
    last_many_to_one_ms: Option<u64>,
}

impl RouteOutcomeSink for NwkHandler {
    fn mark_route_success(&mut self, ctx: &mut StackContext, destination16: u16) {
        let now_ms = ctx.now_ms();
        ctx.routes_mut().mark_success(destination16, now_ms);
    }

    fn mark_route_failure(&mut self, ctx: &mut StackContext, destination16: u16, repair: bool) {
        if ctx.routes_mut().mark_failure(destination16) {
            debug!("Route to 0x{:04x} exhausted", destination16);
        }
        if repair {
            let purged = ctx.routes_mut().purge_relay(destination16);
            info!(
                "Repairing around 0x{:04x}: {} routes purged, requesting rediscovery",
                destination16, purged
            );
            self.discovery_requested = true;
        }
    }
}

impl NwkHandler {
    /// Create a handler
    pub fn new() -> Self {
        Self::default()
    }

    /// A many-to-one route request is wanted
    pub fn discovery_requested(&self) -> bool {
        self.discovery_requested
    }

    /// Time until the next many-to-one route request is allowed
    pub fn many_to_one_wait(&self, ctx: &StackContext) -> Duration {
        let spacing = ctx.config().timing.many_to_one_min_spacing_ms;
        match self.last_many_to_one_ms {
            Some(last) => {
                let ready = last + spacing;
                Duration::from_millis(ready.saturating_sub(ctx.now_ms()))
            }
            None => Duration::ZERO,
        }
    }

    /// Pick how to reach `destination16`
    pub fn find_best_source_route(
        &mut self,
        ctx: &mut StackContext,
        destination16: u16,
    ) -> Result<RouteChoice, RoutingError> {
        if is_broadcast(destination16) {
            return Ok(RouteChoice::Broadcast);
        }
        let neighbor = match ctx.device_by_address16(destination16) {
            Some(device) => device.neighbor,
            None => return Err(RoutingError::UnknownDestination(destination16)),
        };

        // Recorded routes outrank the neighbor flag; a neighbor's own link
        // cost is a zero-relay entry scored against its relayed routes
        if let Some(route) = ctx.select_route(destination16, false) {
            if route.relays.is_empty() {
                return Ok(RouteChoice::Direct);
            }
            return Ok(RouteChoice::Relayed(route));
        }
        if neighbor {
            return Ok(RouteChoice::Direct);
        }

        debug!("No route to 0x{:04x}, requesting discovery", destination16);
        self.discovery_requested = true;
        Ok(RouteChoice::Unknown)
    }

    /// Build, secure and transmit a NWK frame
    pub async fn send_frame(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        frame_type: NwkFrameType,
        destination16: u16,
        payload: &[u8],
        options: NwkTxOptions,
    ) -> StackResult<bool> {
        let mut header = NwkHeader::new(
            frame_type,
            destination16,
            COORDINATOR_ADDRESS,
            options.radius,
            ctx.next_nwk_sequence(),
        );
        header.destination64 = options.destination64;

        let mac_destination16 = match options.next_hop {
            Some(next_hop) => next_hop,
            None => match self.find_best_source_route(ctx, destination16)? {
                RouteChoice::Broadcast => BROADCAST_ADDRESS,
                RouteChoice::Direct | RouteChoice::Unknown => destination16,
                RouteChoice::Relayed(route) => {
                    header.source_route = Some(SourceRoute::outbound(&route.relays));
                    route.next_hop(destination16)
                }
            },
        };

        let mut buf = BytesMut::with_capacity(32 + payload.len());
        if options.secured {
            let eui64 = ctx.eui64();
            header.flags |= NwkFrameFlags::SECURITY;
            header.source64 = Some(eui64);
            header.encode(&mut buf);

            let aux = AuxSecurityHeader::network(
                ctx.next_network_frame_counter(),
                eui64,
                ctx.network_key_sequence(),
            );
            let secured = secure_payload(&buf, &aux, eui64, ctx.network_key(), payload)?;
            buf.put_slice(&secured);
        } else {
            header.encode(&mut buf);
            buf.put_slice(payload);
        }

        let mac_header = MacHeader::data(
            ctx.next_mac_sequence(),
            ctx.pan_id(),
            mac_destination16,
            COORDINATOR_ADDRESS,
        );
        let frame = encode_mac_frame(&mac_header, &buf);
        let nwk_destination16 = (!is_broadcast(destination16)).then_some(destination16);

        mac.send_frame(ctx, self, frame, mac_destination16, nwk_destination16)
            .await
    }

    /// Encode and transmit a NWK command
    pub async fn send_command(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        command: &NwkCommand,
        destination16: u16,
        options: NwkTxOptions,
    ) -> StackResult<bool> {
        let mut payload = BytesMut::with_capacity(16);
        command.encode(&mut payload);
        self.send_frame(ctx, mac, NwkFrameType::Command, destination16, &payload, options)
            .await
    }

    /// Concentrator announcement so routers record routes back to us.
    ///
    /// Returns false when the previous request is too recent.
    pub async fn send_many_to_one_route_request(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
    ) -> StackResult<bool> {
        if !self.many_to_one_wait(ctx).is_zero() {
            debug!("Many-to-one route request deferred, sent too recently");
            return Ok(false);
        }

        let command = NwkCommand::RouteRequest {
            options: ROUTE_REQUEST_MANY_TO_ONE,
            request_id: ctx.next_route_request_id(),
            destination16: BROADCAST_ROUTERS,
            path_cost: 0,
            destination64: None,
        };
        self.last_many_to_one_ms = Some(ctx.now_ms());
        self.discovery_requested = false;

        debug!("Sending many-to-one route request");
        self.send_command(ctx, mac, &command, BROADCAST_ROUTERS, NwkTxOptions::secured())
            .await
    }

    /// Broadcast our view of neighbor router links, then age them
    pub async fn send_link_status(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
    ) -> StackResult<()> {
        let max_missed = ctx.config().link_status_max_missed;
        let now_ms = ctx.now_ms();

        let mut neighbors: Vec<(u16, u64, u8)> = ctx
            .devices()
            .filter(|d| d.neighbor && d.capabilities.is_router())
            .map(|d| (d.address16, d.address64, d.missed_link_status))
            .collect();
        neighbors.sort_by_key(|(address16, _, _)| *address16);

        let entries: Vec<LinkStatusEntry> = neighbors
            .into_iter()
            .map(|(address16, address64, missed)| {
                let cost = if missed >= max_missed {
                    0
                } else {
                    let route_cost = ctx
                        .routes()
                        .best_path_cost(address16, now_ms)
                        .unwrap_or(1)
                        .clamp(1, MAX_LINK_COST);
                    let quality_cost = ctx
                        .compute_device_lqa(address64)
                        .map_or(1, lqa_to_link_cost);
                    route_cost.max(quality_cost)
                };
                LinkStatusEntry {
                    address: address16,
                    incoming_cost: cost,
                    outgoing_cost: cost,
                }
            })
            .collect();

        let chunks: Vec<&[LinkStatusEntry]> = if entries.is_empty() {
            vec![entries.as_slice()]
        } else {
            entries.chunks(MAX_LINK_STATUS_ENTRIES).collect()
        };
        let last = chunks.len() - 1;
        let options = NwkTxOptions {
            radius: 1,
            ..NwkTxOptions::secured()
        };

        for (index, chunk) in chunks.into_iter().enumerate() {
            let command = NwkCommand::LinkStatus {
                first_frame: index == 0,
                last_frame: index == last,
                entries: chunk.to_vec(),
            };
            self.send_command(ctx, mac, &command, BROADCAST_ROUTERS, options)
                .await?;
        }
        debug!("Link status sent ({} neighbors)", entries.len());

        ctx.age_neighbor_links();
        Ok(())
    }

    /// Ask a device to leave, optionally rejoining afterwards
    pub async fn send_leave_request(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        destination16: u16,
        destination64: u64,
        rejoin: bool,
    ) -> StackResult<bool> {
        let mut options = LeaveOptions::REQUEST;
        if rejoin {
            options |= LeaveOptions::REJOIN;
        }
        info!(
            "Requesting {:016x} (0x{:04x}) to leave (rejoin: {})",
            destination64, destination16, rejoin
        );
        self.send_command(
            ctx,
            mac,
            &NwkCommand::Leave { options },
            destination16,
            NwkTxOptions {
                destination64: Some(destination64),
                ..NwkTxOptions::secured()
            },
        )
        .await
    }

    /// Handle an inbound NWK command.
    ///
    /// `source64` is the sender's IEEE address from the NWK or security
    /// header, when one was present.
    pub async fn process_command(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        mac_header: &MacHeader,
        header: &NwkHeader,
        source64: Option<u64>,
        command: NwkCommand,
    ) -> StackResult<Option<KeyDelivery>> {
        let source16 = header.source16;
        let source64 = header
            .source64
            .or(source64)
            .or_else(|| ctx.address64_of(source16));
        let previous_hop = mac_header.source.short();

        match command {
            NwkCommand::RouteRequest {
                options,
                request_id,
                destination16,
                path_cost,
                destination64,
            } => {
                let for_us = destination16 == COORDINATOR_ADDRESS
                    || destination64 == Some(ctx.eui64());
                if options & ROUTE_REQUEST_MANY_TO_ONE != 0 || !for_us {
                    debug!(
                        "Ignoring route request {} from 0x{:04x} for 0x{:04x}",
                        request_id, source16, destination16
                    );
                    return Ok(None);
                }
                let Some(previous_hop) = previous_hop else {
                    return Ok(None);
                };

                let reply = NwkCommand::RouteReply {
                    options: ROUTE_REPLY_RESPONDER_IEEE,
                    request_id,
                    originator16: source16,
                    responder16: COORDINATOR_ADDRESS,
                    path_cost,
                    originator64: None,
                    responder64: Some(ctx.eui64()),
                };
                debug!(
                    "Answering route request {} from 0x{:04x} via 0x{:04x}",
                    request_id, source16, previous_hop
                );
                self.send_command(
                    ctx,
                    mac,
                    &reply,
                    previous_hop,
                    NwkTxOptions {
                        radius: 1,
                        next_hop: Some(previous_hop),
                        ..NwkTxOptions::secured()
                    },
                )
                .await?;
            }
            NwkCommand::RouteReply {
                originator16,
                responder16,
                path_cost,
                ..
            } => {
                if originator16 != COORDINATOR_ADDRESS {
                    return Ok(None);
                }
                let now_ms = ctx.now_ms();
                let relays: Vec<u16> = previous_hop
                    .filter(|hop| *hop != responder16)
                    .into_iter()
                    .collect();
                ctx.routes_mut()
                    .add_route(responder16, &relays, path_cost.max(1), now_ms);
                debug!(
                    "Route reply: 0x{:04x} reachable via {:?} (cost {})",
                    responder16, relays, path_cost
                );
            }
            NwkCommand::NetworkStatus {
                status,
                destination16,
            } => {
                if status == NwkStatusCode::AddressConflict {
                    self.resolve_address_conflict(ctx, mac, destination16).await?;
                } else if status.is_routing_failure() {
                    info!(
                        "Network status {:?} for 0x{:04x} from 0x{:04x}",
                        status, destination16, source16
                    );
                    self.mark_route_failure(ctx, destination16, true);
                } else {
                    debug!(
                        "Network status {:?} for 0x{:04x} from 0x{:04x}",
                        status, destination16, source16
                    );
                }
            }
            NwkCommand::Leave { options } => {
                if options.contains(LeaveOptions::REQUEST) {
                    debug!("Ignoring leave request addressed to the coordinator");
                } else if options.contains(LeaveOptions::REJOIN) {
                    info!("Device 0x{:04x} leaving to rejoin", source16);
                } else if let Some(address64) = source64 {
                    ctx.disassociate(address64);
                }
            }
            NwkCommand::RouteRecord { relays } => {
                let now_ms = ctx.now_ms();
                let path_cost = (relays.len() + 1).min(u8::MAX as usize) as u8;
                ctx.routes_mut()
                    .add_route(source16, &relays, path_cost, now_ms);
                debug!("Route record from 0x{:04x}: {:?}", source16, relays);
            }
            NwkCommand::RejoinRequest { capabilities } => {
                let Some(address64) = source64 else {
                    warn!("Rejoin request from 0x{:04x} without IEEE address", source16);
                    return Ok(None);
                };
                return self
                    .process_rejoin_request(
                        ctx,
                        mac,
                        header,
                        previous_hop.unwrap_or(source16),
                        address64,
                        capabilities,
                    )
                    .await;
            }
            NwkCommand::LinkStatus { entries, .. } => {
                self.harvest_link_status(ctx, source16, &entries);
            }
            NwkCommand::EndDeviceTimeoutRequest {
                timeout_index,
                configuration,
            } => {
                let accepted = source64
                    .and_then(|a| ctx.set_end_device_timeout(a, timeout_index, configuration))
                    .is_some();
                let response = NwkCommand::EndDeviceTimeoutResponse {
                    status: if accepted {
                        ED_TIMEOUT_SUCCESS
                    } else {
                        ED_TIMEOUT_INCORRECT_VALUE
                    },
                    parent_info: ED_KEEPALIVE_MAC_DATA_POLL | ED_KEEPALIVE_TIMEOUT_REQUEST,
                };
                self.send_command(ctx, mac, &response, source16, NwkTxOptions::secured())
                    .await?;
            }
            NwkCommand::CommissioningRequest {
                association_type,
                capabilities,
                tlvs,
            } => {
                let Some(address64) = source64 else {
                    warn!("Commissioning request from 0x{:04x} without IEEE address", source16);
                    return Ok(None);
                };
                if !tlvs.is_empty() {
                    debug!("Ignoring {} bytes of commissioning TLVs", tlvs.len());
                }
                let rejoin = association_type != 0;
                let outcome = ctx.associate(AssociationRequest {
                    address16: rejoin.then_some(source16),
                    rejoin,
                    ..AssociationRequest::join(address64, capabilities)
                });

                let response = NwkCommand::CommissioningResponse {
                    network_address: outcome.address16,
                    status: outcome.status,
                };
                self.send_command(
                    ctx,
                    mac,
                    &response,
                    source16,
                    NwkTxOptions {
                        secured: header.is_secured(),
                        destination64: Some(address64),
                        next_hop: Some(previous_hop.unwrap_or(source16)),
                        ..NwkTxOptions::secured()
                    },
                )
                .await?;

                if outcome.is_success() && outcome.requires_transport_key {
                    return Ok(Some(KeyDelivery {
                        address16: outcome.address16,
                        address64,
                        via_parent: None,
                    }));
                }
            }
            other => {
                debug!("Ignoring NWK command {:?} from 0x{:04x}", other.id(), source16);
            }
        }
        Ok(None)
    }

    async fn process_rejoin_request(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        header: &NwkHeader,
        previous_hop: u16,
        address64: u64,
        capabilities: MacCapabilities,
    ) -> StackResult<Option<KeyDelivery>> {
        let secured = header.is_secured();
        let deny = !secured && !ctx.allows_trust_center_rejoin(address64);
        let outcome = ctx.associate(AssociationRequest {
            address16: Some(header.source16),
            rejoin: true,
            deny_override: deny,
            allow_override: secured,
            ..AssociationRequest::join(address64, capabilities)
        });
        info!(
            "Rejoin of {:016x} (secured: {}): {:?} as 0x{:04x}",
            address64, secured, outcome.status, outcome.address16
        );

        let response = NwkCommand::RejoinResponse {
            network_address: outcome.address16,
            status: outcome.status,
        };
        self.send_command(
            ctx,
            mac,
            &response,
            header.source16,
            NwkTxOptions {
                secured,
                destination64: Some(address64),
                next_hop: Some(previous_hop),
                ..NwkTxOptions::secured()
            },
        )
        .await?;

        if outcome.status != MacAssociationStatus::Success {
            return Ok(None);
        }
        ctx.emit(StackEvent::DeviceRejoined {
            address16: outcome.address16,
            address64,
            secured,
        });

        if !secured || outcome.requires_transport_key {
            return Ok(Some(KeyDelivery {
                address16: outcome.address16,
                address64,
                via_parent: None,
            }));
        }
        Ok(None)
    }

    fn harvest_link_status(
        &mut self,
        ctx: &mut StackContext,
        source16: u16,
        entries: &[LinkStatusEntry],
    ) {
        if ctx.device_by_address16(source16).is_none() {
            debug!("Link status from unknown router 0x{:04x}", source16);
            return;
        }
        ctx.set_neighbor(source16, true);
        ctx.reset_missed_link_status(source16);

        let now_ms = ctx.now_ms();
        let own_cost = entries
            .iter()
            .find(|e| e.address == COORDINATOR_ADDRESS)
            .map(|e| e.incoming_cost.max(e.outgoing_cost))
            .filter(|cost| *cost > 0)
            .unwrap_or(MAX_LINK_COST);
        ctx.routes_mut().add_route(source16, &[], own_cost, now_ms);

        for entry in entries {
            if entry.address == COORDINATOR_ADDRESS || entry.outgoing_cost == 0 {
                continue;
            }
            let reachable_directly = ctx
                .device_by_address16(entry.address)
                .map_or(true, |d| d.neighbor);
            if reachable_directly {
                continue;
            }
            let cost = own_cost.saturating_add(entry.outgoing_cost);
            ctx.routes_mut()
                .add_route(entry.address, &[source16], cost, now_ms);
        }
    }

    async fn resolve_address_conflict(
        &mut self,
        ctx: &mut StackContext,
        mac: &mut MacHandler,
        address16: u16,
    ) -> StackResult<()> {
        let Some(address64) = ctx.address64_of(address16) else {
            debug!("Address conflict reported for unknown 0x{:04x}", address16);
            return Ok(());
        };
        if address16 == COORDINATOR_ADDRESS {
            warn!("Address conflict reported on the coordinator address");
            return Ok(());
        }
        if let Some(new16) = ctx.reassign_address(address64) {
            warn!(
                "Address conflict on 0x{:04x}, {:016x} moved to 0x{:04x}",
                address16, address64, new16
            );
        }
        let status = NwkCommand::NetworkStatus {
            status: NwkStatusCode::AddressConflict,
            destination16: address16,
        };
        self.send_command(ctx, mac, &status, BROADCAST_RX_ON_WHEN_IDLE, NwkTxOptions::secured())
            .await?;
        Ok(())
    }
}
