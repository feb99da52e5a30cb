//! Shared coordinator state.
//!
//! `StackContext` is the single owner of everything the protocol handlers
//! share: network parameters and keys, the device table with its bijective
//! address translation, the source-route table, counters, link quality
//! history, transient association/indirect queues and persistence. Handlers
//! receive `&mut StackContext` and go through its methods; no table is
//! handed out for direct mutation outside the crate.

use crate::config::{InstallCodePolicy, StackConfig, TrustCenterPolicies};
use crate::device::{end_device_timeout_ms, Device, DeviceTable, EndDeviceTimeout};
use crate::error::StackResult;
use crate::events::StackEvent;
use crate::link_quality::{compute_lqa, map_rssi_to_lqi, LinkSample};
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zb_routing::failure_tracker::{DEFAULT_NO_ACK_THRESHOLD, DEFAULT_NO_ACK_WINDOW_MS};
use zb_routing::{NoAckTracker, SourceRouteEntry, SourceRouteTable};
use zb_storage::{
    NetworkParameters, PersistedDevice, PersistedLinkKey, PersistedRoute, PersistedState,
    StateStore,
};
use zb_wire::nwk::{COORDINATOR_ADDRESS, MAX_UNICAST_ADDRESS};
use zb_wire::security::WELL_KNOWN_TC_LINK_KEY;
use zb_wire::{Key, MacAssociationStatus, MacCapabilities};

/// Counters closer than this to the wrap point may restart from zero
const FRAME_COUNTER_WRAP_WINDOW: u32 = 0x1000;

/// Deferred association response, sent on the device's next poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAssociation {
    /// Address given to the device
    pub address16: u16,
    /// Association outcome
    pub status: MacAssociationStatus,
    /// Network key still has to be delivered after the response
    pub requires_transport_key: bool,
    /// When the request was processed
    pub created_ms: u64,
}

/// Frame waiting for a poll from a device with its receiver off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectFrame {
    /// Complete MAC frame
    pub frame: Bytes,
    /// MAC destination
    pub destination16: u16,
    /// When the frame was queued
    pub queued_at_ms: u64,
}

/// Input to [`StackContext::associate`]
#[derive(Debug, Clone, Copy)]
pub struct AssociationRequest {
    /// Short address the device claims, if any
    pub address16: Option<u16>,
    /// IEEE address
    pub address64: u64,
    /// Rejoin rather than first join
    pub rejoin: bool,
    /// MAC capabilities
    pub capabilities: MacCapabilities,
    /// Request reached us directly
    pub neighbor: bool,
    /// Router the device joined through
    pub parent16: Option<u16>,
    /// Deny regardless of policy
    pub deny_override: bool,
    /// Allow even while the join window is closed
    pub allow_override: bool,
}

impl AssociationRequest {
    /// First join heard directly
    pub fn join(address64: u64, capabilities: MacCapabilities) -> Self {
        Self {
            address16: None,
            address64,
            rejoin: false,
            capabilities,
            neighbor: true,
            parent16: None,
            deny_override: false,
            allow_override: false,
        }
    }
}

/// Result of [`StackContext::associate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationOutcome {
    /// Status returned to the device
    pub status: MacAssociationStatus,
    /// Assigned short address (`0xffff` when denied)
    pub address16: u16,
    /// The caller must still deliver the network key
    pub requires_transport_key: bool,
}

impl AssociationOutcome {
    fn denied() -> Self {
        Self {
            status: MacAssociationStatus::PanAccessDenied,
            address16: 0xffff,
            requires_transport_key: false,
        }
    }

    /// Whether the device was accepted
    pub fn is_success(&self) -> bool {
        self.status == MacAssociationStatus::Success
    }
}

/// Single owner of the coordinator's mutable state
pub struct StackContext {
    config: StackConfig,
    network: NetworkParameters,
    pending_network_key: Option<(Key, u8)>,
    devices: DeviceTable,
    routes: SourceRouteTable,
    no_ack: NoAckTracker,
    app_link_keys: HashMap<(u64, u64), Key>,
    pending_associations: HashMap<u64, PendingAssociation>,
    indirect: HashMap<u64, VecDeque<IndirectFrame>>,
    mac_sequence: u8,
    nwk_sequence: u8,
    aps_counter: u8,
    route_request_id: u8,
    network_counter_ceiling: u32,
    tc_counter_ceiling: u32,
    permit_join_until_ms: Option<u64>,
    mac_association_permit: bool,
    clock_base_ms: u64,
    clock_start: Instant,
    store: Arc<dyn StateStore>,
    events: mpsc::UnboundedSender<StackEvent>,
    save_requested: bool,
}

fn canonical_pair(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl StackContext {
    /// Build the context from loaded (or freshly formed) state
    pub fn new(
        config: StackConfig,
        state: PersistedState,
        store: Arc<dyn StateStore>,
        events: mpsc::UnboundedSender<StackEvent>,
    ) -> Self {
        let clock_base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut devices = DeviceTable::default();
        let mut routes = SourceRouteTable::new(config.routing.clone());
        for persisted in &state.devices {
            let mut device = Device::new(
                persisted.address64,
                persisted.address16,
                MacCapabilities::from_bits_truncate(persisted.capabilities),
            );
            device.authorized = persisted.authorized;
            device.neighbor = persisted.neighbor;
            device.parent16 = persisted.parent16;
            device.last_key_sequence = persisted.last_key_sequence;
            device.incoming_frame_counter = persisted.incoming_frame_counter;

            if devices.is_address16_used(device.address16) {
                warn!(
                    "Persisted device {:016x} reuses address 0x{:04x}, dropping it",
                    device.address64, device.address16
                );
                continue;
            }

            for route in &persisted.routes {
                routes.insert_entry(
                    persisted.address16,
                    SourceRouteEntry::new(
                        route.relays.iter().copied().collect(),
                        route.path_cost,
                        route.last_updated_ms,
                    ),
                );
            }

            devices.insert(device);
        }

        let app_link_keys = state
            .app_link_keys
            .iter()
            .map(|k| (canonical_pair(k.device_a, k.device_b), k.key))
            .collect();

        info!(
            "Loaded coordinator state: {} devices, {} routes, PAN 0x{:04x} channel {}",
            devices.len(),
            routes.len(),
            state.network.pan_id,
            state.network.channel
        );

        let mut rng = rand::thread_rng();
        Self {
            network_counter_ceiling: state.network.network_key_frame_counter,
            tc_counter_ceiling: state.network.tc_key_frame_counter,
            network: state.network,
            config,
            pending_network_key: None,
            devices,
            routes,
            no_ack: NoAckTracker::new(DEFAULT_NO_ACK_THRESHOLD, DEFAULT_NO_ACK_WINDOW_MS),
            app_link_keys,
            pending_associations: HashMap::new(),
            indirect: HashMap::new(),
            mac_sequence: rng.gen(),
            nwk_sequence: rng.gen(),
            aps_counter: rng.gen(),
            route_request_id: rng.gen(),
            permit_join_until_ms: None,
            mac_association_permit: false,
            clock_base_ms,
            clock_start: Instant::now(),
            store,
            events,
            save_requested: false,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Trust Center policies
    pub fn policies(&self) -> &TrustCenterPolicies {
        &self.config.policies
    }

    /// Replace the Trust Center policies
    pub fn set_policies(&mut self, policies: TrustCenterPolicies) {
        self.config.policies = policies;
    }

    /// Network parameters
    pub fn network(&self) -> &NetworkParameters {
        &self.network
    }

    /// Coordinator IEEE address
    pub fn eui64(&self) -> u64 {
        self.network.eui64
    }

    /// PAN identifier
    pub fn pan_id(&self) -> u16 {
        self.network.pan_id
    }

    /// Milliseconds since the Unix epoch, advanced by the tokio clock
    pub fn now_ms(&self) -> u64 {
        self.clock_base_ms + self.clock_start.elapsed().as_millis() as u64
    }

    /// Deliver an event to the application
    pub fn emit(&self, event: StackEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    // Counters

    /// Next MAC sequence number
    pub fn next_mac_sequence(&mut self) -> u8 {
        self.mac_sequence = self.mac_sequence.wrapping_add(1);
        self.mac_sequence
    }

    /// Next NWK sequence number
    pub fn next_nwk_sequence(&mut self) -> u8 {
        self.nwk_sequence = self.nwk_sequence.wrapping_add(1);
        self.nwk_sequence
    }

    /// Next APS counter
    pub fn next_aps_counter(&mut self) -> u8 {
        self.aps_counter = self.aps_counter.wrapping_add(1);
        self.aps_counter
    }

    /// Next route request identifier
    pub fn next_route_request_id(&mut self) -> u8 {
        self.route_request_id = self.route_request_id.wrapping_add(1);
        self.route_request_id
    }

    /// Frame counter for the next NWK-secured frame
    pub fn next_network_frame_counter(&mut self) -> u32 {
        let counter = self.network.network_key_frame_counter;
        self.network.network_key_frame_counter = counter.wrapping_add(1);
        if self.network.network_key_frame_counter >= self.network_counter_ceiling {
            self.save_requested = true;
        }
        counter
    }

    /// Frame counter for the next APS frame secured with a link key
    pub fn next_tc_frame_counter(&mut self) -> u32 {
        let counter = self.network.tc_key_frame_counter;
        self.network.tc_key_frame_counter = counter.wrapping_add(1);
        if self.network.tc_key_frame_counter >= self.tc_counter_ceiling {
            self.save_requested = true;
        }
        counter
    }

    // Addresses

    /// Random unused unicast short address
    pub fn allocate_address(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(1..=MAX_UNICAST_ADDRESS);
            if candidate != COORDINATOR_ADDRESS && !self.devices.is_address16_used(candidate) {
                return candidate;
            }
        }
    }

    /// Device by IEEE address
    pub fn device(&self, address64: u64) -> Option<&Device> {
        self.devices.get(address64)
    }

    /// Device by short address
    pub fn device_by_address16(&self, address16: u16) -> Option<&Device> {
        self.devices.get_by_address16(address16)
    }

    /// Short to IEEE translation
    pub fn address64_of(&self, address16: u16) -> Option<u64> {
        if address16 == COORDINATOR_ADDRESS {
            return Some(self.network.eui64);
        }
        self.devices.address64_of(address16)
    }

    /// IEEE to short translation
    pub fn address16_of(&self, address64: u64) -> Option<u16> {
        if address64 == self.network.eui64 {
            return Some(COORDINATOR_ADDRESS);
        }
        self.devices.get(address64).map(|d| d.address16)
    }

    /// All known devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Number of known devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Give a device a fresh short address, e.g. after an address conflict
    pub fn reassign_address(&mut self, address64: u64) -> Option<u16> {
        self.devices.get(address64)?;
        let new16 = self.allocate_address();
        let old16 = self.devices.readdress(address64, new16)?;
        self.routes.rename_destination(old16, new16);
        self.routes.purge_relay(old16);
        self.no_ack.forget(old16);
        if let Some(queue) = self.indirect.get_mut(&address64) {
            for frame in queue.iter_mut() {
                frame.destination16 = new16;
            }
        }
        info!(
            "Reassigned {:016x} from 0x{:04x} to 0x{:04x}",
            address64, old16, new16
        );
        self.request_save();
        Some(new16)
    }

    // End device timeouts

    /// Record a timeout negotiation; returns the timeout in ms, or None for an invalid index
    pub fn set_end_device_timeout(
        &mut self,
        address64: u64,
        index: u8,
        configuration: u8,
    ) -> Option<u64> {
        let timeout_ms = end_device_timeout_ms(index)?;
        let now_ms = self.now_ms();
        let device = self.devices.get_mut(address64)?;
        device.end_device_timeout = Some(EndDeviceTimeout {
            index,
            configuration,
            timeout_ms,
            last_keepalive_ms: now_ms,
        });
        debug!(
            "End device {:016x} timeout index {} ({} ms)",
            address64, index, timeout_ms
        );
        Some(timeout_ms)
    }

    /// Refresh an end device keepalive
    pub fn touch_end_device(&mut self, address64: u64) {
        let now_ms = self.now_ms();
        if let Some(timeout) = self
            .devices
            .get_mut(address64)
            .and_then(|d| d.end_device_timeout.as_mut())
        {
            timeout.last_keepalive_ms = now_ms;
        }
    }

    // Replay protection

    /// Accept or reject an incoming NWK security frame counter, storing it when accepted
    pub fn validate_incoming_frame_counter(&mut self, address64: u64, frame_counter: u32) -> bool {
        let Some(device) = self.devices.get_mut(address64) else {
            return true;
        };

        let accept = match device.incoming_frame_counter {
            None => true,
            Some(last) if frame_counter > last => true,
            Some(last) => {
                last > u32::MAX - FRAME_COUNTER_WRAP_WINDOW
                    && frame_counter < FRAME_COUNTER_WRAP_WINDOW
            }
        };

        if accept {
            device.incoming_frame_counter = Some(frame_counter);
        } else {
            debug!(
                "Replayed frame counter {} from {:016x} (last {:?})",
                frame_counter, address64, device.incoming_frame_counter
            );
        }
        accept
    }

    // Link quality

    /// Record a reception; returns the LQA of this frame
    pub fn record_link_sample(&mut self, address64: Option<u64>, rssi: i8) -> u8 {
        let lq = &self.config.link_quality;
        let lqi = map_rssi_to_lqi(rssi, lq.rssi_min, lq.rssi_max);
        let lqa = compute_lqa(rssi, Some(lqi), lq.rssi_min, lq.rssi_max);
        let capacity = lq.max_recent_samples;

        if let Some(device) = address64.and_then(|a| self.devices.get_mut(a)) {
            device.link_quality.push(LinkSample { rssi, lqi }, capacity);
        }
        lqa
    }

    /// Composite LQA over a device's recent receptions
    pub fn compute_device_lqa(&self, address64: u64) -> Option<u8> {
        let lq = &self.config.link_quality;
        self.devices
            .get(address64)?
            .link_quality
            .lqa(lq.max_recent_samples, lq.rssi_min, lq.rssi_max)
    }

    // Network key

    /// Active network key
    pub fn network_key(&self) -> &Key {
        &self.network.network_key
    }

    /// Active network key sequence number
    pub fn network_key_sequence(&self) -> u8 {
        self.network.network_key_sequence
    }

    /// Trust Center link key
    pub fn tc_key(&self) -> &Key {
        &self.network.tc_key
    }

    /// Key staged by a TRANSPORT_KEY, awaiting SWITCH_KEY
    pub fn pending_network_key(&self) -> Option<(Key, u8)> {
        self.pending_network_key
    }

    /// Stage a new network key
    pub fn stage_pending_network_key(&mut self, key: Key, sequence: u8) {
        info!("Staged network key sequence {}", sequence);
        self.pending_network_key = Some((key, sequence));
    }

    /// Switch to the staged key if its sequence matches; otherwise nothing changes
    pub fn activate_pending_network_key(&mut self, sequence: u8) -> bool {
        match self.pending_network_key {
            Some((key, staged)) if staged == sequence => {
                self.network.network_key = key;
                self.network.network_key_sequence = sequence;
                self.network.network_key_frame_counter = 0;
                self.network_counter_ceiling = 0;
                self.pending_network_key = None;
                info!("Activated network key sequence {}", sequence);
                self.request_save();
                true
            }
            _ => {
                warn!(
                    "No staged network key for sequence {}, keeping sequence {}",
                    sequence, self.network.network_key_sequence
                );
                false
            }
        }
    }

    /// Active or staged key with this sequence number
    pub fn network_key_for_sequence(&self, sequence: u8) -> Option<Key> {
        if sequence == self.network.network_key_sequence {
            return Some(self.network.network_key);
        }
        match self.pending_network_key {
            Some((key, staged)) if staged == sequence => Some(key),
            _ => None,
        }
    }

    // Association

    /// Single decision point for joins, rejoins and commissioning
    pub fn associate(&mut self, request: AssociationRequest) -> AssociationOutcome {
        let existing = self.devices.get(request.address64).cloned();

        // Admission
        if request.deny_override {
            info!("Denied association of {:016x} (override)", request.address64);
            return AssociationOutcome::denied();
        }
        let admitted = request.allow_override
            || self.permit_joining()
            || (request.rejoin && existing.is_some());
        if !admitted {
            info!(
                "Denied association of {:016x}: joining not permitted",
                request.address64
            );
            return AssociationOutcome::denied();
        }

        // Address selection
        let usable = |ctx: &Self, address16: u16| {
            address16 != COORDINATOR_ADDRESS
                && address16 <= MAX_UNICAST_ADDRESS
                && ctx
                    .devices
                    .address64_of(address16)
                    .map_or(true, |owner| owner == request.address64)
        };
        let mut address16 = match (request.address16, &existing) {
            (Some(claimed), _) if usable(self, claimed) => claimed,
            (_, Some(device)) => device.address16,
            _ => self.allocate_address(),
        };
        if !usable(self, address16) {
            let reassigned = self.allocate_address();
            warn!(
                "Address 0x{:04x} collides for {:016x}, assigning 0x{:04x}",
                address16, request.address64, reassigned
            );
            address16 = reassigned;
        }

        // Device entry
        let now_ms = self.now_ms();
        match existing {
            Some(ref previous) => {
                if previous.address16 != address16 {
                    self.devices.readdress(request.address64, address16);
                    self.routes.rename_destination(previous.address16, address16);
                    self.no_ack.forget(previous.address16);
                }
                if let Some(device) = self.devices.get_mut(request.address64) {
                    device.capabilities = request.capabilities;
                    device.neighbor = request.neighbor;
                    device.parent16 = if request.neighbor { None } else { request.parent16 };
                    device.missed_link_status = 0;
                    if !request.rejoin {
                        device.authorized = false;
                    }
                }
            }
            None => {
                let mut device = Device::new(request.address64, address16, request.capabilities);
                device.neighbor = request.neighbor;
                device.parent16 = if request.neighbor { None } else { request.parent16 };
                self.devices.insert(device);
            }
        }
        if !request.neighbor {
            if let Some(parent16) = request.parent16 {
                self.routes.add_route(address16, &[parent16], 2, now_ms);
            }
        }

        // Key delivery
        let current_sequence = self.network.network_key_sequence;
        let requires_transport_key = match &existing {
            None => true,
            Some(previous) => {
                !request.rejoin || previous.last_key_sequence != Some(current_sequence)
            }
        };

        // Devices with the receiver off are served through polls
        if request.neighbor && !request.capabilities.rx_on_when_idle() {
            self.indirect.entry(request.address64).or_default();
        } else {
            self.indirect.remove(&request.address64);
        }

        if existing.is_none() {
            info!(
                "Device {:016x} joined as 0x{:04x} (neighbor: {})",
                request.address64, address16, request.neighbor
            );
            self.emit(StackEvent::DeviceJoined {
                address16,
                address64: request.address64,
                parent16: if request.neighbor { None } else { request.parent16 },
            });
        } else {
            debug!(
                "Device {:016x} re-associated as 0x{:04x} (rejoin: {})",
                request.address64, address16, request.rejoin
            );
        }

        // Topology changed
        self.request_save();

        AssociationOutcome {
            status: MacAssociationStatus::Success,
            address16,
            requires_transport_key,
        }
    }

    /// Forget a device entirely
    pub fn disassociate(&mut self, address64: u64) -> Option<Device> {
        let device = self.devices.remove(address64)?;
        self.routes.remove_destination(device.address16);
        self.routes.purge_relay(device.address16);
        self.no_ack.forget(device.address16);
        self.pending_associations.remove(&address64);
        self.indirect.remove(&address64);
        self.app_link_keys
            .retain(|(a, b), _| *a != address64 && *b != address64);

        info!(
            "Device {:016x} (0x{:04x}) left the network",
            address64, device.address16
        );
        self.emit(StackEvent::DeviceLeft {
            address16: device.address16,
            address64,
        });
        self.request_save();
        Some(device)
    }

    /// Whether an unsecured rejoin may be answered with the network key.
    ///
    /// Only devices that already verified their link key qualify, and not at
    /// all while the well-known key is in use and such rejoins are disabled.
    pub fn allows_trust_center_rejoin(&self, address64: u64) -> bool {
        let authorized = self.devices.get(address64).map_or(false, |d| d.authorized);
        let well_known_blocked = self.network.tc_key == WELL_KNOWN_TC_LINK_KEY
            && !self.config.policies.allow_rejoins_with_well_known_key;
        authorized && !well_known_blocked
    }

    /// Mark a device as having verified its link key
    pub fn authorize(&mut self, address64: u64) -> bool {
        let Some(device) = self.devices.get_mut(address64) else {
            return false;
        };
        let address16 = device.address16;
        let newly = !device.authorized;
        device.authorized = true;
        if newly {
            info!("Device {:016x} authorized", address64);
            self.emit(StackEvent::DeviceAuthorized {
                address16,
                address64,
            });
            self.request_save();
        }
        true
    }

    /// Record that a network key was handed to a device
    pub fn mark_key_delivered(&mut self, address64: u64, sequence: u8) {
        if let Some(device) = self.devices.get_mut(address64) {
            device.last_key_sequence = Some(sequence);
            self.save_requested = true;
        }
    }

    /// Update the neighbor flag of a device
    pub fn set_neighbor(&mut self, address16: u16, neighbor: bool) {
        if let Some(device) = self.devices.get_by_address16_mut(address16) {
            if device.neighbor != neighbor {
                device.neighbor = neighbor;
                if neighbor {
                    device.parent16 = None;
                }
            }
        }
    }

    /// Count one link status period against every neighbor
    pub fn age_neighbor_links(&mut self) {
        for device in self.devices.iter_mut().filter(|d| d.neighbor) {
            device.missed_link_status = device.missed_link_status.saturating_add(1);
        }
    }

    /// A neighbor was heard from
    pub fn reset_missed_link_status(&mut self, address16: u16) {
        if let Some(device) = self.devices.get_by_address16_mut(address16) {
            device.missed_link_status = 0;
        }
    }

    // Application link keys

    /// Key shared by a device pair, in either order
    pub fn app_link_key(&self, a: u64, b: u64) -> Option<Key> {
        self.app_link_keys.get(&canonical_pair(a, b)).copied()
    }

    /// Store a pair key
    pub fn set_app_link_key(&mut self, a: u64, b: u64, key: Key) {
        self.app_link_keys.insert(canonical_pair(a, b), key);
        self.request_save();
    }

    /// Whether the pair is on the approved list
    pub fn is_approved_app_key_pair(&self, a: u64, b: u64) -> bool {
        let wanted = canonical_pair(a, b);
        self.config
            .policies
            .approved_app_key_pairs
            .iter()
            .any(|(x, y)| canonical_pair(*x, *y) == wanted)
    }

    // Join window

    /// Open the join window for `duration`
    pub fn open_join_window(&mut self, duration: Duration, mac_association_permit: bool) {
        let until = self.now_ms() + duration.as_millis() as u64;
        self.permit_join_until_ms = Some(until);
        self.mac_association_permit = mac_association_permit;
        info!(
            "Join window open for {} s (MAC association permit: {})",
            duration.as_secs(),
            mac_association_permit
        );
    }

    /// Close the join window
    pub fn close_join_window(&mut self) {
        if self.permit_join_until_ms.take().is_some() {
            info!("Join window closed");
        }
        self.mac_association_permit = false;
    }

    /// Whether new devices may join right now
    pub fn permit_joining(&self) -> bool {
        if self.config.policies.install_code == InstallCodePolicy::Required {
            return false;
        }
        self.permit_join_until_ms
            .map_or(false, |until| self.now_ms() < until)
    }

    /// Association permit bit advertised in beacons
    pub fn mac_association_permit(&self) -> bool {
        self.mac_association_permit && self.permit_joining()
    }

    // Pending associations and indirect queue

    /// Hold an association response until the device polls
    pub fn store_pending_association(&mut self, address64: u64, pending: PendingAssociation) {
        self.pending_associations.insert(address64, pending);
    }

    /// Take a pending association response that has not expired
    pub fn take_pending_association(&mut self, address64: u64) -> Option<PendingAssociation> {
        let pending = self.pending_associations.remove(&address64)?;
        let age = self.now_ms().saturating_sub(pending.created_ms);
        if age > self.config.timing.indirect_timeout_ms {
            debug!(
                "Pending association for {:016x} expired after {} ms",
                address64, age
            );
            return None;
        }
        Some(pending)
    }

    /// Whether frames to this device are held for polls
    pub fn is_indirect(&self, address64: u64) -> bool {
        self.indirect.contains_key(&address64)
    }

    /// Queue a frame for the device's next poll
    pub fn queue_indirect(&mut self, address64: u64, frame: Bytes, destination16: u16) {
        let queued_at_ms = self.now_ms();
        self.indirect
            .entry(address64)
            .or_default()
            .push_back(IndirectFrame {
                frame,
                destination16,
                queued_at_ms,
            });
    }

    /// Oldest unexpired frame for a polling device
    pub fn pop_indirect(&mut self, address64: u64) -> Option<IndirectFrame> {
        let now_ms = self.now_ms();
        let timeout_ms = self.config.timing.indirect_timeout_ms;
        let queue = self.indirect.get_mut(&address64)?;
        while let Some(frame) = queue.pop_front() {
            if now_ms.saturating_sub(frame.queued_at_ms) <= timeout_ms {
                return Some(frame);
            }
            debug!("Indirect frame for {:016x} expired", address64);
        }
        None
    }

    /// Number of frames held for a device
    pub fn indirect_len(&self, address64: u64) -> usize {
        self.indirect.get(&address64).map_or(0, |q| q.len())
    }

    /// Drop expired pending associations and indirect frames, and stale routing data
    pub fn expire_transients(&mut self) {
        let now_ms = self.now_ms();
        let timeout_ms = self.config.timing.indirect_timeout_ms;

        self.pending_associations
            .retain(|_, p| now_ms.saturating_sub(p.created_ms) <= timeout_ms);
        for queue in self.indirect.values_mut() {
            queue.retain(|f| now_ms.saturating_sub(f.queued_at_ms) <= timeout_ms);
        }
        self.no_ack.cleanup(now_ms);
    }

    // Routing state

    pub(crate) fn routes(&self) -> &SourceRouteTable {
        &self.routes
    }

    pub(crate) fn routes_mut(&mut self) -> &mut SourceRouteTable {
        &mut self.routes
    }

    pub(crate) fn no_ack(&self) -> &NoAckTracker {
        &self.no_ack
    }

    pub(crate) fn no_ack_mut(&mut self) -> &mut NoAckTracker {
        &mut self.no_ack
    }

    /// Route selection with the no-ACK tracker as relay filter
    pub(crate) fn select_route(
        &mut self,
        destination16: u16,
        ignore_staleness: bool,
    ) -> Option<zb_routing::SelectedRoute> {
        let now_ms = self.now_ms();
        let no_ack = &self.no_ack;
        self.routes.select(destination16, now_ms, ignore_staleness, |relay| {
            no_ack.is_unreliable(relay)
        })
    }

    // Persistence

    /// Ask for a save at the end of the current step
    pub fn request_save(&mut self) {
        self.save_requested = true;
    }

    /// Whether a save is outstanding
    pub fn save_requested(&self) -> bool {
        self.save_requested
    }

    /// Snapshot for the store, with outgoing counters advanced by the save margin
    pub fn to_persisted(&self) -> PersistedState {
        let margin = self.config.frame_counter_save_margin;
        let mut network = self.network.clone();
        network.network_key_frame_counter =
            network.network_key_frame_counter.saturating_add(margin);
        network.tc_key_frame_counter = network.tc_key_frame_counter.saturating_add(margin);

        let mut devices: Vec<PersistedDevice> = self
            .devices
            .iter()
            .map(|device| PersistedDevice {
                address64: device.address64,
                address16: device.address16,
                capabilities: device.capabilities.bits(),
                authorized: device.authorized,
                neighbor: device.neighbor,
                parent16: device.parent16,
                last_key_sequence: device.last_key_sequence,
                incoming_frame_counter: device.incoming_frame_counter,
                routes: self
                    .routes
                    .routes(device.address16)
                    .iter()
                    .map(|entry| PersistedRoute {
                        path_cost: entry.path_cost,
                        relays: entry.relays.to_vec(),
                        last_updated_ms: entry.last_updated_ms,
                    })
                    .collect(),
            })
            .collect();
        devices.sort_by_key(|d| d.address64);

        let mut app_link_keys: Vec<PersistedLinkKey> = self
            .app_link_keys
            .iter()
            .map(|((a, b), key)| PersistedLinkKey {
                device_a: *a,
                device_b: *b,
                key: *key,
            })
            .collect();
        app_link_keys.sort_by_key(|k| (k.device_a, k.device_b));

        PersistedState {
            network,
            devices,
            app_link_keys,
        }
    }

    /// Write the state now
    pub async fn save_now(&mut self) -> StackResult<()> {
        let state = self.to_persisted();
        self.store.save(&state).await?;
        self.network_counter_ceiling = state.network.network_key_frame_counter;
        self.tc_counter_ceiling = state.network.tc_key_frame_counter;
        self.save_requested = false;
        debug!("Saved state ({} devices)", state.devices.len());
        Ok(())
    }

    /// Write the state if something asked for it
    pub async fn flush_save(&mut self) -> StackResult<()> {
        if self.save_requested {
            self.save_now().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use zb_storage::MemoryStateStore;

    pub(crate) const COORDINATOR_EUI64: u64 = 0x00124b0000c0ffee;

    pub(crate) fn test_state() -> PersistedState {
        PersistedState {
            network: NetworkParameters {
                eui64: COORDINATOR_EUI64,
                pan_id: 0x1a62,
                extended_pan_id: 0xdddddddddddddddd,
                channel: 15,
                update_id: 0,
                tx_power: 5,
                network_key: [0x11; 16],
                network_key_frame_counter: 100,
                network_key_sequence: 0,
                tc_key: WELL_KNOWN_TC_LINK_KEY,
                tc_key_frame_counter: 50,
            },
            devices: Vec::new(),
            app_link_keys: Vec::new(),
        }
    }

    pub(crate) fn test_context_with(
        config: StackConfig,
    ) -> (
        StackContext,
        mpsc::UnboundedReceiver<StackEvent>,
        Arc<MemoryStateStore>,
    ) {
        let store = Arc::new(MemoryStateStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = StackContext::new(config, test_state(), store.clone(), tx);
        (ctx, rx, store)
    }

    pub(crate) fn test_context() -> (
        StackContext,
        mpsc::UnboundedReceiver<StackEvent>,
        Arc<MemoryStateStore>,
    ) {
        test_context_with(StackConfig::default())
    }

    pub(crate) fn rx_on() -> MacCapabilities {
        MacCapabilities::RX_ON_WHEN_IDLE
            | MacCapabilities::FULL_FUNCTION_DEVICE
            | MacCapabilities::MAINS_POWERED
            | MacCapabilities::ALLOCATE_ADDRESS
    }

    pub(crate) fn sleepy() -> MacCapabilities {
        MacCapabilities::ALLOCATE_ADDRESS
    }

    /// Join a device directly with the window opened for the occasion
    pub(crate) fn join(ctx: &mut StackContext, address64: u64, capabilities: MacCapabilities) -> u16 {
        let mut request = AssociationRequest::join(address64, capabilities);
        request.allow_override = true;
        ctx.associate(request).address16
    }

    #[tokio::test]
    async fn test_first_join_gets_address_and_key() {
        let (mut ctx, mut events, _) = test_context();
        ctx.open_join_window(Duration::from_secs(60), true);

        let outcome = ctx.associate(AssociationRequest::join(0xd1, rx_on()));
        assert_eq!(outcome.status, MacAssociationStatus::Success);
        assert!(outcome.address16 >= 1 && outcome.address16 <= MAX_UNICAST_ADDRESS);
        assert!(outcome.requires_transport_key);

        assert_eq!(ctx.address64_of(outcome.address16), Some(0xd1));
        assert!(ctx.save_requested());
        assert!(matches!(
            events.try_recv(),
            Ok(StackEvent::DeviceJoined { address64: 0xd1, .. })
        ));
    }

    #[tokio::test]
    async fn test_join_denied_when_window_closed() {
        let (mut ctx, _events, _) = test_context();
        let outcome = ctx.associate(AssociationRequest::join(0xd1, rx_on()));
        assert_eq!(outcome.status, MacAssociationStatus::PanAccessDenied);
        assert!(ctx.device(0xd1).is_none());

        let mut config = StackConfig::default();
        config.policies.install_code = InstallCodePolicy::Required;
        let (mut ctx, _events, _) = test_context_with(config);
        ctx.open_join_window(Duration::from_secs(60), true);
        assert!(!ctx.permit_joining());
        assert!(!ctx.associate(AssociationRequest::join(0xd1, rx_on())).is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_window_expires() {
        let (mut ctx, _events, _) = test_context();
        ctx.open_join_window(Duration::from_secs(10), true);
        assert!(ctx.mac_association_permit());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!ctx.permit_joining());
    }

    #[tokio::test]
    async fn test_rejoin_keeps_address_and_skips_key() {
        let (mut ctx, _events, _) = test_context();
        let address16 = join(&mut ctx, 0xd1, rx_on());
        ctx.mark_key_delivered(0xd1, ctx.network_key_sequence());

        let outcome = ctx.associate(AssociationRequest {
            address16: Some(address16),
            rejoin: true,
            ..AssociationRequest::join(0xd1, rx_on())
        });
        assert!(outcome.is_success());
        assert_eq!(outcome.address16, address16);
        assert!(!outcome.requires_transport_key);
    }

    #[tokio::test]
    async fn test_claimed_address_collision_is_reassigned() {
        let (mut ctx, _events, _) = test_context();
        let taken = join(&mut ctx, 0xd1, rx_on());

        let mut request = AssociationRequest::join(0xd2, rx_on());
        request.address16 = Some(taken);
        request.allow_override = true;
        let outcome = ctx.associate(request);
        assert!(outcome.is_success());
        assert_ne!(outcome.address16, taken);
        assert_eq!(ctx.address64_of(taken), Some(0xd1));
        assert!(ctx.devices.is_consistent());
    }

    #[tokio::test]
    async fn test_sleepy_join_prepares_indirect_queue() {
        let (mut ctx, _events, _) = test_context();
        join(&mut ctx, 0xd3, sleepy());
        assert!(ctx.is_indirect(0xd3));
        join(&mut ctx, 0xd4, rx_on());
        assert!(!ctx.is_indirect(0xd4));
    }

    #[tokio::test]
    async fn test_frame_counter_replay_and_wrap() {
        let (mut ctx, _events, _) = test_context();
        join(&mut ctx, 0xd1, rx_on());

        assert!(ctx.validate_incoming_frame_counter(0xd1, 10));
        assert!(ctx.validate_incoming_frame_counter(0xd1, 11));
        assert!(!ctx.validate_incoming_frame_counter(0xd1, 11));
        assert!(!ctx.validate_incoming_frame_counter(0xd1, 5));
        assert_eq!(ctx.device(0xd1).unwrap().incoming_frame_counter, Some(11));

        assert!(ctx.validate_incoming_frame_counter(0xd1, u32::MAX - 2));
        assert!(ctx.validate_incoming_frame_counter(0xd1, 3));
        assert_eq!(ctx.device(0xd1).unwrap().incoming_frame_counter, Some(3));
        assert!(!ctx.validate_incoming_frame_counter(0xd1, 2));
    }

    #[tokio::test]
    async fn test_switch_key_without_staged_key() {
        let (mut ctx, _events, _) = test_context();
        let active = *ctx.network_key();

        assert!(!ctx.activate_pending_network_key(1));
        assert_eq!(ctx.network_key(), &active);
        assert_eq!(ctx.network_key_sequence(), 0);

        ctx.stage_pending_network_key([0x22; 16], 1);
        assert!(!ctx.activate_pending_network_key(2));
        assert_eq!(ctx.network_key_for_sequence(1), Some([0x22; 16]));
        assert!(ctx.activate_pending_network_key(1));
        assert_eq!(ctx.network_key(), &[0x22; 16]);
        assert_eq!(ctx.network_key_sequence(), 1);
        assert_eq!(ctx.pending_network_key(), None);
    }

    #[tokio::test]
    async fn test_save_advances_counters_by_margin() {
        let (mut ctx, _events, store) = test_context();
        join(&mut ctx, 0xd1, rx_on());
        let counter = ctx.next_network_frame_counter();
        assert_eq!(counter, 100);

        ctx.save_now().await.unwrap();
        assert!(!ctx.save_requested());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.network.network_key_frame_counter, 101 + 1024);
        assert_eq!(loaded.network.tc_key_frame_counter, 50 + 1024);
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].address64, 0xd1);

        // A restart continues above anything that may have been sent
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut restored = StackContext::new(StackConfig::default(), loaded, store.clone(), tx);
        assert_eq!(restored.next_network_frame_counter(), 1125);
        assert_eq!(restored.device(0xd1).unwrap().address16, ctx.address16_of(0xd1).unwrap());
    }

    #[tokio::test]
    async fn test_parent_survives_restart() {
        let (mut ctx, _events, store) = test_context();
        let parent16 = join(&mut ctx, 0xa1, rx_on());
        let mut request = AssociationRequest::join(0xc1, sleepy());
        request.neighbor = false;
        request.parent16 = Some(parent16);
        request.allow_override = true;
        assert!(ctx.associate(request).is_success());
        ctx.save_now().await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let restored = StackContext::new(StackConfig::default(), loaded, store.clone(), tx);
        assert_eq!(restored.device(0xc1).unwrap().parent16, Some(parent16));
        assert_eq!(restored.device(0xa1).unwrap().parent16, None);
    }

    #[tokio::test]
    async fn test_counter_reaching_ceiling_requests_save() {
        let (mut ctx, _events, _) = test_context();
        ctx.save_now().await.unwrap();
        for _ in 0..1023 {
            ctx.next_network_frame_counter();
        }
        assert!(!ctx.save_requested());
        ctx.next_network_frame_counter();
        assert!(ctx.save_requested());
    }

    #[tokio::test]
    async fn test_disassociate_clears_everything() {
        let (mut ctx, mut events, _) = test_context();
        let a16 = join(&mut ctx, 0xd1, sleepy());
        let b16 = join(&mut ctx, 0xd2, rx_on());
        let now = ctx.now_ms();
        ctx.routes_mut().add_route(a16, &[], 1, now);
        ctx.routes_mut().add_route(0x7777, &[a16], 2, now);
        ctx.set_app_link_key(0xd1, 0xd2, [0x33; 16]);
        ctx.queue_indirect(0xd1, Bytes::from_static(&[1, 2, 3]), a16);
        while events.try_recv().is_ok() {}

        let removed = ctx.disassociate(0xd1).unwrap();
        assert_eq!(removed.address16, a16);
        assert_eq!(ctx.address64_of(a16), None);
        assert!(!ctx.routes().has_routes(a16));
        assert!(!ctx.routes().has_routes(0x7777));
        assert_eq!(ctx.app_link_key(0xd2, 0xd1), None);
        assert_eq!(ctx.indirect_len(0xd1), 0);
        assert_eq!(ctx.address64_of(b16), Some(0xd2));
        assert!(matches!(
            events.try_recv(),
            Ok(StackEvent::DeviceLeft { address64: 0xd1, .. })
        ));
        assert!(ctx.disassociate(0xd1).is_none());
    }

    #[tokio::test]
    async fn test_trust_center_rejoin_policy() {
        let (mut ctx, _events, _) = test_context();
        join(&mut ctx, 0xd1, rx_on());
        assert!(!ctx.allows_trust_center_rejoin(0xd1));
        ctx.authorize(0xd1);
        assert!(ctx.allows_trust_center_rejoin(0xd1));
        assert!(!ctx.allows_trust_center_rejoin(0xd2));

        let mut policies = ctx.policies().clone();
        policies.allow_rejoins_with_well_known_key = false;
        ctx.set_policies(policies);
        assert!(!ctx.allows_trust_center_rejoin(0xd1));
    }

    #[tokio::test]
    async fn test_app_link_key_pair_is_unordered() {
        let mut config = StackConfig::default();
        config.policies.approved_app_key_pairs = vec![(0xb, 0xa)];
        let (mut ctx, _events, _) = test_context_with(config);

        ctx.set_app_link_key(0xb, 0xa, [0x44; 16]);
        assert_eq!(ctx.app_link_key(0xa, 0xb), Some([0x44; 16]));
        assert!(ctx.is_approved_app_key_pair(0xa, 0xb));
        assert!(!ctx.is_approved_app_key_pair(0xa, 0xc));
    }

    #[tokio::test(start_paused = true)]
    async fn test_indirect_frames_expire() {
        let (mut ctx, _events, _) = test_context();
        let a16 = join(&mut ctx, 0xd1, sleepy());
        ctx.queue_indirect(0xd1, Bytes::from_static(&[1]), a16);
        tokio::time::advance(Duration::from_secs(5)).await;
        ctx.queue_indirect(0xd1, Bytes::from_static(&[2]), a16);
        tokio::time::advance(Duration::from_secs(5)).await;

        let frame = ctx.pop_indirect(0xd1).unwrap();
        assert_eq!(&frame.frame[..], &[2]);
        assert!(ctx.pop_indirect(0xd1).is_none());

        ctx.store_pending_association(
            0xd1,
            PendingAssociation {
                address16: a16,
                status: MacAssociationStatus::Success,
                requires_transport_key: true,
                created_ms: ctx.now_ms(),
            },
        );
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(ctx.take_pending_association(0xd1).is_none());
    }

    #[tokio::test]
    async fn test_end_device_timeout_index() {
        let (mut ctx, _events, _) = test_context();
        join(&mut ctx, 0xd1, sleepy());
        assert_eq!(ctx.set_end_device_timeout(0xd1, 0, 0), Some(10_000));
        assert_eq!(ctx.set_end_device_timeout(0xd1, 3, 0), Some(8 * 60_000));
        assert_eq!(ctx.set_end_device_timeout(0xd1, 15, 0), None);
        assert_eq!(
            ctx.device(0xd1).unwrap().end_device_timeout.unwrap().index,
            3
        );
    }

    #[tokio::test]
    async fn test_reassign_moves_routes() {
        let (mut ctx, _events, _) = test_context();
        let old = join(&mut ctx, 0xd1, rx_on());
        let now = ctx.now_ms();
        ctx.routes_mut().add_route(old, &[0x4444], 2, now);

        let new = ctx.reassign_address(0xd1).unwrap();
        assert_ne!(old, new);
        assert!(ctx.routes().has_routes(new));
        assert!(!ctx.routes().has_routes(old));
        assert!(ctx.devices.is_consistent());
    }

    #[tokio::test]
    async fn test_device_lqa() {
        let (mut ctx, _events, _) = test_context();
        join(&mut ctx, 0xd1, rx_on());
        assert_eq!(ctx.compute_device_lqa(0xd1), None);
        assert_eq!(ctx.record_link_sample(Some(0xd1), -25), 255);
        assert_eq!(ctx.compute_device_lqa(0xd1), Some(255));
        assert_eq!(ctx.record_link_sample(None, -100), 0);
    }
}
