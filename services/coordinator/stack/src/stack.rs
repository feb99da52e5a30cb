//! Engine task: owns the context and the handlers, and serializes inbound
//! frames, application commands and timers on one loop.

use crate::aps::ApsDataRequest;
use crate::config::{KeyUpdateMethod, StackConfig};
use crate::context::StackContext;
use crate::dispatcher::Layers;
use crate::error::{StackError, StackResult};
use crate::events::StackEvent;
use crate::scheduler::{Scheduler, TimerKind};
use crate::transport::FrameTransport;
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use zb_storage::{PersistedState, StateStore};
use zb_wire::aps::{ZDO_ENDPOINT, ZDO_PROFILE_ID};
use zb_wire::nwk::BROADCAST_ROUTERS;
use zb_wire::Key;

/// ZDO Mgmt_Permit_Joining_req
const MGMT_PERMIT_JOINING_REQ: u16 = 0x0036;

/// Largest finite permit duration; 0xff means "until further notice"
const MAX_PERMIT_DURATION_SECS: u64 = 0xfe;

const INBOUND_QUEUE_SIZE: usize = 64;
const COMMAND_QUEUE_SIZE: usize = 16;

/// One PSDU from the radio
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// MAC frame without FCS
    pub data: Bytes,
    /// Received signal strength in dBm
    pub rssi: i8,
}

/// Requests from the application to the engine task
#[derive(Debug)]
pub enum StackCommand {
    /// Open (or close, with a zero duration) the join window
    PermitJoin {
        /// Window length
        duration: Duration,
        /// Completion
        reply: oneshot::Sender<StackResult<()>>,
    },
    /// Send application data
    SendData {
        /// What to send
        request: ApsDataRequest,
        /// Completion; acknowledgment retries continue in the background
        reply: oneshot::Sender<StackResult<()>>,
    },
    /// Ask a device to leave and forget it
    RemoveDevice {
        /// Device IEEE address
        address64: u64,
        /// Completion
        reply: oneshot::Sender<StackResult<()>>,
    },
    /// Distribute a fresh network key and switch to it
    RotateNetworkKey {
        /// Sequence number of the new key
        reply: oneshot::Sender<StackResult<u8>>,
    },
    /// Enter Green Power commissioning for a duration, or leave it with `None`
    GpCommissioning {
        /// Window length
        duration: Option<Duration>,
        /// Completion
        reply: oneshot::Sender<StackResult<()>>,
    },
    /// Stop the engine after saving
    Stop {
        /// Completion
        reply: oneshot::Sender<StackResult<()>>,
    },
}

/// Cloneable front end of a running [`Stack`]
#[derive(Debug, Clone)]
pub struct StackHandle {
    commands: mpsc::Sender<StackCommand>,
}

impl StackHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StackResult<T>>) -> StackCommand,
    ) -> StackResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| StackError::NotRunning)?;
        response.await.map_err(|_| StackError::NotRunning)?
    }

    /// Allow joins for `duration`; zero closes the window
    pub async fn permit_join(&self, duration: Duration) -> StackResult<()> {
        self.request(|reply| StackCommand::PermitJoin { duration, reply })
            .await
    }

    /// Send application data
    pub async fn send_data(&self, request: ApsDataRequest) -> StackResult<()> {
        self.request(|reply| StackCommand::SendData { request, reply })
            .await
    }

    /// Remove a device from the network
    pub async fn remove_device(&self, address64: u64) -> StackResult<()> {
        self.request(|reply| StackCommand::RemoveDevice { address64, reply })
            .await
    }

    /// Rotate the network key; returns the new key sequence number
    pub async fn rotate_network_key(&self) -> StackResult<u8> {
        self.request(|reply| StackCommand::RotateNetworkKey { reply })
            .await
    }

    /// Open Green Power commissioning for `duration`, or close it with `None`
    pub async fn gp_commissioning(&self, duration: Option<Duration>) -> StackResult<()> {
        self.request(|reply| StackCommand::GpCommissioning { duration, reply })
            .await
    }

    /// Stop the engine
    pub async fn stop(&self) -> StackResult<()> {
        self.request(|reply| StackCommand::Stop { reply }).await
    }
}

fn jittered(period_ms: u64, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(period_ms);
    }
    let offset = rand::thread_rng().gen_range(0..=2 * jitter_ms);
    Duration::from_millis((period_ms + offset).saturating_sub(jitter_ms))
}

/// The coordinator engine
pub struct Stack {
    ctx: StackContext,
    layers: Layers,
    scheduler: Scheduler,
    inbound: mpsc::Receiver<InboundFrame>,
    commands: mpsc::Receiver<StackCommand>,
    zdo_sequence: u8,
}

impl Stack {
    /// Build the engine.
    ///
    /// Returns the engine, its command handle, the sender the transport feeds
    /// received frames into, and the event stream.
    pub fn new(
        config: StackConfig,
        state: PersistedState,
        store: Arc<dyn StateStore>,
        transport: Box<dyn FrameTransport>,
    ) -> (
        Self,
        StackHandle,
        mpsc::Sender<InboundFrame>,
        mpsc::UnboundedReceiver<StackEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        let stack = Self {
            ctx: StackContext::new(config, state, store, event_tx),
            layers: Layers::new(transport),
            scheduler: Scheduler::new(),
            inbound: inbound_rx,
            commands: command_rx,
            zdo_sequence: rand::random(),
        };
        let handle = StackHandle {
            commands: command_tx,
        };
        (stack, handle, inbound_tx, event_rx)
    }

    /// Shared context, for inspection
    pub fn context(&self) -> &StackContext {
        &self.ctx
    }

    /// Save the initial state and arm the periodic timers
    pub async fn start(&mut self) -> StackResult<()> {
        let timing = self.ctx.config().timing.clone();
        self.scheduler.schedule(
            TimerKind::LinkStatus,
            jittered(timing.link_status_period_ms, timing.link_status_jitter_ms),
        );
        self.scheduler
            .schedule(TimerKind::ManyToOneRouteRequest, Duration::ZERO);
        self.scheduler.schedule(
            TimerKind::SaveState,
            Duration::from_millis(timing.save_period_ms),
        );
        self.scheduler.schedule(
            TimerKind::Housekeeping,
            Duration::from_millis(timing.housekeeping_period_ms),
        );
        let key_period = self.ctx.policies().network_key_update_period_secs;
        if key_period > 0 {
            self.scheduler
                .schedule(TimerKind::NetworkKeyUpdate, Duration::from_secs(key_period));
        }

        self.ctx.save_now().await?;
        info!(
            "Coordinator {:016x} started on PAN 0x{:04x}",
            self.ctx.eui64(),
            self.ctx.pan_id()
        );
        Ok(())
    }

    /// Run until stopped, the channels close or a fatal error occurs
    pub async fn run(mut self) -> StackResult<()> {
        self.start().await?;

        loop {
            let deadline = self.scheduler.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(frame) => {
                        let result = self
                            .layers
                            .dispatch_frame(&mut self.ctx, frame.data, frame.rssi)
                            .await;
                        self.check(result)?;
                    }
                    None => {
                        info!("Radio channel closed, stopping");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        info!("All handles dropped, stopping");
                        break;
                    }
                },
                _ = sleep => {
                    for kind in self.scheduler.pop_expired(Instant::now()) {
                        let result = self.on_timer(kind).await;
                        self.check(result)?;
                    }
                }
            }

            self.schedule_rediscovery();
            let result = self.ctx.flush_save().await;
            self.check(result)?;
        }

        self.stop().await
    }

    /// Log recoverable errors; report and return fatal ones
    fn check(&self, result: StackResult<()>) -> StackResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!("Coordinator stopping: {}", e);
                self.ctx.emit(StackEvent::FatalError {
                    message: e.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                warn!("{}", e);
                Ok(())
            }
        }
    }

    /// Pull the next many-to-one route request forward when routing asked for one
    fn schedule_rediscovery(&mut self) {
        if !self.layers.nwk.discovery_requested() {
            return;
        }
        let at = Instant::now() + self.layers.nwk.many_to_one_wait(&self.ctx);
        let later = self
            .scheduler
            .deadline(TimerKind::ManyToOneRouteRequest)
            .map_or(true, |deadline| deadline > at);
        if later {
            debug!("Route rediscovery scheduled");
            self.scheduler
                .schedule_at(TimerKind::ManyToOneRouteRequest, at);
        }
    }

    /// Execute one command; returns false once the engine stopped
    async fn handle_command(&mut self, command: StackCommand) -> StackResult<bool> {
        match command {
            StackCommand::PermitJoin { duration, reply } => {
                let result = self.permit_join(duration).await;
                let _ = reply.send(result);
            }
            StackCommand::SendData { request, reply } => {
                let result = self.send_data(request).await;
                let _ = reply.send(result);
            }
            StackCommand::RemoveDevice { address64, reply } => {
                let result = self.remove_device(address64).await;
                let _ = reply.send(result);
            }
            StackCommand::RotateNetworkKey { reply } => {
                let result = self.rotate_network_key().await;
                let _ = reply.send(result);
            }
            StackCommand::GpCommissioning { duration, reply } => {
                self.gp_commissioning(duration);
                let _ = reply.send(Ok(()));
            }
            StackCommand::Stop { reply } => {
                let result = self.stop().await;
                if let Err(e) = &result {
                    error!("Final save failed: {}", e);
                }
                let _ = reply.send(result);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_timer(&mut self, kind: TimerKind) -> StackResult<()> {
        let timing = self.ctx.config().timing.clone();
        let Layers { mac, nwk, aps, gp } = &mut self.layers;
        let ctx = &mut self.ctx;

        match kind {
            TimerKind::LinkStatus => {
                nwk.send_link_status(ctx, mac).await?;
                self.scheduler.schedule(
                    TimerKind::LinkStatus,
                    jittered(timing.link_status_period_ms, timing.link_status_jitter_ms),
                );
            }
            TimerKind::ManyToOneRouteRequest => {
                nwk.send_many_to_one_route_request(ctx, mac).await?;
                self.scheduler.schedule(
                    TimerKind::ManyToOneRouteRequest,
                    Duration::from_millis(timing.many_to_one_period_ms),
                );
            }
            TimerKind::SaveState => {
                ctx.save_now().await?;
                self.scheduler.schedule(
                    TimerKind::SaveState,
                    Duration::from_millis(timing.save_period_ms),
                );
            }
            TimerKind::Housekeeping => {
                ctx.expire_transients();
                aps.expire(ctx);
                gp.expire(ctx);
                self.scheduler.schedule(
                    TimerKind::Housekeeping,
                    Duration::from_millis(timing.housekeeping_period_ms),
                );
            }
            TimerKind::ApsAckTimeout {
                destination16,
                counter,
            } => {
                if aps
                    .handle_ack_timeout(ctx, mac, nwk, (destination16, counter))
                    .await?
                {
                    self.scheduler
                        .schedule(kind, Duration::from_millis(timing.aps_ack_timeout_ms));
                }
            }
            TimerKind::JoinWindowClose => ctx.close_join_window(),
            TimerKind::NetworkKeySwitch => {
                let Some((_, sequence)) = ctx.pending_network_key() else {
                    return Ok(());
                };
                if let Err(e) = aps.broadcast_switch_key(ctx, mac, nwk, sequence).await {
                    // the staged key stays until a switch goes out
                    self.scheduler.schedule(
                        TimerKind::NetworkKeySwitch,
                        Duration::from_millis(timing.network_key_switch_delay_ms),
                    );
                    return Err(e);
                }
                ctx.activate_pending_network_key(sequence);
            }
            TimerKind::NetworkKeyUpdate => {
                let period = self.ctx.policies().network_key_update_period_secs;
                if period > 0 {
                    self.scheduler
                        .schedule(TimerKind::NetworkKeyUpdate, Duration::from_secs(period));
                }
                self.rotate_network_key().await?;
            }
            TimerKind::GpCommissioningExit => gp.exit_commissioning(),
        }
        Ok(())
    }

    async fn permit_join(&mut self, duration: Duration) -> StackResult<()> {
        let seconds = duration.as_secs().min(MAX_PERMIT_DURATION_SECS);
        if seconds == 0 {
            self.ctx.close_join_window();
            self.scheduler.cancel(TimerKind::JoinWindowClose);
        } else {
            let window = Duration::from_secs(seconds);
            self.ctx.open_join_window(window, true);
            self.scheduler.schedule(TimerKind::JoinWindowClose, window);
        }

        // Routers open their own windows for the same duration
        self.zdo_sequence = self.zdo_sequence.wrapping_add(1);
        let request = ApsDataRequest {
            destination16: BROADCAST_ROUTERS,
            destination_endpoint: ZDO_ENDPOINT,
            cluster_id: MGMT_PERMIT_JOINING_REQ,
            profile_id: ZDO_PROFILE_ID,
            source_endpoint: ZDO_ENDPOINT,
            payload: Bytes::copy_from_slice(&[self.zdo_sequence, seconds as u8, 0x01]),
            ack_request: false,
        };
        self.send_data(request).await?;
        Ok(())
    }

    async fn send_data(&mut self, request: ApsDataRequest) -> StackResult<()> {
        let Layers { mac, nwk, aps, .. } = &mut self.layers;
        let ack = aps.send_data(&mut self.ctx, mac, nwk, request).await?;
        if let Some((destination16, counter)) = ack {
            self.scheduler.schedule(
                TimerKind::ApsAckTimeout {
                    destination16,
                    counter,
                },
                Duration::from_millis(self.ctx.config().timing.aps_ack_timeout_ms),
            );
        }
        Ok(())
    }

    async fn remove_device(&mut self, address64: u64) -> StackResult<()> {
        let device = self
            .ctx
            .device(address64)
            .cloned()
            .ok_or(StackError::UnknownDevice(address64))?;
        let Layers { mac, nwk, aps, .. } = &mut self.layers;
        let ctx = &mut self.ctx;

        if device.neighbor {
            nwk.send_leave_request(ctx, mac, device.address16, address64, false)
                .await?;
        } else if let Some(parent16) = device.parent16 {
            aps.send_remove_device(ctx, mac, nwk, parent16, address64)
                .await?;
        } else {
            warn!("{:016x} has no known parent, forgetting it", address64);
        }

        // A sleepy child collects the leave request on its next poll and
        // announces its departure
        if !(device.neighbor && ctx.is_indirect(address64)) {
            ctx.disassociate(address64);
            aps.drop_pending_acks(device.address16);
        }
        Ok(())
    }

    async fn rotate_network_key(&mut self) -> StackResult<u8> {
        let Layers { mac, nwk, aps, .. } = &mut self.layers;
        let ctx = &mut self.ctx;
        let key: Key = rand::random();
        let sequence = ctx.network_key_sequence().wrapping_add(1);
        ctx.stage_pending_network_key(key, sequence);

        match ctx.policies().network_key_update_method {
            KeyUpdateMethod::Broadcast => {
                aps.broadcast_network_key(ctx, mac, nwk, key, sequence)
                    .await?;
            }
            KeyUpdateMethod::Unicast => {
                let targets: Vec<(u16, u64)> = ctx
                    .devices()
                    .map(|device| (device.address16, device.address64))
                    .collect();
                for (address16, address64) in targets {
                    let result = aps
                        .send_network_key_update(ctx, mac, nwk, address16, address64, key, sequence)
                        .await;
                    match result {
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => warn!(
                            "Network key {} not sent to {:016x}: {}",
                            sequence, address64, e
                        ),
                        Ok(_) => {}
                    }
                }
            }
        }

        let delay = Duration::from_millis(ctx.config().timing.network_key_switch_delay_ms);
        self.scheduler.schedule(TimerKind::NetworkKeySwitch, delay);
        info!("Network key {} distributed, switching in {:?}", sequence, delay);
        Ok(sequence)
    }

    fn gp_commissioning(&mut self, duration: Option<Duration>) {
        match duration {
            Some(duration) => {
                self.layers.gp.enter_commissioning(&self.ctx, duration);
                self.scheduler
                    .schedule(TimerKind::GpCommissioningExit, duration);
            }
            None => {
                self.layers.gp.exit_commissioning();
                self.scheduler.cancel(TimerKind::GpCommissioningExit);
            }
        }
    }

    /// Cancel every timer, leave commissioning and persist
    async fn stop(&mut self) -> StackResult<()> {
        self.scheduler.clear();
        self.layers.gp.exit_commissioning();
        self.ctx.close_join_window();
        self.ctx.save_now().await?;
        info!("Coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{join, rx_on, sleepy, test_state};
    use crate::nwk::tests::open_frame;
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportError;
    use zb_storage::{MemoryStateStore, PersistedDevice};
    use zb_wire::{ApsCommand, ApsFrameType, ApsHeader, NwkCommand, TransportKey};

    fn test_stack() -> (
        Stack,
        StackHandle,
        mpsc::Sender<InboundFrame>,
        mpsc::UnboundedReceiver<StackEvent>,
        MockTransport,
        Arc<MemoryStateStore>,
    ) {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStateStore::new());
        let (stack, handle, inbound, events) = Stack::new(
            StackConfig::default(),
            test_state(),
            store.clone(),
            Box::new(transport.clone()),
        );
        (stack, handle, inbound, events, transport, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_join_broadcast_and_close() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();

        stack.permit_join(Duration::from_secs(60)).await.unwrap();
        assert!(stack.ctx.permit_joining());
        assert!(stack.scheduler.is_scheduled(TimerKind::JoinWindowClose));

        let (_, nwk_header, mut payload) = open_frame(&stack.ctx, transport.frames()[0].clone());
        assert_eq!(nwk_header.destination16, BROADCAST_ROUTERS);
        let aps_header = ApsHeader::decode(&mut payload).unwrap();
        assert_eq!(aps_header.cluster_id, Some(MGMT_PERMIT_JOINING_REQ));
        assert_eq!(&payload[1..], &[60, 0x01]);

        tokio::time::advance(Duration::from_secs(61)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            stack.on_timer(kind).await.unwrap();
        }
        assert!(!stack.ctx.permit_joining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_rearms_until_exhausted() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        let address16 = join(&mut stack.ctx, 0xd1, rx_on());

        stack
            .send_data(ApsDataRequest {
                destination16: address16,
                destination_endpoint: 1,
                cluster_id: 0x0006,
                profile_id: 0x0104,
                source_endpoint: 1,
                payload: Bytes::from_static(&[0x01, 0x02, 0x02]),
                ack_request: true,
            })
            .await
            .unwrap();
        assert_eq!(stack.layers.aps.pending_ack_count(), 1);

        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(1500)).await;
            for kind in stack.scheduler.pop_expired(Instant::now()) {
                stack.on_timer(kind).await.unwrap();
            }
        }
        assert_eq!(transport.frames().len(), 4);
        assert_eq!(stack.layers.aps.pending_ack_count(), 0);
        assert!(stack.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_key_rotation() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        let old_key = *stack.ctx.network_key();

        let sequence = stack.rotate_network_key().await.unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(stack.ctx.network_key(), &old_key);

        let (_, _, mut payload) = open_frame(&stack.ctx, transport.frames()[0].clone());
        ApsHeader::decode(&mut payload).unwrap();
        let staged = match ApsCommand::decode(&mut payload).unwrap() {
            ApsCommand::TransportKey(TransportKey::Network { key, sequence, .. }) => {
                assert_eq!(sequence, 1);
                key
            }
            other => panic!("unexpected {:?}", other),
        };

        tokio::time::advance(Duration::from_secs(5)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            stack.on_timer(kind).await.unwrap();
        }
        assert_eq!(stack.ctx.network_key_sequence(), 1);
        assert_eq!(stack.ctx.network_key(), &staged);
        assert_eq!(transport.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_update_timer_rearms_after_failed_rotation() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        let mut policies = stack.ctx.policies().clone();
        policies.network_key_update_period_secs = 3600;
        stack.ctx.set_policies(policies);
        stack
            .scheduler
            .schedule(TimerKind::NetworkKeyUpdate, Duration::from_secs(3600));

        transport.fail_next(TransportError::Io("link down".into()));
        tokio::time::advance(Duration::from_secs(3600)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            assert!(stack.on_timer(kind).await.is_err());
        }
        assert!(stack.scheduler.is_scheduled(TimerKind::NetworkKeyUpdate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_key_switch_is_retried() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        stack.rotate_network_key().await.unwrap();

        transport.fail_next(TransportError::Io("link down".into()));
        tokio::time::advance(Duration::from_secs(5)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            assert!(stack.on_timer(kind).await.is_err());
        }
        assert_eq!(stack.ctx.network_key_sequence(), 0);
        assert!(stack.ctx.pending_network_key().is_some());
        assert!(stack.scheduler.is_scheduled(TimerKind::NetworkKeySwitch));

        tokio::time::advance(Duration::from_secs(5)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            stack.on_timer(kind).await.unwrap();
        }
        assert_eq!(stack.ctx.network_key_sequence(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_key_update_skips_unreachable_device() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        let mut policies = stack.ctx.policies().clone();
        policies.network_key_update_method = KeyUpdateMethod::Unicast;
        stack.ctx.set_policies(policies);
        join(&mut stack.ctx, 0xa1, rx_on());
        join(&mut stack.ctx, 0xa2, rx_on());

        transport.fail_next(TransportError::NoAck);
        let sequence = stack.rotate_network_key().await.unwrap();
        assert_eq!(sequence, 1);

        let frames = transport.frames();
        assert_eq!(frames.len(), 2);
        let mut keyed = Vec::new();
        for frame in frames {
            let (_, header, _) = open_frame(&stack.ctx, frame);
            keyed.push(header.destination16);
        }
        keyed.sort_unstable();
        let mut expected = vec![
            stack.ctx.address16_of(0xa1).unwrap(),
            stack.ctx.address16_of(0xa2).unwrap(),
        ];
        expected.sort_unstable();
        assert_eq!(keyed, expected);
        assert!(stack.scheduler.is_scheduled(TimerKind::NetworkKeySwitch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_drops_pending_acks() {
        let (mut stack, _handle, _inbound, _events, transport, _store) = test_stack();
        let address16 = join(&mut stack.ctx, 0xa1, rx_on());
        stack
            .send_data(ApsDataRequest {
                destination16: address16,
                destination_endpoint: 1,
                cluster_id: 0x0006,
                profile_id: 0x0104,
                source_endpoint: 1,
                payload: Bytes::from_static(&[0x01]),
                ack_request: true,
            })
            .await
            .unwrap();
        assert_eq!(stack.layers.aps.pending_ack_count(), 1);

        stack.remove_device(0xa1).await.unwrap();
        assert_eq!(stack.layers.aps.pending_ack_count(), 0);

        let sent = transport.frames().len();
        tokio::time::advance(Duration::from_millis(1500)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            stack.on_timer(kind).await.unwrap();
        }
        assert_eq!(transport.frames().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device() {
        let (mut stack, _handle, _inbound, mut events, transport, _store) = test_stack();
        let router16 = join(&mut stack.ctx, 0xa1, rx_on());
        join(&mut stack.ctx, 0xe1, sleepy());

        stack.remove_device(0xa1).await.unwrap();
        let (_, header, mut payload) = open_frame(&stack.ctx, transport.frames()[0].clone());
        assert_eq!(header.destination16, router16);
        assert!(matches!(
            NwkCommand::decode(&mut payload).unwrap(),
            NwkCommand::Leave { .. }
        ));
        assert!(stack.ctx.device(0xa1).is_none());

        // Queued for the sleepy child's next poll; it stays until it announces leaving
        stack.remove_device(0xe1).await.unwrap();
        assert_eq!(stack.ctx.indirect_len(0xe1), 1);
        assert!(stack.ctx.device(0xe1).is_some());

        assert!(matches!(
            stack.remove_device(0xbad).await,
            Err(StackError::UnknownDevice(0xbad))
        ));

        let mut left = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, StackEvent::DeviceLeft { address64: 0xa1, .. }) {
                left += 1;
            }
        }
        assert_eq!(left, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_after_restart_reaches_parent() {
        let mut state = test_state();
        state.devices = vec![
            PersistedDevice {
                address64: 0xa1,
                address16: 0x1001,
                capabilities: rx_on().bits(),
                authorized: true,
                neighbor: true,
                parent16: None,
                last_key_sequence: Some(0),
                incoming_frame_counter: None,
                routes: Vec::new(),
            },
            PersistedDevice {
                address64: 0xc1,
                address16: 0x2002,
                capabilities: sleepy().bits(),
                authorized: true,
                neighbor: false,
                parent16: Some(0x1001),
                last_key_sequence: Some(0),
                incoming_frame_counter: None,
                routes: Vec::new(),
            },
        ];
        let transport = MockTransport::new();
        let (mut stack, _handle, _inbound, _events) = Stack::new(
            StackConfig::default(),
            state,
            Arc::new(MemoryStateStore::new()),
            Box::new(transport.clone()),
        );

        stack.remove_device(0xc1).await.unwrap();
        let (_, header, mut payload) = open_frame(&stack.ctx, transport.frames()[0].clone());
        assert_eq!(header.destination16, 0x1001);
        let aps_header = ApsHeader::decode(&mut payload).unwrap();
        assert_eq!(aps_header.frame_type, ApsFrameType::Command);
        assert!(aps_header.is_secured());
        assert!(stack.ctx.device(0xc1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gp_commissioning_window() {
        let (mut stack, _handle, _inbound, _events, _transport, _store) = test_stack();
        stack.gp_commissioning(Some(Duration::from_secs(10)));
        assert!(stack.layers.gp.is_commissioning(&stack.ctx));

        tokio::time::advance(Duration::from_secs(10)).await;
        for kind in stack.scheduler.pop_expired(Instant::now()) {
            stack.on_timer(kind).await.unwrap();
        }
        assert!(!stack.layers.gp.is_commissioning(&stack.ctx));
        assert!(!stack.scheduler.is_scheduled(TimerKind::GpCommissioningExit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stop() {
        let (stack, handle, inbound, _events, transport, store) = test_stack();
        let task = tokio::spawn(stack.run());

        handle.permit_join(Duration::from_secs(30)).await.unwrap();
        inbound
            .send(InboundFrame {
                data: Bytes::from_static(&[0x03]),
                rssi: -70,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        // Many-to-one at start, permit join, one link status
        assert!(transport.frames().len() >= 3);
        assert!(store.save_count() >= 2);
        assert!(store.load().await.unwrap().is_some());
        assert!(matches!(
            handle.permit_join(Duration::from_secs(1)).await,
            Err(StackError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_transport_error_stops_engine() {
        let (stack, handle, _inbound, mut events, transport, _store) = test_stack();
        transport.fail_next(TransportError::Io("link down".into()));
        let result = tokio::spawn(stack.run()).await.unwrap();

        assert!(matches!(result, Err(StackError::Transport(_))));
        assert!(matches!(events.recv().await, Some(StackEvent::FatalError { .. })));
        drop(handle);
    }
}
