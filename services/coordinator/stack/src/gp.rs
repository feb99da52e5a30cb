//! Green Power handler: duplicate filter and commissioning gate for GPD frames

use crate::context::StackContext;
use crate::events::StackEvent;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use zb_wire::gp::is_commissioning_command;
use zb_wire::GpFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GpdId {
    Source(u32),
    Endpoint(u8),
}

/// Green Power handler
#[derive(Debug, Default)]
pub struct GpHandler {
    duplicates: HashMap<(GpdId, u32), u64>,
    commissioning_until_ms: Option<u64>,
}

impl GpHandler {
    /// Create a handler outside commissioning mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept commissioning frames for `duration`
    pub fn enter_commissioning(&mut self, ctx: &StackContext, duration: Duration) {
        let until = ctx.now_ms() + duration.as_millis() as u64;
        self.commissioning_until_ms = Some(until);
        info!("Green Power commissioning open for {:?}", duration);
    }

    /// Leave commissioning mode
    pub fn exit_commissioning(&mut self) {
        if self.commissioning_until_ms.take().is_some() {
            info!("Green Power commissioning closed");
        }
    }

    /// Whether commissioning frames are currently accepted
    pub fn is_commissioning(&self, ctx: &StackContext) -> bool {
        self.commissioning_until_ms
            .map_or(false, |until| ctx.now_ms() < until)
    }

    /// Drop duplicate entries older than the window
    pub fn expire(&mut self, ctx: &StackContext) {
        let now_ms = ctx.now_ms();
        let window_ms = ctx.config().timing.gp_duplicate_window_ms;
        self.duplicates
            .retain(|_, seen_ms| now_ms.saturating_sub(*seen_ms) <= window_ms);
    }

    /// Filter and deliver one GPD frame; returns whether it went upward.
    ///
    /// Frames without a security frame counter are deduplicated on the MAC
    /// sequence number.
    pub fn process_frame(
        &mut self,
        ctx: &StackContext,
        mac_sequence: u8,
        frame: GpFrame,
        lqa: u8,
    ) -> bool {
        let id = match (frame.header.source_id, frame.header.endpoint) {
            (Some(source_id), _) => GpdId::Source(source_id),
            (None, Some(endpoint)) => GpdId::Endpoint(endpoint),
            (None, None) => {
                debug!("Green Power frame without GPD identifier dropped");
                return false;
            }
        };

        if is_commissioning_command(frame.command_id) && !self.is_commissioning(ctx) {
            debug!(
                "Green Power commissioning command 0x{:02x} from {:?} outside commissioning",
                frame.command_id, id
            );
            return false;
        }

        let counter = frame
            .header
            .frame_counter
            .unwrap_or(u32::from(mac_sequence));
        let now_ms = ctx.now_ms();
        let window_ms = ctx.config().timing.gp_duplicate_window_ms;
        if let Some(seen_ms) = self.duplicates.get(&(id, counter)) {
            if now_ms.saturating_sub(*seen_ms) <= window_ms {
                debug!("Duplicate Green Power frame {} from {:?}", counter, id);
                return false;
            }
        }
        self.duplicates.insert((id, counter), now_ms);

        ctx.emit(StackEvent::GreenPowerFrame {
            header: frame.header,
            command_id: frame.command_id,
            payload: frame.payload,
            lqa,
        });
        true
    }
}
