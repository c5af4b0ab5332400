//! Flow and meter programming. Every operation builds one OpenFlow message and queues it
//! on the switch; nothing waits for the switch to acknowledge it.

use bytes::Bytes;
use ofqos_wire::{
    Action, Body, FlowMod, FlowModCommand, Instruction, Match, MeterBand, MeterFlags, MeterMod,
    MeterModCommand, MultipartRequest, PacketOut, PortNo, MAX_MESSAGE_LEN, OFPG_ANY, OFPM_ALL,
    OFP_NO_BUFFER,
};
use tracing::{debug, warn};

use crate::{SendError, SwitchHandle};

/// Priority of the rule that sends unmatched packets to the controller.
pub const TABLE_MISS_PRIORITY: u16 = 0;

/// Priority of rules installed by the learning switch.
pub const DEFAULT_FLOW_PRIORITY: u16 = 1;

/// Optional parameters of [`SwitchHandle::install_flow`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowOptions {
    /// Seconds of inactivity before the rule expires, 0 for never.
    pub idle_timeout: u16,
    /// Seconds before the rule expires regardless of traffic, 0 for never.
    pub hard_timeout: u16,
    /// Meter applied before the actions. `None` and `Some(0)` both mean no meter.
    pub meter_id: Option<u32>,
    /// Buffered packet to run through the new rule once installed.
    pub buffer_id: Option<u32>,
}

impl FlowOptions {
    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, secs: u16) -> Self {
        self.idle_timeout = secs;
        self
    }

    /// Sets the hard timeout.
    pub fn hard_timeout(mut self, secs: u16) -> Self {
        self.hard_timeout = secs;
        self
    }

    /// Meters the rule with `meter_id`.
    pub fn meter(mut self, meter_id: u32) -> Self {
        self.meter_id = Some(meter_id);
        self
    }
}

/// Burst size used when none is given: a tenth of the rate.
#[inline]
pub(crate) const fn default_burst(rate_kbps: u32) -> u32 {
    rate_kbps / 10
}

impl SwitchHandle {
    /// Adds a rule. If `options` carries a non-zero meter, the meter instruction is placed
    /// ahead of the actions so the switch evaluates it first.
    pub fn install_flow(
        &self,
        priority: u16,
        fields: Match,
        actions: Vec<Action>,
        options: FlowOptions,
    ) -> Result<(), SendError> {
        let mut instructions = Vec::with_capacity(2);
        if let Some(meter_id) = options.meter_id.filter(|id| *id != 0) {
            instructions.push(Instruction::Meter(meter_id));
        }
        instructions.push(Instruction::ApplyActions(actions));

        debug!(
            dpid = %self.dpid(),
            priority,
            ?fields,
            meter = ?options.meter_id,
            "Installing flow"
        );

        self.send(Body::FlowMod(FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command: FlowModCommand::Add,
            idle_timeout: options.idle_timeout,
            hard_timeout: options.hard_timeout,
            priority,
            buffer_id: options.buffer_id.unwrap_or(OFP_NO_BUFFER),
            out_port: PortNo::ANY,
            out_group: OFPG_ANY,
            flags: 0,
            fields,
            instructions,
        }))
        .map(drop)
    }

    /// Deletes every rule matching `fields`, whatever its output port or group.
    pub fn delete_flow(&self, fields: Match) -> Result<(), SendError> {
        debug!(dpid = %self.dpid(), ?fields, "Deleting flows");

        self.send(Body::FlowMod(FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command: FlowModCommand::Delete,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: OFP_NO_BUFFER,
            out_port: PortNo::ANY,
            out_group: OFPG_ANY,
            flags: 0,
            fields,
            instructions: Vec::new(),
        }))
        .map(drop)
    }

    /// Sends unmatched packets to the controller, unbuffered.
    pub fn install_table_miss(&self) -> Result<(), SendError> {
        self.install_flow(
            TABLE_MISS_PRIORITY,
            Match::all(),
            vec![Action::to_controller()],
            FlowOptions::default(),
        )
    }

    /// Adds a meter with a single drop band at `rate_kbps`. `burst` defaults to a tenth of
    /// the rate.
    pub fn install_meter(
        &self,
        meter_id: u32,
        rate_kbps: u32,
        burst: Option<u32>,
    ) -> Result<(), SendError> {
        self.meter_mod(MeterModCommand::Add, meter_id, rate_kbps, burst)
    }

    /// Changes the rate of an existing meter.
    pub fn modify_meter(
        &self,
        meter_id: u32,
        rate_kbps: u32,
        burst: Option<u32>,
    ) -> Result<(), SendError> {
        self.meter_mod(MeterModCommand::Modify, meter_id, rate_kbps, burst)
    }

    fn meter_mod(
        &self,
        command: MeterModCommand,
        meter_id: u32,
        rate: u32,
        burst: Option<u32>,
    ) -> Result<(), SendError> {
        let burst_size = burst.unwrap_or_else(|| default_burst(rate));
        debug!(dpid = %self.dpid(), ?command, meter_id, rate, burst_size, "Programming meter");

        self.send(Body::MeterMod(MeterMod {
            command,
            flags: MeterFlags::KBPS | MeterFlags::BURST,
            meter_id,
            bands: vec![MeterBand::Drop { rate, burst_size }],
        }))
        .map(drop)
    }

    /// Emits a single packet. `data` is only sent when the packet isn't buffered on the switch.
    /// A frame that doesn't fit in one message is not sent.
    pub fn packet_out(
        &self,
        buffer_id: u32,
        in_port: u32,
        actions: Vec<Action>,
        data: Bytes,
    ) -> Result<(), SendError> {
        let data = if buffer_id == OFP_NO_BUFFER { data } else { Bytes::new() };
        let packet_out = PacketOut { buffer_id, in_port, actions, data };

        let len = packet_out.encoded_len();
        if len > MAX_MESSAGE_LEN {
            warn!(dpid = %self.dpid(), len, "Packet out too large, dropping frame");
            return Err(SendError::TooLarge { dpid: self.dpid(), len });
        }

        self.send(Body::PacketOut(packet_out)).map(drop)
    }

    /// Requests counters for every port.
    pub fn request_port_stats(&self) -> Result<u32, SendError> {
        self.send(Body::MultipartRequest(MultipartRequest::PortStats { port_no: PortNo::ANY }))
    }

    /// Requests counters for every meter.
    pub fn request_meter_stats(&self) -> Result<u32, SendError> {
        self.send(Body::MultipartRequest(MultipartRequest::MeterStats { meter_id: OFPM_ALL }))
    }
}
