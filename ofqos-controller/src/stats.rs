use std::sync::atomic::{AtomicUsize, Ordering};

/// Controller statistics, shared between the accept driver, the switch sessions and the
/// [`Controller`](crate::Controller) front-end.
#[derive(Debug, Default)]
pub struct ControllerStats {
    /// Number of switches that completed the handshake and are still connected
    active_switches: AtomicUsize,
    /// Total messages received from switches
    messages_rx: AtomicUsize,
    /// Total messages written to switches
    messages_tx: AtomicUsize,
    /// Total packet-in events handled
    packet_ins: AtomicUsize,
    /// Sends dropped because a switch was unreachable or its queue was full
    failed_sends: AtomicUsize,
    /// Sessions closed because of a malformed message
    decode_errors: AtomicUsize,
}

impl ControllerStats {
    #[inline]
    pub(crate) fn increment_active_switches(&self) {
        self.active_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrement_active_switches(&self) {
        self.active_switches.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rx(&self) {
        self.messages_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self) {
        self.messages_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_packet_ins(&self) {
        self.packet_ins.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_failed_sends(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Switches that completed the handshake and are still connected.
    #[inline]
    pub fn active_switches(&self) -> usize {
        self.active_switches.load(Ordering::Relaxed)
    }

    /// Messages received from all switches.
    #[inline]
    pub fn messages_rx(&self) -> usize {
        self.messages_rx.load(Ordering::Relaxed)
    }

    /// Messages sent to all switches.
    #[inline]
    pub fn messages_tx(&self) -> usize {
        self.messages_tx.load(Ordering::Relaxed)
    }

    /// Packet-ins received.
    #[inline]
    pub fn packet_ins(&self) -> usize {
        self.packet_ins.load(Ordering::Relaxed)
    }

    /// Messages dropped because they could not be queued or encoded.
    #[inline]
    pub fn failed_sends(&self) -> usize {
        self.failed_sends.load(Ordering::Relaxed)
    }

    /// Connections closed on a malformed message.
    #[inline]
    pub fn decode_errors(&self) -> usize {
        self.decode_errors.load(Ordering::Relaxed)
    }
}
