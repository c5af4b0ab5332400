//! An OpenFlow 1.3 learning-switch controller with meter-based QoS enforcement.
//!
//! Re-exports the controller, its transports and the wire format.

pub use ofqos_controller::*;
pub use ofqos_transport::*;
pub use ofqos_wire as wire;
