//! Actions and instructions attached to rules and packet-outs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{need, patch_u16, Error};

/// Reserved OpenFlow port numbers (`ofp_port_no`).
#[derive(Debug)]
pub struct PortNo;

impl PortNo {
    /// Maximum number of physical and logical switch ports.
    pub const MAX: u32 = 0xffff_ff00;
    /// Send the packet out the port it came in on.
    pub const IN_PORT: u32 = 0xffff_fff8;
    /// Submit the packet to the first flow table. Packet-out only.
    pub const TABLE: u32 = 0xffff_fff9;
    /// Forward using the switch's non-OpenFlow pipeline.
    pub const NORMAL: u32 = 0xffff_fffa;
    /// All physical ports in the VLAN, except the input port and blocked ports.
    pub const FLOOD: u32 = 0xffff_fffb;
    /// All physical ports except the input port.
    pub const ALL: u32 = 0xffff_fffc;
    /// Send to the controller.
    pub const CONTROLLER: u32 = 0xffff_fffd;
    /// The switch's local networking stack.
    pub const LOCAL: u32 = 0xffff_fffe;
    /// Wildcard port, used in deletions and statistics requests.
    pub const ANY: u32 = 0xffff_ffff;
}

/// `max_len` value asking the switch to send the whole packet to the controller
/// instead of buffering it (`OFPCML_NO_BUFFER`).
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

const ACTION_OUTPUT: u16 = 0;
const ACTION_OUTPUT_LEN: usize = 16;

const INSTRUCTION_APPLY_ACTIONS: u16 = 4;
const INSTRUCTION_METER: u16 = 6;

/// An action applied to a packet (`ofp_action_header`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Output to a port.
    Output {
        /// Physical port or one of the reserved [`PortNo`] values.
        port: u32,
        /// Bytes to send to the controller, only used with [`PortNo::CONTROLLER`].
        max_len: u16,
    },
    /// Any other action, kept as raw bytes after the 4-byte action header.
    Other {
        /// `ofp_action_type`
        kind: u16,
        /// Action body.
        data: Bytes,
    },
}

impl Action {
    /// Output to `port`.
    pub const fn output(port: u32) -> Self {
        Self::Output { port, max_len: 0 }
    }

    /// Send the full packet to the controller.
    pub const fn to_controller() -> Self {
        Self::Output { port: PortNo::CONTROLLER, max_len: OFPCML_NO_BUFFER }
    }

    /// Size of the action on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Output { .. } => ACTION_OUTPUT_LEN,
            Self::Other { data, .. } => 4 + data.len(),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Output { port, max_len } => {
                dst.put_u16(ACTION_OUTPUT);
                dst.put_u16(ACTION_OUTPUT_LEN as u16);
                dst.put_u32(*port);
                dst.put_u16(*max_len);
                dst.put_bytes(0, 6);
            }
            Self::Other { kind, data } => {
                let start = dst.len();
                dst.put_u16(*kind);
                dst.put_u16(0);
                dst.put_slice(data);
                patch_u16(dst, start + 2, dst.len() - start)?;
            }
        }

        Ok(())
    }

    pub(crate) fn decode_list(mut src: Bytes) -> Result<Vec<Self>, Error> {
        let mut actions = Vec::new();

        while src.has_remaining() {
            need(&src, 4, "action header")?;
            let kind = src.get_u16();
            let len = src.get_u16() as usize;
            if len < 4 {
                return Err(Error::Length(len));
            }
            need(&src, len - 4, "action body")?;
            let mut body = src.split_to(len - 4);

            let action = if kind == ACTION_OUTPUT && len == ACTION_OUTPUT_LEN {
                let port = body.get_u32();
                let max_len = body.get_u16();
                Self::Output { port, max_len }
            } else {
                Self::Other { kind, data: body }
            };

            actions.push(action);
        }

        Ok(actions)
    }
}

pub(crate) fn encode_actions(actions: &[Action], dst: &mut BytesMut) -> Result<(), Error> {
    for action in actions {
        action.encode(dst)?;
    }

    Ok(())
}

/// Flow instructions (`ofp_instruction`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Apply the meter before any other instruction.
    Meter(u32),
    /// Apply the actions immediately, in order.
    ApplyActions(Vec<Action>),
    /// Any other instruction, kept as raw bytes after the 4-byte instruction header.
    Other {
        /// `ofp_instruction_type`
        kind: u16,
        /// Instruction body.
        data: Bytes,
    },
}

impl Instruction {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let start = dst.len();

        match self {
            Self::Meter(meter_id) => {
                dst.put_u16(INSTRUCTION_METER);
                dst.put_u16(8);
                dst.put_u32(*meter_id);
            }
            Self::ApplyActions(actions) => {
                dst.put_u16(INSTRUCTION_APPLY_ACTIONS);
                dst.put_u16(0);
                dst.put_bytes(0, 4);
                encode_actions(actions, dst)?;
                patch_u16(dst, start + 2, dst.len() - start)?;
            }
            Self::Other { kind, data } => {
                dst.put_u16(*kind);
                dst.put_u16(0);
                dst.put_slice(data);
                patch_u16(dst, start + 2, dst.len() - start)?;
            }
        }

        Ok(())
    }

    pub(crate) fn decode_list(mut src: Bytes) -> Result<Vec<Self>, Error> {
        let mut instructions = Vec::new();

        while src.has_remaining() {
            need(&src, 4, "instruction header")?;
            let kind = src.get_u16();
            let len = src.get_u16() as usize;
            if len < 4 {
                return Err(Error::Length(len));
            }
            need(&src, len - 4, "instruction body")?;
            let mut body = src.split_to(len - 4);

            let instruction = match kind {
                INSTRUCTION_METER if len == 8 => Self::Meter(body.get_u32()),
                INSTRUCTION_APPLY_ACTIONS if len >= 8 => {
                    body.advance(4);
                    Self::ApplyActions(Action::decode_list(body)?)
                }
                _ => Self::Other { kind, data: body },
            };

            instructions.push(instruction);
        }

        Ok(instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_action_layout() {
        let mut buf = BytesMut::new();
        Action::to_controller().encode(&mut buf).unwrap();

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &[0, 0, 0, 16]);
        assert_eq!(&buf[4..8], &PortNo::CONTROLLER.to_be_bytes());
        assert_eq!(&buf[8..10], &[0xff, 0xff]);
    }

    #[test]
    fn meter_precedes_apply_actions() {
        let instructions =
            vec![Instruction::Meter(5000), Instruction::ApplyActions(vec![Action::output(2)])];

        let mut buf = BytesMut::new();
        for i in &instructions {
            i.encode(&mut buf).unwrap();
        }

        // meter (8) + apply actions header (8) + output (16)
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..8], &[0, 6, 0, 8, 0, 0, 0x13, 0x88]);
        assert_eq!(&buf[8..12], &[0, 4, 0, 24]);

        let decoded = Instruction::decode_list(buf.freeze()).unwrap();
        assert_eq!(decoded, instructions);
    }
}
