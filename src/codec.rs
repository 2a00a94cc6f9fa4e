//! MAVLink frame decode/encode on top of the `mavlink` crate.
//!
//! Inbound: [`parse_datagram`] drains every decodable frame out of one UDP
//! datagram (a single frame per datagram is the common case, but several are
//! accepted). Outbound: [`MavSender`] is the session's single serializer.
//! It stamps our system/component ids and a wrapping sequence number, packs
//! MAVLink v2 and hands the bytes to the link. Every engine sends through
//! the same `MavSender`.

use std::io::{self, Cursor};
use std::sync::Arc;

use mavlink::common::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::MavHeader;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::LinkError;
use crate::transport::UdpLink;

/// Message ids of the frames the session core produces or consumes.
pub mod msg_id {
    pub const HEARTBEAT: u32 = 0;
    pub const SYS_STATUS: u32 = 1;
    pub const PARAM_VALUE: u32 = 22;
    pub const PARAM_SET: u32 = 23;
    pub const GLOBAL_POSITION_INT: u32 = 33;
    pub const MISSION_REQUEST: u32 = 40;
    pub const MISSION_SET_CURRENT: u32 = 41;
    pub const MISSION_CURRENT: u32 = 42;
    pub const MISSION_REQUEST_LIST: u32 = 43;
    pub const MISSION_COUNT: u32 = 44;
    pub const MISSION_ITEM_REACHED: u32 = 46;
    pub const MISSION_ACK: u32 = 47;
    pub const MISSION_REQUEST_INT: u32 = 51;
    pub const MISSION_ITEM_INT: u32 = 73;
    pub const COMMAND_LONG: u32 = 76;
    pub const COMMAND_ACK: u32 = 77;
    pub const FOLLOW_TARGET: u32 = 144;
    pub const AUTOPILOT_VERSION: u32 = 148;
}

const MAGIC_V1: u8 = 0xFE;
const MAGIC_V2: u8 = 0xFD;

/// Extract all complete MAVLink frames (v1 or v2) from one datagram.
///
/// Bytes before the first magic are discarded; frames that fail to parse
/// (CRC error, unknown id, signed frame) are skipped whole.
pub fn parse_datagram(data: &[u8]) -> Vec<(MavHeader, MavMessage)> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let Some(pos) = data[offset..]
            .iter()
            .position(|&b| b == MAGIC_V1 || b == MAGIC_V2)
        else {
            break;
        };
        offset += pos;

        // Need at least magic + length.
        if data.len() - offset < 2 {
            break;
        }

        let magic = data[offset];
        let payload_len = data[offset + 1] as usize;

        let frame_size = if magic == MAGIC_V2 {
            // v2: 10 header + payload + 2 CRC
            let base = 12 + payload_len;
            // incompat_flags bit 0 appends a 13-byte signature
            if data.len() - offset >= 3 && (data[offset + 2] & 0x01) != 0 {
                base + 13
            } else {
                base
            }
        } else {
            // v1: 6 header + payload + 2 CRC
            8 + payload_len
        };

        if data.len() - offset < frame_size {
            break;
        }

        match parse_frame(&data[offset..offset + frame_size]) {
            Some(message) => messages.push(message),
            None => trace!("skipping undecodable frame"),
        }
        offset += frame_size;
    }

    messages
}

/// Parse a single MAVLink frame (v1 or v2) from a byte slice.
fn parse_frame(data: &[u8]) -> Option<(MavHeader, MavMessage)> {
    if data.is_empty() {
        return None;
    }
    let cursor = Cursor::new(data);
    let mut reader = PeekReader::new(cursor);
    if data[0] == MAGIC_V2 {
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader).ok()
    } else {
        mavlink::read_v1_msg::<MavMessage, _>(&mut reader).ok()
    }
}

/// The session's outbound serializer.
pub struct MavSender {
    link: Arc<UdpLink>,
    own_system_id: u8,
    own_component_id: u8,
    sequence: Mutex<u8>,
}

impl MavSender {
    pub fn new(link: Arc<UdpLink>, own_system_id: u8, own_component_id: u8) -> Self {
        Self {
            link,
            own_system_id,
            own_component_id,
            sequence: Mutex::new(0),
        }
    }

    /// Pack `message` as MAVLink v2 and send it to the learned peer.
    pub fn send(&self, message: &MavMessage) -> Result<(), LinkError> {
        let header = {
            let mut sequence = self.sequence.lock();
            let header = MavHeader {
                system_id: self.own_system_id,
                component_id: self.own_component_id,
                sequence: *sequence,
            };
            *sequence = sequence.wrapping_add(1);
            header
        };

        let mut buf = Cursor::new(Vec::with_capacity(280));
        mavlink::write_v2_msg(&mut buf, header, message)
            .map_err(|e| LinkError::Io(io::Error::other(format!("{e:?}"))))?;
        self.link.send(&buf.into_inner())
    }
}
