use crate::routing::RouteCb;
use anyhow::{Context, Result};

// NSP message layout (all multi-byte fields little-endian):
//
// +----------+----------+----------+
// | msgflag  | dstaddr  | srcaddr  |     common header; srcaddr is omitted
// |  1 byte  |  2 bytes |  2 bytes |     only for the bare connack (0x24)
// +----------+----------+----------+
//
// Data / other-data / link-service messages follow the header with zero,
// one or two 16 bit ack fields and then a 16 bit segment number. Control
// messages (msgflag & 0x0c == 0x08) carry their own bodies; see the
// builders in output.rs.

/// Sidecar control block for an inbound segment. The routing layer fills
/// `route`; the decoder and the per-message handlers fill the rest as the
/// fields are pulled off the wire.
#[derive(Debug, Default, Clone)]
pub struct SegmentCb {
    pub nsp_flags: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub services: u8,
    pub info: u8,
    pub segsize: u16,
    pub segnum: u16,
    pub route: RouteCb,
}

/// An inbound (or reply) segment: a contiguous byte buffer with a pull
/// cursor, so header fields can be consumed from the front while the rest
/// of the buffer remains the payload.
#[derive(Debug, Clone)]
pub struct SegmentBuf {
    data: Vec<u8>,
    pos: usize,
    pub cb: SegmentCb,
}

impl SegmentBuf {
    pub fn new(data: Vec<u8>, route: RouteCb) -> Self {
        Self {
            data,
            pos: 0,
            cb: SegmentCb {
                route,
                ..Default::default()
            },
        }
    }

    /// Bytes not yet pulled.
    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pull(&mut self, n: usize) -> Result<&[u8]> {
        anyhow::ensure!(
            self.len() >= n,
            "Truncated segment. wanted={} remaining={}",
            n,
            self.len()
        );
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    pub fn pull_u8(&mut self) -> Result<u8> {
        Ok(self.pull(1)?[0])
    }

    pub fn pull_u16_le(&mut self) -> Result<u16> {
        let b = self.pull(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn peek_u16_le(&self) -> Result<u16> {
        anyhow::ensure!(self.len() >= 2, "Truncated segment. wanted=2 remaining={}", self.len());
        Ok(u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]))
    }

    /// The unpulled remainder of the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn into_payload(mut self) -> Vec<u8> {
        self.data.split_off(self.pos)
    }

    /// Whole on-the-wire image, including already-pulled header bytes.
    pub fn as_wire(&self) -> &[u8] {
        &self.data
    }

    /// Full in-memory cost of holding on to this segment. Receive-buffer
    /// accounting charges this, not just the payload length.
    pub fn truesize(&self) -> usize {
        self.data.len() + std::mem::size_of::<SegmentBuf>()
    }
}

/// Message class decoded from the msgflag byte. `classify` assumes the
/// reserved bits (0x83) have already been checked by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Nop,
    ConnInit { retrans: bool },
    ConnConf,
    DiscInit,
    DiscConf,
    Reserved,
    ConnAck,
    Ack { other: bool },
    LinkService,
    OtherData,
    Data,
}

impl MsgKind {
    pub fn classify(flags: u8) -> Option<MsgKind> {
        match flags & 0x0c {
            0x08 => Some(match flags & 0x70 {
                0x00 => MsgKind::Nop,
                0x10 => MsgKind::ConnInit { retrans: false },
                0x60 => MsgKind::ConnInit { retrans: true },
                0x20 => MsgKind::ConnConf,
                0x30 => MsgKind::DiscInit,
                0x40 => MsgKind::DiscConf,
                _ => MsgKind::Reserved, // 0x50 Phase II init, 0x70 reserved
            }),
            0x04 => {
                // Bare acks carry no payload. 0x24 is the connack, which
                // has no ack data at all.
                if flags == 0x24 {
                    Some(MsgKind::ConnAck)
                } else {
                    Some(MsgKind::Ack {
                        other: flags & 0x10 != 0,
                    })
                }
            }
            0x00 => Some(match flags & 0x70 {
                0x10 => MsgKind::LinkService,
                0x30 => MsgKind::OtherData,
                _ => MsgKind::Data, // 0x20/0x40 are the BOM/EOM bits
            }),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MsgKind::Nop
                | MsgKind::ConnInit { .. }
                | MsgKind::ConnConf
                | MsgKind::DiscInit
                | MsgKind::DiscConf
                | MsgKind::Reserved
        )
    }

    /// True for the message classes whose "own" ack field refers to the
    /// other-data subchannel (other-data, link-service, other-data acks).
    pub fn carries_other(&self) -> bool {
        matches!(
            self,
            MsgKind::LinkService | MsgKind::OtherData | MsgKind::Ack { other: true }
        )
    }
}

/// A session end point named in a Connect Initiate: an object number, or a
/// name for number zero. Format 2 additionally carries group/user codes
/// which we validate but do not keep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectEndpoint {
    pub number: u8,
    pub name: String,
}

impl ObjectEndpoint {
    pub fn from_number(number: u8) -> Self {
        Self {
            number,
            name: String::new(),
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self {
            number: 0,
            name: name.to_string(),
        }
    }

    /// Decode one object descriptor. Returns the endpoint, the number of
    /// bytes consumed and the descriptor format byte.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize, u8)> {
        anyhow::ensure!(buf.len() >= 2, "Truncated object descriptor.");
        let format = buf[0];
        let number = buf[1];
        match format {
            0 => Ok((Self::from_number(number), 2, format)),
            1 | 2 => {
                // Format 2 carries 2 byte group and user codes before the
                // name; format 1 goes straight to the name.
                let skip = if format == 2 { 4 } else { 0 };
                let name_at = 2 + skip;
                anyhow::ensure!(buf.len() > name_at, "Truncated object descriptor.");
                let namelen = buf[name_at] as usize;
                anyhow::ensure!(namelen <= 16, "Object name too long ({}).", namelen);
                anyhow::ensure!(
                    buf.len() >= name_at + 1 + namelen,
                    "Truncated object name."
                );
                let name = String::from_utf8_lossy(&buf[name_at + 1..name_at + 1 + namelen])
                    .into_owned();
                Ok((Self { number, name }, name_at + 1 + namelen, format))
            }
            _ => anyhow::bail!("Unknown object descriptor format {}.", format),
        }
    }

    pub fn decode_from(seg: &mut SegmentBuf) -> Result<(Self, u8)> {
        let (endpoint, used, format) =
            Self::decode(seg.payload()).context("Failed to decode object descriptor.")?;
        seg.pull(used)?;
        Ok((endpoint, format))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.name.is_empty() {
            out.push(0);
            out.push(self.number);
        } else {
            out.push(1);
            out.push(self.number);
            out.push(self.name.len() as u8);
            out.extend_from_slice(self.name.as_bytes());
        }
    }

    /// A listener bound to a nonzero object number matches on the number;
    /// a named listener matches on the name.
    pub fn matches(&self, wanted: &Self) -> bool {
        if self.number != 0 || wanted.number != 0 {
            self.number == wanted.number
        } else {
            self.name == wanted.name
        }
    }
}
