use bitflags::bitflags;

bitflags! {
    // DECnet Phase IV routing flag byte, as delivered by the routing layer.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RtFlags: u8 {
        const PADDING   = 0x80; // padding follows
        const VERSION   = 0x40; // must be zero
        const IE        = 0x20; // intra-ethernet path
        const RTS       = 0x10; // packet is being returned to sender
        const RQR       = 0x08; // return to sender on non-delivery
        const PKT_MASK  = 0x06; // packet format
    }
}

pub const RT_PKT_SHORT: u8 = 0x02;
pub const RT_PKT_LONG: u8 = 0x06;

impl RtFlags {
    pub fn pkt_format(&self) -> u8 {
        self.bits() & RtFlags::PKT_MASK.bits()
    }
}

/// Control block attached by the routing layer to every inbound segment.
/// Node addresses are 16 bit DECnet addresses, already converted from the
/// little-endian wire representation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteCb {
    pub dev: String,
    pub src_node: u16,
    pub dst_node: u16,
    pub rt_flags: RtFlags,
}

impl RouteCb {
    pub fn new(dev: &str, src_node: u16, dst_node: u16, rt_flags: RtFlags) -> Self {
        Self {
            dev: dev.to_string(),
            src_node,
            dst_node,
            rt_flags,
        }
    }

    /// Route for a segment sent back to whoever sent us this one.
    pub fn reply(&self) -> Self {
        Self {
            dev: self.dev.clone(),
            src_node: self.dst_node,
            dst_node: self.src_node,
            rt_flags: self.rt_flags & RtFlags::IE,
        }
    }
}
