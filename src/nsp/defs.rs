use bitflags::bitflags;
use std::fmt::{self, Display};
use thiserror::Error;

// Sequence numbers occupy the low 12 bits of their 16 bit field.
pub const SEG_NUM_MASK: u16 = 0x0fff;

// Ack field bits (16 bit little-endian word at the head of data-bearing
// messages, up to two of them).
pub const ACK_PRESENT: u16 = 0x8000;
pub const ACK_NAK: u16 = 0x4000;
pub const ACK_CROSS: u16 = 0x2000;

// Largest NSP data header we ever put in front of a segment: msgflag (1),
// two link addresses (4), two ack words (4) and the segment number (2).
pub const MAX_NSP_DATA_HEADER: u16 = 11;

// Flow control type advertised in the services byte of CI/CC messages.
pub const FC_MASK: u8 = 0x0c;
pub const FC_NONE: u8 = 0x00;
pub const FC_SCMC: u8 = 0x04; // segment count
pub const FC_MCMC: u8 = 0x08; // message count

// menuver bits of a Connect Initiate.
pub const MENUVER_ACC: u8 = 0x01;
pub const MENUVER_USR: u8 = 0x02;

// Disconnect reason codes from the NSP functional specification.
pub const REASON_OK: u16 = 0;
pub const REASON_NR: u16 = 1; // no resources
pub const REASON_SD: u16 = 3; // node shutting down
pub const REASON_ID: u16 = 4; // invalid destination end user
pub const REASON_US: u16 = 7; // unspecified error (source user)
pub const REASON_NL: u16 = 41; // no link
pub const REASON_DC: u16 = 42; // disconnect confirm
pub const REASON_IO: u16 = 43; // image data field overflow

/// The DECnet socket states. OPEN is a passive listener; CLOSED is the
/// resting state of an unbound endpoint and the end of every lifetime.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum NspState {
    Open,            // O:   listening
    ConnectReceive,  // CR:  inbound CI being accepted
    DiscReject,      // DR:  we rejected, awaiting confirm
    DiscRejectDone,  // DRC: reject confirmed
    ConnectConfirm,  // CC:  confirm sent, awaiting first traffic
    ConnectInit,     // CI:  initiate sent
    NoResources,     // NR
    NoCommunication, // NC
    ConnectDelivered, // CD: initiate acknowledged by peer NSP
    Rejected,        // RJ
    Run,             // RUN: data may flow
    DiscNotified,    // DN:  peer disconnected a running link
    DiscInitDone,    // DIC: our disconnect confirmed
    DiscInit,        // DI:  disconnect sent
    ClosedNotified,  // CN
    Closed,          // CL
}

impl NspState {
    /// States from which no further transition is possible. Input arriving
    /// for a connection in one of these is dropped without reply.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NspState::DiscRejectDone
                | NspState::NoResources
                | NspState::NoCommunication
                | NspState::Rejected
                | NspState::DiscNotified
                | NspState::DiscInitDone
                | NspState::ClosedNotified
                | NspState::Closed
        )
    }
}

impl Display for NspState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NspState::Open => write!(f, "OPEN"),
            NspState::ConnectReceive => write!(f, "CONNECT-RECEIVE"),
            NspState::DiscReject => write!(f, "DISC-REJECT"),
            NspState::DiscRejectDone => write!(f, "DISC-REJECT-COMPLETE"),
            NspState::ConnectConfirm => write!(f, "CONNECT-CONFIRM"),
            NspState::ConnectInit => write!(f, "CONNECT-INITIATE"),
            NspState::NoResources => write!(f, "NO-RESOURCES"),
            NspState::NoCommunication => write!(f, "NO-COMMUNICATION"),
            NspState::ConnectDelivered => write!(f, "CONNECT-DELIVERED"),
            NspState::Rejected => write!(f, "REJECTED"),
            NspState::Run => write!(f, "RUN"),
            NspState::DiscNotified => write!(f, "DISC-NOTIFIED"),
            NspState::DiscInitDone => write!(f, "DISC-INITIATE-COMPLETE"),
            NspState::DiscInit => write!(f, "DISC-INITIATE"),
            NspState::ClosedNotified => write!(f, "CLOSED-NOTIFIED"),
            NspState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Flow gate commanded over the link-service subchannel. The low two bits
/// of lsflags carry one of these on the wire.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum FlowGate {
    NoChange, // 0
    DontSend, // 1
    Send,     // 2
}

impl Default for FlowGate {
    fn default() -> Self {
        FlowGate::Send
    }
}

/// Peer-advertised flow control policy, decoded from the services byte.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum FlowControl {
    #[default]
    None,
    SegmentCount,
    MessageCount,
}

impl FlowControl {
    pub fn from_services(services: u8) -> Self {
        match services & FC_MASK {
            FC_SCMC => FlowControl::SegmentCount,
            FC_MCMC => FlowControl::MessageCount,
            _ => FlowControl::None,
        }
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Shutdown: u8 {
        const RCV = 0x01;
        const SND = 0x02;
        const MASK = 0x03;
    }
}

/// Condition a terminal transition leaves on the socket, reported to the
/// user by the next socket call.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SockErr {
    Refused,     // peer rejected the connect (RJ)
    Unreachable, // our own CI came back (NC)
    Closed,      // link torn down (DN/CN/...)
}

#[derive(Error, Debug)]
pub enum NspError {
    #[error("Connection refused. socket id: {id} remote: 0x{remote:04x}")]
    RefusedError { id: usize, remote: u16 },
    #[error("Host unreachable. socket id: {id} remote: 0x{remote:04x}")]
    UnreachableError { id: usize, remote: u16 },
    #[error("Connection closed. socket id: {id} remote: 0x{remote:04x}")]
    ClosedError { id: usize, remote: u16 },
}
