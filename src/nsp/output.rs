use crate::nsp::{
    defs::{FlowGate, ACK_PRESENT, REASON_OK},
    input::{seq_add, NspConnection, PendingMsg},
    packet::{ObjectEndpoint, SegmentBuf},
    usrreq::NspStack,
};
use anyhow::{Context, Result};
use log;

// Message flag bytes for everything we originate.
const MSG_LINK_SERVICE: u8 = 0x10;
const MSG_CONN_INIT: u8 = 0x18;
const MSG_CONN_CONF: u8 = 0x28;
const MSG_DISC_INIT: u8 = 0x38;
const MSG_DISC_CONF: u8 = 0x48;
const MSG_DATA_ACK: u8 = 0x04;
const MSG_OTH_ACK: u8 = 0x14;

// Services and info bytes we advertise in connect messages: no flow
// control, NSP 4.x.
const SERVICES_LOC: u8 = 0x01;
const INFO_LOC: u8 = 0x03;

impl NspStack {
    /// Hand a finished segment to the routing layer.
    pub(crate) fn emit_segment(&self, seg: SegmentBuf) -> Result<()> {
        log::trace!(
            "Emitting segment. flags=0x{:02x} dst_node=0x{:04x} len={}",
            seg.cb.nsp_flags,
            seg.cb.route.dst_node,
            seg.as_wire().len()
        );
        self.tx
            .send(seg)
            .context("Failed to hand a segment to the routing layer.")
    }

    fn emit_to_conn(&self, conn: &NspConnection, buf: Vec<u8>) -> Result<()> {
        let route = conn
            .route
            .clone()
            .with_context(|| format!("No route for connection 0x{:04x}.", conn.local_port))?;
        let flags = buf[0];
        let mut seg = SegmentBuf::new(buf, route);
        seg.cb.nsp_flags = flags;
        seg.cb.src_port = conn.local_port;
        seg.cb.dst_port = conn.remote_port;
        self.emit_segment(seg)
    }

    fn msg_header(conn: &NspConnection, flags: u8) -> Vec<u8> {
        let mut buf = vec![flags];
        buf.extend_from_slice(&conn.remote_port.to_le_bytes());
        buf.extend_from_slice(&conn.local_port.to_le_bytes());
        buf
    }

    pub fn send_data_ack(&self, conn: &mut NspConnection) -> Result<()> {
        let mut buf = Self::msg_header(conn, MSG_DATA_ACK);
        buf.extend_from_slice(&(ACK_PRESENT | conn.data.num_rcv).to_le_bytes());
        conn.ackxmt_dat = conn.data.num_rcv;
        conn.timer.clear_ack_delay();
        self.emit_to_conn(conn, buf)
    }

    pub fn send_oth_ack(&self, conn: &mut NspConnection) -> Result<()> {
        let mut buf = Self::msg_header(conn, MSG_OTH_ACK);
        buf.extend_from_slice(&(ACK_PRESENT | conn.other.num_rcv).to_le_bytes());
        conn.ackxmt_oth = conn.other.num_rcv;
        self.emit_to_conn(conn, buf)
    }

    pub(crate) fn send_disc_init(
        &self,
        conn: &NspConnection,
        reason: u16,
        data: &[u8],
    ) -> Result<()> {
        anyhow::ensure!(
            data.len() <= 16,
            "Disconnect data too long ({} > 16).",
            data.len()
        );
        let mut buf = Self::msg_header(conn, MSG_DISC_INIT);
        buf.extend_from_slice(&reason.to_le_bytes());
        buf.push(data.len() as u8);
        buf.extend_from_slice(data);
        self.emit_to_conn(conn, buf)
    }

    pub(crate) fn send_disc_conf(&self, conn: &NspConnection, reason: u16) -> Result<()> {
        let mut buf = Self::msg_header(conn, MSG_DISC_CONF);
        buf.extend_from_slice(&reason.to_le_bytes());
        self.emit_to_conn(conn, buf)
    }

    /// Disconnect reply addressed straight from an offending segment,
    /// for connections we do not have.
    pub(crate) fn return_disc_init(&self, offender: &SegmentBuf, reason: u16) -> Result<()> {
        let mut buf = vec![MSG_DISC_INIT];
        buf.extend_from_slice(&offender.cb.src_port.to_le_bytes());
        buf.extend_from_slice(&offender.cb.dst_port.to_le_bytes());
        buf.extend_from_slice(&reason.to_le_bytes());
        buf.push(0);
        let flags = buf[0];
        let mut seg = SegmentBuf::new(buf, offender.cb.route.reply());
        seg.cb.nsp_flags = flags;
        seg.cb.src_port = offender.cb.dst_port;
        seg.cb.dst_port = offender.cb.src_port;
        self.emit_segment(seg)
    }

    pub(crate) fn return_disc_conf(&self, offender: &SegmentBuf, reason: u16) -> Result<()> {
        let mut buf = vec![MSG_DISC_CONF];
        buf.extend_from_slice(&offender.cb.src_port.to_le_bytes());
        buf.extend_from_slice(&offender.cb.dst_port.to_le_bytes());
        buf.extend_from_slice(&reason.to_le_bytes());
        let flags = buf[0];
        let mut seg = SegmentBuf::new(buf, offender.cb.route.reply());
        seg.cb.nsp_flags = flags;
        seg.cb.src_port = offender.cb.dst_port;
        seg.cb.dst_port = offender.cb.src_port;
        self.emit_segment(seg)
    }

    /// Connect Confirm for an accepted Connect Initiate.
    pub(crate) fn send_conn_conf(&self, conn: &NspConnection) -> Result<()> {
        let mut buf = Self::msg_header(conn, MSG_CONN_CONF);
        buf.push(SERVICES_LOC);
        buf.push(INFO_LOC);
        buf.extend_from_slice(&self.config.segbufsize.to_le_bytes());
        self.emit_to_conn(conn, buf)
    }

    /// Connect Initiate for an outbound open. The destination link
    /// address is zero until the peer assigns one.
    pub(crate) fn send_conn_init(
        &self,
        conn: &NspConnection,
        dst_obj: &ObjectEndpoint,
    ) -> Result<()> {
        let mut buf = vec![MSG_CONN_INIT];
        buf.extend_from_slice(&conn.local_port.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.push(SERVICES_LOC);
        buf.push(INFO_LOC);
        buf.extend_from_slice(&self.config.segbufsize.to_le_bytes());
        dst_obj.encode(&mut buf);
        conn.local_obj.encode(&mut buf);
        buf.push(0); // menuver: no access data, no user data
        let flags = buf[0];
        let route = conn
            .route
            .clone()
            .with_context(|| format!("No route for connection 0x{:04x}.", conn.local_port))?;
        let mut seg = SegmentBuf::new(buf, route);
        seg.cb.nsp_flags = flags;
        seg.cb.src_port = conn.local_port;
        self.emit_segment(seg)
    }

    /// Link service message on the other-data subchannel. Used for the
    /// flow gates we advertise and for request-count grants.
    pub(crate) fn send_link_service(
        &self,
        conn: &mut NspConnection,
        lsflags: u8,
        fcval: i8,
    ) -> Result<()> {
        seq_add(&mut conn.other.num_sent, 1);
        let mut buf = Self::msg_header(conn, MSG_LINK_SERVICE);
        buf.extend_from_slice(&conn.other.num_sent.to_le_bytes());
        buf.push(lsflags);
        buf.push(fcval as u8);
        self.emit_to_conn(conn, buf)
    }

    /// Emit whatever control message the receive path latched on the
    /// connection. Driven from user context and timer expiry.
    pub fn flush_pending(&self, socket_id: usize) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            match conn.pending.take() {
                Some(PendingMsg::IdleAck) => self.send_data_ack(conn),
                Some(PendingMsg::FlowSwitch) => {
                    let lsflags = match conn.flowloc_sw {
                        FlowGate::DontSend => 0x01,
                        FlowGate::Send => 0x02,
                        FlowGate::NoChange => 0x00,
                    };
                    self.send_link_service(conn, lsflags, 0)
                }
                None => Ok(()),
            }
        } else {
            anyhow::bail!("Cannot find the socket (id={}).", socket_id);
        }
    }
}

// Reason passed on user disconnects that carry no particular error.
pub const DISC_REASON_NONE: u16 = REASON_OK;
