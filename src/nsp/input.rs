use crate::{
    nsp::{
        defs::{
            FlowControl, FlowGate, NspState, Shutdown, SockErr, ACK_CROSS, ACK_NAK, ACK_PRESENT,
            MAX_NSP_DATA_HEADER, MENUVER_ACC, MENUVER_USR, REASON_DC, REASON_ID, REASON_IO,
            REASON_NL, REASON_OK, REASON_US, SEG_NUM_MASK,
        },
        packet::{MsgKind, ObjectEndpoint, SegmentBuf},
        timer::NspTimer,
        usrreq::NspStack,
    },
    routing::{RouteCb, RtFlags, RT_PKT_SHORT},
};
use anyhow::{Context, Result};
use log;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

// Connect Initiates waiting in an accept queue; beyond this they are
// dropped and the initiator retransmits.
const NSP_MAX_ACCEPT_QUEUE: usize = 16;
// Segments parked on a connection while user context holds it.
const NSP_MAX_BACKLOG: usize = 64;

impl NspStack {
    /// Entry point from the routing layer. Classifies the segment, peels
    /// the link addresses, resolves the target connection and hands off,
    /// honouring the returned-to-sender and user-lock rules.
    pub fn rx_packet(&self, mut seg: SegmentBuf) -> Result<()> {
        if seg.len() < 1 {
            log::trace!("Discarding an empty segment.");
            return Ok(());
        }
        let flags = seg.pull_u8()?;
        seg.cb.nsp_flags = flags;
        log::trace!("rx_packet: message type 0x{:02x}", flags);
        // Reserved bits must be zero.
        if flags & 0x83 != 0 {
            log::trace!("Discarding a segment with reserved flag bits. flags=0x{:02x}", flags);
            return Ok(());
        }
        let kind = match MsgKind::classify(flags) {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let returned = seg.cb.route.rt_flags.contains(RtFlags::RTS);
        let mut reason = REASON_NL;

        if kind.is_control() {
            match kind {
                MsgKind::Nop | MsgKind::Reserved => return Ok(()),
                MsgKind::ConnInit { .. } => {
                    if returned {
                        // One of our own Connect Initiates came back. The
                        // leading words are the addresses as we sent them,
                        // so the source field is the key on our side.
                        if seg.len() >= 4 {
                            let dst_port = seg.pull_u16_le()?;
                            let src_port = seg.pull_u16_le()?;
                            seg.cb.dst_port = dst_port;
                            seg.cb.src_port = src_port;
                            let (socket_id, mut conns) = self.get_returned_socket_id(dst_port);
                            if let Some(id) = socket_id {
                                self.returned_conn_init(id, &mut conns)?;
                            }
                        }
                        return Ok(());
                    }
                    return match self.find_listener(&mut seg, &mut reason)? {
                        Some(listener_id) => self.deliver(listener_id, seg),
                        None => self.no_socket(seg, reason),
                    };
                }
                _ => {}
            }
        }

        // Every returnable type (CI and retransmitted CI) is handled
        // above; other returned segments are not ours to interpret.
        if returned {
            return Ok(());
        }

        if seg.len() < 2 {
            return Ok(());
        }
        seg.cb.dst_port = seg.pull_u16_le()?;
        // Bare connacks carry no source address.
        if kind != MsgKind::ConnAck {
            if seg.len() < 2 {
                return Ok(());
            }
            seg.cb.src_port = seg.pull_u16_le()?;
        }

        let (socket_id, conns) = self.get_socket_id_by_port(seg.cb.dst_port);
        match socket_id {
            Some(id) => self.deliver_locked(id, seg, conns),
            None => {
                drop(conns);
                self.no_socket(seg, reason)
            }
        }
    }

    fn deliver(&self, socket_id: usize, seg: SegmentBuf) -> Result<()> {
        let conns = self.connections.lock().unwrap();
        self.deliver_locked(socket_id, seg, conns)
    }

    fn deliver_locked(
        &self,
        socket_id: usize,
        seg: SegmentBuf,
        mut conns: MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) -> Result<()> {
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            // The routing layer may have found a newer path to the remote
            // system which takes the Intra-Ethernet bit into account.
            // Switch to it only in RUN so listening sockets keep their
            // route unset.
            if conn.state == NspState::Run {
                let newer = seg.cb.route.reply();
                if conn.route.as_ref() != Some(&newer) {
                    log::trace!(
                        "[{}] Switching to a newer path via node 0x{:04x}.",
                        conn.print_log_prefix(socket_id),
                        newer.dst_node
                    );
                    conn.route = Some(newer);
                }
            }
            conn.rxt_shift = 0;
            conn.stamp = Instant::now();
            if conn.user_locked {
                if conn.backlog.len() >= NSP_MAX_BACKLOG {
                    conn.backlog_drops += 1;
                    log::debug!(
                        "[{}] Backlog full, segment dropped. drops={}",
                        conn.print_log_prefix(socket_id),
                        conn.backlog_drops
                    );
                } else {
                    conn.backlog.push_back(seg);
                }
                return Ok(());
            }
        } else {
            anyhow::bail!("No NspConnection Data for the socket (id={}). This should be impossible if locking logic is correct.", socket_id);
        }
        self.backlog_rcv(socket_id, seg, conns)
    }

    /// The main receive routine for sockets. Called from the dispatcher
    /// when the socket is not held by user context, and from the user-lock
    /// release path for everything that queued up in between.
    pub fn backlog_rcv(
        &self,
        socket_id: usize,
        mut seg: SegmentBuf,
        mut conns: MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) -> Result<()> {
        let flags = seg.cb.nsp_flags;
        let kind = MsgKind::classify(flags)
            .with_context(|| format!("Unclassifiable message reached backlog_rcv. flags=0x{:02x}", flags))?;
        if seg.cb.route.rt_flags.contains(RtFlags::RTS) {
            return Ok(());
        }
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            if conn.state.is_terminal() {
                log::debug!(
                    "[{}] Dropping a segment for a finished connection. flags=0x{:02x}",
                    conn.print_log_prefix(socket_id),
                    flags
                );
                return Ok(());
            }
            match kind {
                MsgKind::ConnInit { .. } => self.conn_init(socket_id, conn, seg)?,
                MsgKind::ConnConf => self.conn_conf(socket_id, conn, seg)?,
                MsgKind::DiscInit => self.disc_init(socket_id, conn, seg)?,
                MsgKind::DiscConf => self.disc_conf(socket_id, conn, seg)?,
                MsgKind::ConnAck => self.conn_ack(socket_id, conn),
                MsgKind::Nop | MsgKind::Reserved => {}
                _ => {
                    // Both data and ack frames kick a CONNECT-CONFIRM
                    // socket into RUN: our confirm evidently arrived.
                    if conn.state == NspState::ConnectConfirm {
                        conn.state = NspState::Run;
                        self.clamp_segsize(conn, &seg.cb.route);
                        log::debug!(
                            "[{}] State changed from CONNECT-CONFIRM to RUN.",
                            conn.print_log_prefix(socket_id)
                        );
                        self.publish_event(NspEvent {
                            socket_id,
                            event: NspEventType::Established,
                        });
                    }
                    // Ack fields apply equally to data, other-data, link
                    // service and both flavours of bare ack.
                    self.process_ack(socket_id, conn, &mut seg, kind.carries_other());
                    if conn.state != NspState::Run {
                        log::debug!(
                            "[{}] Dropping a data-class segment outside RUN. flags=0x{:02x}",
                            conn.print_log_prefix(socket_id),
                            flags
                        );
                        return Ok(());
                    }
                    match kind {
                        MsgKind::LinkService => self.linkservice(socket_id, conn, seg)?,
                        MsgKind::OtherData => self.otherdata(socket_id, conn, seg)?,
                        MsgKind::Data => self.data(socket_id, conn, seg)?,
                        // A bare ack is spent once its fields are read.
                        _ => {}
                    }
                }
            }
            Ok(())
        } else {
            anyhow::bail!("No socket (id={}).", socket_id);
        }
    }

    /// A Connect Initiate reaching a listening socket joins its accept
    /// queue; a full queue drops it and the initiator will retransmit.
    fn conn_init(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        seg: SegmentBuf,
    ) -> Result<()> {
        if conn.state != NspState::Open {
            log::debug!(
                "[{}] Ignoring a Connect Initiate for a non-listening socket.",
                conn.print_log_prefix(socket_id)
            );
            return Ok(());
        }
        let mut listen_queue = self.listen_queue.lock().unwrap();
        if let Some(queue) = listen_queue.get_mut(&socket_id) {
            if queue.pending.len() >= NSP_MAX_ACCEPT_QUEUE {
                log::debug!(
                    "[{}] Accept queue is full ({}), Connect Initiate dropped.",
                    conn.print_log_prefix(socket_id),
                    queue.pending.len()
                );
                return Ok(());
            }
            queue.pending.push_back(seg);
        } else {
            anyhow::bail!(
                "No listen queue for socket id {} which state is Open.",
                socket_id
            );
        }
        drop(listen_queue);
        self.publish_event(NspEvent {
            socket_id,
            event: NspEventType::ConnectRequest,
        });
        Ok(())
    }

    fn conn_conf(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        mut seg: SegmentBuf,
    ) -> Result<()> {
        if seg.len() < 4 {
            return Ok(());
        }
        seg.cb.services = seg.pull_u8()?;
        seg.cb.info = seg.pull_u8()?;
        seg.cb.segsize = seg.pull_u16_le()?;

        if conn.state == NspState::ConnectInit || conn.state == NspState::ConnectDelivered {
            let prev = conn.state;
            conn.timer.clear_persist();
            conn.timer.clear_conn();
            conn.remote_port = seg.cb.src_port;
            conn.state = NspState::Run;
            conn.services_rem = seg.cb.services;
            conn.info_rem = seg.cb.info;
            conn.segsize_rem = seg.cb.segsize;
            conn.route = Some(seg.cb.route.reply());
            self.clamp_segsize(conn, &seg.cb.route);
            if FlowControl::from_services(conn.services_rem) == FlowControl::None {
                conn.max_window = self.config.no_fc_max_cwnd;
            }
            if seg.len() > 0 {
                let dlen = seg.payload()[0] as usize;
                if dlen <= 16 && dlen < seg.len() {
                    conn.conndata_in = seg.payload()[1..1 + dlen].to_vec();
                }
            }
            conn.pending = Some(PendingMsg::IdleAck);
            log::debug!(
                "[{}] State changed from {} to RUN. services=0x{:02x} segsize={}",
                conn.print_log_prefix(socket_id),
                prev,
                conn.services_rem,
                conn.segsize_rem
            );
            self.publish_event(NspEvent {
                socket_id,
                event: NspEventType::Established,
            });
        }
        Ok(())
    }

    fn conn_ack(&self, socket_id: usize, conn: &mut NspConnection) {
        if conn.state == NspState::ConnectInit {
            conn.state = NspState::ConnectDelivered;
            conn.timer.clear_persist();
            conn.timer.fire_conn(self.config.outgoing_timer);
            log::debug!(
                "[{}] State changed from CONNECT-INITIATE to CONNECT-DELIVERED.",
                conn.print_log_prefix(socket_id)
            );
        }
    }

    fn disc_init(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        mut seg: SegmentBuf,
    ) -> Result<()> {
        if seg.len() < 2 {
            return Ok(());
        }
        let reason = seg.pull_u16_le()?;
        conn.disc_reason_in = reason;
        conn.discdata_in.clear();
        if seg.len() > 0 {
            let dlen = seg.payload()[0] as usize;
            if dlen <= 16 && dlen < seg.len() {
                conn.discdata_in = seg.payload()[1..1 + dlen].to_vec();
            }
        }
        conn.remote_port = seg.cb.src_port;

        let prev = conn.state;
        match conn.state {
            NspState::ConnectInit | NspState::ConnectDelivered => {
                conn.state = NspState::Rejected;
                conn.sock_err = Some(SockErr::Refused);
                conn.timer.clear_conn();
                self.publish_event(NspEvent {
                    socket_id,
                    event: NspEventType::Refused,
                });
            }
            NspState::Run => {
                conn.shutdown |= Shutdown::MASK;
                conn.state = NspState::DiscNotified;
                self.publish_event(NspEvent {
                    socket_id,
                    event: NspEventType::Disconnected,
                });
            }
            NspState::DiscInit => {
                conn.state = NspState::DiscInitDone;
                self.publish_event(NspEvent {
                    socket_id,
                    event: NspEventType::Disconnected,
                });
            }
            _ => {}
        }
        if prev != conn.state {
            log::debug!(
                "[{}] State changed from {} to {} on Disconnect Initiate. reason={}",
                conn.print_log_prefix(socket_id),
                prev,
                conn.state,
                reason
            );
        }

        // Remote machines may send disc init messages with no port
        // identifier while we are still connecting. With no end point
        // there is nobody to confirm to.
        if conn.remote_port != 0 {
            if let Err(e) = self.send_disc_conf(conn, REASON_DC) {
                log::warn!("Failed to send Disconnect Confirm. Err: {:?}", e);
            }
        }
        conn.timer.fire_destroy(conn.rxt_shift);
        Ok(())
    }

    /// Disconnect Confirms double as no-resources and no-link messages
    /// depending on the reason field.
    fn disc_conf(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        mut seg: SegmentBuf,
    ) -> Result<()> {
        if seg.len() != 2 {
            return Ok(());
        }
        let reason = seg.pull_u16_le()?;
        conn.disc_reason_in = reason;

        let prev = conn.state;
        match conn.state {
            NspState::ConnectInit => {
                conn.state = NspState::NoResources;
                conn.sock_err = Some(SockErr::Refused);
            }
            NspState::DiscReject => {
                if reason == REASON_DC {
                    conn.state = NspState::DiscRejectDone;
                }
                if reason == REASON_NL {
                    conn.state = NspState::ClosedNotified;
                }
            }
            NspState::DiscInit => {
                conn.state = NspState::DiscInitDone;
            }
            NspState::Run => {
                conn.shutdown |= Shutdown::MASK;
                conn.state = NspState::ClosedNotified;
                conn.sock_err = Some(SockErr::Closed);
            }
            NspState::ConnectConfirm => {
                conn.state = NspState::ClosedNotified;
                conn.sock_err = Some(SockErr::Closed);
            }
            _ => {}
        }
        if prev != conn.state {
            log::debug!(
                "[{}] State changed from {} to {} on Disconnect Confirm. reason={}",
                conn.print_log_prefix(socket_id),
                prev,
                conn.state,
                reason
            );
            self.publish_event(NspEvent {
                socket_id,
                event: NspEventType::Disconnected,
            });
        }
        conn.timer.fire_destroy(conn.rxt_shift);
        Ok(())
    }

    fn linkservice(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        mut seg: SegmentBuf,
    ) -> Result<()> {
        if seg.len() != 4 {
            return Ok(());
        }
        let segnum = seg.pull_u16_le()? & SEG_NUM_MASK;
        let lsflags = seg.pull_u8()?;
        let fcval = seg.pull_u8()? as i8;
        let fctype = FlowControl::from_services(conn.services_rem);

        // Erroneous flag bits should really abort the connection; for now
        // the message is just ignored.
        if lsflags & 0xf8 != 0 {
            return Ok(());
        }

        if seq_next(conn.other.num_rcv, segnum) {
            seq_add(&mut conn.other.num_rcv, 1);
            let mut wake_up = false;
            if lsflags & 0x04 == 0 {
                // Data subchannel request.
                match lsflags & 0x03 {
                    0x00 => {
                        // Request count adjustment.
                        if fcval < 0 {
                            let p_fcval = -(fcval as i16) as u16;
                            if conn.data.flow_remote > p_fcval
                                && fctype == FlowControl::SegmentCount
                            {
                                conn.data.flow_remote -= p_fcval;
                            }
                        } else if fcval > 0 {
                            conn.data.flow_remote += fcval as u16;
                            wake_up = true;
                        }
                    }
                    0x01 => {
                        conn.flowrem_sw = FlowGate::DontSend;
                        log::debug!(
                            "[{}] Peer gated outgoing data (DONTSEND).",
                            conn.print_log_prefix(socket_id)
                        );
                    }
                    0x02 => {
                        conn.flowrem_sw = FlowGate::Send;
                        log::debug!(
                            "[{}] Peer reopened outgoing data (SEND).",
                            conn.print_log_prefix(socket_id)
                        );
                        wake_up = true;
                    }
                    _ => {}
                }
            } else {
                // Interrupt subchannel request.
                if fcval > 0 {
                    conn.other.flow_remote += fcval as u16;
                    wake_up = true;
                }
            }
            if wake_up {
                self.publish_event(NspEvent {
                    socket_id,
                    event: NspEventType::SendMore,
                });
            }
        }

        self.send_oth_ack(conn)?;
        Ok(())
    }

    fn otherdata(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        mut seg: SegmentBuf,
    ) -> Result<()> {
        if seg.len() < 2 {
            return Ok(());
        }
        let segnum = seg.pull_u16_le()? & SEG_NUM_MASK;
        seg.cb.segnum = segnum;

        if seq_next(conn.other.num_rcv, segnum) {
            if self.queue_segment(socket_id, conn, seg, true) {
                seq_add(&mut conn.other.num_rcv, 1);
                conn.other_report = false;
            }
        } else {
            log::debug!(
                "[{}] Out-of-sequence other-data dropped. expected={} got={}",
                conn.print_log_prefix(socket_id),
                (conn.other.num_rcv + 1) & SEG_NUM_MASK,
                segnum
            );
        }

        self.send_oth_ack(conn)?;
        Ok(())
    }

    fn data(&self, socket_id: usize, conn: &mut NspConnection, mut seg: SegmentBuf) -> Result<()> {
        if seg.len() < 2 {
            return Ok(());
        }
        let raw_segnum = seg.pull_u16_le()?;
        let segnum = raw_segnum & SEG_NUM_MASK;
        seg.cb.segnum = segnum;

        let mut queued = false;
        if seq_next(conn.data.num_rcv, segnum) {
            queued = self.queue_segment(socket_id, conn, seg, false);
            if queued {
                seq_add(&mut conn.data.num_rcv, 1);
            }
            if conn.flowloc_sw == FlowGate::Send && conn.congested() {
                conn.flowloc_sw = FlowGate::DontSend;
                conn.pending = Some(PendingMsg::FlowSwitch);
                log::debug!(
                    "[{}] Receive buffer congested, gating the peer. rmem_alloc={} rcvbuf={}",
                    conn.print_log_prefix(socket_id),
                    conn.rmem_alloc,
                    conn.rcvbuf
                );
            }
        } else {
            log::debug!(
                "[{}] Out-of-sequence data dropped. expected={} got={}",
                conn.print_log_prefix(socket_id),
                (conn.data.num_rcv + 1) & SEG_NUM_MASK,
                segnum
            );
        }

        if queued && !ack_requested(raw_segnum) {
            conn.timer.fire_ack_delay(self.config.ack_delay);
        } else {
            self.send_data_ack(conn)?;
        }
        Ok(())
    }

    /// Universal ack processor. Consumes up to two piggybacked ack fields
    /// from the head of the segment and returns the number of bytes taken.
    /// `other` is true when the carrying message belongs to the other-data
    /// class; the cross-subchannel bit of each field is flipped in that
    /// case so an other-data message's own ack still lands on the
    /// other-data subchannel and its cross ack on the data subchannel.
    pub fn process_ack(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        seg: &mut SegmentBuf,
        other: bool,
    ) -> usize {
        let mut len = 0;
        for _ in 0..2 {
            let mut ack = match seg.peek_u16_le() {
                Ok(word) => word,
                Err(_) => break,
            };
            if ack & ACK_PRESENT == 0 {
                break;
            }
            let _ = seg.pull(2);
            len += 2;
            if ack & ACK_NAK != 0 {
                continue;
            }
            if other {
                ack ^= ACK_CROSS;
            }
            self.apply_ack(socket_id, conn, ack);
        }
        len
    }

    fn apply_ack(&self, socket_id: usize, conn: &mut NspConnection, ack: u16) {
        let value = ack & SEG_NUM_MASK;
        let mut wakeup = false;
        match (ack >> 12) & 0x0003 {
            0 => {
                // ACK - data
                if seq_after(value, conn.data.ack_rcv) {
                    conn.data.ack_rcv = value;
                    release_acked(&mut conn.data.xmit_queue, value);
                    wakeup = true;
                    log::trace!(
                        "[{}] Data ack advanced to {}.",
                        conn.print_log_prefix(socket_id),
                        value
                    );
                }
            }
            2 => {
                // ACK - other-data
                if seq_after(value, conn.other.ack_rcv) {
                    conn.other.ack_rcv = value;
                    release_acked(&mut conn.other.xmit_queue, value);
                    wakeup = true;
                    log::trace!(
                        "[{}] Other-data ack advanced to {}.",
                        conn.print_log_prefix(socket_id),
                        value
                    );
                }
            }
            // NAKs are taken off the wire but not acted upon.
            _ => {}
        }
        // Any ack progression may open the send window, so writers are
        // always woken.
        if wakeup {
            self.publish_event(NspEvent {
                socket_id,
                event: NspEventType::SendMore,
            });
        }
    }

    /// Enqueue a payload-bearing segment on one of the user receive
    /// queues, charging its full in-memory size against the connection's
    /// receive budget.
    fn queue_segment(
        &self,
        socket_id: usize,
        conn: &mut NspConnection,
        seg: SegmentBuf,
        other: bool,
    ) -> bool {
        if let Some(filter) = &conn.filter {
            if !filter(&seg) {
                log::trace!(
                    "[{}] Segment rejected by the socket filter.",
                    conn.print_log_prefix(socket_id)
                );
                return false;
            }
        }
        if conn.rmem_alloc >= conn.rcvbuf {
            conn.drops += 1;
            log::debug!(
                "[{}] Receive buffer exhausted, segment dropped. rmem_alloc={} rcvbuf={} drops={}",
                conn.print_log_prefix(socket_id),
                conn.rmem_alloc,
                conn.rcvbuf,
                conn.drops
            );
            return false;
        }
        conn.rmem_alloc += seg.truesize();
        if other {
            conn.other_receive_queue.push_back(seg);
            self.publish_event(NspEvent {
                socket_id,
                event: NspEventType::OtherDataReady,
            });
        } else {
            conn.data_receive_queue.push_back(seg);
            self.publish_event(NspEvent {
                socket_id,
                event: NspEventType::DataReady,
            });
        }
        true
    }

    /// One of our Connect Initiates was returned by the routing layer:
    /// the destination is unreachable and the socket moves to
    /// NO-COMMUNICATION.
    fn returned_conn_init(
        &self,
        socket_id: usize,
        conns: &mut MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) -> Result<()> {
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            if conn.state == NspState::ConnectInit {
                conn.state = NspState::NoCommunication;
                conn.sock_err = Some(SockErr::Unreachable);
                conn.timer.fire_destroy(conn.rxt_shift);
                log::debug!(
                    "[{}] State changed from CONNECT-INITIATE to NO-COMMUNICATION. Own Connect Initiate returned.",
                    conn.print_log_prefix(socket_id)
                );
                self.publish_event(NspEvent {
                    socket_id,
                    event: NspEventType::Unreachable,
                });
            }
        }
        Ok(())
    }

    /// Decode and validate a Connect Initiate and look up a listening
    /// socket by destination object. On a malformed body the reason code
    /// for the reply (possibly "don't reply") comes from CI_ERR_TABLE.
    fn find_listener(&self, seg: &mut SegmentBuf, reason: &mut u16) -> Result<Option<usize>> {
        if seg.len() < 8 {
            self.log_martian(seg, CI_ERR_TABLE[0].text);
            *reason = CI_ERR_TABLE[0].reason;
            return Ok(None);
        }
        let header = seg.pull(8)?.to_vec();
        seg.cb.src_port = u16::from_le_bytes([header[0], header[1]]);
        seg.cb.dst_port = u16::from_le_bytes([header[2], header[3]]);
        seg.cb.services = header[4];
        seg.cb.info = header[5];
        seg.cb.segsize = u16::from_le_bytes([header[6], header[7]]);

        match ConnInitMsg::parse(&mut seg.clone()) {
            Ok(msg) => {
                let (socket_id, _conns) = self.find_listener_socket(&msg.dst_obj);
                if socket_id.is_none() {
                    log::debug!(
                        "No listener for object number={} name={:?}.",
                        msg.dst_obj.number,
                        msg.dst_obj.name
                    );
                }
                Ok(socket_id)
            }
            Err(step) => {
                self.log_martian(seg, CI_ERR_TABLE[step].text);
                *reason = CI_ERR_TABLE[step].reason;
                Ok(None)
            }
        }
    }

    /// A segment arrived for a link address nobody owns. Connect-class
    /// messages that expect an answer get a no-link style reply; anything
    /// else is dropped. Returned packets are never replied to.
    fn no_socket(&self, seg: SegmentBuf, reason: u16) -> Result<()> {
        if seg.cb.route.rt_flags.contains(RtFlags::RTS) {
            return Ok(());
        }
        if reason != REASON_OK && (seg.cb.nsp_flags & 0x0c) == 0x08 {
            match seg.cb.nsp_flags & 0x70 {
                0x10 | 0x60 => {
                    self.return_disc_init(&seg, reason)?;
                }
                0x20 => {
                    self.return_disc_conf(&seg, reason)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn log_martian(&self, seg: &SegmentBuf, msg: &str) {
        if self.config.log_martians && self.martian_limit.allow() {
            log::info!(
                "NSP: Martian packet ({}) dev={} src=0x{:04x} dst=0x{:04x} srcport=0x{:04x} dstport=0x{:04x}",
                msg,
                seg.cb.route.dev,
                seg.cb.route.src_node,
                seg.cb.route.dst_node,
                seg.cb.src_port,
                seg.cb.dst_port
            );
        }
    }

    /// Off-Ethernet paths cannot carry the segment size the peer offered
    /// over a direct Ethernet; revert to the configured segment buffer
    /// size when the routing header says the path is not intra-Ethernet.
    fn clamp_segsize(&self, conn: &mut NspConnection, route: &RouteCb) {
        if route.rt_flags.pkt_format() == RT_PKT_SHORT
            || !route.rt_flags.contains(RtFlags::IE)
        {
            conn.segsize_rem = self.config.segbufsize - (MAX_NSP_DATA_HEADER + 6);
        }
    }
}

// Table of reason codes to pass back to a node which sent us a badly
// formed Connect Initiate, plus text for the martian log. A zero reason
// means "don't reply"; otherwise a Disconnect Initiate goes out with the
// given reason code.
struct CiErr {
    reason: u16,
    text: &'static str,
}

const CI_ERR_TABLE: [CiErr; 8] = [
    CiErr { reason: REASON_OK, text: "CI: Truncated message" },
    CiErr { reason: REASON_ID, text: "CI: Destination username error" },
    CiErr { reason: REASON_ID, text: "CI: Destination username type" },
    CiErr { reason: REASON_US, text: "CI: Source username error" },
    CiErr { reason: REASON_OK, text: "CI: Truncated at menuver" },
    CiErr { reason: REASON_OK, text: "CI: Truncated before access or user data" },
    CiErr { reason: REASON_IO, text: "CI: Access data format error" },
    CiErr { reason: REASON_IO, text: "CI: User data format error" },
];

/// Decoded body of a Connect Initiate, after the fixed header.
#[derive(Debug, Default, Clone)]
pub struct ConnInitMsg {
    pub dst_obj: ObjectEndpoint,
    pub src_obj: ObjectEndpoint,
    pub menuver: u8,
    pub access: Vec<Vec<u8>>,
    pub user_data: Vec<u8>,
}

impl ConnInitMsg {
    /// Decode the variable part of a CI body. On failure the returned
    /// index selects the CI_ERR_TABLE entry for the failing step.
    pub fn parse(seg: &mut SegmentBuf) -> Result<Self, usize> {
        let (dst_obj, format) = ObjectEndpoint::decode_from(seg).map_err(|_| 1usize)?;
        if format > 1 {
            return Err(2);
        }
        let (src_obj, _) = ObjectEndpoint::decode_from(seg).map_err(|_| 3usize)?;
        if seg.len() < 1 {
            return Err(4);
        }
        let menuver = seg.pull_u8().map_err(|_| 4usize)?;
        if (menuver & (MENUVER_ACC | MENUVER_USR)) != 0 && seg.len() < 1 {
            return Err(5);
        }
        let mut access = Vec::new();
        if menuver & MENUVER_ACC != 0 {
            for _ in 0..3 {
                access.push(check_idf(seg, 39).map_err(|_| 6usize)?);
            }
        }
        let mut user_data = Vec::new();
        if menuver & MENUVER_USR != 0 {
            user_data = check_idf(seg, 16).map_err(|_| 7usize)?;
        }
        Ok(Self {
            dst_obj,
            src_obj,
            menuver,
            access,
            user_data,
        })
    }
}

/// Pull one image data field: a length byte followed by that many bytes,
/// the length capped by `max`.
fn check_idf(seg: &mut SegmentBuf, max: u8) -> Result<Vec<u8>> {
    let flen = seg.pull_u8()?;
    anyhow::ensure!(flen <= max, "Image data field too long ({} > {}).", flen, max);
    Ok(seg.pull(flen as usize)?.to_vec())
}

// true if got is exactly the next segment number after cur
pub fn seq_next(cur: u16, got: u16) -> bool {
    got.wrapping_sub(cur) & SEG_NUM_MASK == 1
}

// true if seq1 is strictly later than seq2 in the 12 bit sequence space
pub fn seq_after(seq1: u16, seq2: u16) -> bool {
    let delta = seq1.wrapping_sub(seq2) & SEG_NUM_MASK;
    delta != 0 && delta < 0x800
}

// true if seq1 <= seq2
pub fn seq_less_equal(seq1: u16, seq2: u16) -> bool {
    !seq_after(seq1, seq2)
}

pub fn seq_add(seq: &mut u16, n: u16) {
    *seq = seq.wrapping_add(n) & SEG_NUM_MASK;
}

// Bit 12 of the segment number field asks the receiver to acknowledge the
// segment at once instead of coalescing.
pub fn ack_requested(raw_segnum: u16) -> bool {
    raw_segnum & 0x1000 != 0
}

/// Drop every transmit-queue entry whose segment number is covered by the
/// acknowledged high-water mark. Returns true if anything came off.
pub fn release_acked(queue: &mut VecDeque<SendQueueEntry>, acked: u16) -> bool {
    let mut released = false;
    while let Some(front) = queue.front() {
        if seq_after(front.segnum, acked) {
            break;
        }
        queue.pop_front();
        released = true;
    }
    released
}

#[derive(Debug)]
pub struct ListenQueue {
    pub pending: VecDeque<SegmentBuf>,
}

/// Outbound control message latched on the connection for the next
/// convenient moment (user or timer context) to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMsg {
    IdleAck,
    FlowSwitch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NspEvent {
    pub socket_id: usize,
    pub event: NspEventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NspEventType {
    InitialState,
    ConnectRequest,
    Established,
    Refused,
    Unreachable,
    Disconnected,
    SendMore,
    DataReady,
    OtherDataReady,
}

pub type SegmentFilter = Box<dyn Fn(&SegmentBuf) -> bool + Send + Sync>;

/// An outstanding outbound segment awaiting acknowledgement. The send
/// path owns insertion; the ack processor removes covered entries.
#[derive(Debug, Clone)]
pub struct SendQueueEntry {
    pub segnum: u16,
    pub payload: Vec<u8>,
}

/// One sequence/flow space. NSP runs two of these per connection: the
/// data subchannel and the other-data (interrupt) subchannel.
#[derive(Debug, Default)]
pub struct Subchannel {
    pub num_sent: u16,
    pub num_rcv: u16,
    pub ack_rcv: u16, // highest ack received, monotone in the 12 bit space
    pub flow_remote: u16,
    pub xmit_queue: VecDeque<SendQueueEntry>,
}

impl Subchannel {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }
}

pub struct NspConnection {
    pub state: NspState,
    pub local_port: u16,
    pub remote_port: u16, // zero until learned from the peer
    pub local_obj: ObjectEndpoint,
    pub remote_obj: ObjectEndpoint,
    pub parent_id: Option<usize>,
    pub services_rem: u8,
    pub info_rem: u8,
    pub segsize_rem: u16,
    pub max_window: usize,
    pub data: Subchannel,
    pub other: Subchannel,
    pub flowrem_sw: FlowGate, // gate the peer commands on our sender
    pub flowloc_sw: FlowGate, // gate we advertise on the peer's sender
    pub conndata_in: Vec<u8>,
    pub discdata_in: Vec<u8>,
    pub disc_reason_in: u16,
    pub timer: NspTimer,
    pub stamp: Instant, // when we last received a message
    pub rxt_shift: usize,
    pub route: Option<RouteCb>,
    pub data_receive_queue: VecDeque<SegmentBuf>,
    pub other_receive_queue: VecDeque<SegmentBuf>,
    pub rmem_alloc: usize,
    pub rcvbuf: usize,
    pub drops: usize,
    pub other_report: bool,
    pub ackxmt_dat: u16, // last data ack sent to the peer
    pub ackxmt_oth: u16,
    pub sock_err: Option<SockErr>,
    pub shutdown: Shutdown,
    pub pending: Option<PendingMsg>,
    pub user_locked: bool,
    pub backlog: VecDeque<SegmentBuf>,
    pub backlog_drops: usize,
    pub filter: Option<SegmentFilter>,
}

impl NspConnection {
    pub fn new(local_port: u16, local_obj: ObjectEndpoint) -> Self {
        NspConnection {
            state: NspState::Closed,
            local_port,
            remote_port: 0,
            local_obj,
            remote_obj: ObjectEndpoint::default(),
            parent_id: None,
            services_rem: 0,
            info_rem: 0,
            segsize_rem: 0,
            max_window: 0,
            data: Subchannel::new(),
            other: Subchannel::new(),
            flowrem_sw: FlowGate::Send,
            flowloc_sw: FlowGate::Send,
            conndata_in: Vec::new(),
            discdata_in: Vec::new(),
            disc_reason_in: 0,
            timer: NspTimer::new(),
            stamp: Instant::now(),
            rxt_shift: 0,
            route: None,
            data_receive_queue: VecDeque::new(),
            other_receive_queue: VecDeque::new(),
            rmem_alloc: 0,
            rcvbuf: 0,
            drops: 0,
            other_report: false,
            ackxmt_dat: 0,
            ackxmt_oth: 0,
            sock_err: None,
            shutdown: Shutdown::empty(),
            pending: None,
            user_locked: false,
            backlog: VecDeque::new(),
            backlog_drops: 0,
            filter: None,
        }
    }

    pub fn print_log_prefix(&self, id: usize) -> String {
        format!(
            "id={} state={} local=0x{:04x} remote=0x{:04x}",
            id, self.state, self.local_port, self.remote_port
        )
    }

    /// More than half the receive budget is in use.
    pub fn congested(&self) -> bool {
        self.rmem_alloc > self.rcvbuf / 2
    }

    /// Re-open the local flow gate once the user has drained enough of
    /// the receive queue.
    pub fn maybe_reopen_flow(&mut self) {
        if self.flowloc_sw == FlowGate::DontSend && !self.congested() {
            self.flowloc_sw = FlowGate::Send;
            self.pending = Some(PendingMsg::FlowSwitch);
        }
    }
}

/// Interval limiter for the martian log.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(stamp) if stamp.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
