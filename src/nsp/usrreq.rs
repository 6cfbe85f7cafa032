use crate::{
    nsp::{
        defs::{FlowControl, NspError, NspState, SockErr},
        input::{ConnInitMsg, ListenQueue, NspConnection, NspEvent, NspEventType, RateLimit},
        packet::{ObjectEndpoint, SegmentBuf},
    },
    routing::RouteCb,
};
use anyhow::{Context, Result};
use log;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

pub const NSP_MAX_SOCKET: usize = 100;
// Link addresses are allocated from here upwards; zero means "not yet
// known" on both sides of a connection and is never handed out.
const NSP_FIRST_PORT: u16 = 0x0100;
const MARTIAN_LOG_INTERVAL: Duration = Duration::from_secs(1);

static NSP_STACK_GLOBAL: OnceLock<Arc<NspStack>> = OnceLock::new();

pub fn get_global_nspstack(
    config: NspConfig,
    tx: Sender<SegmentBuf>,
) -> Result<&'static Arc<NspStack>> {
    Ok(NSP_STACK_GLOBAL.get_or_init(|| NspStack::new(config, tx).unwrap()))
}

#[derive(Debug, Clone)]
pub struct NspConfig {
    /// Log malformed inbound segments (rate limited).
    pub log_martians: bool,
    /// Segment buffer size used when traffic leaves the local Ethernet.
    pub segbufsize: u16,
    /// Seconds to allow a Connect Initiate to sit unanswered after the
    /// peer NSP has acknowledged it.
    pub outgoing_timer: u64,
    /// Window ceiling applied when the peer runs without flow control.
    pub no_fc_max_cwnd: usize,
    /// Delayed-ack coalescing interval.
    pub ack_delay: Duration,
    /// Default receive buffer budget per connection, charged by the full
    /// in-memory size of each queued segment.
    pub rcvbuf_default: usize,
}

impl Default for NspConfig {
    fn default() -> Self {
        Self {
            log_martians: true,
            segbufsize: 230,
            outgoing_timer: 120,
            no_fc_max_cwnd: 8,
            ack_delay: Duration::from_secs(3),
            rcvbuf_default: 32768,
        }
    }
}

pub struct NspStack {
    pub config: NspConfig,
    pub connections: Mutex<HashMap<usize, Option<NspConnection>>>,
    pub listen_queue: Mutex<HashMap<usize, ListenQueue>>,
    pub(crate) tx: Sender<SegmentBuf>,
    pub(crate) martian_limit: RateLimit,
    event_condvar: (Mutex<NspEvent>, Condvar),
    next_port: Mutex<u16>,
}

impl NspStack {
    pub fn new(config: NspConfig, tx: Sender<SegmentBuf>) -> Result<Arc<Self>> {
        let nsp = Arc::new(Self {
            config,
            connections: Mutex::new(HashMap::new()),
            listen_queue: Mutex::new(HashMap::new()),
            tx,
            martian_limit: RateLimit::new(MARTIAN_LOG_INTERVAL),
            event_condvar: (
                Mutex::new(NspEvent {
                    socket_id: 0,
                    event: NspEventType::InitialState,
                }),
                Condvar::new(),
            ),
            next_port: Mutex::new(NSP_FIRST_PORT),
        });
        Ok(nsp)
    }

    pub fn generate_socket(&self) -> Result<usize> {
        let mut conns = self.connections.lock().unwrap();
        for id in 1..=NSP_MAX_SOCKET {
            if conns.contains_key(&id) {
                continue;
            } else {
                conns.insert(id, None);
                log::info!("Generated socket. id={}", id);
                return Ok(id);
            }
        }
        anyhow::bail!(
            "Failed to generate a new nsp socket because no available id. NSP_MAX_SOCKET={}",
            NSP_MAX_SOCKET
        )
    }

    pub fn release_socket(&self, socket_id: usize) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        conns.remove(&socket_id);
        let mut listen_queue = self.listen_queue.lock().unwrap();
        listen_queue.remove(&socket_id);
        Ok(())
    }

    /// Bind a socket to a local object end point. The link address is
    /// assigned here so that the engine can find the socket once segments
    /// start arriving.
    pub fn bind(&self, socket_id: usize, object: ObjectEndpoint) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        match conns.get(&socket_id) {
            None => anyhow::bail!("No nsp socket for id={}.", socket_id),
            Some(Some(conn)) => anyhow::bail!(
                "Nsp socket (id={}) has already bound to 0x{:04x}.",
                socket_id,
                conn.local_port
            ),
            Some(None) => {}
        }
        let port = self.allocate_port(&conns)?;
        let mut new_conn = NspConnection::new(port, object);
        new_conn.rcvbuf = self.config.rcvbuf_default;
        log::info!(
            "Nsp socket (id={}) bind to link address 0x{:04x}.",
            socket_id,
            port
        );
        conns.insert(socket_id, Some(new_conn));
        Ok(())
    }

    pub fn listen(&self, socket_id: usize) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            if conn.state == NspState::Closed {
                conn.state = NspState::Open;
                let mut listen_queue = self.listen_queue.lock().unwrap();
                listen_queue.insert(
                    socket_id,
                    ListenQueue {
                        pending: VecDeque::new(),
                    },
                );
                Ok(())
            } else {
                anyhow::bail!(
                    "Only a Closed socket can transit to Open. Current: {}",
                    conn.state
                );
            }
        } else {
            anyhow::bail!("Cannot listen Socket (id={}) which is not bound.", socket_id);
        }
    }

    /// Consume one queued Connect Initiate, allocate the new connection in
    /// CONNECT-CONFIRM state and reply with a Connect Confirm. The caller
    /// gets the new socket id and the initiating end point.
    pub fn accept(&self, socket_id: usize) -> Result<(usize, ObjectEndpoint)> {
        log::trace!("ACCEPT CALL: id={}", socket_id);
        loop {
            let mut conns = self.connections.lock().unwrap();
            if let Some(Some(conn)) = conns.get(&socket_id) {
                anyhow::ensure!(
                    conn.state == NspState::Open,
                    "Cannot accept a socket which state is not Open. Current: {}",
                    conn.state
                );
            } else {
                anyhow::bail!("Cannot accept the socket (id={}) which is not bound.", socket_id);
            }
            let ci = {
                let mut listen_queue = self.listen_queue.lock().unwrap();
                let queue = listen_queue
                    .get_mut(&socket_id)
                    .with_context(|| format!("No listen queue for the socket (id={}).", socket_id))?;
                queue.pending.pop_front()
            };
            if let Some(ci) = ci {
                // The dispatcher validated the body before queueing it, so
                // a parse failure here means the queue was corrupted.
                let msg = ConnInitMsg::parse(&mut ci.clone())
                    .map_err(|step| anyhow::anyhow!("Queued CI failed to re-parse at step {}.", step))?;
                let mut id = 0;
                for candidate in 1..=NSP_MAX_SOCKET {
                    if !conns.contains_key(&candidate) {
                        id = candidate;
                        break;
                    }
                }
                anyhow::ensure!(
                    id != 0,
                    "Failed to generate a new nsp socket because there is no available id. NSP_MAX_SOCKET={}",
                    NSP_MAX_SOCKET
                );
                let port = self.allocate_port(&conns)?;
                let mut new_conn = NspConnection::new(port, msg.dst_obj.clone());
                new_conn.state = NspState::ConnectReceive;
                new_conn.parent_id = Some(socket_id);
                new_conn.remote_port = ci.cb.src_port;
                new_conn.remote_obj = msg.src_obj;
                new_conn.services_rem = ci.cb.services;
                new_conn.info_rem = ci.cb.info;
                new_conn.segsize_rem = ci.cb.segsize;
                new_conn.conndata_in = msg.user_data;
                new_conn.route = Some(ci.cb.route.reply());
                new_conn.rcvbuf = self.config.rcvbuf_default;
                if FlowControl::from_services(ci.cb.services) == FlowControl::None {
                    new_conn.max_window = self.config.no_fc_max_cwnd;
                }
                if let Err(e) = self.send_conn_conf(&new_conn) {
                    log::warn!("Failed to send Connect Confirm. Err: {:?}", e);
                }
                new_conn.state = NspState::ConnectConfirm;
                let remote_obj = new_conn.remote_obj.clone();
                log::debug!(
                    "[{}] Accepted an inbound Connect Initiate from node 0x{:04x}.",
                    new_conn.print_log_prefix(id),
                    ci.cb.route.src_node
                );
                conns.insert(id, Some(new_conn));
                return Ok((id, remote_obj));
            }
            drop(conns);
            // Nothing pending yet, wait for the dispatcher to queue a CI.
            self.wait_event_with_timeout(
                NspEvent {
                    socket_id,
                    event: NspEventType::ConnectRequest,
                },
                Duration::from_millis(100),
            );
        }
    }

    /// Start an outbound connection: emit a Connect Initiate towards the
    /// destination node and enter CONNECT-INITIATE. Establishment is
    /// reported through the event interface when the confirm arrives.
    pub fn connect(
        &self,
        socket_id: usize,
        dst_node: u16,
        dst_obj: ObjectEndpoint,
    ) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            anyhow::ensure!(
                conn.state == NspState::Closed,
                "Only a Closed socket can connect. Current: {}",
                conn.state
            );
            conn.state = NspState::ConnectInit;
            conn.route = Some(RouteCb {
                dst_node,
                ..Default::default()
            });
            if let Err(e) = self.send_conn_init(conn, &dst_obj) {
                log::warn!("Failed to send Connect Initiate. Err: {:?}", e);
            }
            log::debug!(
                "[{}] State changed from CLOSED to CONNECT-INITIATE. dst_node=0x{:04x}",
                conn.print_log_prefix(socket_id),
                dst_node
            );
            Ok(())
        } else {
            anyhow::bail!("Socket (id={}) is not bound.", socket_id);
        }
    }

    /// Read one data segment payload. Blocks until data, disconnect or
    /// error. The user lock is held only across the queue operation so the
    /// receive path can keep appending to the backlog while we wait.
    pub fn recv(&self, socket_id: usize) -> Result<Vec<u8>> {
        log::trace!("RECV CALL: id={}", socket_id);
        self.recv_queue(socket_id, false)
    }

    /// Read one other-data (interrupt) message.
    pub fn recv_other(&self, socket_id: usize) -> Result<Vec<u8>> {
        log::trace!("RECV-OTHER CALL: id={}", socket_id);
        self.recv_queue(socket_id, true)
    }

    fn recv_queue(&self, socket_id: usize, other: bool) -> Result<Vec<u8>> {
        loop {
            self.lock_user(socket_id)?;
            let popped = self.pop_receive_queue(socket_id, other);
            self.unlock_user(socket_id)?;
            match popped? {
                Some(payload) => return Ok(payload),
                None => {
                    self.wait_events_with_timeout(
                        vec![
                            NspEvent {
                                socket_id,
                                event: if other {
                                    NspEventType::OtherDataReady
                                } else {
                                    NspEventType::DataReady
                                },
                            },
                            NspEvent {
                                socket_id,
                                event: NspEventType::Disconnected,
                            },
                            NspEvent {
                                socket_id,
                                event: NspEventType::Refused,
                            },
                        ],
                        Duration::from_millis(100),
                    );
                }
            }
        }
    }

    fn pop_receive_queue(&self, socket_id: usize, other: bool) -> Result<Option<Vec<u8>>> {
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            let seg = if other {
                conn.other_receive_queue.pop_front()
            } else {
                conn.data_receive_queue.pop_front()
            };
            if let Some(seg) = seg {
                conn.rmem_alloc = conn.rmem_alloc.saturating_sub(seg.truesize());
                conn.maybe_reopen_flow();
                return Ok(Some(seg.into_payload()));
            }
            match conn.sock_err {
                Some(SockErr::Refused) => anyhow::bail!(NspError::RefusedError {
                    id: socket_id,
                    remote: conn.remote_port,
                }),
                Some(SockErr::Unreachable) => anyhow::bail!(NspError::UnreachableError {
                    id: socket_id,
                    remote: conn.remote_port,
                }),
                Some(SockErr::Closed) => anyhow::bail!(NspError::ClosedError {
                    id: socket_id,
                    remote: conn.remote_port,
                }),
                None => {}
            }
            if conn.state.is_terminal() {
                anyhow::bail!(NspError::ClosedError {
                    id: socket_id,
                    remote: conn.remote_port,
                });
            }
            Ok(None)
        } else {
            anyhow::bail!("Cannot find the socket (id={}).", socket_id);
        }
    }

    /// User-requested disconnect. A Disconnect Initiate goes out only if
    /// the remote link address is known; a connection whose CI was never
    /// answered has nobody to tell.
    pub fn disconnect(&self, socket_id: usize, reason: u16, data: &[u8]) -> Result<()> {
        log::trace!("DISCONNECT CALL: id={} reason={}", socket_id, reason);
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            match conn.state {
                NspState::ConnectInit
                | NspState::ConnectDelivered
                | NspState::ConnectConfirm
                | NspState::Run => {
                    let prev = conn.state;
                    conn.state = NspState::DiscInit;
                    if conn.remote_port != 0 {
                        if let Err(e) = self.send_disc_init(conn, reason, data) {
                            log::warn!("Failed to send Disconnect Initiate. Err: {:?}", e);
                        }
                    }
                    log::debug!(
                        "[{}] State changed from {} to DISC-INITIATE.",
                        conn.print_log_prefix(socket_id),
                        prev
                    );
                    Ok(())
                }
                other => {
                    anyhow::bail!("Cannot disconnect a socket in state {}.", other);
                }
            }
        } else {
            anyhow::bail!("Cannot find the socket (id={}).", socket_id);
        }
    }

    /// Mark the connection as held by user context. Segments arriving
    /// while the flag is set are parked on the connection backlog.
    pub fn lock_user(&self, socket_id: usize) -> Result<()> {
        let mut conns = self.connections.lock().unwrap();
        if let Some(Some(conn)) = conns.get_mut(&socket_id) {
            anyhow::ensure!(
                !conn.user_locked,
                "Socket (id={}) is already locked by user context.",
                socket_id
            );
            conn.user_locked = true;
            Ok(())
        } else {
            anyhow::bail!("Cannot find the socket (id={}).", socket_id);
        }
    }

    /// Release the user lock and run every segment that queued up behind
    /// it through the normal receive path.
    pub fn unlock_user(&self, socket_id: usize) -> Result<()> {
        loop {
            let mut conns = self.connections.lock().unwrap();
            let seg = if let Some(Some(conn)) = conns.get_mut(&socket_id) {
                match conn.backlog.pop_front() {
                    Some(seg) => seg,
                    None => {
                        conn.user_locked = false;
                        return Ok(());
                    }
                }
            } else {
                anyhow::bail!("Cannot find the socket (id={}).", socket_id);
            };
            self.backlog_rcv(socket_id, seg, conns)
                .context("backlog_rcv failed while draining user backlog.")?;
        }
    }

    fn allocate_port(&self, conns: &HashMap<usize, Option<NspConnection>>) -> Result<u16> {
        let used_ports: Vec<u16> = conns
            .values()
            .filter_map(|conn| conn.as_ref().map(|c| c.local_port))
            .collect();
        let mut next = self.next_port.lock().unwrap();
        for _ in 0..=u16::MAX {
            let port = *next;
            *next = if port == u16::MAX { NSP_FIRST_PORT } else { port + 1 };
            if !used_ports.contains(&port) {
                return Ok(port);
            }
        }
        anyhow::bail!("Failed to allocate a link address. No available port.");
    }

    pub fn get_socket_id_by_port(
        &self,
        port: u16,
    ) -> (
        Option<usize>,
        MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) {
        let conns = self.connections.lock().unwrap();
        let mut socket_id = None;
        for (id, connection_info) in conns.iter() {
            if let Some(conn) = connection_info {
                if conn.local_port == port && conn.state != NspState::Open {
                    socket_id = Some(*id);
                    break;
                }
            }
        }
        if socket_id.is_none() {
            log::debug!("There is no nsp socket for link address 0x{:04x}.", port);
        }
        (socket_id, conns)
    }

    /// Lookup for a returned Connect Initiate. The packet was ours going
    /// out, so the source link address it carries is the key on our side.
    pub fn get_returned_socket_id(
        &self,
        port: u16,
    ) -> (
        Option<usize>,
        MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) {
        let conns = self.connections.lock().unwrap();
        let mut socket_id = None;
        for (id, connection_info) in conns.iter() {
            if let Some(conn) = connection_info {
                if conn.local_port == port && conn.state == NspState::ConnectInit {
                    socket_id = Some(*id);
                    break;
                }
            }
        }
        (socket_id, conns)
    }

    pub fn find_listener_socket(
        &self,
        object: &ObjectEndpoint,
    ) -> (
        Option<usize>,
        MutexGuard<HashMap<usize, Option<NspConnection>>>,
    ) {
        let conns = self.connections.lock().unwrap();
        let mut socket_id = None;
        for (id, connection_info) in conns.iter() {
            if let Some(conn) = connection_info {
                if conn.state == NspState::Open && conn.local_obj.matches(object) {
                    socket_id = Some(*id);
                    break;
                }
            }
        }
        (socket_id, conns)
    }

    pub fn wait_event_with_timeout(&self, wait_event: NspEvent, timeout: Duration) -> bool {
        let (lock, condvar) = &self.event_condvar;
        let start_time = Instant::now();
        let mut event = lock.lock().unwrap();
        loop {
            if *event == wait_event {
                *event = NspEvent {
                    socket_id: 0,
                    event: NspEventType::InitialState,
                };
                return true;
            }
            let elapsed = start_time.elapsed();
            if elapsed >= timeout {
                return false;
            }
            let remaining_time = timeout - elapsed;
            let (new_event, timeout_result) = condvar.wait_timeout(event, remaining_time).unwrap();
            event = new_event;
            if timeout_result.timed_out() {
                return false;
            }
        }
    }

    pub fn wait_events_with_timeout(
        &self,
        wait_events: Vec<NspEvent>,
        timeout: Duration,
    ) -> (bool, Option<NspEvent>) {
        let (lock, condvar) = &self.event_condvar;
        let start_time = Instant::now();
        let mut event = lock.lock().unwrap();
        loop {
            if wait_events.contains(&event) {
                let ret_event = Some(event.clone());
                *event = NspEvent {
                    socket_id: 0,
                    event: NspEventType::InitialState,
                };
                return (true, ret_event);
            }
            let elapsed = start_time.elapsed();
            if elapsed >= timeout {
                return (false, None);
            }
            let remaining_time = timeout - elapsed;
            let (new_event, timeout_result) = condvar.wait_timeout(event, remaining_time).unwrap();
            event = new_event;
            if timeout_result.timed_out() {
                return (false, None);
            }
        }
    }

    pub fn publish_event(&self, event: NspEvent) {
        log::trace!("Publishing NspEvent. {:?}", event);
        let (lock, condvar) = &self.event_condvar;
        let mut e = lock.lock().unwrap();
        *e = event;
        condvar.notify_all();
    }
}
