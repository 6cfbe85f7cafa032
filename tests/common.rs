use decnet_r::nsp::input::NspConnection;
use decnet_r::nsp::packet::{ObjectEndpoint, SegmentBuf};
use decnet_r::nsp::usrreq::{NspConfig, NspStack};
use decnet_r::routing::{RouteCb, RtFlags, RT_PKT_LONG};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

pub const PEER_NODE: u16 = 0x0401;
pub const LOCAL_NODE: u16 = 0x0402;

pub fn setup_stack() -> (Arc<NspStack>, Receiver<SegmentBuf>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, rx) = channel();
    let stack = NspStack::new(NspConfig::default(), tx).unwrap();
    (stack, rx)
}

/// Route of a segment arriving from the peer over the local Ethernet.
pub fn route() -> RouteCb {
    RouteCb::new(
        "eth0",
        PEER_NODE,
        LOCAL_NODE,
        RtFlags::IE | RtFlags::from_bits_truncate(RT_PKT_LONG),
    )
}

/// Route of a segment that crossed a non-Ethernet hop.
pub fn route_off_ethernet() -> RouteCb {
    RouteCb::new(
        "ddcmp0",
        PEER_NODE,
        LOCAL_NODE,
        RtFlags::from_bits_truncate(RT_PKT_LONG),
    )
}

/// Route of one of our own packets coming back from the routing layer.
pub fn route_returned() -> RouteCb {
    RouteCb::new(
        "eth0",
        PEER_NODE,
        LOCAL_NODE,
        RtFlags::IE | RtFlags::RTS | RtFlags::from_bits_truncate(RT_PKT_LONG),
    )
}

pub fn inject(stack: &NspStack, bytes: Vec<u8>) {
    stack.rx_packet(SegmentBuf::new(bytes, route())).unwrap();
}

pub fn inject_with(stack: &NspStack, bytes: Vec<u8>, route: RouteCb) {
    stack.rx_packet(SegmentBuf::new(bytes, route)).unwrap();
}

pub fn drain(rx: &Receiver<SegmentBuf>) -> Vec<SegmentBuf> {
    rx.try_iter().collect()
}

pub fn with_conn<T>(stack: &NspStack, id: usize, f: impl FnOnce(&mut NspConnection) -> T) -> T {
    let mut conns = stack.connections.lock().unwrap();
    let conn = conns
        .get_mut(&id)
        .expect("no such socket")
        .as_mut()
        .expect("socket not bound");
    f(conn)
}

fn object_descriptor(name: &str) -> Vec<u8> {
    let mut b = vec![1, 0, name.len() as u8];
    b.extend_from_slice(name.as_bytes());
    b
}

/// Connect Initiate with a named destination and source object and no
/// optional data.
pub fn ci_message(src_port: u16, dst_obj: &str, src_obj: &str) -> Vec<u8> {
    let mut b = ci_message_header(src_port);
    b.extend(object_descriptor(dst_obj));
    b.extend(object_descriptor(src_obj));
    b.push(0); // menuver
    b
}

/// CI up to and including the fixed header; tests append their own body.
pub fn ci_message_header(src_port: u16) -> Vec<u8> {
    let mut b = vec![0x18];
    b.extend_from_slice(&src_port.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b.push(0x01); // services
    b.push(0x03); // info
    b.extend_from_slice(&1459u16.to_le_bytes());
    b
}

pub fn conn_ack_message(dst_port: u16) -> Vec<u8> {
    let mut b = vec![0x24];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b
}

pub fn conn_conf_message(dst_port: u16, src_port: u16, segsize: u16, user: &[u8]) -> Vec<u8> {
    let mut b = vec![0x28];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    b.push(0x01); // services
    b.push(0x03); // info
    b.extend_from_slice(&segsize.to_le_bytes());
    if !user.is_empty() {
        b.push(user.len() as u8);
        b.extend_from_slice(user);
    }
    b
}

pub fn disc_init_message(dst_port: u16, src_port: u16, reason: u16, data: &[u8]) -> Vec<u8> {
    let mut b = vec![0x38];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    b.extend_from_slice(&reason.to_le_bytes());
    if !data.is_empty() {
        b.push(data.len() as u8);
        b.extend_from_slice(data);
    }
    b
}

pub fn disc_conf_message(dst_port: u16, src_port: u16, reason: u16) -> Vec<u8> {
    let mut b = vec![0x48];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    b.extend_from_slice(&reason.to_le_bytes());
    b
}

pub fn data_message(
    dst_port: u16,
    src_port: u16,
    acks: &[u16],
    segnum: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut b = vec![0x00];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    for ack in acks {
        b.extend_from_slice(&ack.to_le_bytes());
    }
    b.extend_from_slice(&segnum.to_le_bytes());
    b.extend_from_slice(payload);
    b
}

pub fn oth_message(
    dst_port: u16,
    src_port: u16,
    acks: &[u16],
    segnum: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut b = vec![0x30];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    for ack in acks {
        b.extend_from_slice(&ack.to_le_bytes());
    }
    b.extend_from_slice(&segnum.to_le_bytes());
    b.extend_from_slice(payload);
    b
}

pub fn ls_message(dst_port: u16, src_port: u16, segnum: u16, lsflags: u8, fcval: i8) -> Vec<u8> {
    let mut b = vec![0x10];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    b.extend_from_slice(&segnum.to_le_bytes());
    b.push(lsflags);
    b.push(fcval as u8);
    b
}

pub fn bare_ack_message(dst_port: u16, src_port: u16, word: u16) -> Vec<u8> {
    let mut b = vec![0x04];
    b.extend_from_slice(&dst_port.to_le_bytes());
    b.extend_from_slice(&src_port.to_le_bytes());
    b.extend_from_slice(&word.to_le_bytes());
    b
}

pub fn open_listener(stack: &NspStack, name: &str) -> usize {
    let id = stack.generate_socket().unwrap();
    stack.bind(id, ObjectEndpoint::from_name(name)).unwrap();
    stack.listen(id).unwrap();
    id
}

/// Drive an outbound socket all the way to RUN: connect, then feed the
/// Connect Ack and Connect Confirm the peer would send. Returns the
/// socket id and its local link address.
pub fn run_connection(
    stack: &NspStack,
    rx: &Receiver<SegmentBuf>,
    remote_port: u16,
) -> (usize, u16) {
    let id = stack.generate_socket().unwrap();
    stack.bind(id, ObjectEndpoint::from_name("LOCAL")).unwrap();
    stack
        .connect(id, PEER_NODE, ObjectEndpoint::from_name("REMOTE"))
        .unwrap();
    let local_port = with_conn(stack, id, |c| c.local_port);
    drain(rx); // the Connect Initiate we emitted
    inject(stack, conn_ack_message(local_port));
    inject(stack, conn_conf_message(local_port, remote_port, 1459, &[]));
    drain(rx);
    (id, local_port)
}
