//! DECnet Network Services Protocol (NSP), the transport layer sitting
//! between DECnet routing and user sockets. This crate implements the
//! receive-side engine: segment classification, the per-connection state
//! machine, piggybacked acknowledgement processing, flow control and
//! in-order delivery to user receive queues.

pub mod nsp;
pub mod routing;
