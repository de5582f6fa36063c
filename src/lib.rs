//! A connection-oriented message transport over UDP or TCP.
//!
//! The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!  opposed to streams of bytes), each with per-message delivery guarantees chosen by
//!  the sender:
//! * *reliable* messages are acknowledged and resent until the ack arrives; everything
//!    else may be lost without anyone noticing
//! * *in-order* messages are processed in send order relative to each other; packets
//!    carrying them reference their in-order predecessor so the receiver can detect and
//!    wait out gaps. Messages without the flag are processed as they arrive
//! * a *priority* decides what goes out first when more is queued than fits the send
//!    rate
//! * an optional *content id* marks a message as the current value of something (say,
//!    the position of object 17): a newer queued message with the same (message id,
//!    content id) replaces an older one that has not reached the wire yet, and the
//!    receive side drops stragglers that arrive after a newer value was already
//!    processed
//!
//! ## Design notes
//!
//! * Messages are small and many; a datagram carries as many queued messages as fit.
//!   Oversized messages are fragmented transparently and reassembled on the far side
//!   (UDP only - the TCP stream has a hard per-message size limit instead)
//! * Outbound datagrams leave at a fixed rate that the *peer* adjusts via flow control
//!   requests, so a receiver drowning in data can slow its sender down
//! * Keepalive pings measure the round trip time and detect dead peers; received
//!   packet id gaps yield a packet loss estimate
//! * A connection does not push messages into application code from its own tasks: the
//!   application pumps delivery explicitly (`process_messages`), so handlers run on a
//!   thread the application controls
//!
//! ## Wire format
//!
//! See [wire] for the exact datagram and stream layouts, [serialize] for the
//!  bit-granular encoding primitives they build on, and [message] for the built-in
//!  control messages (ping, flow control, packet acks, disconnect handshake).
//!
//! ## Entry points
//!
//! [network::connect] opens a client connection; [network::start_server] listens for
//!  any number of peers on one port. Both exist for UDP and TCP; the message API on
//!  top is the same either way.

pub mod config;
pub mod connection;
pub mod endpoint;
mod fragmentation;
pub mod message;
pub mod network;
pub mod packet_id;
pub mod serialize;
pub mod server;
pub mod socket;
pub mod stats;
pub mod wire;

pub use config::{ConnectionConfig, TransportLayer};
pub use connection::{ConnectionState, MessageConnection, MessageHandler};
pub use endpoint::EndPoint;
pub use message::{MessageId, NetworkMessage};
pub use server::{NetworkServer, ServerListener};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
