use std::time::Duration;

use anyhow::bail;

use crate::message::{MAX_DATAGRAMS_PER_SECOND, MIN_DATAGRAMS_PER_SECOND};

/// Which OS transport a socket or connection runs on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransportLayer {
    Udp,
    Tcp,
}

/// Tuning knobs and protocol constants for a connection. The defaults reproduce the
///  original protocol's fixed values; most deployments should leave them alone since
///  both peers must agree on the wire-visible ones.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Interval between keepalive pings. A connection that has not heard from its peer
    ///  for [Self::connection_lost_multiplier] times this interval counts as lost.
    pub ping_interval: Duration,
    pub connection_lost_multiplier: u32,

    /// How long an unacknowledged reliable packet waits before its messages are
    ///  re-evaluated for resending.
    pub reliable_resend_timeout: Duration,

    /// Received reliable packet ids are acked in batches: a pending ack is flushed
    ///  after this delay at the latest, or as soon as [Self::max_pending_acks] have
    ///  accumulated (the ack message covers a base id plus a 32-bit run).
    pub max_ack_delay: Duration,
    pub max_pending_acks: usize,

    /// Upper bound on datagrams handled per worker wakeup, so housekeeping is never
    ///  starved by a flood of inbound traffic.
    pub max_datagrams_per_wakeup: usize,

    /// Messages with more payload than this are fragmented when sent over UDP.
    pub udp_fragment_threshold: usize,

    /// Assembled UDP datagrams never exceed this size.
    pub udp_mtu: usize,

    /// Hard upper bound for a single message over TCP. A length prefix beyond this is
    ///  connection-fatal on the receive side, so the send side rejects such messages
    ///  at admission.
    pub tcp_max_message_size: usize,

    /// Outbound datagram rate until the peer requests something else via flow control.
    pub initial_datagrams_per_second: u16,

    /// Blend factor for RTT smoothing: `rtt = blend * new + (1-blend) * old`.
    pub rtt_blend: f64,

    /// How long an inbound (message id, content id) stamp suppresses older duplicates.
    pub content_id_forget_window: Duration,

    /// Length of the sliding window behind traffic, ping and packet-loss statistics.
    pub stats_window: Duration,

    /// Capacity of the admission ring (application thread -> worker).
    pub admission_queue_capacity: usize,

    /// Capacity of the delivery ring (worker -> application thread).
    pub delivery_queue_capacity: usize,

    /// How long a graceful disconnect waits for the peer's ack before falling back to
    ///  an immediate close.
    pub disconnect_timeout: Duration,

    /// How long `close` waits for the worker task to wind down before aborting it.
    pub worker_join_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            ping_interval: Duration::from_secs(5),
            connection_lost_multiplier: 3,
            reliable_resend_timeout: Duration::from_millis(2000),
            max_ack_delay: Duration::from_millis(33),
            max_pending_acks: 33,
            max_datagrams_per_wakeup: 256,
            udp_fragment_threshold: 470,
            udp_mtu: 1400,
            tcp_max_message_size: 256 * 1024,
            initial_datagrams_per_second: 30,
            rtt_blend: 0.5,
            content_id_forget_window: Duration::from_secs(5),
            stats_window: Duration::from_secs(5),
            admission_queue_capacity: 4096,
            delivery_queue_capacity: 4096,
            disconnect_timeout: Duration::from_secs(5),
            worker_join_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval.is_zero() {
            bail!("ping interval must not be zero");
        }
        if self.connection_lost_multiplier == 0 {
            bail!("connection lost multiplier must not be zero");
        }
        if self.udp_fragment_threshold == 0 || self.udp_fragment_threshold > self.udp_mtu {
            bail!("UDP fragment threshold {} must be positive and fit the MTU {}",
                self.udp_fragment_threshold, self.udp_mtu);
        }
        if self.udp_mtu < 100 {
            bail!("UDP MTU {} is too small", self.udp_mtu);
        }
        if self.initial_datagrams_per_second < MIN_DATAGRAMS_PER_SECOND
            || self.initial_datagrams_per_second > MAX_DATAGRAMS_PER_SECOND
        {
            bail!("initial datagram rate {} outside the protocol bounds {}..={}",
                self.initial_datagrams_per_second, MIN_DATAGRAMS_PER_SECOND, MAX_DATAGRAMS_PER_SECOND);
        }
        if !(0.0..=1.0).contains(&self.rtt_blend) {
            bail!("RTT blend factor {} must be between 0 and 1", self.rtt_blend);
        }
        if self.admission_queue_capacity == 0 || self.delivery_queue_capacity == 0 {
            bail!("queue capacities must not be zero");
        }
        Ok(())
    }

    /// Time the connection may stay silent before counting as lost.
    pub fn connection_lost_timeout(&self) -> Duration {
        self.ping_interval * self.connection_lost_multiplier
    }

    /// Payload bytes above which a message gets fragmented on the given transport.
    ///  TCP has no wire-level fragmentation, so there the bound is the hard message
    ///  size limit and oversized messages are rejected instead of split.
    pub fn fragment_threshold(&self, transport: TransportLayer) -> usize {
        match transport {
            TransportLayer::Udp => self.udp_fragment_threshold,
            TransportLayer::Tcp => self.tcp_max_message_size,
        }
    }
}
