use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::packet_id::PacketId;

#[derive(Copy, Clone, Debug, Default)]
struct TrafficEvent {
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u32,
    packets_out: u32,
    messages_in: u32,
    messages_out: u32,
    resends: u32,
}

/// Packet loss figures derived from the received-packet-id history.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PacketLoss {
    /// Fraction of packets missing from the window, 0..=1.
    pub rate: f64,
    /// Missing packets per second over the window.
    pub per_second: f64,
}

/// Bounded, age-trimmed history of what happened on one connection: traffic volume,
///  ping round trips and received packet ids, each over a sliding window.
///
/// This is the one piece of state both the application side and the worker touch, so
///  the connection keeps it behind a mutex with narrow critical sections.
pub struct ConnectionStatistics {
    window: Duration,
    traffic: VecDeque<(Instant, TrafficEvent)>,
    pings: VecDeque<(Instant, Duration)>,
    received_packet_ids: VecDeque<(Instant, PacketId)>,
    smoothed_rtt: Option<Duration>,
}

impl ConnectionStatistics {
    pub fn new(window: Duration) -> ConnectionStatistics {
        ConnectionStatistics {
            window,
            traffic: VecDeque::new(),
            pings: VecDeque::new(),
            received_packet_ids: VecDeque::new(),
            smoothed_rtt: None,
        }
    }

    fn trim(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while self.traffic.front().is_some_and(|(at, _)| *at < cutoff) {
            self.traffic.pop_front();
        }
        while self.pings.front().is_some_and(|(at, _)| *at < cutoff) {
            self.pings.pop_front();
        }
        while self.received_packet_ids.front().is_some_and(|(at, _)| *at < cutoff) {
            self.received_packet_ids.pop_front();
        }
    }

    pub fn add_packet_in(&mut self, now: Instant, bytes: usize, messages: u32) {
        self.trim(now);
        self.traffic.push_back((now, TrafficEvent {
            bytes_in: bytes as u64,
            packets_in: 1,
            messages_in: messages,
            ..TrafficEvent::default()
        }));
    }

    pub fn add_packet_out(&mut self, now: Instant, bytes: usize, messages: u32) {
        self.trim(now);
        self.traffic.push_back((now, TrafficEvent {
            bytes_out: bytes as u64,
            packets_out: 1,
            messages_out: messages,
            ..TrafficEvent::default()
        }));
    }

    pub fn add_resend(&mut self, now: Instant) {
        self.trim(now);
        self.traffic.push_back((now, TrafficEvent {
            resends: 1,
            ..TrafficEvent::default()
        }));
    }

    /// Records a completed ping round trip and folds it into the smoothed RTT estimate.
    pub fn add_ping(&mut self, now: Instant, round_trip: Duration, blend: f64) {
        self.trim(now);
        self.pings.push_back((now, round_trip));
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            None => round_trip,
            Some(old) => {
                Duration::from_secs_f64(blend * round_trip.as_secs_f64() + (1.0 - blend) * old.as_secs_f64())
            }
        });
    }

    pub fn add_received_packet_id(&mut self, now: Instant, packet_id: PacketId) {
        self.trim(now);
        self.received_packet_ids.push_back((now, packet_id));
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn bytes_in_per_second(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.traffic.iter().map(|(_, e)| e.bytes_in).sum::<u64>() as f64 / self.window.as_secs_f64()
    }

    pub fn bytes_out_per_second(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.traffic.iter().map(|(_, e)| e.bytes_out).sum::<u64>() as f64 / self.window.as_secs_f64()
    }

    pub fn messages_in_per_second(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.traffic.iter().map(|(_, e)| e.messages_in as u64).sum::<u64>() as f64 / self.window.as_secs_f64()
    }

    pub fn messages_out_per_second(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.traffic.iter().map(|(_, e)| e.messages_out as u64).sum::<u64>() as f64 / self.window.as_secs_f64()
    }

    pub fn resends_in_window(&mut self, now: Instant) -> u32 {
        self.trim(now);
        self.traffic.iter().map(|(_, e)| e.resends).sum()
    }

    /// Estimates packet loss from the gaps in the received packet id sequence: ids are
    ///  sorted by their modular distance from the oldest one in the window, and every
    ///  hole between consecutive ids counts as missed packets.
    pub fn packet_loss(&mut self, now: Instant) -> PacketLoss {
        self.trim(now);
        if self.received_packet_ids.len() < 2 {
            return PacketLoss { rate: 0.0, per_second: 0.0 };
        }

        let reference = self.received_packet_ids[0].1;
        let mut relative: Vec<u32> = self.received_packet_ids.iter()
            .map(|(_, id)| id.minus(reference))
            .collect();
        relative.sort_unstable();

        let mut missed = 0u64;
        for pair in relative.windows(2) {
            missed += (pair[1] - pair[0]).saturating_sub(1) as u64;
        }

        let received = relative.len() as u64;
        PacketLoss {
            rate: missed as f64 / (received + missed) as f64,
            per_second: missed as f64 / self.window.as_secs_f64(),
        }
    }

    /// A one-line condensed view for debug logging.
    pub fn summary(&mut self, now: Instant) -> String {
        let loss = self.packet_loss(now);
        let smoothed_rtt = self.smoothed_rtt;
        format!(
            "in {:.0} B/s ({:.1} msg/s), out {:.0} B/s ({:.1} msg/s), rtt {:?}, loss {:.1}%, {} resends",
            self.bytes_in_per_second(now),
            self.messages_in_per_second(now),
            self.bytes_out_per_second(now),
            self.messages_out_per_second(now),
            smoothed_rtt,
            loss.rate * 100.0,
            self.resends_in_window(now),
        )
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn stats() -> ConnectionStatistics {
        ConnectionStatistics::new(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_rates() {
        let mut stats = stats();
        let now = Instant::now();

        stats.add_packet_in(now, 500, 2);
        stats.add_packet_out(now, 1000, 4);
        stats.add_packet_in(now, 500, 1);

        assert_eq!(stats.bytes_in_per_second(now), 200.0);
        assert_eq!(stats.bytes_out_per_second(now), 200.0);
        assert_eq!(stats.messages_in_per_second(now), 0.6);
        assert_eq!(stats.messages_out_per_second(now), 0.8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_age_out() {
        let mut stats = stats();
        let start = Instant::now();
        stats.add_packet_in(start, 500, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let now = Instant::now();
        assert_eq!(stats.bytes_in_per_second(now), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_smoothing() {
        let mut stats = stats();
        let now = Instant::now();

        stats.add_ping(now, Duration::from_millis(100), 0.5);
        assert_eq!(stats.round_trip_time(), Some(Duration::from_millis(100)));

        stats.add_ping(now, Duration::from_millis(200), 0.5);
        assert_eq!(stats.round_trip_time(), Some(Duration::from_millis(150)));
    }

    #[rstest]
    #[case::no_gaps(vec![0, 1, 2, 3], 0.0)]
    #[case::one_missing(vec![0, 1, 3], 0.25)]
    #[case::out_of_order_arrival(vec![0, 3, 1], 0.25)]
    #[case::wide_gap(vec![0, 5], 4.0 / 6.0)]
    fn test_packet_loss(#[case] raw_ids: Vec<u32>, #[case] expected_rate: f64) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build().unwrap();
        runtime.block_on(async {
            let mut stats = stats();
            let now = Instant::now();
            for raw in raw_ids {
                stats.add_received_packet_id(now, PacketId::from_raw(raw));
            }

            let loss = stats.packet_loss(now);
            assert!((loss.rate - expected_rate).abs() < 1e-9);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_loss_across_wraparound() {
        let mut stats = stats();
        let now = Instant::now();
        stats.add_received_packet_id(now, PacketId::from_raw(0x3F_FFFE));
        stats.add_received_packet_id(now, PacketId::from_raw(0x3F_FFFF));
        stats.add_received_packet_id(now, PacketId::from_raw(0));
        stats.add_received_packet_id(now, PacketId::from_raw(1));

        assert_eq!(stats.packet_loss(now), PacketLoss { rate: 0.0, per_second: 0.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_id_means_no_loss() {
        let mut stats = stats();
        let now = Instant::now();
        stats.add_received_packet_id(now, PacketId::from_raw(7));
        assert_eq!(stats.packet_loss(now), PacketLoss { rate: 0.0, per_second: 0.0 });
    }
}
