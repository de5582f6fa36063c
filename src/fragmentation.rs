//! Splitting oversized outbound messages into always-reliable fragments, and
//!  reassembling inbound fragments into complete messages.
//!
//! The wire-level transfer id is a single byte, so at most 256 fragmented transfers can
//!  be in flight per connection. Ids are allocated lazily - only when the first fragment
//!  is about to be serialized - and a fragment set whose transfer cannot get an id yet is
//!  re-queued rather than dropped.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::message::{FragmentRef, NetworkMessage};

#[derive(Debug)]
struct FragmentedSendTransfer {
    total_fragments: u32,
    wire_id: Option<u8>,
    /// Fragments that are not yet acked (or retired as obsolete). The transfer and its
    ///  wire id are released when this reaches zero.
    outstanding_fragments: u32,
}

/// Send-side bookkeeping of fragmented transfers. Both the admission path and the
///  worker's resend logic touch this, so the connection keeps it behind a mutex.
pub struct FragmentedSendManager {
    transfers: FxHashMap<u32, FragmentedSendTransfer>,
    used_wire_ids: FxHashMap<u8, u32>,
    next_key: u32,
    next_wire_id_candidate: u8,
}

impl FragmentedSendManager {
    pub fn new() -> FragmentedSendManager {
        FragmentedSendManager {
            transfers: FxHashMap::default(),
            used_wire_ids: FxHashMap::default(),
            next_key: 0,
            next_wire_id_candidate: 0,
        }
    }

    fn allocate_transfer(&mut self, total_fragments: u32) -> u32 {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        self.transfers.insert(key, FragmentedSendTransfer {
            total_fragments,
            wire_id: None,
            outstanding_fragments: total_fragments,
        });
        key
    }

    /// The transfer's wire id, allocating one lazily. `None` means all 256 ids are in
    ///  flight and the fragment must be re-queued until one frees up.
    pub fn try_allocate_wire_id(&mut self, transfer_key: u32) -> Option<u8> {
        let transfer = self.transfers.get_mut(&transfer_key)?;
        if let Some(id) = transfer.wire_id {
            return Some(id);
        }
        if self.used_wire_ids.len() == 256 {
            return None;
        }

        let mut candidate = self.next_wire_id_candidate;
        while self.used_wire_ids.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_wire_id_candidate = candidate.wrapping_add(1);

        transfer.wire_id = Some(candidate);
        self.used_wire_ids.insert(candidate, transfer_key);
        Some(candidate)
    }

    pub fn total_fragments(&self, transfer_key: u32) -> Option<u32> {
        self.transfers.get(&transfer_key).map(|t| t.total_fragments)
    }

    /// Retires one fragment of the transfer (acked, or dropped as obsolete). Releases
    ///  the transfer and its wire id once all fragments are retired.
    pub fn fragment_retired(&mut self, transfer_key: u32) {
        let Some(transfer) = self.transfers.get_mut(&transfer_key) else {
            return;
        };
        transfer.outstanding_fragments = transfer.outstanding_fragments.saturating_sub(1);
        if transfer.outstanding_fragments == 0 {
            if let Some(wire_id) = transfer.wire_id {
                self.used_wire_ids.remove(&wire_id);
            }
            self.transfers.remove(&transfer_key);
        }
    }

    pub fn num_live_transfers(&self) -> usize {
        self.transfers.len()
    }
}

/// Splits a too-big message into fragments of at most `fragment_size` payload bytes.
///  Every fragment is reliable regardless of the original flag, because losing any one
///  of them would invalidate the whole transfer. The fragments share the original's
///  obsolete flag and inherit its other delivery metadata.
pub fn split_message(manager: &mut FragmentedSendManager, msg: NetworkMessage, fragment_size: usize) -> Vec<NetworkMessage> {
    let total = msg.data.len().div_ceil(fragment_size).max(1);
    let transfer_key = manager.allocate_transfer(total as u32);

    let obsolete_flag = msg.obsolete_flag();
    let mut fragments = Vec::with_capacity(total);
    let mut offset = 0;
    for index in 0..total {
        let end = (offset + fragment_size).min(msg.data.len());

        let mut fragment = NetworkMessage::new(msg.id);
        fragment.data = msg.data[offset..end].to_vec();
        fragment.priority = msg.priority;
        fragment.reliable = true;
        fragment.in_order = msg.in_order;
        fragment.content_id = msg.content_id;
        fragment.fragment = Some(FragmentRef { transfer_key, index: index as u32 });
        fragment.set_obsolete_flag(obsolete_flag.clone());
        fragments.push(fragment);

        offset = end;
    }
    fragments
}

#[derive(Debug)]
struct FragmentedReceiveTransfer {
    total_fragments: u32,
    pieces: FxHashMap<u32, Vec<u8>>,
}

/// Receive-side reassembly of fragmented transfers, keyed by the peer's wire transfer id.
pub struct FragmentedReceiveManager {
    transfers: FxHashMap<u8, FragmentedReceiveTransfer>,
}

impl FragmentedReceiveManager {
    pub fn new() -> FragmentedReceiveManager {
        FragmentedReceiveManager {
            transfers: FxHashMap::default(),
        }
    }

    pub fn new_fragment_start(&mut self, transfer_id: u8, total_fragments: u32, content: Vec<u8>) {
        if self.transfers.contains_key(&transfer_id) {
            warn!("duplicate start for fragmented transfer {}, dropping", transfer_id);
            return;
        }
        let mut pieces = FxHashMap::default();
        pieces.insert(0, content);
        self.transfers.insert(transfer_id, FragmentedReceiveTransfer { total_fragments, pieces });
    }

    /// Stores one fragment; returns the complete reassembled content once the last
    ///  piece arrives.
    pub fn fragment_received(&mut self, transfer_id: u8, index: u32, content: Vec<u8>) -> Option<Vec<u8>> {
        let Some(transfer) = self.transfers.get_mut(&transfer_id) else {
            warn!("fragment for unknown transfer {}, dropping", transfer_id);
            return None;
        };
        if index >= transfer.total_fragments {
            warn!("fragment index {} out of range for transfer {} with {} fragments, dropping",
                index, transfer_id, transfer.total_fragments);
            return None;
        }
        if transfer.pieces.contains_key(&index) {
            warn!("duplicate fragment {} for transfer {}, dropping", index, transfer_id);
            return None;
        }
        transfer.pieces.insert(index, content);

        if transfer.pieces.len() as u32 == transfer.total_fragments {
            let transfer = self.transfers.remove(&transfer_id)
                .expect("transfer was present just above");
            let mut assembled = Vec::new();
            for i in 0..transfer.total_fragments {
                assembled.extend_from_slice(&transfer.pieces[&i]);
            }
            return Some(assembled);
        }
        None
    }

    pub fn num_live_transfers(&self) -> usize {
        self.transfers.len()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn message_with_payload(len: usize) -> NetworkMessage {
        let mut msg = NetworkMessage::new(200);
        msg.data = (0..len).map(|i| i as u8).collect();
        msg.priority = 7;
        msg.in_order = true;
        msg
    }

    #[rstest]
    #[case::just_over_threshold(471, 470, 2)]
    #[case::bulk_transfer(2000, 470, 5)]
    #[case::exact_multiple(940, 470, 2)]
    fn test_split_fragment_count(#[case] payload: usize, #[case] fragment_size: usize, #[case] expected: usize) {
        let mut manager = FragmentedSendManager::new();
        let fragments = split_message(&mut manager, message_with_payload(payload), fragment_size);
        assert_eq!(fragments.len(), expected);

        let key = fragments[0].fragment.unwrap().transfer_key;
        assert_eq!(manager.total_fragments(key), Some(expected as u32));

        for (i, f) in fragments.iter().enumerate() {
            assert!(f.reliable);
            assert!(f.in_order);
            assert_eq!(f.priority, 7);
            assert_eq!(f.fragment.unwrap().index, i as u32);
            assert_eq!(f.fragment.unwrap().transfer_key, key);
        }

        assert!(fragments.iter().all(|f| f.data.len() <= fragment_size));
        let reassembled: Vec<u8> = fragments.iter().flat_map(|f| f.data.iter().copied()).collect();
        assert_eq!(reassembled, (0..payload).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_shares_obsolete_flag() {
        let mut manager = FragmentedSendManager::new();
        let msg = message_with_payload(1000);
        let flag = msg.obsolete_flag();
        let fragments = split_message(&mut manager, msg, 470);

        flag.store(true, std::sync::atomic::Ordering::Release);
        assert!(fragments.iter().all(|f| f.is_obsolete()));
    }

    #[test]
    fn test_lazy_wire_id_allocation_and_release() {
        let mut manager = FragmentedSendManager::new();
        let mut keys = Vec::new();
        for _ in 0..256 {
            let key = {
                let fragments = split_message(&mut manager, message_with_payload(600), 470);
                fragments[0].fragment.unwrap().transfer_key
            };
            assert!(manager.try_allocate_wire_id(key).is_some());
            keys.push(key);
        }

        // all 256 wire ids taken - the next transfer has to wait
        let fragments = split_message(&mut manager, message_with_payload(600), 470);
        let blocked_key = fragments[0].fragment.unwrap().transfer_key;
        assert_eq!(manager.try_allocate_wire_id(blocked_key), None);

        // retiring both fragments of one transfer frees its wire id
        manager.fragment_retired(keys[3]);
        manager.fragment_retired(keys[3]);
        assert!(manager.try_allocate_wire_id(blocked_key).is_some());
    }

    #[test]
    fn test_wire_id_stable_once_allocated() {
        let mut manager = FragmentedSendManager::new();
        let fragments = split_message(&mut manager, message_with_payload(600), 470);
        let key = fragments[0].fragment.unwrap().transfer_key;

        let id = manager.try_allocate_wire_id(key).unwrap();
        assert_eq!(manager.try_allocate_wire_id(key), Some(id));
    }

    #[test]
    fn test_transfer_released_after_all_fragments_retired() {
        let mut manager = FragmentedSendManager::new();
        let fragments = split_message(&mut manager, message_with_payload(1000), 470);
        let key = fragments[0].fragment.unwrap().transfer_key;
        manager.try_allocate_wire_id(key);

        for _ in 0..fragments.len() {
            assert_eq!(manager.num_live_transfers(), 1);
            manager.fragment_retired(key);
        }
        assert_eq!(manager.num_live_transfers(), 0);
    }

    #[rstest]
    #[case::in_order(&[0, 1, 2, 3])]
    #[case::reversed_tail(&[0, 3, 2, 1])]
    #[case::interleaved(&[2, 0, 3, 1])]
    fn test_reassembly_arbitrary_order(#[case] arrival: &[u32]) {
        let pieces: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 5]).collect();

        let mut manager = FragmentedReceiveManager::new();
        let mut assembled = None;
        for &index in arrival {
            let content = pieces[index as usize].clone();
            let result = if index == 0 {
                manager.new_fragment_start(9, 4, content);
                None
            } else {
                manager.fragment_received(9, index, content)
            };
            if result.is_some() {
                assert!(assembled.is_none());
                assembled = result;
            }
        }

        let expected: Vec<u8> = pieces.into_iter().flatten().collect();
        assert_eq!(assembled.unwrap(), expected);
        assert_eq!(manager.num_live_transfers(), 0);
    }

    #[test]
    fn test_unknown_transfer_dropped() {
        let mut manager = FragmentedReceiveManager::new();
        assert_eq!(manager.fragment_received(1, 1, vec![1, 2]), None);
        assert_eq!(manager.num_live_transfers(), 0);
    }

    #[test]
    fn test_duplicate_and_out_of_range_fragments_dropped() {
        let mut manager = FragmentedReceiveManager::new();
        manager.new_fragment_start(4, 3, vec![0]);

        assert_eq!(manager.fragment_received(4, 1, vec![1]), None);
        // duplicate index
        assert_eq!(manager.fragment_received(4, 1, vec![0xFF]), None);
        // index beyond the declared total
        assert_eq!(manager.fragment_received(4, 3, vec![0xFF]), None);

        let assembled = manager.fragment_received(4, 2, vec![2]).unwrap();
        assert_eq!(assembled, vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_fragment_start_dropped() {
        let mut manager = FragmentedReceiveManager::new();
        manager.new_fragment_start(4, 2, vec![0]);
        manager.new_fragment_start(4, 5, vec![9]);

        let assembled = manager.fragment_received(4, 1, vec![1]).unwrap();
        assert_eq!(assembled, vec![0, 1]);
    }
}
