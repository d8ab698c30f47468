//! Bounded in-memory stores for capture output

use crate::models::{Packet, Snapshot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Packets bounded by age (relative to the newest insert) and by count
pub(crate) struct PacketBuffer {
    packets: VecDeque<Packet>,
    window: ChronoDuration,
    max_packets: usize,
}

impl PacketBuffer {
    pub(crate) fn new(window: Duration, max_packets: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            window: ChronoDuration::from_std(window)
                .unwrap_or_else(|_| ChronoDuration::days(365)),
            max_packets: max_packets.max(1),
        }
    }

    /// Append a packet captured at `now`, then evict by age and count
    pub(crate) fn push_at(&mut self, data: Vec<u8>, now: DateTime<Utc>) {
        self.packets.push_back(Packet {
            data,
            captured_at: now,
        });

        if let Some(cutoff) = now.checked_sub_signed(self.window) {
            while self
                .packets
                .front()
                .map(|p| p.captured_at < cutoff)
                .unwrap_or(false)
            {
                self.packets.pop_front();
            }
        }

        while self.packets.len() > self.max_packets {
            self.packets.pop_front();
        }
    }

    /// Packets strictly newer than `since`, oldest first
    pub(crate) fn since(&self, since: DateTime<Utc>) -> Vec<Packet> {
        self.packets
            .iter()
            .filter(|p| p.captured_at > since)
            .cloned()
            .collect()
    }

    /// Up to `count` newest packets, oldest first
    pub(crate) fn latest(&self, count: usize) -> Vec<Packet> {
        let skip = self.packets.len().saturating_sub(count);
        self.packets.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn all(&self) -> Vec<Packet> {
        self.packets.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }
}

/// Snapshots bounded by count
pub(crate) struct SnapshotBuffer {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push_at(&mut self, data: Vec<u8>, now: DateTime<Utc>) {
        if self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            data,
            captured_at: now,
        });
    }

    pub(crate) fn all(&self) -> Vec<Snapshot> {
        self.snapshots.iter().cloned().collect()
    }

    pub(crate) fn latest(&self) -> Option<Snapshot> {
        self.snapshots.back().cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_window_eviction_one_packet_per_second() {
        let mut buffer = PacketBuffer::new(Duration::from_secs(140), 10_000);
        for i in 0..200 {
            buffer.push_at(vec![i as u8], t(i));
        }

        let packets = buffer.since(t(0));
        let newest = t(199);
        assert!(packets
            .iter()
            .all(|p| p.captured_at >= newest - ChronoDuration::seconds(140)));
        assert_eq!(packets.first().map(|p| p.captured_at), Some(t(59)));
        assert_eq!(buffer.len(), 141);
    }

    #[test]
    fn test_packet_count_cap() {
        let mut buffer = PacketBuffer::new(Duration::from_secs(140), 5);
        for i in 0..20 {
            buffer.push_at(vec![i as u8], t(0));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.all().first().map(|p| p.data.clone()), Some(vec![15]));
    }

    #[test]
    fn test_since_is_exclusive() {
        let mut buffer = PacketBuffer::new(Duration::from_secs(140), 100);
        buffer.push_at(vec![1], t(10));
        buffer.push_at(vec![2], t(11));
        let packets = buffer.since(t(10));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![2]);
    }

    #[test]
    fn test_latest_returns_newest_in_order() {
        let mut buffer = PacketBuffer::new(Duration::from_secs(140), 100);
        for i in 0..5 {
            buffer.push_at(vec![i], t(i as i64));
        }
        let latest: Vec<u8> = buffer.latest(2).into_iter().map(|p| p.data[0]).collect();
        assert_eq!(latest, vec![3, 4]);
        assert_eq!(buffer.latest(50).len(), 5);
    }

    #[test]
    fn test_snapshot_cap_of_eight() {
        let mut buffer = SnapshotBuffer::new(8);
        for i in 0..12u8 {
            buffer.push_at(vec![i], t(i as i64));
        }
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.all()[0].data, vec![4]);
        assert_eq!(buffer.latest().map(|s| s.data), Some(vec![11]));
    }
}
