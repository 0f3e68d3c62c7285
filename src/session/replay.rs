//! Bounded replay buffer for stream resumption.

use bytes::Bytes;
use std::collections::VecDeque;

/// What a resuming client gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Every frame after the client's last-seen sequence, in order.
    /// Empty when the client is already current.
    Frames(Vec<(u64, Bytes)>),
    /// The resume point has been overwritten (or never existed).
    Resync { next_seq: u64 },
}

/// Ring of the most recent frames of one session. Sequence numbers start at 1.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    frames: VecDeque<(u64, Bytes)>,
    next_seq: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity.clamp(1, 1024)),
            next_seq: 1,
        }
    }

    /// Assign the next sequence number to `payload` and retain it.
    /// Overflow silently drops the oldest frame.
    pub fn push(&mut self, payload: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back((seq, payload));
        seq
    }

    /// Sequence number the next pushed frame will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Frames after `last_seen`, or `Resync` if any of them are gone.
    pub fn since(&self, last_seen: u64) -> Replay {
        let newest = self.next_seq - 1;
        if last_seen > newest {
            return Replay::Resync { next_seq: self.next_seq };
        }
        if last_seen == newest {
            return Replay::Frames(Vec::new());
        }
        match self.frames.front() {
            Some(&(oldest, _)) if oldest <= last_seen + 1 => Replay::Frames(
                self.frames
                    .iter()
                    .filter(|(seq, _)| *seq > last_seen)
                    .cloned()
                    .collect(),
            ),
            _ => Replay::Resync { next_seq: self.next_seq },
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, count: u64) -> ReplayBuffer {
        let mut buf = ReplayBuffer::new(capacity);
        for i in 1..=count {
            assert_eq!(buf.push(Bytes::from(format!("f{i}"))), i);
        }
        buf
    }

    fn seqs(replay: Replay) -> Vec<u64> {
        match replay {
            Replay::Frames(frames) => frames.into_iter().map(|(s, _)| s).collect(),
            Replay::Resync { .. } => panic!("unexpected resync"),
        }
    }

    #[test]
    fn replays_exactly_the_missing_frames() {
        let buf = filled(8, 6);
        assert_eq!(seqs(buf.since(3)), vec![4, 5, 6]);
        assert_eq!(seqs(buf.since(0)), vec![1, 2, 3, 4, 5, 6]);
        assert!(seqs(buf.since(6)).is_empty());
    }

    #[test]
    fn overflow_triggers_resync() {
        let buf = filled(4, 10); // holds 7..=10
        assert_eq!(seqs(buf.since(6)), vec![7, 8, 9, 10]);
        assert_eq!(buf.since(5), Replay::Resync { next_seq: 11 });
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn future_sequence_is_a_resync() {
        let buf = filled(4, 2);
        assert_eq!(buf.since(9), Replay::Resync { next_seq: 3 });
        let fresh = ReplayBuffer::new(4);
        assert!(seqs(fresh.since(0)).is_empty());
    }
}
