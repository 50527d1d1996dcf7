//! Reordering queue for client data waiting to be written to the outbound socket.

use std::collections::VecDeque;

/// `a` precedes `b` in sequence space.
pub(crate) fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub seq: u32,
    pub data: Vec<u8>,
    pub psh: bool,
}

impl Segment {
    pub(crate) fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queued {
    Inserted,
    /// Queued segments it fully covered were dropped, e.g. a shorter one with the same start.
    Replaced,
    /// Every new byte is already queued.
    Duplicate,
    /// Every byte was already forwarded.
    Stale,
}

/// What the head of the queue allows at the current remote sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    Empty,
    /// The next byte has not arrived yet.
    Gap,
    /// This many bytes of the head can be written now.
    Ready(usize),
}

/// Segments sorted by starting sequence number. Entries never overlap: a new segment is cut
/// down to the bytes no queued segment holds, and replaces the queued segments it covers.
#[derive(Debug, Default)]
pub(crate) struct ForwardQueue {
    segments: VecDeque<Segment>,
}

impl ForwardQueue {
    pub(crate) fn insert(&mut self, seq: u32, data: &[u8], psh: bool, remote_seq: u32) -> Queued {
        let end = seq.wrapping_add(data.len() as u32);
        if data.is_empty() || !seq_after(end, remote_seq) {
            return Queued::Stale;
        }
        let mut start = if seq_before(seq, remote_seq) { remote_seq } else { seq };

        let pos = self
            .segments
            .iter()
            .position(|s| !seq_before(s.seq, start))
            .unwrap_or(self.segments.len());

        if let Some(prev) = pos.checked_sub(1).and_then(|i| self.segments.get(i)) {
            let prev_end = prev.end();
            if seq_after(prev_end, start) {
                if !seq_after(end, prev_end) {
                    return Queued::Duplicate;
                }
                start = prev_end;
            }
        }
        if self
            .segments
            .get(pos)
            .is_some_and(|next| next.seq == start && !seq_before(next.end(), end))
        {
            return Queued::Duplicate;
        }

        let mut replaced = false;
        while self
            .segments
            .get(pos)
            .is_some_and(|next| !seq_after(next.end(), end))
        {
            self.segments.remove(pos);
            replaced = true;
        }

        let stop = match self.segments.get(pos) {
            Some(next) if seq_before(next.seq, end) => next.seq,
            _ => end,
        };
        if !seq_after(stop, start) {
            return Queued::Duplicate;
        }

        let from = start.wrapping_sub(seq) as usize;
        let to = stop.wrapping_sub(seq) as usize;
        self.segments.insert(
            pos,
            Segment {
                seq: start,
                data: data[from..to].to_vec(),
                psh: psh && stop == end,
            },
        );
        if replaced {
            Queued::Replaced
        } else {
            Queued::Inserted
        }
    }

    pub(crate) fn pending(&self, remote_seq: u32) -> Pending {
        let Some(head) = self
            .segments
            .iter()
            .find(|s| seq_after(s.end(), remote_seq))
        else {
            return Pending::Empty;
        };
        if seq_after(head.seq, remote_seq) {
            return Pending::Gap;
        }
        Pending::Ready(head.end().wrapping_sub(remote_seq) as usize)
    }

    /// Drop segments that end at or before `remote_seq` and return the deliverable rest of the
    /// head together with its push flag.
    pub(crate) fn next_chunk(&mut self, remote_seq: u32) -> Option<(&[u8], bool)> {
        while self
            .segments
            .front()
            .is_some_and(|s| !seq_after(s.end(), remote_seq))
        {
            self.segments.pop_front();
        }
        let head = self.segments.front()?;
        if seq_after(head.seq, remote_seq) {
            return None;
        }
        let sent = remote_seq.wrapping_sub(head.seq) as usize;
        Some((&head.data[sent..], head.psh))
    }

    /// Bytes queued beyond `remote_seq`.
    pub(crate) fn unsent_bytes(&self, remote_seq: u32) -> usize {
        self.segments
            .iter()
            .filter(|s| seq_after(s.end(), remote_seq))
            .map(|s| {
                if seq_before(s.seq, remote_seq) {
                    s.end().wrapping_sub(remote_seq) as usize
                } else {
                    s.data.len()
                }
            })
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn drain(queue: &mut ForwardQueue, remote_seq: &mut u32, out: &mut Vec<u8>) {
        while let Some((chunk, _)) = queue.next_chunk(*remote_seq) {
            out.extend_from_slice(chunk);
            *remote_seq = remote_seq.wrapping_add(chunk.len() as u32);
        }
    }

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_before(u32::MAX, 0));
        assert!(seq_after(5, u32::MAX - 5));
        assert!(!seq_before(7, 7));
        assert!(!seq_after(7, 7));
    }

    #[test]
    fn same_start_keeps_the_longer_segment() {
        let mut queue = ForwardQueue::default();
        assert_eq!(queue.insert(100, b"abc", false, 100), Queued::Inserted);
        assert_eq!(queue.insert(100, b"ab", false, 100), Queued::Duplicate);
        assert_eq!(queue.insert(100, b"abc", false, 100), Queued::Duplicate);
        assert_eq!(queue.insert(100, b"abcdef", true, 100), Queued::Replaced);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_chunk(100), Some((&b"abcdef"[..], true)));
    }

    #[test]
    fn gaps_hold_back_later_segments() {
        let mut queue = ForwardQueue::default();
        queue.insert(107, b"world", false, 100);
        assert_eq!(queue.pending(100), Pending::Gap);
        assert_eq!(queue.next_chunk(100), None);

        queue.insert(100, b"hello, wor", false, 100);
        assert_eq!(queue.pending(100), Pending::Ready(7));

        let mut remote_seq = 100;
        let mut out = Vec::new();
        drain(&mut queue, &mut remote_seq, &mut out);
        assert_eq!(out, b"hello, world");
        assert_eq!(remote_seq, 112);
        assert!(queue.is_empty());
        assert_eq!(queue.pending(remote_seq), Pending::Empty);
    }

    #[test]
    fn overlapping_retransmission_delivers_only_new_bytes() {
        let mut queue = ForwardQueue::default();
        assert_eq!(queue.insert(95, b"01234", false, 100), Queued::Stale);
        assert_eq!(queue.insert(98, b"xy012", false, 100), Queued::Inserted);
        let (chunk, _) = queue.next_chunk(100).unwrap();
        assert_eq!(chunk, b"012");
        assert_eq!(queue.segments[0].seq, 100);
    }

    fn layout(queue: &ForwardQueue) -> Vec<(u32, usize, bool)> {
        queue
            .segments
            .iter()
            .map(|s| (s.seq, s.data.len(), s.psh))
            .collect()
    }

    #[test]
    fn covered_segments_are_replaced_and_overlaps_trimmed() {
        let mut queue = ForwardQueue::default();
        queue.insert(110, &[1; 2], false, 100);
        queue.insert(120, &[2; 2], false, 100);

        // Swallows 110..112 and stops where 120..122 begins.
        assert_eq!(queue.insert(108, &[3; 13], true, 100), Queued::Replaced);
        assert_eq!(layout(&queue), [(108, 12, false), (120, 2, false)]);
        assert_eq!(queue.unsent_bytes(100), 14);
        assert_eq!(queue.unsent_bytes(115), 7);

        assert_eq!(queue.insert(104, &[4; 6], false, 100), Queued::Inserted);
        assert_eq!(layout(&queue), [(104, 4, false), (108, 12, false), (120, 2, false)]);
        assert_eq!(queue.unsent_bytes(100), 18);

        assert_eq!(queue.insert(106, &[5; 10], false, 100), Queued::Duplicate);
        // Overlaps the tail of 108..120 and is a longer 120..122.
        assert_eq!(queue.insert(118, &[6; 6], true, 100), Queued::Replaced);
        assert_eq!(layout(&queue), [(104, 4, false), (108, 12, false), (120, 4, true)]);
    }

    #[test]
    fn stale_heads_do_not_block_pending() {
        let mut queue = ForwardQueue::default();
        queue.insert(0, b"aaaa", false, 0);
        queue.insert(4, b"bbbb", false, 0);
        assert_eq!(queue.pending(4), Pending::Ready(4));
        assert_eq!(queue.pending(8), Pending::Empty);
        assert_eq!(queue.next_chunk(8), None);
        assert!(queue.is_empty());
    }

    fn segments_for(
        stream: &[u8],
        cuts: &[usize],
        extras: &[(usize, usize)],
        order: &[usize],
    ) -> Vec<(usize, usize)> {
        let len = stream.len();
        let mut points: Vec<usize> = cuts.iter().map(|c| c % len).filter(|c| *c > 0).collect();
        points.push(0);
        points.push(len);
        points.sort_unstable();
        points.dedup();

        let mut segments: Vec<(usize, usize)> =
            points.windows(2).map(|w| (w[0], w[1])).collect();
        for (start, extra) in extras {
            let start = start % len;
            let end = start + 1 + extra % (len - start);
            segments.push((start, end));
        }
        for (i, pick) in order.iter().enumerate() {
            let i = i % segments.len();
            let j = pick % segments.len();
            segments.swap(i, j);
        }
        segments
    }

    proptest! {
        #[test]
        fn reordered_overlapping_segments_rebuild_the_stream(
            stream in proptest::collection::vec(any::<u8>(), 1..512),
            isn in any::<u32>(),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
            extras in proptest::collection::vec((any::<usize>(), any::<usize>()), 0..16),
            order in proptest::collection::vec(any::<usize>(), 0..32),
            eager in any::<bool>(),
        ) {
            let mut queue = ForwardQueue::default();
            let mut remote_seq = isn;
            let mut out = Vec::new();

            for (start, end) in segments_for(&stream, &cuts, &extras, &order) {
                let seq = isn.wrapping_add(start as u32);
                queue.insert(seq, &stream[start..end], false, remote_seq);
                for pair in queue.segments.iter().collect::<Vec<_>>().windows(2) {
                    prop_assert!(seq_before(pair[0].seq, pair[1].seq));
                    prop_assert!(!seq_after(pair[0].end(), pair[1].seq));
                }
                if eager {
                    drain(&mut queue, &mut remote_seq, &mut out);
                }
            }
            // Every piece of the stream has been queued once, so nothing is counted twice.
            prop_assert_eq!(queue.unsent_bytes(remote_seq) + out.len(), stream.len());
            drain(&mut queue, &mut remote_seq, &mut out);

            prop_assert_eq!(&out, &stream);
            prop_assert_eq!(remote_seq, isn.wrapping_add(stream.len() as u32));
            prop_assert!(queue.is_empty());
        }
    }
}
