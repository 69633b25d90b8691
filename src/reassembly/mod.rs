//! Per-direction TCP stream reassembly.
//!
//! Sequence numbers are tracked relative to the first data byte of the
//! direction (`seq_start`), so wraparound of the absolute 32-bit space is
//! handled by wrapping subtraction. Out-of-order runs are kept in an ordered
//! queue of owned byte runs that never overlap; runs are only released once
//! their start matches the expected counter.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::tls::RECORD_HEADER_LEN;

/// Where an incoming segment sits relative to the expected counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Segment starts exactly at the expected counter.
    Synchronized,
    /// Segment starts before the expected counter (retransmission/overlap).
    Behind,
    /// Segment starts after the expected counter (gap).
    Ahead,
    /// Direction was terminated by an unrecovered ack fault.
    Fatal,
}

/// Result of feeding one segment.
#[derive(Debug, PartialEq, Eq)]
pub enum Adjusted<'a> {
    /// Bytes that continue the in-order stream, ready for the record parser.
    InOrder(&'a [u8]),
    /// Every byte of the segment was already delivered or queued.
    Duplicate,
    /// Segment queued behind a gap (or repair mode is active).
    Buffered,
    /// Segment carried no payload.
    Empty,
}

/// Reassembly memory budget shared by both directions of a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub limit: Option<usize>,
    /// Bytes already buffered by the other direction.
    pub other: usize,
}

#[derive(Debug, Clone)]
struct Segment {
    begin: u32,
    data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.begin.wrapping_add(self.data.len() as u32)
    }
}

#[derive(Debug, Default)]
pub struct StreamReassembly {
    seq_start: Option<u32>,
    expected: u32,
    segments: VecDeque<Segment>,
    buffered: usize,
    skip_partial: bool,
    captured_fin: Option<u32>,
    fin_reached: bool,
    fin_events: u32,
    ack_faulted: bool,
    fatal: bool,
    missed_bytes: u64,
    duplicates: u64,
}

impl StreamReassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor the direction at an observed SYN. The SYN consumes one
    /// sequence number, so data starts at `isn + 1`.
    pub fn set_initial_seq(&mut self, isn: u32) {
        self.seq_start = Some(isn.wrapping_add(1));
        self.expected = 0;
    }

    /// Anchor the direction at the first segment seen when its SYN was
    /// missed. `skip_partial` starts the direction in repair mode so the
    /// record parser waits for a record boundary.
    pub fn start_mid_stream(&mut self, seq: u32, skip_partial: bool) {
        self.seq_start = Some(seq);
        self.expected = 0;
        self.skip_partial = skip_partial;
    }

    pub fn is_anchored(&self) -> bool {
        self.seq_start.is_some()
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn skip_partial(&self) -> bool {
        self.skip_partial
    }

    pub fn fin_reached(&self) -> bool {
        self.fin_reached
    }

    pub fn has_captured_fin(&self) -> bool {
        self.captured_fin.is_some()
    }

    pub fn missed_bytes(&self) -> u64 {
        self.missed_bytes
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn mark_fatal(&mut self) {
        self.fatal = true;
    }

    /// One-shot: reports (and clears) whether an ack fault recovery ran.
    pub fn take_ack_fault(&mut self) -> bool {
        std::mem::take(&mut self.ack_faulted)
    }

    /// Number of FINs that became in-order since the last call.
    pub fn take_fin_events(&mut self) -> u32 {
        std::mem::take(&mut self.fin_events)
    }

    fn relative(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.seq_start.unwrap_or(seq))
    }

    pub fn classify(&self, seq: u32) -> SyncState {
        if self.fatal {
            return SyncState::Fatal;
        }
        let real = self.relative(seq);
        if real == self.expected {
            SyncState::Synchronized
        } else if seq_lt(real, self.expected) {
            SyncState::Behind
        } else {
            SyncState::Ahead
        }
    }

    /// Place one segment in the stream.
    ///
    /// Fully duplicated data is dropped, partially duplicated data is trimmed
    /// to its new tail, data beyond a gap is queued. In repair mode every
    /// segment is queued so [`find_next_record`](Self::find_next_record) can
    /// pick the resynchronization point.
    pub fn adjust_sequence<'a>(
        &mut self,
        seq: u32,
        payload: &'a [u8],
        fin: bool,
        budget: Budget,
    ) -> Result<Adjusted<'a>> {
        if self.seq_start.is_none() {
            self.seq_start = Some(seq);
        }
        let mut real = self.relative(seq);
        let mut payload = payload;

        if seq_lt(real, self.expected) {
            let end = real.wrapping_add(payload.len() as u32);
            if seq_le(end, self.expected) {
                if !payload.is_empty() {
                    self.duplicates += 1;
                }
                return Ok(if payload.is_empty() {
                    Adjusted::Empty
                } else {
                    Adjusted::Duplicate
                });
            }
            let overlap = self.expected.wrapping_sub(real) as usize;
            payload = &payload[overlap..];
            real = self.expected;
        }

        if fin {
            let pos = real.wrapping_add(payload.len() as u32);
            if !self.fin_reached {
                self.captured_fin = Some(pos);
            }
        }

        if real != self.expected || self.skip_partial {
            self.insert(real, payload, budget)?;
            self.settle_fin();
            return Ok(if payload.is_empty() {
                Adjusted::Empty
            } else {
                Adjusted::Buffered
            });
        }

        self.expected = self.expected.wrapping_add(payload.len() as u32);
        self.settle_fin();
        Ok(if payload.is_empty() {
            Adjusted::Empty
        } else {
            Adjusted::InOrder(payload)
        })
    }

    /// Pop the next queued run if it now continues the in-order stream.
    pub fn next_contiguous(&mut self) -> Option<Vec<u8>> {
        if self.skip_partial {
            return None;
        }
        while let Some(front) = self.segments.front() {
            if seq_le(front.end(), self.expected) {
                self.drop_front();
                self.duplicates += 1;
                continue;
            }
            if seq_lt(self.expected, front.begin) {
                return None;
            }
            let mut seg = self.segments.pop_front()?;
            self.buffered -= seg.data.len();
            let skip = self.expected.wrapping_sub(seg.begin) as usize;
            if skip > 0 {
                seg.data.drain(..skip);
            }
            self.expected = self.expected.wrapping_add(seg.data.len() as u32);
            self.settle_fin();
            return Some(seg.data);
        }
        None
    }

    /// Insert a run into the ordered queue, trimming it against the
    /// preceding run's end and splitting it around following runs so the
    /// queue stays strictly ordered and non-overlapping.
    fn insert(&mut self, begin: u32, data: &[u8], budget: Budget) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut cur_begin = begin;
        let mut cur = data;

        let mut idx = self.segments.partition_point(|s| seq_le(s.begin, cur_begin));
        if idx > 0 {
            let prev_end = self.segments[idx - 1].end();
            let cur_end = cur_begin.wrapping_add(cur.len() as u32);
            if seq_le(cur_end, prev_end) {
                self.duplicates += 1;
                return Ok(());
            }
            if seq_lt(cur_begin, prev_end) {
                let overlap = prev_end.wrapping_sub(cur_begin) as usize;
                cur = &cur[overlap..];
                cur_begin = prev_end;
            }
        }

        while !cur.is_empty() {
            let cur_end = cur_begin.wrapping_add(cur.len() as u32);
            let next = self
                .segments
                .get(idx)
                .filter(|next| seq_lt(next.begin, cur_end))
                .map(|next| (next.begin, next.end()));
            match next {
                Some((next_begin, next_end)) => {
                    let head = next_begin.wrapping_sub(cur_begin) as usize;
                    if head > 0 {
                        self.place(idx, cur_begin, &cur[..head], budget)?;
                        idx += 1;
                    }
                    if !seq_lt(next_end, cur_end) {
                        break;
                    }
                    let covered = next_end.wrapping_sub(cur_begin) as usize;
                    cur = &cur[covered..];
                    cur_begin = next_end;
                    idx += 1;
                }
                None => {
                    self.place(idx, cur_begin, cur, budget)?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn place(&mut self, idx: usize, begin: u32, data: &[u8], budget: Budget) -> Result<()> {
        if let Some(limit) = budget.limit {
            if budget.other + self.buffered + data.len() > limit {
                return Err(Error::ReassemblyLimit { limit });
            }
        }
        self.segments.insert(
            idx,
            Segment {
                begin,
                data: data.to_vec(),
            },
        );
        self.buffered += data.len();
        Ok(())
    }

    fn drop_front(&mut self) {
        if let Some(seg) = self.segments.pop_front() {
            self.buffered -= seg.data.len();
        }
    }

    /// Convert a captured FIN into a counted terminal event once the
    /// expected counter has reached it.
    fn settle_fin(&mut self) {
        if self.fin_reached {
            self.captured_fin = None;
            return;
        }
        if let Some(pos) = self.captured_fin {
            if seq_le(pos, self.expected) {
                self.captured_fin = None;
                self.fin_reached = true;
                self.fin_events += 1;
                let after = pos.wrapping_add(1);
                if seq_lt(self.expected, after) {
                    self.expected = after;
                }
            }
        }
    }

    /// Compare the peer's acknowledgment against what this direction has
    /// delivered. Returns the number of acknowledged bytes never observed.
    pub fn ack_fault(&self, ack: u32) -> Option<u32> {
        let start = self.seq_start?;
        let rel = ack.wrapping_sub(start);
        if seq_lt(self.expected, rel) {
            Some(rel.wrapping_sub(self.expected))
        } else {
            None
        }
    }

    /// Best-effort recovery from an ack fault: jump the expected counter to
    /// the head of the queue (or to the acknowledged position when nothing
    /// is queued) and enter repair mode. Returns the number of bytes given
    /// up for this direction.
    pub fn recover_from_ack_fault(&mut self, ack: u32) -> u32 {
        let rel = ack.wrapping_sub(self.seq_start.unwrap_or(ack));
        let target = match self.segments.front() {
            Some(seg) => seg.begin,
            None => rel,
        };
        let skipped = if seq_lt(self.expected, target) {
            target.wrapping_sub(self.expected)
        } else {
            0
        };
        self.expected = self.expected.wrapping_add(skipped);
        self.missed_bytes += skipped as u64;
        self.skip_partial = true;
        self.ack_faulted = true;
        self.settle_fin();
        skipped
    }

    /// Repair mode: scan the queued bytes following the expected counter for
    /// the first offset `is_record_start` accepts and resynchronize there.
    /// Only the bytes skipped in front of that offset are given up. Returns
    /// true once the direction is out of repair mode.
    ///
    /// When no boundary is found, bytes up to a gap are discarded; at the end
    /// of the queue the last `RECORD_HEADER_LEN - 1` bytes are kept since
    /// they may begin a header completed by the next segment.
    pub fn find_next_record<F>(&mut self, is_record_start: F) -> bool
    where
        F: Fn(&[u8]) -> bool,
    {
        if !self.skip_partial {
            return true;
        }
        loop {
            self.drop_consumed();
            let Some(front_begin) = self.segments.front().map(|f| f.begin) else {
                return false;
            };
            if seq_lt(self.expected, front_begin) {
                self.skip_to(front_begin);
            }

            let (view, reaches_gap) = self.contiguous_view();
            if let Some(offset) = (0..view.len()).find(|&p| is_record_start(&view[p..])) {
                self.skip_to(self.expected.wrapping_add(offset as u32));
                self.drop_consumed();
                self.skip_partial = false;
                return true;
            }
            if reaches_gap {
                self.skip_to(self.expected.wrapping_add(view.len() as u32));
                continue;
            }
            let keep = view.len().min(RECORD_HEADER_LEN - 1);
            self.skip_to(self.expected.wrapping_add((view.len() - keep) as u32));
            self.drop_consumed();
            return false;
        }
    }

    /// Queued bytes from the expected counter up to the first gap, and
    /// whether a gap (rather than the end of the queue) stopped the copy.
    fn contiguous_view(&self) -> (Vec<u8>, bool) {
        let mut view = Vec::new();
        let mut pos = self.expected;
        for seg in &self.segments {
            if seq_lt(pos, seg.begin) {
                return (view, true);
            }
            let skip = pos.wrapping_sub(seg.begin) as usize;
            if skip < seg.data.len() {
                view.extend_from_slice(&seg.data[skip..]);
                pos = seg.end();
            }
        }
        (view, false)
    }

    /// Give up every byte before `pos`.
    fn skip_to(&mut self, pos: u32) {
        if seq_lt(self.expected, pos) {
            self.missed_bytes += pos.wrapping_sub(self.expected) as u64;
            self.expected = pos;
            self.settle_fin();
        }
    }

    /// Trim queued runs to the expected counter.
    fn drop_consumed(&mut self) {
        while self
            .segments
            .front()
            .is_some_and(|front| seq_le(front.end(), self.expected))
        {
            self.drop_front();
        }
        if let Some(front) = self.segments.front_mut() {
            if seq_lt(front.begin, self.expected) {
                let cut = self.expected.wrapping_sub(front.begin) as usize;
                front.data.drain(..cut);
                front.begin = self.expected;
                self.buffered -= cut;
            }
        }
    }
}

/// Wrap-aware sequence comparison: `a` precedes `b`.
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}
