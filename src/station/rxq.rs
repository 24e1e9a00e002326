//! Uplink FIFO. Jobs occupy `jobs[first..next]`, their payloads are packed back to
//! back in `data` in the same order. Space is reclaimed by sliding everything down.

use tracing::{debug, warn};

use super::{MAX_RXFRAME_LEN, MAX_RXJOBS, RXDATA_SIZE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxJob {
    pub freq: u32,
    pub rssi: u8,       /* -dBm */
    pub snr: i8,        /* dB x4 */
    pub dr: u8,
    pub len: u16,
    pub off: u16,
    pub xtime: i64,
    pub rctx: i64,
    pub fts: i32,       /* fine timestamp, -1 if none */
}

impl Default for RxJob {
    fn default() -> Self {
        Self {
            freq: 0,
            rssi: 0,
            snr: 0,
            dr: 0,
            len: 0,
            off: 0,
            xtime: 0,
            rctx: 0,
            fts: -1,
        }
    }
}

#[derive(Debug)]
pub struct Rxq {
    jobs: Vec<RxJob>,
    data: Vec<u8>,
    first: usize,
    next: usize,
    pub dropped: u32,
}

impl Rxq {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RXJOBS, RXDATA_SIZE)
    }

    pub fn with_capacity(njobs: usize, ndata: usize) -> Self {
        Self {
            jobs: vec![RxJob::default(); njobs.max(1)],
            data: vec![0; ndata.clamp(MAX_RXFRAME_LEN, u16::MAX as usize)],
            first: 0,
            next: 0,
            dropped: 0,
        }
    }

    fn tail_off(&self) -> usize {
        if self.next > self.first {
            let j = &self.jobs[self.next - 1];
            j.off as usize + j.len as usize
        } else {
            0
        }
    }

    /* move live jobs to index 0 and their bytes to offset 0 */
    fn slide(&mut self) {
        if self.first == 0 {
            return;
        }
        let end = self.tail_off();
        let base = self.jobs[self.first].off as usize;
        self.data.copy_within(base..end, 0);
        self.jobs.copy_within(self.first..self.next, 0);
        self.next -= self.first;
        self.first = 0;
        for j in &mut self.jobs[..self.next] {
            j.off -= base as u16;
        }
        debug!("rxq slid down by {} jobs / {} bytes", self.next, base);
    }

    /// Prepares the slot at the tail with room for a maximum sized frame.
    /// Returns None if the queue is full even after compaction.
    pub fn next_job(&mut self) -> Option<usize> {
        if self.first == self.next {
            self.first = 0;
            self.next = 0;
        }
        if self.next == self.jobs.len() || self.tail_off() + MAX_RXFRAME_LEN > self.data.len() {
            self.slide();
        }
        if self.next == self.jobs.len() || self.tail_off() + MAX_RXFRAME_LEN > self.data.len() {
            self.dropped += 1;
            warn!("RX queue full - frame dropped (total {})", self.dropped);
            return None;
        }
        let off = self.tail_off() as u16;
        self.jobs[self.next] = RxJob { off, ..RxJob::default() };
        Some(self.next)
    }

    pub fn job_mut(&mut self, idx: usize) -> &mut RxJob {
        &mut self.jobs[idx]
    }

    /// Writable payload area of the prepared tail job.
    pub fn payload_mut(&mut self, idx: usize) -> &mut [u8] {
        let off = self.jobs[idx].off as usize;
        &mut self.data[off..off + MAX_RXFRAME_LEN]
    }

    pub fn commit_job(&mut self, idx: usize) {
        debug_assert_eq!(idx, self.next);
        let j = &mut self.jobs[idx];
        j.len = j.len.min(MAX_RXFRAME_LEN as u16);
        self.next += 1;
    }

    /// Removes a job from anywhere in the queue keeping the survivors in order.
    pub fn drop_job(&mut self, idx: usize) {
        if idx < self.first || idx >= self.next {
            return;
        }
        let end = self.tail_off();
        let (off, len) = (self.jobs[idx].off as usize, self.jobs[idx].len as usize);
        self.data.copy_within(off + len..end, off);
        self.jobs.copy_within(idx + 1..self.next, idx);
        self.next -= 1;
        for j in &mut self.jobs[idx..self.next] {
            j.off -= len as u16;
        }
    }

    /// Drops the oldest job.
    pub fn pop_front(&mut self) -> Option<RxJob> {
        if self.first == self.next {
            return None;
        }
        let j = self.jobs[self.first];
        self.first += 1;
        if self.first == self.next {
            self.first = 0;
            self.next = 0;
        }
        Some(j)
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn front(&self) -> Option<usize> {
        if self.first < self.next {
            Some(self.first)
        } else {
            None
        }
    }

    pub fn job(&self, idx: usize) -> &RxJob {
        &self.jobs[idx]
    }

    pub fn jobs(&self) -> &[RxJob] {
        &self.jobs[self.first..self.next]
    }

    pub fn payload(&self, idx: usize) -> &[u8] {
        let j = &self.jobs[idx];
        &self.data[j.off as usize..j.off as usize + j.len as usize]
    }

    pub fn len(&self) -> usize {
        self.next - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.next
    }

    /// Adjacent live jobs must be packed without holes.
    pub fn verify(&self) -> Result<(), String> {
        for w in self.jobs[self.first..self.next].windows(2) {
            if w[0].off as usize + w[0].len as usize != w[1].off as usize {
                return Err(format!("hole between offsets {} and {}", w[0].off, w[1].off));
            }
        }
        Ok(())
    }
}

impl Default for Rxq {
    fn default() -> Self {
        Self::new()
    }
}
