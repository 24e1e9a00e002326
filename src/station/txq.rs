//! TX job pool and packed downlink payload buffer.
//!
//! Free slots are threaded through `next` starting at the free head. Payload bytes
//! of committed jobs tile `[0, in_use)` without holes: freeing a job slides the
//! tail down and rebases every offset above the freed range.

use tracing::{trace, warn};

use super::error::Error;
use super::rps::Rps;
use super::rt::Ustime;
use super::{MAX_TXJOBS, TXDATA_SIZE};

pub const TXFLAG_TXING:u8 =     0x01;
pub const TXFLAG_TXCHECKED:u8 = 0x02;
pub const TXFLAG_CLSA:u8 =      0x04;
pub const TXFLAG_PING:u8 =      0x08;
pub const TXFLAG_CLSC:u8 =      0x10;
pub const TXFLAG_BCN:u8 =       0x20;

/// Link stored inside a job: not linked, end of list, or another slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxLink {
    #[default]
    Nil,
    End,
    Job(u16),
}

/// Handle to a job slot. The generation changes whenever the slot is freed,
/// so stale handles stop resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxIdx {
    pub slot: u16,
    pub gen: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct TxJob {
    pub deveui: u64,
    pub diid: i64,
    pub rctx: i64,
    pub txtime: Ustime,
    pub gpstime: i64,
    pub xtime: i64,
    pub airtime: Ustime,
    pub rxdelay: u8,
    pub preamble: u16,
    pub freq: u32,
    pub rps: Rps,
    pub dr: u8,
    pub txpow: i16,             /* dBm x10 */
    pub alt_ants: u8,
    pub addcrc: bool,
    pub rx2freq: u32,
    pub rx2dr: u8,
    pub txunit: u8,
    pub prio: u8,
    pub retries: u8,
    pub txflags: u8,
    pub dnchnl: u8,
    pub dnchnl2: u8,
    pub next: TxLink,
    pub off: Option<u16>,
    pub len: u16,
}

impl Default for TxJob {
    fn default() -> Self {
        Self {
            deveui: 0,
            diid: 0,
            rctx: 0,
            txtime: 0,
            gpstime: 0,
            xtime: 0,
            airtime: 0,
            rxdelay: 0,
            preamble: 0,
            freq: 0,
            rps: Rps::ILLEGAL,
            dr: 0,
            txpow: 0,
            alt_ants: 0,
            addcrc: false,
            rx2freq: 0,
            rx2dr: 0,
            txunit: 0,
            prio: 0,
            retries: 0,
            txflags: 0,
            dnchnl: 0,
            dnchnl2: 0,
            next: TxLink::Nil,
            off: None,
            len: 0,
        }
    }
}

impl TxJob {
    pub fn has(&self, flag: u8) -> bool {
        self.txflags & flag != 0
    }
}

#[derive(Debug)]
pub struct Txq {
    jobs: Vec<TxJob>,
    gens: Vec<u16>,
    free_head: TxLink,
    data: Vec<u8>,
    in_use: usize,
}

impl Txq {
    pub fn new() -> Self {
        Self::with_capacity(MAX_TXJOBS, TXDATA_SIZE)
    }

    pub fn with_capacity(njobs: usize, ndata: usize) -> Self {
        let njobs = njobs.clamp(1, u16::MAX as usize);
        let ndata = ndata.min(u16::MAX as usize);
        let mut jobs = vec![TxJob::default(); njobs];
        for (i, j) in jobs.iter_mut().enumerate() {
            j.next = if i + 1 < njobs { TxLink::Job(i as u16 + 1) } else { TxLink::End };
        }
        Self {
            jobs,
            gens: vec![0; njobs],
            free_head: TxLink::Job(0),
            data: vec![0; ndata],
            in_use: 0,
        }
    }

    fn handle(&self, slot: u16) -> TxIdx {
        TxIdx { slot, gen: self.gens[slot as usize] }
    }

    fn resolve(&self, idx: TxIdx) -> Option<usize> {
        let s = idx.slot as usize;
        if s < self.jobs.len() && self.gens[s] == idx.gen {
            Some(s)
        } else {
            None
        }
    }

    pub fn get(&self, idx: TxIdx) -> Option<&TxJob> {
        self.resolve(idx).map(|s| &self.jobs[s])
    }

    pub fn get_mut(&mut self, idx: TxIdx) -> Option<&mut TxJob> {
        self.resolve(idx).map(move |s| &mut self.jobs[s])
    }

    /// Hands out the head of the free list with all fields reset. Until the job is
    /// committed, calling this again yields the same slot.
    pub fn reserve_job(&mut self) -> Option<TxIdx> {
        let slot = match self.free_head {
            TxLink::Job(s) => s,
            _ => {
                warn!("TX job pool exhausted");
                return None;
            }
        };
        let j = &mut self.jobs[slot as usize];
        let next = j.next;
        *j = TxJob { next, ..TxJob::default() };
        Some(self.handle(slot))
    }

    /// Space for up to `maxlen` payload bytes at the end of the buffer.
    /// Nothing is consumed until the job is committed.
    pub fn reserve_data(&mut self, maxlen: usize) -> Option<&mut [u8]> {
        if maxlen > self.data.len() - self.in_use {
            warn!("TX data buffer exhausted (need {} have {})", maxlen, self.data.len() - self.in_use);
            return None;
        }
        let start = self.in_use;
        Some(&mut self.data[start..start + maxlen])
    }

    /// Takes a reserved job off the free list and claims `len` payload bytes.
    pub fn commit_job(&mut self, idx: TxIdx) -> Result<(), Error> {
        let s = self.resolve(idx).ok_or(Error::TxqFull)?;
        if self.free_head != TxLink::Job(idx.slot) {
            return Err(Error::TxqFull);
        }
        let len = self.jobs[s].len as usize;
        if len > self.data.len() - self.in_use {
            return Err(Error::TxDataFull(len));
        }
        self.free_head = self.jobs[s].next;
        let j = &mut self.jobs[s];
        j.next = TxLink::Nil;
        j.off = Some(self.in_use as u16);
        self.in_use += len;
        trace!(slot = idx.slot, off = self.in_use - len, len, "txjob committed");
        Ok(())
    }

    /// Releases the payload of a job and compacts the buffer.
    pub fn free_data(&mut self, idx: TxIdx) {
        let s = match self.resolve(idx) {
            Some(s) => s,
            None => return,
        };
        let (off, len) = match self.jobs[s].off {
            Some(off) => (off as usize, self.jobs[s].len as usize),
            None => return,
        };
        if len > 0 {
            self.data.copy_within(off + len..self.in_use, off);
            for (i, j) in self.jobs.iter_mut().enumerate() {
                if i == s {
                    continue;
                }
                if let Some(o) = j.off {
                    if o as usize > off {
                        j.off = Some(o - len as u16);
                    }
                }
            }
            self.in_use -= len;
        }
        let j = &mut self.jobs[s];
        j.off = None;
        j.len = 0;
    }

    /// Returns a job that is not linked into any queue to the pool.
    pub fn free_job(&mut self, idx: TxIdx) {
        let s = match self.resolve(idx) {
            Some(s) => s,
            None => return,
        };
        debug_assert!(self.jobs[s].next == TxLink::Nil, "freeing a queued job");
        self.free_data(idx);
        self.jobs[s] = TxJob { next: self.free_head, ..TxJob::default() };
        self.free_head = TxLink::Job(idx.slot);
        self.gens[s] = self.gens[s].wrapping_add(1);
    }

    pub fn data(&self, idx: TxIdx) -> &[u8] {
        match self.get(idx) {
            Some(TxJob { off: Some(off), len, .. }) => {
                &self.data[*off as usize..*off as usize + *len as usize]
            }
            _ => &[],
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.jobs.len()
    }

    pub fn free_count(&self) -> usize {
        let mut n = 0;
        let mut l = self.free_head;
        while let TxLink::Job(s) = l {
            n += 1;
            l = self.jobs[s as usize].next;
        }
        n
    }

    /* per-unit queues, ordered by txtime then descending priority */

    /// Inserts `idx` behind every job that is due earlier, or at the same time with
    /// at least the same priority.
    pub fn insert(&mut self, head: &mut TxLink, idx: TxIdx) {
        let s = match self.resolve(idx) {
            Some(s) => s,
            None => return,
        };
        debug_assert!(self.jobs[s].next == TxLink::Nil, "job already queued");
        let (txtime, prio) = (self.jobs[s].txtime, self.jobs[s].prio);
        let mut prev: Option<usize> = None;
        let mut cur = *head;
        while let TxLink::Job(c) = cur {
            let cj = &self.jobs[c as usize];
            if cj.txtime > txtime || (cj.txtime == txtime && cj.prio < prio) {
                break;
            }
            prev = Some(c as usize);
            cur = cj.next;
        }
        self.jobs[s].next = match cur {
            TxLink::Nil => TxLink::End,
            l => l,
        };
        match prev {
            Some(p) => self.jobs[p].next = TxLink::Job(idx.slot),
            None => *head = TxLink::Job(idx.slot),
        }
    }

    /// Unlinks `idx` from the queue at `head`. Returns false if it was not queued there.
    pub fn unqueue(&mut self, head: &mut TxLink, idx: TxIdx) -> bool {
        let s = match self.resolve(idx) {
            Some(s) => s,
            None => return false,
        };
        let mut prev: Option<usize> = None;
        let mut cur = *head;
        while let TxLink::Job(c) = cur {
            if c as usize == s {
                let next = self.jobs[s].next;
                match prev {
                    Some(p) => self.jobs[p].next = next,
                    None => *head = if next == TxLink::End { TxLink::Nil } else { next },
                }
                self.jobs[s].next = TxLink::Nil;
                return true;
            }
            prev = Some(c as usize);
            cur = self.jobs[c as usize].next;
        }
        false
    }

    pub fn head_of(&self, head: TxLink) -> Option<TxIdx> {
        match head {
            TxLink::Job(s) => Some(self.handle(s)),
            _ => None,
        }
    }

    pub fn next_in_queue(&self, idx: TxIdx) -> Option<TxIdx> {
        match self.get(idx)?.next {
            TxLink::Job(s) => Some(self.handle(s)),
            _ => None,
        }
    }

    pub fn iter(&self, head: TxLink) -> QueueIter<'_> {
        QueueIter { txq: self, cur: head }
    }

    /// Moves a queued job to its new position after its txtime or priority changed.
    pub fn requeue(&mut self, head: &mut TxLink, idx: TxIdx) {
        if self.unqueue(head, idx) {
            self.insert(head, idx);
        }
    }

    /// Checks that committed payloads tile `[0, in_use)` and every slot is accounted for.
    pub fn verify(&self) -> Result<(), String> {
        let mut ranges: Vec<(usize, usize)> = self
            .jobs
            .iter()
            .filter_map(|j| j.off.map(|o| (o as usize, o as usize + j.len as usize)))
            .collect();
        ranges.sort();
        let mut end = 0;
        for (a, b) in ranges {
            if a != end {
                return Err(format!("gap or overlap at {} (expected {})", a, end));
            }
            end = b;
        }
        if end != self.in_use {
            return Err(format!("tiling ends at {} but in_use is {}", end, self.in_use));
        }
        let committed = self.jobs.iter().filter(|j| j.off.is_some()).count();
        if committed + self.free_count() > self.jobs.len() {
            return Err("slot counted twice".to_string());
        }
        Ok(())
    }
}

impl Default for Txq {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueueIter<'a> {
    txq: &'a Txq,
    cur: TxLink,
}

impl<'a> Iterator for QueueIter<'a> {
    type Item = TxIdx;

    fn next(&mut self) -> Option<TxIdx> {
        match self.cur {
            TxLink::Job(s) => {
                self.cur = self.txq.jobs[s as usize].next;
                Some(self.txq.handle(s))
            }
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn add(q: &mut Txq, len: usize, fill: u8) -> TxIdx {
        let idx = q.reserve_job().unwrap();
        q.reserve_data(len).unwrap().fill(fill);
        q.get_mut(idx).unwrap().len = len as u16;
        q.commit_job(idx).unwrap();
        idx
    }

    #[test]
    fn reserve_is_idempotent() {
        let mut q = Txq::with_capacity(4, 100);
        let a = q.reserve_job().unwrap();
        q.get_mut(a).unwrap().freq = 868_100_000;
        let b = q.reserve_job().unwrap();
        assert_eq!(a, b);
        assert_eq!(q.get(b).unwrap().freq, 0);
        assert_eq!(q.free_count(), 4);
    }

    #[test]
    fn pool_exhaustion() {
        let mut q = Txq::with_capacity(2, 100);
        add(&mut q, 10, 1);
        add(&mut q, 10, 2);
        assert!(q.reserve_job().is_none());
        assert!(q.reserve_data(81).is_none());
        assert!(q.reserve_data(80).is_some());
    }

    #[test]
    fn free_compacts_and_rebases() {
        let mut q = Txq::new();
        let j1 = add(&mut q, 100, 1);
        let j2 = add(&mut q, 50, 2);
        let j3 = add(&mut q, 200, 3);
        q.free_job(j2);
        assert_eq!(q.in_use(), 300);
        assert_eq!(q.get(j1).unwrap().off, Some(0));
        assert_eq!(q.get(j3).unwrap().off, Some(100));
        assert!(q.data(j3).iter().all(|b| *b == 3));
        assert!(q.get(j2).is_none());
        assert_eq!(q.free_count(), MAX_TXJOBS - 2);
        q.verify().unwrap();
    }

    #[test]
    fn empty_payload_commit() {
        let mut q = Txq::new();
        add(&mut q, 20, 9);
        let e = add(&mut q, 0, 0);
        assert_eq!(q.get(e).unwrap().off, Some(20));
        assert_eq!(q.in_use(), 20);
        q.free_job(e);
        assert_eq!(q.in_use(), 20);
        q.verify().unwrap();
    }

    #[test]
    fn queue_order_and_priority() {
        let mut q = Txq::new();
        let mut head = TxLink::Nil;
        let mk = |q: &mut Txq, t: Ustime, p: u8| {
            let i = add(q, 1, 0);
            let j = q.get_mut(i).unwrap();
            j.txtime = t;
            j.prio = p;
            i
        };
        let a = mk(&mut q, 300, 0);
        let b = mk(&mut q, 100, 0);
        let c = mk(&mut q, 100, 50);
        let d = mk(&mut q, 200, 0);
        for i in [a, b, c, d] {
            q.insert(&mut head, i);
        }
        assert_eq!(q.iter(head).collect::<Vec<_>>(), vec![c, b, d, a]);

        assert!(q.unqueue(&mut head, c));
        assert!(!q.unqueue(&mut head, c));
        assert_eq!(q.head_of(head), Some(b));
        q.get_mut(b).unwrap().txtime = 400;
        q.requeue(&mut head, b);
        assert_eq!(q.iter(head).collect::<Vec<_>>(), vec![d, a, b]);
        for i in [d, a, b] {
            assert!(q.unqueue(&mut head, i));
        }
        assert_eq!(head, TxLink::Nil);
    }
}
