//! Radio layer seen from the station core. The concentrator driver lives behind
//! `Radio`; `SimRadio` stands in for it with a scriptable in-memory model.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, info};

use super::rps::Rps;
use super::rt::{sec, Clock, Ustime};
use super::timesync::TimeSync;
use super::xtime;
use super::MAX_TXUNITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    Ok,
    Fail,
    NoCa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    Scheduled,
    Emitting,
}

#[derive(Debug)]
pub struct TxReq<'a> {
    pub txunit: u8,
    pub xtime: i64,
    pub freq: u32,
    pub rps: Rps,
    pub txpow: i16,
    pub preamble: u16,
    pub addcrc: bool,
    pub nocca: bool,
    pub airtime: Ustime,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct RxFrame {
    pub freq: u32,
    pub rps: Rps,
    pub rssi: u8,
    pub snr: i8,
    pub xtime: i64,
    pub rctx: i64,
    pub fts: i32,
    pub data: Vec<u8>,
}

pub trait Radio {
    /// Applies the opaque hardware section of router_config.
    fn configure(&mut self, hwconf: &Value, region: &str) -> Result<()>;
    fn txunits(&self) -> u8;
    fn tx(&mut self, req: &TxReq) -> TxResult;
    fn tx_status(&mut self, txunit: u8) -> TxStatus;
    fn tx_abort(&mut self, txunit: u8);
    /// Latches a `(ustime, xtime, pps_xtime)` triple together with a quality figure.
    fn timesync(&mut self, txunit: u8) -> Option<(i32, TimeSync)>;
    /// Tags all xtimes of `txunit` reported from now on with `session`.
    fn set_session(&mut self, txunit: u8, session: u8);
    fn poll_rx(&mut self, out: &mut Vec<RxFrame>);
    fn stop(&mut self);
}


#[derive(Debug, Clone, PartialEq)]
pub struct SimTx {
    pub txunit: u8,
    pub xtime: i64,
    pub ustime: Ustime,
    pub freq: u32,
    pub rps: Rps,
    pub txpow: i16,
    pub nocca: bool,
    pub airtime: Ustime,
    pub data: Vec<u8>,
}

/// Shared state of a `SimRadio`. Tests keep a handle to script results and inspect emissions.
#[derive(Debug, Default)]
pub struct SimState {
    pub txs: Vec<SimTx>,
    pub aborts: Vec<u8>,
    pub configured: Option<String>,
    pub tx_script: VecDeque<TxResult>,
    pub rx: VecDeque<RxFrame>,
    pub pps: bool,
    pub stopped: bool,
}

pub type SimHandle = Rc<RefCell<SimState>>;

pub struct SimRadio {
    clock: Box<dyn Clock>,
    txunits: u8,
    sessions: [u8; MAX_TXUNITS],
    emitting: [Option<(Ustime, Ustime)>; MAX_TXUNITS],
    state: SimHandle,
}

impl SimRadio {
    pub fn new(clock: Box<dyn Clock>, txunits: u8) -> (Self, SimHandle) {
        let state: SimHandle = Rc::new(RefCell::new(SimState::default()));
        let r = Self {
            clock,
            txunits: txunits.clamp(1, MAX_TXUNITS as u8),
            sessions: [0; MAX_TXUNITS],
            emitting: [None; MAX_TXUNITS],
            state: state.clone(),
        };
        (r, state)
    }

    /* concentrator ticks: host time shifted per unit so units are not trivially equal */
    fn ticks(&self, txunit: u8, ustime: Ustime) -> i64 {
        ustime + 1_000_000 * (txunit as i64 + 1)
    }

    /// Current xtime of `txunit`, handy for synthesizing RX frames.
    pub fn xtime_now(&self, txunit: u8) -> i64 {
        let u = txunit as usize % MAX_TXUNITS;
        xtime::make(txunit, self.sessions[u], self.ticks(txunit, self.clock.now()))
    }
}

impl Radio for SimRadio {
    fn configure(&mut self, hwconf: &Value, region: &str) -> Result<()> {
        if !hwconf.is_null() && !hwconf.is_object() && !hwconf.is_array() {
            return Err(anyhow!("bad radio configuration"));
        }
        info!("Radio configured for region {}", region);
        self.state.borrow_mut().configured = Some(region.to_string());
        Ok(())
    }

    fn txunits(&self) -> u8 {
        self.txunits
    }

    fn tx(&mut self, req: &TxReq) -> TxResult {
        let u = req.txunit as usize;
        if u >= self.txunits as usize || xtime::session(req.xtime) != self.sessions[u] {
            return TxResult::Fail;
        }
        let mut st = self.state.borrow_mut();
        let res = st.tx_script.pop_front().unwrap_or(TxResult::Ok);
        if res != TxResult::Ok {
            debug!(txunit = req.txunit, ?res, "sim tx refused");
            return res;
        }
        let now = self.clock.now();
        let start = now + (xtime::ticks(req.xtime) - self.ticks(req.txunit, now));
        self.emitting[u] = Some((start, start + req.airtime));
        st.txs.push(SimTx {
            txunit: req.txunit,
            xtime: req.xtime,
            ustime: start,
            freq: req.freq,
            rps: req.rps,
            txpow: req.txpow,
            nocca: req.nocca,
            airtime: req.airtime,
            data: req.data.to_vec(),
        });
        TxResult::Ok
    }

    fn tx_status(&mut self, txunit: u8) -> TxStatus {
        let now = self.clock.now();
        match self.emitting.get(txunit as usize).copied().flatten() {
            Some((start, _)) if now < start => TxStatus::Scheduled,
            Some((_, end)) if now < end => TxStatus::Emitting,
            _ => TxStatus::Idle,
        }
    }

    fn tx_abort(&mut self, txunit: u8) {
        if let Some(e) = self.emitting.get_mut(txunit as usize) {
            *e = None;
        }
        self.state.borrow_mut().aborts.push(txunit);
    }

    fn timesync(&mut self, txunit: u8) -> Option<(i32, TimeSync)> {
        let u = txunit as usize;
        if u >= self.txunits as usize || self.sessions[u] == 0 {
            return None;
        }
        let now = self.clock.now();
        let t = self.ticks(txunit, now);
        let pps_xtime = if self.state.borrow().pps && txunit == 0 && t >= sec(1) {
            xtime::make(txunit, self.sessions[u], t - t % sec(1))
        } else {
            0
        };
        Some((0, TimeSync { ustime: now, xtime: xtime::make(txunit, self.sessions[u], t), pps_xtime }))
    }

    fn set_session(&mut self, txunit: u8, session: u8) {
        if let Some(s) = self.sessions.get_mut(txunit as usize) {
            *s = session;
        }
    }

    fn poll_rx(&mut self, out: &mut Vec<RxFrame>) {
        let mut st = self.state.borrow_mut();
        while let Some(mut f) = st.rx.pop_front() {
            if f.xtime == 0 {
                f.xtime = xtime::make(0, self.sessions[0], self.ticks(0, self.clock.now()));
            }
            out.push(f);
        }
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stopped = true;
    }
}
