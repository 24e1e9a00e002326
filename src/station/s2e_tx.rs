//! Downlink submission and the per TX unit scheduler.
//!
//! Each unit keeps its jobs sorted by txtime in its queue and owns one timer.
//! The timer fires `aim_gap` ahead of the head job; a head that is already on
//! air is checked again once its air time has passed.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::error::Error;
use super::eui::{eui_serde, fmt_eui, hex_serde};
use super::lora;
use super::radio::{TxReq, TxResult, TxStatus};
use super::region::{eu868_band, EU868_BAND_RATES, REGION_EU868};
use super::rps::{airtime, Rps, BCN_PREAMBLE, DFLT_PREAMBLE};
use super::rt::{sec, Ustime};
use super::s2e::{S2ctx, BCN_INTV, BCN_NOPOS, BCN_NOTIME};
use super::txq::{TxIdx, TxJob, TXFLAG_BCN, TXFLAG_CLSA, TXFLAG_CLSC, TXFLAG_PING, TXFLAG_TXCHECKED, TXFLAG_TXING};
use super::xtime;
use super::{Env, TimerKind, CCA_BACKOFF, CLASS_C_BACKOFF_BY, CLASS_C_BACKOFF_MAX, MAX_DNCHNLS,
            MAX_TXFRAME_LEN, MAX_TXUNITS, PRIO_PENALTY_ALTANTENNA, PRIO_PENALTY_ALTTXTIME, PRIO_PENALTY_CCA,
            TXCHECK_FUDGE};

pub const DC_CLASS_A:u8 = 0;
pub const DC_CLASS_B:u8 = 1;
pub const DC_CLASS_C:u8 = 2;

const RX2_DELAY:Ustime = sec(1);

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DnMsg {
    #[serde(rename = "DevEui", alias = "DevEUI", with = "eui_serde")]
    deveui: u64,
    #[serde(rename = "dC")]
    dclass: u8,
    diid: i64,
    #[serde(with = "hex_serde")]
    pdu: Vec<u8>,
    #[serde(rename = "RxDelay")]
    rxdelay: u8,
    #[serde(rename = "RX1DR")]
    rx1dr: Option<u8>,
    #[serde(rename = "RX1Freq")]
    rx1freq: Option<u32>,
    #[serde(rename = "RX2DR")]
    rx2dr: Option<u8>,
    #[serde(rename = "RX2Freq")]
    rx2freq: Option<u32>,
    priority: u8,
    xtime: i64,
    rctx: i64,
    gpstime: i64,
    #[serde(rename = "DR")]
    dr: Option<u8>,
    #[serde(rename = "Freq")]
    freq: Option<u32>,
    addcrc: Option<bool>,
    preamble: Option<u16>,
    #[serde(rename = "altAnts")]
    alt_ants: u8,
}

/* what a submission resolved to before it goes through the common checks */
struct DnPlan {
    txunit: u8,
    txtime: Ustime,
    freq: u32,
    dr: u8,
    rx2: Option<(u32, u8)>,
    flags: u8,
    addcrc: bool,
    preamble: u16,
}

impl S2ctx {
    fn dr2rps(&self, dr: u8) -> Rps {
        self.dr_defs.get(dr as usize).copied().unwrap_or(Rps::ILLEGAL)
    }

    fn dnchnl(&self, freq: u32) -> u8 {
        self.dn_chnls.iter().position(|f| *f == freq).unwrap_or(MAX_DNCHNLS) as u8
    }

    fn pick_txpow(&self, freq: u32) -> i16 {
        match self.txpow2 {
            Some((lo, hi, p)) if lo <= freq && freq <= hi => p,
            _ => self.txpow,
        }
    }

    fn report_fail(&mut self, j: &TxJob, reason: &str) {
        if j.has(TXFLAG_BCN) {
            warn!("Beacon dropped: {}", reason);
            return;
        }
        warn!("TX {} diid={} dropped: {}", fmt_eui(j.deveui), j.diid, reason);
        self.send_json(json!({
            "msgtype": "dnfail",
            "diid": j.diid,
            "DevEui": fmt_eui(j.deveui),
            "rctx": j.rctx,
            "error": reason,
        }));
    }

    fn report_txed(&mut self, j: &TxJob, env: &Env) {
        if j.has(TXFLAG_BCN) {
            return;
        }
        let txtime = env.ts.ustime2utc(j.txtime) as f64 / 1e6;
        let gpstime = env.ts.xtime2gpstime(j.xtime).unwrap_or(0);
        self.send_json(json!({
            "msgtype": "dntxed",
            "diid": j.diid,
            "DevEui": fmt_eui(j.deveui),
            "rctx": j.rctx,
            "xtime": j.xtime,
            "txtime": txtime,
            "gpstime": gpstime,
        }));
    }

    pub fn handle_dnmsg(&mut self, v: &Value, env: &mut Env) {
        let m = match DnMsg::deserialize(v) {
            Ok(m) => m,
            Err(e) => {
                error!(e=?e, "ERROR: bad dnmsg");
                return;
            }
        };
        let plan = match self.plan_dnmsg(&m, env) {
            Ok(p) => p,
            Err(e) => {
                let j = TxJob { deveui: m.deveui, diid: m.diid, rctx: m.rctx, ..TxJob::default() };
                self.report_fail(&j, &e.to_string());
                return;
            }
        };
        self.submit(&m, plan, env);
    }

    fn plan_dnmsg(&self, m: &DnMsg, env: &Env) -> Result<DnPlan, Error> {
        let rxdelay = sec(m.rxdelay.max(1) as i64);
        let addcrc = m.addcrc.unwrap_or(false);
        let preamble = m.preamble.unwrap_or(DFLT_PREAMBLE);
        let rx2 = match (m.rx2freq, m.rx2dr) {
            (Some(f), Some(d)) => Some((f, d)),
            _ => None,
        };
        match m.dclass {
            DC_CLASS_A => {
                let txunit = xtime::txunit(m.xtime);
                let rxtime = env.ts.xtime2ustime(m.xtime)?;
                match (m.rx1freq, m.rx1dr, rx2) {
                    (Some(f), Some(d), _) => Ok(DnPlan {
                        txunit, txtime: rxtime + rxdelay, freq: f, dr: d, rx2,
                        flags: TXFLAG_CLSA, addcrc, preamble,
                    }),
                    (_, _, Some((f, d))) => Ok(DnPlan {
                        txunit, txtime: rxtime + rxdelay + RX2_DELAY, freq: f, dr: d, rx2: None,
                        flags: TXFLAG_CLSA, addcrc, preamble,
                    }),
                    _ => Err(Error::Downlink("class A without RX1/RX2 parameters".into())),
                }
            }
            DC_CLASS_B => {
                let txunit = xtime::rctx_txunit(m.rctx);
                let x = env.ts.gpstime2xtime(txunit, m.gpstime)?;
                let (f, d) = match (m.freq, m.dr) {
                    (Some(f), Some(d)) => (f, d),
                    _ => return Err(Error::Downlink("ping slot without Freq/DR".into())),
                };
                Ok(DnPlan {
                    txunit, txtime: env.ts.xtime2ustime(x)?, freq: f, dr: d, rx2: None,
                    flags: TXFLAG_PING, addcrc, preamble,
                })
            }
            DC_CLASS_C => {
                let (f, d) = rx2.ok_or_else(|| Error::Downlink("class C without RX2 parameters".into()))?;
                let (txunit, txtime) = if m.xtime != 0 {
                    (xtime::txunit(m.xtime), env.ts.xtime2ustime(m.xtime)? + rxdelay)
                } else {
                    (xtime::rctx_txunit(m.rctx), env.now + 2 * self.conf.timing.aim_gap)
                };
                Ok(DnPlan { txunit, txtime, freq: f, dr: d, rx2: None, flags: TXFLAG_CLSC, addcrc, preamble })
            }
            c => Err(Error::Downlink(format!("unknown device class {}", c))),
        }
    }

    /// `dnframe`: absolute frequency, DR and time given by xtime or gpstime.
    pub fn handle_dnframe(&mut self, v: &Value, env: &mut Env) {
        let m = match DnMsg::deserialize(v) {
            Ok(m) => m,
            Err(e) => {
                error!(e=?e, "ERROR: bad dnframe");
                return;
            }
        };
        match self.plan_dnframe(&m, env) {
            Ok(p) => self.submit(&m, p, env),
            Err(e) => {
                let j = TxJob { deveui: m.deveui, diid: m.diid, rctx: m.rctx, ..TxJob::default() };
                self.report_fail(&j, &e.to_string());
            }
        }
    }

    fn plan_dnframe(&self, m: &DnMsg, env: &Env) -> Result<DnPlan, Error> {
        let (f, d) = match (m.freq, m.dr) {
            (Some(f), Some(d)) => (f, d),
            _ => return Err(Error::Downlink("dnframe without Freq/DR".into())),
        };
        let (txunit, txtime) = if m.xtime != 0 {
            (xtime::txunit(m.xtime), env.ts.xtime2ustime(m.xtime)?)
        } else if m.gpstime != 0 {
            let u = xtime::rctx_txunit(m.rctx);
            (u, env.ts.xtime2ustime(env.ts.gpstime2xtime(u, m.gpstime)?)?)
        } else {
            return Err(Error::Downlink("dnframe without xtime/gpstime".into()));
        };
        Ok(DnPlan {
            txunit, txtime, freq: f, dr: d, rx2: None, flags: 0,
            addcrc: m.addcrc.unwrap_or(false), preamble: m.preamble.unwrap_or(DFLT_PREAMBLE),
        })
    }

    /// `dnsched`: a batch of dnframe like entries under `schedule`.
    pub fn handle_dnsched(&mut self, v: &Value, env: &mut Env) {
        let entries = match v.get("schedule").and_then(Value::as_array) {
            Some(a) => a.clone(),
            None => {
                error!("ERROR: dnsched without schedule");
                return;
            }
        };
        for e in &entries {
            self.handle_dnframe(e, env);
        }
    }

    /* common checks, reservation and queueing */
    fn submit(&mut self, m: &DnMsg, p: DnPlan, env: &mut Env) {
        let proto = TxJob { deveui: m.deveui, diid: m.diid, rctx: m.rctx, ..TxJob::default() };
        let res = self.enqueue(&m.pdu, p, &proto, m.priority, m.alt_ants, env);
        if let Err(e) = res {
            self.report_fail(&proto, &e.to_string());
        }
    }

    fn enqueue(&mut self, pdu: &[u8], p: DnPlan, proto: &TxJob, prio: u8, alt_ants: u8, env: &mut Env) -> Result<TxIdx, Error> {
        if (p.txunit as usize) >= MAX_TXUNITS.min(env.radio.txunits() as usize) {
            return Err(Error::Downlink(format!("no such txunit {}", p.txunit)));
        }
        if p.freq < self.min_freq || p.freq > self.max_freq {
            return Err(Error::Downlink(format!("frequency {} out of range", p.freq)));
        }
        let rps = self.dr2rps(p.dr);
        if rps.is_illegal() {
            return Err(Error::Downlink(format!("DR{} not available", p.dr)));
        }
        if pdu.len() > MAX_TXFRAME_LEN {
            return Err(Error::Downlink(format!("frame too long ({} bytes)", pdu.len())));
        }
        if p.txtime - env.now > self.conf.timing.max_ahead {
            return Err(Error::Downlink("too far in future".into()));
        }
        let xt = env.ts.ustime2xtime(p.txunit, p.txtime)?;

        let idx = self.txq.reserve_job().ok_or(Error::TxqFull)?;
        let buf = self.txq.reserve_data(pdu.len()).ok_or(Error::TxDataFull(pdu.len()))?;
        buf.copy_from_slice(pdu);
        let dnchnl = self.dnchnl(p.freq);
        let (rx2freq, rx2dr) = p.rx2.unwrap_or((0, 0));
        let dnchnl2 = if rx2freq != 0 { self.dnchnl(rx2freq) } else { MAX_DNCHNLS as u8 };
        let txpow = self.pick_txpow(p.freq);
        if let Some(j) = self.txq.get_mut(idx) {
            *j = TxJob {
                deveui: proto.deveui,
                diid: proto.diid,
                rctx: proto.rctx,
                txtime: p.txtime,
                xtime: xt,
                airtime: airtime(rps, pdu.len(), p.addcrc, p.preamble),
                preamble: p.preamble,
                freq: p.freq,
                rps,
                dr: p.dr,
                txpow,
                alt_ants: alt_ants & !(1 << p.txunit),
                addcrc: p.addcrc,
                rx2freq,
                rx2dr,
                txunit: p.txunit,
                prio,
                txflags: p.flags,
                dnchnl,
                dnchnl2,
                next: j.next,
                len: pdu.len() as u16,
                ..TxJob::default()
            };
        }
        self.txq.commit_job(idx)?;
        let u = p.txunit as usize;
        let mut head = self.txunits[u].head;
        self.txq.insert(&mut head, idx);
        self.txunits[u].head = head;
        debug!(txunit = p.txunit, diid = proto.diid, txtime = p.txtime, "TX job queued");
        self.arm_txunit(p.txunit, env);
        Ok(idx)
    }

    /// Points the unit timer at whatever the queue head needs next.
    pub fn arm_txunit(&mut self, txunit: u8, env: &mut Env) {
        let key = TimerKind::TxUnit(txunit);
        let head = self.txunits[txunit as usize].head;
        match self.txq.head_of(head).and_then(|i| self.txq.get(i)) {
            None => {
                env.timers.clear(key);
            }
            Some(j) if j.has(TXFLAG_TXING) => {
                env.timers.set(key, j.txtime + j.airtime);
            }
            Some(j) => {
                env.timers.set(key, j.txtime - self.conf.timing.aim_gap);
            }
        }
    }

    fn unqueue(&mut self, txunit: u8, idx: TxIdx) {
        let u = txunit as usize;
        let mut head = self.txunits[u].head;
        self.txq.unqueue(&mut head, idx);
        self.txunits[u].head = head;
    }

    fn requeue(&mut self, txunit: u8, idx: TxIdx) {
        let u = txunit as usize;
        let mut head = self.txunits[u].head;
        self.txq.insert(&mut head, idx);
        self.txunits[u].head = head;
    }

    fn drop_job(&mut self, idx: TxIdx, reason: &str) {
        if let Some(j) = self.txq.get(idx).copied() {
            self.report_fail(&j, reason);
        }
        self.txq.free_job(idx);
    }

    /// Tries to move an unqueued job to another time slot or antenna.
    /// The job is requeued on success and dropped otherwise.
    fn try_alternative(&mut self, idx: TxIdx, late: bool, reason: &str, env: &mut Env) {
        let mut j = match self.txq.get(idx).copied() {
            Some(j) => j,
            None => return,
        };
        let u0 = j.txunit;

        if !late && j.alt_ants != 0 {
            let nunits = (env.radio.txunits() as usize).min(MAX_TXUNITS) as u8;
            if let Some(u) = (0..nunits).find(|u| j.alt_ants & (1 << u) != 0) {
                j.alt_ants &= !(1 << u);
                if let Ok(x) = env.ts.ustime2xtime(u, j.txtime) {
                    j.txunit = u;
                    j.xtime = x;
                    j.prio = j.prio.saturating_sub(PRIO_PENALTY_ALTANTENNA);
                    if let Some(jj) = self.txq.get_mut(idx) {
                        *jj = j;
                    }
                    debug!(diid = j.diid, "TX {} -> alternate antenna txunit {}", reason, u);
                    self.requeue(u, idx);
                    self.arm_txunit(u, env);
                    return;
                }
            }
        }

        if j.has(TXFLAG_CLSA) && j.rx2freq != 0 {
            let rps = self.dr2rps(j.rx2dr);
            let txtime = j.txtime + RX2_DELAY;
            if let (false, Ok(x)) = (rps.is_illegal(), env.ts.ustime2xtime(u0, txtime)) {
                j.txtime = txtime;
                j.xtime = x;
                j.freq = j.rx2freq;
                j.dr = j.rx2dr;
                j.rps = rps;
                j.dnchnl = j.dnchnl2;
                j.txpow = self.pick_txpow(j.freq);
                j.airtime = airtime(rps, j.len as usize, j.addcrc, j.preamble);
                j.rx2freq = 0;
                j.prio = j.prio.saturating_sub(PRIO_PENALTY_ALTTXTIME);
                if let Some(jj) = self.txq.get_mut(idx) {
                    *jj = j;
                }
                debug!(diid = j.diid, "TX {} -> trying RX2", reason);
                self.requeue(u0, idx);
                return;
            }
        }

        if j.has(TXFLAG_CLSC) && j.retries < CLASS_C_BACKOFF_MAX {
            let txtime = j.txtime.max(env.now + self.conf.timing.aim_gap) + CLASS_C_BACKOFF_BY;
            if let Ok(x) = env.ts.ustime2xtime(u0, txtime) {
                j.txtime = txtime;
                j.xtime = x;
                j.retries += 1;
                j.prio = j.prio.saturating_sub(PRIO_PENALTY_ALTTXTIME);
                if let Some(jj) = self.txq.get_mut(idx) {
                    *jj = j;
                }
                debug!(diid = j.diid, "TX {} -> class C back-off #{}", reason, j.retries);
                self.requeue(u0, idx);
                return;
            }
        }

        self.drop_job(idx, reason);
    }

    /* duty cycle: earliest time the job's band and channel are free again */
    fn dc_blocked_until(&self, j: &TxJob) -> Option<Ustime> {
        let tu = &self.txunits[j.txunit as usize];
        let mut until = 0;
        if self.region == REGION_EU868 {
            until = until.max(tu.dc_eu868bands[eu868_band(j.freq)]);
        }
        if self.dc_chnl_rate > 0 {
            until = until.max(tu.dc_per_chnl[(j.dnchnl as usize).min(MAX_DNCHNLS)]);
        }
        if j.txtime < until {
            Some(until)
        } else {
            None
        }
    }

    fn dc_update(&mut self, j: &TxJob) {
        let region = self.region;
        let rate = self.dc_chnl_rate as i64;
        let tu = &mut self.txunits[j.txunit as usize];
        if region == REGION_EU868 {
            let b = eu868_band(j.freq);
            tu.dc_eu868bands[b] = j.txtime + j.airtime * EU868_BAND_RATES[b] as i64;
        }
        if rate > 0 {
            tu.dc_per_chnl[(j.dnchnl as usize).min(MAX_DNCHNLS)] = j.txtime + j.airtime * rate;
        }
    }

    /// Timer callback of one TX unit.
    pub fn on_txunit_timer(&mut self, txunit: u8, env: &mut Env) {
        let u = txunit as usize;
        if u >= MAX_TXUNITS {
            return;
        }
        loop {
            let idx = match self.txq.head_of(self.txunits[u].head) {
                Some(i) => i,
                None => break,
            };
            let j = match self.txq.get(idx).copied() {
                Some(j) => j,
                None => break,
            };

            if j.has(TXFLAG_TXING) {
                let end = j.txtime + j.airtime;
                match env.radio.tx_status(txunit) {
                    TxStatus::Idle => {
                        info!("TX done txunit={} diid={} {:.3}MHz {}", txunit, j.diid, j.freq as f64 / 1e6, j.rps);
                        self.unqueue(txunit, idx);
                        self.report_txed(&j, env);
                        self.txq.free_job(idx);
                        continue;
                    }
                    TxStatus::Emitting | TxStatus::Scheduled if env.now < end => {
                        env.timers.set(TimerKind::TxUnit(txunit), end);
                        return;
                    }
                    TxStatus::Emitting => {
                        env.timers.set(TimerKind::TxUnit(txunit), env.now + TXCHECK_FUDGE);
                        return;
                    }
                    TxStatus::Scheduled if env.now < end + TXCHECK_FUDGE => {
                        env.timers.set(TimerKind::TxUnit(txunit), end + TXCHECK_FUDGE);
                        return;
                    }
                    TxStatus::Scheduled => {
                        error!("ERROR: txunit {} did not emit diid={}", txunit, j.diid);
                        env.radio.tx_abort(txunit);
                        self.unqueue(txunit, idx);
                        self.drop_job(idx, "radio did not emit");
                        continue;
                    }
                }
            }

            if env.now < j.txtime - self.conf.timing.aim_gap {
                break;
            }
            if env.now > j.txtime - self.conf.timing.min_gap {
                self.unqueue(txunit, idx);
                self.try_alternative(idx, true, "too late", env);
                continue;
            }

            /* resolve air time overlaps with the following jobs by priority */
            let mut lost = false;
            while let Some(nidx) = self.txq.next_in_queue(idx) {
                let n = match self.txq.get(nidx).copied() {
                    Some(n) => n,
                    None => break,
                };
                if n.txtime >= j.txtime + j.airtime + self.conf.timing.min_gap {
                    break;
                }
                if n.prio > j.prio {
                    self.unqueue(txunit, idx);
                    self.try_alternative(idx, false, "air time collision", env);
                    lost = true;
                    break;
                }
                self.unqueue(txunit, nidx);
                self.try_alternative(nidx, false, "air time collision", env);
            }
            if lost {
                continue;
            }

            if self.dwellen && self.max_dwell > 0 && j.airtime > self.max_dwell {
                self.unqueue(txunit, idx);
                self.drop_job(idx, "dwell time exceeded");
                continue;
            }
            if self.dcen && !j.has(TXFLAG_BCN) {
                if let Some(until) = self.dc_blocked_until(&j) {
                    debug!(txunit, diid = j.diid, until, "duty cycle blocked");
                    self.unqueue(txunit, idx);
                    self.try_alternative(idx, false, "duty cycle", env);
                    continue;
                }
            }

            let res = {
                let req = TxReq {
                    txunit,
                    xtime: j.xtime,
                    freq: j.freq,
                    rps: j.rps,
                    txpow: j.txpow,
                    preamble: j.preamble,
                    addcrc: j.addcrc,
                    nocca: !self.ccaen,
                    airtime: j.airtime,
                    data: self.txq.data(idx),
                };
                env.radio.tx(&req)
            };
            match res {
                TxResult::Ok => {
                    if let Some(jj) = self.txq.get_mut(idx) {
                        jj.txflags |= TXFLAG_TXING | TXFLAG_TXCHECKED;
                    }
                    if self.dcen && !j.has(TXFLAG_BCN) {
                        self.dc_update(&j);
                    }
                    debug!(txunit, diid = j.diid, "TX handed to radio");
                    break;
                }
                TxResult::NoCa => {
                    self.unqueue(txunit, idx);
                    if j.retries >= CLASS_C_BACKOFF_MAX {
                        self.drop_job(idx, "channel busy");
                        continue;
                    }
                    match env.ts.ustime2xtime(txunit, j.txtime + CCA_BACKOFF) {
                        Ok(x) => {
                            if let Some(jj) = self.txq.get_mut(idx) {
                                jj.txtime += CCA_BACKOFF;
                                jj.xtime = x;
                                jj.retries += 1;
                                jj.prio = jj.prio.saturating_sub(PRIO_PENALTY_CCA);
                            }
                            debug!(txunit, diid = j.diid, "CCA busy - retrying later");
                            self.requeue(txunit, idx);
                        }
                        Err(e) => self.drop_job(idx, &e.to_string()),
                    }
                }
                TxResult::Fail => {
                    self.unqueue(txunit, idx);
                    self.drop_job(idx, "radio refused frame");
                }
            }
        }
        self.arm_txunit(txunit, env);
    }

    /// Cancels the emission of `txunit` and drops all its pending jobs.
    pub fn abort_txunit(&mut self, txunit: u8, env: &mut Env) {
        let u = txunit as usize;
        if u >= MAX_TXUNITS {
            return;
        }
        let mut aborted = false;
        while let Some(idx) = self.txq.head_of(self.txunits[u].head) {
            if !aborted && self.txq.get(idx).map_or(false, |j| j.has(TXFLAG_TXING)) {
                env.radio.tx_abort(txunit);
                aborted = true;
            }
            self.unqueue(txunit, idx);
            self.drop_job(idx, "aborted");
        }
        env.timers.clear(TimerKind::TxUnit(txunit));
    }

    /// Beacon timer: queues the next beacon at the following 128s GPS boundary.
    pub fn on_beacon_timer(&mut self, env: &mut Env) {
        let bcn = match &self.bcn {
            Some(b) => b.clone(),
            None => return,
        };
        let mut ctrl = bcn.ctrl;
        let pos = self.conf.gps_position;
        let gps_now = env.ts.ustime2xtime(0, env.now).and_then(|x| env.ts.xtime2gpstime(x));
        let gps_now = match (gps_now, pos) {
            (Ok(g), Some(_)) => {
                ctrl &= !(BCN_NOTIME | BCN_NOPOS);
                g
            }
            (g, _) => {
                if g.is_err() && ctrl & BCN_NOTIME == 0 {
                    warn!("Beaconing suspended - no GPS time");
                    ctrl |= BCN_NOTIME;
                }
                if pos.is_none() && ctrl & BCN_NOPOS == 0 {
                    warn!("Beaconing suspended - no position");
                    ctrl |= BCN_NOPOS;
                }
                if let Some(b) = self.bcn.as_mut() {
                    b.ctrl = ctrl;
                }
                env.timers.set(TimerKind::Beacon, env.now + sec(10));
                return;
            }
        };
        if let Some(b) = self.bcn.as_mut() {
            if b.ctrl != 0 {
                info!("Beaconing resumed");
            }
            b.ctrl = ctrl;
        }
        let (lat, lon) = pos.unwrap_or((0.0, 0.0));

        let mut next = (gps_now / BCN_INTV + 1) * BCN_INTV;
        if next - gps_now < 4 * self.conf.timing.aim_gap {
            next += BCN_INTV;
        }
        let slot = (next / BCN_INTV) as usize;
        let freq = bcn.freqs[slot % bcn.freqs.len()];
        let mut pdu = [0u8; 32];
        let total = (bcn.layout[2] as usize).min(pdu.len());
        let epoch = (next / 1_000_000) as u32;
        let plan = env.ts.gpstime2xtime(0, next).and_then(|x| {
            let txtime = env.ts.xtime2ustime(x)?;
            lora::make_beacon(&bcn.layout, epoch, 0, lat, lon, &mut pdu)?;
            Ok(txtime)
        });
        match plan {
            Ok(txtime) => {
                let p = DnPlan {
                    txunit: 0, txtime, freq, dr: bcn.dr, rx2: None,
                    flags: TXFLAG_BCN, addcrc: false, preamble: BCN_PREAMBLE,
                };
                let proto = TxJob::default();
                if let Err(e) = self.enqueue(&pdu[..total], p, &proto, 255, 0, env) {
                    error!(e=?e, "ERROR: beacon not queued");
                }
                env.timers.set(TimerKind::Beacon, txtime + sec(1));
            }
            Err(e) => {
                error!(e=?e, "ERROR: beacon construction failed");
                env.timers.set(TimerKind::Beacon, env.now + sec(10));
            }
        }
    }
}
