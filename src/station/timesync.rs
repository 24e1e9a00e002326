//! Host clock <-> concentrator <-> PPS <-> GPS time reconciliation.
//!
//! Every TX unit reports `(ustime, xtime, pps_xtime)` triples about every 2.1s.
//! Samples are gated by a quality quantile and by the observed MCU drift, the
//! unit 0 PPS latch feeds the GPS time reference.

use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::error::Error;
use super::rt::{ms, sec, Ustime};
use super::xtime;
use super::{MAX_TXUNITS, TX_MIN_GAP};

pub const TIMESYNC_RADIO_INTV:Ustime =  ms(2100);
pub const N_DRIFTS:usize =              20;
pub const N_QUALS:usize =               30;
pub const QUANT_PCT:usize =             90;
pub const SYNC_QUAL_GOOD:i32 =          100;
pub const MIN_DRIFT_THRES:i32 =         20;      /* 0.1ppm units: 2ppm */
pub const MAX_DRIFT_THRES:i32 =         1000;    /* 100ppm */
pub const DRIFT_WARN_EVERY:u32 =        3;
pub const DRIFT_RESET_AFTER:u32 =       6;
pub const MAX_PPS_ERROR:Ustime =        1000;
pub const PPS_WOBBLE:Ustime =           ms(100);
pub const NO_PPS_ALARM_INI:i64 =        10;      /* seconds */
pub const NO_PPS_ALARM_RATE:i64 =       2;
pub const NO_PPS_ALARM_MAX:i64 =        3600;
pub const XTICKS_ROLLOVER_LIMIT:i64 =   -ms(100);

/// One measurement: host time, concentrator time and the last PPS latch (0 if none).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeSync {
    pub ustime: Ustime,
    pub xtime: i64,
    pub pps_xtime: i64,
}

#[derive(Debug, Clone, Copy)]
struct UnitSync {
    last: Option<TimeSync>,
    session: u8,
    drifts: [i32; N_DRIFTS],
    drift_idx: usize,
    drift_thres: i32,
    excessive: u32,
    cycle_start: Ustime,
}

impl Default for UnitSync {
    fn default() -> Self {
        Self {
            last: None,
            session: 0,
            drifts: [0; N_DRIFTS],
            drift_idx: 0,
            drift_thres: MAX_DRIFT_THRES,
            excessive: 0,
            cycle_start: 0,
        }
    }
}

/* value at the QUANT_PCT quantile of the absolute samples */
fn quantile(samples: &[i32]) -> i32 {
    let mut v: Vec<i32> = samples.iter().map(|s| s.abs()).collect();
    v.sort_unstable();
    v[(v.len() * QUANT_PCT / 100).min(v.len() - 1)]
}

/// Drift of the concentrator against the host clock in 0.1ppm, positive if the concentrator runs fast.
pub fn drift_ppm10(dus: Ustime, dxc: i64) -> i32 {
    if dus <= 0 {
        return 0;
    }
    ((dxc - dus) as i128 * 10_000_000 / dus as i128) as i32
}

#[derive(Debug)]
pub struct Timesyncs {
    units: [UnitSync; MAX_TXUNITS],
    quals: [i32; N_QUALS],
    qual_idx: usize,
    qual_thres: i32,
    pps_mode: bool,
    pps_sync: Option<TimeSync>,
    pps_drifts: [i32; N_DRIFTS],
    pps_drift_idx: usize,
    pps_offset: Ustime,
    gps_offset: Option<Ustime>,
    utc_offset: Ustime,
    mcu_drift: i32,
    no_pps_thres: i64,
    wobble: Ustime,
    lns_sync_request: bool,
}

impl Timesyncs {
    pub fn new(pps_mode: bool) -> Self {
        Self {
            units: [UnitSync::default(); MAX_TXUNITS],
            quals: [0; N_QUALS],
            qual_idx: 0,
            qual_thres: i32::MAX,
            pps_mode,
            pps_sync: None,
            pps_drifts: [0; N_DRIFTS],
            pps_drift_idx: 0,
            pps_offset: -1,
            gps_offset: None,
            utc_offset: 0,
            mcu_drift: 0,
            no_pps_thres: NO_PPS_ALARM_INI,
            wobble: PPS_WOBBLE,
            lns_sync_request: false,
        }
    }

    /// Feeds one measurement of `txunit` and returns the delay until the next one.
    pub fn update(&mut self, txunit: u8, quality: i32, curr: TimeSync) -> Ustime {
        let u = txunit as usize;
        if u >= MAX_TXUNITS {
            return TIMESYNC_RADIO_INTV;
        }

        let q = quality.saturating_abs();
        self.quals[self.qual_idx] = q;
        self.qual_idx += 1;
        if self.qual_idx == N_QUALS {
            self.qual_idx = 0;
            self.qual_thres = quantile(&self.quals).max(SYNC_QUAL_GOOD);
            debug!("Time sync quality threshold: {}", self.qual_thres);
        }
        if q > self.qual_thres {
            debug!(txunit, quality, thres = self.qual_thres, "Time sync rejected - poor quality");
            return TIMESYNC_RADIO_INTV;
        }

        let last = match self.units[u].last {
            Some(l) if xtime::same_session(l.xtime, curr.xtime) => l,
            _ => {
                self.units[u].last = Some(curr);
                return TIMESYNC_RADIO_INTV;
            }
        };
        let dus = curr.ustime - last.ustime;
        let dxc = curr.xtime - last.xtime;
        if dxc <= 0 || dus < TIMESYNC_RADIO_INTV / 5 {
            debug!(txunit, dus, dxc, "Time sync rejected - bad spacing");
            return TIMESYNC_RADIO_INTV;
        }

        let drift = drift_ppm10(dus, dxc);
        let unit = &mut self.units[u];
        if drift.abs() > unit.drift_thres {
            unit.excessive += 1;
            if unit.excessive % DRIFT_WARN_EVERY == 0 {
                warn!("Excessive MCU/SX130X drift on txunit {}: {:.1}ppm (threshold {:.1}ppm, {} times)",
                      txunit, drift as f64 / 10.0, unit.drift_thres as f64 / 10.0, unit.excessive);
            }
            if unit.excessive % DRIFT_RESET_AFTER == 0 {
                unit.drift_thres = MAX_DRIFT_THRES;
            }
            return TIMESYNC_RADIO_INTV / 2;
        }

        if unit.drift_idx == 0 {
            unit.cycle_start = last.ustime;
        }
        unit.drifts[unit.drift_idx] = drift;
        unit.drift_idx += 1;
        if unit.drift_idx == N_DRIFTS {
            unit.drift_idx = 0;
            unit.drift_thres = quantile(&unit.drifts).clamp(MIN_DRIFT_THRES, MAX_DRIFT_THRES);
            let elapsed = curr.ustime - unit.cycle_start;
            if u == 0 {
                let mean = unit.drifts.iter().map(|d| *d as i64).sum::<i64>() / N_DRIFTS as i64;
                self.mcu_drift = mean as i32;
                /* host time fell behind the concentrator by the mean drift over the cycle */
                if self.pps_sync.is_none() {
                    self.utc_offset += mean * elapsed / 10_000_000;
                }
                info!("Mean MCU drift vs SX130X#0: {:.1}ppm", mean as f64 / 10.0);
            }
        }
        self.units[u].last = Some(curr);

        if u != 0 || !self.pps_mode {
            return TIMESYNC_RADIO_INTV;
        }
        self.update_pps(last, curr)
    }

    fn update_pps(&mut self, last: TimeSync, curr: TimeSync) -> Ustime {
        let prev = match self.pps_sync {
            Some(p) if xtime::same_session(p.xtime, curr.xtime) => p,
            _ => last,
        };
        if curr.pps_xtime == 0 || prev.pps_xtime == 0 {
            self.check_pps_absence(curr);
            return TIMESYNC_RADIO_INTV;
        }
        if curr.xtime - curr.pps_xtime > sec(1) + TX_MIN_GAP {
            debug!("PPS latch stale: {}us", curr.xtime - curr.pps_xtime);
            self.check_pps_absence(curr);
            return TIMESYNC_RADIO_INTV;
        }
        let dpps = curr.pps_xtime - prev.pps_xtime;
        let mut err = dpps.rem_euclid(sec(1));
        if err > sec(1) / 2 {
            err -= sec(1);
        }
        if err.abs() > MAX_PPS_ERROR {
            debug!("PPS latch noisy: {}us off a full second", err);
            self.check_pps_absence(curr);
            return TIMESYNC_RADIO_INTV;
        }

        let secs = (dpps + sec(1) / 2) / sec(1);
        if secs > 0 {
            self.pps_drifts[self.pps_drift_idx] = drift_ppm10(secs * sec(1), dpps);
            self.pps_drift_idx = (self.pps_drift_idx + 1) % N_DRIFTS;
        }
        if self.pps_sync.is_none() {
            info!("First PPS pulse acquired");
            self.lns_sync_request = true;
        }

        let pps_ustime = curr.ustime - (curr.xtime - curr.pps_xtime);
        let off = pps_ustime.rem_euclid(sec(1));
        let dus = (curr.ustime - last.ustime).max(0);
        let allow = self.units[0].drift_thres as i64 * dus / 10_000_000;
        if self.pps_offset < 0 || (off - self.pps_offset).abs() > allow {
            trace!("PPS offset {} -> {}", self.pps_offset, off);
            self.pps_offset = off;
        }

        /* a PPS edge is a full UTC second */
        let mut frac = (pps_ustime + self.utc_offset).rem_euclid(sec(1));
        if frac > sec(1) / 2 {
            frac -= sec(1);
        }
        self.utc_offset -= frac;

        if let (Some(g), Some(p)) = (self.gps_offset, self.pps_sync) {
            if xtime::same_session(p.xtime, curr.xtime) {
                let el = curr.pps_xtime - p.pps_xtime;
                self.gps_offset = Some(g + (el + sec(1) / 2) / sec(1) * sec(1));
            } else {
                self.gps_offset = None;
            }
        }
        self.pps_sync = Some(curr);
        self.no_pps_thres = NO_PPS_ALARM_INI;

        /* next sync in the middle between two PPS edges, alternating a bit around it */
        let target = curr.ustime + TIMESYNC_RADIO_INTV;
        let mut t = pps_ustime + (target - pps_ustime) / sec(1) * sec(1) + sec(1) / 2 + self.wobble;
        self.wobble = -self.wobble;
        while t <= curr.ustime + TIMESYNC_RADIO_INTV / 2 {
            t += sec(1);
        }
        t - curr.ustime
    }

    fn check_pps_absence(&mut self, curr: TimeSync) {
        let p = match self.pps_sync {
            Some(p) if xtime::same_session(p.xtime, curr.xtime) => p,
            _ => return,
        };
        let secs = (curr.xtime - p.pps_xtime) / sec(1);
        if secs > self.no_pps_thres {
            warn!("No PPS pulse for {} seconds", secs);
            self.no_pps_thres = (self.no_pps_thres * NO_PPS_ALARM_RATE).min(NO_PPS_ALARM_MAX);
        }
    }

    /// Picks a fresh non-zero session nonce for `txunit` and forgets its sync state.
    pub fn new_xtime_session(&mut self, txunit: u8) -> u8 {
        let u = (txunit as usize).min(MAX_TXUNITS - 1);
        let old = self.units[u].session;
        let mut rng = rand::rng();
        let mut s:u8 = rng.random_range(1..=255);
        while s == old {
            s = rng.random_range(1..=255);
        }
        let unit = &mut self.units[u];
        unit.session = s;
        unit.last = None;
        if u == 0 {
            self.pps_sync = None;
            self.gps_offset = None;
            self.pps_offset = -1;
        }
        debug!(txunit, session = s, "new xtime session");
        s
    }

    pub fn session(&self, txunit: u8) -> u8 {
        self.units.get(txunit as usize).map_or(0, |u| u.session)
    }

    pub fn has_sync(&self, txunit: u8) -> bool {
        self.units.get(txunit as usize).map_or(false, |u| u.last.is_some())
    }

    fn last(&self, txunit: u8) -> Result<TimeSync, Error> {
        self.units
            .get(txunit as usize)
            .and_then(|u| u.last)
            .ok_or(Error::NoTimesync(txunit))
    }

    pub fn ustime2xtime(&self, txunit: u8, ustime: Ustime) -> Result<i64, Error> {
        let l = self.last(txunit)?;
        Ok(l.xtime + (ustime - l.ustime))
    }

    /// Fails unless `x` carries the current session nonce of its TX unit.
    pub fn xtime2ustime(&self, x: i64) -> Result<Ustime, Error> {
        if !xtime::is_valid(x) {
            return Err(Error::InvalidXtime);
        }
        let l = self.last(xtime::txunit(x))?;
        if !xtime::same_session(x, l.xtime) {
            return Err(Error::StaleXtime(x));
        }
        Ok(l.ustime + (x - l.xtime))
    }

    pub fn xtime2xtime(&self, x: i64, dst_txunit: u8) -> Result<i64, Error> {
        if xtime::txunit(x) == dst_txunit {
            let l = self.last(dst_txunit)?;
            if !xtime::same_session(x, l.xtime) {
                return Err(Error::StaleXtime(x));
            }
            return Ok(x);
        }
        let us = self.xtime2ustime(x)?;
        self.ustime2xtime(dst_txunit, us)
    }

    pub fn gpstime2xtime(&self, txunit: u8, gpstime: Ustime) -> Result<i64, Error> {
        let (g, p) = match (self.gps_offset, self.pps_sync) {
            (Some(g), Some(p)) => (g, p),
            _ => return Err(Error::NoGpsTime),
        };
        let x0 = gpstime - g + p.pps_xtime;
        self.xtime2xtime(x0, txunit)
    }

    pub fn xtime2gpstime(&self, x: i64) -> Result<Ustime, Error> {
        let (g, p) = match (self.gps_offset, self.pps_sync) {
            (Some(g), Some(p)) => (g, p),
            _ => return Err(Error::NoGpsTime),
        };
        let x0 = self.xtime2xtime(x, 0)?;
        if !xtime::same_session(x0, p.pps_xtime) {
            return Err(Error::StaleXtime(x));
        }
        Ok(x0 - p.pps_xtime + g)
    }

    /// Anchors GPS time: `gpstime` was valid at host time `ustime`.
    /// With PPS the value snaps to the nearest PPS edge, otherwise the sample is taken as is.
    pub fn set_gps_time(&mut self, ustime: Ustime, gpstime: Ustime) -> Result<(), Error> {
        if gpstime <= 0 {
            return Err(Error::NoGpsTime);
        }
        match self.pps_sync {
            Some(p) if self.pps_mode => {
                let pps_us = self.xtime2ustime(p.pps_xtime)?;
                let at_pps = gpstime - (ustime - pps_us);
                let g = (at_pps + sec(1) / 2).div_euclid(sec(1)) * sec(1);
                if self.gps_offset != Some(g) {
                    info!("GPS time reference at PPS: {}s", g / sec(1));
                }
                self.gps_offset = Some(g);
                Ok(())
            }
            None if self.pps_mode => Err(Error::NoGpsTime),
            _ => {
                let x = self.ustime2xtime(0, ustime)?;
                self.pps_sync = Some(TimeSync { ustime, xtime: x, pps_xtime: x });
                self.gps_offset = Some(gpstime);
                Ok(())
            }
        }
    }

    /// Set once when the first PPS pulse arrives, the server time sync picks it up.
    pub fn take_lns_sync_request(&mut self) -> bool {
        std::mem::take(&mut self.lns_sync_request)
    }

    pub fn excessive_drift_count(&self, txunit: u8) -> u32 {
        self.units.get(txunit as usize).map_or(0, |u| u.excessive)
    }

    pub fn drift_threshold(&self, txunit: u8) -> i32 {
        self.units.get(txunit as usize).map_or(MAX_DRIFT_THRES, |u| u.drift_thres)
    }

    pub fn quality_threshold(&self) -> i32 {
        self.qual_thres
    }

    pub fn mcu_drift(&self) -> i32 {
        self.mcu_drift
    }

    pub fn pps_offset(&self) -> Ustime {
        self.pps_offset
    }

    pub fn has_pps(&self) -> bool {
        self.pps_sync.is_some()
    }

    pub fn has_gps_time(&self) -> bool {
        self.gps_offset.is_some() && self.pps_sync.is_some()
    }

    pub fn set_utc_offset(&mut self, off: Ustime) {
        self.utc_offset = off;
    }

    pub fn utc_offset(&self) -> Ustime {
        self.utc_offset
    }

    pub fn ustime2utc(&self, ustime: Ustime) -> Ustime {
        ustime + self.utc_offset
    }
}

/// Recovers a full xtime from a 32 bit tick counter relative to a recent xtime.
pub fn xticks2xtime(xticks: u32, last_xtime: i64) -> Result<i64, Error> {
    let d = xticks.wrapping_sub(xtime::ticks(last_xtime) as u32) as i32 as i64;
    if d < XTICKS_ROLLOVER_LIMIT {
        return Err(Error::XticksRollover(d));
    }
    Ok(last_xtime + d)
}
