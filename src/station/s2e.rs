//! Station-to-engine protocol: one context per MUXS session.
//!
//! Holds the channel plan delivered by `router_config`, the TX/RX arenas and the
//! per TX unit scheduling state. Incoming JSON is dispatched by `msgtype`,
//! uplinks and reports are queued and flushed whenever the socket has room.

use std::collections::VecDeque;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::error::Error;
use super::eui::eui_serde;
use super::lnssync::LnsSync;
use super::lora;
use super::radio::RxFrame;
use super::region::{self, DC_NUM_BANDS};
use super::rps::{up_airtime, Rps};
use super::rt::{sec, Ustime};
use super::rxq::Rxq;
use super::txq::{TxLink, Txq};
use super::{Env, TimerKind, DR_CNT, MAX_DNCHNLS, MAX_TXUNITS, TX_AIM_GAP, TX_MAX_AHEAD, TX_MIN_GAP};

pub const S2E_PROTOCOL:u32 =    2;
pub const MAX_RMTSH:u8 =        4;

/* beacon state flags */
pub const BCN_NOTIME:u8 =       0x01;
pub const BCN_NOPOS:u8 =        0x02;
pub const BCN_INTV:Ustime =     sec(128);


/// Downlink timing knobs. Developer overrides may shrink or widen them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxTiming {
    pub aim_gap: Ustime,
    pub min_gap: Ustime,
    pub max_ahead: Ustime,
}

impl Default for TxTiming {
    fn default() -> Self {
        Self {
            aim_gap: TX_AIM_GAP,
            min_gap: TX_MIN_GAP,
            max_ahead: TX_MAX_AHEAD,
        }
    }
}

/// Identification sent in the `version` message.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub station: String,
    pub firmware: String,
    pub package: String,
    pub model: String,
    pub features: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            station: env!("CARGO_PKG_VERSION").to_string(),
            firmware: String::new(),
            package: String::new(),
            model: "linux".to_string(),
            features: "rmtsh".to_string(),
        }
    }
}

/// Process wide settings copied into every session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct S2Conf {
    pub timing: TxTiming,
    pub nocca: bool,
    pub nodc: bool,
    pub nodwell: bool,
    pub gps_position: Option<(f64, f64)>,
    pub version: VersionInfo,
}

#[derive(Debug, Clone)]
pub struct S2TxUnit {
    pub head: TxLink,
    pub dc_eu868bands: [Ustime; DC_NUM_BANDS],
    pub dc_per_chnl: [Ustime; MAX_DNCHNLS + 1],
}

impl Default for S2TxUnit {
    fn default() -> Self {
        Self {
            head: TxLink::Nil,
            dc_eu868bands: [0; DC_NUM_BANDS],
            dc_per_chnl: [0; MAX_DNCHNLS + 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BcnInfo {
    pub dr: u8,
    pub layout: [u8; 3],
    pub freqs: Vec<u32>,
    pub ctrl: u8,
}

/// Outgoing side of the session transport.
pub trait MsgSink {
    /// True if a message of `minsize` bytes fits into the send buffer right now.
    fn has_sendbuf(&self, minsize: usize) -> bool;
    fn send_text(&mut self, text: &str) -> bool;
    fn send_binary(&mut self, data: &[u8]) -> bool;
}

/// Receiver of remote shell and command messages.
pub trait CmdHandler {
    fn runcmd(&mut self, msg: &Value);
    fn rmtsh(&mut self, msg: &Value);
    fn rmtsh_data(&mut self, session: u8, data: &[u8]);
}


#[derive(Debug, Deserialize)]
struct Eui(#[serde(with = "eui_serde")] u64);

#[derive(Debug, Deserialize, PartialEq)]
struct BcnConf {
    #[serde(rename = "DR")]
    dr: u8,
    layout: [u8; 3],
    freqs: Vec<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RouterConfig {
    region: Option<String>,
    #[serde(rename = "DRs")]
    drs: Vec<(i32, i32, i32)>,
    freq_range: Option<(u32, u32)>,
    max_eirp: Option<f64>,
    #[serde(rename = "NetID")]
    netid: Option<Vec<u32>>,
    #[serde(rename = "JoinEui")]
    joineui: Option<Vec<(Eui, Eui)>>,
    nocca: bool,
    nodc: bool,
    nodwell: bool,
    bcning: Option<BcnConf>,
    upchannels: Vec<(u32, u8, u8)>,
    #[serde(alias = "sx1301_conf")]
    sx130x_conf: Value,
    hwspec: Option<String>,
}

pub struct S2ctx {
    pub conf: S2Conf,
    pub region: u8,
    pub region_name: String,
    pub dr_defs: [Rps; DR_CNT],
    pub min_freq: u32,
    pub max_freq: u32,
    pub dn_chnls: Vec<u32>,
    pub txpow: i16,
    pub txpow2: Option<(u32, u32, i16)>,
    pub dc_chnl_rate: u32,
    pub ccaen: bool,
    pub dcen: bool,
    pub dwellen: bool,
    pub max_dwell: Ustime,
    pub txunits: [S2TxUnit; MAX_TXUNITS],
    pub bcn: Option<BcnInfo>,
    pub muxtime: f64,
    pub reftime: Ustime,
    pub txq: Txq,
    pub rxq: Rxq,
    pub lns: LnsSync,
    pub configured: bool,
    outq: VecDeque<String>,
    cmd: Option<Box<dyn CmdHandler>>,
}

impl S2ctx {
    pub fn new(conf: S2Conf) -> Self {
        Self {
            conf,
            region: 0,
            region_name: String::new(),
            dr_defs: [Rps::ILLEGAL; DR_CNT],
            min_freq: 0,
            max_freq: 0,
            dn_chnls: Vec::new(),
            txpow: 0,
            txpow2: None,
            dc_chnl_rate: 0,
            ccaen: false,
            dcen: false,
            dwellen: false,
            max_dwell: 0,
            txunits: Default::default(),
            bcn: None,
            muxtime: 0.0,
            reftime: 0,
            txq: Txq::new(),
            rxq: Rxq::new(),
            lns: LnsSync::new(),
            configured: false,
            outq: VecDeque::new(),
            cmd: None,
        }
    }

    pub fn set_cmd_handler(&mut self, cmd: Box<dyn CmdHandler>) {
        self.cmd = Some(cmd);
    }

    /// Queues a message for the server.
    pub fn send_json(&mut self, v: Value) {
        self.outq.push_back(v.to_string());
    }

    pub fn pending_out(&self) -> usize {
        self.outq.len()
    }

    pub fn on_connected(&mut self, _env: &mut Env) {
        let v = &self.conf.version;
        let msg = json!({
            "msgtype": "version",
            "station": v.station,
            "firmware": v.firmware,
            "package": v.package,
            "model": v.model,
            "protocol": S2E_PROTOCOL,
            "features": v.features,
        });
        self.send_json(msg);
    }

    /// Dispatches one text message. Errors end the session.
    pub fn on_msg(&mut self, text: &str, env: &mut Env) -> Result<(), Error> {
        let v: Value = serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad JSON: {}", e)))?;
        let msgtype = match v.get("msgtype").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => return Err(Error::Protocol("missing msgtype".into())),
        };
        if let Some(mt) = v.get("MuxTime").and_then(Value::as_f64) {
            self.muxtime = mt;
            self.reftime = env.now;
        }
        match msgtype.as_str() {
            "router_config" => self.handle_router_config(&v, env)?,
            "dnmsg" => self.handle_dnmsg(&v, env),
            "dnframe" => self.handle_dnframe(&v, env),
            "dnsched" => self.handle_dnsched(&v, env),
            "timesync" => {
                if let Some(next) = self.lns.on_reply(env.now, &v, env.ts) {
                    env.timers.set(TimerKind::LnsSync, next);
                }
            }
            "runcmd" => match self.cmd.as_mut() {
                Some(c) => c.runcmd(&v),
                None => warn!("runcmd ignored - no command handler"),
            },
            "rmtsh" => match self.cmd.as_mut() {
                Some(c) => c.rmtsh(&v),
                None => warn!("rmtsh ignored - no remote shell"),
            },
            "error" => {
                let why = v.get("error").and_then(|e| e.as_str()).unwrap_or("?");
                error!("Server reported: {}", why);
            }
            other => warn!("Unknown msgtype '{}' - ignored", other),
        }
        Ok(())
    }

    /// Binary frames carry remote shell data, the first byte selects the session.
    pub fn on_binary(&mut self, data: &[u8], _env: &mut Env) -> Result<(), Error> {
        let (sess, rest) = match data.split_first() {
            Some((s, r)) => (*s, r),
            None => return Ok(()),
        };
        if sess >= MAX_RMTSH {
            return Err(Error::Protocol(format!("bad rmtsh session {}", sess)));
        }
        match self.cmd.as_mut() {
            Some(c) => c.rmtsh_data(sess, rest),
            None => debug!("rmtsh data for session {} dropped", sess),
        }
        Ok(())
    }

    pub fn handle_router_config(&mut self, v: &Value, env: &mut Env) -> Result<(), Error> {
        let rc = RouterConfig::deserialize(v).map_err(|e| Error::Protocol(format!("router_config: {}", e)))?;
        let rname = rc.region.as_deref().ok_or_else(|| Error::Region("router_config without region".into()))?;
        let reg = region::lookup(rname)?;

        self.region = reg.id;
        self.region_name = reg.name.to_string();
        let (lo, hi) = rc.freq_range.unwrap_or((reg.min_freq, reg.max_freq));
        if lo >= hi {
            return Err(Error::Region(format!("bad freq_range [{}, {}]", lo, hi)));
        }
        self.min_freq = lo;
        self.max_freq = hi;
        self.txpow = match rc.max_eirp {
            Some(e) => (e * 10.0) as i16,
            None => reg.txpow,
        };
        self.txpow2 = reg.txpow2;
        self.dc_chnl_rate = reg.dc_chnl_rate;
        self.ccaen = reg.cca && !rc.nocca && !self.conf.nocca;
        self.dcen = reg.dc && !rc.nodc && !self.conf.nodc;
        self.dwellen = reg.max_dwell.is_some() && !rc.nodwell && !self.conf.nodwell;
        self.max_dwell = reg.max_dwell.unwrap_or(0);

        self.dr_defs = [Rps::ILLEGAL; DR_CNT];
        for (dr, (sf, bw, dnonly)) in rc.drs.iter().enumerate().take(DR_CNT) {
            self.dr_defs[dr] = Rps::from_dr_def(*sf, *bw, *dnonly != 0);
        }

        self.dn_chnls.clear();
        for (f, _, _) in &rc.upchannels {
            if !self.dn_chnls.contains(f) && self.dn_chnls.len() < MAX_DNCHNLS {
                self.dn_chnls.push(*f);
            }
        }

        env.filters.set_netids(rc.netid.as_deref().unwrap_or(&[]));
        env.filters.joineui = rc
            .joineui
            .unwrap_or_default()
            .into_iter()
            .map(|(lo, hi)| (lo.0, hi.0))
            .collect();

        env.radio
            .configure(&rc.sx130x_conf, &self.region_name)
            .map_err(|e| Error::Region(format!("radio configuration failed: {}", e)))?;
        if let Some(hw) = &rc.hwspec {
            debug!("Hardware spec: {}", hw);
        }

        self.bcn = match rc.bcning {
            Some(b) if !b.freqs.is_empty() => {
                let mut ctrl = 0;
                if self.conf.gps_position.is_none() {
                    ctrl |= BCN_NOPOS;
                }
                env.timers.set(TimerKind::Beacon, env.now);
                Some(BcnInfo { dr: b.dr, layout: b.layout, freqs: b.freqs, ctrl })
            }
            _ => None,
        };

        self.configured = true;
        env.timers.set(TimerKind::LnsSync, self.lns.start(env.now));
        info!("Configured for region {} (dc={} cca={} dwell={}) freq {}..{}",
              self.region_name, self.dcen, self.ccaen, self.dwellen, self.min_freq, self.max_freq);
        Ok(())
    }

    pub fn rps2dr(&self, rps: Rps) -> Option<u8> {
        self.dr_defs
            .iter()
            .position(|d| !d.is_illegal() && (d.0 & !super::rps::RPS_DNONLY) == rps.0)
            .map(|d| d as u8)
    }

    /// Stores a received frame for the next flush. `Ok(false)` if the frame does
    /// not fit the channel plan, `RxqFull` if there is no room left.
    pub fn add_rxjob(&mut self, f: &RxFrame) -> Result<bool, Error> {
        if !self.configured {
            debug!("RX frame dropped - no channel plan yet");
            return Ok(false);
        }
        let dr = match self.rps2dr(f.rps) {
            Some(dr) => dr,
            None => {
                debug!("RX frame dropped - {} not in DR table", f.rps);
                return Ok(false);
            }
        };
        let idx = self.rxq.next_job().ok_or(Error::RxqFull)?;
        let n = f.data.len().min(super::MAX_RXFRAME_LEN);
        self.rxq.payload_mut(idx)[..n].copy_from_slice(&f.data[..n]);
        let j = self.rxq.job_mut(idx);
        j.freq = f.freq;
        j.rssi = f.rssi;
        j.snr = f.snr;
        j.dr = dr;
        j.len = n as u16;
        j.xtime = f.xtime;
        j.rctx = f.rctx;
        j.fts = f.fts;
        self.rxq.commit_job(idx);
        Ok(true)
    }

    fn ref_time(&self, now: Ustime) -> Option<f64> {
        if self.muxtime > 0.0 {
            Some(self.muxtime + (now - self.reftime) as f64 / 1e6)
        } else {
            None
        }
    }

    /// Sends queued control messages, then uplinks, as long as the sink has room.
    pub fn flush(&mut self, sink: &mut dyn MsgSink, env: &mut Env) {
        while let Some(m) = self.outq.front() {
            if !sink.has_sendbuf(m.len()) {
                return;
            }
            sink.send_text(m);
            self.outq.pop_front();
        }

        let mut lbuf = String::new();
        while let Some(idx) = self.rxq.front() {
            let j = *self.rxq.job(idx);
            let mut m = Map::new();
            lbuf.clear();
            if let Err(e) = lora::parse_frame(&mut m, self.rxq.payload(idx), &*env.filters, &mut lbuf) {
                match e {
                    Error::Filtered(_) => debug!("Dropped frame: {}", lbuf),
                    _ => debug!(e=?e, "Dropped frame"),
                }
                self.rxq.pop_front();
                continue;
            }
            m.insert("DR".into(), j.dr.into());
            m.insert("Freq".into(), j.freq.into());
            let gpstime = env.ts.xtime2gpstime(j.xtime).unwrap_or(0);
            let rxtime = env.ts.xtime2ustime(j.xtime).map(|u| env.ts.ustime2utc(u)).unwrap_or(0);
            let up = json!({
                "rctx": j.rctx,
                "xtime": j.xtime,
                "gpstime": gpstime,
                "fts": j.fts,
                "rssi": -(j.rssi as i32),
                "snr": j.snr as f64 / 4.0,
                "rxtime": rxtime as f64 / 1e6,
            });
            if let Some(rt) = self.ref_time(env.now) {
                m.insert("RefTime".into(), rt.into());
            }
            m.insert("upinfo".into(), up);
            let s = Value::Object(m).to_string();
            if !sink.has_sendbuf(s.len()) {
                return;
            }
            let air = up_airtime(self.dr_defs[j.dr as usize % DR_CNT], j.len as usize);
            info!("{} DR{} {:.3}MHz rssi=-{} snr={:.1} air={}ms", lbuf, j.dr, j.freq as f64 / 1e6,
                  j.rssi, j.snr as f64 / 4.0, air / 1000);
            sink.send_text(&s);
            self.rxq.pop_front();
        }
    }

    /// Fires the server time sync timer.
    pub fn on_lns_timer(&mut self, env: &mut Env) {
        let (req, next) = self.lns.on_timer(env.now);
        if let Some(r) = req {
            self.send_json(r);
        }
        env.timers.set(TimerKind::LnsSync, next);
    }

    /// Restarts the server time sync, e.g. after PPS came up.
    pub fn restart_lns_sync(&mut self, env: &mut Env) {
        if self.configured {
            env.timers.set(TimerKind::LnsSync, self.lns.start(env.now));
        }
    }

    /// Stops everything the session drives: radio emissions, queues and timers.
    pub fn shutdown(&mut self, env: &mut Env) {
        for u in 0..MAX_TXUNITS as u8 {
            self.abort_txunit(u, env);
        }
        env.timers.clear(TimerKind::LnsSync);
        env.timers.clear(TimerKind::Beacon);
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::station::lnssync::TIMESYNC_LNS_REFRESH;
    use crate::station::rps::{BW125, BW500, SF7};
    use crate::station::rt::ms;
    use crate::station::testutil::{Rig, EU868_CONFIG};

    fn uplink(rig: &Rig, data: Vec<u8>) -> RxFrame {
        RxFrame {
            freq: 868_100_000,
            rps: Rps::make(SF7, BW125),
            rssi: 80,
            snr: 28,
            xtime: rig.xtime_at(0, rig.now()),
            rctx: 0,
            fts: -1,
            data,
        }
    }

    fn updf() -> Vec<u8> {
        vec![0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00, 0x0A, 0xAA, 0xBB, 0x11, 0x22, 0x33, 0x44]
    }

    #[derive(Default)]
    struct Recorder {
        cmds: Vec<String>,
        data: Vec<(u8, Vec<u8>)>,
    }

    struct Cmds(Rc<RefCell<Recorder>>);

    impl CmdHandler for Cmds {
        fn runcmd(&mut self, msg: &Value) {
            self.0.borrow_mut().cmds.push(msg["command"].as_str().unwrap_or("").to_string());
        }
        fn rmtsh(&mut self, _msg: &Value) {}
        fn rmtsh_data(&mut self, session: u8, data: &[u8]) {
            self.0.borrow_mut().data.push((session, data.to_vec()));
        }
    }

    #[test]
    fn version_sent_on_connect() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        let mut env = rig.env();
        s2.on_connected(&mut env);
        let v = rig.sent(&mut s2, "version");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0]["protocol"], S2E_PROTOCOL);
        assert_eq!(v[0]["station"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn router_config_applies_channel_plan() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        rig.configured(&mut s2, EU868_CONFIG);
        assert!(s2.configured);
        assert_eq!(s2.region_name, "EU868");
        assert!(s2.dcen);
        assert!(!s2.ccaen);
        assert_eq!(s2.dn_chnls, vec![868_100_000, 868_300_000, 868_500_000]);
        assert_eq!(s2.dr_defs[5], Rps::make(SF7, BW125));
        assert!(s2.dr_defs[7].is_fsk());
        assert!(s2.dr_defs[8].is_illegal());
        assert_eq!(rig.sim.borrow().configured.as_deref(), Some("EU868"));
        assert!(rig.timers.is_armed(TimerKind::LnsSync));
    }

    #[test]
    fn malformed_messages_end_session() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        let mut env = rig.env();
        assert!(matches!(s2.on_msg("not json", &mut env), Err(Error::Protocol(_))));
        assert!(matches!(s2.on_msg("{\"x\":1}", &mut env), Err(Error::Protocol(_))));
        let bad = r#"{"msgtype":"router_config","region":"XX999"}"#;
        assert!(matches!(s2.on_msg(bad, &mut env), Err(Error::Region(_))));
        assert!(s2.on_msg(r#"{"msgtype":"whatever"}"#, &mut env).is_ok());
    }

    #[test]
    fn uplink_carries_upinfo() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        rig.configured(&mut s2, EU868_CONFIG);
        rig.msg(&mut s2, json!({"msgtype": "error", "error": "x", "MuxTime": 1000.5}));
        rig.clk.advance(ms(500));
        let f = uplink(&rig, updf());
        assert_eq!(s2.add_rxjob(&f), Ok(true));

        let up = rig.sent(&mut s2, "updf");
        assert_eq!(up.len(), 1);
        let u = &up[0];
        assert_eq!(u["DR"], 5);
        assert_eq!(u["Freq"], 868_100_000);
        assert_eq!(u["DevAddr"], 0x0102_0304);
        assert_eq!(u["FCnt"], 1);
        assert_eq!(u["FPort"], 10);
        assert_eq!(u["FRMPayload"], "AABB");
        assert_eq!(u["RefTime"], 1001.0);
        assert_eq!(u["upinfo"]["rssi"], -80);
        assert_eq!(u["upinfo"]["snr"], 7.0);
        assert_eq!(u["upinfo"]["xtime"], f.xtime);
        assert!(s2.rxq.is_empty());
    }

    #[test]
    fn uplinks_wait_for_send_buffer() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        rig.configured(&mut s2, EU868_CONFIG);
        let f = uplink(&rig, updf());
        assert_eq!(s2.add_rxjob(&f), Ok(true));
        rig.sink.room = Some(10);
        assert!(rig.sent(&mut s2, "updf").is_empty());
        assert_eq!(s2.rxq.len(), 1);
        rig.sink.room = None;
        assert_eq!(rig.sent(&mut s2, "updf").len(), 1);
    }

    #[test]
    fn uplinks_dropped_without_plan_or_dr() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        let f = uplink(&rig, updf());
        assert_eq!(s2.add_rxjob(&f), Ok(false));
        rig.configured(&mut s2, EU868_CONFIG);
        let wide = RxFrame { rps: Rps::make(SF7, BW500), ..f };
        assert_eq!(s2.add_rxjob(&wide), Ok(false));
    }

    #[test]
    fn full_rx_queue_reported() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        rig.configured(&mut s2, EU868_CONFIG);
        let f = uplink(&rig, updf());
        let res: Vec<_> = (0..=crate::station::MAX_RXJOBS).map(|_| s2.add_rxjob(&f)).collect();
        assert!(res[..crate::station::MAX_RXJOBS].iter().all(|r| *r == Ok(true)));
        assert_eq!(res.last(), Some(&Err(Error::RxqFull)));
        assert_eq!(rig.sent(&mut s2, "updf").len(), crate::station::MAX_RXJOBS);
    }

    #[test]
    fn netid_filter_drops_foreign_frames() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        let mut cfg: Value = serde_json::from_str(EU868_CONFIG).unwrap();
        cfg["NetID"] = json!([1]);
        rig.configured(&mut s2, &cfg.to_string());
        let f = uplink(&rig, updf());
        assert_eq!(s2.add_rxjob(&f), Ok(true));
        assert!(rig.sent(&mut s2, "updf").is_empty());
        assert!(s2.rxq.is_empty());
    }

    #[test]
    fn timesync_reply_schedules_refresh() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        rig.configured(&mut s2, EU868_CONFIG);
        let t0 = rig.now();
        rig.run_until(&mut s2, t0);
        let req = rig.sent(&mut s2, "timesync");
        assert_eq!(req.len(), 1);
        assert_eq!(req[0]["txtime"], t0);

        rig.clk.advance(ms(20));
        rig.msg(&mut s2, json!({"msgtype": "timesync", "txtime": t0, "MuxTime": 1234.0}));
        assert!(s2.lns.is_synced());
        assert_eq!(rig.timers.deadline(TimerKind::LnsSync), Some(t0 + ms(20) + TIMESYNC_LNS_REFRESH));
    }

    #[test]
    fn commands_and_rmtsh_data_dispatched() {
        let mut rig = Rig::new(1);
        let mut s2 = S2ctx::new(S2Conf::default());
        let rec = Rc::new(RefCell::new(Recorder::default()));
        s2.set_cmd_handler(Box::new(Cmds(rec.clone())));
        rig.msg(&mut s2, json!({"msgtype": "runcmd", "command": "reboot"}));
        let mut env = rig.env();
        s2.on_binary(&[1, 0x61, 0x62], &mut env).unwrap();
        assert!(matches!(s2.on_binary(&[MAX_RMTSH, 0], &mut env), Err(Error::Protocol(_))));
        let r = rec.borrow();
        assert_eq!(r.cmds, vec!["reboot".to_string()]);
        assert_eq!(r.data, vec![(1, vec![0x61, 0x62])]);
    }
}
