//! Connection to the traffic controller.
//!
//! The URI of the MUXS is fetched from the INFOS endpoint (`{tc uri}/router-info`),
//! then a websocket to the MUXS carries the session. Failures back off, first by
//! retrying the cached MUXS URI, then by asking INFOS again with the next set of
//! credentials. A rejection by the server or too many failures end the machine.

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::cred::{Cat, CredSet, CredStore};
use super::eui::fmt_eui;
use super::rt::{sec, Ustime};
use super::s2e::{MsgSink, S2Conf, S2ctx};
use super::ws::{Connector, WsConn, WsEvent, WsUri, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL};
use super::{Env, TimerKind, MAX_TXUNITS};

pub const TC_TIMEOUT:Ustime =           sec(60);
pub const MAX_MUXS_RETRIES:u32 =        5;
pub const MAX_INFOS_RETRIES:u32 =       10;
pub const INFOS_BACKOFF_STEP:Ustime =   sec(10);
pub const INFOS_BACKOFF_STEPS:u32 =     6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcError {
    Failed,
    NoUri,
    Timeout,
    Rejected,
    Closed,
}

pub enum Phase {
    Ini,
    InfosReqPending { ws: WsConn },
    InfosGotUri { muxsuri: WsUri },
    MuxsReqPending { ws: WsConn },
    MuxsConnected { ws: WsConn, s2: Box<S2ctx> },
    MuxsBackoff { until: Ustime },
    InfosBackoff { until: Ustime },
    Dead(TcError),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Ini => "ini",
            Phase::InfosReqPending { .. } => "infos-req-pending",
            Phase::InfosGotUri { .. } => "infos-got-uri",
            Phase::MuxsReqPending { .. } => "muxs-req-pending",
            Phase::MuxsConnected { .. } => "muxs-connected",
            Phase::MuxsBackoff { .. } => "muxs-backoff",
            Phase::InfosBackoff { .. } => "infos-backoff",
            Phase::Dead(_) => "dead",
        }
    }
}

/// What the TC needs beyond the event-loop environment.
pub struct TcCtx<'a> {
    pub connector: &'a mut dyn Connector,
    pub creds: &'a mut CredStore,
}

pub struct Tc {
    phase: Phase,
    routerid: u64,
    s2conf: S2Conf,
    timeout: Ustime,
    credset: CredSet,
    muxsuri: Option<WsUri>,
    retries: u32,
    attempts: u32,
    done: Option<TcError>,
    events: Vec<WsEvent>,
}

impl Tc {
    pub fn new(routerid: u64, s2conf: S2Conf, timeout: Ustime) -> Self {
        Self {
            phase: Phase::Ini,
            routerid,
            s2conf,
            timeout: if timeout > 0 { timeout } else { TC_TIMEOUT },
            credset: CredSet::Reg,
            muxsuri: None,
            retries: 0,
            attempts: 0,
            done: None,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::MuxsConnected { .. })
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.phase, Phase::Dead(_))
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Connection attempts made so far, INFOS and MUXS together.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn credset(&self) -> CredSet {
        self.credset
    }

    pub fn muxsuri(&self) -> Option<&WsUri> {
        self.muxsuri.as_ref()
    }

    /// The error that ended the machine. Reported once.
    pub fn take_done(&mut self) -> Option<TcError> {
        self.done.take()
    }

    pub fn session_mut(&mut self) -> Option<&mut S2ctx> {
        match &mut self.phase {
            Phase::MuxsConnected { s2, .. } => Some(s2),
            _ => None,
        }
    }

    /// Starts from scratch with the regular credentials.
    pub fn start(&mut self, env: &mut Env, cx: &mut TcCtx) {
        self.stop(env);
        self.credset = CredSet::Reg;
        self.retries = 0;
        self.muxsuri = None;
        self.done = None;
        self.begin_infos(env, cx);
    }

    /// Tears down whatever connection is active and goes idle.
    pub fn stop(&mut self, env: &mut Env) {
        match std::mem::replace(&mut self.phase, Phase::Ini) {
            Phase::MuxsConnected { mut ws, mut s2 } => {
                s2.shutdown(env);
                ws.close(CLOSE_GOING_AWAY);
            }
            Phase::InfosReqPending { mut ws } | Phase::MuxsReqPending { mut ws } => ws.close(CLOSE_GOING_AWAY),
            _ => {}
        }
        env.timers.clear(TimerKind::Tc);
    }

    fn begin_infos(&mut self, env: &mut Env, cx: &mut TcCtx) {
        let uri = match cx.creds.uri(Cat::Tc, self.credset) {
            Some(u) => u,
            None => {
                warn!("No TC URI in {:?} credentials", self.credset);
                return self.infos_failed(TcError::NoUri, env);
            }
        };
        let infos = match WsUri::parse(&uri) {
            Ok(u) => u.join("router-info"),
            Err(e) => {
                error!(e=?e, "Bad TC URI");
                return self.infos_failed(TcError::Failed, env);
            }
        };
        self.attempts += 1;
        info!("Connecting to INFOS {} ({:?} credentials)", infos, self.credset);
        match cx.connector.open(&infos, self.credset) {
            Ok(link) => {
                self.phase = Phase::InfosReqPending { ws: WsConn::connect(link, &infos) };
                env.timers.set(TimerKind::Tc, env.now + self.timeout);
            }
            Err(e) => {
                warn!("INFOS connect failed: {}", e);
                self.infos_failed(TcError::Failed, env);
            }
        }
    }

    fn connect_muxs(&mut self, env: &mut Env, cx: &mut TcCtx) {
        let uri = match self.muxsuri.clone() {
            Some(u) => u,
            None => return self.begin_infos(env, cx),
        };
        self.attempts += 1;
        info!("Connecting to MUXS {}", uri);
        match cx.connector.open(&uri, self.credset) {
            Ok(link) => {
                self.phase = Phase::MuxsReqPending { ws: WsConn::connect(link, &uri) };
                env.timers.set(TimerKind::Tc, env.now + self.timeout);
            }
            Err(e) => {
                warn!("MUXS connect failed: {}", e);
                self.muxs_failed(TcError::Failed, env);
            }
        }
    }

    fn infos_failed(&mut self, err: TcError, env: &mut Env) {
        if err == TcError::Rejected {
            return self.die(err, env);
        }
        self.retries += 1;
        if self.retries >= MAX_INFOS_RETRIES {
            return self.die(err, env);
        }
        self.credset = self.credset.next();
        let until = env.now + INFOS_BACKOFF_STEP * self.retries.min(INFOS_BACKOFF_STEPS) as i64;
        info!("INFOS {:?} - retry #{} in {}s with {:?} credentials",
              err, self.retries, (until - env.now) / sec(1), self.credset);
        self.phase = Phase::InfosBackoff { until };
        env.timers.set(TimerKind::Tc, until);
    }

    fn muxs_failed(&mut self, err: TcError, env: &mut Env) {
        if self.muxsuri.is_some() && self.retries < MAX_MUXS_RETRIES {
            let until = env.now + sec(1 << self.retries);
            self.retries += 1;
            info!("MUXS {:?} - retry #{} in {}s", err, self.retries, (until - env.now) / sec(1));
            self.phase = Phase::MuxsBackoff { until };
            env.timers.set(TimerKind::Tc, until);
            return;
        }
        info!("MUXS {:?} - giving up on cached URI, asking INFOS again", err);
        self.muxsuri = None;
        self.retries = 0;
        self.infos_failed(err, env);
    }

    fn die(&mut self, err: TcError, env: &mut Env) {
        error!("TC connection failed for good: {:?}", err);
        self.phase = Phase::Dead(err);
        self.done = Some(err);
        env.timers.clear(TimerKind::Tc);
    }

    /// Tc timer: connection timeouts and the end of back-off periods.
    pub fn on_timer(&mut self, env: &mut Env, cx: &mut TcCtx) {
        match std::mem::replace(&mut self.phase, Phase::Ini) {
            Phase::InfosReqPending { mut ws } => {
                ws.close(CLOSE_NORMAL);
                warn!("INFOS request timed out");
                self.infos_failed(TcError::Timeout, env);
            }
            Phase::MuxsReqPending { mut ws } => {
                ws.close(CLOSE_NORMAL);
                warn!("MUXS connect timed out");
                self.muxs_failed(TcError::Timeout, env);
            }
            Phase::MuxsBackoff { .. } => self.connect_muxs(env, cx),
            Phase::InfosBackoff { .. } => self.begin_infos(env, cx),
            other => self.phase = other,
        }
    }

    /// Drives the active websocket and flushes the session.
    pub fn poll(&mut self, env: &mut Env, cx: &mut TcCtx) {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        match std::mem::replace(&mut self.phase, Phase::Ini) {
            Phase::InfosReqPending { mut ws } => {
                ws.poll(&mut events);
                self.on_infos_events(ws, &events, env, cx);
            }
            Phase::InfosGotUri { muxsuri } => {
                self.muxsuri = Some(muxsuri);
                self.connect_muxs(env, cx);
            }
            Phase::MuxsReqPending { mut ws } => {
                ws.poll(&mut events);
                match events.first() {
                    Some(WsEvent::Connected) => self.on_muxs_connected(ws, env, cx),
                    Some(WsEvent::Dead(why)) => {
                        warn!("MUXS handshake failed: {}", why);
                        self.muxs_failed(TcError::Failed, env);
                    }
                    Some(_) => self.muxs_failed(TcError::Closed, env),
                    None => self.phase = Phase::MuxsReqPending { ws },
                }
            }
            Phase::MuxsConnected { mut ws, mut s2 } => {
                ws.poll(&mut events);
                match run_session(&mut ws, &mut s2, &events, env) {
                    Ok(()) => self.phase = Phase::MuxsConnected { ws, s2 },
                    Err(err) => {
                        s2.shutdown(env);
                        if err == TcError::Failed {
                            ws.close(CLOSE_PROTOCOL);
                        }
                        self.muxs_failed(err, env);
                    }
                }
            }
            other => self.phase = other,
        }
        self.events = events;
    }

    fn on_infos_events(&mut self, mut ws: WsConn, events: &[WsEvent], env: &mut Env, cx: &mut TcCtx) {
        for ev in events {
            match ev {
                WsEvent::Connected => {
                    let req = json!({"router": fmt_eui(self.routerid)}).to_string();
                    ws.send_text(&req);
                    ws.poll(&mut Vec::new());
                }
                WsEvent::Text(t) => {
                    ws.close(CLOSE_NORMAL);
                    return self.on_infos_reply(t, env, cx);
                }
                WsEvent::DataSent => {}
                WsEvent::Binary(_) | WsEvent::Closed(_) | WsEvent::Dead(_) => {
                    warn!("INFOS connection ended without reply: {:?}", ev);
                    return self.infos_failed(TcError::Failed, env);
                }
            }
        }
        self.phase = Phase::InfosReqPending { ws };
    }

    fn on_infos_reply(&mut self, text: &str, env: &mut Env, cx: &mut TcCtx) {
        let v: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                error!(e=?e, "Unparsable INFOS reply");
                return self.infos_failed(TcError::Failed, env);
            }
        };
        if let Some(why) = v.get("error").and_then(Value::as_str) {
            error!("INFOS rejected router {}: {}", fmt_eui(self.routerid), why);
            return self.infos_failed(TcError::Rejected, env);
        }
        let uri = v.get("uri").and_then(Value::as_str).map(WsUri::parse);
        match uri {
            Some(Ok(u)) => {
                let muxs = v.get("muxs").and_then(|m| m.as_str()).unwrap_or("?");
                info!("INFOS: muxs={} uri={}", muxs, u);
                env.timers.clear(TimerKind::Tc);
                self.retries = 0;
                self.phase = Phase::InfosGotUri { muxsuri: u.clone() };
                self.muxsuri = Some(u);
                self.connect_muxs(env, cx);
            }
            _ => {
                error!("INFOS reply without usable uri: {}", text);
                self.infos_failed(TcError::Failed, env);
            }
        }
    }

    fn on_muxs_connected(&mut self, mut ws: WsConn, env: &mut Env, cx: &mut TcCtx) {
        env.timers.clear(TimerKind::Tc);
        self.retries = 0;
        let nunits = (env.radio.txunits() as usize).min(MAX_TXUNITS) as u8;
        for u in 0..nunits {
            let s = env.ts.new_xtime_session(u);
            env.radio.set_session(u, s);
            env.timers.set(TimerKind::RadioSync(u), env.now);
        }
        let mut s2 = Box::new(S2ctx::new(self.s2conf.clone()));
        s2.on_connected(env);
        s2.flush(&mut ws, env);
        if self.credset == CredSet::Reg {
            if let Err(e) = cx.creds.backup(Cat::Tc) {
                warn!("Credential backup failed: {}", e);
            }
        }
        info!("Connected to MUXS ({:?} credentials)", self.credset);
        self.phase = Phase::MuxsConnected { ws, s2 };
    }
}

/* one poll's worth of session traffic; Err ends the session */
fn run_session(ws: &mut WsConn, s2: &mut S2ctx, events: &[WsEvent], env: &mut Env) -> Result<(), TcError> {
    for ev in events {
        match ev {
            WsEvent::Text(t) => {
                if let Err(e) = s2.on_msg(t, env) {
                    error!(e=?e, "Session message failed");
                    return Err(TcError::Failed);
                }
            }
            WsEvent::Binary(b) => {
                if let Err(e) = s2.on_binary(b, env) {
                    error!(e=?e, "Session binary message failed");
                    return Err(TcError::Failed);
                }
            }
            WsEvent::DataSent | WsEvent::Connected => {}
            WsEvent::Closed(code) => {
                info!("MUXS closed the session (code {})", code);
                return Err(TcError::Closed);
            }
            WsEvent::Dead(why) => {
                warn!("MUXS connection lost: {}", why);
                return Err(TcError::Closed);
            }
        }
    }
    s2.flush(ws, env);
    debug!(pending = s2.pending_out(), "session flushed");
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;
    use crate::station::rt::ms;
    use crate::station::testutil::{Net, Rig};
    use crate::station::ws::{accept_upgrade, encode_frame, read_frames, OP_CLOSE, OP_TEXT};

    fn poll(tc: &mut Tc, rig: &mut Rig, net: &mut Net) {
        let mut env = rig.env();
        tc.poll(&mut env, &mut net.cx());
    }

    /* fires Tc timers up to `t`, polling after each */
    fn run(tc: &mut Tc, rig: &mut Rig, net: &mut Net, t: Ustime) {
        while let Some(d) = rig.timers.deadline(TimerKind::Tc) {
            if d > t {
                break;
            }
            rig.clk.set(d);
            rig.timers.clear(TimerKind::Tc);
            let mut env = rig.env();
            tc.on_timer(&mut env, &mut net.cx());
            tc.poll(&mut env, &mut net.cx());
        }
        rig.clk.set(t);
    }

    fn connect(tc: &mut Tc, rig: &mut Rig, net: &mut Net) {
        {
            let mut env = rig.env();
            tc.start(&mut env, &mut net.cx());
        }
        poll(tc, rig, net);
        let mut infos = net.server(0);
        assert!(accept_upgrade(&mut infos));
        poll(tc, rig, net);
        let req = read_frames(&infos);
        let v: Value = serde_json::from_slice(&req[0].payload).unwrap();
        assert_eq!(v["router"], "00-00-00-00-00-00-00-2A");
        let reply = json!({"router": "::2a", "muxs": "muxs-0", "uri": "ws://muxs.example:7000/traffic/x"});
        infos.write_all(&encode_frame(OP_TEXT, reply.to_string().as_bytes(), None)).unwrap();
        poll(tc, rig, net);
        assert!(matches!(tc.phase(), Phase::MuxsReqPending { .. }));
        poll(tc, rig, net);
        let mut muxs = net.server(1);
        assert!(accept_upgrade(&mut muxs));
        poll(tc, rig, net);
        poll(tc, rig, net);
    }

    #[test]
    fn infos_then_muxs() {
        let mut rig = Rig::new(2);
        let mut net = Net::new("ok", Some("ws://tc.example:6038"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        let old = rig.ts.session(0);
        connect(&mut tc, &mut rig, &mut net);

        assert!(tc.is_connected());
        assert_eq!(net.opened(), vec!["/router-info".to_string(), "/traffic/x".to_string()]);
        assert_ne!(rig.ts.session(0), old);
        assert!(rig.timers.is_armed(TimerKind::RadioSync(1)));
        assert!(!rig.timers.is_armed(TimerKind::Tc));
        let frames = read_frames(&net.server(1));
        let v: Value = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(v["msgtype"], "version");
        assert!(net.creds.backup_done(Cat::Tc));
        assert!(net.home.join("tc-bak.uri").exists());
    }

    #[test]
    fn session_messages_reach_s2e() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("s2e", Some("ws://tc.example:6038"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        connect(&mut tc, &mut rig, &mut net);
        let mut muxs = net.server(1);
        let _ = read_frames(&muxs);
        muxs.write_all(&encode_frame(OP_TEXT, crate::station::testutil::EU868_CONFIG.as_bytes(), None)).unwrap();
        poll(&mut tc, &mut rig, &mut net);
        assert!(tc.session_mut().map_or(false, |s| s.configured));
        assert_eq!(rig.sim.borrow().configured.as_deref(), Some("EU868"));
    }

    #[test]
    fn infos_error_is_final() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("rej", Some("ws://tc.example"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        {
            let mut env = rig.env();
            tc.start(&mut env, &mut net.cx());
        }
        poll(&mut tc, &mut rig, &mut net);
        let mut infos = net.server(0);
        assert!(accept_upgrade(&mut infos));
        poll(&mut tc, &mut rig, &mut net);
        let reply = json!({"router": "::2a", "error": "unknown router"});
        infos.write_all(&encode_frame(OP_TEXT, reply.to_string().as_bytes(), None)).unwrap();
        poll(&mut tc, &mut rig, &mut net);
        assert!(matches!(tc.phase(), Phase::Dead(TcError::Rejected)));
        assert_eq!(tc.take_done(), Some(TcError::Rejected));
        assert_eq!(tc.take_done(), None);
    }

    #[test]
    fn outage_backoff_is_bounded() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("out", Some("ws://tc.example"));
        fs::write(net.home.join("tc-bak.uri"), "ws://tc-bak.example").unwrap();
        net.conn.state.borrow_mut().refuse = true;
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        let t0 = rig.now();
        {
            let mut env = rig.env();
            tc.start(&mut env, &mut net.cx());
        }
        run(&mut tc, &mut rig, &mut net, t0 + sec(60) - 1);
        assert!(tc.attempts() <= 6, "{} attempts", tc.attempts());
        assert!(tc.attempts() >= 2);
        assert!(matches!(tc.phase(), Phase::InfosBackoff { .. }));

        run(&mut tc, &mut rig, &mut net, t0 + sec(3600));
        assert_eq!(tc.take_done(), Some(TcError::Failed));
        assert!(tc.is_dead());
    }

    #[test]
    fn credsets_rotate_on_failure() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("rot", None);
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        let mut env = rig.env();
        tc.start(&mut env, &mut net.cx());
        assert_eq!(tc.credset(), CredSet::Bak);
        assert_eq!(tc.retries(), 1);
        assert_eq!(env.timers.deadline(TimerKind::Tc), Some(env.now + INFOS_BACKOFF_STEP));
    }

    #[test]
    fn muxs_close_retries_cached_uri() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("close", Some("ws://tc.example:6038"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        connect(&mut tc, &mut rig, &mut net);
        let mut muxs = net.server(1);
        muxs.write_all(&encode_frame(OP_CLOSE, &1000u16.to_be_bytes(), None)).unwrap();
        poll(&mut tc, &mut rig, &mut net);
        assert!(matches!(tc.phase(), Phase::MuxsBackoff { .. }));
        let t = rig.now();
        assert_eq!(rig.timers.deadline(TimerKind::Tc), Some(t + sec(1)));

        run(&mut tc, &mut rig, &mut net, t + sec(1));
        assert_eq!(net.opened().last().map(String::as_str), Some("/traffic/x"));
        assert!(matches!(tc.phase(), Phase::MuxsReqPending { .. }));
        assert_eq!(tc.muxsuri().map(|u| u.port), Some(7000));
    }

    #[test]
    fn muxs_backoff_restarts_after_infos_success() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("reset", Some("ws://tc.example"));
        fs::write(net.home.join("tc-bak.uri"), "ws://tc-bak.example").unwrap();
        let mut tc = Tc::new(42, S2Conf::default(), ms(5000));
        let t0 = rig.now();
        {
            let mut env = rig.env();
            tc.start(&mut env, &mut net.cx());
        }
        run(&mut tc, &mut rig, &mut net, t0 + ms(5000) + INFOS_BACKOFF_STEP);
        assert_eq!(tc.retries(), 1);
        assert_eq!(tc.credset(), CredSet::Bak);
        assert_eq!(net.hosts().last().map(String::as_str), Some("tc-bak.example"));

        poll(&mut tc, &mut rig, &mut net);
        let mut infos = net.server(1);
        assert!(accept_upgrade(&mut infos));
        poll(&mut tc, &mut rig, &mut net);
        let reply = json!({"router": "::2a", "muxs": "muxs-0", "uri": "ws://muxs.example:7000/traffic/x"});
        infos.write_all(&encode_frame(OP_TEXT, reply.to_string().as_bytes(), None)).unwrap();
        poll(&mut tc, &mut rig, &mut net);
        assert!(matches!(tc.phase(), Phase::MuxsReqPending { .. }));
        assert_eq!(tc.retries(), 0);

        let mut muxs = net.server(2);
        muxs.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").unwrap();
        poll(&mut tc, &mut rig, &mut net);
        assert!(matches!(tc.phase(), Phase::MuxsBackoff { .. }));
        assert_eq!(rig.timers.deadline(TimerKind::Tc), Some(rig.now() + sec(1)));
    }

    #[test]
    fn infos_timeout_backs_off() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("tmo", Some("ws://tc.example"));
        let mut tc = Tc::new(42, S2Conf::default(), ms(5000));
        let t0 = rig.now();
        {
            let mut env = rig.env();
            tc.start(&mut env, &mut net.cx());
        }
        assert_eq!(rig.timers.deadline(TimerKind::Tc), Some(t0 + ms(5000)));
        run(&mut tc, &mut rig, &mut net, t0 + ms(5000));
        assert!(matches!(tc.phase(), Phase::InfosBackoff { .. }));
        assert_eq!(tc.retries(), 1);
    }

    #[test]
    fn stop_shuts_session() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("stop", Some("ws://tc.example:6038"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        connect(&mut tc, &mut rig, &mut net);
        let mut env = rig.env();
        tc.stop(&mut env);
        assert!(matches!(tc.phase(), Phase::Ini));
        let frames = read_frames(&net.server(1));
        assert_eq!(frames.last().map(|f| f.opcode), Some(OP_CLOSE));
        assert!(!rig.timers.is_armed(TimerKind::Tc));
    }
}
