//! Event-loop harness for session level unit tests.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use super::cred::CredStore;
use super::lora::Filters;
use super::radio::{Radio, SimHandle, SimRadio};
use super::rt::{sec, Clock, ManualClock, Ustime};
use super::s2e::{MsgSink, S2ctx};
use super::tc::TcCtx;
use super::timer::TimerQueue;
use super::timesync::Timesyncs;
use super::ws::{MemConnector, MemLink};
use super::{Env, TimerKind};

pub const EU868_CONFIG: &str = r#"{
    "msgtype": "router_config",
    "region": "EU868",
    "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],[7,250,0],[0,0,0]],
    "upchannels": [[868100000,0,5],[868300000,0,5],[868500000,0,5]],
    "NetID": null,
    "JoinEui": null,
    "sx1301_conf": {}
}"#;

#[derive(Default)]
pub struct VecSink {
    pub msgs: Vec<String>,
    pub room: Option<usize>,
}

impl MsgSink for VecSink {
    fn has_sendbuf(&self, minsize: usize) -> bool {
        self.room.map_or(true, |r| minsize <= r)
    }

    fn send_text(&mut self, text: &str) -> bool {
        if let Some(r) = self.room.as_mut() {
            *r -= text.len();
        }
        self.msgs.push(text.to_string());
        true
    }

    fn send_binary(&mut self, _data: &[u8]) -> bool {
        true
    }
}

pub struct Rig {
    pub clk: ManualClock,
    pub timers: TimerQueue<TimerKind>,
    pub ts: Timesyncs,
    pub radio: SimRadio,
    pub sim: SimHandle,
    pub filters: Filters,
    pub sink: VecSink,
}

impl Rig {
    /// All TX units get a session and one time sync sample at t=100s.
    pub fn new(txunits: u8) -> Self {
        let clk = ManualClock::new(sec(100), sec(1_700_000_000));
        let (mut radio, sim) = SimRadio::new(Box::new(clk.clone()), txunits);
        let mut ts = Timesyncs::new(false);
        for u in 0..txunits {
            let s = ts.new_xtime_session(u);
            radio.set_session(u, s);
            let (q, sample) = radio.timesync(u).expect("sample");
            ts.update(u, q, sample);
        }
        ts.set_utc_offset(sec(1_700_000_000));
        Self { clk, timers: TimerQueue::new(), ts, radio, sim, filters: Filters::default(), sink: VecSink::default() }
    }

    pub fn now(&self) -> Ustime {
        self.clk.now()
    }

    pub fn env(&mut self) -> Env<'_> {
        Env {
            now: self.clk.now(),
            timers: &mut self.timers,
            ts: &mut self.ts,
            radio: &mut self.radio,
            filters: &mut self.filters,
        }
    }

    pub fn xtime_at(&self, txunit: u8, t: Ustime) -> i64 {
        self.ts.ustime2xtime(txunit, t).expect("xtime")
    }

    pub fn configured(&mut self, s2: &mut S2ctx, cfg: &str) {
        let mut env = self.env();
        s2.on_msg(cfg, &mut env).expect("router_config");
    }

    pub fn msg(&mut self, s2: &mut S2ctx, v: Value) {
        let mut env = self.env();
        s2.on_msg(&v.to_string(), &mut env).expect("msg");
    }

    /// Fires all session timers due until `t`, then leaves the clock at `t`.
    pub fn run_until(&mut self, s2: &mut S2ctx, t: Ustime) {
        while let Some(d) = self.timers.next_deadline() {
            if d > t {
                break;
            }
            self.clk.set(d);
            let key = match self.timers.pop_due(self.clk.now()) {
                Some(k) => k,
                None => break,
            };
            let mut env = self.env();
            match key {
                TimerKind::TxUnit(u) => s2.on_txunit_timer(u, &mut env),
                TimerKind::Beacon => s2.on_beacon_timer(&mut env),
                TimerKind::LnsSync => s2.on_lns_timer(&mut env),
                _ => {}
            }
        }
        self.clk.set(t);
    }

    /// Flushes the session and returns everything sent so far with the given msgtype.
    pub fn sent(&mut self, s2: &mut S2ctx, msgtype: &str) -> Vec<Value> {
        let mut sink = std::mem::take(&mut self.sink);
        {
            let mut env = self.env();
            s2.flush(&mut sink, &mut env);
        }
        let out = sink
            .msgs
            .iter()
            .filter_map(|m| serde_json::from_str::<Value>(m).ok())
            .filter(|v| v["msgtype"] == msgtype)
            .collect();
        self.sink = sink;
        out
    }
}

/// In-memory network plus a credential home under the temp directory.
pub struct Net {
    pub conn: MemConnector,
    pub creds: CredStore,
    pub home: PathBuf,
}

impl Net {
    pub fn new(tag: &str, tc_uri: Option<&str>) -> Self {
        let home = std::env::temp_dir().join(format!("lora-station-net-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&home);
        fs::create_dir_all(&home).expect("home");
        if let Some(u) = tc_uri {
            fs::write(home.join("tc.uri"), u).expect("tc.uri");
        }
        Net { conn: MemConnector::default(), creds: CredStore::new(&home), home }
    }

    pub fn cx(&mut self) -> TcCtx<'_> {
        TcCtx { connector: &mut self.conn, creds: &mut self.creds }
    }

    /// Server end of the i-th opened link.
    pub fn server(&self, i: usize) -> MemLink {
        self.conn.state.borrow().opened[i].2.clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.conn.state.borrow().opened.iter().map(|o| o.0.path.clone()).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.conn.state.borrow().opened.iter().map(|o| o.0.host.clone()).collect()
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.home);
    }
}
