//! A station talking to an in-memory TC: INFOS, MUXS, channel plan, uplink and downlink.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde_json::{json, Value};

use lora_station::station::config::StationConf;
use lora_station::station::radio::{RxFrame, SimHandle, SimRadio};
use lora_station::station::rps::{Rps, BW125, SF7};
use lora_station::station::rt::{ms, sec, Clock, ManualClock, Ustime};
use lora_station::station::tc::Phase;
use lora_station::station::ws::{accept_upgrade, encode_frame, read_frames, MemConnector, MemLink, OP_CLOSE, OP_TEXT};
use lora_station::station::Station;

const ROUTER: &str = "00-16-C0-FF-FE-01-F0-0D";

const ROUTER_CONFIG: &str = r#"{
    "msgtype": "router_config",
    "region": "EU868",
    "DRs": [[12,125,0],[11,125,0],[10,125,0],[9,125,0],[8,125,0],[7,125,0],[7,250,0],[0,0,0]],
    "upchannels": [[868100000,0,5],[868300000,0,5],[868500000,0,5]],
    "NetID": null,
    "JoinEui": null,
    "sx1301_conf": {},
    "MuxTime": 1700000000.25
}"#;

struct World {
    st: Station,
    clk: ManualClock,
    sim: SimHandle,
    conn: MemConnector,
    home: PathBuf,
}

impl World {
    fn new(tag: &str) -> Self {
        let home = std::env::temp_dir().join(format!("lora-station-session-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&home);
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("tc.uri"), "ws://tc.example:6038").unwrap();
        let conf = StationConf { home: home.clone(), ..StationConf::default() };
        let clk = ManualClock::new(sec(50), sec(1_700_000_000));
        let (radio, sim) = SimRadio::new(Box::new(clk.clone()), 1);
        let conn = MemConnector::default();
        let st = Station::new(conf, 0x0016_C001_F00D, Box::new(clk.clone()), Box::new(radio), Box::new(conn.clone()), None);
        World { st, clk, sim, conn, home }
    }

    fn server(&self, i: usize) -> MemLink {
        self.conn.state.borrow().opened[i].2.clone()
    }

    fn opened(&self) -> usize {
        self.conn.state.borrow().opened.len()
    }

    fn steps(&mut self, n: usize) {
        for _ in 0..n {
            self.st.step();
        }
    }

    /* advances in small increments so every timer fires on time */
    fn run_for(&mut self, d: Ustime) {
        let end = self.clk.now() + d;
        while self.clk.now() < end {
            self.clk.advance(ms(5));
            self.st.step();
        }
    }

    /// Runs INFOS and the MUXS handshake; returns the MUXS server end.
    fn connect(&mut self, muxs_idx: usize) -> MemLink {
        let mut infos = self.server(muxs_idx - 1);
        assert!(accept_upgrade(&mut infos));
        self.steps(1);
        let req = read_frames(&infos);
        let v: Value = serde_json::from_slice(&req[0].payload).unwrap();
        assert_eq!(v["router"], ROUTER);
        let reply = json!({"router": ROUTER, "muxs": "muxs-7", "uri": "ws://muxs.example:6039/traffic/station"});
        infos.write_all(&encode_frame(OP_TEXT, reply.to_string().as_bytes(), None)).unwrap();
        self.steps(2);
        let mut muxs = self.server(muxs_idx);
        assert!(accept_upgrade(&mut muxs));
        self.steps(2);
        assert!(self.st.tc().is_connected());
        muxs
    }

    fn received(&self, link: &MemLink, msgtype: &str) -> Vec<Value> {
        read_frames(link)
            .iter()
            .filter_map(|f| serde_json::from_slice::<Value>(&f.payload).ok())
            .filter(|v| v["msgtype"] == msgtype)
            .collect()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.home);
    }
}

#[test]
fn uplink_and_downlink_through_muxs() {
    let mut w = World::new("updn");
    w.st.start().unwrap();
    w.steps(1);
    let mut muxs = w.connect(1);

    let version = w.received(&muxs, "version");
    assert_eq!(version.len(), 1);
    assert_eq!(version[0]["protocol"], 2);
    assert!(w.home.join("tc-bak.uri").exists());

    muxs.write_all(&encode_frame(OP_TEXT, ROUTER_CONFIG.as_bytes(), None)).unwrap();
    w.steps(1);
    assert_eq!(w.sim.borrow().configured.as_deref(), Some("EU868"));
    w.run_for(ms(50));
    assert!(w.st.timesyncs().has_sync(0));

    let t_rx = w.clk.now() + ms(5);
    w.sim.borrow_mut().rx.push_back(RxFrame {
        freq: 868_300_000,
        rps: Rps::make(SF7, BW125),
        rssi: 90,
        snr: 20,
        xtime: 0,
        rctx: 0,
        fts: -1,
        data: vec![0x40, 0xAB, 0xCD, 0xEF, 0xFF, 0x01, 0xF3, 0xF4, 0xFF, 0x20, 0x21, 0x22, 0xA0, 0xA1, 0xA2, 0xA3],
    });
    w.run_for(ms(20));
    let up = w.received(&muxs, "updf");
    assert_eq!(up.len(), 1);
    assert_eq!(up[0]["DevAddr"], -1061461);
    assert_eq!(up[0]["FRMPayload"], "2122");
    assert_eq!(up[0]["DR"], 5);
    assert_eq!(up[0]["Freq"], 868_300_000);
    assert_eq!(up[0]["upinfo"]["rssi"], -90);
    let x = up[0]["upinfo"]["xtime"].as_i64().unwrap();

    let dn = json!({
        "msgtype": "dnmsg", "DevEui": "00-00-00-00-00-00-00-01", "dC": 0, "diid": 11, "pdu": "600102030405",
        "RxDelay": 1, "RX1DR": 5, "RX1Freq": 868_300_000, "RX2DR": 0, "RX2Freq": 869_525_000,
        "priority": 0, "xtime": x, "rctx": 0,
    });
    muxs.write_all(&encode_frame(OP_TEXT, dn.to_string().as_bytes(), None)).unwrap();
    w.run_for(sec(2));

    let txs = w.sim.borrow().txs.clone();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].ustime, t_rx + sec(1));
    assert_eq!(txs[0].freq, 868_300_000);
    assert_eq!(txs[0].data, vec![0x60, 1, 2, 3, 4, 5]);
    let txed = w.received(&muxs, "dntxed");
    assert_eq!(txed.len(), 1);
    assert_eq!(txed[0]["diid"], 11);
}

#[test]
fn reconnect_starts_new_session() {
    let mut w = World::new("reconn");
    w.st.start().unwrap();
    w.steps(1);
    let muxs = w.connect(1);
    w.run_for(ms(20));
    let s1 = w.st.timesyncs().session(0);
    assert_ne!(s1, 0);

    /* server closes, the cached MUXS URI is retried after 1s */
    let mut m = muxs.clone();
    m.write_all(&encode_frame(OP_CLOSE, &1000u16.to_be_bytes(), None)).unwrap();
    w.steps(1);
    assert!(matches!(w.st.tc().phase(), Phase::MuxsBackoff { .. }));
    let before = w.opened();
    w.run_for(sec(1) + ms(10));
    assert_eq!(w.opened(), before + 1);
    let mut again = w.server(before);
    assert!(accept_upgrade(&mut again));
    w.steps(2);
    assert!(w.st.tc().is_connected());
    assert_ne!(w.st.timesyncs().session(0), s1);
    assert_eq!(w.received(&again, "version").len(), 1);
}
