//! Server time sync. Requests go out in bursts until one round trip is short
//! enough, the accepted reply yields the server time offset and possibly GPS time.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::rt::{ms, sec, Ustime};
use super::timesync::Timesyncs;

pub const TIMESYNC_LNS_RETRY:Ustime =   ms(71);
pub const TIMESYNC_LNS_BURST:u32 =      10;
pub const TIMESYNC_LNS_PAUSE:Ustime =   sec(5);
pub const TIMESYNC_LNS_REFRESH:Ustime = sec(600);

#[derive(Debug, Default)]
pub struct LnsSync {
    burst: u32,
    burst_start: Ustime,
    synced: bool,
    /// Server time minus local time in us.
    pub offset: Option<Ustime>,
    pub rtt: Option<Ustime>,
}

impl LnsSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new burst. Returns the deadline of the first request.
    pub fn start(&mut self, now: Ustime) -> Ustime {
        self.burst = 0;
        self.burst_start = now;
        self.synced = false;
        now
    }

    /// Timer callback: a request to send, if any, plus the next deadline.
    pub fn on_timer(&mut self, now: Ustime) -> (Option<Value>, Ustime) {
        if self.synced {
            return (None, self.start(now));
        }
        if self.burst < TIMESYNC_LNS_BURST && now - self.burst_start < TIMESYNC_LNS_PAUSE {
            self.burst += 1;
            let req = json!({"msgtype": "timesync", "txtime": now});
            return (Some(req), now + TIMESYNC_LNS_RETRY);
        }
        warn!("Server time sync: no round trip below {}ms in {} requests - pausing",
              TIMESYNC_LNS_RETRY / 1000, self.burst);
        self.burst = 0;
        self.burst_start = now + TIMESYNC_LNS_PAUSE;
        (None, now + TIMESYNC_LNS_PAUSE)
    }

    /// Handles a `timesync` reply. On acceptance returns the next burst deadline.
    pub fn on_reply(&mut self, now: Ustime, msg: &Value, ts: &mut Timesyncs) -> Option<Ustime> {
        let txtime = msg.get("txtime").and_then(Value::as_i64)?;
        let rtt = now - txtime;
        if !(0..=TIMESYNC_LNS_RETRY).contains(&rtt) {
            debug!("Server time sync: round trip {}us rejected", rtt);
            return None;
        }
        let mid = txtime + rtt / 2;
        self.rtt = Some(rtt);
        if let Some(mt) = msg.get("MuxTime").and_then(Value::as_f64) {
            self.offset = Some((mt * 1e6) as Ustime - mid);
        }
        if let Some(g) = msg.get("gpstime").and_then(Value::as_i64) {
            match ts.set_gps_time(mid, g) {
                Ok(()) => {}
                Err(e) => debug!(e=?e, "GPS time from server not applied"),
            }
        }
        info!("Server time sync: rtt={}us offset={:?}", rtt, self.offset);
        self.synced = true;
        Some(now + TIMESYNC_LNS_REFRESH)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}
