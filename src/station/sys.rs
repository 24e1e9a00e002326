//! The station: owner of all state and driver of the event loop.
//!
//! Everything runs on one thread. Each `step` moves received frames into the
//! session, fires due timers, then services the TC and CUPS connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::config::{ExitCode, Fatal, StationConf};
use super::cred::CredStore;
use super::cups::{Cups, CupsService};
use super::eui::fmt_eui;
use super::lora::Filters;
use super::radio::{Radio, RxFrame};
use super::rt::{ms, Clock, Ustime};
use super::tc::{Tc, TcCtx};
use super::timer::TimerQueue;
use super::timesync::{Timesyncs, TIMESYNC_RADIO_INTV};
use super::ws::Connector;
use super::{Env, TimerKind};

/// Longest sleep between two steps. Sockets are polled, not waited on.
pub const MAX_IDLE:Ustime = ms(10);

pub struct Station {
    clock: Box<dyn Clock>,
    timers: TimerQueue<TimerKind>,
    ts: Timesyncs,
    radio: Box<dyn Radio>,
    filters: Filters,
    tc: Tc,
    cups: Cups,
    creds: CredStore,
    connector: Box<dyn Connector>,
    conf: StationConf,
    routerid: u64,
    shutdown: Arc<AtomicBool>,
    rxbuf: Vec<RxFrame>,
}

impl Station {
    /// `mac` is used for the router EUI unless the configuration names one.
    pub fn new(
        conf: StationConf,
        mac: u64,
        clock: Box<dyn Clock>,
        radio: Box<dyn Radio>,
        connector: Box<dyn Connector>,
        cups: Option<Box<dyn CupsService>>,
    ) -> Self {
        let routerid = conf.router_eui(mac);
        Self {
            clock,
            timers: TimerQueue::new(),
            ts: Timesyncs::new(conf.pps_mode()),
            radio,
            filters: Filters::default(),
            tc: Tc::new(routerid, conf.s2conf(), conf.tc_timeout()),
            cups: Cups::new(cups),
            creds: CredStore::new(conf.home.clone()),
            connector,
            conf,
            routerid,
            shutdown: Arc::new(AtomicBool::new(false)),
            rxbuf: Vec::new(),
        }
    }

    pub fn routerid(&self) -> u64 {
        self.routerid
    }

    pub fn conf(&self) -> &StationConf {
        &self.conf
    }

    pub fn tc(&self) -> &Tc {
        &self.tc
    }

    pub fn timesyncs(&self) -> &Timesyncs {
        &self.ts
    }

    pub fn creds(&self) -> &CredStore {
        &self.creds
    }

    /// Setting the flag makes `run` return after the current step.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn parts(&mut self) -> (Env<'_>, TcCtx<'_>, &mut Tc, &mut Cups) {
        (
            Env {
                now: self.clock.now(),
                timers: &mut self.timers,
                ts: &mut self.ts,
                radio: &mut *self.radio,
                filters: &mut self.filters,
            },
            TcCtx { connector: &mut *self.connector, creds: &mut self.creds },
            &mut self.tc,
            &mut self.cups,
        )
    }

    /// Completes interrupted credential transactions and starts the connections.
    pub fn start(&mut self) -> Result<(), Fatal> {
        self.creds
            .roll_forward()
            .map_err(|e| Fatal::new(ExitCode::Creds, e.to_string()))?;
        info!("Station {} starting (home {})", fmt_eui(self.routerid), self.conf.home.display());
        /* from here on time sync owns the offset */
        self.ts.set_utc_offset(self.clock.utc_now() - self.clock.now());
        let nunits = self.radio.txunits();
        let (mut env, mut cx, tc, cups) = self.parts();
        for u in 0..nunits {
            env.timers.set(TimerKind::RadioSync(u), env.now);
        }
        tc.start(&mut env, &mut cx);
        cups.start(&mut env, cx.creds);
        Ok(())
    }

    /// One pass of the event loop. Returns the next timer deadline.
    pub fn step(&mut self) -> Option<Ustime> {
        let mut rx = std::mem::take(&mut self.rxbuf);
        rx.clear();
        self.radio.poll_rx(&mut rx);

        let (mut env, mut cx, tc, cups) = self.parts();
        if !rx.is_empty() {
            match tc.session_mut() {
                Some(s2) => {
                    for f in &rx {
                        if let Err(e) = s2.add_rxjob(f) {
                            warn!(e=?e, "RX frame lost");
                        }
                    }
                }
                None => debug!("{} RX frames dropped - no session", rx.len()),
            }
        }

        while let Some(k) = env.timers.pop_due(env.now) {
            match k {
                TimerKind::TxUnit(u) => {
                    if let Some(s2) = tc.session_mut() {
                        s2.on_txunit_timer(u, &mut env);
                    }
                }
                TimerKind::Beacon => {
                    if let Some(s2) = tc.session_mut() {
                        s2.on_beacon_timer(&mut env);
                    }
                }
                TimerKind::LnsSync => {
                    if let Some(s2) = tc.session_mut() {
                        s2.on_lns_timer(&mut env);
                    }
                }
                TimerKind::RadioSync(u) => {
                    let next = match env.radio.timesync(u) {
                        Some((q, sample)) => env.ts.update(u, q, sample),
                        None => TIMESYNC_RADIO_INTV,
                    };
                    env.timers.set(TimerKind::RadioSync(u), env.now + next);
                    if env.ts.take_lns_sync_request() {
                        if let Some(s2) = tc.session_mut() {
                            s2.restart_lns_sync(&mut env);
                        }
                    }
                }
                TimerKind::Tc => tc.on_timer(&mut env, &mut cx),
                TimerKind::Cups => cups.on_timer(tc, &mut env, &mut cx),
            }
        }

        tc.poll(&mut env, &mut cx);
        if let Some(err) = tc.take_done() {
            cups.on_tc_done(err, &mut env, cx.creds);
        }
        cups.poll(tc, &mut env, &mut cx);
        let next = env.timers.next_deadline();
        self.rxbuf = rx;
        next
    }

    /// Closes the session and quiets the radio.
    pub fn stop(&mut self) {
        let (mut env, _, tc, _) = self.parts();
        tc.stop(&mut env);
        env.radio.stop();
        info!("Station stopped");
    }

    /// Runs until the shutdown flag is set.
    pub fn run(&mut self) -> Result<ExitCode, Fatal> {
        self.start()?;
        while !self.shutdown.load(Ordering::Relaxed) {
            let next = self.step();
            let now = self.clock.now();
            let wait = next.map_or(MAX_IDLE, |d| (d - now).clamp(0, MAX_IDLE));
            if wait > 0 {
                std::thread::sleep(Duration::from_micros(wait as u64));
            }
        }
        warn!("Shutdown requested");
        self.stop();
        Ok(ExitCode::Ok)
    }
}
