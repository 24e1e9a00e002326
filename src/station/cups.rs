//! Interlock with the configuration and update server (CUPS).
//!
//! The CUPS client itself lives outside this crate behind `CupsService`. It is
//! asked for an update when the TC connection gives up and once a day. New TC
//! credentials are only committed with the TC connection stopped.

use tracing::{error, info, warn};

use super::cred::{Cat, CredStore, CredUpdate};
use super::error::Error;
use super::rt::{sec, Ustime};
use super::tc::{Tc, TcCtx, TcError};
use super::{Env, TimerKind};

pub const CUPS_RESYNC_INTV:Ustime = sec(24 * 3600);
pub const CUPS_RETRY_INTV:Ustime =  sec(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CupsReason {
    Startup,
    TcFailed(TcError),
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CupsResult {
    Updated { tc: Option<CredUpdate>, cups: Option<CredUpdate> },
    NoChange,
    Failed(String),
}

pub trait CupsService {
    /// Starts one update round. `creds` gives access to the current CUPS credentials.
    fn trigger(&mut self, reason: CupsReason, creds: &CredStore);
    /// The outcome of the running round, once available.
    fn poll(&mut self) -> Option<CupsResult>;
}

pub struct Cups {
    svc: Option<Box<dyn CupsService>>,
    busy: bool,
    rounds: u32,
}

impl Cups {
    pub fn new(svc: Option<Box<dyn CupsService>>) -> Self {
        Self { svc, busy: false, rounds: 0 }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Completed update rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn start(&mut self, env: &mut Env, creds: &CredStore) {
        if self.svc.is_some() {
            self.trigger(CupsReason::Startup, env, creds);
        }
    }

    pub fn trigger(&mut self, reason: CupsReason, env: &mut Env, creds: &CredStore) {
        let svc = match self.svc.as_mut() {
            Some(s) => s,
            None => return,
        };
        if self.busy {
            return;
        }
        info!("CUPS update round ({:?})", reason);
        self.busy = true;
        env.timers.clear(TimerKind::Cups);
        svc.trigger(reason, creds);
    }

    /// TC connection gave up for good.
    pub fn on_tc_done(&mut self, err: TcError, env: &mut Env, creds: &CredStore) {
        if self.svc.is_some() {
            self.trigger(CupsReason::TcFailed(err), env, creds);
        } else {
            warn!("TC failed ({:?}) and no CUPS available - restarting TC in {}s", err, CUPS_RETRY_INTV / sec(1));
            env.timers.set(TimerKind::Cups, env.now + CUPS_RETRY_INTV);
        }
    }

    pub fn on_timer(&mut self, tc: &mut Tc, env: &mut Env, cx: &mut TcCtx) {
        if self.svc.is_some() {
            self.trigger(CupsReason::Periodic, env, cx.creds);
        } else if tc.is_dead() {
            info!("Restarting TC");
            tc.start(env, cx);
        }
    }

    /// Collects the outcome of a running round and applies it.
    pub fn poll(&mut self, tc: &mut Tc, env: &mut Env, cx: &mut TcCtx) -> bool {
        let res = match self.svc.as_mut().and_then(|s| s.poll()) {
            Some(r) => r,
            None => return false,
        };
        self.busy = false;
        self.rounds += 1;
        let next = match res {
            CupsResult::Updated { tc: tcu, cups: cu } => {
                if let Some(u) = cu {
                    if let Err(e) = commit(cx.creds, Cat::Cups, &u) {
                        error!(e=?e, "CUPS credential update failed");
                    }
                }
                match tcu {
                    Some(u) => {
                        tc.stop(env);
                        if let Err(e) = commit(cx.creds, Cat::Tc, &u) {
                            error!(e=?e, "TC credential update failed");
                        }
                        tc.start(env, cx);
                    }
                    None => restart_dead(tc, env, cx),
                }
                CUPS_RESYNC_INTV
            }
            CupsResult::NoChange => {
                info!("CUPS: no updates");
                restart_dead(tc, env, cx);
                CUPS_RESYNC_INTV
            }
            CupsResult::Failed(why) => {
                warn!("CUPS round failed: {}", why);
                restart_dead(tc, env, cx);
                CUPS_RETRY_INTV
            }
        };
        env.timers.set(TimerKind::Cups, env.now + next);
        true
    }
}

fn restart_dead(tc: &mut Tc, env: &mut Env, cx: &mut TcCtx) {
    if tc.is_dead() {
        tc.start(env, cx);
    }
}

fn commit(creds: &mut CredStore, cat: Cat, upd: &CredUpdate) -> Result<(), Error> {
    if let Err(e) = creds.stage(cat, upd) {
        creds.abandon_update(cat);
        return Err(e);
    }
    creds.commit(cat)
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use super::*;
    use crate::station::cred::CredSet;
    use crate::station::s2e::S2Conf;
    use crate::station::tc::Phase;
    use crate::station::testutil::{Net, Rig};
    use crate::station::ws::{accept_upgrade, encode_frame, OP_TEXT};

    #[derive(Default)]
    struct Script {
        reasons: Vec<CupsReason>,
        next: Option<CupsResult>,
    }

    struct ScriptCups(Rc<RefCell<Script>>);

    impl CupsService for ScriptCups {
        fn trigger(&mut self, reason: CupsReason, _creds: &CredStore) {
            self.0.borrow_mut().reasons.push(reason);
        }

        fn poll(&mut self) -> Option<CupsResult> {
            self.0.borrow_mut().next.take()
        }
    }

    fn scripted() -> (Cups, Rc<RefCell<Script>>) {
        let s: Rc<RefCell<Script>> = Rc::default();
        (Cups::new(Some(Box::new(ScriptCups(s.clone())))), s)
    }

    /* TC start followed by a rejecting INFOS reply */
    fn rejected_tc(rig: &mut Rig, net: &mut Net) -> Tc {
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        let mut env = rig.env();
        tc.start(&mut env, &mut net.cx());
        tc.poll(&mut env, &mut net.cx());
        let mut infos = net.server(0);
        assert!(accept_upgrade(&mut infos));
        tc.poll(&mut env, &mut net.cx());
        let _ = infos.drain();
        infos.write_all(&encode_frame(OP_TEXT, br#"{"error":"not provisioned"}"#, None)).unwrap();
        tc.poll(&mut env, &mut net.cx());
        assert!(tc.is_dead());
        tc
    }

    #[test]
    fn rejection_hands_over_to_cups() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("cups-rej", Some("ws://old-tc.example"));
        let mut tc = rejected_tc(&mut rig, &mut net);
        let (mut cups, script) = scripted();

        let err = tc.take_done().unwrap();
        let mut env = rig.env();
        cups.on_tc_done(err, &mut env, &net.creds);
        assert!(cups.is_busy());
        assert_eq!(script.borrow().reasons, vec![CupsReason::TcFailed(TcError::Rejected)]);
        assert!(!cups.poll(&mut tc, &mut env, &mut net.cx()));

        script.borrow_mut().next = Some(CupsResult::Updated {
            tc: Some(CredUpdate { uri: Some("ws://new-tc.example".into()), creds: None }),
            cups: None,
        });
        assert!(cups.poll(&mut tc, &mut env, &mut net.cx()));
        assert!(!cups.is_busy());
        assert_eq!(net.creds.uri(Cat::Tc, CredSet::Reg).as_deref(), Some("ws://new-tc.example"));
        assert!(matches!(tc.phase(), Phase::InfosReqPending { .. }));
        assert_eq!(net.hosts().last().map(String::as_str), Some("new-tc.example"));
        assert_eq!(env.timers.deadline(TimerKind::Cups), Some(env.now + CUPS_RESYNC_INTV));
    }

    #[test]
    fn bad_update_keeps_old_credentials() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("cups-bad", Some("ws://old-tc.example"));
        let mut tc = rejected_tc(&mut rig, &mut net);
        let (mut cups, script) = scripted();
        let mut env = rig.env();
        cups.trigger(CupsReason::Periodic, &mut env, &net.creds);
        script.borrow_mut().next = Some(CupsResult::Updated {
            tc: Some(CredUpdate { uri: Some("ws://new-tc.example".into()), creds: Some(vec![0x02, 0x01]) }),
            cups: None,
        });
        assert!(cups.poll(&mut tc, &mut env, &mut net.cx()));
        assert!(!net.creds.is_updating());
        assert_eq!(net.creds.uri(Cat::Tc, CredSet::Reg).as_deref(), Some("ws://old-tc.example"));
        assert!(!net.home.join("tc-temp.uri").exists());
        assert!(matches!(tc.phase(), Phase::InfosReqPending { .. }));
    }

    #[test]
    fn failed_round_retries_sooner() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("cups-fail", Some("ws://tc.example"));
        let mut tc = Tc::new(42, S2Conf::default(), 0);
        let (mut cups, script) = scripted();
        {
            let mut env = rig.env();
            cups.start(&mut env, &net.creds);
            cups.trigger(CupsReason::Periodic, &mut env, &net.creds);
            script.borrow_mut().next = Some(CupsResult::Failed("timeout".into()));
            assert!(cups.poll(&mut tc, &mut env, &mut net.cx()));
            assert_eq!(env.timers.deadline(TimerKind::Cups), Some(env.now + CUPS_RETRY_INTV));
        }
        assert_eq!(script.borrow().reasons, vec![CupsReason::Startup]);
        assert!(matches!(tc.phase(), Phase::Ini));

        let mut env = rig.env();
        cups.on_timer(&mut tc, &mut env, &mut net.cx());
        assert_eq!(script.borrow().reasons, vec![CupsReason::Startup, CupsReason::Periodic]);
        assert_eq!(cups.rounds(), 1);
    }

    #[test]
    fn without_cups_tc_restarts_later() {
        let mut rig = Rig::new(1);
        let mut net = Net::new("cups-none", Some("ws://tc.example"));
        let mut tc = rejected_tc(&mut rig, &mut net);
        let mut cups = Cups::new(None);
        let err = tc.take_done().unwrap();
        let mut env = rig.env();
        cups.on_tc_done(err, &mut env, &net.creds);
        assert!(!cups.is_busy());
        assert_eq!(env.timers.deadline(TimerKind::Cups), Some(env.now + CUPS_RETRY_INTV));
        cups.on_timer(&mut tc, &mut env, &mut net.cx());
        assert!(matches!(tc.phase(), Phase::InfosReqPending { .. }));
        assert_eq!(net.opened().len(), 2);
    }
}
