
pub mod error;
pub mod rt;
pub mod timer;
pub mod xtime;
pub mod eui;
pub mod rps;
pub mod txq;
pub mod rxq;
pub mod lora;
pub mod timesync;
pub mod lnssync;
pub mod region;
pub mod radio;
pub mod s2e;
mod s2e_tx;
pub mod ws;
pub mod tc;
pub mod cred;
pub mod cups;
pub mod config;
pub mod log;
pub mod sys;
#[cfg(test)]
mod testutil;

use lora::Filters;
use radio::Radio;
use rt::Ustime;
use timer::TimerQueue;
use timesync::Timesyncs;

pub use error::Error;
pub use sys::Station;


/* transmitter / receiver capacity */
pub const MAX_TXUNITS:usize =       4;           /* independent TX paths of the concentrator */
pub const MAX_TXJOBS:usize =        128;         /* slots in the TX job pool */
pub const TXDATA_SIZE:usize =       16*1024;     /* packed downlink payload buffer */
pub const MAX_RXJOBS:usize =        64;          /* slots in the RX FIFO */
pub const RXDATA_SIZE:usize =       10*1024;     /* uplink payload bytes */
pub const MAX_RXFRAME_LEN:usize =   255;
pub const MAX_TXFRAME_LEN:usize =   255;
pub const MAX_DNCHNLS:usize =       48;          /* downlink channels tracked for duty cycle */
pub const DR_CNT:usize =            16;

/* downlink timing */
pub const TX_MIN_GAP:Ustime =       rt::ms(10);  /* a job must reach the radio at least this early */
pub const TX_AIM_GAP:Ustime =       rt::ms(20);  /* we aim to hand a job to the radio this early */
pub const TX_MAX_AHEAD:Ustime =     rt::sec(600);
pub const TXCHECK_FUDGE:Ustime =    rt::ms(5);
pub const CCA_BACKOFF:Ustime =      rt::ms(100);
pub const CLASS_C_BACKOFF_BY:Ustime = rt::ms(100);
pub const CLASS_C_BACKOFF_MAX:u8 =  10;

/* priority penalties applied when a job is moved to an alternative */
pub const PRIO_PENALTY_ALTTXTIME:u8 =   10;
pub const PRIO_PENALTY_ALTANTENNA:u8 =  10;
pub const PRIO_PENALTY_CCA:u8 =         8;


/// Every timer of the station lives in one queue and is identified by what it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    TxUnit(u8),
    RadioSync(u8),
    Tc,
    LnsSync,
    Beacon,
    Cups,
}

/// State shared by the protocol components. Built fresh for every event-loop callback.
pub struct Env<'a> {
    pub now: Ustime,
    pub timers: &'a mut TimerQueue<TimerKind>,
    pub ts: &'a mut Timesyncs,
    pub radio: &'a mut dyn Radio,
    pub filters: &'a mut Filters,
}
