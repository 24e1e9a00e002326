use std::cell::Cell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Host time in microseconds.
pub type Ustime = i64;

pub const fn ms(v: i64) -> Ustime { v * 1_000 }
pub const fn sec(v: i64) -> Ustime { v * 1_000_000 }

/// Monotonic host clock plus the UTC wall clock it is compared against.
pub trait Clock {
    /// Monotone non-decreasing microseconds since an arbitrary origin.
    fn now(&self) -> Ustime;
    /// UTC microseconds since the UNIX epoch.
    fn utc_now(&self) -> Ustime;
}

#[derive(Debug)]
pub struct SysClock {
    origin: Instant,
    last: Cell<Ustime>,
}

impl SysClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: Cell::new(0),
        }
    }
}

impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SysClock {
    fn now(&self) -> Ustime {
        let t = self.origin.elapsed().as_micros() as Ustime;
        /* never report less than before */
        let t = t.max(self.last.get());
        self.last.set(t);
        t
    }

    fn utc_now(&self) -> Ustime {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as Ustime,
            Err(_) => 0,
        }
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Ustime>>,
    utc_base: Ustime,
}

impl ManualClock {
    pub fn new(start: Ustime, utc_base: Ustime) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
            utc_base,
        }
    }

    pub fn advance(&self, d: Ustime) {
        if d > 0 {
            self.now.set(self.now.get() + d);
        }
    }

    /// Moves the clock forward to `t`. Earlier values are ignored.
    pub fn set(&self, t: Ustime) {
        if t > self.now.get() {
            self.now.set(t);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ustime {
        self.now.get()
    }

    fn utc_now(&self) -> Ustime {
        self.utc_base + self.now.get()
    }
}
