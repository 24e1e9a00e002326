//! Station configuration: `station.conf`, environment overrides, exit codes.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::eui::{eui_serde, parse_eui};
use super::log::parse_level;
use super::rt::{ms, sec, Ustime};
use super::s2e::{S2Conf, TxTiming};

pub const CONF_FILE:&str =      "station.conf";
pub const PID_FILE:&str =       "station.pid";

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok =        0,
    NoOp =      6,      /* another instance is running */
    Generic =   30,
    NoConfig =  32,
    Radio =     33,
    Creds =     34,
    Io =        35,
    Max =       40,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Unrecoverable condition. The embedding binary exits with `code`.
#[derive(Debug, Error)]
#[error("fatal ({code:?}): {msg}")]
pub struct Fatal {
    pub code: ExitCode,
    pub msg: String,
}

impl Fatal {
    pub fn new(code: ExitCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into() }
    }

    pub fn exit_code(&self) -> i32 {
        self.code.code()
    }
}

fn dflt_log_level() -> String { "INFO".to_string() }
fn dflt_tc_timeout() -> u32 { 60 }
fn dflt_tx_aim_gap() -> u32 { 20 }
fn dflt_tx_min_gap() -> u32 { 10 }
fn dflt_tx_max_ahead() -> u32 { 600 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConf {
    #[serde(default, with = "eui_serde")]
    pub routerid: u64,
    #[serde(default, with = "eui_serde")]
    pub euiprefix: u64,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "dflt_log_level")]
    pub log_level: String,
    #[serde(default = "dflt_tc_timeout")]
    pub tc_timeout: u32,            /* seconds */
    #[serde(default = "dflt_tx_aim_gap")]
    pub tx_aim_gap: u32,            /* ms */
    #[serde(default = "dflt_tx_min_gap")]
    pub tx_min_gap: u32,            /* ms */
    #[serde(default = "dflt_tx_max_ahead")]
    pub tx_max_ahead: u32,          /* seconds */
    #[serde(default)]
    pub nocca: bool,
    #[serde(default)]
    pub nodc: bool,
    #[serde(default)]
    pub nodwell: bool,
    #[serde(default)]
    pub pps: Option<String>,        /* "gps" or "fuzzy" */
    #[serde(default)]
    pub gps_position: Option<[f64; 2]>,

    /* environment only */
    #[serde(skip)]
    pub home: PathBuf,
    #[serde(skip)]
    pub tempdir: PathBuf,
    #[serde(skip)]
    pub radio_init: Option<String>,
    #[serde(skip)]
    pub tls_dbg: u8,
}

impl Default for StationConf {
    fn default() -> Self {
        Self {
            routerid: 0,
            euiprefix: 0,
            log_file: None,
            log_level: dflt_log_level(),
            tc_timeout: dflt_tc_timeout(),
            tx_aim_gap: dflt_tx_aim_gap(),
            tx_min_gap: dflt_tx_min_gap(),
            tx_max_ahead: dflt_tx_max_ahead(),
            nocca: false,
            nodc: false,
            nodwell: false,
            pps: None,
            gps_position: None,
            home: PathBuf::from("."),
            tempdir: PathBuf::from("/tmp"),
            radio_init: None,
            tls_dbg: 0,
        }
    }
}

impl StationConf {
    /// Parses the `station_conf` object of a `station.conf` document.
    pub fn from_json(text: &str) -> Result<StationConf> {
        let mut v: Value = serde_json::from_str(text).context("station.conf is not JSON")?;
        let sc = match v.get_mut("station_conf") {
            Some(sc) => sc.take(),
            None => Value::Object(Default::default()),
        };
        let conf: StationConf = serde_json::from_value(sc).context("bad station_conf")?;
        conf.validate()?;
        Ok(conf)
    }

    /// Reads `station.conf` from `home`. A missing file gives the defaults.
    pub fn load(home: &Path) -> Result<StationConf> {
        let p = home.join(CONF_FILE);
        let mut conf = match fs::read_to_string(&p) {
            Ok(text) => StationConf::from_json(&text).with_context(|| format!("{}", p.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No {} - using defaults", p.display());
                StationConf::default()
            }
            Err(e) => return Err(anyhow!("reading {}: {}", p.display(), e)),
        };
        conf.home = home.to_path_buf();
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if parse_level(&self.log_level).is_none() {
            bail!("unknown log level: {}", self.log_level);
        }
        if let Some(p) = &self.pps {
            if p != "gps" && p != "fuzzy" {
                bail!("pps must be \"gps\" or \"fuzzy\", not {:?}", p);
            }
        }
        if let Some([lat, lon]) = self.gps_position {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                bail!("gps_position out of range: [{}, {}]", lat, lon);
            }
        }
        if self.tx_min_gap > self.tx_aim_gap {
            bail!("tx_min_gap ({}ms) exceeds tx_aim_gap ({}ms)", self.tx_min_gap, self.tx_aim_gap);
        }
        Ok(())
    }

    /// Applies `STATION_*` overrides looked up through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STATION_HOME") {
            self.home = PathBuf::from(v);
        }
        if let Some(v) = lookup("STATION_TEMPDIR") {
            self.tempdir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STATION_EUIPREFIX") {
            self.euiprefix = parse_eui(&v).context("STATION_EUIPREFIX")?;
        }
        if let Some(v) = lookup("STATION_LOGLEVEL") {
            if parse_level(&v).is_none() {
                bail!("STATION_LOGLEVEL: unknown level {}", v);
            }
            self.log_level = v;
        }
        if let Some(v) = lookup("STATION_LOGFILE") {
            self.log_file = Some(v);
        }
        if let Some(v) = lookup("STATION_RADIOINIT") {
            self.radio_init = Some(v);
        }
        if let Some(v) = lookup("STATION_TLSDBG") {
            self.tls_dbg = v.trim().parse().map_err(|e| anyhow!("STATION_TLSDBG: {}", e))?;
        }
        debug!("Configuration after environment: {:?}", self);
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    /// The router EUI. Without an explicit `routerid` it is derived from the
    /// MAC address: ORed into `euiprefix` if one is set, else expanded EUI-48 style.
    pub fn router_eui(&self, mac: u64) -> u64 {
        let mac = mac & 0xFFFF_FFFF_FFFF;
        if self.routerid != 0 {
            self.routerid
        } else if self.euiprefix != 0 {
            self.euiprefix | mac
        } else {
            ((mac >> 24) << 40) | (0xFFFE << 24) | (mac & 0xFF_FFFF)
        }
    }

    pub fn tc_timeout(&self) -> Ustime {
        sec(self.tc_timeout as i64)
    }

    pub fn pps_mode(&self) -> bool {
        self.pps.is_some()
    }

    pub fn s2conf(&self) -> S2Conf {
        S2Conf {
            timing: TxTiming {
                aim_gap: ms(self.tx_aim_gap as i64),
                min_gap: ms(self.tx_min_gap as i64),
                max_ahead: sec(self.tx_max_ahead as i64),
            },
            nocca: self.nocca,
            nodc: self.nodc,
            nodwell: self.nodwell,
            gps_position: self.gps_position.map(|[lat, lon]| (lat, lon)),
            ..S2Conf::default()
        }
    }
}

/// Pid file in the home directory; held while the station runs.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(dir: &Path) -> Result<InstanceLock, Fatal> {
        let path = dir.join(PID_FILE);
        let mut f = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Fatal::new(ExitCode::NoOp, format!("another station owns {}", path.display())));
            }
            Err(e) => return Err(Fatal::new(ExitCode::Io, format!("{}: {}", path.display(), e))),
        };
        writeln!(f, "{}", std::process::id())
            .map_err(|e| Fatal::new(ExitCode::Io, format!("{}: {}", path.display(), e)))?;
        Ok(InstanceLock { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
