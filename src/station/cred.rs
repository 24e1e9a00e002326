//! Credential files of the CUPS and TC connections.
//!
//! Each category has four sets (`reg`, `bak`, `boot`, `temp`) of four files
//! (`trust`, `crt`, `key`, `uri`) in the station home directory, e.g.
//! `tc.uri`, `tc-bak.key`, `cups-temp.trust`. Updates and backups go through
//! marker files so a crash at any point leaves either the old or the new
//! quadruple in the `reg` slot after `roll_forward`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cat {
    Cups,
    Tc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredSet {
    #[default]
    Reg,
    Bak,
    Boot,
    Temp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext {
    Trust,
    Crt,
    Key,
    Uri,
}

pub const ALL_EXTS:[Ext; 4] = [Ext::Trust, Ext::Crt, Ext::Key, Ext::Uri];

impl Cat {
    fn name(self) -> &'static str {
        match self {
            Cat::Cups => "cups",
            Cat::Tc => "tc",
        }
    }

    fn idx(self) -> usize {
        match self {
            Cat::Cups => 0,
            Cat::Tc => 1,
        }
    }
}

impl CredSet {
    fn suffix(self) -> &'static str {
        match self {
            CredSet::Reg => "",
            CredSet::Bak => "-bak",
            CredSet::Boot => "-boot",
            CredSet::Temp => "-temp",
        }
    }

    /// Failover order after a connect failure: reg, bak, boot, then reg again.
    pub fn next(self) -> CredSet {
        match self {
            CredSet::Reg => CredSet::Bak,
            CredSet::Bak => CredSet::Boot,
            _ => CredSet::Reg,
        }
    }
}

impl Ext {
    fn name(self) -> &'static str {
        match self {
            Ext::Trust => "trust",
            Ext::Crt => "crt",
            Ext::Key => "key",
            Ext::Uri => "uri",
        }
    }
}

/// New credentials for one category as delivered by CUPS.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CredUpdate {
    pub uri: Option<String>,
    pub creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredKey {
    None,
    Der(Vec<u8>),
    Token(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredBlob {
    pub trust: Vec<u8>,
    pub crt: Option<Vec<u8>>,
    pub key: CredKey,
}

const ASN1_SEQUENCE:u8 = 0x30;

/* total length (header + content) of the DER element at the start of `b` */
fn asn1_total_len(b: &[u8]) -> Option<usize> {
    if b.len() < 2 || b[0] != ASN1_SEQUENCE {
        return None;
    }
    let l0 = b[1] as usize;
    let (hdr, len) = if l0 < 0x80 {
        (2, l0)
    } else {
        let n = l0 & 0x7F;
        if n == 0 || n > 4 || b.len() < 2 + n {
            return None;
        }
        let len = b[2..2 + n].iter().fold(0usize, |a, x| (a << 8) | *x as usize);
        (2 + n, len)
    };
    let total = hdr.checked_add(len)?;
    if total > b.len() {
        return None;
    }
    Some(total)
}

/// Splits a credential blob into trust, optional certificate and key or token.
/// A zero byte stands for an absent certificate or key. A key that is not a
/// SEQUENCE is a bearer token and spans the rest of the blob.
pub fn parse_cred_blob(b: &[u8]) -> Result<CredBlob, Error> {
    let n = asn1_total_len(b).ok_or_else(|| Error::Cred("trust is not a DER sequence".into()))?;
    let trust = b[..n].to_vec();
    let rest = &b[n..];

    let (crt, rest) = match rest.first() {
        None => (None, rest),
        Some(0) => (None, &rest[1..]),
        Some(_) => {
            let n = asn1_total_len(rest).ok_or_else(|| Error::Cred("certificate is not a DER sequence".into()))?;
            (Some(rest[..n].to_vec()), &rest[n..])
        }
    };

    let key = match rest {
        [] | [0] => CredKey::None,
        r => match asn1_total_len(r) {
            Some(n) if n == r.len() => CredKey::Der(r.to_vec()),
            _ => CredKey::Token(r.to_vec()),
        },
    };
    Ok(CredBlob { trust, crt, key })
}

#[derive(Debug)]
pub struct CredStore {
    home: PathBuf,
    backup_done: [bool; 2],
    updating: Option<(Cat, bool)>,
}

impl CredStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            backup_done: [false; 2],
            updating: None,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn path(&self, cat: Cat, set: CredSet, ext: Ext) -> PathBuf {
        self.home.join(format!("{}{}.{}", cat.name(), set.suffix(), ext.name()))
    }

    fn marker(&self, cat: Cat, name: &str) -> PathBuf {
        self.home.join(format!("{}{}", cat.name(), name))
    }

    fn upd_marker(&self, cat: Cat) -> PathBuf {
        self.marker(cat, "-temp.upd")
    }

    fn cpy_marker(&self, cat: Cat) -> PathBuf {
        self.marker(cat, "-temp.cpy")
    }

    fn done_marker(&self, cat: Cat) -> PathBuf {
        self.marker(cat, "-bak.done")
    }

    /// File content, `None` if the file is missing or empty.
    pub fn read(&self, cat: Cat, set: CredSet, ext: Ext) -> Option<Vec<u8>> {
        match fs::read(self.path(cat, set, ext)) {
            Ok(d) if !d.is_empty() => Some(d),
            _ => None,
        }
    }

    pub fn uri(&self, cat: Cat, set: CredSet) -> Option<String> {
        let d = self.read(cat, set, Ext::Uri)?;
        let s = String::from_utf8_lossy(&d).trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    pub fn backup_done(&self, cat: Cat) -> bool {
        self.backup_done[cat.idx()]
    }

    pub fn is_updating(&self) -> bool {
        self.updating.is_some()
    }

    fn set_marker(&self, p: &Path) -> io::Result<()> {
        let f = File::create(p)?;
        f.sync_all()
    }

    fn clear_marker(&self, p: &Path) -> io::Result<()> {
        match fs::remove_file(p) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /* removes every file of the set it can, reports the first failure */
    fn remove_set(&self, cat: Cat, set: CredSet) -> io::Result<()> {
        let mut res = Ok(());
        for ext in ALL_EXTS {
            if let Err(e) = self.clear_marker(&self.path(cat, set, ext)) {
                res = res.and(Err(e));
            }
        }
        res
    }

    fn drop_temp_set(&self, cat: Cat) {
        if let Err(e) = self.remove_set(cat, CredSet::Temp) {
            warn!("Cleaning up temp credentials of {} failed: {}", cat.name(), e);
        }
    }

    /// Starts collecting new credentials for `cat` in the temp set.
    pub fn begin_update(&mut self, cat: Cat) -> Result<(), Error> {
        self.remove_set(cat, CredSet::Temp).map_err(|e| Error::Cred(format!("clearing temp set: {}", e)))?;
        self.updating = Some((cat, false));
        debug!("Credential update for {} started", cat.name());
        Ok(())
    }

    /// Writes one element of the pending update. `None` leaves an empty file.
    /// A failed write poisons the update, `commit` then abandons it.
    pub fn write(&mut self, cat: Cat, ext: Ext, data: Option<&[u8]>) -> Result<(), Error> {
        match self.updating {
            Some((c, _)) if c == cat => {}
            _ => return Err(Error::Cred(format!("no update in progress for {}", cat.name()))),
        }
        let p = self.path(cat, CredSet::Temp, ext);
        let res = File::create(&p).and_then(|mut f| {
            f.write_all(data.unwrap_or(&[]))?;
            f.sync_all()
        });
        if let Err(e) = res {
            warn!("Writing {} failed: {}", p.display(), e);
            self.updating = Some((cat, true));
            return Err(Error::Cred(format!("writing {}: {}", p.display(), e)));
        }
        Ok(())
    }

    /// Stages a CUPS update of one category: URI plus trust, certificate and key or token.
    pub fn stage(&mut self, cat: Cat, upd: &CredUpdate) -> Result<(), Error> {
        self.begin_update(cat)?;
        let old_uri = self.uri(cat, CredSet::Reg);
        let uri = upd.uri.clone().or(old_uri);
        self.write(cat, Ext::Uri, uri.as_deref().map(str::as_bytes))?;
        match &upd.creds {
            Some(b) => {
                let blob = parse_cred_blob(b)?;
                self.write(cat, Ext::Trust, Some(blob.trust.as_slice()))?;
                self.write(cat, Ext::Crt, blob.crt.as_deref())?;
                match &blob.key {
                    CredKey::None => self.write(cat, Ext::Key, None)?,
                    CredKey::Der(k) | CredKey::Token(k) => self.write(cat, Ext::Key, Some(k.as_slice()))?,
                }
            }
            None => {
                for ext in [Ext::Trust, Ext::Crt, Ext::Key] {
                    let cur = self.read(cat, CredSet::Reg, ext);
                    self.write(cat, ext, cur.as_deref())?;
                }
            }
        }
        Ok(())
    }

    /// Drops a pending update, the reg set stays as it is.
    pub fn abandon_update(&mut self, cat: Cat) {
        if matches!(self.updating, Some((c, _)) if c == cat) {
            warn!("Credential update for {} abandoned", cat.name());
            self.updating = None;
            self.drop_temp_set(cat);
        }
    }

    /// Marks the pending update as complete. From here on a restart rolls it forward.
    pub fn mark_update(&mut self, cat: Cat) -> Result<(), Error> {
        match self.updating {
            Some((c, false)) if c == cat => {}
            Some((c, true)) if c == cat => {
                warn!("Credential update for {} abandoned after write errors", cat.name());
                self.updating = None;
                self.drop_temp_set(cat);
                return Err(Error::Cred("update abandoned".into()));
            }
            _ => return Err(Error::Cred(format!("no update in progress for {}", cat.name()))),
        }
        self.set_marker(&self.upd_marker(cat)).map_err(|e| Error::Cred(format!("marking update: {}", e)))
    }

    /// Moves the marked temp set into place.
    pub fn commit(&mut self, cat: Cat) -> Result<(), Error> {
        self.mark_update(cat)?;
        self.updating = None;
        self.apply_update(cat).map_err(|e| Error::Cred(format!("applying update: {}", e)))?;
        info!("Credentials for {} updated", cat.name());
        Ok(())
    }

    fn apply_update(&mut self, cat: Cat) -> io::Result<()> {
        for ext in ALL_EXTS {
            let from = self.path(cat, CredSet::Temp, ext);
            if from.exists() {
                fs::rename(&from, self.path(cat, CredSet::Reg, ext))?;
            }
        }
        self.clear_marker(&self.done_marker(cat))?;
        self.backup_done[cat.idx()] = false;
        self.clear_marker(&self.upd_marker(cat))
    }

    /// Copies the reg set to bak once per set of credentials.
    /// Returns false if the copy had been made already.
    pub fn backup(&mut self, cat: Cat) -> Result<bool, Error> {
        if self.backup_done[cat.idx()] {
            return Ok(false);
        }
        self.do_backup(cat).map_err(|e| Error::Cred(format!("backup of {}: {}", cat.name(), e)))?;
        info!("Credentials for {} backed up", cat.name());
        Ok(true)
    }

    fn do_backup(&mut self, cat: Cat) -> io::Result<()> {
        self.set_marker(&self.cpy_marker(cat))?;
        self.remove_set(cat, CredSet::Bak)?;
        for ext in ALL_EXTS {
            let from = self.path(cat, CredSet::Reg, ext);
            if from.exists() {
                fs::copy(&from, self.path(cat, CredSet::Bak, ext))?;
            }
        }
        self.set_marker(&self.done_marker(cat))?;
        self.backup_done[cat.idx()] = true;
        self.clear_marker(&self.cpy_marker(cat))
    }

    /// Completes transactions interrupted by a crash. Run once at startup.
    pub fn roll_forward(&mut self) -> Result<(), Error> {
        for cat in [Cat::Cups, Cat::Tc] {
            let map = move |e: io::Error| Error::Cred(format!("roll forward of {}: {}", cat.name(), e));
            if self.upd_marker(cat).exists() {
                info!("Completing interrupted credential update for {}", cat.name());
                self.apply_update(cat).map_err(map)?;
            }
            if self.cpy_marker(cat).exists() {
                info!("Redoing interrupted credential backup for {}", cat.name());
                self.do_backup(cat).map_err(map)?;
            }
            if self.done_marker(cat).exists() {
                self.backup_done[cat.idx()] = true;
            }
        }
        Ok(())
    }
}
