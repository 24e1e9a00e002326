//! Radio parameter set: spreading factor and bandwidth packed into one byte.
//!
//! ```text
//!  bit 5   | bits 4..3 | bits 2..0
//!  DN-only | BW        | SF (SF12=0 .. SF7=5, FSK=6)
//! ```

use libm::ceil;
use tracing::trace;

pub const SF12:u8 = 0;
pub const SF11:u8 = 1;
pub const SF10:u8 = 2;
pub const SF9:u8 =  3;
pub const SF8:u8 =  4;
pub const SF7:u8 =  5;
pub const FSK:u8 =  6;
pub const SFNIL:u8 = 7;

pub const BW125:u8 = 0;
pub const BW250:u8 = 1;
pub const BW500:u8 = 2;
pub const BWNIL:u8 = 3;

pub const RPS_DNONLY:u8 =   0x20;
pub const RPS_ILLEGAL:u8 =  0xFF;
pub const RPS_FSK:u8 =      FSK;

pub const FSK_BAUD:u32 =        50_000;
pub const FSK_PREAMBLE:u16 =    5;
pub const DFLT_PREAMBLE:u16 =   8;
pub const BCN_PREAMBLE:u16 =    10;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rps(pub u8);

impl Rps {
    pub const ILLEGAL: Rps = Rps(RPS_ILLEGAL);

    pub fn make(sf: u8, bw: u8) -> Rps {
        Rps((sf & 0x7) | ((bw & 0x3) << 3))
    }

    pub fn sf(self) -> u8 {
        self.0 & 0x7
    }

    pub fn bw(self) -> u8 {
        (self.0 >> 3) & 0x3
    }

    pub fn is_illegal(self) -> bool {
        self.0 == RPS_ILLEGAL
    }

    pub fn is_fsk(self) -> bool {
        !self.is_illegal() && self.sf() == FSK
    }

    pub fn is_dnonly(self) -> bool {
        !self.is_illegal() && self.0 & RPS_DNONLY != 0
    }

    /// Spreading factor as the usual number 7..12.
    pub fn sf_num(self) -> u32 {
        12 - self.sf() as u32
    }

    pub fn bw_hz(self) -> u32 {
        match self.bw() {
            BW125 => 125_000,
            BW250 => 250_000,
            BW500 => 500_000,
            _ => 0,
        }
    }

    /// Builds an rps from the `[sf, bw_khz, dnonly]` triple of a router_config DR table.
    pub fn from_dr_def(sf: i32, bw_khz: i32, dnonly: bool) -> Rps {
        let bw = match bw_khz {
            125 => BW125,
            250 => BW250,
            500 => BW500,
            _ => BWNIL,
        };
        let rps = match sf {
            0 => Rps(RPS_FSK),
            7..=12 if bw != BWNIL => Rps::make((12 - sf) as u8, bw),
            _ => return Rps::ILLEGAL,
        };
        if dnonly {
            Rps(rps.0 | RPS_DNONLY)
        } else {
            rps
        }
    }
}

impl std::fmt::Display for Rps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_illegal() {
            write!(f, "ILLEGAL")
        } else if self.is_fsk() {
            write!(f, "FSK")
        } else {
            write!(f, "SF{}/BW{}", self.sf_num(), self.bw_hz() / 1000)
        }
    }
}

/// Air time in microseconds of a frame of `plen` bytes.
/// Explicit header, coding rate 4/5, low datarate optimisation for SF11/SF12 at 125kHz.
pub fn airtime(rps: Rps, plen: usize, addcrc: bool, preamble: u16) -> i64 {
    if rps.is_illegal() {
        return 0;
    }
    if rps.is_fsk() {
        /* PREAMBLE + SYNC_WORD(3) + PKT_LEN(1) + PAYLOAD + CRC(2) */
        let nbytes = preamble.max(FSK_PREAMBLE) as i64 + 3 + 1 + plen as i64 + 2;
        return nbytes * 8 * 1_000_000 / FSK_BAUD as i64;
    }
    let sf = rps.sf_num() as i64;
    let bw = rps.bw_hz() as i64;
    if bw == 0 {
        return 0;
    }
    let h:i64 = 0;                                         /* explicit header */
    let de:i64 = if sf >= 11 && bw == 125_000 { 1 } else { 0 };
    let cr:i64 = 1;                                        /* 4/5 */
    let crc:i64 = if addcrc { 1 } else { 0 };

    let num = 8 * plen as i64 - 4 * sf + 28 + 16 * crc - 20 * h;
    let den = 4 * (sf - 2 * de);
    let npay = (ceil(num as f64 / den as f64) as i64 * (cr + 4)).max(0);
    let nsym = 8 + npay;

    /* T_sym = 2^SF / BW, kept in us scaled by 4 to keep the 0.25 of the preamble exact */
    let tsym_x4 = (1i64 << sf) * 4_000_000 / bw;
    let toa = ((preamble as i64 * 4 + 17 + nsym * 4) * tsym_x4) / 16;
    trace!("INFO: LoRa frame ToA: {} us ({} rps={} plen={})", toa, nsym, rps, plen);
    toa
}

/// Uplinks always carry a CRC and the default preamble.
pub fn up_airtime(rps: Rps, plen: usize) -> i64 {
    airtime(rps, plen, true, DFLT_PREAMBLE)
}
