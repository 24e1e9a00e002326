//! LoRaWAN frame classification and beacon construction.

use serde_json::{Map, Value};

use super::error::Error;
use super::eui::{fmt_eui, hex_upper};

/* MHDR frame types (bits 7..5) */
pub const FRMTYPE_JREQ:u8 =     0x00;
pub const FRMTYPE_JACC:u8 =     0x20;
pub const FRMTYPE_DAUP:u8 =     0x40;
pub const FRMTYPE_DADN:u8 =     0x60;
pub const FRMTYPE_DCUP:u8 =     0x80;
pub const FRMTYPE_DCDN:u8 =     0xA0;
pub const FRMTYPE_REJOIN:u8 =   0xC0;
pub const FRMTYPE_PROP:u8 =     0xE0;

pub const MHDR_FTYPE:u8 =       0xE0;
pub const MHDR_RFU:u8 =         0x1C;
pub const MHDR_MAJOR:u8 =       0x03;
pub const MAJOR_V1:u8 =         0x00;

/* Join request field offsets */
pub const OFF_JOINEUI:usize =   1;
pub const OFF_DEVEUI:usize =    9;
pub const OFF_DEVNONCE:usize =  17;
pub const OFF_JR_MIC:usize =    19;
pub const OFF_JR_LEN:usize =    23;

/* Data frame field offsets */
pub const OFF_DEVADDR:usize =   1;
pub const OFF_FCTRL:usize =     5;
pub const OFF_FCNT:usize =      6;
pub const OFF_FOPTS:usize =     8;
pub const MIN_DATA_LEN:usize =  12;
pub const MIC_LEN:usize =       4;


/// JoinEUI allow-list and NetID bitmap applied to every parsed uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct Filters {
    pub joineui: Vec<(u64, u64)>,
    pub netid: [u32; 4],
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            joineui: Vec::new(),
            netid: [0xFFFF_FFFF; 4],
        }
    }
}

impl Filters {
    /// Restricts data frames to the listed NetIDs. An empty list allows everything.
    pub fn set_netids(&mut self, netids: &[u32]) {
        if netids.is_empty() {
            self.netid = [0xFFFF_FFFF; 4];
            return;
        }
        self.netid = [0; 4];
        for n in netids {
            let n = n & 0x7F;
            self.netid[(n >> 5) as usize] |= 1 << (n & 31);
        }
    }

    pub fn netid_allowed(&self, netid: u32) -> bool {
        let n = netid & 0x7F;
        self.netid[(n >> 5) as usize] & (1 << (n & 31)) != 0
    }

    pub fn joineui_allowed(&self, joineui: u64) -> bool {
        self.joineui.is_empty() || self.joineui.iter().any(|(lo, hi)| *lo <= joineui && joineui <= *hi)
    }
}

fn rd_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn rd_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn rd_u64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(a)
}

/// Classifies a LoRaWAN PHY payload and appends its fields to `out`.
/// `lbuf` receives a one-line summary for the log.
pub fn parse_frame(out: &mut Map<String, Value>, frame: &[u8], filters: &Filters, lbuf: &mut String) -> Result<(), Error> {
    if frame.is_empty() {
        return Err(Error::BadFrame("empty frame"));
    }
    let mhdr = frame[0];
    let ftype = mhdr & MHDR_FTYPE;
    if mhdr & (MHDR_RFU | MHDR_MAJOR) != MAJOR_V1 {
        return Err(Error::NotLorawan);
    }
    let len = frame.len();

    match ftype {
        FRMTYPE_JACC | FRMTYPE_PROP => {
            let msgtype = if ftype == FRMTYPE_JACC { "jacc" } else { "propdf" };
            out.insert("msgtype".into(), msgtype.into());
            out.insert("FRMPayload".into(), hex_upper(frame).into());
            *lbuf = format!("{} len={}", msgtype, len);
            Ok(())
        }
        FRMTYPE_JREQ | FRMTYPE_REJOIN => {
            if len != OFF_JR_LEN {
                return Err(Error::BadFrame("join request length"));
            }
            let joineui = rd_u64(frame, OFF_JOINEUI);
            let deveui = rd_u64(frame, OFF_DEVEUI);
            let devnonce = rd_u16(frame, OFF_DEVNONCE);
            let mic = rd_u32(frame, OFF_JR_MIC) as i32;
            if !filters.joineui_allowed(joineui) {
                *lbuf = format!("Join EUI {} filtered", fmt_eui(joineui));
                return Err(Error::Filtered("JoinEUI"));
            }
            let msgtype = if ftype == FRMTYPE_JREQ { "jreq" } else { "rejoin" };
            out.insert("msgtype".into(), msgtype.into());
            out.insert("MHdr".into(), mhdr.into());
            out.insert("JoinEui".into(), fmt_eui(joineui).into());
            out.insert("DevEui".into(), fmt_eui(deveui).into());
            out.insert("DevNonce".into(), devnonce.into());
            out.insert("MIC".into(), mic.into());
            *lbuf = format!(
                "{} MHdr={:02X} JoinEui={} DevEui={} DevNonce={} MIC={}",
                msgtype.to_uppercase(), mhdr, fmt_eui(joineui), fmt_eui(deveui), devnonce, mic
            );
            Ok(())
        }
        _ => {
            /* DAUP DADN DCUP DCDN */
            if len < MIN_DATA_LEN {
                return Err(Error::BadFrame("data frame too short"));
            }
            let devaddr = rd_u32(frame, OFF_DEVADDR);
            let fctrl = frame[OFF_FCTRL];
            let fcnt = rd_u16(frame, OFF_FCNT);
            let foptslen = (fctrl & 0x0F) as usize;
            let portoff = OFF_FOPTS + foptslen;
            if portoff > len - MIC_LEN {
                return Err(Error::BadFrame("FOpts exceed frame"));
            }
            let netid = devaddr >> 25;
            if !filters.netid_allowed(netid) {
                *lbuf = format!("DevAddr={:08X} NetID={} filtered", devaddr, netid);
                return Err(Error::Filtered("NetID"));
            }
            let (port, payload): (i32, &[u8]) = if portoff == len - MIC_LEN {
                (-1, &frame[..0])
            } else {
                (frame[portoff] as i32, &frame[portoff + 1..len - MIC_LEN])
            };
            let mic = rd_u32(frame, len - MIC_LEN) as i32;
            let up = ftype == FRMTYPE_DAUP || ftype == FRMTYPE_DCUP;
            let msgtype = if up { "updf" } else { "dndf" };
            out.insert("msgtype".into(), msgtype.into());
            out.insert("MHdr".into(), mhdr.into());
            out.insert("DevAddr".into(), (devaddr as i32).into());
            out.insert("FCtrl".into(), fctrl.into());
            out.insert("FCnt".into(), fcnt.into());
            out.insert("FOpts".into(), hex_upper(&frame[OFF_FOPTS..portoff]).into());
            out.insert("FPort".into(), port.into());
            out.insert("FRMPayload".into(), hex_upper(payload).into());
            out.insert("MIC".into(), mic.into());
            *lbuf = format!(
                "{} mhdr={:02X} DevAddr={:08X} FCtrl={:02X} FCnt={} FOpts=[{}] {} mic={} ({} bytes)",
                if up { "DU" } else { "DD" },
                mhdr, devaddr, fctrl, fcnt, hex_upper(&frame[OFF_FOPTS..portoff]),
                if port < 0 { "-".to_string() } else { format!("{} {}", port, hex_upper(payload)) },
                mic, len
            );
            Ok(())
        }
    }
}


/// CRC-16/CCITT, polynomial 0x1021, initial value 0.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc:u16 = 0;
    for b in data {
        crc ^= (*b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/* degrees to 24 bit signed fixed point: scaled to 32 bits, then the low byte dropped */
fn coord24(deg: f64, scale: f64) -> [u8; 3] {
    let v = ((deg / scale * (1u64 << 31) as f64) as i32) >> 8;
    let b = v.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// Builds a class B beacon into `pdu`.
/// `layout` holds the offsets of the time field and of the info descriptor plus the total length.
pub fn make_beacon(layout: &[u8; 3], epoch_secs: u32, infodesc: u8, lat: f64, lon: f64, pdu: &mut [u8]) -> Result<(), Error> {
    let time_off = layout[0] as usize;
    let info_off = layout[1] as usize;
    let total = layout[2] as usize;
    if pdu.len() < total || info_off < 2 || info_off + 7 + 2 > total || time_off + 4 > info_off - 2 {
        return Err(Error::BadFrame("beacon layout"));
    }
    let pdu = &mut pdu[..total];
    pdu.fill(0);
    pdu[time_off..time_off + 4].copy_from_slice(&epoch_secs.to_le_bytes());
    pdu[info_off] = infodesc;
    pdu[info_off + 1..info_off + 4].copy_from_slice(&coord24(lon, 180.0));
    pdu[info_off + 4..info_off + 7].copy_from_slice(&coord24(lat, 90.0));
    let crc1 = crc16_ccitt(&pdu[..info_off - 2]);
    pdu[info_off - 2..info_off].copy_from_slice(&crc1.to_le_bytes());
    let crc2 = crc16_ccitt(&pdu[info_off..total - 2]);
    pdu[total - 2..total].copy_from_slice(&crc2.to_le_bytes());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &[u8], f: &Filters) -> Result<Map<String, Value>, Error> {
        let mut m = Map::new();
        let mut l = String::new();
        parse_frame(&mut m, frame, f, &mut l)?;
        Ok(m)
    }

    #[test]
    fn rejects_wrong_major() {
        let f = Filters::default();
        assert_eq!(parse(&[0x41, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], &f), Err(Error::NotLorawan));
        assert_eq!(parse(&[0x44; 12], &f), Err(Error::NotLorawan));
        assert_eq!(parse(&[0x40; 11], &f), Err(Error::BadFrame("data frame too short")));
        assert!(parse(&[0x00; 22], &f).is_err());
    }

    #[test]
    fn data_without_port() {
        let f = Filters::default();
        let m = parse(&[0x80, 1, 2, 3, 4, 0x00, 5, 0, 0xA0, 0xA1, 0xA2, 0xA3], &f).unwrap();
        assert_eq!(m["msgtype"], "updf");
        assert_eq!(m["FPort"], -1);
        assert_eq!(m["FRMPayload"], "");
        assert_eq!(m["FOpts"], "");
        /* FOpts running into the MIC */
        assert!(parse(&[0x40, 1, 2, 3, 4, 0x01, 5, 0, 0xA0, 0xA1, 0xA2], &f).is_err());
        assert!(parse(&[0x40, 1, 2, 3, 4, 0x05, 5, 0, 0, 0xA0, 0xA1, 0xA2, 0xA3], &f).is_err());
    }

    #[test]
    fn downlink_and_proprietary() {
        let f = Filters::default();
        let m = parse(&[0x60, 1, 2, 3, 4, 0x00, 5, 0, 7, 0xA0, 0xA1, 0xA2, 0xA3], &f).unwrap();
        assert_eq!(m["msgtype"], "dndf");
        assert_eq!(m["FPort"], 7);
        let m = parse(&[0xE0, 0xCA, 0xFE], &f).unwrap();
        assert_eq!(m["msgtype"], "propdf");
        assert_eq!(m["FRMPayload"], "E0CAFE");
    }

    #[test]
    fn netid_filter() {
        let mut f = Filters::default();
        f.set_netids(&[0x13]);
        assert!(f.netid_allowed(0x13));
        assert!(!f.netid_allowed(0x14));
        /* DevAddr 0x26000001 -> NetID 0x13 */
        let fr = [0x40, 0x01, 0x00, 0x00, 0x26, 0x00, 0, 0, 0xA0, 0xA1, 0xA2, 0xA3];
        assert!(parse(&fr, &f).is_ok());
        let fr = [0x40, 0x01, 0x00, 0x00, 0x28, 0x00, 0, 0, 0xA0, 0xA1, 0xA2, 0xA3];
        assert_eq!(parse(&fr, &f), Err(Error::Filtered("NetID")));
        f.set_netids(&[]);
        assert!(parse(&fr, &f).is_ok());
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
        assert_eq!(crc16_ccitt(&[]), 0);
    }

    #[test]
    fn beacon_layout_eu868() {
        let mut pdu = [0xAAu8; 17];
        make_beacon(&[2, 8, 17], 0x12345678, 0, 45.0, -90.0, &mut pdu).unwrap();
        assert_eq!(&pdu[0..2], &[0, 0]);
        assert_eq!(&pdu[2..6], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(u16::from_le_bytes([pdu[6], pdu[7]]), crc16_ccitt(&pdu[..6]));
        assert_eq!(pdu[8], 0);
        /* lon -90 = -2^22, lat 45 = 2^22 */
        assert_eq!(&pdu[9..12], &[0x00, 0x00, 0xC0]);
        assert_eq!(&pdu[12..15], &[0x00, 0x00, 0x40]);
        assert_eq!(u16::from_le_bytes([pdu[15], pdu[16]]), crc16_ccitt(&pdu[8..15]));

        let mut again = [0u8; 17];
        make_beacon(&[2, 8, 17], 0x12345678, 0, 45.0, -90.0, &mut again).unwrap();
        assert_eq!(pdu, again);
        assert!(make_beacon(&[2, 8, 17], 0, 0, 0.0, 0.0, &mut [0u8; 16]).is_err());
    }

    #[test]
    fn beacon_coordinates_truncate() {
        let le = |v: i32| { let b = v.to_le_bytes(); [b[0], b[1], b[2]] };
        assert_eq!(coord24(48.1, 90.0), le(4_483_244));
        assert_eq!(coord24(-48.1, 90.0), le(-4_483_245));
        assert_eq!(coord24(90.0, 90.0), le(0x7F_FFFF));
        assert_eq!(coord24(-180.0, 180.0), le(-0x80_0000));
        assert_eq!(coord24(-0.00001, 90.0), le(-1));
    }
}
