//! Radio context tagged concentrator time.
//!
//! ```text
//!  63   | 62..56  | 55..48  | 47..0
//!  0    | txunit  | session | concentrator us since session start
//! ```
//! An xtime of zero is invalid. Times from different sessions cannot be compared.

pub const XTIME_UNIT_SHIFT:u32 =  56;
pub const XTIME_SESS_SHIFT:u32 =  48;
pub const XTIME_TICKS_MASK:i64 =  (1i64 << 48) - 1;
pub const XTIME_SESS_MASK:i64 =   0x7FFF_0000_0000_0000;   /* txunit + session */
pub const RCTX_TXUNIT_MASK:i64 =  0x7F;

pub fn make(txunit: u8, session: u8, ticks: i64) -> i64 {
    (((txunit & 0x7F) as i64) << XTIME_UNIT_SHIFT)
        | ((session as i64) << XTIME_SESS_SHIFT)
        | (ticks & XTIME_TICKS_MASK)
}

pub fn txunit(xtime: i64) -> u8 {
    ((xtime >> XTIME_UNIT_SHIFT) & 0x7F) as u8
}

pub fn session(xtime: i64) -> u8 {
    ((xtime >> XTIME_SESS_SHIFT) & 0xFF) as u8
}

pub fn ticks(xtime: i64) -> i64 {
    xtime & XTIME_TICKS_MASK
}

/// True if both timestamps carry the same txunit and session nonce.
pub fn same_session(a: i64, b: i64) -> bool {
    (a ^ b) & XTIME_SESS_MASK == 0
}

pub fn is_valid(xtime: i64) -> bool {
    xtime > 0 && session(xtime) != 0
}

pub fn rctx_txunit(rctx: i64) -> u8 {
    (rctx & RCTX_TXUNIT_MASK) as u8
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip() {
        let x = make(3, 0xA5, 123_456_789);
        assert_eq!(txunit(x), 3);
        assert_eq!(session(x), 0xA5);
        assert_eq!(ticks(x), 123_456_789);
        assert!(x > 0);
        assert!(is_valid(x));
        assert!(!is_valid(0));
    }

    #[test]
    fn session_comparison() {
        let a = make(0, 7, 1000);
        assert!(same_session(a, make(0, 7, 99)));
        assert!(!same_session(a, make(0, 8, 1000)));
        assert!(!same_session(a, make(1, 7, 1000)));
        assert_eq!(rctx_txunit(0x181), 1);
    }
}
