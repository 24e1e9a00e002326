#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("TX job pool exhausted")]
    TxqFull,

    #[error("TX data buffer exhausted (need {0} bytes)")]
    TxDataFull(usize),

    #[error("RX queue full")]
    RxqFull,

    #[error("invalid xtime")]
    InvalidXtime,

    #[error("xtime 0x{0:X} belongs to a stale session")]
    StaleXtime(i64),

    #[error("xticks rollover (delta {0}us)")]
    XticksRollover(i64),

    #[error("no time sync for txunit {0}")]
    NoTimesync(u8),

    #[error("no GPS time reference")]
    NoGpsTime,

    #[error("not a LoRaWAN frame")]
    NotLorawan,

    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    #[error("frame filtered: {0}")]
    Filtered(&'static str),

    #[error("region: {0}")]
    Region(String),

    #[error("{0}")]
    Downlink(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("credentials: {0}")]
    Cred(String),

    #[error("websocket: {0}")]
    Ws(String),
}
