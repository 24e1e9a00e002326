//! Regional defaults used when router_config leaves a parameter out.

use super::error::Error;
use super::rt::{ms, Ustime};

/* EU868 duty cycle sub bands */
pub const DC_DECI:usize =       0;
pub const DC_CENTI:usize =      1;
pub const DC_MILLI:usize =      2;
pub const DC_NUM_BANDS:usize =  3;

/// Inverse duty cycle of each EU868 band: 10%, 1% and 0.1%.
pub const EU868_BAND_RATES:[u32; DC_NUM_BANDS] = [10, 100, 1000];

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: u8,
    pub name: &'static str,
    pub min_freq: u32,
    pub max_freq: u32,
    pub txpow: i16,                     /* dBm x10 */
    pub txpow2: Option<(u32, u32, i16)>,/* freq window with its own power */
    pub dc: bool,
    pub dc_chnl_rate: u32,
    pub cca: bool,
    pub max_dwell: Option<Ustime>,
}

pub const REGION_EU868:u8 =   1;
pub const REGION_IN865:u8 =   2;
pub const REGION_US915:u8 =   3;
pub const REGION_AU915:u8 =   4;
pub const REGION_AS923:u8 =   5;
pub const REGION_AS923JP:u8 = 6;
pub const REGION_KR920:u8 =   7;
pub const REGION_CN470:u8 =   8;
pub const REGION_IL915:u8 =   9;

fn table() -> [Region; 9] {
    [
        Region { id: REGION_EU868, name: "EU868", min_freq: 863_000_000, max_freq: 870_000_000, txpow: 160,
                 txpow2: Some((869_400_000, 869_650_000, 270)), dc: true, dc_chnl_rate: 0, cca: false, max_dwell: None },
        Region { id: REGION_IN865, name: "IN865", min_freq: 865_000_000, max_freq: 867_000_000, txpow: 300,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: false, max_dwell: None },
        Region { id: REGION_US915, name: "US915", min_freq: 902_000_000, max_freq: 928_000_000, txpow: 260,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: false, max_dwell: None },
        Region { id: REGION_AU915, name: "AU915", min_freq: 915_000_000, max_freq: 928_000_000, txpow: 300,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: false, max_dwell: None },
        Region { id: REGION_AS923, name: "AS923", min_freq: 915_000_000, max_freq: 928_000_000, txpow: 160,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: false, max_dwell: Some(ms(400)) },
        Region { id: REGION_AS923JP, name: "AS923JP", min_freq: 920_600_000, max_freq: 923_400_000, txpow: 130,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: true, max_dwell: Some(ms(400)) },
        Region { id: REGION_KR920, name: "KR920", min_freq: 920_900_000, max_freq: 923_300_000, txpow: 230,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: true, max_dwell: None },
        Region { id: REGION_CN470, name: "CN470", min_freq: 470_000_000, max_freq: 510_000_000, txpow: 190,
                 txpow2: None, dc: false, dc_chnl_rate: 0, cca: false, max_dwell: None },
        Region { id: REGION_IL915, name: "IL915", min_freq: 915_000_000, max_freq: 917_000_000, txpow: 140,
                 txpow2: None, dc: true, dc_chnl_rate: 100, cca: false, max_dwell: None },
    ]
}

/// Looks up a region by the names servers use, e.g. `EU863`, `EU868`, `AS923-1`, `AS923JP`.
pub fn lookup(name: &str) -> Result<Region, Error> {
    let n = name.trim().to_uppercase();
    let key = match n.as_str() {
        "EU863" | "EU868" => "EU868",
        "IN865" => "IN865",
        "US902" | "US915" => "US915",
        "AU915" => "AU915",
        "AS923" | "AS923-1" | "AS923-2" | "AS923-3" | "AS923-4" => "AS923",
        "AS923JP" | "AS923-1JP" => "AS923JP",
        "KR920" => "KR920",
        "CN470" => "CN470",
        "IL915" => "IL915",
        _ => return Err(Error::Region(format!("unknown region: {}", name))),
    };
    table()
        .into_iter()
        .find(|r| r.name == key)
        .ok_or_else(|| Error::Region(format!("unknown region: {}", name)))
}

/// EU868 duty cycle band of a frequency.
pub fn eu868_band(freq: u32) -> usize {
    if (869_400_000..=869_650_000).contains(&freq) {
        DC_DECI
    } else if (868_000_000..=868_600_000).contains(&freq) || (869_700_000..=870_000_000).contains(&freq) {
        DC_CENTI
    } else {
        DC_MILLI
    }
}
