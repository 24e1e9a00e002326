use anyhow::{anyhow, Result};


/// Parses an EUI-64 given as `AA-BB-CC-DD-EE-FF-00-11`, `AA:BB:..`, an IPv6 style
/// group notation like `a:b::1`, or plain hex digits.
pub fn parse_eui(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty EUI"));
    }
    if s.contains('-') {
        return parse_bytes(s, '-');
    }
    if s.contains("::") {
        return parse_groups(s);
    }
    if s.contains(':') {
        let n = s.split(':').count();
        return match n {
            8 => parse_bytes(s, ':'),
            4 => parse_groups(s),
            _ => Err(anyhow!("malformed EUI: {}", s)),
        };
    }
    if s.len() > 16 {
        return Err(anyhow!("EUI too long: {}", s));
    }
    u64::from_str_radix(s, 16).map_err(|_| anyhow!("malformed EUI: {}", s))
}

fn parse_bytes(s: &str, sep: char) -> Result<u64> {
    let mut v:u64 = 0;
    let mut n = 0;
    for part in s.split(sep) {
        if part.is_empty() || part.len() > 2 {
            return Err(anyhow!("malformed EUI: {}", s));
        }
        let b = u8::from_str_radix(part, 16).map_err(|_| anyhow!("malformed EUI: {}", s))?;
        v = (v << 8) | b as u64;
        n += 1;
    }
    if n != 8 {
        return Err(anyhow!("EUI needs 8 bytes: {}", s));
    }
    Ok(v)
}

/* 4 groups of 16 bits, a single `::` stands for the missing groups */
fn parse_groups(s: &str) -> Result<u64> {
    let (head, tail) = match s.find("::") {
        Some(i) => (&s[..i], Some(&s[i + 2..])),
        None => (s, None),
    };
    let split = |p: &str| -> Result<Vec<u16>> {
        if p.is_empty() {
            return Ok(Vec::new());
        }
        p.split(':')
            .map(|g| {
                if g.is_empty() || g.len() > 4 {
                    return Err(anyhow!("malformed EUI: {}", s));
                }
                u16::from_str_radix(g, 16).map_err(|_| anyhow!("malformed EUI: {}", s))
            })
            .collect()
    };
    let hv = split(head)?;
    let tv = match tail {
        Some(t) => {
            if t.contains("::") {
                return Err(anyhow!("malformed EUI: {}", s));
            }
            split(t)?
        }
        None => Vec::new(),
    };
    let total = hv.len() + tv.len();
    if total > 4 || (tail.is_none() && total != 4) || (tail.is_some() && total == 4) {
        return Err(anyhow!("malformed EUI: {}", s));
    }
    let mut groups = [0u16; 4];
    groups[..hv.len()].copy_from_slice(&hv);
    groups[4 - tv.len()..].copy_from_slice(&tv);
    Ok(groups.iter().fold(0u64, |v, g| (v << 16) | *g as u64))
}

pub fn fmt_eui(eui: u64) -> String {
    let b = eui.to_be_bytes();
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

pub fn hex_upper(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02X}", b));
    }
    s
}

pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("odd number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|d| u8::from_str_radix(d, 16).ok())
                .ok_or_else(|| anyhow!("bad hex digit at {}", i))
        })
        .collect()
}


/// serde helper: EUIs travel as strings in any accepted format or as plain integers.
pub mod eui_serde {
    use std::fmt;

    use serde::de;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::fmt_eui(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EuiVisitor;

        impl<'de> de::Visitor<'de> for EuiVisitor {
            type Value = u64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an EUI-64 string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value)
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                super::parse_eui(value).map_err(|e| de::Error::custom(e.to_string()))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(0)
            }
        }

        deserializer.deserialize_any(EuiVisitor)
    }
}

/// serde helper: byte strings as upper/lower case hex.
pub mod hex_serde {
    use serde::de;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::hex_upper(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_hex(&s).map_err(|e| de::Error::custom(e.to_string()))
    }
}
