use anyhow::{bail, Result};
use byteorder::{ByteOrder, BE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Key used in the timeline key-value store.
///
/// The storage engine treats this as an opaque, totally ordered 18-byte value. Its textual
/// form is 36 uppercase hex digits, so that lexicographic order of layer file names matches
/// numeric key order.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Key {
    pub field1: u8,
    pub field2: u32,
    pub field3: u32,
    pub field4: u32,
    pub field5: u8,
    pub field6: u32,
}

pub const KEY_SIZE: usize = 18;

/// Length of [`Key`] in its hex form.
pub const KEY_HEX_LEN: usize = KEY_SIZE * 2;

impl Key {
    pub const MIN: Key = Key {
        field1: u8::MIN,
        field2: u32::MIN,
        field3: u32::MIN,
        field4: u32::MIN,
        field5: u8::MIN,
        field6: u32::MIN,
    };
    pub const MAX: Key = Key {
        field1: u8::MAX,
        field2: u32::MAX,
        field3: u32::MAX,
        field4: u32::MAX,
        field5: u8::MAX,
        field6: u32::MAX,
    };

    /// Key with all fields zero except the last one. Handy for tests and small key spaces.
    pub const fn from_u32(x: u32) -> Key {
        Key {
            field1: 0,
            field2: 0,
            field3: 0,
            field4: 0,
            field5: 0,
            field6: x,
        }
    }

    pub fn next(&self) -> Key {
        self.add(1)
    }

    /// Adds `x` to the key, carrying into the higher fields.
    ///
    /// Panics if the result would not fit, i.e. on overflow past [`Key::MAX`].
    pub fn add(&self, x: u32) -> Key {
        let mut key = *self;

        let r = key.field6.overflowing_add(x);
        key.field6 = r.0;
        if r.1 {
            let r = key.field5.overflowing_add(1);
            key.field5 = r.0;
            if r.1 {
                let r = key.field4.overflowing_add(1);
                key.field4 = r.0;
                if r.1 {
                    let r = key.field3.overflowing_add(1);
                    key.field3 = r.0;
                    if r.1 {
                        let r = key.field2.overflowing_add(1);
                        key.field2 = r.0;
                        if r.1 {
                            let r = key.field1.overflowing_add(1);
                            key.field1 = r.0;
                            assert!(!r.1);
                        }
                    }
                }
            }
        }
        key
    }

    pub fn from_slice(b: &[u8]) -> Result<Self> {
        if b.len() != KEY_SIZE {
            bail!("key must be {KEY_SIZE} bytes, got {}", b.len());
        }
        Ok(Key {
            field1: b[0],
            field2: BE::read_u32(&b[1..5]),
            field3: BE::read_u32(&b[5..9]),
            field4: BE::read_u32(&b[9..13]),
            field5: b[13],
            field6: BE::read_u32(&b[14..18]),
        })
    }

    pub fn write_to_byte_slice(&self, buf: &mut [u8]) {
        buf[0] = self.field1;
        BE::write_u32(&mut buf[1..5], self.field2);
        BE::write_u32(&mut buf[5..9], self.field3);
        BE::write_u32(&mut buf[9..13], self.field4);
        buf[13] = self.field5;
        BE::write_u32(&mut buf[14..18], self.field6);
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != KEY_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("parse error");
        }
        Ok(Key {
            field1: u8::from_str_radix(&s[0..2], 16)?,
            field2: u32::from_str_radix(&s[2..10], 16)?,
            field3: u32::from_str_radix(&s[10..18], 16)?,
            field4: u32::from_str_radix(&s[18..26], 16)?,
            field5: u8::from_str_radix(&s[26..28], 16)?,
            field6: u32::from_str_radix(&s[28..36], 16)?,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}{:08X}{:08X}{:08X}{:02X}{:08X}",
            self.field1, self.field2, self.field3, self.field4, self.field5, self.field6
        )
    }
}

pub fn is_valid_key_range(range: &Range<Key>) -> bool {
    range.start < range.end
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn display_fromhex_is_fixed_width() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let key = Key {
                field1: rng.gen(),
                field2: rng.gen(),
                field3: rng.gen(),
                field4: rng.gen(),
                field5: rng.gen(),
                field6: rng.gen(),
            };
            let s = key.to_string();
            assert_eq!(s.len(), KEY_HEX_LEN);
            assert_eq!(key, Key::from_hex(&s).unwrap());
        }
    }

    #[test]
    fn hex_order_matches_key_order() {
        let a = Key::from_u32(0xF);
        let b = Key::from_u32(0x10);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
        assert!(Key::MIN.to_string() < Key::MAX.to_string());
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Key::from_hex("").is_err());
        assert!(Key::from_hex(&"0".repeat(35)).is_err());
        assert!(Key::from_hex(&"G".repeat(36)).is_err());
        assert!(Key::from_hex(&format!("+{}", "0".repeat(35))).is_err());
    }

    #[test]
    fn add_carries() {
        let key = Key::from_u32(u32::MAX);
        let next = key.next();
        assert_eq!(next.field6, 0);
        assert_eq!(next.field5, 1);

        let mut buf = [0u8; KEY_SIZE];
        next.write_to_byte_slice(&mut buf);
        assert_eq!(Key::from_slice(&buf).unwrap(), next);
        assert!(Key::from_slice(&buf[1..]).is_err());
    }
}
