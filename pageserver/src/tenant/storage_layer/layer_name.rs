//!
//! Helper functions for dealing with filenames of the image and delta layer files.
//!
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use pageserver_api::key::{Key, KEY_HEX_LEN};
use utils::lsn::Lsn;

const LSN_HEX_LEN: usize = 16;

fn parse_lsn(s: &str) -> Option<Lsn> {
    if s.len() != LSN_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Lsn::from_hex(s).ok()
}

fn parse_key_range(s: &str) -> Option<Range<Key>> {
    let (key_start_str, key_end_str) = s.split_once('-')?;
    if key_start_str.len() != KEY_HEX_LEN || key_end_str.len() != KEY_HEX_LEN {
        return None;
    }
    let key_start = Key::from_hex(key_start_str).ok()?;
    let key_end = Key::from_hex(key_end_str).ok()?;
    if key_start >= key_end {
        return None;
    }
    Some(key_start..key_end)
}

// Note: Timeline::load_layer_map() relies on this sort order
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct DeltaLayerName {
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,
}

impl PartialOrd for DeltaLayerName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeltaLayerName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_range
            .start
            .cmp(&other.key_range.start)
            .then(self.key_range.end.cmp(&other.key_range.end))
            .then(self.lsn_range.start.cmp(&other.lsn_range.start))
            .then(self.lsn_range.end.cmp(&other.lsn_range.end))
    }
}

/// Represents the region of the LSN-Key space covered by a DeltaLayer
///
/// ```text
///    <key start>-<key end>__<LSN start>-<LSN end>
/// ```
impl DeltaLayerName {
    /// Parse a string as a delta layer file name. Returns None if the filename does not
    /// match the expected pattern.
    pub fn parse_str(fname: &str) -> Option<Self> {
        let (keys, lsns) = fname.split_once("__")?;
        let key_range = parse_key_range(keys)?;

        let (lsn_start_str, lsn_end_str) = lsns.split_once('-')?;
        let start_lsn = parse_lsn(lsn_start_str)?;
        let end_lsn = parse_lsn(lsn_end_str)?;

        if start_lsn >= end_lsn {
            return None;
        }

        Some(DeltaLayerName {
            key_range,
            lsn_range: start_lsn..end_lsn,
        })
    }
}

impl fmt::Display for DeltaLayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}__{:016X}-{:016X}",
            self.key_range.start,
            self.key_range.end,
            u64::from(self.lsn_range.start),
            u64::from(self.lsn_range.end),
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct ImageLayerName {
    pub key_range: Range<Key>,
    pub lsn: Lsn,
}

impl PartialOrd for ImageLayerName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ImageLayerName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_range
            .start
            .cmp(&other.key_range.start)
            .then(self.key_range.end.cmp(&other.key_range.end))
            .then(self.lsn.cmp(&other.lsn))
    }
}

impl ImageLayerName {
    /// An image layer holds exactly one LSN, `lsn..lsn + 1`.
    pub fn lsn_as_range(&self) -> Range<Lsn> {
        self.lsn.single()
    }
}

///
/// Represents the part of the Key-LSN space covered by an ImageLayer
///
/// ```text
///    <key start>-<key end>__<LSN>
/// ```
impl ImageLayerName {
    /// Parse a string as an image layer file name. Returns None if the filename does not
    /// match the expected pattern.
    pub fn parse_str(fname: &str) -> Option<Self> {
        let (keys, lsn_str) = fname.split_once("__")?;
        let key_range = parse_key_range(keys)?;
        let lsn = parse_lsn(lsn_str)?;

        Some(ImageLayerName { key_range, lsn })
    }
}

impl fmt::Display for ImageLayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}__{:016X}",
            self.key_range.start,
            self.key_range.end,
            u64::from(self.lsn),
        )
    }
}

/// The identity of a layer, as encoded in its file name.
///
/// Two layers with the same variant and the same bounds are the same artifact.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum LayerName {
    Image(ImageLayerName),
    Delta(DeltaLayerName),
}

impl LayerName {
    /// Classifies a directory entry name. Never fails: anything that is neither an image
    /// nor a delta layer name, temporary files included, yields `None`.
    pub fn classify(fname: &str) -> Option<LayerName> {
        if let Some(delta) = DeltaLayerName::parse_str(fname) {
            return Some(LayerName::Delta(delta));
        }
        ImageLayerName::parse_str(fname).map(LayerName::Image)
    }

    /// Determines if this layer file is considered to be in future meaning we will discard these
    /// layers during timeline initialization from the given disk_consistent_lsn.
    pub(crate) fn is_in_future(&self, disk_consistent_lsn: Lsn) -> bool {
        use LayerName::*;
        match self {
            Image(file_name) if file_name.lsn > disk_consistent_lsn => true,
            Delta(file_name) if file_name.lsn_range.end > disk_consistent_lsn + 1 => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        use LayerName::*;
        match self {
            Delta(_) => "delta",
            Image(_) => "image",
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, LayerName::Delta(_))
    }

    pub fn key_range(&self) -> &Range<Key> {
        match self {
            LayerName::Image(name) => &name.key_range,
            LayerName::Delta(name) => &name.key_range,
        }
    }

    pub fn lsn_range(&self) -> Range<Lsn> {
        match self {
            LayerName::Image(name) => name.lsn_as_range(),
            LayerName::Delta(name) => name.lsn_range.clone(),
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(fname) => write!(f, "{fname}"),
            Self::Delta(fname) => write!(f, "{fname}"),
        }
    }
}

impl From<ImageLayerName> for LayerName {
    fn from(fname: ImageLayerName) -> Self {
        Self::Image(fname)
    }
}
impl From<DeltaLayerName> for LayerName {
    fn from(fname: DeltaLayerName) -> Self {
        Self::Delta(fname)
    }
}

impl FromStr for LayerName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LayerName::classify(value)
            .ok_or_else(|| format!("neither delta nor image layer file name: {value:?}"))
    }
}

impl serde::Serialize for LayerName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for LayerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_string(LayerNameVisitor)
    }
}

struct LayerNameVisitor;

impl<'de> serde::de::Visitor<'de> for LayerNameVisitor {
    type Value = LayerName;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a string that is a valid image or delta layer file name"
        )
    }
    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(|e| E::custom(e))
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;

    fn random_key(rng: &mut impl Rng) -> Key {
        Key {
            field1: rng.gen(),
            field2: rng.gen(),
            field3: rng.gen(),
            field4: rng.gen(),
            field5: rng.gen(),
            field6: rng.gen(),
        }
    }

    fn random_key_range(rng: &mut impl Rng) -> Range<Key> {
        loop {
            let a = random_key(rng);
            let b = random_key(rng);
            if a != b {
                return a.min(b)..a.max(b);
            }
        }
    }

    #[test]
    fn image_layer_parse() {
        let expected = LayerName::Image(ImageLayerName {
            key_range: Key::MIN..Key::from_hex("000000067F00000001000004DF0000000006").unwrap(),
            lsn: Lsn::from_hex("00000000014FED58").unwrap(),
        });
        let parsed = LayerName::from_str("000000000000000000000000000000000000-000000067F00000001000004DF0000000006__00000000014FED58").unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.kind(), "image");
    }

    #[test]
    fn delta_layer_parse() {
        let expected = LayerName::Delta(DeltaLayerName {
            key_range: Key::MIN..Key::from_hex("000000067F00000001000004DF0000000006").unwrap(),
            lsn_range: Lsn::from_hex("00000000014FED58").unwrap()
                ..Lsn::from_hex("000000000154C481").unwrap(),
        });
        let parsed = LayerName::from_str("000000000000000000000000000000000000-000000067F00000001000004DF0000000006__00000000014FED58-000000000154C481").unwrap();
        assert_eq!(parsed, expected);
        assert!(parsed.is_delta());
    }

    #[test]
    fn encode_classify_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let key_range = random_key_range(&mut rng);
            let lsn = Lsn(rng.gen());
            let image = ImageLayerName {
                key_range: key_range.clone(),
                lsn,
            };
            assert_eq!(
                LayerName::classify(&image.to_string()),
                Some(LayerName::Image(image))
            );

            let a: u64 = rng.gen();
            let b: u64 = rng.gen();
            if a == b {
                continue;
            }
            let delta = DeltaLayerName {
                key_range,
                lsn_range: Lsn(a.min(b))..Lsn(a.max(b)),
            };
            assert_eq!(
                LayerName::classify(&delta.to_string()),
                Some(LayerName::Delta(delta))
            );
        }
    }

    #[test]
    fn roundtrip_at_the_bounds() {
        for lsn in [Lsn(0), Lsn(1), Lsn(u64::MAX - 1), Lsn::MAX] {
            let image = ImageLayerName {
                key_range: Key::MIN..Key::MAX,
                lsn,
            };
            let name = image.to_string();
            assert_eq!(LayerName::classify(&name), Some(LayerName::Image(image.clone())));
            assert!(image.lsn_as_range().end >= image.lsn_as_range().start);
        }
        assert_eq!(
            ImageLayerName::parse_str(&format!("{}-{}__FFFFFFFFFFFFFFFF", Key::MIN, Key::MAX))
                .map(|image| image.lsn),
            Some(Lsn::MAX)
        );

        let delta = DeltaLayerName {
            key_range: Key::MIN..Key::MAX,
            lsn_range: Lsn(0)..Lsn::MAX,
        };
        assert_eq!(
            LayerName::classify(&delta.to_string()),
            Some(LayerName::Delta(delta))
        );
    }

    #[test]
    fn names_sort_like_bounds() {
        let a = ImageLayerName {
            key_range: Key::from_u32(1)..Key::from_u32(0xF),
            lsn: Lsn(0x10),
        };
        let b = ImageLayerName {
            key_range: Key::from_u32(0x10)..Key::from_u32(0x20),
            lsn: Lsn(0x9),
        };
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn classify_rejects_garbage() {
        let key0 = Key::MIN.to_string();
        let key1 = Key::from_u32(1).to_string();
        let lsn = "0000000000000010";
        let cases = [
            String::new(),
            "metadata".to_string(),
            "config".to_string(),
            "___temp".to_string(),
            "__".to_string(),
            format!("{key0}-{key1}"),
            format!("{key0}-{key1}__"),
            format!("{key0}{key1}__{lsn}"),
            format!("{key0}-{key1}__{lsn}__{lsn}"),
            format!("{key0}-{key1}-{key1}__{lsn}"),
            // inverted or empty key range
            format!("{key1}-{key0}__{lsn}"),
            format!("{key1}-{key1}__{lsn}"),
            // short, long and non-hex lsns
            format!("{key0}-{key1}__10"),
            format!("{key0}-{key1}__00000000000000010"),
            format!("{key0}-{key1}__000000000000001G"),
            format!("{key0}-{key1}__+000000000000010"),
            // empty or inverted lsn range
            format!("{key0}-{key1}__{lsn}-{lsn}"),
            format!("{key0}-{key1}__0000000000000020-{lsn}"),
            format!("{key0}-{key1}__{lsn}-0000000000000020-0000000000000030"),
            // temporary files of both writers
            format!("{key0}-{key1}__{lsn}.AbCdEf12.___temp"),
            format!("{key0}-XXX__{lsn}-0000000000000020.AbCdEf12.___temp"),
            "ü".repeat(40),
        ];
        for case in cases {
            assert_eq!(LayerName::classify(&case), None, "{case:?}");
            LayerName::from_str(&case).unwrap_err();
        }
    }

    #[test]
    fn is_in_future() {
        let image: LayerName = ImageLayerName {
            key_range: Key::MIN..Key::MAX,
            lsn: Lsn(0x20),
        }
        .into();
        assert!(!image.is_in_future(Lsn(0x20)));
        assert!(image.is_in_future(Lsn(0x1F)));

        let delta: LayerName = DeltaLayerName {
            key_range: Key::MIN..Key::MAX,
            lsn_range: Lsn(0x10)..Lsn(0x21),
        }
        .into();
        assert!(!delta.is_in_future(Lsn(0x20)));
        assert!(delta.is_in_future(Lsn(0x1F)));
    }

    #[test]
    fn serde_as_string() {
        let name: LayerName = ImageLayerName {
            key_range: Key::MIN..Key::MAX,
            lsn: Lsn(0x20),
        }
        .into();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, format!("\"{name}\""));
        assert_eq!(serde_json::from_str::<LayerName>(&json).unwrap(), name);
    }
}
