//!
//! The layer map tracks what layers exist in a timeline.
//!
//! When the timeline is loaded, the server lists all layer files in the
//! `timelines/<timeline_id>` directory and populates this map with a
//! [`PersistentLayer`] for each. Incoming records go to the open
//! [`InMemoryLayer`]; now and then it is frozen and written out as a level-0
//! delta layer. Compaction and GC replace and remove historic layers.
//!
//! The historic layers are kept in a flat list. `search` scans it, which is fine
//! for the number of layers a timeline carries between compactions.
//!
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use pageserver_api::key::Key;
use utils::lsn::Lsn;

use super::storage_layer::{range_overlaps, InMemoryLayer, PersistentLayer};

///
/// LayerMap tracks what layers exist on a timeline.
///
#[derive(Default)]
pub struct LayerMap {
    //
    // 'open_layer' holds the current InMemoryLayer that is accepting new
    // records. If it is None, 'next_open_layer_at' will be set instead, indicating
    // where the start LSN of the next InMemoryLayer that is to be created.
    //
    pub open_layer: Option<Arc<InMemoryLayer>>,
    pub next_open_layer_at: Option<Lsn>,

    ///
    /// Frozen layers, if any. Frozen layers are in-memory layers that
    /// are no longer added to, but haven't been written out to disk
    /// yet. They contain WAL older than the current 'open_layer' or
    /// 'next_open_layer_at', but newer than any historic layer.
    /// The frozen layers are in order from oldest to newest, so that
    /// the newest one is in the 'back' of the VecDeque, and the oldest
    /// in the 'front'.
    ///
    pub frozen_layers: VecDeque<Arc<InMemoryLayer>>,

    /// All the historic layers.
    historic: Vec<Arc<PersistentLayer>>,
}

/// Return value of LayerMap::search
pub struct SearchResult {
    pub layer: Arc<PersistentLayer>,
    /// Read the layer from this LSN up to (not including) the requested LSN.
    pub lsn_floor: Lsn,
}

impl LayerMap {
    ///
    /// Find the latest layer (by lsn.end) that covers the given
    /// 'key', with lsn.start < 'end_lsn'.
    ///
    /// The caller of this function is the page reconstruction
    /// algorithm looking for the next relevant delta layer, or
    /// the terminal image layer. The caller will pass the lsn_floor
    /// value as end_lsn in the next call to search.
    ///
    /// If there's an image layer exactly below the request LSN, the
    /// image layer is returned. Otherwise the newest delta layer that
    /// has data above the best image is returned, with `lsn_floor` set
    /// so that the image below it is found on the next call.
    ///
    pub fn search(&self, key: Key, end_lsn: Lsn) -> Option<SearchResult> {
        let latest_img = self
            .historic
            .iter()
            .filter(|l| {
                let desc = l.layer_desc();
                !desc.is_delta && desc.key_range.contains(&key) && desc.lsn_range.start < end_lsn
            })
            .max_by_key(|l| l.layer_desc().lsn_range.start);
        let img_lsn = latest_img.map(|l| l.layer_desc().image_layer_lsn());

        let latest_delta = self
            .historic
            .iter()
            .filter(|l| {
                let desc = l.layer_desc();
                desc.is_delta
                    && desc.key_range.contains(&key)
                    && desc.lsn_range.start < end_lsn
                    && img_lsn.map_or(true, |img_lsn| desc.lsn_range.end > img_lsn + 1)
            })
            .max_by_key(|l| {
                let desc = l.layer_desc();
                (desc.lsn_range.end, desc.lsn_range.start)
            });

        match (latest_delta, latest_img) {
            (Some(delta), img) => {
                let delta_start = delta.layer_desc().lsn_range.start;
                let lsn_floor = match img_lsn {
                    Some(img_lsn) => std::cmp::max(delta_start, img_lsn + 1),
                    None => delta_start,
                };
                if lsn_floor < end_lsn {
                    Some(SearchResult {
                        layer: Arc::clone(delta),
                        lsn_floor,
                    })
                } else {
                    img.map(|img| SearchResult {
                        layer: Arc::clone(img),
                        lsn_floor: img.layer_desc().image_layer_lsn(),
                    })
                }
            }
            (None, Some(img)) => Some(SearchResult {
                layer: Arc::clone(img),
                lsn_floor: img.layer_desc().image_layer_lsn(),
            }),
            (None, None) => None,
        }
    }

    pub fn insert_historic(&mut self, layer: Arc<PersistentLayer>) {
        self.historic.push(layer);
    }

    ///
    /// Remove a layer from the map. Returns false if this exact layer is not
    /// in the map anymore.
    ///
    pub fn remove_historic(&mut self, layer: &Arc<PersistentLayer>) -> bool {
        let len_before = self.historic.len();
        self.historic.retain(|other| !Arc::ptr_eq(other, layer));
        self.historic.len() != len_before
    }

    pub fn contains(&self, layer: &Arc<PersistentLayer>) -> bool {
        self.historic.iter().any(|other| Arc::ptr_eq(other, layer))
    }

    pub fn iter_historic_layers(&self) -> impl Iterator<Item = &Arc<PersistentLayer>> {
        self.historic.iter()
    }

    pub fn num_historic_layers(&self) -> usize {
        self.historic.len()
    }

    /// Level-0 delta layers, oldest first.
    pub fn get_level0_deltas(&self) -> Vec<Arc<PersistentLayer>> {
        let mut deltas: Vec<_> = self
            .historic
            .iter()
            .filter(|l| l.layer_desc().is_level0())
            .cloned()
            .collect();
        deltas.sort_by_key(|l| l.layer_desc().lsn_range.start);
        deltas
    }

    /// Number of delta layers overlapping both `key_range` and `lsn_range`.
    pub fn count_deltas(&self, key_range: &Range<Key>, lsn_range: &Range<Lsn>) -> usize {
        self.historic
            .iter()
            .filter(|l| {
                let desc = l.layer_desc();
                desc.is_delta
                    && range_overlaps(&desc.key_range, key_range)
                    && range_overlaps(&desc.lsn_range, lsn_range)
            })
            .count()
    }

    ///
    /// Check if image layers with LSN inside `lsn_range` together cover the
    /// whole `key_range`.
    ///
    pub fn image_layer_exists(&self, key_range: &Range<Key>, lsn_range: &Range<Lsn>) -> bool {
        if key_range.is_empty() {
            return true;
        }
        let mut images: Vec<&Range<Key>> = self
            .historic
            .iter()
            .map(|l| l.layer_desc())
            .filter(|desc| {
                !desc.is_delta
                    && lsn_range.contains(&desc.lsn_range.start)
                    && range_overlaps(&desc.key_range, key_range)
            })
            .map(|desc| &desc.key_range)
            .collect();
        images.sort_by_key(|r| r.start);

        let mut covered_to = key_range.start;
        for r in images {
            if r.start > covered_to {
                return false;
            }
            covered_to = std::cmp::max(covered_to, r.end);
            if covered_to >= key_range.end {
                return true;
            }
        }
        false
    }

    /// LSN of the newest set of image layers that covers the whole key space.
    pub fn latest_full_image_lsn(&self) -> Option<Lsn> {
        let mut lsns: Vec<Lsn> = self
            .historic
            .iter()
            .map(|l| l.layer_desc())
            .filter(|desc| !desc.is_delta)
            .map(|desc| desc.lsn_range.start)
            .collect();
        lsns.sort();
        lsns.dedup();
        lsns.into_iter()
            .rev()
            .find(|lsn| self.image_layer_exists(&(Key::MIN..Key::MAX), &lsn.single()))
    }

    /// Frozen layers followed by the open layer, newest first.
    pub fn in_memory_layers_newest_first(&self) -> impl Iterator<Item = &Arc<InMemoryLayer>> {
        self.open_layer
            .iter()
            .chain(self.frozen_layers.iter().rev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::storage_layer::PersistentLayerDesc;
    use camino::Utf8PathBuf;
    use utils::id::{TenantId, TimelineId};

    fn image(key_range: Range<u32>, lsn: u64) -> Arc<PersistentLayer> {
        let desc = PersistentLayerDesc::new_img(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::from_u32(key_range.start)..Key::from_u32(key_range.end),
            Lsn(lsn),
            0,
        );
        let path = Utf8PathBuf::from(desc.filename());
        Arc::new(PersistentLayer::new(desc, path))
    }

    fn delta(key_range: Range<u32>, lsn_range: Range<u64>) -> Arc<PersistentLayer> {
        let desc = PersistentLayerDesc::new_delta(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::from_u32(key_range.start)..Key::from_u32(key_range.end),
            Lsn(lsn_range.start)..Lsn(lsn_range.end),
            0,
        );
        let path = Utf8PathBuf::from(desc.filename());
        Arc::new(PersistentLayer::new(desc, path))
    }

    fn l0(lsn_range: Range<u64>) -> Arc<PersistentLayer> {
        let desc = PersistentLayerDesc::new_delta(
            TenantId::from_array([1; 16]),
            TimelineId::from_array([2; 16]),
            Key::MIN..Key::MAX,
            Lsn(lsn_range.start)..Lsn(lsn_range.end),
            0,
        );
        let path = Utf8PathBuf::from(desc.filename());
        Arc::new(PersistentLayer::new(desc, path))
    }

    #[test]
    fn search_prefers_deltas_above_image() {
        let mut map = LayerMap::default();
        let img = image(0..100, 0x20);
        let older_delta = l0(0x10..0x20);
        let newer_delta = l0(0x20..0x40);
        map.insert_historic(Arc::clone(&img));
        map.insert_historic(Arc::clone(&older_delta));
        map.insert_historic(Arc::clone(&newer_delta));

        let key = Key::from_u32(5);
        let res = map.search(key, Lsn(0x40)).unwrap();
        assert!(Arc::ptr_eq(&res.layer, &newer_delta));
        assert_eq!(res.lsn_floor, Lsn(0x21));

        let res = map.search(key, res.lsn_floor).unwrap();
        assert!(Arc::ptr_eq(&res.layer, &img));
        assert_eq!(res.lsn_floor, Lsn(0x20));

        // below the image, only the older delta is left
        let res = map.search(key, Lsn(0x20)).unwrap();
        assert!(Arc::ptr_eq(&res.layer, &older_delta));
        assert_eq!(res.lsn_floor, Lsn(0x10));

        assert!(map.search(key, Lsn(0x10)).is_none());
        // the image does not cover this key, the deltas do
        let res = map.search(Key::from_u32(500), Lsn(0x21)).unwrap();
        assert!(Arc::ptr_eq(&res.layer, &newer_delta));
    }

    #[test]
    fn remove_is_by_identity() {
        let mut map = LayerMap::default();
        let a = l0(0x10..0x20);
        let a_twin = l0(0x10..0x20);
        map.insert_historic(Arc::clone(&a));
        assert!(!map.remove_historic(&a_twin));
        assert!(map.contains(&a));
        assert!(map.remove_historic(&a));
        assert!(!map.remove_historic(&a));
        assert_eq!(map.num_historic_layers(), 0);
    }

    #[test]
    fn image_coverage() {
        let mut map = LayerMap::default();
        map.insert_historic(image(0..10, 0x30));
        map.insert_historic(image(10..20, 0x30));
        map.insert_historic(image(25..30, 0x30));
        map.insert_historic(delta(0..30, 0x10..0x30));

        let lsns = Lsn(0x30)..Lsn(0x31);
        let k = |r: Range<u32>| Key::from_u32(r.start)..Key::from_u32(r.end);
        assert!(map.image_layer_exists(&k(0..20), &lsns));
        assert!(map.image_layer_exists(&k(5..15), &lsns));
        assert!(!map.image_layer_exists(&k(5..26), &lsns));
        assert!(!map.image_layer_exists(&k(0..20), &(Lsn(0x31)..Lsn(0x40))));
        assert!(map.latest_full_image_lsn().is_none());

        assert_eq!(map.count_deltas(&k(0..5), &(Lsn(0x2F)..Lsn(0x40))), 1);
        assert_eq!(map.count_deltas(&k(0..5), &(Lsn(0x30)..Lsn(0x40))), 0);
    }

    #[test]
    fn level0_deltas_are_sorted() {
        let mut map = LayerMap::default();
        map.insert_historic(l0(0x30..0x40));
        map.insert_historic(delta(0..10, 0x10..0x20));
        map.insert_historic(l0(0x10..0x30));
        let starts: Vec<Lsn> = map
            .get_level0_deltas()
            .iter()
            .map(|l| l.layer_desc().lsn_range.start)
            .collect();
        assert_eq!(starts, vec![Lsn(0x10), Lsn(0x30)]);
    }
}
