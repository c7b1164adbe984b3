//! Item selection policies
//!
//! The same selector kinds drive both sampling (which item to read) and removal
//! (which item to evict). Items are kept in insertion order, so FIFO and LIFO are
//! the two ends of the collection. An ordered `(priority, key)` index answers the
//! heap selectors in O(log n).

use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::table::Item;

/// Selection policy, chosen once when a table is built
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Uniformly random
    #[default]
    Uniform,
    /// Oldest first
    Fifo,
    /// Newest first
    Lifo,
    /// Random with probability proportional to `priority^exponent`
    Prioritized { exponent: f64 },
    /// Lowest priority first, oldest on ties
    MinHeap,
    /// Highest priority first, oldest on ties
    MaxHeap,
}

impl Selector {
    /// Whether the policy may be used to pick eviction victims
    pub fn can_remove(&self) -> bool {
        !matches!(self, Selector::Uniform)
    }

    pub fn is_prioritized(&self) -> bool {
        matches!(self, Selector::Prioritized { .. })
    }

    /// Position of the selected item, `None` when `items` is empty
    pub fn select<R: Rng + ?Sized>(&self, items: &ItemSet, rng: &mut R) -> Option<usize> {
        if items.is_empty() {
            return None;
        }

        match self {
            Selector::Uniform => Some(rng.gen_range(0..items.len())),
            Selector::Fifo => Some(0),
            Selector::Lifo => Some(items.len() - 1),
            Selector::Prioritized { exponent } => Some(weighted(&items.items, *exponent, rng)),
            Selector::MinHeap => items.lowest().and_then(|key| items.position(key)),
            Selector::MaxHeap => items.highest().and_then(|key| items.position(key)),
        }
    }
}

/// Total order over priorities; NaN ranks as 0
#[derive(Debug, Clone, Copy)]
struct PriorityKey(f64);

impl PriorityKey {
    fn new(priority: f64) -> Self {
        Self(if priority.is_nan() { 0.0 } else { priority })
    }
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Table items in insertion (key) order, indexed by priority
#[derive(Debug, Default)]
pub struct ItemSet {
    items: VecDeque<Item>,
    by_priority: BTreeSet<(PriorityKey, u64)>,
}

impl ItemSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            by_priority: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item; keys must increase
    pub fn push_back(&mut self, item: Item) {
        self.by_priority.insert((PriorityKey::new(item.priority), item.key));
        self.items.push_back(item);
    }

    /// Put a removed item back at `index`
    pub fn insert(&mut self, index: usize, item: Item) {
        self.by_priority.insert((PriorityKey::new(item.priority), item.key));
        self.items.insert(index, item);
    }

    pub fn remove(&mut self, index: usize) -> Option<Item> {
        let item = self.items.remove(index)?;
        self.by_priority.remove(&(PriorityKey::new(item.priority), item.key));
        Some(item)
    }

    /// Sample counter of the item at `index`; priorities stay fixed once indexed
    pub fn times_sampled_mut(&mut self, index: usize) -> Option<&mut u32> {
        self.items.get_mut(index).map(|item| &mut item.times_sampled)
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.by_priority.clear();
    }

    /// Position of the item with `key`
    pub fn position(&self, key: u64) -> Option<usize> {
        self.items.binary_search_by_key(&key, |item| item.key).ok()
    }

    /// Key of the lowest-priority item, oldest on ties
    fn lowest(&self) -> Option<u64> {
        self.by_priority.first().map(|(_, key)| *key)
    }

    /// Key of the highest-priority item, oldest on ties
    fn highest(&self) -> Option<u64> {
        let (top, _) = *self.by_priority.last()?;
        self.by_priority.range((top, 0)..).next().map(|(_, key)| *key)
    }
}

impl FromIterator<Item> for ItemSet {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        let mut set = ItemSet::default();
        for item in iter {
            set.push_back(item);
        }
        set
    }
}

fn weighted<R: Rng + ?Sized>(items: &VecDeque<Item>, exponent: f64, rng: &mut R) -> usize {
    let weight = |p: f64| if p > 0.0 { p.powf(exponent) } else { 0.0 };
    let total: f64 = items.iter().map(|i| weight(i.priority)).sum();

    // All-zero priorities degrade to uniform
    if total <= 0.0 || !total.is_finite() {
        return rng.gen_range(0..items.len());
    }

    let mut target = rng.gen::<f64>() * total;
    for (i, item) in items.iter().enumerate() {
        let w = weight(item.priority);
        if target < w {
            return i;
        }
        target -= w;
    }
    items.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use relay_common::TrainingRecord;
    use std::sync::Arc;

    fn items(priorities: &[f64]) -> ItemSet {
        priorities
            .iter()
            .enumerate()
            .map(|(i, p)| Item::new(i as u64, *p, Arc::new(TrainingRecord::new())))
            .collect()
    }

    #[test]
    fn test_ordered_selectors() {
        let mut rng = StdRng::seed_from_u64(7);
        let items = items(&[3.0, 1.0, 5.0, 1.0]);

        assert_eq!(Selector::Fifo.select(&items, &mut rng), Some(0));
        assert_eq!(Selector::Lifo.select(&items, &mut rng), Some(3));
        assert_eq!(Selector::MinHeap.select(&items, &mut rng), Some(1));
        assert_eq!(Selector::MaxHeap.select(&items, &mut rng), Some(2));
    }

    #[test]
    fn test_heap_ties_pick_oldest_and_track_removals() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut items = items(&[4.0, 2.0, 4.0, 2.0, f64::NAN]);

        // NaN ranks as 0
        assert_eq!(Selector::MinHeap.select(&items, &mut rng), Some(4));
        assert_eq!(Selector::MaxHeap.select(&items, &mut rng), Some(0));

        let nan = items.remove(4).unwrap();
        assert_eq!(Selector::MinHeap.select(&items, &mut rng), Some(1));
        let top = items.remove(0).unwrap();
        // key 2 now sits at position 1
        assert_eq!(Selector::MaxHeap.select(&items, &mut rng), Some(1));

        items.insert(0, top);
        items.push_back(nan);
        assert_eq!(Selector::MaxHeap.select(&items, &mut rng), Some(0));
        assert_eq!(items.position(4), Some(4));

        items.clear();
        assert_eq!(Selector::MinHeap.select(&items, &mut rng), None);
    }

    #[test]
    fn test_empty_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(Selector::Uniform.select(&ItemSet::default(), &mut rng), None);
    }

    #[test]
    fn test_prioritized_skips_zero_priority() {
        let mut rng = StdRng::seed_from_u64(11);
        let items = items(&[0.0, 2.0, 0.0]);
        let selector = Selector::Prioritized { exponent: 1.0 };
        for _ in 0..100 {
            assert_eq!(selector.select(&items, &mut rng), Some(1));
        }
    }

    #[test]
    fn test_prioritized_follows_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let items = items(&[1.0, 9.0]);
        let selector = Selector::Prioritized { exponent: 1.0 };

        let heavy = (0..10_000)
            .filter(|_| selector.select(&items, &mut rng) == Some(1))
            .count();
        assert!((8_500..9_500).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn test_uniform_is_not_a_remover() {
        assert!(!Selector::Uniform.can_remove());
        assert!(Selector::Fifo.can_remove());
        assert!(Selector::Prioritized { exponent: 0.5 }.can_remove());
    }

    #[test]
    fn test_selector_config_shape() {
        let s: Selector = serde_json::from_str(r#"{"prioritized":{"exponent":0.5}}"#).unwrap();
        assert_eq!(s, Selector::Prioritized { exponent: 0.5 });
    }
}
