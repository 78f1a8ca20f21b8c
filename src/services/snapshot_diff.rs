//! Multiset difference between a shelf baseline and a later snapshot

use rustc_hash::FxHashMap;

/// Items that left the shelf and items that came back, with multiplicity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// `baseline - current`, grouped by first appearance in the baseline
    pub missing: Vec<(String, u32)>,
    /// `current - baseline`, grouped by first appearance in the current list
    pub returned: Vec<(String, u32)>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.returned.is_empty()
    }

    pub fn missing_count(&self) -> u64 {
        self.missing.iter().map(|(_, n)| *n as u64).sum()
    }

    pub fn returned_count(&self) -> u64 {
        self.returned.iter().map(|(_, n)| *n as u64).sum()
    }
}

/// Count labels while remembering the order each one first appeared
fn counts(labels: &[String]) -> (Vec<&str>, FxHashMap<&str, i64>) {
    let mut order = Vec::new();
    let mut map: FxHashMap<&str, i64> = FxHashMap::default();
    for label in labels {
        let entry = map.entry(label.as_str()).or_insert_with(|| {
            order.push(label.as_str());
            0
        });
        *entry += 1;
    }
    (order, map)
}

/// Compute `missing` and `returned`; the two are disjoint by construction
pub fn diff(baseline: &[String], current: &[String]) -> SnapshotDiff {
    let (base_order, base) = counts(baseline);
    let (cur_order, cur) = counts(current);

    let missing = base_order
        .iter()
        .filter_map(|&name| {
            let n = base[name] - cur.get(name).copied().unwrap_or(0);
            (n > 0).then(|| (name.to_string(), n as u32))
        })
        .collect();
    let returned = cur_order
        .iter()
        .filter_map(|&name| {
            let n = cur[name] - base.get(name).copied().unwrap_or(0);
            (n > 0).then(|| (name.to_string(), n as u32))
        })
        .collect();

    SnapshotDiff { missing, returned }
}
