//! Point-to-zone resolution against the closed zone table

use crate::domain::types::{Point, Rect, ZoneId};
use crate::infra::config::{Config, ShelfZone};

#[derive(Debug, Clone)]
struct ZoneEntry {
    name: String,
    rect: Rect,
    center: Point,
}

/// Zones resolved once at config load; `ZoneId` indexes into this table
#[derive(Debug, Clone)]
pub struct ZoneTable {
    zones: Vec<ZoneEntry>,
    margin: f64,
}

impl ZoneTable {
    pub fn new(zones: &[ShelfZone], margin: f64) -> Self {
        let zones = zones
            .iter()
            .take(u16::MAX as usize)
            .map(|z| ZoneEntry { name: z.name.clone(), rect: z.rect, center: z.rect.center() })
            .collect();
        Self { zones, margin }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.shelf_zones(), config.zone_margin())
    }

    /// Zone containing `p` (rectangle grown by the margin, inclusive).
    ///
    /// When several qualify the nearest center wins; exact ties keep
    /// configuration order.
    pub fn resolve(&self, p: Point) -> Option<ZoneId> {
        let mut best: Option<(usize, f64)> = None;
        for (i, zone) in self.zones.iter().enumerate() {
            if !zone.rect.contains_with_margin(&p, self.margin) {
                continue;
            }
            let d = p.dist2(&zone.center);
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }
        best.map(|(i, _)| ZoneId(i as u16))
    }

    pub fn name(&self, zone: ZoneId) -> &str {
        self.zones.get(zone.index()).map(|z| z.name.as_str()).unwrap_or("?")
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
