//! Dense multi-dimensional region lookup.
//!
//! Every dimension some region actually constrains (channel, key, velocity,
//! aftertouch, program, previous key switch and individual controllers)
//! gets a mapping array from raw value to zone index. Zones are the
//! intervals between distinct region bounds, so regions sharing bounds
//! share a zone. The mapping arrays are premultiplied by the sizes of the
//! following dimensions; a query sums one entry per dimension and indexes
//! the bucket array directly.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use kz_ir::{Instrument, Region};

use crate::query::Query;

/// Non-controller dimensions, in table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dim {
    Chan,
    Key,
    Vel,
    ChanAft,
    PolyAft,
    Prog,
    SwPrevious,
}

const ALL_DIMS: [Dim; 7] = [
    Dim::Chan,
    Dim::Key,
    Dim::Vel,
    Dim::ChanAft,
    Dim::PolyAft,
    Dim::Prog,
    Dim::SwPrevious,
];

impl Dim {
    /// Value range covered by the mapping array.
    fn range(self) -> (i32, i32) {
        match self {
            Dim::Chan => (1, 16),
            Dim::SwPrevious => (-1, 127),
            _ => (0, 127),
        }
    }

    /// Bounds a region is "unconstrained" at.
    fn trivial(self) -> (i32, i32) {
        match self {
            Dim::SwPrevious => (-1, -1),
            _ => self.range(),
        }
    }

    fn bounds(self, r: &Region) -> (i32, i32) {
        match self {
            Dim::Chan => (r.lochan as i32, r.hichan as i32),
            // An open upper key bound reaches the top of the keyboard.
            Dim::Key => (r.lokey as i32, if r.hikey < 0 { 127 } else { r.hikey as i32 }),
            Dim::Vel => (r.lovel as i32, r.hivel as i32),
            Dim::ChanAft => (r.lochanaft as i32, r.hichanaft as i32),
            Dim::PolyAft => (r.lopolyaft as i32, r.hipolyaft as i32),
            Dim::Prog => (r.loprog as i32, r.hiprog as i32),
            Dim::SwPrevious => (r.sw_previous as i32, r.sw_previous as i32),
        }
    }

    /// Bounds used when filling buckets: a region without a previous
    /// key switch accepts every value.
    fn fill_bounds(self, r: &Region) -> (i32, i32) {
        let (lo, hi) = self.bounds(r);
        match self {
            Dim::SwPrevious if hi == -1 => (lo, 127),
            _ => (lo, hi),
        }
    }

    fn value(self, q: &Query<'_>) -> i32 {
        match self {
            Dim::Chan => q.chan as i32,
            Dim::Key => q.key as i32,
            Dim::Vel => q.vel as i32,
            Dim::ChanAft => q.chanaft as i32,
            Dim::PolyAft => q.polyaft as i32,
            Dim::Prog => q.prog as i32,
            Dim::SwPrevious => q.prev_sw_key as i32,
        }
    }
}

/// One indexed dimension.
#[derive(Clone, Debug)]
struct Axis {
    kind: AxisKind,
    /// Lowest raw value covered by `map`.
    min: i32,
    /// Zone offset per raw value, premultiplied by the stride.
    map: Vec<u32>,
    /// Number of zones.
    len: u32,
}

#[derive(Clone, Copy, Debug)]
enum AxisKind {
    Dim(Dim),
    Cc(u8),
}

impl Axis {
    fn offset(&self, value: i32) -> Option<u32> {
        let idx = value - self.min;
        if idx < 0 {
            return None;
        }
        self.map.get(idx as usize).copied()
    }
}

/// Region lookup for one trigger source.
#[derive(Clone, Debug)]
pub struct LookupTable {
    axes: Vec<Axis>,
    /// Region indices per cell of the cross product.
    buckets: Vec<Vec<u32>>,
}

impl LookupTable {
    /// Build the table for note triggers (`trigger_cc == None`) or for
    /// regions started by controller `trigger_cc`.
    pub fn build(instrument: &Instrument, trigger_cc: Option<u8>) -> Self {
        let regions: Vec<(u32, &Region)> = instrument
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| match trigger_cc {
                None => r.lokey >= 0,
                Some(cc) => r.is_cc_triggered(cc),
            })
            .map(|(i, r)| (i as u32, r))
            .collect();

        let mut axes = Vec::new();

        for dim in ALL_DIMS {
            // CC-triggered regions have no key range.
            if trigger_cc.is_some() && dim == Dim::Key {
                continue;
            }
            let used = regions.iter().any(|(_, r)| dim.bounds(r) != dim.trivial());
            if used {
                let (min, max) = dim.range();
                let (map, len) = zone_map(min, max, regions.iter().map(|(_, r)| dim.bounds(r)));
                axes.push(Axis { kind: AxisKind::Dim(dim), min, map, len });
            }
        }

        for cc in 0u8..128 {
            let used = regions.iter().any(|(_, r)| {
                let (lo, hi) = cc_bounds(r, cc, trigger_cc);
                lo > 0 || hi != 127
            });
            if used {
                let (map, len) = zone_map(0, 127, regions.iter().map(|(_, r)| cc_bounds(r, cc, trigger_cc)));
                axes.push(Axis { kind: AxisKind::Cc(cc), min: 0, map, len });
            }
        }

        let size: usize = axes.iter().map(|a| a.len as usize).product();
        let mut buckets = vec![Vec::new(); size.max(1)];

        for &(index, region) in &regions {
            fill(&axes, region, trigger_cc, 0, 0, index, &mut buckets);
        }

        // Premultiply so a query can sum offsets.
        let mut stride = 1u32;
        for axis in axes.iter_mut().rev() {
            for v in &mut axis.map {
                *v *= stride;
            }
            stride *= axis.len;
        }

        Self { axes, buckets }
    }

    /// Regions whose dimensional bounds contain the query, in region order.
    pub fn query(&self, q: &Query<'_>) -> &[u32] {
        let mut offset = 0usize;
        for axis in &self.axes {
            let value = match axis.kind {
                AxisKind::Dim(dim) => dim.value(q),
                AxisKind::Cc(cc) => q.cc[cc as usize] as i32,
            };
            match axis.offset(value) {
                Some(o) => offset += o as usize,
                None => return &[],
            }
        }
        self.buckets.get(offset).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of indexed dimensions.
    pub fn dimensions(&self) -> usize {
        self.axes.len()
    }

    /// Number of bucket cells.
    pub fn cells(&self) -> usize {
        self.buckets.len()
    }
}

fn cc_bounds(r: &Region, cc: u8, trigger_cc: Option<u8>) -> (i32, i32) {
    let c = cc as usize;
    let mut lo = r.locc[c] as i32;
    let mut hi = r.hicc[c] as i32;
    if trigger_cc == Some(cc) {
        lo = lo.max(r.on_locc[c] as i32);
        hi = hi.min(r.on_hicc[c] as i32);
    }
    (lo, hi)
}

/// Build a raw-value-to-zone map over `min..=max` from region bounds.
///
/// Returns the map (unmultiplied) and the number of zones.
fn zone_map(min: i32, max: i32, bounds: impl Iterator<Item = (i32, i32)>) -> (Vec<u32>, u32) {
    let mut cuts = BTreeSet::new();
    cuts.insert(min);
    cuts.insert(max + 1);
    for (lo, hi) in bounds {
        cuts.insert(lo);
        cuts.insert(hi + 1);
    }

    let mut map = vec![0u32; (max - min + 1) as usize];
    let mut value = min;
    let mut zone: i64 = -1;
    for &cut in &cuts {
        while value < cut && value <= max {
            // Values below the first cut cannot occur since `min` is a cut.
            map[(value - min) as usize] = zone.max(0) as u32;
            value += 1;
        }
        zone += 1;
    }
    // The cut at max + 1 closes the last zone; cuts beyond it add nothing.
    let len = map.last().map(|&z| z + 1).unwrap_or(1);
    (map, len)
}

fn fill(
    axes: &[Axis],
    region: &Region,
    trigger_cc: Option<u8>,
    depth: usize,
    cell: usize,
    index: u32,
    buckets: &mut [Vec<u32>],
) {
    let Some(axis) = axes.get(depth) else {
        if let Some(bucket) = buckets.get_mut(cell) {
            bucket.push(index);
        }
        return;
    };
    let (lo, hi) = match axis.kind {
        AxisKind::Dim(dim) => dim.fill_bounds(region),
        AxisKind::Cc(cc) => cc_bounds(region, cc, trigger_cc),
    };
    let (Some(first), Some(last)) = (axis.offset(lo), axis.offset(hi)) else {
        return;
    };
    for zone in first..=last {
        fill(axes, region, trigger_cc, depth + 1, cell * axis.len as usize + zone as usize, index, buckets);
    }
}
