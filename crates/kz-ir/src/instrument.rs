//! Instruments: regions, curves and the sample bank they reference.

use alloc::string::String;
use alloc::vec::Vec;
use slotmap::SlotMap;

use crate::curve::{Curve, BUILTIN_CURVES};
use crate::region::Region;
use crate::sample::{Sample, SampleKey};

/// A loaded instrument.
///
/// Built by a loader off the audio thread and shared read-only between
/// engine channels afterwards.
#[derive(Clone, Debug)]
pub struct Instrument {
    pub name: String,
    /// Regions in file order; this order is the matching order.
    pub regions: Vec<Region>,
    /// Response curves; the first [`BUILTIN_CURVES`] entries are linear.
    pub curves: Vec<Curve>,
    /// Decoded sample data referenced by regions.
    pub samples: SlotMap<SampleKey, Sample>,
    /// Real-time instrument script source, if any.
    pub script: Option<String>,
    /// Controller values applied when the instrument is loaded (`set_ccN`).
    pub initial_cc: Vec<(u8, u8)>,
}

impl Default for Instrument {
    fn default() -> Self {
        Self::new("")
    }
}

impl Instrument {
    pub fn new(name: &str) -> Self {
        let mut curves = Vec::with_capacity(BUILTIN_CURVES);
        for _ in 0..BUILTIN_CURVES {
            curves.push(Curve::linear());
        }
        Self {
            name: String::from(name),
            regions: Vec::new(),
            curves,
            samples: SlotMap::with_key(),
            script: None,
            initial_cc: Vec::new(),
        }
    }

    /// Resolve the sample a region plays, if it has a non-empty one.
    pub fn sample_for(&self, region: &Region) -> Option<&Sample> {
        region
            .sample
            .and_then(|key| self.samples.get(key))
            .filter(|s| !s.is_empty())
    }

    /// Keys that start at least one region.
    pub fn key_bindings(&self) -> [bool; 128] {
        let mut keys = [false; 128];
        for region in &self.regions {
            if region.lokey < 0 {
                continue;
            }
            let hi = if region.hikey < 0 { 127 } else { region.hikey.min(127) };
            for key in region.lokey.max(0)..=hi {
                keys[key as usize] = true;
            }
        }
        keys
    }

    /// Keys acting as key switches for at least one region.
    pub fn key_switch_bindings(&self) -> [bool; 128] {
        let mut keys = [false; 128];
        for region in &self.regions {
            if region.sw_lokey < 0 || region.sw_hikey < 0 {
                continue;
            }
            for key in region.sw_lokey..=region.sw_hikey.min(127) {
                keys[key as usize] = true;
            }
        }
        keys
    }

    /// Controller numbers that start CC-triggered regions.
    pub fn trigger_ccs(&self) -> impl Iterator<Item = u8> + '_ {
        (0u8..128).filter(move |&cc| self.regions.iter().any(|r| r.is_cc_triggered(cc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleData;

    #[test]
    fn new_instrument_has_builtin_curves() {
        let inst = Instrument::new("piano");
        assert_eq!(inst.curves.len(), BUILTIN_CURVES);
        assert_eq!(inst.name, "piano");
    }

    #[test]
    fn empty_samples_are_not_playable() {
        let mut inst = Instrument::new("x");
        let key = inst.samples.insert(Sample::new("silence"));
        let region = Region { sample: Some(key), ..Region::default() };
        assert!(inst.sample_for(&region).is_none());

        inst.samples[key].data = SampleData::Mono16(vec![1, 2, 3]);
        assert!(inst.sample_for(&region).is_some());
    }

    #[test]
    fn key_bindings_cover_region_ranges() {
        let mut inst = Instrument::new("x");
        inst.regions.push(Region { lokey: 36, hikey: 38, ..Region::default() });
        inst.regions.push(Region { lokey: -1, hikey: -1, ..Region::default() });
        let keys = inst.key_bindings();
        assert!(keys[36] && keys[37] && keys[38]);
        assert!(!keys[35] && !keys[39]);
    }

    #[test]
    fn trigger_ccs_lists_cc_regions() {
        let mut inst = Instrument::new("x");
        let mut region = Region { lokey: -1, hikey: -1, ..Region::default() };
        region.on_locc[20] = 0;
        region.on_hicc[20] = 127;
        inst.regions.push(region);
        let ccs: Vec<u8> = inst.trigger_ccs().collect();
        assert_eq!(ccs, vec![20]);
    }
}
