//! Instrument formats and the region matching strategy each one uses.
//!
//! The engine loop is the same for every format; only the way regions are
//! found for a trigger differs. SFZ instruments can have thousands of
//! regions over many dimensions and use precomputed lookup tables. SF2
//! style instruments are small key/velocity layer stacks and are scanned.

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use kz_ir::{Instrument, Region};

use crate::lookup_table::LookupTable;
use crate::note::MAX_NOTE_VOICES;
use crate::query::{matches_linear, on_key, Query};

/// Regions one trigger can start.
pub type RegionMatches = ArrayVec<u32, MAX_NOTE_VOICES>;

/// Instrument format an engine plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Sfz,
    Sf2,
}

impl Format {
    /// Build the matcher for `instrument`. Allocates; call off the audio thread.
    pub fn matcher(self, instrument: &Instrument) -> Box<dyn RegionMatcher> {
        match self {
            Format::Sfz => Box::new(SfzMatcher::new(instrument)),
            Format::Sf2 => Box::new(Sf2Matcher),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::Sfz => "sfz",
            Format::Sf2 => "sf2",
        }
    }
}

/// Finds the regions a trigger starts.
///
/// `seq_counters` holds one round-robin counter per region; implementations
/// advance the counter of every region passing all other checks. Matches
/// beyond the capacity of `out` are dropped.
pub trait RegionMatcher: Send + Sync {
    fn note_regions(&self, q: &Query<'_>, regions: &[Region], seq_counters: &mut [u32], out: &mut RegionMatches);

    fn cc_regions(
        &self,
        cc: u8,
        q: &Query<'_>,
        regions: &[Region],
        seq_counters: &mut [u32],
        out: &mut RegionMatches,
    );
}

/// Lookup table matcher: one table for keys, one per triggering controller.
pub struct SfzMatcher {
    notes: LookupTable,
    controllers: Vec<(u8, LookupTable)>,
}

impl SfzMatcher {
    pub fn new(instrument: &Instrument) -> Self {
        Self {
            notes: LookupTable::build(instrument, None),
            controllers: instrument.trigger_ccs().map(|cc| (cc, LookupTable::build(instrument, Some(cc)))).collect(),
        }
    }

    /// Number of controller tables.
    pub fn controller_tables(&self) -> usize {
        self.controllers.len()
    }
}

fn collect(
    table: &LookupTable,
    q: &Query<'_>,
    regions: &[Region],
    seq_counters: &mut [u32],
    out: &mut RegionMatches,
) {
    for index in q.matches(table, regions, seq_counters) {
        if out.try_push(index).is_err() {
            break;
        }
    }
}

impl RegionMatcher for SfzMatcher {
    fn note_regions(&self, q: &Query<'_>, regions: &[Region], seq_counters: &mut [u32], out: &mut RegionMatches) {
        collect(&self.notes, q, regions, seq_counters, out);
    }

    fn cc_regions(
        &self,
        cc: u8,
        q: &Query<'_>,
        regions: &[Region],
        seq_counters: &mut [u32],
        out: &mut RegionMatches,
    ) {
        if let Some((_, table)) = self.controllers.iter().find(|(c, _)| *c == cc) {
            collect(table, q, regions, seq_counters, out);
        }
    }
}

/// Linear layer scan.
pub struct Sf2Matcher;

fn scan(
    trigger_cc: Option<u8>,
    q: &Query<'_>,
    regions: &[Region],
    seq_counters: &mut [u32],
    out: &mut RegionMatches,
) {
    for (i, (region, counter)) in regions.iter().zip(seq_counters.iter_mut()).enumerate() {
        if matches_linear(region, q, trigger_cc) && on_key(region, q, counter) && out.try_push(i as u32).is_err() {
            break;
        }
    }
}

impl RegionMatcher for Sf2Matcher {
    fn note_regions(&self, q: &Query<'_>, regions: &[Region], seq_counters: &mut [u32], out: &mut RegionMatches) {
        scan(None, q, regions, seq_counters, out);
    }

    fn cc_regions(
        &self,
        cc: u8,
        q: &Query<'_>,
        regions: &[Region],
        seq_counters: &mut [u32],
        out: &mut RegionMatches,
    ) {
        scan(Some(cc), q, regions, seq_counters, out);
    }
}
