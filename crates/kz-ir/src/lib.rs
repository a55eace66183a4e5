//! Core data model for the keyzone sampler.
//!
//! Instrument loaders emit these types and the real-time engine consumes
//! them. Regions, curves and samples are immutable once an instrument is
//! loaded; events are small plain values that live in engine pools.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod curve;
mod event;
mod instrument;
pub mod modulation;
mod region;
mod sample;

pub use curve::{Curve, BUILTIN_CURVES};
pub use event::{Event, EventKind, SynthParam, SysexData, SYSEX_MAX};
pub use instrument::Instrument;
pub use modulation::{
    AdsrDefinition, CcBinding, CcList, EgDefinition, EgNode, EqBand, LfoDefinition,
    LfoV1Definition, LfoWave, CTRL_CHANNEL_PRESSURE, CTRL_PITCH_BEND, CTRL_TABLE_SIZE,
};
pub use region::{FilterType, LoopMode, OffMode, Region, SwVel, Trigger, XfCcRange, XfCurve};
pub use sample::{LoopType, Sample, SampleData, SampleKey};
