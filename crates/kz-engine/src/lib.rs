//! Real-time sampler engine for keyzone.
//!
//! Turns note, controller and script events into stereo audio. Everything
//! reachable from [`Engine::render`] runs on fixed-capacity pools built up
//! front; loading instruments and compiling scripts happen off the audio
//! thread and are swapped in whole.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod bridge;
pub mod config;
mod engine;
mod engine_channel;
pub mod error;
pub mod event_queue;
pub mod filter;
pub mod format;
pub mod lookup_table;
#[cfg(feature = "std")]
pub mod midi_input;
pub mod note;
pub mod pool;
pub mod query;
#[cfg(feature = "std")]
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod stream;
pub mod tables;
pub mod units;
pub mod voice;
pub mod voice_pool;

pub use config::{EngineConfig, SysexScope};
pub use engine::{Engine, MAX_PORTS};
pub use engine_channel::{ChannelState, EngineChannel, EventReceiver, EventSender, PreparedInstrument};
pub use error::{EngineError, ScriptError};
pub use event_queue::EventQueue;
pub use format::{Format, RegionMatcher};
pub use lookup_table::LookupTable;
#[cfg(feature = "std")]
pub use midi_input::{MidiInputPort, MidiParser, MidiPortInfo, MidiPortList};
pub use pool::{Pool, PoolId};
pub use query::Query;
#[cfg(feature = "std")]
pub use registry::{EngineRegistry, SharedEngine, DEFAULT_HANDSHAKE_TIMEOUT};
pub use scheduler::{SchedTime, Scheduler};
#[cfg(feature = "std")]
pub use script::ProgramCache;
pub use voice::{Voice, VoiceKind, VoiceState};
