//! Engines shared by output device.
//!
//! Channels playing through the same device and format share one engine.
//! Each acquisition is counted; the engine is dropped when the last holder
//! releases it.

use std::collections::BTreeMap;
use std::string::String;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::format::Format;

/// An engine shared between the control thread and the audio thread.
///
/// The audio thread only ever uses `try_lock` and renders silence while
/// the control side holds the lock. Holding it is how the control side
/// disables the engine for a structural change.
pub type SharedEngine = Arc<Mutex<Engine>>;

/// How long the control side waits for the audio thread to let go.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RegistryKey {
    format: Format,
    device: String,
}

struct Entry {
    engine: SharedEngine,
    holders: usize,
}

/// Reference-counted engines keyed by format and output device.
#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<RegistryKey, Entry>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the engine for `format` on `device`, creating it with `config`
    /// if there is none yet.
    pub fn acquire(&mut self, format: Format, device: &str, config: &EngineConfig) -> Result<SharedEngine, EngineError> {
        let key = RegistryKey { format, device: device.into() };
        if let Some(entry) = self.engines.get_mut(&key) {
            entry.holders += 1;
            debug!(format = format.name(), device, holders = entry.holders, "engine shared");
            return Ok(entry.engine.clone());
        }
        let engine = Arc::new(Mutex::new(Engine::new(config.clone(), format)?));
        info!(format = format.name(), device, "engine created");
        self.engines.insert(key, Entry { engine: engine.clone(), holders: 1 });
        Ok(engine)
    }

    /// Drop one hold on the engine for `format` on `device`. Returns true
    /// if that was the last one and the engine was removed.
    pub fn release(&mut self, format: Format, device: &str) -> bool {
        let key = RegistryKey { format, device: device.into() };
        let Some(entry) = self.engines.get_mut(&key) else { return false };
        entry.holders -= 1;
        if entry.holders > 0 {
            return false;
        }
        self.engines.remove(&key);
        info!(format = format.name(), device, "engine destroyed");
        true
    }

    pub fn holders(&self, format: Format, device: &str) -> usize {
        let key = RegistryKey { format, device: device.into() };
        self.engines.get(&key).map_or(0, |e| e.holders)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Every registered engine.
    pub fn engines(&self) -> impl Iterator<Item = (Format, &str, &SharedEngine)> {
        self.engines.iter().map(|(k, e)| (k.format, k.device.as_str(), &e.engine))
    }
}

/// Disable `engine` by taking its lock, waiting at most `timeout` for the
/// audio thread to finish its fragment. The engine is enabled again when
/// the guard drops.
pub fn disable(engine: &SharedEngine, timeout: Duration) -> Result<MutexGuard<'_, Engine>, EngineError> {
    engine.try_lock_for(timeout).ok_or(EngineError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engines_are_shared_per_device_and_format() {
        let mut reg = EngineRegistry::new();
        let config = EngineConfig::default();
        let a = reg.acquire(Format::Sfz, "default", &config).unwrap();
        let b = reg.acquire(Format::Sfz, "default", &config).unwrap();
        let c = reg.acquire(Format::Sf2, "default", &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.holders(Format::Sfz, "default"), 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn last_release_drops_the_engine() {
        let mut reg = EngineRegistry::new();
        let config = EngineConfig::default();
        reg.acquire(Format::Sfz, "hw:0", &config).unwrap();
        reg.acquire(Format::Sfz, "hw:0", &config).unwrap();
        assert!(!reg.release(Format::Sfz, "hw:0"));
        assert!(reg.release(Format::Sfz, "hw:0"));
        assert!(reg.is_empty());
        assert!(!reg.release(Format::Sfz, "hw:0"));
    }

    #[test]
    fn bad_config_is_not_registered() {
        let mut reg = EngineRegistry::new();
        let config = EngineConfig { max_voices: 0, ..EngineConfig::default() };
        assert!(reg.acquire(Format::Sfz, "default", &config).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn disable_times_out_while_held() {
        let mut reg = EngineRegistry::new();
        let engine = reg.acquire(Format::Sfz, "default", &EngineConfig::default()).unwrap();
        let held = engine.lock();
        let other = engine.clone();
        let result = std::thread::spawn(move || disable(&other, Duration::from_millis(20)).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Timeout)));
        drop(held);
        assert!(disable(&engine, Duration::from_millis(20)).is_ok());
    }
}
