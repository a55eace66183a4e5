//! Compiled programs shared between channels loading the same script.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::compiler::Program;
use super::compile_source;
use crate::error::ScriptError;

/// Programs keyed by source text. Entries die with their last user.
#[derive(Default)]
pub struct ProgramCache {
    programs: Mutex<BTreeMap<String, Weak<Program>>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled program for `source`, compiling it on a miss.
    pub fn get_or_compile(&self, source: &str) -> Result<Arc<Program>, ScriptError> {
        let mut programs = self.programs.lock();
        if let Some(program) = programs.get(source).and_then(Weak::upgrade) {
            debug!("script cache hit");
            return Ok(program);
        }
        let program = Arc::new(compile_source(source)?);
        programs.retain(|_, p| p.strong_count() > 0);
        programs.insert(source.into(), Arc::downgrade(&program));
        Ok(program)
    }

    /// Number of programs still in use.
    pub fn len(&self) -> usize {
        self.programs.lock().values().filter(|p| p.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "on note\nmessage(1)\nend on";

    #[test]
    fn same_source_shares_program() {
        let cache = ProgramCache::new();
        let a = cache.get_or_compile(SRC).unwrap();
        let b = cache.get_or_compile(SRC).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dropped_programs_are_recompiled() {
        let cache = ProgramCache::new();
        let a = cache.get_or_compile(SRC).unwrap();
        drop(a);
        assert!(cache.is_empty());
        assert!(cache.get_or_compile(SRC).is_ok());
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = ProgramCache::new();
        assert!(cache.get_or_compile("on note\nnope(\nend on").is_err());
        assert!(cache.is_empty());
    }
}
