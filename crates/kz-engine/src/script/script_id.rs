//! IDs handed to scripts.
//!
//! Notes and events live in separate pools whose handles can collide, so
//! note IDs carry bit 31 as a tag. Pool handles always keep that bit clear.

use crate::pool::PoolId;

const NOTE_TAG: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptId {
    Note(PoolId),
    Event(PoolId),
}

impl ScriptId {
    /// Decode a script value. Zero, negative and malformed values are `None`.
    pub fn from_raw(value: i64) -> Option<Self> {
        let raw = u32::try_from(value).ok()?;
        if raw & NOTE_TAG != 0 {
            PoolId::from_raw(raw & !NOTE_TAG).map(ScriptId::Note)
        } else {
            PoolId::from_raw(raw).map(ScriptId::Event)
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            ScriptId::Note(id) => id.raw() | NOTE_TAG,
            ScriptId::Event(id) => id.raw(),
        }
    }

    pub fn note(self) -> Option<PoolId> {
        match self {
            ScriptId::Note(id) => Some(id),
            ScriptId::Event(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_and_event_ids_do_not_collide() {
        let id = PoolId::from_raw(3 | (1 << 20)).unwrap();
        let note = ScriptId::Note(id).raw();
        let event = ScriptId::Event(id).raw();
        assert_ne!(note, event);
        assert_eq!(ScriptId::from_raw(note as i64), Some(ScriptId::Note(id)));
        assert_eq!(ScriptId::from_raw(event as i64), Some(ScriptId::Event(id)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(ScriptId::from_raw(0), None);
        assert_eq!(ScriptId::from_raw(-5), None);
        assert_eq!(ScriptId::from_raw(1 << 40), None);
    }
}
