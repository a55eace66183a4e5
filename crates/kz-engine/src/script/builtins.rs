//! Built-in functions, variables and constants of the script language.

/// Built-in functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    // === Handled by the VM ===
    Wait,
    StopWait,
    Abort,
    Fork,
    Exit,
    CallbackStatus,
    Abs,
    Min,
    Max,
    Random,
    Message,
    Inc,
    Dec,

    // === Handled by the engine ===
    PlayNote,
    NoteOff,
    IgnoreEvent,
    IgnoreController,
    SetController,
    ChangeVol,
    ChangeTune,
    ChangePan,
    ChangeCutoff,
    ChangeReso,
    ChangeAttack,
    ChangeDecay,
    ChangeSustain,
    ChangeRelease,
    ChangeAmpLfoDepth,
    ChangeAmpLfoFreq,
    ChangePitchLfoDepth,
    ChangePitchLfoFreq,
    ChangeCutoffLfoDepth,
    ChangeCutoffLfoFreq,
    ChangeVolTime,
    ChangeTuneTime,
    ChangePanTime,
    ChangeVolCurve,
    ChangeTuneCurve,
    ChangePanCurve,
    FadeIn,
    FadeOut,
    GetEventPar,
    SetEventPar,
    ChangeNote,
    ChangeVelo,
    ChangePlayPos,
    EventStatus,
}

/// `(name, function, min args, max args)`.
const FUNCTIONS: &[(&str, Builtin, u8, u8)] = &[
    ("wait", Builtin::Wait, 1, 1),
    ("stop_wait", Builtin::StopWait, 1, 2),
    ("abort", Builtin::Abort, 1, 1),
    ("fork", Builtin::Fork, 0, 2),
    ("exit", Builtin::Exit, 0, 0),
    ("callback_status", Builtin::CallbackStatus, 1, 1),
    ("abs", Builtin::Abs, 1, 1),
    ("min", Builtin::Min, 2, 2),
    ("max", Builtin::Max, 2, 2),
    ("random", Builtin::Random, 2, 2),
    ("message", Builtin::Message, 1, 1),
    ("inc", Builtin::Inc, 1, 1),
    ("dec", Builtin::Dec, 1, 1),
    ("play_note", Builtin::PlayNote, 1, 4),
    ("note_off", Builtin::NoteOff, 1, 2),
    ("ignore_event", Builtin::IgnoreEvent, 0, 1),
    ("ignore_controller", Builtin::IgnoreController, 0, 1),
    ("set_controller", Builtin::SetController, 2, 2),
    ("change_vol", Builtin::ChangeVol, 2, 3),
    ("change_tune", Builtin::ChangeTune, 2, 3),
    ("change_pan", Builtin::ChangePan, 2, 3),
    ("change_cutoff", Builtin::ChangeCutoff, 2, 3),
    ("change_reso", Builtin::ChangeReso, 2, 3),
    ("change_attack", Builtin::ChangeAttack, 2, 3),
    ("change_decay", Builtin::ChangeDecay, 2, 3),
    ("change_sustain", Builtin::ChangeSustain, 2, 3),
    ("change_release", Builtin::ChangeRelease, 2, 3),
    ("change_amp_lfo_depth", Builtin::ChangeAmpLfoDepth, 2, 3),
    ("change_amp_lfo_freq", Builtin::ChangeAmpLfoFreq, 2, 3),
    ("change_pitch_lfo_depth", Builtin::ChangePitchLfoDepth, 2, 3),
    ("change_pitch_lfo_freq", Builtin::ChangePitchLfoFreq, 2, 3),
    ("change_cutoff_lfo_depth", Builtin::ChangeCutoffLfoDepth, 2, 3),
    ("change_cutoff_lfo_freq", Builtin::ChangeCutoffLfoFreq, 2, 3),
    ("change_vol_time", Builtin::ChangeVolTime, 2, 2),
    ("change_tune_time", Builtin::ChangeTuneTime, 2, 2),
    ("change_pan_time", Builtin::ChangePanTime, 2, 2),
    ("change_vol_curve", Builtin::ChangeVolCurve, 2, 2),
    ("change_tune_curve", Builtin::ChangeTuneCurve, 2, 2),
    ("change_pan_curve", Builtin::ChangePanCurve, 2, 2),
    ("fade_in", Builtin::FadeIn, 2, 2),
    ("fade_out", Builtin::FadeOut, 2, 3),
    ("get_event_par", Builtin::GetEventPar, 2, 2),
    ("set_event_par", Builtin::SetEventPar, 3, 3),
    ("change_note", Builtin::ChangeNote, 2, 2),
    ("change_velo", Builtin::ChangeVelo, 2, 2),
    ("change_play_pos", Builtin::ChangePlayPos, 2, 2),
    ("event_status", Builtin::EventStatus, 1, 1),
];

impl Builtin {
    /// Look up a function with its accepted argument count range.
    pub fn lookup(name: &str) -> Option<(Builtin, u8, u8)> {
        FUNCTIONS.iter().find(|(n, ..)| *n == name).map(|&(_, f, min, max)| (f, min, max))
    }

    pub fn name(self) -> &'static str {
        FUNCTIONS.iter().find(|(_, f, ..)| *f == self).map_or("?", |(n, ..)| n)
    }

    /// True for functions taking a variable by reference.
    pub fn takes_reference(self) -> bool {
        matches!(self, Builtin::Inc | Builtin::Dec)
    }
}

/// Read-only built-in scalar variables whose value depends on the running
/// callback or the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinVar {
    EventId,
    EventNote,
    EventVelocity,
    CcNum,
    CallbackId,
    EngineUptime,
}

/// Read-only built-in arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinArray {
    /// `%CC[]`: controller values of the channel.
    Cc,
    /// `%KEY_DOWN[]`: 1 for held keys.
    KeyDown,
}

/// `get_event_par`/`set_event_par` selectors.
pub const EVENT_PAR_NOTE: i64 = 1;
pub const EVENT_PAR_VELOCITY: i64 = 2;
pub const EVENT_PAR_VOLUME: i64 = 3;
pub const EVENT_PAR_TUNE: i64 = 4;
pub const EVENT_PAR_0: i64 = 1024;

pub const EVENT_STATUS_INACTIVE: i64 = 0;
pub const EVENT_STATUS_NOTE_QUEUE: i64 = 1;

pub const CALLBACK_STATUS_TERMINATED: i64 = 0;
pub const CALLBACK_STATUS_QUEUE: i64 = 1;
pub const CALLBACK_STATUS_RUNNING: i64 = 2;

/// Largest value of normalized parameters such as `change_cutoff`.
pub const PARAM_MAX: i64 = 1_000_000;

pub fn variable(name: &str) -> Option<BuiltinVar> {
    Some(match name {
        "$EVENT_ID" => BuiltinVar::EventId,
        "$EVENT_NOTE" => BuiltinVar::EventNote,
        "$EVENT_VELOCITY" => BuiltinVar::EventVelocity,
        "$CC_NUM" => BuiltinVar::CcNum,
        "$NI_CALLBACK_ID" => BuiltinVar::CallbackId,
        "$ENGINE_UPTIME" => BuiltinVar::EngineUptime,
        _ => return None,
    })
}

pub fn array(name: &str) -> Option<BuiltinArray> {
    match name {
        "%CC" => Some(BuiltinArray::Cc),
        "%KEY_DOWN" => Some(BuiltinArray::KeyDown),
        _ => None,
    }
}

pub fn constant(name: &str) -> Option<i64> {
    Some(match name {
        "$EVENT_STATUS_INACTIVE" => EVENT_STATUS_INACTIVE,
        "$EVENT_STATUS_NOTE_QUEUE" => EVENT_STATUS_NOTE_QUEUE,
        "$EVENT_PAR_NOTE" => EVENT_PAR_NOTE,
        "$EVENT_PAR_VELOCITY" => EVENT_PAR_VELOCITY,
        "$EVENT_PAR_VOLUME" => EVENT_PAR_VOLUME,
        "$EVENT_PAR_TUNE" => EVENT_PAR_TUNE,
        "$EVENT_PAR_0" => EVENT_PAR_0,
        "$EVENT_PAR_1" => EVENT_PAR_0 + 1,
        "$EVENT_PAR_2" => EVENT_PAR_0 + 2,
        "$EVENT_PAR_3" => EVENT_PAR_0 + 3,
        "$CALLBACK_STATUS_TERMINATED" => CALLBACK_STATUS_TERMINATED,
        "$CALLBACK_STATUS_QUEUE" => CALLBACK_STATUS_QUEUE,
        "$CALLBACK_STATUS_RUNNING" => CALLBACK_STATUS_RUNNING,
        "$NKSP_LINEAR" => 0,
        "$NKSP_EASE_IN_EASE_OUT" => 1,
        "$VCC_MONO_AT" => kz_ir::CTRL_CHANNEL_PRESSURE as i64,
        "$VCC_PITCH_BEND" => kz_ir::CTRL_PITCH_BEND as i64,
        _ => return None,
    })
}
