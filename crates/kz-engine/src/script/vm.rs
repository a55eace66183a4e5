//! Script runtime: per-channel globals plus a pool of resumable callbacks.
//!
//! A callback is a program counter and a value stack. `wait()` and the
//! instruction budget suspend it by returning to the engine, which queues a
//! wake-up through [`ScriptHost::schedule_resume`] and later calls
//! [`ScriptRuntime::run`] again.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;

use arrayvec::ArrayVec;
use tracing::{debug, warn};

use super::builtins::{
    Builtin, BuiltinArray, BuiltinVar, CALLBACK_STATUS_QUEUE, CALLBACK_STATUS_RUNNING, CALLBACK_STATUS_TERMINATED,
};
use super::compiler::{Op, Program, MAX_CALL_ARGS};
use super::parser::{BinOp, HandlerKind};
use crate::note::NOTE_POLY_VARS;
use crate::pool::{Pool, PoolId};

/// Value stack depth of one callback.
pub const STACK_DEPTH: usize = 64;
/// Children one callback may fork.
pub const MAX_FORKS: usize = 8;
/// Longest `message()` output; longer text is cut.
pub const MESSAGE_LEN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Value {
    Int(i64),
    Str(u16),
}

impl Value {
    fn int(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Str(_) => 0,
        }
    }
}

/// What a callback was started for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallbackInfo {
    pub handler: HandlerKind,
    /// Script-visible ID of the triggering note or event.
    pub event: u32,
    /// Note the callback belongs to; polyphonic variables live there.
    pub note: Option<PoolId>,
    pub key: u8,
    pub velocity: u8,
    pub cc: u16,
}

/// When a suspended callback wants to continue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// After this many microseconds.
    After(u64),
    /// At the start of the next fragment.
    NextFragment,
}

/// Result of running a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The handler ended or was aborted; the callback is gone.
    Finished,
    /// The callback is waiting for a scheduled wake-up.
    Suspended,
}

/// Engine services a running callback needs.
pub trait ScriptHost {
    /// Engine-side built-in functions.
    fn call(&mut self, info: &CallbackInfo, f: Builtin, args: &[i64]) -> i64;
    fn variable(&mut self, info: &CallbackInfo, var: BuiltinVar) -> i64;
    fn array(&mut self, array: BuiltinArray, index: i64) -> i64;
    /// Polyphonic variable storage of a live note.
    fn poly_vars(&mut self, note: PoolId) -> Option<&mut [i64]>;
    /// Uniform integer in `lo..=hi`.
    fn random(&mut self, lo: i64, hi: i64) -> i64;
    fn message(&mut self, text: &str);
    /// Queue a wake-up for `callback`. Returns a token for
    /// [`ScriptHost::cancel_resume`], or `None` if nothing could be queued.
    fn schedule_resume(&mut self, callback: PoolId, when: Resume) -> Option<u32>;
    fn cancel_resume(&mut self, token: u32);
}

#[derive(Clone, Debug)]
struct Callback {
    pc: u32,
    stack: ArrayVec<Value, STACK_DEPTH>,
    info: CallbackInfo,
    parent: Option<PoolId>,
    children: ArrayVec<PoolId, MAX_FORKS>,
    /// Aborted together with the parent.
    auto_abort: bool,
    /// `wait()` returns immediately.
    ignore_wait: bool,
    wake: Option<u32>,
    /// Polyphonic storage for callbacks without a note.
    local_poly: [i64; NOTE_POLY_VARS],
}

impl Default for Callback {
    fn default() -> Self {
        Self {
            pc: 0,
            stack: ArrayVec::new(),
            info: CallbackInfo::default(),
            parent: None,
            children: ArrayVec::new(),
            auto_abort: false,
            ignore_wait: false,
            wake: None,
            local_poly: [0; NOTE_POLY_VARS],
        }
    }
}

/// Calls the interpreter loop cannot finish on its own.
enum Trap {
    Exit,
    Wait(i64),
    Budget,
    Fork { count: i64, auto_abort: bool },
    Abort(i64),
    StopWait { target: i64, disable: bool },
    Status(i64),
    Fault,
}

/// Scripts are run by one channel; globals persist between callbacks.
pub struct ScriptRuntime {
    program: Arc<Program>,
    globals: Vec<i64>,
    callbacks: Pool<Callback>,
    /// Instructions one `run` may execute before yielding.
    slice: u32,
    running: Option<PoolId>,
}

impl ScriptRuntime {
    pub fn new(program: Arc<Program>, max_callbacks: usize, slice: u32) -> Self {
        let globals = vec![0; program.globals];
        Self { program, globals, callbacks: Pool::with_capacity(max_callbacks, Callback::default), slice, running: None }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn has_handler(&self, kind: HandlerKind) -> bool {
        self.program.has_handler(kind)
    }

    /// Start a handler. Returns `None` if the script has no such handler or
    /// the callback pool is exhausted.
    pub fn spawn(&mut self, info: CallbackInfo) -> Option<PoolId> {
        let entry = self.program.entry(info.handler)?;
        let Some(id) = self.callbacks.allocate() else {
            warn!(handler = ?info.handler, "script callback pool exhausted");
            return None;
        };
        let cb = self.callbacks.get_mut(id)?;
        cb.pc = entry;
        cb.stack.clear();
        cb.info = info;
        cb.parent = None;
        cb.children.clear();
        cb.auto_abort = false;
        cb.ignore_wait = false;
        cb.wake = None;
        cb.local_poly = [0; NOTE_POLY_VARS];
        Some(id)
    }

    /// `CALLBACK_STATUS_*` of a callback.
    pub fn status(&self, id: PoolId) -> i64 {
        if self.running == Some(id) {
            CALLBACK_STATUS_RUNNING
        } else if self.callbacks.is_live(id) {
            CALLBACK_STATUS_QUEUE
        } else {
            CALLBACK_STATUS_TERMINATED
        }
    }

    pub fn is_live(&self, id: PoolId) -> bool {
        self.callbacks.is_live(id)
    }

    pub fn info(&self, id: PoolId) -> Option<&CallbackInfo> {
        self.callbacks.get(id).map(|cb| &cb.info)
    }

    /// True while any callback still runs on behalf of `note`.
    pub fn references_note(&self, note: PoolId) -> bool {
        self.callbacks.iter().any(|(_, cb)| cb.info.note == Some(note))
    }

    pub fn live_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Drop every callback. Pending wake-ups find nothing to resume.
    pub fn abort_all(&mut self) {
        self.callbacks.clear();
        self.running = None;
    }

    /// Reset globals to zero and drop callbacks; the init handler must be
    /// run again afterwards.
    pub fn reset(&mut self) {
        self.abort_all();
        self.globals.iter_mut().for_each(|g| *g = 0);
    }

    /// End a callback and, recursively, its auto-aborting children.
    pub fn abort(&mut self, id: PoolId, host: &mut dyn ScriptHost) {
        let Some(cb) = self.callbacks.get(id) else { return };
        let children = cb.children.clone();
        if let Some(token) = cb.wake {
            host.cancel_resume(token);
        }
        self.callbacks.free(id);
        for child in children {
            if self.callbacks.get(child).is_some_and(|c| c.auto_abort) {
                self.abort(child, host);
            }
        }
    }

    /// Run or resume a callback until it ends or suspends.
    pub fn run(&mut self, id: PoolId, host: &mut dyn ScriptHost) -> Outcome {
        let Some(cb) = self.callbacks.get_mut(id) else {
            return Outcome::Finished;
        };
        cb.wake = None;
        self.running = Some(id);
        let mut budget = self.slice;
        let outcome = loop {
            let trap = self.exec(id, &mut budget, host);
            let result = match trap {
                Trap::Exit | Trap::Fault => {
                    self.abort(id, host);
                    break Outcome::Finished;
                }
                Trap::Budget => {
                    debug!(callback = id.raw(), "script slice exhausted");
                    break self.suspend(id, Resume::NextFragment, host);
                }
                Trap::Wait(us) => {
                    let ignore = self.callbacks.get(id).is_some_and(|cb| cb.ignore_wait);
                    if us > 0 && !ignore {
                        self.push(id, 0);
                        break self.suspend(id, Resume::After(us as u64), host);
                    }
                    0
                }
                Trap::Fork { count, auto_abort } => self.fork(id, count, auto_abort, host),
                Trap::Abort(target) => {
                    let target = PoolId::from_raw(target as u32);
                    if target == Some(id) {
                        self.abort(id, host);
                        break Outcome::Finished;
                    }
                    if let Some(target) = target {
                        self.abort(target, host);
                    }
                    0
                }
                Trap::StopWait { target, disable } => {
                    self.stop_wait(id, target, disable, host);
                    0
                }
                Trap::Status(target) => {
                    PoolId::from_raw(target as u32).map_or(CALLBACK_STATUS_TERMINATED, |t| self.status(t))
                }
            };
            self.push(id, result);
        };
        self.running = None;
        outcome
    }

    fn push(&mut self, id: PoolId, value: i64) {
        if let Some(cb) = self.callbacks.get_mut(id) {
            // Room was made by popping the call's arguments.
            let _ = cb.stack.try_push(Value::Int(value));
        }
    }

    fn suspend(&mut self, id: PoolId, when: Resume, host: &mut dyn ScriptHost) -> Outcome {
        match host.schedule_resume(id, when) {
            Some(token) => {
                if let Some(cb) = self.callbacks.get_mut(id) {
                    cb.wake = Some(token);
                }
                Outcome::Suspended
            }
            None => {
                warn!(callback = id.raw(), "no room to suspend script callback, aborting it");
                self.abort(id, host);
                Outcome::Finished
            }
        }
    }

    /// Clone the calling callback `count` times. Returns 0 to the parent,
    /// or -1 if the children do not fit.
    fn fork(&mut self, id: PoolId, count: i64, auto_abort: bool, host: &mut dyn ScriptHost) -> i64 {
        let Some(parent) = self.callbacks.get(id).cloned() else { return -1 };
        let count = count.max(0) as usize;
        if parent.children.len() + count > MAX_FORKS || self.callbacks.available() < count {
            warn!(callback = id.raw(), count, "fork() exceeds the callback limit");
            return -1;
        }
        for n in 1..=count {
            let Some(child) = self.callbacks.allocate() else { return -1 };
            if let Some(cb) = self.callbacks.get_mut(child) {
                *cb = Callback { parent: Some(id), children: ArrayVec::new(), auto_abort, wake: None, ..parent.clone() };
                let _ = cb.stack.try_push(Value::Int(n as i64));
            }
            let Some(token) = host.schedule_resume(child, Resume::After(0)) else {
                self.callbacks.free(child);
                return -1;
            };
            if let Some(cb) = self.callbacks.get_mut(child) {
                cb.wake = Some(token);
            }
            if let Some(p) = self.callbacks.get_mut(id) {
                p.children.push(child);
            }
        }
        0
    }

    fn stop_wait(&mut self, current: PoolId, target: i64, disable: bool, host: &mut dyn ScriptHost) {
        let Some(target) = PoolId::from_raw(target as u32) else { return };
        let Some(cb) = self.callbacks.get_mut(target) else { return };
        if disable {
            cb.ignore_wait = true;
        }
        if target == current {
            return;
        }
        if let Some(token) = cb.wake.take() {
            host.cancel_resume(token);
            self.suspend(target, Resume::After(0), host);
        }
    }

    /// The interpreter loop. Returns at the first call needing the
    /// callback pool, or when the callback ends.
    fn exec(&mut self, id: PoolId, budget: &mut u32, host: &mut dyn ScriptHost) -> Trap {
        let ScriptRuntime { program, globals, callbacks, .. } = self;
        let Some(cb) = callbacks.get_mut(id) else { return Trap::Exit };
        let code = &program.code;

        macro_rules! pop {
            () => {
                match cb.stack.pop() {
                    Some(v) => v.int(),
                    None => return Trap::Fault,
                }
            };
        }
        macro_rules! push {
            ($v:expr) => {
                if cb.stack.try_push(Value::Int($v)).is_err() {
                    warn!(callback = id.raw(), "script stack overflow");
                    return Trap::Fault;
                }
            };
        }

        loop {
            if *budget == 0 {
                return Trap::Budget;
            }
            *budget -= 1;
            let Some(&op) = code.get(cb.pc as usize) else { return Trap::Exit };
            cb.pc += 1;
            match op {
                Op::Push(v) => push!(v),
                Op::PushStr(s) => {
                    if cb.stack.try_push(Value::Str(s)).is_err() {
                        return Trap::Fault;
                    }
                }
                Op::Load(slot) => push!(globals[slot as usize]),
                Op::Store(slot) => globals[slot as usize] = pop!(),
                Op::LoadPoly(slot) => {
                    let v = match cb.info.note.and_then(|n| host.poly_vars(n)) {
                        Some(vars) => vars[slot as usize],
                        None => cb.local_poly[slot as usize],
                    };
                    push!(v);
                }
                Op::StorePoly(slot) => {
                    let v = pop!();
                    match cb.info.note.and_then(|n| host.poly_vars(n)) {
                        Some(vars) => vars[slot as usize] = v,
                        None => cb.local_poly[slot as usize] = v,
                    }
                }
                Op::LoadElem { base, len } => {
                    let i = pop!();
                    let v = if (0..len as i64).contains(&i) {
                        globals[(base as i64 + i) as usize]
                    } else {
                        debug!(index = i, len, "array read out of bounds");
                        0
                    };
                    push!(v);
                }
                Op::StoreElem { base, len } => {
                    let v = pop!();
                    let i = pop!();
                    if (0..len as i64).contains(&i) {
                        globals[(base as i64 + i) as usize] = v;
                    } else {
                        debug!(index = i, len, "array write out of bounds");
                    }
                }
                Op::LoadVar(BuiltinVar::CallbackId) => push!(id.raw() as i64),
                Op::LoadVar(var) => {
                    let v = host.variable(&cb.info, var);
                    push!(v);
                }
                Op::LoadArray(array) => {
                    let i = pop!();
                    let v = host.array(array, i);
                    push!(v);
                }
                Op::Neg => {
                    let v = pop!();
                    push!(v.wrapping_neg());
                }
                Op::Not => {
                    let v = pop!();
                    push!((v == 0) as i64);
                }
                Op::BitNot => {
                    let v = pop!();
                    push!(!v);
                }
                Op::Bin(op) => {
                    let b = pop!();
                    let a = pop!();
                    push!(binary(op, a, b));
                }
                Op::Jump(to) => cb.pc = to,
                Op::JumpIfFalse(to) => {
                    if pop!() == 0 {
                        cb.pc = to;
                    }
                }
                Op::Pop => {
                    cb.stack.pop();
                }
                Op::Exit => return Trap::Exit,
                Op::Call { f: Builtin::Message, argc } => {
                    let at = cb.stack.len().saturating_sub(argc as usize);
                    let mut text = heapless::String::<MESSAGE_LEN>::new();
                    for part in &cb.stack[at..] {
                        // Overlong messages are cut.
                        let _ = match *part {
                            Value::Int(v) => write!(text, "{v}"),
                            Value::Str(s) => {
                                let part = program.strings.get(s as usize).map_or("", |s| s.as_str());
                                text.push_str(part).map_err(|_| core::fmt::Error)
                            }
                        };
                    }
                    cb.stack.truncate(at);
                    host.message(&text);
                    push!(0);
                }
                Op::Call { f, argc } => {
                    let mut args = ArrayVec::<i64, MAX_CALL_ARGS>::new();
                    let at = cb.stack.len().saturating_sub(argc as usize);
                    args.extend(cb.stack[at..].iter().map(|v| v.int()));
                    cb.stack.truncate(at);
                    let arg = |i: usize, default: i64| args.get(i).copied().unwrap_or(default);
                    let result = match f {
                        Builtin::Exit => return Trap::Exit,
                        Builtin::Wait => return Trap::Wait(arg(0, 0)),
                        Builtin::Fork => return Trap::Fork { count: arg(0, 1), auto_abort: arg(1, 1) != 0 },
                        Builtin::Abort => return Trap::Abort(arg(0, 0)),
                        Builtin::StopWait => return Trap::StopWait { target: arg(0, 0), disable: arg(1, 0) != 0 },
                        Builtin::CallbackStatus => return Trap::Status(arg(0, 0)),
                        Builtin::Abs => arg(0, 0).wrapping_abs(),
                        Builtin::Min => arg(0, 0).min(arg(1, 0)),
                        Builtin::Max => arg(0, 0).max(arg(1, 0)),
                        Builtin::Random => {
                            let (lo, hi) = (arg(0, 0), arg(1, 0));
                            host.random(lo.min(hi), lo.max(hi))
                        }
                        // Lowered by the compiler.
                        Builtin::Inc | Builtin::Dec | Builtin::Message => 0,
                        _ => host.call(&cb.info, f, &args),
                    };
                    push!(result);
                }
            }
        }
    }
}

fn binary(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.checked_div(b).unwrap_or(0),
        BinOp::Mod => a.checked_rem(b).unwrap_or(0),
        BinOp::Lt => (a < b) as i64,
        BinOp::Gt => (a > b) as i64,
        BinOp::Le => (a <= b) as i64,
        BinOp::Ge => (a >= b) as i64,
        BinOp::Eq => (a == b) as i64,
        BinOp::Ne => (a != b) as i64,
        BinOp::And => (a != 0 && b != 0) as i64,
        BinOp::Or => (a != 0 || b != 0) as i64,
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::compile_source;
    use alloc::string::String;

    /// Host recording calls and wake-ups.
    #[derive(Default)]
    struct TestHost {
        calls: Vec<(Builtin, Vec<i64>)>,
        messages: Vec<String>,
        wakes: Vec<(PoolId, Resume)>,
        cancelled: Vec<u32>,
        poly: [i64; NOTE_POLY_VARS],
    }

    impl ScriptHost for TestHost {
        fn call(&mut self, _info: &CallbackInfo, f: Builtin, args: &[i64]) -> i64 {
            self.calls.push((f, args.to_vec()));
            7
        }
        fn variable(&mut self, info: &CallbackInfo, var: BuiltinVar) -> i64 {
            match var {
                BuiltinVar::EventNote => info.key as i64,
                BuiltinVar::EventVelocity => info.velocity as i64,
                _ => 0,
            }
        }
        fn array(&mut self, _array: BuiltinArray, index: i64) -> i64 {
            index * 2
        }
        fn poly_vars(&mut self, _note: PoolId) -> Option<&mut [i64]> {
            Some(&mut self.poly)
        }
        fn random(&mut self, lo: i64, _hi: i64) -> i64 {
            lo
        }
        fn message(&mut self, text: &str) {
            self.messages.push(text.into());
        }
        fn schedule_resume(&mut self, callback: PoolId, when: Resume) -> Option<u32> {
            self.wakes.push((callback, when));
            Some(self.wakes.len() as u32)
        }
        fn cancel_resume(&mut self, token: u32) {
            self.cancelled.push(token);
        }
    }

    fn runtime(src: &str) -> ScriptRuntime {
        let program = compile_source(src).unwrap();
        ScriptRuntime::new(Arc::new(program), 16, 10_000)
    }

    fn note_info(key: u8) -> CallbackInfo {
        CallbackInfo { handler: HandlerKind::Note, key, velocity: 100, ..Default::default() }
    }

    fn run_init(rt: &mut ScriptRuntime, host: &mut TestHost) {
        let id = rt.spawn(CallbackInfo::default()).unwrap();
        assert_eq!(rt.run(id, host), Outcome::Finished);
    }

    #[test]
    fn arithmetic_and_messages() {
        let mut rt = runtime(
            "on init\ndeclare $x := 7 / 2 + 10 mod 4\ndeclare %a[3] := (1, 2, 3)\n\
             message(\"x=\" & $x & \" a2=\" & %a[2] & \" d=\" & 5 / 0)\nend on",
        );
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        assert_eq!(host.messages, vec![String::from("x=5 a2=3 d=0")]);
    }

    #[test]
    fn control_flow() {
        let mut rt = runtime(
            "on init\ndeclare $i\ndeclare $sum\nwhile ($i < 5)\ninc($i)\nif ($i = 3)\n$sum := $sum + 100\n\
             else\n$sum := $sum + $i\nend if\nend while\nselect $sum\ncase 0 to 100\nmessage(\"low\")\n\
             case 112\nmessage(\"hit\")\nend select\nend on",
        );
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        assert_eq!(host.messages, vec![String::from("hit")]);
    }

    #[test]
    fn engine_calls_see_arguments() {
        let mut rt = runtime("on note\n$r := play_note($EVENT_NOTE + 12, 90)\nend on\non init\ndeclare $r\nend on");
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        let id = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(id, &mut host), Outcome::Finished);
        assert_eq!(host.calls, vec![(Builtin::PlayNote, vec![72, 90])]);
        assert!(!rt.is_live(id));
    }

    #[test]
    fn wait_suspends_and_resumes() {
        let mut rt = runtime("on note\nwait(1000)\nmessage(\"after\")\nend on");
        let mut host = TestHost::default();
        let id = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(id, &mut host), Outcome::Suspended);
        assert_eq!(host.wakes, vec![(id, Resume::After(1000))]);
        assert!(host.messages.is_empty());
        assert_eq!(rt.status(id), CALLBACK_STATUS_QUEUE);
        assert_eq!(rt.run(id, &mut host), Outcome::Finished);
        assert_eq!(host.messages, vec![String::from("after")]);
        assert_eq!(rt.status(id), CALLBACK_STATUS_TERMINATED);
    }

    #[test]
    fn endless_loop_yields_per_slice() {
        let program = compile_source("on note\nwhile (1)\nend while\nend on").unwrap();
        let mut rt = ScriptRuntime::new(Arc::new(program), 4, 100);
        let mut host = TestHost::default();
        let id = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(id, &mut host), Outcome::Suspended);
        assert_eq!(host.wakes, vec![(id, Resume::NextFragment)]);
        rt.abort(id, &mut host);
        assert!(!rt.is_live(id));
        assert_eq!(host.cancelled, vec![1]);
    }

    #[test]
    fn fork_runs_children_after_parent() {
        let mut rt = runtime(
            "on init\ndeclare polyphonic $n\nend on\non note\n$n := fork(2, 0)\nif ($n = 0)\n\
             message(\"parent\")\nelse\nmessage(\"child\" & $n)\nend if\nend on",
        );
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        let id = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(id, &mut host), Outcome::Finished);
        // Children are independent of the parent and queued to run now.
        let children: Vec<PoolId> = host.wakes.iter().map(|&(c, _)| c).collect();
        assert_eq!(children.len(), 2);
        for c in children {
            assert_eq!(rt.run(c, &mut host), Outcome::Finished);
        }
        assert_eq!(host.messages, vec![String::from("parent"), String::from("child1"), String::from("child2")]);
    }

    #[test]
    fn fork_beyond_limit_fails() {
        let mut rt = runtime("on note\nmessage(fork(9))\nend on");
        let mut host = TestHost::default();
        let id = rt.spawn(note_info(60)).unwrap();
        rt.run(id, &mut host);
        assert_eq!(host.messages, vec![String::from("-1")]);
        assert!(host.wakes.is_empty());
    }

    #[test]
    fn auto_abort_children_end_with_parent() {
        let mut rt = runtime("on note\nif (fork(1) = 0)\nexit\nend if\nwait(500)\nend on");
        let mut host = TestHost::default();
        let id = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(id, &mut host), Outcome::Finished);
        let (child, _) = host.wakes[0];
        assert!(!rt.is_live(child));
    }

    #[test]
    fn stop_wait_wakes_sleeper() {
        let mut rt = runtime(
            "on init\ndeclare $sleeper\nend on\non note\n$sleeper := $NI_CALLBACK_ID\nwait(1000000)\nend on\n\
             on release\nstop_wait($sleeper, 1)\nend on",
        );
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        let sleeper = rt.spawn(note_info(60)).unwrap();
        assert_eq!(rt.run(sleeper, &mut host), Outcome::Suspended);
        let waker = rt.spawn(CallbackInfo { handler: HandlerKind::Release, ..note_info(60) }).unwrap();
        assert_eq!(rt.run(waker, &mut host), Outcome::Finished);
        assert_eq!(host.cancelled, vec![1]);
        assert_eq!(host.wakes.last(), Some(&(sleeper, Resume::After(0))));
        assert_eq!(rt.run(sleeper, &mut host), Outcome::Finished);
    }

    #[test]
    fn polyphonic_variables_use_note_storage() {
        let mut rt = runtime("on init\ndeclare polyphonic $p\nend on\non note\n$p := $EVENT_VELOCITY\nend on");
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        let note = PoolId::from_raw(1 << 20).unwrap();
        let id = rt.spawn(CallbackInfo { note: Some(note), ..note_info(60) }).unwrap();
        rt.run(id, &mut host);
        assert_eq!(host.poly[0], 100);
    }

    #[test]
    fn globals_persist_between_callbacks() {
        let mut rt = runtime("on init\ndeclare $count\nend on\non note\ninc($count)\nmessage($count)\nend on");
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        for _ in 0..3 {
            let id = rt.spawn(note_info(60)).unwrap();
            rt.run(id, &mut host);
        }
        assert_eq!(host.messages, vec![String::from("1"), String::from("2"), String::from("3")]);
    }

    #[test]
    fn out_of_bounds_reads_zero() {
        let mut rt = runtime("on init\ndeclare %a[2] := (5, 6)\nmessage(%a[7] + %CC[3])\nend on");
        let mut host = TestHost::default();
        run_init(&mut rt, &mut host);
        assert_eq!(host.messages, vec![String::from("6")]);
    }
}
