//! Lowers the syntax tree to a flat instruction list.
//!
//! Flat code lets a suspended callback be resumed from nothing more than an
//! instruction index and its value stack.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::builtins::{self, Builtin, BuiltinArray, BuiltinVar};
use super::parser::{BinOp, Expr, Handler, HandlerKind, Stmt, Storage};
use crate::error::ScriptError;

/// Global variable cells (scalars plus array elements) per script.
pub const MAX_GLOBAL_CELLS: usize = 65_536;
/// Polyphonic variables per script.
pub const MAX_POLY_VARS: usize = crate::note::NOTE_POLY_VARS;

/// Arguments one call may pass, `message()` parts included.
pub const MAX_CALL_ARGS: usize = 16;

/// One VM instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Push(i64),
    PushStr(u16),
    Load(u32),
    Store(u32),
    LoadPoly(u16),
    StorePoly(u16),
    /// Pops an index.
    LoadElem { base: u32, len: u32 },
    /// Pops a value, then an index.
    StoreElem { base: u32, len: u32 },
    LoadVar(BuiltinVar),
    /// Pops an index.
    LoadArray(BuiltinArray),
    Neg,
    Not,
    BitNot,
    Bin(BinOp),
    Jump(u32),
    JumpIfFalse(u32),
    /// Pops `argc` arguments and pushes the result.
    Call { f: Builtin, argc: u8 },
    Pop,
    /// End of a handler.
    Exit,
}

/// A compiled script, shared read-only by every channel running it.
#[derive(Debug)]
pub struct Program {
    pub(crate) code: Vec<Op>,
    pub(crate) strings: Vec<String>,
    pub(crate) entries: [Option<u32>; 4],
    /// Global cells, scalars and array elements.
    pub(crate) globals: usize,
    pub(crate) poly: usize,
}

impl Program {
    pub fn has_handler(&self, kind: HandlerKind) -> bool {
        self.entries[kind.index()].is_some()
    }

    pub fn entry(&self, kind: HandlerKind) -> Option<u32> {
        self.entries[kind.index()]
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
enum Symbol {
    Global(u32),
    Array { base: u32, len: u32 },
    Poly(u16),
    Const(i64),
}

struct Compiler {
    code: Vec<Op>,
    strings: Vec<String>,
    symbols: BTreeMap<String, Symbol>,
    globals: usize,
    poly: usize,
    in_init: bool,
}

impl Compiler {
    fn emit(&mut self, op: Op) -> u32 {
        self.code.push(op);
        (self.code.len() - 1) as u32
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn patch(&mut self, at: u32, target: u32) {
        match &mut self.code[at as usize] {
            Op::Jump(t) | Op::JumpIfFalse(t) => *t = target,
            _ => {}
        }
    }

    fn alloc_globals(&mut self, n: usize, line: u32) -> Result<u32, ScriptError> {
        if self.globals + n > MAX_GLOBAL_CELLS {
            return Err(ScriptError::TooManyVariables { line });
        }
        let base = self.globals as u32;
        self.globals += n;
        Ok(base)
    }

    fn const_value(&self, expr: &Expr) -> Option<i64> {
        Some(match expr {
            Expr::Int(v) => *v,
            Expr::Var { name, .. } => match self.symbols.get(name) {
                Some(Symbol::Const(v)) => *v,
                Some(_) => return None,
                None => builtins::constant(name)?,
            },
            Expr::Neg(e) => self.const_value(e)?.wrapping_neg(),
            Expr::Bin(op, a, b) => {
                let (a, b) = (self.const_value(a)?, self.const_value(b)?);
                match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div if b != 0 => a / b,
                    BinOp::Mod if b != 0 => a % b,
                    _ => return None,
                }
            }
            _ => return None,
        })
    }

    fn handler(&mut self, h: &Handler) -> Result<u32, ScriptError> {
        let entry = self.here();
        self.in_init = h.kind == HandlerKind::Init;
        self.block(&h.body)?;
        self.emit(Op::Exit);
        Ok(entry)
    }

    fn block(&mut self, body: &[Stmt]) -> Result<(), ScriptError> {
        body.iter().try_for_each(|s| self.stmt(s))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), ScriptError> {
        match stmt {
            Stmt::Declare { name, storage, size, init, line } => self.declare(name, *storage, size.as_ref(), init, *line),
            Stmt::Assign { name, index, value, line } => self.assign(name, index.as_ref(), value, *line),
            Stmt::Call(call) => {
                self.expr(call)?;
                self.emit(Op::Pop);
                Ok(())
            }
            Stmt::If { cond, then, otherwise } => {
                self.expr(cond)?;
                let to_else = self.emit(Op::JumpIfFalse(0));
                self.block(then)?;
                if otherwise.is_empty() {
                    let end = self.here();
                    self.patch(to_else, end);
                } else {
                    let to_end = self.emit(Op::Jump(0));
                    let else_at = self.here();
                    self.patch(to_else, else_at);
                    self.block(otherwise)?;
                    let end = self.here();
                    self.patch(to_end, end);
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                let top = self.here();
                self.expr(cond)?;
                let to_end = self.emit(Op::JumpIfFalse(0));
                self.block(body)?;
                self.emit(Op::Jump(top));
                let end = self.here();
                self.patch(to_end, end);
                Ok(())
            }
            Stmt::Select { value, cases } => {
                // The selector is evaluated once into a hidden cell.
                let tmp = self.alloc_globals(1, 0)?;
                self.expr(value)?;
                self.emit(Op::Store(tmp));
                let mut to_end = Vec::with_capacity(cases.len());
                for case in cases {
                    self.emit(Op::Load(tmp));
                    self.expr(&case.lo)?;
                    match &case.hi {
                        None => {
                            self.emit(Op::Bin(BinOp::Eq));
                        }
                        Some(hi) => {
                            self.emit(Op::Bin(BinOp::Ge));
                            self.emit(Op::Load(tmp));
                            self.expr(hi)?;
                            self.emit(Op::Bin(BinOp::Le));
                            self.emit(Op::Bin(BinOp::And));
                        }
                    }
                    let next = self.emit(Op::JumpIfFalse(0));
                    self.block(&case.body)?;
                    to_end.push(self.emit(Op::Jump(0)));
                    let here = self.here();
                    self.patch(next, here);
                }
                let end = self.here();
                for at in to_end {
                    self.patch(at, end);
                }
                Ok(())
            }
        }
    }

    fn declare(
        &mut self,
        name: &str,
        storage: Storage,
        size: Option<&Expr>,
        init: &[Expr],
        line: u32,
    ) -> Result<(), ScriptError> {
        let parse_err = |message: String| ScriptError::Parse { line, message };
        if !self.in_init {
            return Err(parse_err(format!("`{name}` must be declared in the init handler")));
        }
        if self.symbols.contains_key(name) || builtins::constant(name).is_some() || builtins::variable(name).is_some() {
            return Err(parse_err(format!("`{name}` is already declared")));
        }
        let is_array = name.starts_with('%');
        if is_array != size.is_some() {
            return Err(parse_err(format!("`{name}`: arrays need `%` and a size")));
        }
        if name.starts_with('@') {
            return Err(parse_err(format!("`{name}`: string variables are not supported")));
        }

        match (storage, size) {
            (Storage::Const, None) => {
                let value = match init {
                    [e] => self.const_value(e),
                    _ => None,
                }
                .ok_or_else(|| parse_err(format!("`{name}` needs a constant value")))?;
                self.symbols.insert(name.into(), Symbol::Const(value));
            }
            (Storage::Polyphonic, None) => {
                if self.poly >= MAX_POLY_VARS {
                    return Err(ScriptError::TooManyVariables { line });
                }
                let slot = self.poly as u16;
                self.poly += 1;
                self.symbols.insert(name.into(), Symbol::Poly(slot));
                if let [e] = init {
                    self.expr(e)?;
                    self.emit(Op::StorePoly(slot));
                }
            }
            (Storage::Global, None) => {
                let slot = self.alloc_globals(1, line)?;
                self.symbols.insert(name.into(), Symbol::Global(slot));
                if let [e] = init {
                    self.expr(e)?;
                    self.emit(Op::Store(slot));
                }
            }
            (Storage::Global | Storage::Const, Some(size)) => {
                let len = self
                    .const_value(size)
                    .filter(|&n| n > 0)
                    .ok_or_else(|| parse_err(format!("`{name}` needs a positive constant size")))?;
                if init.len() > len as usize {
                    return Err(parse_err(format!("`{name}`: too many initializers")));
                }
                let base = self.alloc_globals(len as usize, line)?;
                let len = len as u32;
                self.symbols.insert(name.into(), Symbol::Array { base, len });
                for (i, e) in init.iter().enumerate() {
                    self.emit(Op::Push(i as i64));
                    self.expr(e)?;
                    self.emit(Op::StoreElem { base, len });
                }
            }
            (Storage::Polyphonic, Some(_)) => {
                return Err(parse_err(format!("`{name}`: polyphonic arrays are not supported")));
            }
        }
        Ok(())
    }

    fn not_assignable(&self, name: &str, line: u32) -> ScriptError {
        let known = self.symbols.contains_key(name)
            || builtins::constant(name).is_some()
            || builtins::variable(name).is_some()
            || builtins::array(name).is_some();
        if known {
            ScriptError::NotAssignable { line, name: name.into() }
        } else {
            ScriptError::UnknownIdentifier { line, name: name.into() }
        }
    }

    /// Store the value on top of the stack into scalar `name`.
    fn store(&mut self, name: &str, line: u32) -> Result<(), ScriptError> {
        match self.symbols.get(name).copied() {
            Some(Symbol::Global(slot)) => self.emit(Op::Store(slot)),
            Some(Symbol::Poly(slot)) => self.emit(Op::StorePoly(slot)),
            _ => return Err(self.not_assignable(name, line)),
        };
        Ok(())
    }

    fn assign(&mut self, name: &str, index: Option<&Expr>, value: &Expr, line: u32) -> Result<(), ScriptError> {
        match (self.symbols.get(name).copied(), index) {
            (Some(Symbol::Array { base, len }), Some(index)) => {
                self.expr(index)?;
                self.expr(value)?;
                self.emit(Op::StoreElem { base, len });
                Ok(())
            }
            (_, None) => {
                if !matches!(self.symbols.get(name), Some(Symbol::Global(_) | Symbol::Poly(_))) {
                    return Err(self.not_assignable(name, line));
                }
                self.expr(value)?;
                self.store(name, line)
            }
            _ => Err(self.not_assignable(name, line)),
        }
    }

    fn load(&mut self, name: &str, line: u32) -> Result<(), ScriptError> {
        match self.symbols.get(name).copied() {
            Some(Symbol::Global(slot)) => self.emit(Op::Load(slot)),
            Some(Symbol::Poly(slot)) => self.emit(Op::LoadPoly(slot)),
            Some(Symbol::Const(v)) => self.emit(Op::Push(v)),
            Some(Symbol::Array { .. }) => {
                return Err(ScriptError::Parse { line, message: format!("`{name}` needs an index") });
            }
            None => match (builtins::constant(name), builtins::variable(name)) {
                (Some(v), _) => self.emit(Op::Push(v)),
                (None, Some(var)) => self.emit(Op::LoadVar(var)),
                (None, None) => return Err(ScriptError::UnknownIdentifier { line, name: name.into() }),
            },
        };
        Ok(())
    }

    fn load_elem(&mut self, name: &str, index: &Expr, line: u32) -> Result<(), ScriptError> {
        match self.symbols.get(name).copied() {
            Some(Symbol::Array { base, len }) => {
                self.expr(index)?;
                self.emit(Op::LoadElem { base, len });
            }
            Some(_) => return Err(ScriptError::Parse { line, message: format!("`{name}` is not an array") }),
            None => {
                let array = builtins::array(name).ok_or_else(|| ScriptError::UnknownIdentifier { line, name: name.into() })?;
                self.expr(index)?;
                self.emit(Op::LoadArray(array));
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), ScriptError> {
        match expr {
            Expr::Int(v) => {
                self.emit(Op::Push(*v));
            }
            Expr::Str(_) | Expr::Concat(_) => {
                return Err(ScriptError::Parse { line: 0, message: "strings are only allowed in message()".into() });
            }
            Expr::Var { name, line } => self.load(name, *line)?,
            Expr::Index { name, index, line } => self.load_elem(name, index, *line)?,
            Expr::Neg(e) => {
                self.expr(e)?;
                self.emit(Op::Neg);
            }
            Expr::Not(e) => {
                self.expr(e)?;
                self.emit(Op::Not);
            }
            Expr::BitNot(e) => {
                self.expr(e)?;
                self.emit(Op::BitNot);
            }
            Expr::Bin(op, a, b) => {
                self.expr(a)?;
                self.expr(b)?;
                self.emit(Op::Bin(*op));
            }
            Expr::Call { name, args, line } => self.call(name, args, *line)?,
        }
        Ok(())
    }

    fn string_arg(&mut self, e: &Expr) -> Result<(), ScriptError> {
        match e {
            Expr::Str(s) => {
                let idx = self.strings.len() as u16;
                self.strings.push(s.clone());
                self.emit(Op::PushStr(idx));
                Ok(())
            }
            other => self.expr(other),
        }
    }

    fn call(&mut self, name: &str, args: &[Expr], line: u32) -> Result<(), ScriptError> {
        let (f, min, max) =
            Builtin::lookup(name).ok_or_else(|| ScriptError::UnknownFunction { line, name: name.into() })?;
        if args.len() < min as usize || args.len() > max as usize {
            return Err(ScriptError::ArgumentCount { line, name: name.into(), min, max, got: args.len() });
        }

        if f == Builtin::Message {
            let parts: &[Expr] = match &args[0] {
                Expr::Concat(parts) => parts,
                single => core::slice::from_ref(single),
            };
            if parts.len() > MAX_CALL_ARGS {
                return Err(ScriptError::Parse { line, message: "message() has too many parts".into() });
            }
            for part in parts {
                self.string_arg(part)?;
            }
            self.emit(Op::Call { f, argc: parts.len() as u8 });
            return Ok(());
        }

        if f.takes_reference() {
            let delta = if f == Builtin::Inc { BinOp::Add } else { BinOp::Sub };
            match &args[0] {
                Expr::Var { name, line } => {
                    self.load(name, *line)?;
                    self.emit(Op::Push(1));
                    self.emit(Op::Bin(delta));
                    self.store(name, *line)?;
                    self.load(name, *line)?;
                }
                Expr::Index { name, index, line } => {
                    let Some(Symbol::Array { base, len }) = self.symbols.get(name.as_str()).copied() else {
                        return Err(ScriptError::NotAssignable { line: *line, name: name.clone() });
                    };
                    self.expr(index)?;
                    self.expr(index)?;
                    self.emit(Op::LoadElem { base, len });
                    self.emit(Op::Push(1));
                    self.emit(Op::Bin(delta));
                    self.emit(Op::StoreElem { base, len });
                    self.expr(index)?;
                    self.emit(Op::LoadElem { base, len });
                }
                _ => {
                    return Err(ScriptError::Parse { line, message: format!("{name}() needs a variable") });
                }
            }
            return Ok(());
        }

        for arg in args {
            self.expr(arg)?;
        }
        self.emit(Op::Call { f, argc: args.len() as u8 });
        Ok(())
    }
}

/// Compile parsed handlers. The init handler is compiled first so its
/// declarations are visible to the others.
pub fn compile(handlers: &[Handler]) -> Result<Program, ScriptError> {
    let mut c = Compiler {
        code: Vec::new(),
        strings: Vec::new(),
        symbols: BTreeMap::new(),
        globals: 0,
        poly: 0,
        in_init: false,
    };
    let mut entries = [None; 4];
    let ordered = handlers
        .iter()
        .filter(|h| h.kind == HandlerKind::Init)
        .chain(handlers.iter().filter(|h| h.kind != HandlerKind::Init));
    for h in ordered {
        entries[h.kind.index()] = Some(c.handler(h)?);
    }
    Ok(Program { code: c.code, strings: c.strings, entries, globals: c.globals, poly: c.poly })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;
    use crate::script::parser::parse;

    fn build(src: &str) -> Result<Program, ScriptError> {
        compile(&parse(tokenize(src).unwrap()).unwrap())
    }

    #[test]
    fn declarations_allocate_cells() {
        let p = build("on init\ndeclare $a\ndeclare %b[4]\ndeclare polyphonic $c\nend on").unwrap();
        assert_eq!(p.globals, 5);
        assert_eq!(p.poly, 1);
        assert!(p.has_handler(HandlerKind::Init));
        assert!(!p.has_handler(HandlerKind::Note));
    }

    #[test]
    fn constants_fold() {
        let p = build("on init\ndeclare const $N := 2 * 3\ndeclare %a[$N + 1]\nend on").unwrap();
        assert_eq!(p.globals, 7);
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(matches!(
            build("on note\n$nope := 1\nend on"),
            Err(ScriptError::UnknownIdentifier { line: 2, .. })
        ));
        assert!(matches!(build("on note\nfrobnicate(1)\nend on"), Err(ScriptError::UnknownFunction { .. })));
        assert!(matches!(build("on note\nplay_note()\nend on"), Err(ScriptError::ArgumentCount { got: 0, .. })));
    }

    #[test]
    fn builtins_are_read_only() {
        assert!(matches!(
            build("on note\n$EVENT_NOTE := 1\nend on"),
            Err(ScriptError::NotAssignable { .. })
        ));
        assert!(build("on init\ndeclare const $K := 1\nend on\non note\n$K := 2\nend on").is_err());
    }

    #[test]
    fn declarations_only_in_init() {
        assert!(build("on note\ndeclare $x\nend on").is_err());
    }

    #[test]
    fn strings_only_in_message() {
        assert!(build("on init\nmessage(\"a\" & 1 & \"b\")\nend on").is_ok());
        assert!(build("on init\ndeclare $x := \"a\"\nend on").is_err());
    }
}
