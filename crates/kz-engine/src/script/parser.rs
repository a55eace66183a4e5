//! Recursive-descent parser producing the script syntax tree.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::lexer::{Tok, Token};
use crate::error::ScriptError;

/// Event handler kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandlerKind {
    #[default]
    Init,
    Note,
    Release,
    Controller,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] =
        [HandlerKind::Init, HandlerKind::Note, HandlerKind::Release, HandlerKind::Controller];

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "init" => Some(HandlerKind::Init),
            "note" => Some(HandlerKind::Note),
            "release" => Some(HandlerKind::Release),
            "controller" => Some(HandlerKind::Controller),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Var { name: String, line: u32 },
    Index { name: String, index: Box<Expr>, line: u32 },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BitNot(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    /// `a & b & ...`; only valid as a `message()` argument.
    Concat(Vec<Expr>),
    Call { name: String, args: Vec<Expr>, line: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    Global,
    Polyphonic,
    Const,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Declare {
        name: String,
        storage: Storage,
        size: Option<Expr>,
        init: Vec<Expr>,
        line: u32,
    },
    Assign {
        name: String,
        index: Option<Expr>,
        value: Expr,
        line: u32,
    },
    Call(Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Select {
        value: Expr,
        cases: Vec<Case>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Case {
    pub lo: Expr,
    pub hi: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Handler {
    pub kind: HandlerKind,
    pub body: Vec<Stmt>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn word(tok: &Tok, w: &str) -> bool {
    matches!(tok, Tok::Word(x) if x == w)
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        self.tokens.get(self.pos + ahead).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.pos).or(self.tokens.last()).map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error<T>(&self, message: String) -> Result<T, ScriptError> {
        Err(ScriptError::Parse { line: self.line(), message })
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ScriptError> {
        if *self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            self.error(format!("expected {what}, found {:?}", self.peek()))
        }
    }

    fn expect_word(&mut self, w: &str) -> Result<(), ScriptError> {
        if word(self.peek(), w) {
            self.advance();
            Ok(())
        } else {
            self.error(format!("expected `{w}`, found {:?}", self.peek()))
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Tok::Newline {
            self.advance();
        }
    }

    fn end_of_statement(&mut self) -> Result<(), ScriptError> {
        match self.peek() {
            Tok::Newline => {
                self.skip_newlines();
                Ok(())
            }
            Tok::Eof => Ok(()),
            other => self.error(format!("expected end of line, found {other:?}")),
        }
    }

    fn program(&mut self) -> Result<Vec<Handler>, ScriptError> {
        let mut handlers: Vec<Handler> = Vec::new();
        self.skip_newlines();
        while *self.peek() != Tok::Eof {
            self.expect_word("on")?;
            let kind = match self.advance() {
                Tok::Word(name) => match HandlerKind::from_name(&name) {
                    Some(kind) => kind,
                    None => return self.error(format!("unknown event handler `{name}`")),
                },
                other => return self.error(format!("expected handler name, found {other:?}")),
            };
            if handlers.iter().any(|h| h.kind == kind) {
                return self.error(format!("duplicate handler {kind:?}"));
            }
            self.end_of_statement()?;
            let body = self.block(&["end"])?;
            self.expect_word("end")?;
            self.expect_word("on")?;
            self.end_of_statement()?;
            handlers.push(Handler { kind, body });
        }
        Ok(handlers)
    }

    /// Statements up to (not including) one of the `stop` words. `end` only
    /// stops when followed by another word on the same line.
    fn block(&mut self, stop: &[&str]) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if stop.iter().any(|w| word(self.peek(), w)) {
                return Ok(body);
            }
            if *self.peek() == Tok::Eof {
                return self.error("unexpected end of script".into());
            }
            body.push(self.statement()?);
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Word(w) if w == "declare" => {
                self.advance();
                let storage = if word(self.peek(), "polyphonic") {
                    self.advance();
                    Storage::Polyphonic
                } else if word(self.peek(), "const") {
                    self.advance();
                    Storage::Const
                } else {
                    Storage::Global
                };
                let name = match self.advance() {
                    Tok::Var(name) => name,
                    other => return self.error(format!("expected variable name, found {other:?}")),
                };
                let size = if *self.peek() == Tok::LBracket {
                    self.advance();
                    let size = self.expr()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    Some(size)
                } else {
                    None
                };
                let mut init = Vec::new();
                if *self.peek() == Tok::Assign {
                    self.advance();
                    if *self.peek() == Tok::LParen && size.is_some() {
                        self.advance();
                        init.push(self.expr()?);
                        while *self.peek() == Tok::Comma {
                            self.advance();
                            init.push(self.expr()?);
                        }
                        self.expect(Tok::RParen, "`)`")?;
                    } else {
                        init.push(self.expr()?);
                    }
                }
                self.end_of_statement()?;
                Ok(Stmt::Declare { name, storage, size, init, line })
            }
            Tok::Word(w) if w == "if" => {
                self.advance();
                let cond = self.expr()?;
                self.end_of_statement()?;
                let then = self.block(&["else", "end"])?;
                let otherwise = if word(self.peek(), "else") {
                    self.advance();
                    self.end_of_statement()?;
                    self.block(&["end"])?
                } else {
                    Vec::new()
                };
                self.expect_word("end")?;
                self.expect_word("if")?;
                self.end_of_statement()?;
                Ok(Stmt::If { cond, then, otherwise })
            }
            Tok::Word(w) if w == "while" => {
                self.advance();
                let cond = self.expr()?;
                self.end_of_statement()?;
                let body = self.block(&["end"])?;
                self.expect_word("end")?;
                self.expect_word("while")?;
                self.end_of_statement()?;
                Ok(Stmt::While { cond, body })
            }
            Tok::Word(w) if w == "select" => {
                self.advance();
                let value = self.expr()?;
                self.end_of_statement()?;
                let mut cases = Vec::new();
                while word(self.peek(), "case") {
                    self.advance();
                    let lo = self.expr()?;
                    let hi = if word(self.peek(), "to") {
                        self.advance();
                        Some(self.expr()?)
                    } else {
                        None
                    };
                    self.end_of_statement()?;
                    let body = self.block(&["case", "end"])?;
                    cases.push(Case { lo, hi, body });
                }
                self.expect_word("end")?;
                self.expect_word("select")?;
                self.end_of_statement()?;
                Ok(Stmt::Select { value, cases })
            }
            Tok::Var(name) => {
                self.advance();
                let index = if *self.peek() == Tok::LBracket {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    Some(index)
                } else {
                    None
                };
                self.expect(Tok::Assign, "`:=`")?;
                let value = self.expr()?;
                self.end_of_statement()?;
                Ok(Stmt::Assign { name, index, value, line })
            }
            Tok::Word(_) if *self.peek_at(1) == Tok::LParen || matches!(self.peek_at(1), Tok::Newline | Tok::Eof) => {
                let call = self.call()?;
                self.end_of_statement()?;
                Ok(Stmt::Call(call))
            }
            other => self.error(format!("unexpected {other:?}")),
        }
    }

    fn call(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        let name = match self.advance() {
            Tok::Word(name) => name,
            other => return self.error(format!("expected function name, found {other:?}")),
        };
        let mut args = Vec::new();
        if *self.peek() == Tok::LParen {
            self.advance();
            if *self.peek() != Tok::RParen {
                args.push(self.expr()?);
                while *self.peek() == Tok::Comma {
                    self.advance();
                    args.push(self.expr()?);
                }
            }
            self.expect(Tok::RParen, "`)`")?;
        }
        Ok(Expr::Call { name, args, line })
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let first = self.logical()?;
        if *self.peek() != Tok::Amp {
            return Ok(first);
        }
        let mut parts = alloc::vec![first];
        while *self.peek() == Tok::Amp {
            self.advance();
            parts.push(self.logical()?);
        }
        Ok(Expr::Concat(parts))
    }

    fn logical(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Tok::Word(w) if w == "and" => BinOp::And,
                Tok::Word(w) if w == "or" => BinOp::Or,
                Tok::Word(w) if w == ".and." => BinOp::BitAnd,
                Tok::Word(w) if w == ".or." => BinOp::BitOr,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.comparison()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Tok::Lt => BinOp::Lt,
            Tok::Gt => BinOp::Gt,
            Tok::Le => BinOp::Le,
            Tok::Ge => BinOp::Ge,
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Word(w) if w == "mod" => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Tok::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Tok::Word(w) if w == "not" => {
                self.advance();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Tok::Word(w) if w == ".not." => {
                self.advance();
                Ok(Expr::BitNot(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::Int(v))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Tok::Var(name) => {
                self.advance();
                if *self.peek() == Tok::LBracket {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    Ok(Expr::Index { name, index: Box::new(index), line })
                } else {
                    Ok(Expr::Var { name, line })
                }
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Tok::Word(_) => self.call(),
            other => self.error(format!("expected expression, found {other:?}")),
        }
    }
}

/// Parse a token stream into event handlers.
pub fn parse(tokens: Vec<Token>) -> Result<Vec<Handler>, ScriptError> {
    Parser { tokens, pos: 0 }.program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;

    fn handlers(src: &str) -> Vec<Handler> {
        parse(tokenize(src).unwrap()).unwrap()
    }

    #[test]
    fn parses_handlers_and_statements() {
        let src = "
on init
  declare $n := 2
  declare polyphonic $p
  declare %list[3] := (1, 2, 3)
end on

on note
  if ($EVENT_NOTE > 60 and $n = 2)
    play_note($EVENT_NOTE + 12, 100)
  else
    ignore_event($EVENT_ID)
  end if
end on
";
        let hs = handlers(src);
        assert_eq!(hs.len(), 2);
        assert_eq!(hs[0].kind, HandlerKind::Init);
        assert_eq!(hs[0].body.len(), 3);
        match &hs[0].body[2] {
            Stmt::Declare { size: Some(Expr::Int(3)), init, .. } => assert_eq!(init.len(), 3),
            other => panic!("{other:?}"),
        }
        match &hs[1].body[0] {
            Stmt::If { then, otherwise, .. } => {
                assert_eq!(then.len(), 1);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn operator_precedence() {
        let hs = handlers("on init\n$x := 1 + 2 * 3\nend on");
        let Stmt::Assign { value, .. } = &hs[0].body[0] else {
            panic!()
        };
        assert_eq!(
            *value,
            Expr::Bin(
                BinOp::Add,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Bin(BinOp::Mul, Box::new(Expr::Int(2)), Box::new(Expr::Int(3))))
            )
        );
    }

    #[test]
    fn select_with_ranges() {
        let src = "on controller\nselect $CC_NUM\ncase 1\nexit\ncase 2 to 5\nwait(1)\nend select\nend on";
        let hs = handlers(src);
        let Stmt::Select { cases, .. } = &hs[0].body[0] else {
            panic!()
        };
        assert_eq!(cases.len(), 2);
        assert!(cases[1].hi.is_some());
    }

    #[test]
    fn concat_in_message() {
        let hs = handlers("on init\nmessage(\"n=\" & 5)\nend on");
        let Stmt::Call(Expr::Call { args, .. }) = &hs[0].body[0] else {
            panic!()
        };
        assert!(matches!(args[0], Expr::Concat(ref parts) if parts.len() == 2));
    }

    #[test]
    fn errors_report_line() {
        let err = parse(tokenize("on init\n$x := \nend on").unwrap()).unwrap_err();
        assert!(matches!(err, ScriptError::Parse { line: 2, .. }));
        assert!(parse(tokenize("on bogus\nend on").unwrap()).is_err());
        assert!(parse(tokenize("on init\nend on\non init\nend on").unwrap()).is_err());
    }
}
