//! Tokenizer for instrument scripts.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::ScriptError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tok {
    Int(i64),
    Str(String),
    /// Variable, including its type sigil (`$x`, `%list`).
    Var(String),
    /// Keyword or function name.
    Word(String),
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    /// `#`, not equal.
    Ne,
    /// `&`, string concatenation.
    Amp,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Newline,
    Eof,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    out: Vec<Token>,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
}

impl Lexer<'_> {
    fn peek(&self, ahead: usize) -> u8 {
        self.src.get(self.pos + ahead).copied().unwrap_or(0)
    }

    fn push(&mut self, tok: Tok) {
        self.out.push(Token { tok, line: self.line });
    }

    fn error(&self, message: String) -> ScriptError {
        ScriptError::Lex { line: self.line, message }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while is_ident(self.peek(0)) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn run(mut self) -> Result<Vec<Token>, ScriptError> {
        while self.pos < self.src.len() {
            let c = self.peek(0);
            match c {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\n' => {
                    self.push(Tok::Newline);
                    self.line += 1;
                    self.pos += 1;
                }
                b'{' => {
                    let line = self.line;
                    while self.pos < self.src.len() && self.peek(0) != b'}' {
                        if self.peek(0) == b'\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    }
                    if self.pos >= self.src.len() {
                        return Err(ScriptError::Lex { line, message: "unterminated comment".into() });
                    }
                    self.pos += 1;
                }
                // Line continuation.
                b'.' if self.peek(1) == b'.' && self.peek(2) == b'.' => {
                    self.pos += 3;
                    while matches!(self.peek(0), b' ' | b'\t' | b'\r') {
                        self.pos += 1;
                    }
                    if self.peek(0) == b'\n' {
                        self.pos += 1;
                        self.line += 1;
                    }
                }
                // Bitwise operators: `.and.`, `.or.`, `.not.`.
                b'.' if is_ident_start(self.peek(1)) => {
                    self.pos += 1;
                    let name = self.word();
                    self.push(Tok::Word(format!(".{name}")));
                }
                b'"' => {
                    self.pos += 1;
                    let start = self.pos;
                    while self.pos < self.src.len() && self.peek(0) != b'"' && self.peek(0) != b'\n' {
                        self.pos += 1;
                    }
                    if self.peek(0) != b'"' {
                        return Err(self.error("unterminated string".into()));
                    }
                    let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                    self.pos += 1;
                    self.push(Tok::Str(text));
                }
                b'$' | b'%' | b'@' | b'~' | b'?' => {
                    if !is_ident_start(self.peek(1)) {
                        return Err(self.error(format!("unexpected `{}`", c as char)));
                    }
                    self.pos += 1;
                    let name = self.word();
                    let mut var = String::with_capacity(name.len() + 1);
                    var.push(c as char);
                    var.push_str(&name);
                    self.push(Tok::Var(var));
                }
                b'0'..=b'9' => {
                    let start = self.pos;
                    let value = if c == b'0' && matches!(self.peek(1), b'x' | b'X') {
                        self.pos += 2;
                        let digits = self.pos;
                        while self.peek(0).is_ascii_hexdigit() {
                            self.pos += 1;
                        }
                        let text = core::str::from_utf8(&self.src[digits..self.pos]).unwrap_or("");
                        i64::from_str_radix(text, 16)
                    } else {
                        while self.peek(0).is_ascii_digit() {
                            self.pos += 1;
                        }
                        let text = core::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
                        text.parse::<i64>()
                    };
                    let value = value.map_err(|_| self.error("invalid number".into()))?;
                    self.push(Tok::Int(value));
                }
                c if is_ident_start(c) => {
                    let word = self.word();
                    self.push(Tok::Word(word));
                }
                _ => {
                    let two = (c, self.peek(1));
                    let (tok, len) = match two {
                        (b':', b'=') => (Tok::Assign, 2),
                        (b'<', b'=') => (Tok::Le, 2),
                        (b'>', b'=') => (Tok::Ge, 2),
                        (b'+', _) => (Tok::Plus, 1),
                        (b'-', _) => (Tok::Minus, 1),
                        (b'*', _) => (Tok::Star, 1),
                        (b'/', _) => (Tok::Slash, 1),
                        (b'<', _) => (Tok::Lt, 1),
                        (b'>', _) => (Tok::Gt, 1),
                        (b'=', _) => (Tok::Eq, 1),
                        (b'#', _) => (Tok::Ne, 1),
                        (b'&', _) => (Tok::Amp, 1),
                        (b'(', _) => (Tok::LParen, 1),
                        (b')', _) => (Tok::RParen, 1),
                        (b'[', _) => (Tok::LBracket, 1),
                        (b']', _) => (Tok::RBracket, 1),
                        (b',', _) => (Tok::Comma, 1),
                        _ => return Err(self.error(format!("unexpected `{}`", c as char))),
                    };
                    self.pos += len;
                    self.push(tok);
                }
            }
        }
        self.push(Tok::Eof);
        Ok(self.out)
    }
}

/// Split `source` into tokens. Comments and line continuations are dropped;
/// newlines are kept because they end statements.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    Lexer { src: source.as_bytes(), pos: 0, line: 1, out: Vec::new() }.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn assignment_line() {
        assert_eq!(
            toks("$x := 0x10 + 2"),
            vec![
                Tok::Var("$x".into()),
                Tok::Assign,
                Tok::Int(16),
                Tok::Plus,
                Tok::Int(2),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn comments_and_continuations_are_skipped() {
        let tokens = tokenize("{ a\ncomment }\nplay_note(60, ...\n 100)").unwrap();
        let words: Vec<&Tok> = tokens.iter().map(|t| &t.tok).collect();
        assert_eq!(words[0], &Tok::Newline);
        assert_eq!(words[1], &Tok::Word("play_note".into()));
        assert!(!words[2..].contains(&&Tok::Newline));
        // Lines are still counted.
        assert_eq!(tokens.last().unwrap().line, 4);
    }

    #[test]
    fn strings_and_comparisons() {
        assert_eq!(
            toks("message(\"hi\" & $n) # <= >="),
            vec![
                Tok::Word("message".into()),
                Tok::LParen,
                Tok::Str("hi".into()),
                Tok::Amp,
                Tok::Var("$n".into()),
                Tok::RParen,
                Tok::Ne,
                Tok::Le,
                Tok::Ge,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn errors_carry_line() {
        let err = tokenize("\n\n$x := ;").unwrap_err();
        assert!(matches!(err, ScriptError::Lex { line: 3, .. }));
        assert!(tokenize("{ open").is_err());
    }
}
