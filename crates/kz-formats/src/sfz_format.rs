//! SFZ instrument file parser.
//!
//! Produces regions in file order with inherited `<global>`, `<master>`
//! and `<group>` settings already applied. Sample paths are resolved
//! against the including file but not loaded; see [`crate::SfzLoader`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kz_ir::{Curve, Region, BUILTIN_CURVES};
use tracing::{debug, warn};

use crate::sfz_opcodes::{self, Scalars};
use crate::source::SourceFiles;
use crate::FormatError;

const MAX_INCLUDE_DEPTH: usize = 16;
const MAX_CURVES: usize = 256;

/// A parsed SFZ file.
#[derive(Clone, Debug, Default)]
pub struct SfzFile {
    /// Regions in file order. `sample_name` holds the resolved sample path.
    pub regions: Vec<Region>,
    /// Curve table including the built-in linear curves.
    pub curves: Vec<Curve>,
    /// `set_ccN` controller defaults.
    pub initial_cc: Vec<(u8, u8)>,
    /// Resolved path of the instrument script, if any.
    pub script: Option<PathBuf>,
}

/// Parse a key given as a MIDI number or a note name (`c4` is 60, `f#3`
/// is 54, `eb-1` is 3). Returns `None` for anything else.
pub fn parse_key(s: &str) -> Option<i32> {
    let s = s.trim();
    let first = s.chars().next()?;
    if first.is_ascii_digit() || first == '-' {
        let end = s
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
            .map_or(s.len(), |(i, _)| i);
        return s[..end].parse().ok();
    }
    let mut key = match first.to_ascii_lowercase() {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };
    let mut rest = &s[first.len_utf8()..];
    if let Some(r) = rest.strip_prefix('#') {
        key += 1;
        rest = r;
    } else if let Some(r) = rest.strip_prefix(['b', 'B']) {
        key -= 1;
        rest = r;
    }
    let octave: i32 = rest.parse().ok()?;
    Some(key + (octave + 1) * 12)
}

/// Parse the SFZ file at `path`, reading it and its includes through
/// `files`.
pub fn parse_sfz<F: SourceFiles + ?Sized>(path: &Path, files: &F) -> Result<SfzFile, FormatError> {
    let mut parser = Parser::new(files);
    parser.parse_file(path)?;
    Ok(parser.finish())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Global,
    Master,
    Group,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Control,
    Container,
    Region,
    Curve,
    Unknown,
}

#[derive(Debug, Default)]
struct CurveDef {
    index: Option<usize>,
    points: Vec<(u8, f32)>,
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Header(&'a str),
    Opcode(&'a str, &'a str),
}

struct Parser<'f, F: ?Sized> {
    files: &'f F,
    file: String,
    dir: PathBuf,
    line: u32,
    depth: usize,
    macros: BTreeMap<String, String>,
    section: Section,
    /// Open `<global>`/`<master>`/`<group>` definitions, outermost first.
    containers: Vec<(Level, Region)>,
    regions: Vec<Region>,
    curves: Vec<CurveDef>,
    default_path: String,
    note_offset: i32,
    octave_offset: i32,
    initial_cc: Vec<(u8, u8)>,
    script: Option<PathBuf>,
}

impl<'f, F: SourceFiles + ?Sized> Parser<'f, F> {
    fn new(files: &'f F) -> Self {
        Self {
            files,
            file: String::new(),
            dir: PathBuf::new(),
            line: 0,
            depth: 0,
            macros: BTreeMap::new(),
            // Opcodes before the first header go to an implicit <global>.
            section: Section::Container,
            containers: vec![(Level::Global, Region::default())],
            regions: Vec::new(),
            curves: Vec::new(),
            default_path: String::new(),
            note_offset: 0,
            octave_offset: 0,
            initial_cc: Vec::new(),
            script: None,
        }
    }

    fn error(&self, message: String) -> FormatError {
        FormatError::Parse { file: self.file.clone(), line: self.line, message }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    fn parse_file(&mut self, path: &Path) -> Result<(), FormatError> {
        let text = self.files.read_to_string(path)?;
        let saved = (
            std::mem::replace(&mut self.file, path.display().to_string()),
            std::mem::replace(&mut self.dir, path.parent().map(Path::to_path_buf).unwrap_or_default()),
            self.line,
        );
        self.depth += 1;
        let result = self.parse_text(&text);
        self.depth -= 1;
        (self.file, self.dir, self.line) = saved;
        result
    }

    fn parse_text(&mut self, text: &str) -> Result<(), FormatError> {
        for (n, raw) in text.lines().enumerate() {
            self.line = n as u32 + 1;
            let line = match raw.find("//") {
                Some(i) => &raw[..i],
                None => raw,
            };
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("#include") {
                self.include(rest)?;
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("#define") {
                self.define(rest);
                continue;
            }
            for token in tokenize(line) {
                match token {
                    Token::Header(name) => self.push_header(name),
                    Token::Opcode(key, value) => self.push_opcode(key, value)?,
                }
            }
        }
        Ok(())
    }

    fn include(&mut self, rest: &str) -> Result<(), FormatError> {
        let mut quoted = rest.split('"');
        let name = match (quoted.next(), quoted.next(), quoted.next()) {
            (Some(_), Some(name), Some(_)) if !name.is_empty() => name,
            _ => {
                warn!(file = %self.file, line = self.line, "malformed #include");
                return Ok(());
            }
        };
        if self.depth >= MAX_INCLUDE_DEPTH {
            return Err(self.error(format!("#include nested too deeply at `{name}`")));
        }
        let path = self.resolve(name);
        debug!(path = %path.display(), "including");
        self.parse_file(&path)
    }

    fn define(&mut self, rest: &str) {
        let rest = rest.trim();
        let (name, value) = match rest.split_once(|c: char| c.is_whitespace()) {
            Some((name, value)) => (name, value.trim()),
            None => (rest, ""),
        };
        if name.is_empty() || value.is_empty() {
            warn!(file = %self.file, line = self.line, "malformed #define");
            return;
        }
        let Some(bare) = name.strip_prefix('$') else {
            warn!(name, "macro name does not start with `$`");
            return;
        };
        if !bare.chars().all(is_macro_name_char) {
            warn!(name, "macro name contains invalid characters");
        }
        if !value.chars().all(|c| is_macro_name_char(c) || matches!(c, '.' | ' ' | '/' | '\\')) {
            warn!(name, value, "macro value contains invalid characters");
            return;
        }
        self.macros.insert(name.into(), value.into());
    }

    /// Replace `$NAME` references; `None` if one is undefined.
    fn expand(&self, text: &str) -> Option<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(at) = rest.find('$') {
            out.push_str(&rest[..at]);
            let tail = &rest[at + 1..];
            let len = tail.find(|c: char| !is_macro_name_char(c)).unwrap_or(tail.len());
            let name = &rest[at..at + 1 + len];
            match self.macros.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    warn!(file = %self.file, line = self.line, name, "undefined macro");
                    return None;
                }
            }
            rest = &tail[len..];
        }
        out.push_str(rest);
        Some(out)
    }

    fn push_header(&mut self, name: &str) {
        let level = match name {
            "<global>" => Level::Global,
            "<master>" => Level::Master,
            "<group>" => Level::Group,
            "<region>" => {
                self.section = Section::Region;
                let region = self.containers.last().map(|(_, r)| r.clone()).unwrap_or_default();
                self.regions.push(region);
                return;
            }
            "<control>" => {
                self.section = Section::Control;
                self.default_path.clear();
                self.octave_offset = 0;
                self.note_offset = 0;
                return;
            }
            "<curve>" => {
                self.section = Section::Curve;
                self.curves.push(CurveDef::default());
                return;
            }
            _ => {
                warn!(file = %self.file, line = self.line, header = name, "unsupported header");
                self.section = Section::Unknown;
                return;
            }
        };
        while self.containers.last().is_some_and(|(l, _)| *l >= level) {
            self.containers.pop();
        }
        let inherited = self.containers.last().map(|(_, r)| r.clone()).unwrap_or_default();
        self.containers.push((level, inherited));
        self.section = Section::Container;
    }

    fn push_opcode(&mut self, key: &str, value: &str) -> Result<(), FormatError> {
        if self.section == Section::Unknown {
            return Ok(());
        }
        let (Some(key), Some(value)) = (self.expand(key), self.expand(value)) else {
            return Ok(());
        };
        let (key, value) = (key.as_str(), value.trim());

        if self.section == Section::Curve {
            return self.curve_opcode(key, value);
        }

        match key {
            "sample" => {
                let name = if value == "*silence" {
                    value.to_string()
                } else if value.starts_with('*') {
                    warn!(sample = value, "unsupported built-in sample");
                    return Ok(());
                } else {
                    let joined = format!("{}{}", self.default_path, value).replace('\\', "/");
                    self.resolve(&joined).display().to_string()
                };
                if let Some(def) = self.current() {
                    def.sample_name = name;
                }
                return Ok(());
            }
            "default_path" | "octave_offset" | "note_offset" => {
                if self.section != Section::Control {
                    return Ok(());
                }
                match key {
                    "default_path" => self.default_path = value.replace('\\', "/"),
                    "octave_offset" => self.octave_offset = self.scalars().int(value)?,
                    _ => self.note_offset = self.scalars().int(value)?,
                }
                return Ok(());
            }
            "script" => {
                self.script = Some(self.resolve(&value.replace('\\', "/")));
                return Ok(());
            }
            _ => {}
        }

        if let Some(cc) = key.strip_prefix("set_cc") {
            let s = self.scalars();
            let cc = s.int(cc)?;
            if !(0..128).contains(&cc) {
                warn!(opcode = key, "invalid controller number");
                return Ok(());
            }
            let v = s.int(value)?.clamp(0, 127) as u8;
            self.initial_cc.retain(|&(c, _)| c != cc as u8);
            self.initial_cc.push((cc as u8, v));
            return Ok(());
        }

        let s = Scalars {
            file: &self.file,
            line: self.line,
            note_offset: self.note_offset,
            octave_offset: self.octave_offset,
        };
        let def = match self.section {
            Section::Region => self.regions.last_mut(),
            _ => self.containers.last_mut().map(|(_, r)| r),
        };
        let Some(def) = def else { return Ok(()) };
        if !sfz_opcodes::apply(def, key, value, &s)? {
            warn!(file = %s.file, line = s.line, opcode = key, "unsupported opcode");
        }
        Ok(())
    }

    fn curve_opcode(&mut self, key: &str, value: &str) -> Result<(), FormatError> {
        let s = self.scalars();
        let index = if key == "curve_index" {
            Some(s.int(value)?)
        } else {
            None
        };
        let point = match key.strip_prefix('v').map(|n| n.parse::<i32>()) {
            Some(Ok(n)) => Some((n, s.float(value)?)),
            _ => None,
        };
        let Some(curve) = self.curves.last_mut() else { return Ok(()) };
        match (index, point) {
            (Some(i), _) if (0..MAX_CURVES as i32).contains(&i) => curve.index = Some(i as usize),
            (_, Some((n, v))) if (0..128).contains(&n) => curve.points.push((n as u8, v)),
            _ => warn!(opcode = key, value, "invalid <curve> opcode"),
        }
        Ok(())
    }

    fn scalars(&self) -> Scalars<'_> {
        Scalars { file: &self.file, line: self.line, note_offset: self.note_offset, octave_offset: self.octave_offset }
    }

    /// The definition opcodes currently apply to.
    fn current(&mut self) -> Option<&mut Region> {
        match self.section {
            Section::Region => self.regions.last_mut(),
            _ => self.containers.last_mut().map(|(_, r)| r),
        }
    }

    fn finish(self) -> SfzFile {
        let mut curves: Vec<Curve> = (0..BUILTIN_CURVES).map(|_| Curve::linear()).collect();
        for def in &self.curves {
            let index = def.index.unwrap_or(curves.len());
            if index >= MAX_CURVES {
                warn!(index, "too many curves, ignored");
                continue;
            }
            if curves.len() <= index {
                curves.resize_with(index + 1, Curve::linear);
            }
            curves[index] = Curve::from_points(&def.points);
        }
        for (i, r) in self.regions.iter().enumerate() {
            if r.lokey >= 0 && r.hikey >= 0 && r.lokey > r.hikey {
                warn!(region = i, lokey = r.lokey, hikey = r.hikey, "invalid key range");
            }
        }
        SfzFile { regions: self.regions, curves, initial_cc: self.initial_cc, script: self.script }
    }
}

fn is_macro_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split a line into headers and `key=value` opcodes. Words without `=`
/// continue the previous opcode's value, so values may contain spaces.
fn tokenize(line: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut opcode: Option<(usize, usize)> = None;
    let mut pos = 0;
    for word in line.split_whitespace() {
        let mut start = pos + line[pos..].find(word).unwrap_or(0);
        pos = start + word.len();
        let mut word = word;
        while word.starts_with('<') {
            let Some(close) = word.find('>') else { break };
            flush_opcode(&mut tokens, line, opcode.take());
            tokens.push(Token::Header(&line[start..start + close + 1]));
            start += close + 1;
            word = &word[close + 1..];
        }
        if word.is_empty() {
            continue;
        }
        if word.contains('=') {
            flush_opcode(&mut tokens, line, opcode.take());
            opcode = Some((start, pos));
        } else if let Some((_, end)) = opcode.as_mut() {
            *end = pos;
        } else {
            debug!(word, "stray text ignored");
        }
    }
    flush_opcode(&mut tokens, line, opcode);
    tokens
}

fn flush_opcode<'a>(tokens: &mut Vec<Token<'a>>, line: &'a str, span: Option<(usize, usize)>) {
    if let Some((key, value)) = span.and_then(|(start, end)| line[start..end].split_once('=')) {
        tokens.push(Token::Opcode(key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryFiles;
    use kz_ir::{LoopMode, Trigger};

    fn parse(text: &str) -> SfzFile {
        let files = MemoryFiles::new().with("/inst/test.sfz", text);
        parse_sfz(Path::new("/inst/test.sfz"), &files).unwrap()
    }

    #[test]
    fn note_names() {
        assert_eq!(parse_key("c4"), Some(60));
        assert_eq!(parse_key("C#4"), Some(61));
        assert_eq!(parse_key("eb-1"), Some(3));
        assert_eq!(parse_key("a0"), Some(21));
        assert_eq!(parse_key("72"), Some(72));
        assert_eq!(parse_key("-1"), Some(-1));
        assert_eq!(parse_key("h3"), None);
        assert_eq!(parse_key(""), None);
    }

    #[test]
    fn tokenizer_keeps_spaces_in_values() {
        let tokens = tokenize("<region> sample=My Piano C4.wav lokey=60<group>");
        assert_eq!(
            tokens,
            vec![
                Token::Header("<region>"),
                Token::Opcode("sample", "My Piano C4.wav"),
                Token::Opcode("lokey", "60"),
                Token::Header("<group>"),
            ]
        );
    }

    #[test]
    fn headers_inherit_outward_settings() {
        let f = parse(
            "<global> volume=-6
             <group> lokey=36 hikey=47
             <region> sample=a.wav
             <region> sample=b.wav hikey=40
             <group> lovel=64
             <region> sample=c.wav",
        );
        assert_eq!(f.regions.len(), 3);
        assert_eq!(f.regions[0].volume, -6.0);
        assert_eq!((f.regions[0].lokey, f.regions[0].hikey), (36, 47));
        assert_eq!(f.regions[1].hikey, 40);
        // A new group drops the previous group's settings but keeps the global ones.
        assert_eq!((f.regions[2].lokey, f.regions[2].hikey), (0, 127));
        assert_eq!(f.regions[2].lovel, 64);
        assert_eq!(f.regions[2].volume, -6.0);
    }

    #[test]
    fn new_global_resets_masters_and_groups() {
        let f = parse("<master> tune=10 <group> transpose=2 <global> pan=20 <region> sample=x.wav");
        let r = &f.regions[0];
        assert_eq!((r.tune, r.transpose, r.pan), (0, 0, 20.0));
    }

    #[test]
    fn opcodes_before_any_header_are_global() {
        let f = parse("volume=3\n<region> sample=a.wav");
        assert_eq!(f.regions[0].volume, 3.0);
    }

    #[test]
    fn control_offsets_and_default_path() {
        let f = parse(
            "<control> default_path=samples\\piano\\ octave_offset=1 note_offset=-2
             <region> sample=c4.wav key=c3",
        );
        let r = &f.regions[0];
        assert_eq!(r.sample_name, "/inst/samples/piano/c4.wav");
        assert_eq!((r.lokey, r.hikey, r.pitch_keycenter), (58, 58, 58));
    }

    #[test]
    fn comments_and_defines() {
        let f = parse(
            "#define $KEY 62 // the key
             #define $CC 7
             <region> sample=a.wav key=$KEY volume_oncc$CC=-20 // trailing comment
             <region> sample=b.wav key=$MISSING",
        );
        assert_eq!(f.regions[0].lokey, 62);
        assert_eq!(f.regions[0].volume_oncc[0].cc, 7);
        // The opcode with an undefined macro is dropped.
        assert_eq!(f.regions[1].lokey, 0);
    }

    #[test]
    fn includes_resolve_relative_to_the_including_file() {
        let files = MemoryFiles::new()
            .with("/inst/main.sfz", "<group> trigger=release\n#include \"parts/keys.sfz\"\n<region> sample=z.wav")
            .with("/inst/parts/keys.sfz", "<region> sample=k.wav key=60");
        let f = parse_sfz(Path::new("/inst/main.sfz"), &files).unwrap();
        assert_eq!(f.regions.len(), 2);
        assert_eq!(f.regions[0].sample_name, "/inst/parts/k.wav");
        assert_eq!(f.regions[0].trigger, Trigger::RELEASE);
        assert_eq!(f.regions[1].sample_name, "/inst/z.wav");
    }

    #[test]
    fn missing_include_is_an_io_error() {
        let files = MemoryFiles::new().with("/a.sfz", "#include \"nope.sfz\"");
        assert!(matches!(parse_sfz(Path::new("/a.sfz"), &files), Err(FormatError::Io(_))));
    }

    #[test]
    fn bad_number_reports_file_and_line() {
        let files = MemoryFiles::new().with("/a.sfz", "<region>\nsample=a.wav\nvolume=loud");
        match parse_sfz(Path::new("/a.sfz"), &files) {
            Err(FormatError::Parse { file, line, .. }) => {
                assert_eq!(file, "/a.sfz");
                assert_eq!(line, 3);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn curves_by_index_and_in_order() {
        let f = parse(
            "<curve> curve_index=9 v000=1 v127=0
             <curve> v064=0.25",
        );
        assert_eq!(f.curves.len(), 11);
        assert_eq!(f.curves[9].get(0), 1.0);
        assert_eq!(f.curves[9].get(127), 0.0);
        assert_eq!(f.curves[10].get(64), 0.25);
        assert_eq!(f.curves[8], Curve::linear());
    }

    #[test]
    fn set_cc_and_script() {
        let f = parse("<control> set_cc20=90 set_cc20=100 <global> script=scripts/legato.nksp");
        assert_eq!(f.initial_cc, vec![(20, 100)]);
        assert_eq!(f.script, Some(PathBuf::from("/inst/scripts/legato.nksp")));
    }

    #[test]
    fn unknown_headers_swallow_their_opcodes() {
        let f = parse("<effect> volume=-40 <region> sample=a.wav loop_mode=loop_sustain");
        assert_eq!(f.regions[0].volume, 0.0);
        assert_eq!(f.regions[0].loop_mode, LoopMode::Sustain);
    }

    #[test]
    fn silence_sample_is_kept_verbatim() {
        let f = parse("<region> sample=*silence");
        assert_eq!(f.regions[0].sample_name, "*silence");
    }
}
