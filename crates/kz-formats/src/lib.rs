//! Instrument and sample loaders for keyzone.
//!
//! Parses SFZ instrument files into the IR and decodes the WAV samples
//! they reference. Everything here runs off the audio thread.

mod loader;
mod sfz_format;
mod sfz_opcodes;
mod source;
mod wav_format;

pub use loader::{load_sfz, SfzLoader};
pub use sfz_format::{parse_key, parse_sfz, SfzFile};
pub use source::{DiskFiles, MemoryFiles, SourceFiles};
pub use wav_format::{load_wav, planar_to_wav, write_wav};

/// Error type for instrument and sample loading.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid file header or magic bytes
    #[error("invalid header")]
    InvalidHeader,

    #[error("unexpected end of file")]
    UnexpectedEof,

    /// Valid container, but an encoding we do not decode
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("{file}:{line}: {message}")]
    Parse { file: String, line: u32, message: String },

    /// A region references a sample file that cannot be found
    #[error("unknown sample `{0}`")]
    UnknownSample(String),
}
