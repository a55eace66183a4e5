//! WAV encoding and decoding.
//!
//! Decodes 8/16/24/32-bit integer PCM and 32-bit float, mono or stereo,
//! including `WAVE_FORMAT_EXTENSIBLE` files and loop points from a
//! `smpl` chunk. Encodes planar stereo float to 16-bit PCM.

use crate::FormatError;
use kz_ir::{LoopType, Sample, SampleData};
use std::io::Write;

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

// --- Writing ---

/// Write planar stereo `left`/`right` as a 16-bit PCM WAV stream. The
/// shorter channel bounds the length; samples are clamped to -1..=1.
pub fn write_wav(w: &mut impl Write, left: &[f32], right: &[f32], sample_rate: u32) -> std::io::Result<()> {
    let frames = left.len().min(right.len());
    w.write_all(&header(frames, sample_rate))?;
    let mut block = Vec::with_capacity(4 * 1024);
    for (l, r) in left[..frames].chunks(1024).zip(right[..frames].chunks(1024)) {
        block.clear();
        for (&l, &r) in l.iter().zip(r) {
            block.extend_from_slice(&to_i16(l).to_le_bytes());
            block.extend_from_slice(&to_i16(r).to_le_bytes());
        }
        w.write_all(&block)?;
    }
    Ok(())
}

pub fn planar_to_wav(left: &[f32], right: &[f32], sample_rate: u32) -> Vec<u8> {
    let frames = left.len().min(right.len());
    let mut buf = Vec::with_capacity(44 + frames * 4);
    buf.extend_from_slice(&header(frames, sample_rate));
    for (&l, &r) in left.iter().zip(right) {
        buf.extend_from_slice(&to_i16(l).to_le_bytes());
        buf.extend_from_slice(&to_i16(r).to_le_bytes());
    }
    buf
}

fn to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0) as i16
}

fn header(frames: usize, sample_rate: u32) -> [u8; 44] {
    let num_channels: u16 = 2;
    let bits_per_sample: u16 = 16;
    let block_align = num_channels * (bits_per_sample / 8);
    let data_size = frames as u32 * block_align as u32;

    let mut h = [0u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_size).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&FORMAT_PCM.to_le_bytes());
    h[22..24].copy_from_slice(&num_channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_size.to_le_bytes());
    h
}

// --- Reading ---

/// Load a WAV file from raw bytes into a Sample.
pub fn load_wav(data: &[u8], name: &str) -> Result<Sample, FormatError> {
    let header = parse_header(data)?;
    let end = (header.data_offset + header.data_size).min(data.len());
    let raw = &data[header.data_offset..end];

    let mut sample = Sample::new(name);
    sample.data = decode(raw, &header)?;
    sample.sample_rate = header.sample_rate;
    if let Some((start, end)) = header.sample_loop {
        sample.loop_type = LoopType::Forward;
        sample.loop_start = start;
        sample.loop_end = end;
    }
    Ok(sample)
}

#[derive(Debug)]
struct WavHeader {
    encoding: Encoding,
    num_channels: u16,
    sample_rate: u32,
    data_offset: usize,
    data_size: usize,
    sample_loop: Option<(u32, u32)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Pcm8,
    Pcm16,
    Pcm24,
    Pcm32,
    Float32,
}

impl Encoding {
    fn from_fmt(format: u16, bits: u16) -> Result<Self, FormatError> {
        match (format, bits) {
            (FORMAT_PCM, 8) => Ok(Encoding::Pcm8),
            (FORMAT_PCM, 16) => Ok(Encoding::Pcm16),
            (FORMAT_PCM, 24) => Ok(Encoding::Pcm24),
            (FORMAT_PCM, 32) => Ok(Encoding::Pcm32),
            (FORMAT_FLOAT, 32) => Ok(Encoding::Float32),
            _ => Err(FormatError::UnsupportedFormat(format!("format tag {format}, {bits} bits"))),
        }
    }

    fn bytes(self) -> usize {
        match self {
            Encoding::Pcm8 => 1,
            Encoding::Pcm16 => 2,
            Encoding::Pcm24 => 3,
            Encoding::Pcm32 | Encoding::Float32 => 4,
        }
    }
}

fn parse_header(data: &[u8]) -> Result<WavHeader, FormatError> {
    if data.len() < 12 {
        return Err(FormatError::UnexpectedEof);
    }
    if &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(FormatError::InvalidHeader);
    }

    let mut pos = 12;
    let mut fmt: Option<(Encoding, u16, u32)> = None;
    let mut data_chunk: Option<(usize, usize)> = None;
    let mut sample_loop = None;

    while pos + 8 <= data.len() {
        let chunk_id = &data[pos..pos + 4];
        let chunk_size = read_u32_le(data, pos + 4) as usize;
        let body = pos + 8;

        if chunk_id == b"fmt " {
            if chunk_size < 16 || body + 16 > data.len() {
                return Err(FormatError::UnexpectedEof);
            }
            let mut format = read_u16_le(data, body);
            let channels = read_u16_le(data, body + 2);
            let rate = read_u32_le(data, body + 4);
            let bits = read_u16_le(data, body + 14);
            if format == FORMAT_EXTENSIBLE {
                // The sub-format GUID starts with the plain format tag.
                if chunk_size < 40 || body + 26 > data.len() {
                    return Err(FormatError::UnexpectedEof);
                }
                format = read_u16_le(data, body + 24);
            }
            fmt = Some((Encoding::from_fmt(format, bits)?, channels, rate));
        } else if chunk_id == b"data" {
            data_chunk = Some((body, chunk_size));
        } else if chunk_id == b"smpl" {
            sample_loop = parse_smpl(data, body, chunk_size);
        }

        pos = body.saturating_add(chunk_size);
        if pos % 2 != 0 {
            pos += 1;
        }
    }

    let (encoding, num_channels, sample_rate) = fmt.ok_or(FormatError::InvalidHeader)?;
    let (data_offset, data_size) = data_chunk.ok_or(FormatError::InvalidHeader)?;

    if !(1..=2).contains(&num_channels) {
        return Err(FormatError::UnsupportedFormat(format!("{num_channels} channels")));
    }
    if sample_rate == 0 {
        return Err(FormatError::InvalidHeader);
    }

    Ok(WavHeader { encoding, num_channels, sample_rate, data_offset, data_size, sample_loop })
}

/// First loop of a `smpl` chunk as inclusive frame positions.
fn parse_smpl(data: &[u8], body: usize, size: usize) -> Option<(u32, u32)> {
    if size < 36 + 24 || body + 36 + 24 > data.len() {
        return None;
    }
    let loops = read_u32_le(data, body + 28);
    if loops == 0 {
        return None;
    }
    let first = body + 36;
    let start = read_u32_le(data, first + 8);
    let end = read_u32_le(data, first + 12);
    (end > start).then_some((start, end))
}

fn decode(raw: &[u8], header: &WavHeader) -> Result<SampleData, FormatError> {
    let width = header.encoding.bytes();
    let stereo = header.num_channels == 2;
    let frame = width * header.num_channels as usize;
    if raw.len() < frame && !raw.is_empty() {
        return Err(FormatError::UnexpectedEof);
    }

    match header.encoding {
        Encoding::Pcm8 | Encoding::Pcm16 => {
            let read = |c: &[u8]| match header.encoding {
                // 8-bit WAV is unsigned, centred on 128.
                Encoding::Pcm8 => ((c[0] as i16) - 128) << 8,
                _ => i16::from_le_bytes([c[0], c[1]]),
            };
            if stereo {
                let (l, r) = raw.chunks_exact(frame).map(|f| (read(&f[..width]), read(&f[width..]))).unzip();
                Ok(SampleData::Stereo16(l, r))
            } else {
                Ok(SampleData::Mono16(raw.chunks_exact(width).map(read).collect()))
            }
        }
        Encoding::Pcm24 | Encoding::Pcm32 | Encoding::Float32 => {
            let read = |c: &[u8]| match header.encoding {
                Encoding::Pcm24 => (i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8) as f32 / 8_388_608.0,
                Encoding::Pcm32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2_147_483_648.0,
                _ => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            };
            if stereo {
                let (l, r) = raw.chunks_exact(frame).map(|f| (read(&f[..width]), read(&f[width..]))).unzip();
                Ok(SampleData::StereoF32(l, r))
            } else {
                Ok(SampleData::MonoF32(raw.chunks_exact(width).map(read).collect()))
            }
        }
    }
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
