//! keyzone CLI: inspect SFZ instruments, render them to WAV, or play a
//! controller configuration live.
//!
//! Usage:
//!   kz-cli info piano.sfz
//!   kz-cli render piano.sfz -o out.wav --note c4:100:0:1 --note e4:90:0.5:1
//!   kz-cli play rig.yaml --note 60

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kz_master::{render, Controller, ControllerConfig, ControllerError, Cue, EngineConfig, RenderOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// SFZ sampler command line
#[derive(Parser)]
#[command(name = "kz-cli")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the regions of an instrument
    Info {
        instrument: PathBuf,
    },

    /// Render notes through an instrument into a WAV file
    Render {
        instrument: PathBuf,

        /// Output WAV path
        #[arg(short, long)]
        output: PathBuf,

        /// KEY[:VELOCITY[:START[:LENGTH]]], key as a number or note name
        #[arg(short, long = "note", value_parser = parse_note)]
        notes: Vec<NoteArg>,

        /// Output sample rate
        #[arg(long, default_value = "44100")]
        rate: u32,

        /// Seconds rendered after the last note-off
        #[arg(long, default_value = "2.0")]
        tail: f64,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Play a controller configuration on the default audio device
    Play {
        config: PathBuf,

        /// Notes sent on MIDI port 0, channel 1
        #[arg(short, long = "note", value_parser = parse_note)]
        notes: Vec<NoteArg>,

        /// Stop after this many seconds
        #[arg(long, default_value = "5")]
        seconds: f64,
    },
}

#[derive(Clone, Copy, Debug)]
struct NoteArg {
    key: u8,
    velocity: u8,
    start: f64,
    length: f64,
}

fn parse_note(s: &str) -> Result<NoteArg, String> {
    let mut parts = s.split(':');
    let key = parts.next().and_then(kz_formats::parse_key).ok_or_else(|| format!("bad key in `{s}`"))?;
    let key = u8::try_from(key).ok().filter(|k| *k < 128).ok_or_else(|| format!("key out of range in `{s}`"))?;
    let mut field = |default: f64| -> Result<f64, String> {
        match parts.next() {
            Some(v) => v.parse().map_err(|_| format!("bad number `{v}` in `{s}`")),
            None => Ok(default),
        }
    };
    let velocity = field(100.0)?.clamp(1.0, 127.0) as u8;
    let start = field(0.0)?.max(0.0);
    let length = field(1.0)?.max(0.0);
    Ok(NoteArg { key, velocity, start, length })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Info { instrument } => info_cmd(&instrument),
        Commands::Render { instrument, output, notes, rate, tail, seed } => {
            render_cmd(&instrument, &output, &notes, rate, tail, seed)
        }
        Commands::Play { config, notes, seconds } => play_cmd(&config, &notes, seconds),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn info_cmd(path: &Path) -> Result<(), ControllerError> {
    let inst = kz_formats::load_sfz(path)?;
    println!("Instrument: {}", inst.name);
    println!("Regions:    {}", inst.regions.len());
    println!("Samples:    {}", inst.samples.len());
    println!("Script:     {}", if inst.script.is_some() { "yes" } else { "no" });
    println!();
    println!("{:>4}  {:>9}  {:>7}  {:>7}  {:>8}  sample", "#", "keys", "vel", "trigger", "frames");
    for (i, r) in inst.regions.iter().enumerate() {
        let frames = inst.sample_for(r).map_or(0, |s| s.len());
        let name = r.sample_name.rsplit('/').next().unwrap_or("");
        println!(
            "{:>4}  {:>4}-{:<4}  {:>3}-{:<3}  {:>7}  {:>8}  {}",
            i,
            r.lokey,
            r.hikey,
            r.lovel,
            r.hivel,
            r.trigger.bits(),
            frames,
            name
        );
    }
    Ok(())
}

fn render_cmd(
    path: &Path,
    output: &Path,
    notes: &[NoteArg],
    rate: u32,
    tail: f64,
    seed: u64,
) -> Result<(), ControllerError> {
    let inst = Arc::new(kz_formats::load_sfz(path)?);
    let cues: Vec<Cue> = notes
        .iter()
        .flat_map(|n| Cue::note(n.start, n.key, n.velocity, n.length))
        .collect();
    let options = RenderOptions {
        config: EngineConfig { sample_rate: rate, ..EngineConfig::default() },
        tail,
        seed,
        ..RenderOptions::default()
    };
    let rendered = render(inst, &cues, &options)?;
    std::fs::write(output, rendered.to_wav()).map_err(kz_master::FormatError::from)?;
    info!(
        path = %output.display(),
        frames = rendered.frames(),
        peak = rendered.peak(),
        "wrote wav"
    );
    Ok(())
}

fn play_cmd(path: &Path, notes: &[NoteArg], seconds: f64) -> Result<(), ControllerError> {
    let config = ControllerConfig::load(path)?;
    let mut ctrl = Controller::new(config)?;
    ctrl.play()?;

    let mut pending: Vec<(f64, [u8; 3])> = notes
        .iter()
        .flat_map(|n| [(n.start, [0x90, n.key, n.velocity]), (n.start + n.length, [0x80, n.key, 64])])
        .collect();
    pending.sort_by(|a, b| a.0.total_cmp(&b.0));

    let started = std::time::Instant::now();
    let mut next = 0;
    while ctrl.is_playing() && started.elapsed().as_secs_f64() < seconds {
        let now = started.elapsed().as_secs_f64();
        while next < pending.len() && pending[next].0 <= now {
            ctrl.midi_in(0, &pending[next].1)?;
            next += 1;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    ctrl.stop();
    info!(frames = ctrl.frames_played(), "done");
    Ok(())
}
