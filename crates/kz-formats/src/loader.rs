//! Builds a ready-to-play [`Instrument`] from an SFZ file and its samples.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use kz_ir::{Instrument, Sample, SampleKey};
use tracing::{info, warn};

use crate::sfz_format::parse_sfz;
use crate::source::{DiskFiles, SourceFiles};
use crate::wav_format::load_wav;
use crate::FormatError;

const SILENCE: &str = "*silence";

/// Loads SFZ instruments through a [`SourceFiles`] implementation.
pub struct SfzLoader<F> {
    files: F,
    strict: bool,
}

impl<F: SourceFiles> SfzLoader<F> {
    pub fn new(files: F) -> Self {
        Self { files, strict: false }
    }

    /// Fail with [`FormatError::UnknownSample`] when a sample file is
    /// missing. By default the region is kept without a sample.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn load(&self, path: &Path) -> Result<Instrument, FormatError> {
        let sfz = parse_sfz(path, &self.files)?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let mut instrument = Instrument::new(&name);
        instrument.curves = sfz.curves;
        instrument.initial_cc = sfz.initial_cc;

        if let Some(script) = &sfz.script {
            match self.files.read_to_string(script) {
                Ok(source) => instrument.script = Some(source),
                Err(e) => warn!(path = %script.display(), error = %e, "instrument script not loaded"),
            }
        }

        // Regions sharing a file share one decoded sample.
        let mut loaded: HashMap<String, Option<SampleKey>> = HashMap::new();
        let mut regions = sfz.regions;
        for region in &mut regions {
            if region.sample_name.is_empty() {
                warn!(lokey = region.lokey, hikey = region.hikey, "region has no sample");
                continue;
            }
            let key = match loaded.get(&region.sample_name) {
                Some(key) => *key,
                None => {
                    let key = self.load_sample(&region.sample_name, &mut instrument)?;
                    loaded.insert(region.sample_name.clone(), key);
                    key
                }
            };
            region.sample = key;
        }
        instrument.regions = regions;

        info!(
            name = %instrument.name,
            regions = instrument.regions.len(),
            samples = instrument.samples.len(),
            "loaded instrument"
        );
        Ok(instrument)
    }

    fn load_sample(&self, name: &str, instrument: &mut Instrument) -> Result<Option<SampleKey>, FormatError> {
        if name == SILENCE {
            return Ok(Some(instrument.samples.insert(Sample::new(SILENCE))));
        }
        let data = match self.files.read(Path::new(name)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.strict {
                    return Err(FormatError::UnknownSample(name.into()));
                }
                warn!(sample = name, "sample not found, region will be silent");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let label = Path::new(name).file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
        match load_wav(&data, &label) {
            Ok(sample) => Ok(Some(instrument.samples.insert(sample))),
            Err(e) if !self.strict => {
                warn!(sample = name, error = %e, "sample not decoded, region will be silent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Load an SFZ instrument and its samples from disk.
pub fn load_sfz(path: impl AsRef<Path>) -> Result<Instrument, FormatError> {
    SfzLoader::new(DiskFiles).load(path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryFiles;
    use crate::wav_format::planar_to_wav;
    use kz_ir::SampleData;

    fn tone() -> Vec<u8> {
        let left: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0) - 0.5).collect();
        planar_to_wav(&left, &left, 22050)
    }

    #[test]
    fn shared_samples_are_loaded_once() {
        let files = MemoryFiles::new()
            .with("/lib/piano.sfz", "<region> sample=c4.wav key=60 <region> sample=c4.wav key=61 set_cc7=100")
            .with("/lib/c4.wav", tone());
        let inst = SfzLoader::new(files).load(Path::new("/lib/piano.sfz")).unwrap();
        assert_eq!(inst.name, "piano");
        assert_eq!(inst.regions.len(), 2);
        assert_eq!(inst.samples.len(), 1);
        assert_eq!(inst.regions[0].sample, inst.regions[1].sample);
        assert_eq!(inst.initial_cc, vec![(7, 100)]);

        let sample = inst.sample_for(&inst.regions[0]).unwrap();
        assert_eq!(sample.sample_rate, 22050);
        assert_eq!(sample.len(), 64);
        assert!(matches!(sample.data, SampleData::Stereo16(..)));
    }

    #[test]
    fn missing_sample_leaves_region_silent() {
        let files = MemoryFiles::new().with("/lib/a.sfz", "<region> sample=gone.wav");
        let inst = SfzLoader::new(files).load(Path::new("/lib/a.sfz")).unwrap();
        assert_eq!(inst.regions.len(), 1);
        assert!(inst.regions[0].sample.is_none());
    }

    #[test]
    fn strict_loader_rejects_missing_sample() {
        let files = MemoryFiles::new().with("/lib/a.sfz", "<region> sample=gone.wav");
        let err = SfzLoader::new(files).strict(true).load(Path::new("/lib/a.sfz")).unwrap_err();
        assert!(matches!(err, FormatError::UnknownSample(name) if name == "/lib/gone.wav"));
    }

    #[test]
    fn silence_is_an_empty_sample() {
        let files = MemoryFiles::new().with("/lib/a.sfz", "<region> sample=*silence");
        let inst = SfzLoader::new(files).load(Path::new("/lib/a.sfz")).unwrap();
        let key = inst.regions[0].sample.unwrap();
        assert!(inst.samples[key].is_empty());
        assert!(inst.sample_for(&inst.regions[0]).is_none());
    }

    #[test]
    fn script_source_is_attached() {
        let files = MemoryFiles::new()
            .with("/lib/a.sfz", "<control> script=s/a.txt <region> sample=*silence")
            .with("/lib/s/a.txt", "on note\nend on\n");
        let inst = SfzLoader::new(files).load(Path::new("/lib/a.sfz")).unwrap();
        assert_eq!(inst.script.as_deref(), Some("on note\nend on\n"));
    }
}
