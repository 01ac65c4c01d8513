//! WAV file output for captured PCM.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::hardware::CaptureRequest;

/// Frames between header flushes, so an interrupted capture still leaves a
/// readable file behind.
const FLUSH_EVERY_FRAMES: u64 = 44_100;

pub struct RecordingWriter {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    channels: u16,
    frames: u64,
    unflushed: u64,
}

impl RecordingWriter {
    pub fn create(request: &CaptureRequest) -> Result<Self> {
        if request.bits_per_sample != 16 {
            bail!(
                "Unsupported sample width: {} bits (only 16-bit PCM is written)",
                request.bits_per_sample
            );
        }
        let spec = WavSpec {
            channels: request.channels,
            sample_rate: request.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&request.path, spec).with_context(|| {
            format!("Failed to create WAV file {}", request.path.display())
        })?;
        Ok(Self {
            writer,
            path: request.path.clone(),
            channels: request.channels.max(1),
            frames: 0,
            unflushed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append interleaved samples.
    pub fn write_block(&mut self, samples: &[i16]) -> Result<()> {
        for &sample in samples {
            self.writer
                .write_sample(sample)
                .context("Failed to write WAV sample")?;
        }
        let frames = (samples.len() / self.channels as usize) as u64;
        self.frames += frames;
        self.unflushed += frames;
        if self.unflushed >= FLUSH_EVERY_FRAMES {
            self.writer.flush().context("Failed to flush WAV file")?;
            self.unflushed = 0;
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<()> {
        let path = self.path.clone();
        let frames = self.frames;
        self.writer
            .finalize()
            .with_context(|| format!("Failed to finalize WAV file {}", path.display()))?;
        log::debug!("Finalized {} ({} frames)", path.display(), frames);
        Ok(())
    }
}
