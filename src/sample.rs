//! Sample buffers and interpolated reads
//!
//! Samples are fully resident stereo buffers shared between voices through
//! `Arc`. Mono files are stored with both channel slices pointing at the
//! same data. Reads interpolate at a fractional cursor; the interpolation
//! order follows the voice's `sample_quality` setting (0..=10), where 0-1
//! is linear and 2+ uses 4-point Hermite.

use crate::error::EngineError;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct SampleBuffer {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_rate: f32,
    stereo: bool,
}

impl SampleBuffer {
    pub fn new(left: Vec<f32>, right: Vec<f32>, sample_rate: f32) -> Self {
        debug_assert_eq!(left.len(), right.len());
        Self {
            left,
            right,
            sample_rate,
            stereo: true,
        }
    }

    pub fn from_mono(data: Vec<f32>, sample_rate: f32) -> Self {
        Self {
            right: data.clone(),
            left: data,
            sample_rate,
            stereo: false,
        }
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    /// Linear interpolation at a fractional frame position.
    #[inline]
    pub fn frame_linear(&self, position: f64) -> (f32, f32) {
        let len = self.len();
        if len == 0 || position < 0.0 {
            return (0.0, 0.0);
        }
        let idx = position as usize;
        if idx >= len {
            return (0.0, 0.0);
        }
        let frac = (position - idx as f64) as f32;
        let next = (idx + 1).min(len - 1);
        let l = self.left[idx] * (1.0 - frac) + self.left[next] * frac;
        let r = self.right[idx] * (1.0 - frac) + self.right[next] * frac;
        (l, r)
    }

    /// 4-point Hermite interpolation at a fractional frame position.
    #[inline]
    pub fn frame_hermite(&self, position: f64) -> (f32, f32) {
        let len = self.len();
        if len == 0 || position < 0.0 {
            return (0.0, 0.0);
        }
        let idx = position as usize;
        if idx >= len {
            return (0.0, 0.0);
        }
        let frac = (position - idx as f64) as f32;
        let i0 = idx.saturating_sub(1);
        let i1 = idx;
        let i2 = (idx + 1).min(len - 1);
        let i3 = (idx + 2).min(len - 1);

        let hermite = |xm1: f32, x0: f32, x1: f32, x2: f32| -> f32 {
            let c = (x1 - xm1) * 0.5;
            let v = x0 - x1;
            let w = c + v;
            let a = w + v + (x2 - x0) * 0.5;
            let b = w + a;
            ((a * frac - b) * frac + c) * frac + x0
        };

        (
            hermite(self.left[i0], self.left[i1], self.left[i2], self.left[i3]),
            hermite(self.right[i0], self.right[i1], self.right[i2], self.right[i3]),
        )
    }

    /// Interpolated read at the configured quality.
    #[inline]
    pub fn frame_at(&self, position: f64, quality: u8) -> (f32, f32) {
        if quality >= 2 {
            self.frame_hermite(position)
        } else {
            self.frame_linear(position)
        }
    }
}

/// Load a WAV file into a shared buffer. Supports 16/24-bit integer and
/// 32-bit float, mono or stereo; other layouts are rejected.
pub fn load_wav(path: impl AsRef<Path>) -> Result<Arc<SampleBuffer>, EngineError> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    if spec.channels == 0 || spec.channels > 2 {
        return Err(EngineError::SampleFormat(format!(
            "{} channels in {}",
            spec.channels,
            path.display()
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let buffer = if spec.channels == 2 {
        let frames = interleaved.len() / 2;
        let mut left = Vec::with_capacity(frames);
        let mut right = Vec::with_capacity(frames);
        for chunk in interleaved.chunks_exact(2) {
            left.push(chunk[0]);
            right.push(chunk[1]);
        }
        SampleBuffer::new(left, right, spec.sample_rate as f32)
    } else {
        SampleBuffer::from_mono(interleaved, spec.sample_rate as f32)
    };

    debug!(
        path = %path.display(),
        frames = buffer.len(),
        stereo = buffer.is_stereo(),
        "loaded sample"
    );
    Ok(Arc::new(buffer))
}
