//! Low-frequency oscillators
//!
//! An LFO combines one or more "subs" into a single output. Each sub has a
//! waveform, a frequency ratio, an output scale and offset; the LFO itself
//! has a frequency (in Hz or synced to beats), a start phase, onset delay,
//! fade-in, an optional finite cycle count, and an optional step sequence
//! used in place of a waveform. Frequency and phase are modulation targets,
//! so the current values are passed into [`LfoGenerator::process`] each
//! control tick.

/// Waveforms, in the order instruments number them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LfoWave {
    Triangle,
    Sine,
    Pulse75,
    Square,
    Pulse25,
    Pulse12_5,
    Saw,
    ReverseSaw,
    SampleHold,
}

impl LfoWave {
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => LfoWave::Sine,
            2 => LfoWave::Pulse75,
            3 => LfoWave::Square,
            4 => LfoWave::Pulse25,
            5 => LfoWave::Pulse12_5,
            6 => LfoWave::Saw,
            7 => LfoWave::ReverseSaw,
            8 => LfoWave::SampleHold,
            _ => LfoWave::Triangle,
        }
    }
}

/// One component of an LFO.
#[derive(Clone, Debug)]
pub struct LfoSub {
    pub wave: LfoWave,
    /// Frequency multiplier relative to the LFO frequency.
    pub ratio: f32,
    /// Output gain.
    pub scale: f32,
    /// Constant added to the output.
    pub offset: f32,
}

impl Default for LfoSub {
    fn default() -> Self {
        Self {
            wave: LfoWave::Triangle,
            ratio: 1.0,
            scale: 1.0,
            offset: 0.0,
        }
    }
}

/// Description of an LFO, shared by all voices of a region.
#[derive(Clone, Debug)]
pub struct LfoDescription {
    /// Base frequency in Hz. Ignored when `beats` is set.
    pub freq: f32,
    /// Cycle period in beats for tempo sync.
    pub beats: Option<f32>,
    /// Start phase, 0..1.
    pub phase: f32,
    /// Seconds before the LFO starts moving.
    pub delay: f32,
    /// Seconds over which the output fades in after the delay.
    pub fade: f32,
    /// Stop after this many full cycles.
    pub count: Option<u32>,
    /// Step sequence replacing the waveform when non-empty, values -1..1.
    pub steps: Vec<f32>,
    pub subs: Vec<LfoSub>,
    /// Output scale for the classic amp/pitch/fil LFO connections.
    pub depth: f32,
}

impl Default for LfoDescription {
    fn default() -> Self {
        Self {
            freq: 0.0,
            beats: None,
            phase: 0.0,
            delay: 0.0,
            fade: 0.0,
            count: None,
            steps: Vec::new(),
            subs: vec![LfoSub::default()],
            depth: 0.0,
        }
    }
}

impl LfoDescription {
    /// Effective frequency in Hz, resolving beat sync against the tempo.
    pub fn frequency_hz(&self, bpm: f32) -> f32 {
        match self.beats {
            Some(beats) if beats > 0.0 => bpm / (60.0 * beats),
            _ => self.freq,
        }
    }
}

fn wave_value(wave: LfoWave, phase: f32, held: f32) -> f32 {
    let p = phase - phase.floor();
    match wave {
        LfoWave::Triangle => {
            if p < 0.25 {
                4.0 * p
            } else if p < 0.75 {
                2.0 - 4.0 * p
            } else {
                4.0 * p - 4.0
            }
        }
        LfoWave::Sine => (std::f32::consts::TAU * p).sin(),
        LfoWave::Pulse75 => {
            if p < 0.75 {
                1.0
            } else {
                -1.0
            }
        }
        LfoWave::Square => {
            if p < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        LfoWave::Pulse25 => {
            if p < 0.25 {
                1.0
            } else {
                -1.0
            }
        }
        LfoWave::Pulse12_5 => {
            if p < 0.125 {
                1.0
            } else {
                -1.0
            }
        }
        LfoWave::Saw => 2.0 * p - 1.0,
        LfoWave::ReverseSaw => 1.0 - 2.0 * p,
        LfoWave::SampleHold => held,
    }
}

/// Per-voice LFO state.
#[derive(Clone, Debug)]
pub struct LfoGenerator {
    sample_rate: f32,
    phase: f32,
    elapsed: f32,
    cycles_done: u32,
    /// Held sample-and-hold values, one per sub.
    held: Vec<f32>,
    rng_state: u32,
    current: f32,
}

impl LfoGenerator {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            phase: 0.0,
            elapsed: 0.0,
            cycles_done: 0,
            held: Vec::new(),
            rng_state: 0x9e3779b9,
            current: 0.0,
        }
    }

    pub fn trigger(&mut self, desc: &LfoDescription, seed: u32) {
        self.phase = desc.phase - desc.phase.floor();
        self.elapsed = 0.0;
        self.cycles_done = 0;
        self.rng_state = seed | 1;
        self.held.clear();
        for _ in &desc.subs {
            let v = self.next_random();
            self.held.push(v);
        }
        self.current = 0.0;
    }

    fn next_random(&mut self) -> f32 {
        // xorshift32, mapped to [-1, 1]
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    /// Advance `samples` at `freq_hz` (already resolved from modulation and
    /// tempo) and return the output at the end of the span.
    /// `phase_offset` is the modulated phase target added to the running
    /// phase for evaluation only.
    pub fn process(&mut self, desc: &LfoDescription, freq_hz: f32, phase_offset: f32, samples: usize) -> f32 {
        let dt = samples as f32 / self.sample_rate;

        if self.elapsed < desc.delay {
            self.elapsed += dt;
            self.current = 0.0;
            return 0.0;
        }

        if let Some(count) = desc.count {
            if self.cycles_done >= count {
                self.current = 0.0;
                return 0.0;
            }
        }

        let advance = freq_hz.max(0.0) * dt;
        let new_phase = self.phase + advance;
        if new_phase >= 1.0 {
            self.cycles_done += new_phase as u32;
            for i in 0..self.held.len() {
                self.held[i] = self.next_random();
            }
        }
        self.phase = new_phase - new_phase.floor();
        self.elapsed += dt;

        let fade_gain = if desc.fade > 0.0 {
            ((self.elapsed - desc.delay) / desc.fade).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let eval_phase = self.phase + phase_offset;

        let raw = if !desc.steps.is_empty() {
            let p = eval_phase - eval_phase.floor();
            let idx = ((p * desc.steps.len() as f32) as usize).min(desc.steps.len() - 1);
            desc.steps[idx]
        } else {
            let mut sum = 0.0;
            for (i, sub) in desc.subs.iter().enumerate() {
                let held = self.held.get(i).copied().unwrap_or(0.0);
                sum += sub.offset + sub.scale * wave_value(sub.wave, eval_phase * sub.ratio, held);
            }
            sum
        };

        self.current = raw * fade_gain;
        self.current
    }

    pub fn value(&self) -> f32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 48_000.0;

    fn lfo(desc: &LfoDescription) -> LfoGenerator {
        let mut gen = LfoGenerator::new(RATE);
        gen.trigger(desc, 7);
        gen
    }

    #[test]
    fn sine_sub_oscillates() {
        let desc = LfoDescription {
            freq: 2.0,
            subs: vec![LfoSub {
                wave: LfoWave::Sine,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut gen = lfo(&desc);
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for _ in 0..(RATE as usize / 16) {
            let v = gen.process(&desc, 2.0, 0.0, 16);
            min = min.min(v);
            max = max.max(v);
        }
        assert!(max > 0.9 && min < -0.9, "range [{min}, {max}]");
    }

    #[test]
    fn delay_holds_output_at_zero() {
        let desc = LfoDescription {
            freq: 10.0,
            delay: 0.1,
            ..Default::default()
        };
        let mut gen = lfo(&desc);
        for _ in 0..100 {
            assert_eq!(gen.process(&desc, 10.0, 0.0, 16), 0.0);
        }
    }

    #[test]
    fn fade_scales_early_output() {
        let desc = LfoDescription {
            freq: 1.0,
            fade: 1.0,
            phase: 0.25, // start a triangle at its peak
            ..Default::default()
        };
        let mut gen = lfo(&desc);
        let early = gen.process(&desc, 0.0, 0.0, 480).abs();
        assert!(early < 0.05, "early output should be faded, got {early}");
    }

    #[test]
    fn count_stops_after_cycles() {
        let desc = LfoDescription {
            freq: 100.0,
            count: Some(2),
            ..Default::default()
        };
        let mut gen = lfo(&desc);
        // Run for half a second: far more than two 10 ms cycles
        for _ in 0..1500 {
            gen.process(&desc, 100.0, 0.0, 16);
        }
        assert_eq!(gen.process(&desc, 100.0, 0.0, 16), 0.0);
    }

    #[test]
    fn steps_replace_waveform() {
        let desc = LfoDescription {
            freq: 1.0,
            steps: vec![-1.0, 1.0],
            ..Default::default()
        };
        let mut gen = lfo(&desc);
        let first = gen.process(&desc, 1.0, 0.0, 16);
        assert_eq!(first, -1.0);
        // Jump phase into the second half via the phase offset target
        let second = gen.process(&desc, 1.0, 0.5, 16);
        assert_eq!(second, 1.0);
    }

    #[test]
    fn beats_sync_follows_tempo() {
        let desc = LfoDescription {
            freq: 3.0,
            beats: Some(1.0),
            ..Default::default()
        };
        // One beat per cycle at 120 bpm is 2 Hz
        assert!((desc.frequency_hz(120.0) - 2.0).abs() < 1e-6);
        // beats takes precedence over freq
        assert!((desc.frequency_hz(60.0) - 1.0).abs() < 1e-6);
    }
}
