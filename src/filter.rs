//! Per-voice filter and equalizer chains
//!
//! Regions carry 0..N filters applied in series, followed by 0..N
//! equalizer bands. The 2-pole sections use the RBJ cookbook coefficients
//! via the `biquad` crate; 4- and 6-pole types cascade 2-pole sections.
//! The `_sv` variants use the Chamberlin state-variable topology. Cutoff
//! and gain targets coming from the modulation matrix are smoothed at
//! control rate before coefficients are recomputed.

use crate::smoother::OnePoleSmoother;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use std::f32::consts::{FRAC_1_SQRT_2, PI};

/// The filter type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterType {
    None,
    Apf1p,
    Lpf1p,
    Hpf1p,
    Lpf2p,
    Hpf2p,
    Bpf2p,
    Brf2p,
    Lpf4p,
    Hpf4p,
    Lpf6p,
    Hpf6p,
    Lpf2pSv,
    Hpf2pSv,
    Bpf2pSv,
    Brf2pSv,
    Pink,
    Lsh,
    Hsh,
    Peq,
}

impl FilterType {
    /// Number of cascaded biquad sections for the cookbook types.
    fn sections(&self) -> usize {
        match self {
            FilterType::Lpf4p | FilterType::Hpf4p => 2,
            FilterType::Lpf6p | FilterType::Hpf6p => 3,
            _ => 1,
        }
    }
}

/// Static filter settings on a region. `cutoff` is in Hz; `resonance` and
/// `gain` in dB; the tracking fields are in cents.
#[derive(Clone, Debug)]
pub struct FilterDescription {
    pub kind: FilterType,
    pub cutoff: f32,
    pub resonance: f32,
    pub gain: f32,
    pub keytrack: f32,
    pub keycenter: u8,
    pub veltrack: f32,
    pub random: f32,
}

impl Default for FilterDescription {
    fn default() -> Self {
        Self {
            kind: FilterType::Lpf2p,
            cutoff: 20_000.0,
            resonance: 0.0,
            gain: 0.0,
            keytrack: 0.0,
            keycenter: 60,
            veltrack: 0.0,
            random: 0.0,
        }
    }
}

/// Equalizer band shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EqKind {
    Peak,
    LowShelf,
    HighShelf,
}

/// Static equalizer settings on a region. `bandwidth` is in octaves.
#[derive(Clone, Debug)]
pub struct EqDescription {
    pub kind: EqKind,
    pub frequency: f32,
    pub bandwidth: f32,
    pub gain: f32,
    pub vel_to_gain: f32,
    pub vel_to_frequency: f32,
}

impl Default for EqDescription {
    fn default() -> Self {
        Self {
            kind: EqKind::Peak,
            frequency: 1_000.0,
            bandwidth: 1.0,
            gain: 0.0,
            vel_to_gain: 0.0,
            vel_to_frequency: 0.0,
        }
    }
}

fn resonance_to_q(resonance_db: f32) -> f32 {
    (FRAC_1_SQRT_2 * 10f32.powf(resonance_db / 20.0)).clamp(0.1, 40.0)
}

fn bandwidth_to_q(octaves: f32) -> f32 {
    let bw = octaves.clamp(0.05, 8.0);
    let two_bw = 2f32.powf(bw);
    (two_bw.sqrt() / (two_bw - 1.0)).clamp(0.05, 40.0)
}

fn clamp_frequency(freq: f32, sample_rate: f32) -> f32 {
    freq.clamp(5.0, sample_rate * 0.45)
}

/// One-pole state per channel.
#[derive(Clone, Copy, Debug, Default)]
struct OnePoleState {
    z1: f32,
}

/// Chamberlin state-variable state per channel.
#[derive(Clone, Copy, Debug, Default)]
struct SvState {
    low: f32,
    band: f32,
}

/// Pinking filter state per channel (Paul Kellet's economy coefficients).
#[derive(Clone, Copy, Debug, Default)]
struct PinkState {
    b0: f32,
    b1: f32,
    b2: f32,
}

enum FilterKernel {
    None,
    OnePole {
        state: [OnePoleState; 2],
        coeff: f32,
    },
    Cookbook {
        sections: Vec<[DirectForm2Transposed<f32>; 2]>,
    },
    Sv {
        state: [SvState; 2],
        f: f32,
        q_inv: f32,
    },
    Pink {
        state: [PinkState; 2],
    },
}

/// A runtime filter instance: one per region filter, per voice. Holds the
/// per-channel state and the control-rate smoothers for cutoff and gain.
pub struct VoiceFilter {
    kind: FilterType,
    kernel: FilterKernel,
    cutoff_smoother: OnePoleSmoother,
    gain_smoother: OnePoleSmoother,
    sample_rate: f32,
}

impl VoiceFilter {
    pub fn new(kind: FilterType, sample_rate: f32) -> Self {
        let kernel = match kind {
            FilterType::None => FilterKernel::None,
            FilterType::Lpf1p | FilterType::Hpf1p | FilterType::Apf1p => FilterKernel::OnePole {
                state: [OnePoleState::default(); 2],
                coeff: 0.0,
            },
            FilterType::Lpf2pSv | FilterType::Hpf2pSv | FilterType::Bpf2pSv | FilterType::Brf2pSv => {
                FilterKernel::Sv {
                    state: [SvState::default(); 2],
                    f: 0.0,
                    q_inv: 1.0,
                }
            }
            FilterType::Pink => FilterKernel::Pink {
                state: [PinkState::default(); 2],
            },
            _ => {
                let coeffs = Coefficients::<f32>::from_params(
                    Type::LowPass,
                    sample_rate.hz(),
                    1_000.0.hz(),
                    FRAC_1_SQRT_2,
                )
                .unwrap();
                let sections = (0..kind.sections())
                    .map(|_| {
                        [
                            DirectForm2Transposed::<f32>::new(coeffs),
                            DirectForm2Transposed::<f32>::new(coeffs),
                        ]
                    })
                    .collect();
                FilterKernel::Cookbook { sections }
            }
        };
        let mut cutoff_smoother = OnePoleSmoother::new(1.0, sample_rate);
        let mut gain_smoother = OnePoleSmoother::new(1.0, sample_rate);
        cutoff_smoother.reset(0.0);
        gain_smoother.reset(0.0);
        Self {
            kind,
            kernel,
            cutoff_smoother,
            gain_smoother,
            sample_rate,
        }
    }

    pub fn kind(&self) -> FilterType {
        self.kind
    }

    /// Jump smoothers to the given targets (voice start).
    pub fn prime(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32) {
        self.cutoff_smoother.reset(cutoff);
        self.gain_smoother.reset(gain_db);
        self.update_kernel(cutoff, resonance_db, gain_db);
    }

    /// Move toward new parameter targets over `samples` control steps, then
    /// recompute coefficients once.
    pub fn configure(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32, samples: usize) {
        let cutoff = self.cutoff_smoother.advance(cutoff, samples);
        let gain_db = self.gain_smoother.advance(gain_db, samples);
        self.update_kernel(cutoff, resonance_db, gain_db);
    }

    fn update_kernel(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32) {
        let fc = clamp_frequency(cutoff, self.sample_rate);
        let q = resonance_to_q(resonance_db);
        match &mut self.kernel {
            FilterKernel::None => {}
            FilterKernel::OnePole { coeff, .. } => {
                *coeff = (-2.0 * PI * fc / self.sample_rate).exp();
            }
            FilterKernel::Sv { f, q_inv, .. } => {
                *f = 2.0 * (PI * fc / self.sample_rate).sin();
                *q_inv = 1.0 / q;
            }
            FilterKernel::Pink { .. } => {}
            FilterKernel::Cookbook { sections } => {
                let filter_type = match self.kind {
                    FilterType::Lpf2p | FilterType::Lpf4p | FilterType::Lpf6p => Type::LowPass,
                    FilterType::Hpf2p | FilterType::Hpf4p | FilterType::Hpf6p => Type::HighPass,
                    FilterType::Bpf2p => Type::BandPass,
                    FilterType::Brf2p => Type::Notch,
                    FilterType::Lsh => Type::LowShelf(gain_db),
                    FilterType::Hsh => Type::HighShelf(gain_db),
                    FilterType::Peq => Type::PeakingEQ(gain_db),
                    _ => Type::LowPass,
                };
                let coeffs = Coefficients::<f32>::from_params(
                    filter_type,
                    self.sample_rate.hz(),
                    fc.hz(),
                    q,
                )
                .unwrap();
                for section in sections.iter_mut() {
                    section[0].update_coefficients(coeffs);
                    section[1].update_coefficients(coeffs);
                }
            }
        }
    }

    /// Run one stereo sample through the filter.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        match &mut self.kernel {
            FilterKernel::None => (left, right),
            FilterKernel::OnePole { state, coeff } => {
                let kind = self.kind;
                let mut run = |x: f32, s: &mut OnePoleState| {
                    let lp = (1.0 - *coeff) * x + *coeff * s.z1;
                    s.z1 = lp;
                    match kind {
                        FilterType::Lpf1p => lp,
                        FilterType::Hpf1p => x - lp,
                        // First-order allpass: phase shift, flat magnitude
                        _ => 2.0 * lp - x,
                    }
                };
                (run(left, &mut state[0]), run(right, &mut state[1]))
            }
            FilterKernel::Sv { state, f, q_inv } => {
                let kind = self.kind;
                let mut run = |x: f32, s: &mut SvState| {
                    s.low += *f * s.band;
                    let high = x - s.low - *q_inv * s.band;
                    s.band += *f * high;
                    match kind {
                        FilterType::Lpf2pSv => s.low,
                        FilterType::Hpf2pSv => high,
                        FilterType::Bpf2pSv => s.band,
                        _ => high + s.low,
                    }
                };
                (run(left, &mut state[0]), run(right, &mut state[1]))
            }
            FilterKernel::Pink { state } => {
                let mut run = |x: f32, s: &mut PinkState| {
                    s.b0 = 0.99765 * s.b0 + x * 0.099_046;
                    s.b1 = 0.963 * s.b1 + x * 0.296_516_4;
                    s.b2 = 0.57 * s.b2 + x * 1.052_691_3;
                    (s.b0 + s.b1 + s.b2 + x * 0.1848) * 0.25
                };
                (run(left, &mut state[0]), run(right, &mut state[1]))
            }
            FilterKernel::Cookbook { sections } => {
                let mut l = left;
                let mut r = right;
                for section in sections.iter_mut() {
                    l = section[0].run(l);
                    r = section[1].run(r);
                }
                (l, r)
            }
        }
    }
}

/// A runtime equalizer band: peak or shelf via the cookbook coefficients.
pub struct VoiceEq {
    kind: EqKind,
    channels: [DirectForm2Transposed<f32>; 2],
    freq_smoother: OnePoleSmoother,
    gain_smoother: OnePoleSmoother,
    sample_rate: f32,
}

impl VoiceEq {
    pub fn new(kind: EqKind, sample_rate: f32) -> Self {
        let coeffs = Coefficients::<f32>::from_params(
            Type::PeakingEQ(0.0),
            sample_rate.hz(),
            1_000.0.hz(),
            FRAC_1_SQRT_2,
        )
        .unwrap();
        Self {
            kind,
            channels: [
                DirectForm2Transposed::<f32>::new(coeffs),
                DirectForm2Transposed::<f32>::new(coeffs),
            ],
            freq_smoother: OnePoleSmoother::new(1.0, sample_rate),
            gain_smoother: OnePoleSmoother::new(1.0, sample_rate),
            sample_rate,
        }
    }

    pub fn prime(&mut self, frequency: f32, bandwidth: f32, gain_db: f32) {
        self.freq_smoother.reset(frequency);
        self.gain_smoother.reset(gain_db);
        self.update_coefficients(frequency, bandwidth, gain_db);
    }

    pub fn configure(&mut self, frequency: f32, bandwidth: f32, gain_db: f32, samples: usize) {
        let frequency = self.freq_smoother.advance(frequency, samples);
        let gain_db = self.gain_smoother.advance(gain_db, samples);
        self.update_coefficients(frequency, bandwidth, gain_db);
    }

    fn update_coefficients(&mut self, frequency: f32, bandwidth: f32, gain_db: f32) {
        let fc = clamp_frequency(frequency, self.sample_rate);
        let q = bandwidth_to_q(bandwidth);
        let filter_type = match self.kind {
            EqKind::Peak => Type::PeakingEQ(gain_db),
            EqKind::LowShelf => Type::LowShelf(gain_db),
            EqKind::HighShelf => Type::HighShelf(gain_db),
        };
        let coeffs =
            Coefficients::<f32>::from_params(filter_type, self.sample_rate.hz(), fc.hz(), q)
                .unwrap();
        self.channels[0].update_coefficients(coeffs);
        self.channels[1].update_coefficients(coeffs);
    }

    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        (self.channels[0].run(left), self.channels[1].run(right))
    }
}
