//! Per-voice renderer
//!
//! A voice is one activation of a region. Per block it evaluates its
//! modulation matrix at control-rate segments (split at controller event
//! boundaries), ticks its envelopes and LFOs, reads the sample with the
//! pitch-modulated increment through the loop machinery, and runs the
//! result through the filter chain, EQ chain, amplifier and panner before
//! accumulating into the output buses.
//!
//! The amplitude envelope gates the voice: once released and below the
//! silence threshold, the voice frees itself.

use crate::bus::StereoBus;
use crate::config::{FAST_RELEASE_SECONDS, SILENCE_THRESHOLD};
use crate::curve::CurveTable;
use crate::envelope::EnvelopeGenerator;
use crate::filter::{VoiceEq, VoiceFilter};
use crate::flex_envelope::FlexEgGenerator;
use crate::lfo::LfoGenerator;
use crate::midi_state::MidiState;
use crate::mod_matrix::{ModContext, ModMatrix};
use crate::modulation::ModTarget;
use crate::panning::{apply_balance, apply_width, pan_gains};
use crate::region::{Direction, LoopMode, OffMode, Region};
use crate::smoother::OnePoleSmoother;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    Free,
    Playing,
    Releasing,
    /// Being ramped out quickly after a steal or group choke.
    FastOff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerType {
    NoteOn,
    NoteOff,
    Cc,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::NoteOn => "note_on",
            TriggerType::NoteOff => "note_off",
            TriggerType::Cc => "cc",
        }
    }
}

/// The event that started a voice.
#[derive(Clone, Copy, Debug)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    /// MIDI note number, or controller number for CC triggers.
    pub number: u8,
    /// Normalized velocity or controller value.
    pub value: f32,
}

/// Everything needed to start a voice.
pub struct VoiceStart {
    pub region: Arc<Region>,
    pub region_index: usize,
    pub trigger: TriggerEvent,
    /// Sample offset of the trigger inside the current block.
    pub delay: usize,
    pub rand_unipolar: f32,
    pub rand_bipolar: f32,
    /// Note duration for release triggers, feeding rt_decay.
    pub note_duration: Option<f32>,
}

/// Per-block state shared by all voices during render.
pub struct RenderContext<'a> {
    pub midi: &'a MidiState,
    pub curves: &'a CurveTable,
    pub bpm: f32,
    pub sustain_down: bool,
    /// Engine-level interpolation quality, already resolved for
    /// freewheeling; regions may override it.
    pub sample_quality: u8,
}

pub struct Voice {
    state: VoiceState,
    region: Option<Arc<Region>>,
    region_index: usize,
    trigger: TriggerEvent,
    /// Engine clock at voice start, used as the age for stealing.
    start_clock: u64,

    sample_rate: f32,
    delay_remaining: usize,
    position: f64,
    reverse: bool,
    loop_count_remaining: Option<u32>,

    /// Static pitch variation resolved at start, in cents.
    base_pitch_cents: f32,
    /// Ratio of the sample's rate to the engine rate.
    rate_ratio: f64,
    /// Static gain product: velocity, crossfades, amp random.
    static_gain: f32,
    /// Static dB terms: keytrack and rt_decay attenuation.
    static_db: f32,
    quality: u8,

    amp_eg: EnvelopeGenerator,
    pitch_eg: Option<EnvelopeGenerator>,
    fil_eg: Option<EnvelopeGenerator>,
    amp_lfo: Option<LfoGenerator>,
    pitch_lfo: Option<LfoGenerator>,
    fil_lfo: Option<LfoGenerator>,
    lfos: Vec<LfoGenerator>,
    flex_egs: Vec<FlexEgGenerator>,
    /// Index of the flex EG gating amplitude, if one is nominated.
    amp_gate_flex: Option<usize>,

    filters: Vec<VoiceFilter>,
    eqs: Vec<VoiceEq>,
    matrix: ModMatrix,
    gain_smoother: OnePoleSmoother,

    /// Release requested at this block offset.
    pending_release: Option<usize>,
    /// Note-off arrived while the sustain pedal was down.
    release_held_by_pedal: bool,

    // Scratch, preallocated to keep the render path allocation-free.
    used_ccs: Vec<usize>,
    breakpoints: Vec<usize>,
    lfo_values: Vec<f32>,
    flex_values: Vec<f32>,
}

impl Voice {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            state: VoiceState::Free,
            region: None,
            region_index: 0,
            trigger: TriggerEvent {
                trigger_type: TriggerType::NoteOn,
                number: 0,
                value: 0.0,
            },
            start_clock: 0,
            sample_rate,
            delay_remaining: 0,
            position: 0.0,
            reverse: false,
            loop_count_remaining: None,
            base_pitch_cents: 0.0,
            rate_ratio: 1.0,
            static_gain: 1.0,
            static_db: 0.0,
            quality: 0,
            amp_eg: EnvelopeGenerator::new(sample_rate),
            pitch_eg: None,
            fil_eg: None,
            amp_lfo: None,
            pitch_lfo: None,
            fil_lfo: None,
            lfos: Vec::new(),
            flex_egs: Vec::new(),
            amp_gate_flex: None,
            filters: Vec::new(),
            eqs: Vec::new(),
            matrix: ModMatrix::new(sample_rate),
            gain_smoother: OnePoleSmoother::new(1.0, sample_rate),
            pending_release: None,
            release_held_by_pedal: false,
            used_ccs: Vec::with_capacity(16),
            breakpoints: Vec::with_capacity(32),
            lfo_values: Vec::with_capacity(8),
            flex_values: Vec::with_capacity(8),
        }
    }

    //=======================================
    // Lifecycle

    pub fn start(&mut self, params: VoiceStart, midi: &MidiState, engine_clock: u64) {
        let region = params.region;
        let velocity = params.trigger.value;

        self.state = VoiceState::Playing;
        self.region_index = params.region_index;
        self.trigger = params.trigger;
        self.start_clock = engine_clock + params.delay as u64;
        self.pending_release = None;
        self.release_held_by_pedal = false;

        // Onset delay in samples: trigger offset plus the region delay.
        let region_delay =
            (region.delay + region.delay_random * params.rand_unipolar) * self.sample_rate;
        self.delay_remaining = params.delay + region_delay.max(0.0) as usize;

        // Playback cursor
        let offset = region.offset + (region.offset_random as f32 * params.rand_unipolar) as usize;
        self.reverse = region.direction == Direction::Reverse;
        self.position = if self.reverse {
            region.sample_end.saturating_sub(1) as f64
        } else {
            offset.min(region.sample_end) as f64
        };
        self.loop_count_remaining = region.loop_desc.count;

        // Pitch
        let note_pitch = if self.trigger.trigger_type == TriggerType::Cc {
            region.pitch_keycenter as f32
        } else {
            midi.note_base_pitch(self.trigger.number)
        };
        self.base_pitch_cents =
            region.pitch_variation_cents(note_pitch, velocity, params.rand_bipolar);
        self.rate_ratio = region
            .sample
            .as_ref()
            .map(|s| s.sample_rate as f64 / self.sample_rate as f64)
            .unwrap_or(1.0);

        // Amplitude
        self.static_gain = region.velocity_gain(velocity)
            * region.crossfade_gain(self.trigger.number, velocity, midi);
        self.static_db = region.keytrack_gain_db(self.trigger.number)
            + region.amp_random * params.rand_bipolar;
        if let Some(duration) = params.note_duration {
            self.static_db -= region.rt_decay * duration;
        }
        self.quality = region.sample_quality.unwrap_or(0);

        // Generators
        self.amp_eg.trigger(&region.amp_eg, velocity, midi);
        self.pitch_eg = region.pitch_eg.as_ref().map(|desc| {
            let mut eg = EnvelopeGenerator::new(self.sample_rate);
            eg.trigger(desc, velocity, midi);
            eg
        });
        self.fil_eg = region.fil_eg.as_ref().map(|desc| {
            let mut eg = EnvelopeGenerator::new(self.sample_rate);
            eg.trigger(desc, velocity, midi);
            eg
        });

        let seed = (engine_clock as u32).wrapping_mul(2654435761).wrapping_add(region.id);
        let sample_rate = self.sample_rate;
        let make_lfo = |desc: &crate::lfo::LfoDescription, salt: u32| {
            let mut gen = LfoGenerator::new(sample_rate);
            gen.trigger(desc, seed.wrapping_add(salt));
            gen
        };
        self.amp_lfo = region.amp_lfo.as_ref().map(|d| make_lfo(d, 1));
        self.pitch_lfo = region.pitch_lfo.as_ref().map(|d| make_lfo(d, 2));
        self.fil_lfo = region.fil_lfo.as_ref().map(|d| make_lfo(d, 3));
        self.lfos.clear();
        for (i, desc) in region.lfos.iter().enumerate() {
            self.lfos.push(make_lfo(desc, 4 + i as u32));
        }

        self.flex_egs.clear();
        self.amp_gate_flex = None;
        for (i, desc) in region.flex_egs.iter().enumerate() {
            let mut gen = FlexEgGenerator::new(self.sample_rate);
            gen.trigger(desc, midi);
            self.flex_egs.push(gen);
            if desc.amp_gate {
                self.amp_gate_flex = Some(i);
            }
        }

        // DSP chain
        self.filters.clear();
        for desc in &region.filters {
            let mut filter = VoiceFilter::new(desc.kind, self.sample_rate);
            filter.prime(desc.cutoff, desc.resonance, desc.gain);
            self.filters.push(filter);
        }
        self.eqs.clear();
        for desc in &region.equalizers {
            let mut eq = VoiceEq::new(desc.kind, self.sample_rate);
            eq.prime(
                desc.frequency + desc.vel_to_frequency * velocity,
                desc.bandwidth,
                desc.gain + desc.vel_to_gain * velocity,
            );
            self.eqs.push(eq);
        }

        self.matrix.attach(&region);
        self.used_ccs.clear();
        {
            let used = &mut self.used_ccs;
            region.used_ccs(&mut |cc| {
                if !used.contains(&cc) {
                    used.push(cc);
                }
            });
        }

        self.gain_smoother = OnePoleSmoother::new(1.0, self.sample_rate);
        self.lfo_values.clear();
        self.lfo_values.resize(region.lfos.len(), 0.0);
        self.flex_values.clear();
        self.flex_values.resize(region.flex_egs.len(), 0.0);

        self.region = Some(region);
    }

    /// Request a release at `delay` samples into the next rendered block.
    /// One-shot regions ignore note-off.
    pub fn release(&mut self, delay: usize, sustain_down: bool) {
        if self.state != VoiceState::Playing {
            return;
        }
        let Some(region) = &self.region else { return };
        if region.loop_desc.mode == LoopMode::OneShot {
            return;
        }
        if sustain_down {
            self.release_held_by_pedal = true;
            return;
        }
        self.pending_release = Some(delay);
    }

    /// The sustain pedal went up: apply a deferred release.
    pub fn sustain_released(&mut self, delay: usize) {
        if self.release_held_by_pedal && self.state == VoiceState::Playing {
            self.release_held_by_pedal = false;
            self.pending_release = Some(delay);
        }
    }

    /// The sustain pedal went down with `sustain_cancels_release` enabled:
    /// pull a releasing voice back into its sustain stage.
    pub fn cancel_release(&mut self) {
        if self.state == VoiceState::Releasing {
            self.amp_eg.cancel_release();
            self.state = VoiceState::Playing;
        }
    }

    /// Ramp the voice out quickly (steal or fast choke).
    pub fn fast_off(&mut self) {
        if self.is_free() {
            return;
        }
        self.amp_eg.quick_release(FAST_RELEASE_SECONDS);
        self.state = VoiceState::FastOff;
    }

    /// Choke the voice according to its region's off mode.
    pub fn off(&mut self, delay: usize) {
        if self.is_free() {
            return;
        }
        let mode = self.region.as_ref().map(|r| r.off_mode).unwrap_or(OffMode::Fast);
        match mode {
            OffMode::Normal => {
                self.pending_release = Some(delay);
                self.release_held_by_pedal = false;
            }
            OffMode::Fast => self.fast_off(),
            OffMode::Time => {
                let time = self.region.as_ref().map(|r| r.off_time).unwrap_or(FAST_RELEASE_SECONDS);
                self.amp_eg.quick_release(time.max(1.0 / self.sample_rate));
                self.state = VoiceState::FastOff;
            }
        }
    }

    fn free(&mut self) {
        self.state = VoiceState::Free;
        self.region = None;
        self.pending_release = None;
        self.release_held_by_pedal = false;
    }

    //=======================================
    // Introspection

    pub fn is_free(&self) -> bool {
        self.state == VoiceState::Free
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn region_index(&self) -> usize {
        self.region_index
    }

    pub fn region(&self) -> Option<&Arc<Region>> {
        self.region.as_ref()
    }

    pub fn trigger(&self) -> &TriggerEvent {
        &self.trigger
    }

    pub fn start_clock(&self) -> u64 {
        self.start_clock
    }

    pub fn remaining_delay(&self) -> usize {
        self.delay_remaining
    }

    pub fn source_position(&self) -> f64 {
        self.position
    }

    /// Current output level estimate used by stealing and self-masking.
    pub fn current_amplitude(&self) -> f32 {
        if self.is_free() {
            return 0.0;
        }
        let gate = match self.amp_gate_flex {
            Some(i) => self.flex_egs.get(i).map(|f| f.level()).unwrap_or(0.0),
            None => self.amp_eg.level(),
        };
        gate * self.static_gain
    }

    /// The note this voice answers to, when note-triggered.
    pub fn note(&self) -> Option<u8> {
        match self.trigger.trigger_type {
            TriggerType::NoteOn | TriggerType::NoteOff => Some(self.trigger.number),
            TriggerType::Cc => None,
        }
    }

    //=======================================
    // Render

    /// Collect control segment boundaries: every event delay inside the
    /// block on a controller stream the matrix reads, plus bend and
    /// aftertouch streams and the pending release point.
    fn collect_breakpoints(&mut self, midi: &MidiState, nframes: usize) {
        self.breakpoints.clear();
        self.breakpoints.push(0);
        for &cc in &self.used_ccs {
            for event in midi.cc_events(cc) {
                if event.delay > 0 && event.delay < nframes {
                    self.breakpoints.push(event.delay);
                }
            }
        }
        for event in midi.pitch_bend_events() {
            if event.delay > 0 && event.delay < nframes {
                self.breakpoints.push(event.delay);
            }
        }
        for event in midi.channel_aftertouch_events() {
            if event.delay > 0 && event.delay < nframes {
                self.breakpoints.push(event.delay);
            }
        }
        if let Some(delay) = self.pending_release {
            if delay > 0 && delay < nframes {
                self.breakpoints.push(delay);
            }
        }
        self.breakpoints.push(nframes);
        self.breakpoints.sort_unstable();
        self.breakpoints.dedup();
    }

    /// Render one block, accumulating into `buses`. Returns true while the
    /// voice stays alive.
    pub fn render_block(
        &mut self,
        ctx: &RenderContext,
        buses: &mut [StereoBus],
        nframes: usize,
    ) -> bool {
        if self.is_free() {
            return false;
        }
        let Some(region) = self.region.clone() else {
            self.free();
            return false;
        };
        let Some(sample) = region.sample.clone() else {
            self.free();
            return false;
        };

        if region.amp_eg.dynamic {
            self.amp_eg
                .update_sustain(&region.amp_eg, self.trigger.value, ctx.midi);
        }

        self.collect_breakpoints(ctx.midi, nframes);
        let quality = if self.quality > 0 { self.quality } else { ctx.sample_quality };

        let loop_desc = region.loop_desc;
        let sample_end = region.sample_end.min(sample.len());
        let loop_start = loop_desc.start.min(sample_end);
        let loop_end = loop_desc.end.min(sample_end).max(loop_start);
        let loop_len = (loop_end - loop_start) as f64;
        let xf_frames = (loop_desc.crossfade * sample.sample_rate) as f64;

        let mut alive = true;
        let mut seg_idx = 0;
        while seg_idx + 1 < self.breakpoints.len() {
            let seg_start = self.breakpoints[seg_idx];
            let seg_end = self.breakpoints[seg_idx + 1];
            seg_idx += 1;
            let seg_len = seg_end - seg_start;
            if seg_len == 0 {
                continue;
            }

            if let Some(release_at) = self.pending_release {
                if release_at <= seg_start {
                    self.apply_release();
                }
            }

            // Tick block-rate generators over the segment.
            let bpm = ctx.bpm;
            let amp_lfo_value = match (&mut self.amp_lfo, &region.amp_lfo) {
                (Some(gen), Some(desc)) => {
                    gen.process(desc, desc.frequency_hz(bpm), 0.0, seg_len)
                }
                _ => 0.0,
            };
            let pitch_lfo_value = match (&mut self.pitch_lfo, &region.pitch_lfo) {
                (Some(gen), Some(desc)) => {
                    gen.process(desc, desc.frequency_hz(bpm), 0.0, seg_len)
                }
                _ => 0.0,
            };
            let fil_lfo_value = match (&mut self.fil_lfo, &region.fil_lfo) {
                (Some(gen), Some(desc)) => {
                    gen.process(desc, desc.frequency_hz(bpm), 0.0, seg_len)
                }
                _ => 0.0,
            };

            // Free LFOs: frequency and phase are modulation targets, so
            // resolve those first with the previous outputs as context.
            for (i, desc) in region.lfos.iter().enumerate() {
                let mctx = ModContext {
                    midi: ctx.midi,
                    curves: ctx.curves,
                    note: self.trigger.number,
                    velocity: self.trigger.value,
                    amp_eg: self.amp_eg.level(),
                    pitch_eg: self.pitch_eg.as_ref().map(|e| e.level()).unwrap_or(0.0),
                    fil_eg: self.fil_eg.as_ref().map(|e| e.level()).unwrap_or(0.0),
                    amp_lfo: amp_lfo_value,
                    pitch_lfo: pitch_lfo_value,
                    fil_lfo: fil_lfo_value,
                    lfos: &self.lfo_values,
                    flex_egs: &self.flex_values,
                };
                let freq = self.matrix.target_value(
                    ModTarget::LfoFrequency(i),
                    desc.frequency_hz(bpm),
                    &mctx,
                    seg_start,
                    seg_len,
                );
                let phase = self.matrix.target_value(
                    ModTarget::LfoPhase(i),
                    0.0,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                self.lfo_values[i] = self.lfos[i].process(desc, freq, phase, seg_len);
            }
            for (i, value) in self.flex_egs.iter().map(|f| f.level()).enumerate() {
                self.flex_values[i] = value;
            }

            // Matrix evaluation for this segment.
            let mctx = ModContext {
                midi: ctx.midi,
                curves: ctx.curves,
                note: self.trigger.number,
                velocity: self.trigger.value,
                amp_eg: self.amp_eg.level(),
                pitch_eg: self.pitch_eg.as_ref().map(|e| e.level()).unwrap_or(0.0),
                fil_eg: self.fil_eg.as_ref().map(|e| e.level()).unwrap_or(0.0),
                amp_lfo: amp_lfo_value,
                pitch_lfo: pitch_lfo_value,
                fil_lfo: fil_lfo_value,
                lfos: &self.lfo_values,
                flex_egs: &self.flex_values,
            };

            let bend = crate::events::value_at(ctx.midi.pitch_bend_events(), seg_start)
                + ctx.midi.per_note_pitch_bend(self.trigger.number);
            let mut pitch_cents = self.matrix.target_value(
                ModTarget::Pitch,
                self.base_pitch_cents + region.bend_in_cents(bend.clamp(-1.0, 1.0)),
                &mctx,
                seg_start,
                seg_len,
            );
            if let (Some(eg), Some(desc)) = (&self.pitch_eg, &region.pitch_eg) {
                pitch_cents += eg.level() * desc.depth;
            }
            if let Some(desc) = &region.pitch_lfo {
                pitch_cents += pitch_lfo_value * desc.depth;
            }

            let mut volume_db = self.matrix.target_value(
                ModTarget::Volume,
                region.volume + self.static_db,
                &mctx,
                seg_start,
                seg_len,
            );
            if let Some(desc) = &region.amp_lfo {
                volume_db += amp_lfo_value * desc.depth;
            }
            let amplitude = self
                .matrix
                .target_value(ModTarget::Amplitude, region.base_gain(), &mctx, seg_start, seg_len)
                .max(0.0);

            let pan = self
                .matrix
                .target_value(ModTarget::Pan, region.pan, &mctx, seg_start, seg_len)
                .clamp(-1.0, 1.0);
            let position = self
                .matrix
                .target_value(ModTarget::Position, region.position, &mctx, seg_start, seg_len)
                .clamp(-1.0, 1.0);
            let width = self
                .matrix
                .target_value(ModTarget::Width, region.width, &mctx, seg_start, seg_len)
                .clamp(-1.0, 1.0);

            // Filter chain parameters, cutoff in cents around the base.
            let fil_eg_cents = match (&self.fil_eg, &region.fil_eg) {
                (Some(eg), Some(desc)) => eg.level() * desc.depth,
                _ => 0.0,
            };
            let fil_lfo_cents = region
                .fil_lfo
                .as_ref()
                .map(|d| fil_lfo_value * d.depth)
                .unwrap_or(0.0);
            for (i, desc) in region.filters.iter().enumerate() {
                let cutoff_cents = self.matrix.target_value(
                    ModTarget::FilCutoff(i),
                    desc.keytrack * (self.trigger.number as f32 - desc.keycenter as f32)
                        + desc.veltrack * self.trigger.value,
                    &mctx,
                    seg_start,
                    seg_len,
                ) + fil_eg_cents
                    + fil_lfo_cents;
                let resonance = self.matrix.target_value(
                    ModTarget::FilResonance(i),
                    desc.resonance,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                let gain = self.matrix.target_value(
                    ModTarget::FilGain(i),
                    desc.gain,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                let cutoff = desc.cutoff * (cutoff_cents / 1200.0).exp2();
                self.filters[i].configure(cutoff, resonance, gain, seg_len);
            }
            for (i, desc) in region.equalizers.iter().enumerate() {
                let freq = self.matrix.target_value(
                    ModTarget::EqFrequency(i),
                    desc.frequency + desc.vel_to_frequency * self.trigger.value,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                let bandwidth = self.matrix.target_value(
                    ModTarget::EqBandwidth(i),
                    desc.bandwidth,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                let gain = self.matrix.target_value(
                    ModTarget::EqGain(i),
                    desc.gain + desc.vel_to_gain * self.trigger.value,
                    &mctx,
                    seg_start,
                    seg_len,
                );
                self.eqs[i].configure(freq, bandwidth, gain, seg_len);
            }

            let segment_gain =
                amplitude * self.static_gain * 10f32.powf(volume_db / 20.0);
            let increment = self.rate_ratio * (pitch_cents as f64 / 1200.0).exp2();
            let (pan_l, pan_r) = pan_gains(pan);

            // Per-sample loop over the segment.
            for frame in seg_start..seg_end {
                if self.delay_remaining > 0 {
                    self.delay_remaining -= 1;
                    continue;
                }

                let gate = self.tick_generators();
                if !self.gate_active() {
                    alive = false;
                    break;
                }

                let looping = self.loop_active(&region, ctx);
                if looping {
                    self.wrap_loop(loop_start as f64, loop_end as f64, loop_len);
                }

                if !self.reverse && self.position >= sample_end as f64 {
                    // Sample exhausted with no loop to hold it: the voice
                    // ends here.
                    alive = false;
                    break;
                }
                if self.reverse && self.position < region.offset as f64 {
                    alive = false;
                    break;
                }

                let (mut l, mut r) = sample.frame_at(self.position, quality);
                if looping && xf_frames > 0.0 && loop_len > xf_frames {
                    // Blend the loop tail with the material before the loop
                    // start so the seam is seamless.
                    let into_xf = self.position - (loop_end as f64 - xf_frames);
                    if into_xf > 0.0 {
                        let alpha = (into_xf / xf_frames) as f32;
                        let (pl, pr) = sample.frame_at(self.position - loop_len, quality);
                        l = l * (1.0 - alpha) + pl * alpha;
                        r = r * (1.0 - alpha) + pr * alpha;
                    }
                }

                if self.reverse {
                    self.position -= increment;
                } else {
                    self.position += increment;
                }

                // Filter and EQ chains
                for filter in &mut self.filters {
                    let (fl, fr) = filter.process(l, r);
                    l = fl;
                    r = fr;
                }
                for eq in &mut self.eqs {
                    let (el, er) = eq.process(l, r);
                    l = el;
                    r = er;
                }

                // Amplifier
                let gain = self.gain_smoother.next(segment_gain) * gate;
                l *= gain;
                r *= gain;

                // Panner: width and position act on the stereo image, pan
                // on the result.
                let (wl, wr) = apply_width(l, r, width);
                let (sl, sr) = apply_balance(wl, wr, position);
                let out_l = sl * pan_l;
                let out_r = sr * pan_r;

                // Bus split
                for (bus_idx, bus) in buses.iter_mut().enumerate() {
                    let send = region.gain_to_effect_bus(bus_idx);
                    if send > 0.0 && frame < bus.left.len() {
                        bus.left[frame] += out_l * send;
                        bus.right[frame] += out_r * send;
                    }
                }
            }

            if !alive {
                break;
            }
        }

        if !alive || !self.gate_active() {
            self.free();
            return false;
        }

        // Track released state for introspection
        if self.state == VoiceState::Playing && self.amp_eg.is_released() {
            self.state = VoiceState::Releasing;
        }
        true
    }

    fn apply_release(&mut self) {
        self.pending_release = None;
        self.amp_eg.release();
        if let Some(eg) = &mut self.pitch_eg {
            eg.release();
        }
        if let Some(eg) = &mut self.fil_eg {
            eg.release();
        }
        for flex in &mut self.flex_egs {
            flex.release();
        }
    }

    /// Advance the per-sample generators; returns the amplitude gate value.
    fn tick_generators(&mut self) -> f32 {
        let amp = self.amp_eg.process();
        if let Some(eg) = &mut self.pitch_eg {
            eg.process();
        }
        if let Some(eg) = &mut self.fil_eg {
            eg.process();
        }
        for flex in &mut self.flex_egs {
            flex.process();
        }
        match self.amp_gate_flex {
            Some(i) => self.flex_egs.get(i).map(|f| f.level()).unwrap_or(0.0),
            None => amp,
        }
    }

    fn gate_active(&self) -> bool {
        match self.amp_gate_flex {
            Some(i) => self
                .flex_egs
                .get(i)
                .map(|f| f.is_active() || f.level() > SILENCE_THRESHOLD)
                .unwrap_or(false),
            None => self.amp_eg.is_active(),
        }
    }

    /// Whether the loop machinery applies at this moment.
    fn loop_active(&self, region: &Region, ctx: &RenderContext) -> bool {
        match region.loop_desc.mode {
            LoopMode::Continuous => self.loop_count_remaining != Some(0),
            LoopMode::Sustain => {
                // Hold the loop while the note (or pedal) keeps the voice
                // in its sustain stage.
                !self.amp_eg.is_released()
                    && (ctx.midi.is_note_pressed(self.trigger.number) || ctx.sustain_down)
                    && self.loop_count_remaining != Some(0)
            }
            _ => false,
        }
    }

    fn wrap_loop(&mut self, loop_start: f64, loop_end: f64, loop_len: f64) {
        if loop_len <= 0.0 {
            return;
        }
        if !self.reverse && self.position >= loop_end {
            self.position -= loop_len;
            if let Some(count) = &mut self.loop_count_remaining {
                *count = count.saturating_sub(1);
            }
        } else if self.reverse && self.position < loop_start {
            self.position += loop_len;
            if let Some(count) = &mut self.loop_count_remaining {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::NumRange;
    use crate::sample::SampleBuffer;

    const RATE: f32 = 48_000.0;

    fn sine_region(frames: usize) -> Arc<Region> {
        let data: Vec<f32> = (0..frames)
            .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / RATE).sin())
            .collect();
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
        region.key_range = NumRange::new(60, 60);
        region.amp_eg.release = 0.01;
        Arc::new(region)
    }

    fn start_voice(region: Arc<Region>, velocity: f32) -> (Voice, MidiState) {
        let mut midi = MidiState::new(RATE, 5);
        midi.note_on_event(0, 60, velocity);
        let mut voice = Voice::new(RATE);
        voice.start(
            VoiceStart {
                region,
                region_index: 0,
                trigger: TriggerEvent {
                    trigger_type: TriggerType::NoteOn,
                    number: 60,
                    value: velocity,
                },
                delay: 0,
                rand_unipolar: 0.0,
                rand_bipolar: 0.0,
                note_duration: None,
            },
            &midi,
            0,
        );
        (voice, midi)
    }

    fn render(voice: &mut Voice, midi: &MidiState, frames: usize) -> StereoBus {
        let curves = CurveTable::new();
        let ctx = RenderContext {
            midi,
            curves: &curves,
            bpm: 120.0,
            sustain_down: false,
            sample_quality: 2,
        };
        let mut buses = vec![StereoBus::new(frames)];
        voice.render_block(&ctx, &mut buses, frames);
        buses.remove(0)
    }

    #[test]
    fn renders_sample_at_unity() {
        let region = sine_region(48_000);
        let (mut voice, midi) = start_voice(region, 1.0);
        let bus = render(&mut voice, &midi, 1024);
        assert!(bus.peak() > 0.5, "peak {}", bus.peak());
        assert!(!voice.is_free());
    }

    #[test]
    fn release_frees_voice_after_tail() {
        let region = sine_region(48_000);
        let (mut voice, midi) = start_voice(region, 1.0);
        render(&mut voice, &midi, 512);
        voice.release(0, false);
        // 10 ms release; give it three blocks
        for _ in 0..3 {
            render(&mut voice, &midi, 512);
        }
        assert!(voice.is_free());
    }

    #[test]
    fn one_shot_ignores_release_and_plays_to_end() {
        let frames = 2048;
        let mut region = Region::new(0);
        let data: Vec<f32> = vec![0.5; frames];
        region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
        region.loop_desc.mode = LoopMode::OneShot;
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        voice.release(0, false);
        assert!(voice.pending_release.is_none());

        let bus = render(&mut voice, &midi, 1024);
        assert!(bus.peak() > 0.1);
        render(&mut voice, &midi, 2048);
        assert!(voice.is_free(), "one-shot should end at the sample end");
    }

    #[test]
    fn loop_continuous_wraps_position() {
        let mut region = Region::new(0);
        let data: Vec<f32> = (0..1000).map(|i| (i as f32 / 1000.0).sin()).collect();
        region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
        region.loop_desc.mode = LoopMode::Continuous;
        region.loop_desc.start = 100;
        region.loop_desc.end = 300;
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        render(&mut voice, &midi, 4096);
        assert!(!voice.is_free());
        let pos = voice.source_position();
        assert!(pos >= 100.0 && pos < 300.0, "position {pos} escaped the loop");
    }

    #[test]
    fn loop_iteration_returns_to_start() {
        let mut region = Region::new(0);
        let data: Vec<f32> = (0..512).map(|i| i as f32).collect();
        region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
        region.loop_desc.mode = LoopMode::Continuous;
        region.loop_desc.start = 0;
        region.loop_desc.end = 256;
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        render(&mut voice, &midi, 300);
        let pos = voice.source_position();
        // One full iteration plus 44 frames: back inside the loop body
        assert!(
            (0.0..256.0).contains(&pos),
            "cursor should wrap to loop start, got {pos}"
        );
    }

    #[test]
    fn reverse_plays_backwards() {
        let mut region = Region::new(0);
        let data: Vec<f32> = vec![0.25; 4096];
        region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
        region.direction = Direction::Reverse;
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        let start = voice.source_position();
        render(&mut voice, &midi, 512);
        assert!(voice.source_position() < start);
    }

    #[test]
    fn delay_outputs_silence_first() {
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.delay = 512.0 / RATE;
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        let bus = render(&mut voice, &midi, 1024);
        let first_half_peak = bus.left[..512].iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        let second_half_peak = bus.left[512..].iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        assert_eq!(first_half_peak, 0.0);
        assert!(second_half_peak > 0.1);
    }

    #[test]
    fn pitch_shift_doubles_increment() {
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.1; 48_000], RATE)));
        region.tune = 1200.0; // one octave up
        let region = Arc::new(region);

        let (mut voice, midi) = start_voice(region, 1.0);
        render(&mut voice, &midi, 1000);
        assert!((voice.source_position() - 2000.0).abs() < 2.0);
    }

    #[test]
    fn fast_off_silences_within_five_ms() {
        let region = sine_region(48_000);
        let (mut voice, midi) = start_voice(region, 1.0);
        render(&mut voice, &midi, 256);
        voice.fast_off();
        assert_eq!(voice.state(), VoiceState::FastOff);
        // 5 ms is 240 samples; after 512 the voice must be gone
        render(&mut voice, &midi, 512);
        assert!(voice.is_free());
    }

    #[test]
    fn rt_decay_attenuates_by_duration() {
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.rt_decay = 6.0;
        let region = Arc::new(region);

        let mut midi = MidiState::new(RATE, 5);
        midi.note_on_event(0, 60, 1.0);

        let mut render_with_duration = |duration: Option<f32>| {
            let mut voice = Voice::new(RATE);
            voice.start(
                VoiceStart {
                    region: region.clone(),
                    region_index: 0,
                    trigger: TriggerEvent {
                        trigger_type: TriggerType::NoteOff,
                        number: 60,
                        value: 1.0,
                    },
                    delay: 0,
                    rand_unipolar: 0.0,
                    rand_bipolar: 0.0,
                    note_duration: duration,
                },
                &midi,
                0,
            );
            render(&mut voice, &midi, 1024).peak()
        };

        let reference = render_with_duration(None);
        let attenuated = render_with_duration(Some(1.0));
        // 1 s at 6 dB/s: half the linear gain
        let ratio = attenuated / reference;
        assert!((ratio - 0.5).abs() < 0.01, "ratio {ratio}");
    }

    #[test]
    fn cutoff_cc_splits_block() {
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.filters.push(crate::filter::FilterDescription {
            cutoff: 500.0,
            ..Default::default()
        });
        region
            .get_or_create_connection(
                crate::modulation::ModSource::controller(74),
                ModTarget::FilCutoff(0),
            )
            .source_depth = 2400.0;
        let region = Arc::new(region);

        let mut midi = MidiState::new(RATE, 5);
        midi.note_on_event(0, 60, 1.0);
        midi.cc_event(0, 74, 0.5);
        midi.cc_event(256, 74, 1.0);

        let mut voice = Voice::new(RATE);
        voice.start(
            VoiceStart {
                region,
                region_index: 0,
                trigger: TriggerEvent {
                    trigger_type: TriggerType::NoteOn,
                    number: 60,
                    value: 1.0,
                },
                delay: 0,
                rand_unipolar: 0.0,
                rand_bipolar: 0.0,
                note_duration: None,
            },
            &midi,
            0,
        );
        // Renders without panicking and splits the block internally; the
        // matrix unit tests assert the per-segment values.
        let bus = render(&mut voice, &midi, 512);
        assert!(bus.peak() > 0.0);
    }
}
