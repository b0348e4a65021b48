//! Region model: immutable playback templates
//!
//! A region is the smallest playback unit: one sample plus the conditions
//! under which it triggers and the parameters it plays with. Regions are
//! built programmatically (the mapping-language parser is an external
//! collaborator), validated once, and never mutated from the render thread
//! except through the dispatch setters, which touch plain scalar fields.
//!
//! Voices never own regions; they hold an `Arc` clone plus the table index,
//! and copy out performance parameters at voice start.

use crate::envelope::EgDescription;
use crate::filter::{EqDescription, FilterDescription};
use crate::flex_envelope::FlexEgDescription;
use crate::lfo::LfoDescription;
use crate::midi_state::MidiState;
use crate::modulation::{same_source, Connection, ControllerParams, ModSource, ModTarget};
use crate::panning::{xf_in, xf_out, XfCurve};
use crate::sample::SampleBuffer;
use std::sync::Arc;

/// An inclusive numeric range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NumRange<T> {
    pub lo: T,
    pub hi: T,
}

impl<T: PartialOrd + Copy> NumRange<T> {
    pub fn new(lo: T, hi: T) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn contains(&self, value: T) -> bool {
        value >= self.lo && value <= self.hi
    }

    /// Half-open containment, used by the random condition so that stacked
    /// random layers partition [0, 1) without overlap.
    #[inline]
    pub fn contains_half_open(&self, value: T) -> bool {
        value >= self.lo && value < self.hi
    }
}

/// What causes a region to start a voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    /// Note-on.
    Attack,
    /// Note-off, waiting for the sustain pedal.
    Release,
    /// Note-off, ignoring the sustain pedal.
    ReleaseKey,
    /// Note-on while no other note is held.
    First,
    /// Note-on while at least one other note is held.
    Legato,
    /// A controller crossing into the region's `on_cc_range`.
    Controller,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Attack => "attack",
            TriggerKind::Release => "release",
            TriggerKind::ReleaseKey => "release_key",
            TriggerKind::First => "first",
            TriggerKind::Legato => "legato",
            TriggerKind::Controller => "controller",
        }
    }
}

/// How a voice dies when its group is choked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffMode {
    /// Run the normal release stage.
    Normal,
    /// Ramp out over the fast-release time.
    Fast,
    /// Ramp out over the region's `off_time`.
    Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopMode {
    NoLoop,
    /// Play to the end, ignoring note-off.
    OneShot,
    /// Loop until the release envelope completes.
    Continuous,
    /// Loop while the note (or sustain pedal) is held, then play out.
    Sustain,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::NoLoop => "no_loop",
            LoopMode::OneShot => "one_shot",
            LoopMode::Continuous => "loop_continuous",
            LoopMode::Sustain => "loop_sustain",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Loop points and crossfade, in frames of the region's sample.
#[derive(Clone, Copy, Debug)]
pub struct LoopDescriptor {
    pub mode: LoopMode,
    pub start: usize,
    /// One past the last looped frame.
    pub end: usize,
    /// Crossfade length in seconds around the loop seam.
    pub crossfade: f32,
    /// Exit the loop after this many iterations.
    pub count: Option<u32>,
}

impl Default for LoopDescriptor {
    fn default() -> Self {
        Self {
            mode: LoopMode::NoLoop,
            start: 0,
            end: 0,
            crossfade: 0.0,
            count: None,
        }
    }
}

/// Keyswitch state maintained by the voice manager and consulted by the
/// keyswitch conditions.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchState {
    /// The most recent note-on inside the keyswitch range.
    pub last: Option<u8>,
    /// The note-on before the current one, for `sw_previous`.
    pub previous_note: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct Region {
    pub id: u32,

    // Sample source
    pub sample: Option<Arc<SampleBuffer>>,
    /// One past the last playable frame; 0 marks the region disabled.
    pub sample_end: usize,
    pub offset: usize,
    pub offset_random: usize,
    pub delay: f32,
    pub delay_random: f32,
    pub direction: Direction,
    pub loop_desc: LoopDescriptor,
    pub oscillator: bool,
    pub oscillator_detune: f32,
    pub oscillator_mod_depth: f32,

    // Trigger conditions
    pub trigger: TriggerKind,
    pub key_range: NumRange<u8>,
    pub vel_range: NumRange<f32>,
    pub bend_range: NumRange<f32>,
    pub aftertouch_range: NumRange<f32>,
    pub bpm_range: NumRange<f32>,
    pub rand_range: NumRange<f32>,
    pub cc_conditions: Vec<(usize, NumRange<f32>)>,
    pub on_cc_range: Option<(usize, NumRange<f32>)>,
    pub sw_last: Option<u8>,
    pub sw_down: Option<u8>,
    pub sw_up: Option<u8>,
    pub sw_previous: Option<u8>,
    pub sw_label: Option<String>,
    pub seq_length: u32,
    pub seq_position: u32,

    // Pitch
    pub pitch_keycenter: u8,
    /// Cents per key away from the keycenter.
    pub pitch_keytrack: f32,
    pub pitch_veltrack: f32,
    pub pitch_random: f32,
    pub transpose: i32,
    pub tune: f32,
    pub bend_up: f32,
    pub bend_down: f32,

    // Generators
    pub amp_eg: EgDescription,
    pub pitch_eg: Option<EgDescription>,
    pub fil_eg: Option<EgDescription>,
    pub amp_lfo: Option<LfoDescription>,
    pub pitch_lfo: Option<LfoDescription>,
    pub fil_lfo: Option<LfoDescription>,
    pub lfos: Vec<LfoDescription>,
    pub flex_egs: Vec<FlexEgDescription>,

    // DSP chain
    pub filters: Vec<FilterDescription>,
    pub equalizers: Vec<EqDescription>,

    // Amplitude stack
    pub volume: f32,
    pub amplitude: f32,
    pub global_amplitude: f32,
    pub master_amplitude: f32,
    pub group_amplitude: f32,
    pub pan: f32,
    pub position: f32,
    pub width: f32,
    pub amp_keytrack: f32,
    pub amp_keycenter: u8,
    pub amp_veltrack: f32,
    pub amp_random: f32,

    // Crossfade ranges
    pub xf_key_in: Option<NumRange<u8>>,
    pub xf_key_out: Option<NumRange<u8>>,
    pub xf_vel_in: Option<NumRange<f32>>,
    pub xf_vel_out: Option<NumRange<f32>>,
    pub xf_cc_in: Vec<(usize, NumRange<f32>)>,
    pub xf_cc_out: Vec<(usize, NumRange<f32>)>,
    pub xf_key_curve: XfCurve,
    pub xf_vel_curve: XfCurve,
    pub xf_cc_curve: XfCurve,

    /// Release-trigger attenuation in dB per second of note duration.
    pub rt_decay: f32,

    // Polyphony and choke
    pub group: u32,
    pub off_by: Option<u32>,
    pub off_mode: OffMode,
    pub off_time: f32,
    pub polyphony: Option<usize>,
    pub note_polyphony: Option<usize>,
    pub note_selfmask: bool,

    // Output
    pub gain_to_effect: Vec<f32>,
    pub sample_quality: Option<u8>,

    pub connections: Vec<Connection>,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            id: 0,
            sample: None,
            sample_end: 0,
            offset: 0,
            offset_random: 0,
            delay: 0.0,
            delay_random: 0.0,
            direction: Direction::Forward,
            loop_desc: LoopDescriptor::default(),
            oscillator: false,
            oscillator_detune: 0.0,
            oscillator_mod_depth: 0.0,
            trigger: TriggerKind::Attack,
            key_range: NumRange::new(0, 127),
            vel_range: NumRange::new(0.0, 1.0),
            bend_range: NumRange::new(-1.0, 1.0),
            aftertouch_range: NumRange::new(0.0, 1.0),
            bpm_range: NumRange::new(0.0, 500.0),
            rand_range: NumRange::new(0.0, 1.0),
            cc_conditions: Vec::new(),
            on_cc_range: None,
            sw_last: None,
            sw_down: None,
            sw_up: None,
            sw_previous: None,
            sw_label: None,
            seq_length: 1,
            seq_position: 1,
            pitch_keycenter: 60,
            pitch_keytrack: 100.0,
            pitch_veltrack: 0.0,
            pitch_random: 0.0,
            transpose: 0,
            tune: 0.0,
            bend_up: 200.0,
            bend_down: -200.0,
            amp_eg: EgDescription::default(),
            pitch_eg: None,
            fil_eg: None,
            amp_lfo: None,
            pitch_lfo: None,
            fil_lfo: None,
            lfos: Vec::new(),
            flex_egs: Vec::new(),
            filters: Vec::new(),
            equalizers: Vec::new(),
            volume: 0.0,
            amplitude: 1.0,
            global_amplitude: 1.0,
            master_amplitude: 1.0,
            group_amplitude: 1.0,
            pan: 0.0,
            position: 0.0,
            width: 1.0,
            amp_keytrack: 0.0,
            amp_keycenter: 60,
            amp_veltrack: 1.0,
            amp_random: 0.0,
            xf_key_in: None,
            xf_key_out: None,
            xf_vel_in: None,
            xf_vel_out: None,
            xf_cc_in: Vec::new(),
            xf_cc_out: Vec::new(),
            xf_key_curve: XfCurve::Power,
            xf_vel_curve: XfCurve::Power,
            xf_cc_curve: XfCurve::Gain,
            rt_decay: 0.0,
            group: 0,
            off_by: None,
            off_mode: OffMode::Fast,
            off_time: 0.005,
            polyphony: None,
            note_polyphony: None,
            note_selfmask: true,
            gain_to_effect: vec![1.0],
            sample_quality: None,
            connections: Vec::new(),
        }
    }
}

impl Region {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Attach sample data and derive the playable end.
    pub fn set_sample(&mut self, sample: Arc<SampleBuffer>) {
        self.sample_end = sample.len();
        if self.loop_desc.end == 0 {
            self.loop_desc.end = sample.len();
        }
        self.sample = Some(sample);
    }

    /// A region without playable sample data never triggers.
    pub fn disabled(&self) -> bool {
        self.sample_end == 0
    }

    //=======================================
    // Trigger predicates

    fn keyswitch_matches(&self, sw: &SwitchState, midi: &MidiState) -> bool {
        if let Some(last) = self.sw_last {
            if sw.last != Some(last) {
                return false;
            }
        }
        if let Some(down) = self.sw_down {
            if !midi.is_note_pressed(down) {
                return false;
            }
        }
        if let Some(up) = self.sw_up {
            if midi.is_note_pressed(up) {
                return false;
            }
        }
        if let Some(previous) = self.sw_previous {
            if sw.previous_note != Some(previous) {
                return false;
            }
        }
        true
    }

    fn cc_conditions_hold(&self, midi: &MidiState, delay: usize) -> bool {
        self.cc_conditions
            .iter()
            .all(|&(cc, range)| range.contains(midi.cc_value_at(cc, delay)))
    }

    fn common_conditions_hold(
        &self,
        delay: usize,
        midi: &MidiState,
        bpm: f32,
        sw: &SwitchState,
    ) -> bool {
        self.bend_range.contains(midi.pitch_bend())
            && self.aftertouch_range.contains(midi.channel_aftertouch())
            && self.bpm_range.contains(bpm)
            && self.cc_conditions_hold(midi, delay)
            && self.keyswitch_matches(sw, midi)
    }

    /// All note-on conditions over the current state. `rand_value` is drawn
    /// once per note-on by the engine; `sequence_count` is the per-region
    /// counter already advanced for this note-on.
    #[allow(clippy::too_many_arguments)]
    pub fn matches_note_on(
        &self,
        delay: usize,
        note: u8,
        velocity: f32,
        rand_value: f32,
        sequence_count: u32,
        midi: &MidiState,
        bpm: f32,
        sw: &SwitchState,
    ) -> bool {
        if self.disabled() {
            return false;
        }
        let trigger_ok = match self.trigger {
            TriggerKind::Attack => true,
            // The new note is already registered when regions are scanned
            TriggerKind::First => midi.active_notes() == 1,
            TriggerKind::Legato => midi.active_notes() > 1,
            _ => false,
        };
        trigger_ok
            && self.key_range.contains(note)
            && self.vel_range.contains(velocity)
            && self.rand_range.contains_half_open(rand_value)
            && self.sequence_matches(sequence_count)
            && self.common_conditions_hold(delay, midi, bpm, sw)
    }

    /// All note-off conditions. Velocity is the recorded note-on velocity.
    #[allow(clippy::too_many_arguments)]
    pub fn matches_note_off(
        &self,
        delay: usize,
        note: u8,
        velocity: f32,
        rand_value: f32,
        midi: &MidiState,
        bpm: f32,
        sw: &SwitchState,
    ) -> bool {
        if self.disabled() {
            return false;
        }
        matches!(self.trigger, TriggerKind::Release | TriggerKind::ReleaseKey)
            && self.key_range.contains(note)
            && self.vel_range.contains(velocity)
            && self.rand_range.contains_half_open(rand_value)
            && self.common_conditions_hold(delay, midi, bpm, sw)
    }

    /// Controller-trigger predicate: fires when the CC value enters the
    /// `on_cc_range` from outside it.
    pub fn matches_cc_trigger(&self, cc: usize, previous: f32, current: f32) -> bool {
        if self.disabled() || self.trigger != TriggerKind::Controller {
            return false;
        }
        match self.on_cc_range {
            Some((on_cc, range)) => {
                on_cc == cc && !range.contains(previous) && range.contains(current)
            }
            None => false,
        }
    }

    fn sequence_matches(&self, sequence_count: u32) -> bool {
        if self.seq_length <= 1 {
            return true;
        }
        (sequence_count.wrapping_sub(1) % self.seq_length) + 1 == self.seq_position
    }

    //=======================================
    // Amplitude stack

    /// Product of the per-region amplitude and its three scaling levels.
    pub fn base_gain(&self) -> f32 {
        self.amplitude * self.global_amplitude * self.master_amplitude * self.group_amplitude
    }

    /// Velocity-to-amplitude gain. `amp_veltrack` blends a squared power
    /// law; negative tracking inverts the response.
    pub fn velocity_gain(&self, velocity: f32) -> f32 {
        let v = velocity.clamp(0.0, 1.0);
        let t = self.amp_veltrack.clamp(-1.0, 1.0);
        if t >= 0.0 {
            (1.0 - t) + t * v * v
        } else {
            1.0 + t * v * v
        }
    }

    /// Key tracking gain in dB away from the amp keycenter.
    pub fn keytrack_gain_db(&self, note: u8) -> f32 {
        self.amp_keytrack * (note as f32 - self.amp_keycenter as f32)
    }

    /// Product of the key/velocity/CC crossfade gains at trigger time.
    pub fn crossfade_gain(&self, note: u8, velocity: f32, midi: &MidiState) -> f32 {
        let mut gain = 1.0;
        if let Some(range) = self.xf_key_in {
            gain *= xf_in(note as f32, range.lo as f32, range.hi as f32, self.xf_key_curve);
        }
        if let Some(range) = self.xf_key_out {
            gain *= xf_out(note as f32, range.lo as f32, range.hi as f32, self.xf_key_curve);
        }
        if let Some(range) = self.xf_vel_in {
            gain *= xf_in(velocity, range.lo, range.hi, self.xf_vel_curve);
        }
        if let Some(range) = self.xf_vel_out {
            gain *= xf_out(velocity, range.lo, range.hi, self.xf_vel_curve);
        }
        for &(cc, range) in &self.xf_cc_in {
            gain *= xf_in(midi.cc_value(cc), range.lo, range.hi, self.xf_cc_curve);
        }
        for &(cc, range) in &self.xf_cc_out {
            gain *= xf_out(midi.cc_value(cc), range.lo, range.hi, self.xf_cc_curve);
        }
        gain
    }

    //=======================================
    // Pitch

    /// Static pitch variation in cents at trigger time.
    pub fn pitch_variation_cents(&self, note: f32, velocity: f32, rand_bipolar: f32) -> f32 {
        self.pitch_keytrack * (note - self.pitch_keycenter as f32)
            + self.transpose as f32 * 100.0
            + self.tune
            + self.pitch_veltrack * velocity
            + self.pitch_random * rand_bipolar
    }

    /// Pitch bend in cents for a normalized bend in [-1, 1].
    pub fn bend_in_cents(&self, bend: f32) -> f32 {
        if bend > 0.0 {
            bend * self.bend_up
        } else {
            -bend * self.bend_down
        }
    }

    //=======================================
    // Output routing

    pub fn gain_to_effect_bus(&self, bus: usize) -> f32 {
        self.gain_to_effect.get(bus).copied().unwrap_or(0.0)
    }

    //=======================================
    // Connection helpers

    pub fn get_connection(&self, source: &ModSource, target: ModTarget) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.target == target && same_source(&c.source, source))
    }

    pub fn get_or_create_connection(
        &mut self,
        source: ModSource,
        target: ModTarget,
    ) -> &mut Connection {
        let idx = self
            .connections
            .iter()
            .position(|c| c.target == target && same_source(&c.source, &source));
        match idx {
            Some(idx) => &mut self.connections[idx],
            None => {
                self.connections.push(Connection::new(source, target, 0.0));
                self.connections.last_mut().unwrap()
            }
        }
    }

    /// Find the controller connection feeding `target`, regardless of
    /// whether it is a channel or per-voice controller source.
    pub fn connection_from_cc(&self, cc: usize, target: ModTarget) -> Option<&Connection> {
        self.connections.iter().find(|c| {
            c.target == target && c.source.cc() == Some(cc)
        })
    }

    pub fn connection_from_cc_mut(&mut self, cc: usize, target: ModTarget) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| {
            c.target == target && c.source.cc() == Some(cc)
        })
    }

    pub fn cc_mod_depth(&self, cc: usize, target: ModTarget) -> Option<f32> {
        self.connection_from_cc(cc, target).map(|c| c.source_depth)
    }

    pub fn cc_mod_parameters(&self, cc: usize, target: ModTarget) -> Option<ControllerParams> {
        self.connection_from_cc(cc, target)
            .and_then(|c| c.source.controller_params())
    }

    /// The set of controllers this region reacts to, used for the
    /// `/cc/slots` inventory.
    pub fn used_ccs(&self, mark: &mut dyn FnMut(usize)) {
        for &(cc, _) in &self.cc_conditions {
            mark(cc);
        }
        if let Some((cc, _)) = self.on_cc_range {
            mark(cc);
        }
        for &(cc, _) in &self.xf_cc_in {
            mark(cc);
        }
        for &(cc, _) in &self.xf_cc_out {
            mark(cc);
        }
        for conn in &self.connections {
            if let Some(cc) = conn.source.cc() {
                mark(cc);
            }
            if let Some(cc) = conn.depth_mod.as_ref().and_then(|s| s.cc()) {
                mark(cc);
            }
        }
        let eg_ccs = |eg: &EgDescription, mark: &mut dyn FnMut(usize)| {
            for mods in [
                &eg.cc_delay,
                &eg.cc_attack,
                &eg.cc_hold,
                &eg.cc_decay,
                &eg.cc_sustain,
                &eg.cc_release,
            ] {
                for &(cc, _) in mods {
                    mark(cc);
                }
            }
        };
        eg_ccs(&self.amp_eg, mark);
        if let Some(eg) = &self.pitch_eg {
            eg_ccs(eg, mark);
        }
        if let Some(eg) = &self.fil_eg {
            eg_ccs(eg, mark);
        }
    }
}
