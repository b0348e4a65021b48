//! Classic envelope generators
//!
//! The DAHDSR generator (delay, attack, hold, decay, sustain, release)
//! drives amplitude, pitch and filter envelopes. Stage times and the
//! sustain level can carry velocity and controller deltas, resolved once at
//! trigger time; a `dynamic` envelope re-resolves sustain while the segment
//! plays.
//!
//! The amplitude EG is the gating signal for its voice: the voice frees
//! itself once the released envelope falls under the silence threshold.

use crate::config::SILENCE_THRESHOLD;
use crate::midi_state::MidiState;

/// Multiplier such that an exponential segment reaches -60 dB at its
/// nominal duration.
const EXP_SLOPE: f32 = 6.908; // ln(1000)

/// Description of a DAHDSR envelope, shared by all voices of a region.
#[derive(Clone, Debug)]
pub struct EgDescription {
    /// Level the attack starts from, 0..1.
    pub start: f32,
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    /// Sustain level, 0..1.
    pub sustain: f32,
    pub release: f32,
    /// Generator output scale for pitch (cents) and filter (cents) EGs.
    pub depth: f32,

    pub vel_to_delay: f32,
    pub vel_to_attack: f32,
    pub vel_to_hold: f32,
    pub vel_to_decay: f32,
    pub vel_to_sustain: f32,
    pub vel_to_release: f32,

    /// Controller deltas per stage: `(cc, amount)` pairs added to the stage
    /// value scaled by the controller's current value.
    pub cc_delay: Vec<(usize, f32)>,
    pub cc_attack: Vec<(usize, f32)>,
    pub cc_hold: Vec<(usize, f32)>,
    pub cc_decay: Vec<(usize, f32)>,
    pub cc_sustain: Vec<(usize, f32)>,
    pub cc_release: Vec<(usize, f32)>,

    /// Recompute the sustain level from current modulation while sustaining.
    pub dynamic: bool,
}

impl Default for EgDescription {
    fn default() -> Self {
        Self {
            start: 0.0,
            delay: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.0,
            depth: 0.0,
            vel_to_delay: 0.0,
            vel_to_attack: 0.0,
            vel_to_hold: 0.0,
            vel_to_decay: 0.0,
            vel_to_sustain: 0.0,
            vel_to_release: 0.0,
            cc_delay: Vec::new(),
            cc_attack: Vec::new(),
            cc_hold: Vec::new(),
            cc_decay: Vec::new(),
            cc_sustain: Vec::new(),
            cc_release: Vec::new(),
            dynamic: false,
        }
    }
}

fn cc_delta(mods: &[(usize, f32)], midi: &MidiState) -> f32 {
    mods.iter().map(|&(cc, amt)| amt * midi.cc_value(cc)).sum()
}

impl EgDescription {
    fn resolve_sustain(&self, velocity: f32, midi: &MidiState) -> f32 {
        (self.sustain + self.vel_to_sustain * velocity + cc_delta(&self.cc_sustain, midi))
            .clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeState {
    Idle,
    Delay,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    Finished,
}

/// Runtime DAHDSR state machine. Stage times are resolved at trigger.
#[derive(Clone, Debug)]
pub struct EnvelopeGenerator {
    state: EnvelopeState,
    current_level: f32,
    time_in_state: f32,
    sample_rate: f32,

    start: f32,
    delay: f32,
    attack: f32,
    hold: f32,
    decay: f32,
    sustain: f32,
    release: f32,
    dynamic: bool,
    release_start_level: f32,
}

impl EnvelopeGenerator {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            state: EnvelopeState::Idle,
            current_level: 0.0,
            time_in_state: 0.0,
            sample_rate,
            start: 0.0,
            delay: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.0,
            dynamic: false,
            release_start_level: 0.0,
        }
    }

    /// Start the envelope, resolving stage times from velocity and the
    /// current controller values.
    pub fn trigger(&mut self, desc: &EgDescription, velocity: f32, midi: &MidiState) {
        self.start = desc.start.clamp(0.0, 1.0);
        self.delay =
            (desc.delay + desc.vel_to_delay * velocity + cc_delta(&desc.cc_delay, midi)).max(0.0);
        self.attack = (desc.attack + desc.vel_to_attack * velocity + cc_delta(&desc.cc_attack, midi))
            .max(0.0);
        self.hold =
            (desc.hold + desc.vel_to_hold * velocity + cc_delta(&desc.cc_hold, midi)).max(0.0);
        self.decay = (desc.decay + desc.vel_to_decay * velocity + cc_delta(&desc.cc_decay, midi))
            .max(0.0);
        self.sustain = desc.resolve_sustain(velocity, midi);
        self.release = (desc.release
            + desc.vel_to_release * velocity
            + cc_delta(&desc.cc_release, midi))
        .max(0.0);
        self.dynamic = desc.dynamic;

        self.state = if self.delay > 0.0 {
            EnvelopeState::Delay
        } else {
            EnvelopeState::Attack
        };
        self.current_level = if self.state == EnvelopeState::Attack {
            self.start
        } else {
            0.0
        };
        self.time_in_state = 0.0;
    }

    /// Re-resolve the sustain level mid-flight. Only meaningful while
    /// `dynamic` envelopes are decaying or sustaining.
    pub fn update_sustain(&mut self, desc: &EgDescription, velocity: f32, midi: &MidiState) {
        if self.dynamic {
            self.sustain = desc.resolve_sustain(velocity, midi);
        }
    }

    /// Note-off: enter the release stage from the current level.
    pub fn release(&mut self) {
        match self.state {
            EnvelopeState::Idle | EnvelopeState::Finished | EnvelopeState::Release => {}
            _ => {
                self.state = EnvelopeState::Release;
                self.release_start_level = self.current_level;
                self.time_in_state = 0.0;
            }
        }
    }

    /// Force a short release regardless of the configured release time.
    /// Used for voice stealing and fast group choke.
    pub fn quick_release(&mut self, seconds: f32) {
        self.release = seconds.max(1.0 / self.sample_rate);
        self.state = EnvelopeState::Release;
        self.release_start_level = self.current_level;
        self.time_in_state = 0.0;
    }

    /// Cancel an in-progress release and return to the sustain stage.
    pub fn cancel_release(&mut self) {
        if self.state == EnvelopeState::Release {
            self.state = EnvelopeState::Sustain;
            self.time_in_state = 0.0;
        }
    }

    /// Advance one sample and return the new level.
    pub fn process(&mut self) -> f32 {
        let dt = 1.0 / self.sample_rate;

        match self.state {
            EnvelopeState::Idle => {
                self.current_level = 0.0;
            }
            EnvelopeState::Delay => {
                self.time_in_state += dt;
                self.current_level = 0.0;
                if self.time_in_state >= self.delay {
                    self.state = EnvelopeState::Attack;
                    self.time_in_state = 0.0;
                    self.current_level = self.start;
                }
            }
            EnvelopeState::Attack => {
                if self.attack <= dt {
                    self.state = EnvelopeState::Hold;
                    self.time_in_state = 0.0;
                    self.current_level = 1.0;
                } else {
                    self.time_in_state += dt;
                    let progress = (self.time_in_state / self.attack).min(1.0);
                    self.current_level = self.start + (1.0 - self.start) * progress;
                    if progress >= 1.0 {
                        self.state = EnvelopeState::Hold;
                        self.time_in_state = 0.0;
                    }
                }
            }
            EnvelopeState::Hold => {
                self.current_level = 1.0;
                self.time_in_state += dt;
                if self.time_in_state >= self.hold {
                    self.state = EnvelopeState::Decay;
                    self.time_in_state = 0.0;
                }
            }
            EnvelopeState::Decay => {
                if self.decay <= dt {
                    self.current_level = self.sustain;
                    self.state = EnvelopeState::Sustain;
                    self.time_in_state = 0.0;
                } else {
                    self.time_in_state += dt;
                    let t = self.time_in_state / self.decay;
                    self.current_level =
                        self.sustain + (1.0 - self.sustain) * (-EXP_SLOPE * t).exp();
                    if t >= 1.0 {
                        self.current_level = self.sustain;
                        self.state = EnvelopeState::Sustain;
                        self.time_in_state = 0.0;
                    }
                }
            }
            EnvelopeState::Sustain => {
                self.current_level = self.sustain;
                if self.sustain <= SILENCE_THRESHOLD {
                    self.state = EnvelopeState::Finished;
                }
            }
            EnvelopeState::Release => {
                if self.release <= dt {
                    self.current_level = 0.0;
                    self.state = EnvelopeState::Finished;
                } else {
                    self.time_in_state += dt;
                    let t = self.time_in_state / self.release;
                    self.current_level = self.release_start_level * (-EXP_SLOPE * t).exp();
                    if self.current_level < SILENCE_THRESHOLD {
                        self.current_level = 0.0;
                        self.state = EnvelopeState::Finished;
                    }
                }
            }
            EnvelopeState::Finished => {
                self.current_level = 0.0;
            }
        }

        self.current_level
    }

    pub fn level(&self) -> f32 {
        self.current_level
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, EnvelopeState::Idle | EnvelopeState::Finished)
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, EnvelopeState::Release | EnvelopeState::Finished)
    }
}
