//! Engine-wide constants and tuning knobs
//!
//! Everything here is a compile-time default; the runtime values (sample
//! rate, block size) are set on the [`crate::engine::Engine`] at creation.

/// Default voice pool size (fixed at engine creation, never grows)
pub const DEFAULT_MAX_VOICES: usize = 64;

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: f32 = 48_000.0;

/// Default maximum samples per render block
pub const DEFAULT_SAMPLES_PER_BLOCK: usize = 1024;

/// Number of effect buses addressable from a region (`0` is the main bus)
pub const MAX_EFFECT_BUSES: usize = 4;

/// Amplitude below which a released voice is considered silent and freed
pub const SILENCE_THRESHOLD: f32 = 1e-4;

/// Ramp length used when a voice is stolen or fast-choked
pub const FAST_RELEASE_SECONDS: f32 = 0.005;

/// Capacity of the control event queue between non-realtime threads and the
/// render thread
pub const CONTROL_QUEUE_CAPACITY: usize = 1024;

/// Number of curve slots in the curve table
pub const NUM_CURVES: usize = 256;

/// Points per curve
pub const CURVE_POINTS: usize = 128;

/// Default interpolation quality for sample playback, 0..=10
pub const DEFAULT_SAMPLE_QUALITY: u8 = 2;

/// Default interpolation quality when freewheeling (offline render)
pub const FREEWHEELING_SAMPLE_QUALITY: u8 = 10;

/// The sustain pedal controller
pub const SUSTAIN_CC: usize = 64;

/// Pedal threshold above which sustain is considered depressed
pub const SUSTAIN_THRESHOLD: f32 = 0.5;

/// Size of the controller table: 128 MIDI CCs plus the extended slots below.
pub const NUM_CCS: usize = 144;

/// Virtual controller slots beyond MIDI's 128.
///
/// These behave exactly like CCs inside the modulation matrix: they carry
/// sorted event vectors and can be sources of connections. The engine stamps
/// them from note and wheel events.
pub mod extended_ccs {
    /// Pitch bend, normalized to [-1, 1]
    pub const PITCH_BEND: usize = 128;
    /// Channel aftertouch
    pub const CHANNEL_AFTERTOUCH: usize = 129;
    /// Polyphonic aftertouch (per-note vectors live in `MidiState`)
    pub const POLY_AFTERTOUCH: usize = 130;
    /// Velocity of the most recent note-on
    pub const NOTE_ON_VELOCITY: usize = 131;
    /// Velocity of the most recent note-off
    pub const NOTE_OFF_VELOCITY: usize = 132;
    /// Most recent note number, normalized to [0, 1] over 127
    pub const KEYBOARD_NOTE_NUMBER: usize = 133;
    /// 1 while at least one other note is held at note-on time
    pub const KEYBOARD_NOTE_GATE: usize = 134;
    /// Fresh uniform random in [0, 1] per note event
    pub const UNIPOLAR_RANDOM: usize = 135;
    /// Fresh uniform random in [-1, 1] per note event
    pub const BIPOLAR_RANDOM: usize = 136;
    /// Toggles between 0 and 1 on every note-on
    pub const ALTERNATE: usize = 137;
    /// Signed distance in keys from the previous note-on
    pub const KEYDELTA: usize = 140;
    /// Absolute distance in keys from the previous note-on
    pub const ABSOLUTE_KEYDELTA: usize = 141;
}
