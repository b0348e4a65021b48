//! Modulation graph addresses and connections
//!
//! A region's modulation graph is a flat list of [`Connection`] edges from a
//! [`ModSource`] to a [`ModTarget`]. For any `(source, target)` pair there
//! is at most one connection. A connection's depth can itself be modulated
//! by a second source (`depth_mod`), forming a second edge whose target is
//! the depth of the primary edge.

/// Shaping applied to a controller-backed source before it enters the
/// matrix: curve table index, one-pole smoothing time, and quantization
/// step. Step quantization happens before smoothing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControllerParams {
    pub curve: usize,
    pub smooth_ms: f32,
    pub step: f32,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            curve: 0,
            smooth_ms: 0.0,
            step: 0.0,
        }
    }
}

/// The source side of a modulation edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ModSource {
    /// A channel controller (MIDI CC or extended slot).
    Controller { cc: usize, params: ControllerParams },
    /// A controller resolved against the voice's own note (per-note CC
    /// merged additively with the channel stream).
    PerVoiceController { cc: usize, params: ControllerParams },
    AmpEg,
    PitchEg,
    FilEg,
    AmpLfo,
    PitchLfo,
    FilLfo,
    /// A numbered free LFO.
    Lfo(usize),
    /// A numbered flex envelope.
    FlexEg(usize),
    ChannelAftertouch,
    /// Polyphonic aftertouch resolved against the voice's note.
    PolyAftertouch,
}

impl ModSource {
    pub fn controller(cc: usize) -> Self {
        ModSource::Controller {
            cc,
            params: ControllerParams::default(),
        }
    }

    /// The CC number when this source is controller-backed.
    pub fn cc(&self) -> Option<usize> {
        match self {
            ModSource::Controller { cc, .. } | ModSource::PerVoiceController { cc, .. } => Some(*cc),
            _ => None,
        }
    }

    pub fn controller_params(&self) -> Option<ControllerParams> {
        match self {
            ModSource::Controller { params, .. } | ModSource::PerVoiceController { params, .. } => {
                Some(*params)
            }
            _ => None,
        }
    }
}

/// The target side of a modulation edge. Units per target follow the value
/// scaling contract: `Volume`, resonance and filter/EQ gains are dB
/// additive; `Pitch` and `FilCutoff` are cents additive; the percentage
/// targets are normalized 0..1 additive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModTarget {
    Volume,
    Amplitude,
    Pan,
    Position,
    Width,
    Pitch,
    FilCutoff(usize),
    FilResonance(usize),
    FilGain(usize),
    EqGain(usize),
    EqFrequency(usize),
    EqBandwidth(usize),
    OscillatorDetune,
    OscillatorModDepth,
    LfoFrequency(usize),
    LfoBeats(usize),
    LfoPhase(usize),
    AmpLfoDepth,
    PitchLfoDepth,
    FilLfoDepth,
}

/// One edge of the modulation graph.
#[derive(Clone, Debug)]
pub struct Connection {
    pub source: ModSource,
    pub target: ModTarget,
    /// Static depth in the target's units.
    pub source_depth: f32,
    /// Extra depth scaled by the voice's trigger velocity.
    pub vel_to_depth: f32,
    /// When set, the effective depth is `source_depth * depth_mod_value`
    /// (plus the velocity term).
    pub depth_mod: Option<ModSource>,
}

impl Connection {
    pub fn new(source: ModSource, target: ModTarget, depth: f32) -> Self {
        Self {
            source,
            target,
            source_depth: depth,
            vel_to_depth: 0.0,
            depth_mod: None,
        }
    }
}

/// Matching helper for connection lookup: sources compare by identity and
/// CC number, ignoring the shaping parameters, so that updating `smooth` or
/// `curve` on an existing edge finds the edge it modifies.
pub fn same_source(a: &ModSource, b: &ModSource) -> bool {
    use ModSource::*;
    match (a, b) {
        (Controller { cc: ca, .. }, Controller { cc: cb, .. }) => ca == cb,
        (PerVoiceController { cc: ca, .. }, PerVoiceController { cc: cb, .. }) => ca == cb,
        (Lfo(a), Lfo(b)) | (FlexEg(a), FlexEg(b)) => a == b,
        (AmpEg, AmpEg)
        | (PitchEg, PitchEg)
        | (FilEg, FilEg)
        | (AmpLfo, AmpLfo)
        | (PitchLfo, PitchLfo)
        | (FilLfo, FilLfo)
        | (ChannelAftertouch, ChannelAftertouch)
        | (PolyAftertouch, PolyAftertouch) => true,
        _ => false,
    }
}
