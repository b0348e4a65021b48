//! Flex envelopes: multi-segment envelopes specified as point lists
//!
//! A flex envelope is an ordered list of `{time, level, shape}` points. The
//! generator walks the points in order; an optional sustain point freezes
//! playback on that point until release. A flex envelope can be nominated
//! as the amplitude gate of its region, replacing the classic amplitude EG.

use crate::midi_state::MidiState;

/// One point of a flex envelope. `time` is the duration of the segment
/// leading into this point; `shape` bends the segment (0 = linear, positive
/// = slow start, negative = fast start).
#[derive(Clone, Debug)]
pub struct FlexEgPoint {
    pub time: f32,
    pub level: f32,
    pub shape: f32,
    /// Controller deltas on the segment time.
    pub cc_time: Vec<(usize, f32)>,
    /// Controller deltas on the target level.
    pub cc_level: Vec<(usize, f32)>,
}

impl FlexEgPoint {
    pub fn new(time: f32, level: f32) -> Self {
        Self {
            time,
            level,
            shape: 0.0,
            cc_time: Vec::new(),
            cc_level: Vec::new(),
        }
    }

    fn resolved_time(&self, midi: &MidiState) -> f32 {
        let delta: f32 = self.cc_time.iter().map(|&(cc, amt)| amt * midi.cc_value(cc)).sum();
        (self.time + delta).max(0.0)
    }

    fn resolved_level(&self, midi: &MidiState) -> f32 {
        let delta: f32 = self.cc_level.iter().map(|&(cc, amt)| amt * midi.cc_value(cc)).sum();
        self.level + delta
    }
}

/// Description of a flex envelope, shared by all voices of a region.
#[derive(Clone, Debug, Default)]
pub struct FlexEgDescription {
    pub points: Vec<FlexEgPoint>,
    /// Index of the point playback freezes on until release.
    pub sustain_point: Option<usize>,
    /// When true this envelope replaces the classic amplitude EG as the
    /// voice gate.
    pub amp_gate: bool,
}

/// Runtime state walking the point list of a [`FlexEgDescription`].
#[derive(Clone, Debug)]
pub struct FlexEgGenerator {
    sample_rate: f32,
    /// Segment times/levels resolved at trigger.
    times: Vec<f32>,
    levels: Vec<f32>,
    shapes: Vec<f32>,
    sustain_point: Option<usize>,

    segment: usize,
    segment_start_level: f32,
    time_in_segment: f32,
    current_level: f32,
    released: bool,
    finished: bool,
}

impl FlexEgGenerator {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            times: Vec::new(),
            levels: Vec::new(),
            shapes: Vec::new(),
            sustain_point: None,
            segment: 0,
            segment_start_level: 0.0,
            time_in_segment: 0.0,
            current_level: 0.0,
            released: false,
            finished: true,
        }
    }

    pub fn trigger(&mut self, desc: &FlexEgDescription, midi: &MidiState) {
        self.times.clear();
        self.levels.clear();
        self.shapes.clear();
        for point in &desc.points {
            self.times.push(point.resolved_time(midi));
            self.levels.push(point.resolved_level(midi));
            self.shapes.push(point.shape);
        }
        self.sustain_point = desc.sustain_point.filter(|&i| i < desc.points.len());
        self.segment = 0;
        self.segment_start_level = 0.0;
        self.time_in_segment = 0.0;
        self.current_level = 0.0;
        self.released = false;
        self.finished = desc.points.is_empty();
    }

    pub fn release(&mut self) {
        self.released = true;
    }

    /// Advance one sample.
    pub fn process(&mut self) -> f32 {
        if self.finished {
            return self.current_level;
        }

        let seg_time = self.times[self.segment];
        let target = self.levels[self.segment];

        if seg_time <= 0.0 {
            self.current_level = target;
        } else {
            self.time_in_segment += 1.0 / self.sample_rate;
            let frac = (self.time_in_segment / seg_time).min(1.0);
            let shaped = shape_fraction(frac, self.shapes[self.segment]);
            self.current_level =
                self.segment_start_level + (target - self.segment_start_level) * shaped;
        }

        let segment_done = seg_time <= 0.0 || self.time_in_segment >= seg_time;
        if segment_done {
            let at_sustain = self.sustain_point == Some(self.segment);
            if at_sustain && !self.released {
                // Freeze on the sustain point; the level stays put.
                self.current_level = target;
                return self.current_level;
            }
            self.segment += 1;
            self.segment_start_level = self.current_level;
            self.time_in_segment = 0.0;
            if self.segment >= self.times.len() {
                self.finished = true;
            }
        }

        self.current_level
    }

    pub fn level(&self) -> f32 {
        self.current_level
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }
}

/// Bend a segment fraction by the point's shape value. The exponent doubles
/// per unit of shape so that shape 0 is exactly linear.
fn shape_fraction(frac: f32, shape: f32) -> f32 {
    if shape == 0.0 {
        frac
    } else {
        frac.powf(2f32.powf(shape))
    }
}
