//! Per-voice modulation matrix evaluation
//!
//! The matrix is evaluated at control rate (once per render segment) and
//! folds every connection's contribution into the target's base value by
//! addition. Controller sources pass through their curve, are quantized to
//! their step, then smoothed by a one-pole toward the shaped value; the
//! order is curve, step, smooth.
//!
//! Generator sources (EGs, LFOs) are ticked by the voice before the matrix
//! is consulted; their current levels arrive through [`ModContext`].

use crate::curve::CurveTable;
use crate::midi_state::MidiState;
use crate::modulation::{Connection, ControllerParams, ModSource, ModTarget};
use crate::region::Region;
use crate::smoother::OnePoleSmoother;

/// Everything a matrix evaluation can read: borrowed MIDI state plus the
/// voice's own generator outputs.
pub struct ModContext<'a> {
    pub midi: &'a MidiState,
    pub curves: &'a CurveTable,
    pub note: u8,
    pub velocity: f32,
    pub amp_eg: f32,
    pub pitch_eg: f32,
    pub fil_eg: f32,
    pub amp_lfo: f32,
    pub pitch_lfo: f32,
    pub fil_lfo: f32,
    pub lfos: &'a [f32],
    pub flex_egs: &'a [f32],
}

struct MatrixEntry {
    conn: Connection,
    smoother: Option<OnePoleSmoother>,
    depth_smoother: Option<OnePoleSmoother>,
}

fn make_smoother(source: &ModSource, sample_rate: f32) -> Option<OnePoleSmoother> {
    source.controller_params().and_then(|p| {
        if p.smooth_ms > 0.0 {
            Some(OnePoleSmoother::new(p.smooth_ms, sample_rate))
        } else {
            None
        }
    })
}

/// A voice's instantiation of its region's modulation graph, carrying the
/// per-connection smoothing state.
pub struct ModMatrix {
    entries: Vec<MatrixEntry>,
    sample_rate: f32,
}

impl ModMatrix {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            entries: Vec::with_capacity(16),
            sample_rate,
        }
    }

    /// Rebuild the entry list from a region's connections. Called at voice
    /// start; the per-connection smoothers start from the first value seen.
    pub fn attach(&mut self, region: &Region) {
        self.entries.clear();
        for conn in &region.connections {
            self.entries.push(MatrixEntry {
                smoother: make_smoother(&conn.source, self.sample_rate),
                depth_smoother: conn
                    .depth_mod
                    .as_ref()
                    .and_then(|s| make_smoother(s, self.sample_rate)),
                conn: conn.clone(),
            });
        }
    }

    /// True when any connection feeds `target`; lets the voice skip work
    /// for unmodulated parameters.
    pub fn has_target(&self, target: ModTarget) -> bool {
        self.entries.iter().any(|e| e.conn.target == target)
    }

    /// Raw controller read for a source, merging per-note state where the
    /// source asks for it.
    fn controller_raw(source_cc: usize, per_voice: bool, ctx: &ModContext, delay: usize) -> f32 {
        let channel = ctx.midi.cc_value_at(source_cc, delay);
        if per_voice {
            channel + ctx.midi.per_note_cc_value_at(ctx.note, source_cc, delay)
        } else {
            channel
        }
    }

    fn shape_controller(
        raw: f32,
        params: ControllerParams,
        smoother: &mut Option<OnePoleSmoother>,
        ctx: &ModContext,
        samples: usize,
    ) -> f32 {
        let mut value = ctx.curves.curve(params.curve).eval(raw);
        if params.step > 0.0 {
            value = (value / params.step).round() * params.step;
        }
        if let Some(smoother) = smoother {
            value = smoother.advance(value, samples);
        }
        value
    }

    fn source_value(
        source: &ModSource,
        smoother: &mut Option<OnePoleSmoother>,
        ctx: &ModContext,
        delay: usize,
        samples: usize,
    ) -> f32 {
        match source {
            ModSource::Controller { cc, params } => {
                let raw = Self::controller_raw(*cc, false, ctx, delay);
                Self::shape_controller(raw, *params, smoother, ctx, samples)
            }
            ModSource::PerVoiceController { cc, params } => {
                let raw = Self::controller_raw(*cc, true, ctx, delay);
                Self::shape_controller(raw, *params, smoother, ctx, samples)
            }
            ModSource::AmpEg => ctx.amp_eg,
            ModSource::PitchEg => ctx.pitch_eg,
            ModSource::FilEg => ctx.fil_eg,
            ModSource::AmpLfo => ctx.amp_lfo,
            ModSource::PitchLfo => ctx.pitch_lfo,
            ModSource::FilLfo => ctx.fil_lfo,
            ModSource::Lfo(index) => ctx.lfos.get(*index).copied().unwrap_or(0.0),
            ModSource::FlexEg(index) => ctx.flex_egs.get(*index).copied().unwrap_or(0.0),
            ModSource::ChannelAftertouch => {
                crate::events::value_at(ctx.midi.channel_aftertouch_events(), delay)
            }
            ModSource::PolyAftertouch => {
                crate::events::value_at(ctx.midi.poly_aftertouch_events(ctx.note), delay)
            }
        }
    }

    /// Final value of `target`: the region's base value plus the additive
    /// contribution of every connection into it. `samples` is the length of
    /// the control segment being evaluated, used to advance the smoothers.
    pub fn target_value(
        &mut self,
        target: ModTarget,
        base: f32,
        ctx: &ModContext,
        delay: usize,
        samples: usize,
    ) -> f32 {
        let mut value = base;
        for entry in &mut self.entries {
            if entry.conn.target != target {
                continue;
            }
            let source_value =
                Self::source_value(&entry.conn.source, &mut entry.smoother, ctx, delay, samples);

            let mut depth = entry.conn.source_depth;
            if let Some(depth_source) = &entry.conn.depth_mod {
                // The depth modulator scales the static depth: a controller
                // at 1.0 yields the full configured depth.
                let scale = Self::source_value(
                    depth_source,
                    &mut entry.depth_smoother,
                    ctx,
                    delay,
                    samples,
                );
                depth *= scale;
            }
            depth += entry.conn.vel_to_depth * ctx.velocity;

            value += depth * source_value;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::ControllerParams;

    const RATE: f32 = 48_000.0;

    struct Fixture {
        midi: MidiState,
        curves: CurveTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                midi: MidiState::new(RATE, 3),
                curves: CurveTable::new(),
            }
        }

        fn ctx(&self) -> ModContext<'_> {
            ModContext {
                midi: &self.midi,
                curves: &self.curves,
                note: 60,
                velocity: 1.0,
                amp_eg: 0.0,
                pitch_eg: 0.0,
                fil_eg: 0.0,
                amp_lfo: 0.0,
                pitch_lfo: 0.0,
                fil_lfo: 0.0,
                lfos: &[],
                flex_egs: &[],
            }
        }
    }

    fn matrix_for(region: &Region) -> ModMatrix {
        let mut matrix = ModMatrix::new(RATE);
        matrix.attach(region);
        matrix
    }

    #[test]
    fn linear_curve_identity() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 74, 0.6);

        let mut region = Region::new(0);
        region
            .get_or_create_connection(ModSource::controller(74), ModTarget::FilCutoff(0))
            .source_depth = 1.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::FilCutoff(0), 0.0, &fixture.ctx(), 0, 16);
        assert!((got - 0.6).abs() < 1e-5);
    }

    #[test]
    fn contributions_add_onto_base() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 1, 1.0);
        fixture.midi.cc_event(0, 2, 0.5);

        let mut region = Region::new(0);
        region
            .get_or_create_connection(ModSource::controller(1), ModTarget::Pitch)
            .source_depth = 100.0;
        region
            .get_or_create_connection(ModSource::controller(2), ModTarget::Pitch)
            .source_depth = 200.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Pitch, 50.0, &fixture.ctx(), 0, 16);
        assert!((got - 250.0).abs() < 1e-4);
    }

    #[test]
    fn step_quantizes_before_use() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 20, 0.34);

        let mut region = Region::new(0);
        region.get_or_create_connection(
            ModSource::Controller {
                cc: 20,
                params: ControllerParams {
                    curve: 0,
                    smooth_ms: 0.0,
                    step: 0.25,
                },
            },
            ModTarget::Amplitude,
        ).source_depth = 1.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Amplitude, 0.0, &fixture.ctx(), 0, 16);
        assert!((got - 0.25).abs() < 1e-5);
    }

    #[test]
    fn smoothing_lags_behind_jump() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 30, 0.0);

        let mut region = Region::new(0);
        region.get_or_create_connection(
            ModSource::Controller {
                cc: 30,
                params: ControllerParams {
                    curve: 0,
                    smooth_ms: 100.0,
                    step: 0.0,
                },
            },
            ModTarget::Volume,
        ).source_depth = 1.0;
        let mut matrix = matrix_for(&region);

        // Prime at zero, then jump the controller
        let _ = matrix.target_value(ModTarget::Volume, 0.0, &fixture.ctx(), 0, 16);
        fixture.midi.cc_event(0, 30, 1.0);
        let early = matrix.target_value(ModTarget::Volume, 0.0, &fixture.ctx(), 0, 16);
        assert!(early < 0.3, "smoothing should lag, got {early}");

        let late = matrix.target_value(ModTarget::Volume, 0.0, &fixture.ctx(), 0, 48_000);
        assert!(late > 0.95, "smoothing should converge, got {late}");
    }

    #[test]
    fn depth_modulation_scales_depth() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 1, 1.0);
        fixture.midi.cc_event(0, 11, 0.5);

        let mut region = Region::new(0);
        let conn = region
            .get_or_create_connection(ModSource::controller(1), ModTarget::Pitch);
        conn.source_depth = 1200.0;
        conn.depth_mod = Some(ModSource::controller(11));
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Pitch, 0.0, &fixture.ctx(), 0, 16);
        assert!((got - 600.0).abs() < 1e-3);
    }

    #[test]
    fn velocity_adds_to_depth() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 1, 1.0);

        let mut region = Region::new(0);
        let conn = region
            .get_or_create_connection(ModSource::controller(1), ModTarget::Volume);
        conn.source_depth = 0.0;
        conn.vel_to_depth = 6.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Volume, 0.0, &fixture.ctx(), 0, 16);
        assert!((got - 6.0).abs() < 1e-5);
    }

    #[test]
    fn per_voice_controller_merges_per_note() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 16, 0.25);
        fixture.midi.per_note_cc_event(0, 60, 16, 0.25);

        let mut region = Region::new(0);
        region
            .get_or_create_connection(
                ModSource::PerVoiceController {
                    cc: 16,
                    params: ControllerParams::default(),
                },
                ModTarget::Pan,
            )
            .source_depth = 1.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Pan, 0.0, &fixture.ctx(), 0, 16);
        assert!((got - 0.5).abs() < 1e-5);
    }

    #[test]
    fn generator_sources_read_context() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.pitch_eg = 0.5;
        ctx.lfos = &[0.0, -1.0];

        let mut region = Region::new(0);
        region
            .get_or_create_connection(ModSource::PitchEg, ModTarget::Pitch)
            .source_depth = 100.0;
        region
            .get_or_create_connection(ModSource::Lfo(1), ModTarget::Pitch)
            .source_depth = 10.0;
        let mut matrix = matrix_for(&region);

        let got = matrix.target_value(ModTarget::Pitch, 0.0, &ctx, 0, 16);
        assert!((got - 40.0).abs() < 1e-4);
    }

    #[test]
    fn cc_value_changes_mid_block() {
        let mut fixture = Fixture::new();
        fixture.midi.cc_event(0, 74, 0.5);
        fixture.midi.cc_event(256, 74, 1.0);

        let mut region = Region::new(0);
        region
            .get_or_create_connection(ModSource::controller(74), ModTarget::FilCutoff(0))
            .source_depth = 2400.0;
        let mut matrix = matrix_for(&region);

        let ctx = fixture.ctx();
        let first = matrix.target_value(ModTarget::FilCutoff(0), 0.0, &ctx, 0, 256);
        let second = matrix.target_value(ModTarget::FilCutoff(0), 0.0, &ctx, 256, 256);
        assert!((first - 1200.0).abs() < 1e-3);
        assert!((second - 2400.0).abs() < 1e-3);
    }
}
