//! End-to-end engine scenarios
//!
//! These tests drive the full path: events in, rendered audio out, with
//! numeric assertions on the buffers and the voice pool.

use std::sync::Arc;
use strata::bus::StereoBus;
use strata::engine::Engine;
use strata::modulation::{ModSource, ModTarget};
use strata::region::{LoopMode, NumRange, Region, TriggerKind};
use strata::sample::SampleBuffer;

const RATE: f32 = 48_000.0;

fn sine_sample(seconds: f32, freq: f32) -> Arc<SampleBuffer> {
    let frames = (seconds * RATE) as usize;
    let data: Vec<f32> = (0..frames)
        .map(|i| (std::f32::consts::TAU * freq * i as f32 / RATE).sin())
        .collect();
    Arc::new(SampleBuffer::from_mono(data, RATE))
}

fn one_key_region(note: u8) -> Region {
    let mut region = Region::new(0);
    region.set_sample(sine_sample(1.0, 440.0));
    region.key_range = NumRange::new(note, note);
    region.pitch_keycenter = note;
    region.amp_eg.attack = 0.0;
    region.amp_eg.release = 0.01;
    region
}

fn render(engine: &mut Engine, frames: usize) -> StereoBus {
    let mut buses = vec![StereoBus::new(frames)];
    engine.render_block(&mut buses, frames);
    buses.remove(0)
}

fn peak(slice: &[f32]) -> f32 {
    slice.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

#[test]
fn sine_region_renders_first_block() {
    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![one_key_region(60)]);

    assert_eq!(engine.note_on(0, 60, 1.0), 1);
    assert_eq!(engine.num_active_voices(), 1);

    let bus = render(&mut engine, 1024);
    // Unity gain through the equal-power center pan: each channel peaks at
    // sin(pi/4)
    let expected = std::f32::consts::FRAC_1_SQRT_2;
    assert!(
        (bus.peak() - expected).abs() < 0.05,
        "peak {} vs {expected}",
        bus.peak()
    );
    // The sample content is the sine itself: the left channel should cross
    // zero about 2 * 440 * (1024/48000) ~ 18 times
    let crossings = bus
        .left
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    assert!((15..=22).contains(&crossings), "crossings {crossings}");
}

#[test]
fn note_off_releases_and_frees_voice() {
    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![one_key_region(60)]);

    engine.note_on(0, 60, 1.0);
    engine.note_off(512, 60, 0.0);
    let bus = render(&mut engine, 1024);

    let early = peak(&bus.left[..512]);
    let late = peak(&bus.left[900..]);
    assert!(early > 0.5, "pre-release peak {early}");
    assert!(late < early * 0.25, "release should decay, late {late}");

    // 10 ms release: gone after a couple more blocks
    render(&mut engine, 1024);
    assert_eq!(engine.num_active_voices(), 0);
}

#[test]
fn release_trigger_applies_rt_decay() {
    // The attack layer is rendered inaudible so only the release layer is
    // measured.
    let mut attack = one_key_region(60);
    attack.volume = -120.0;

    let mut release = one_key_region(60);
    release.id = 1;
    release.trigger = TriggerKind::Release;
    release.rt_decay = 6.0;

    let mut reference_engine = Engine::new(RATE);
    let mut reference_release = release.clone();
    reference_release.rt_decay = 0.0;
    reference_engine.load_regions(vec![attack.clone(), reference_release]);
    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![attack, release]);

    let mut measure = |e: &mut Engine| {
        e.note_on(0, 60, 1.0);
        // Hold the note for about one second
        for _ in 0..47 {
            render(e, 1024);
        }
        e.note_off(0, 60, 0.0);
        render(e, 1024).peak()
    };

    let reference = measure(&mut reference_engine);
    let decayed = measure(&mut engine);

    // One second of hold at 6 dB/s halves the linear gain
    let ratio = decayed / reference;
    assert!((ratio - 0.5).abs() < 0.05, "ratio {ratio}");
}

#[test]
fn group_choke_silences_within_five_ms() {
    let mut held = one_key_region(60);
    held.group = 1;

    let mut choker = one_key_region(40);
    choker.id = 1;
    choker.key_range = NumRange::new(40, 40);
    choker.group = 2;
    choker.off_by = Some(1);

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![held, choker]);

    engine.note_on(0, 60, 1.0);
    render(&mut engine, 512);
    engine.note_on(0, 40, 1.0);
    render(&mut engine, 512);

    // 5 ms is 240 samples at 48 kHz: after 512 the group-1 voice is gone
    let mut group1_alive = false;
    for index in 0..64 {
        if let Some(reply) =
            engine.dispatch(0, &format!("/voice{index}/trigger_number"), "", &[])
        {
            if reply == vec![rosc::OscType::Int(60)] {
                group1_alive = true;
            }
        }
    }
    assert!(!group1_alive, "choked voice still reported live");
}

#[test]
fn cutoff_cc_changes_mid_block() {
    let mut region = one_key_region(60);
    region.set_sample(Arc::new(SampleBuffer::from_mono(
        // White-ish test content so the filter has highs to remove
        (0..48_000)
            .map(|i| if i % 2 == 0 { 0.8 } else { -0.8 })
            .collect(),
        RATE,
    )));
    region.filters.push(strata::filter::FilterDescription {
        cutoff: 200.0,
        ..Default::default()
    });
    region
        .get_or_create_connection(ModSource::controller(74), ModTarget::FilCutoff(0))
        .source_depth = 2400.0;

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![region]);

    engine.note_on(0, 60, 1.0);
    engine.cc(0, 74, 0.5);
    engine.cc(256, 74, 1.0);
    let bus = render(&mut engine, 512);

    // +1200 cents in the first half, +2400 in the second: the wider-open
    // second half passes more of the alternating signal
    let first = peak(&bus.left[64..256]);
    let second = peak(&bus.left[320..]);
    assert!(
        second > first * 1.5,
        "cutoff should open mid-block: first {first} second {second}"
    );
}

#[test]
fn note_polyphony_selfmask_scenario() {
    let mut r1 = one_key_region(60);
    r1.note_polyphony = Some(1);
    let mut r2 = one_key_region(60);
    r2.id = 1;
    r2.note_polyphony = Some(1);

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![r1, r2]);

    engine.note_on(0, 60, 0.5);
    render(&mut engine, 1024);
    engine.note_on(0, 60, 1.0);
    render(&mut engine, 1024);

    assert_eq!(engine.num_active_voices(), 1);
}

#[test]
fn loop_continuous_sustains_past_sample_end() {
    let mut region = one_key_region(60);
    // A short sample that would end in under 100 ms without the loop
    region.set_sample(sine_sample(0.05, 440.0));
    region.loop_desc.mode = LoopMode::Continuous;
    region.loop_desc.start = 480;
    region.loop_desc.end = 1920;

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![region]);

    engine.note_on(0, 60, 1.0);
    for _ in 0..20 {
        render(&mut engine, 1024);
    }
    // 20k samples in, far past the 2400-frame sample: still sounding
    assert_eq!(engine.num_active_voices(), 1);
    let bus = render(&mut engine, 1024);
    assert!(bus.peak() > 0.3);
}

#[test]
fn pitch_keytrack_transposes() {
    let mut region = one_key_region(60);
    region.key_range = NumRange::new(0, 127);

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![region]);

    // An octave above the keycenter doubles the playback rate, so the
    // rendered frequency doubles: count zero crossings to compare.
    engine.note_on(0, 72, 1.0);
    let bus = render(&mut engine, 2048);
    let crossings_high = bus
        .left
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    engine.all_sound_off();
    render(&mut engine, 1024);

    engine.note_on(0, 60, 1.0);
    let bus = render(&mut engine, 2048);
    let crossings_base = bus
        .left
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();

    let ratio = crossings_high as f32 / crossings_base as f32;
    assert!((ratio - 2.0).abs() < 0.2, "ratio {ratio}");
}

#[test]
fn pool_invariant_under_load() {
    let mut region = one_key_region(60);
    region.key_range = NumRange::new(0, 127);
    let mut engine = Engine::with_config(RATE, 8, 1024);
    engine.load_regions(vec![region]);

    for note in 30..90 {
        engine.note_on(0, note, 0.8);
    }
    // A fixed pool of 8 never exceeds its size
    assert!(engine.num_active_voices() <= 8);
    for _ in 0..10 {
        render(&mut engine, 1024);
    }
    assert!(engine.num_active_voices() <= 8);
}

#[test]
fn dispatch_surface_smoke() {
    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![one_key_region(60)]);

    use rosc::OscType;
    assert_eq!(
        engine.dispatch(0, "/num_regions", "", &[]),
        Some(vec![OscType::Int(1)])
    );
    engine.note_on(0, 60, 1.0);
    assert_eq!(
        engine.dispatch(0, "/num_active_voices", "", &[]),
        Some(vec![OscType::Int(1)])
    );

    // Runtime CC write, then read back
    engine.dispatch(0, "/cc11/value", "f", &[OscType::Float(0.3)]);
    assert_eq!(
        engine.dispatch(0, "/cc11/value", "", &[]),
        Some(vec![OscType::Float(0.3)])
    );

    // Range endpoints answer with two-argument tuples
    assert_eq!(
        engine.dispatch(0, "/region0/key_range", "", &[]),
        Some(vec![OscType::Int(60), OscType::Int(60)])
    );
}

#[test]
fn bend_applies_cents() {
    let mut region = one_key_region(60);
    region.bend_up = 1200.0;

    let mut engine = Engine::new(RATE);
    engine.load_regions(vec![region]);

    engine.note_on(0, 60, 1.0);
    engine.pitch_bend(0, 1.0);
    let bus = render(&mut engine, 2048);
    let crossings = bus
        .left
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    // Full-up bend of 1200 cents doubles 440 Hz: ~75 crossings over 2048
    // samples instead of ~37
    assert!(
        (65..=85).contains(&crossings),
        "bend should double the frequency, crossings {crossings}"
    );
}
