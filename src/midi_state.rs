//! MIDI state tracking with sample-accurate event vectors
//!
//! Holds the known state of every controller as a sorted event vector per
//! block (see [`crate::events`]), the per-note state (velocities, note
//! clocks, per-note controllers and pitch bend), and the extended virtual
//! controllers stamped from note events.
//!
//! The state is owned by the engine and written only from the render thread.
//! `advance_time` must be called once per block; it advances the internal
//! sample clock and collapses every event vector to its final value.

use crate::config::{extended_ccs, NUM_CCS};
use crate::events::{self, Event, EventVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Per-note controller state: an optional overridden base pitch, a relative
/// per-note pitch bend, and per-note CC streams. Per-note streams merge
/// additively with the channel streams; the merge is the caller's contract
/// via [`events::additive_merge`].
struct PerNoteState {
    base_pitch_overridden: bool,
    base_pitch_events: EventVector,
    bend_active: bool,
    pitch_bend_events: EventVector,
    active_ccs: Vec<usize>,
    cc_events: Vec<EventVector>,
}

impl PerNoteState {
    fn new(note: usize) -> Self {
        Self {
            base_pitch_overridden: false,
            base_pitch_events: vec![Event::new(0, note as f32)],
            bend_active: false,
            pitch_bend_events: vec![Event::new(0, 0.0)],
            active_ccs: Vec::with_capacity(16),
            cc_events: (0..NUM_CCS).map(|_| vec![Event::new(0, 0.0)]).collect(),
        }
    }
}

/// Flags for [`MidiState::manage_per_note_state`].
pub const PER_NOTE_DETACH: u32 = 0x1;
pub const PER_NOTE_RESET: u32 = 0x2;

pub struct MidiState {
    active_notes: usize,
    note_on_times: [u64; 128],
    note_off_times: [u64; 128],
    note_states: [bool; 128],
    last_note_velocities: [f32; 128],
    velocity_override: f32,
    last_note_played: Option<u8>,

    cc_events: Vec<EventVector>,
    pitch_events: EventVector,
    channel_aftertouch_events: EventVector,
    poly_aftertouch_events: Vec<EventVector>,
    per_note: Vec<PerNoteState>,
    null_events: EventVector,

    sample_rate: f32,
    alternate: f32,
    internal_clock: u64,
    rng: SmallRng,
}

impl MidiState {
    pub fn new(sample_rate: f32, rng_seed: u64) -> Self {
        Self {
            active_notes: 0,
            note_on_times: [0; 128],
            note_off_times: [0; 128],
            note_states: [false; 128],
            last_note_velocities: [0.0; 128],
            velocity_override: 0.0,
            last_note_played: None,
            cc_events: (0..NUM_CCS).map(|_| vec![Event::new(0, 0.0)]).collect(),
            pitch_events: vec![Event::new(0, 0.0)],
            channel_aftertouch_events: vec![Event::new(0, 0.0)],
            poly_aftertouch_events: (0..128).map(|_| vec![Event::new(0, 0.0)]).collect(),
            per_note: (0..128).map(PerNoteState::new).collect(),
            null_events: vec![Event::new(0, 0.0)],
            sample_rate,
            alternate: 0.0,
            internal_clock: 0,
            rng: SmallRng::seed_from_u64(rng_seed),
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.internal_clock = 0;
        self.note_on_times = [0; 128];
        self.note_off_times = [0; 128];
    }

    //=======================================
    // Note events

    pub fn note_on_event(&mut self, delay: usize, note: u8, velocity: f32) {
        debug_assert!(note < 128);
        debug_assert!((0.0..=1.0).contains(&velocity));
        let note_idx = note as usize;
        if note_idx >= 128 {
            return;
        }

        let mut keydelta = 0.0;
        if let Some(last) = self.last_note_played {
            keydelta = note as f32 - last as f32;
            self.velocity_override = self.last_note_velocities[last as usize];
        }

        self.last_note_velocities[note_idx] = velocity;
        self.note_on_times[note_idx] = self.internal_clock + delay as u64;
        self.last_note_played = Some(note);
        self.note_base_pitch_event(delay, note, note as f32);
        self.per_note[note_idx].base_pitch_overridden = false;
        self.note_states[note_idx] = true;

        let unipolar: f32 = self.rng.gen_range(0.0..1.0);
        let bipolar: f32 = self.rng.gen_range(-1.0..1.0);
        self.cc_event(delay, extended_ccs::NOTE_ON_VELOCITY, velocity);
        self.cc_event(delay, extended_ccs::KEYBOARD_NOTE_NUMBER, note as f32 / 127.0);
        self.cc_event(delay, extended_ccs::UNIPOLAR_RANDOM, unipolar);
        self.cc_event(delay, extended_ccs::BIPOLAR_RANDOM, bipolar);
        let gate = if self.active_notes > 0 { 1.0 } else { 0.0 };
        self.cc_event(delay, extended_ccs::KEYBOARD_NOTE_GATE, gate);
        self.cc_event(delay, extended_ccs::KEYDELTA, keydelta);
        self.cc_event(delay, extended_ccs::ABSOLUTE_KEYDELTA, keydelta.abs());
        self.active_notes += 1;

        let alternate = self.alternate;
        self.cc_event(delay, extended_ccs::ALTERNATE, alternate);
        self.alternate = if alternate == 0.0 { 1.0 } else { 0.0 };
    }

    /// Note-on that also pins the note's base pitch, allowing the note
    /// number to act as an identifier while the sounding pitch differs.
    pub fn note_on_with_pitch_event(&mut self, delay: usize, note: u8, velocity: f32, base_pitch: f32) {
        if (note as usize) < 128 {
            self.note_on_event(delay, note, velocity);
            self.note_base_pitch_event(delay, note, base_pitch);
            self.per_note[note as usize].base_pitch_overridden = true;
        }
    }

    pub fn note_off_event(&mut self, delay: usize, note: u8, velocity: f32) {
        debug_assert!(note < 128);
        let note_idx = note as usize;
        if note_idx >= 128 {
            return;
        }

        self.note_off_times[note_idx] = self.internal_clock + delay as u64;
        let unipolar: f32 = self.rng.gen_range(0.0..1.0);
        let bipolar: f32 = self.rng.gen_range(-1.0..1.0);
        self.cc_event(delay, extended_ccs::NOTE_OFF_VELOCITY, velocity);
        self.cc_event(delay, extended_ccs::KEYBOARD_NOTE_NUMBER, note as f32 / 127.0);
        self.cc_event(delay, extended_ccs::UNIPOLAR_RANDOM, unipolar);
        self.cc_event(delay, extended_ccs::BIPOLAR_RANDOM, bipolar);
        self.active_notes = self.active_notes.saturating_sub(1);
        self.note_states[note_idx] = false;
    }

    pub fn all_notes_off(&mut self, delay: usize) {
        for note in 0..128u8 {
            if self.note_states[note as usize] {
                self.note_off_event(delay, note, 0.0);
            }
        }
    }

    pub fn active_notes(&self) -> usize {
        self.active_notes
    }

    pub fn is_note_pressed(&self, note: u8) -> bool {
        (note as usize) < 128 && self.note_states[note as usize]
    }

    pub fn note_velocity(&self, note: u8) -> f32 {
        self.last_note_velocities[(note as usize).min(127)]
    }

    /// Velocity of the note played before the current one.
    pub fn velocity_override(&self) -> f32 {
        self.velocity_override
    }

    pub fn last_note_played(&self) -> Option<u8> {
        self.last_note_played
    }

    /// Seconds elapsed since the note-on of `note`, measured at `delay`
    /// samples into the current block.
    pub fn note_duration(&self, note: u8, delay: usize) -> f32 {
        let note_idx = note as usize;
        if note_idx >= 128 {
            return 0.0;
        }
        let now = self.internal_clock + delay as u64;
        let elapsed = now.saturating_sub(self.note_on_times[note_idx]);
        elapsed as f32 / self.sample_rate
    }

    //=======================================
    // Controller events

    pub fn cc_event(&mut self, delay: usize, cc: usize, value: f32) {
        if cc < NUM_CCS {
            events::insert_event(&mut self.cc_events[cc], delay, value);
        }
    }

    pub fn cc_value(&self, cc: usize) -> f32 {
        if cc < NUM_CCS {
            events::last_value(&self.cc_events[cc])
        } else {
            0.0
        }
    }

    pub fn cc_value_at(&self, cc: usize, delay: usize) -> f32 {
        if cc < NUM_CCS {
            events::value_at(&self.cc_events[cc], delay)
        } else {
            0.0
        }
    }

    pub fn cc_events(&self, cc: usize) -> &EventVector {
        if cc < NUM_CCS {
            &self.cc_events[cc]
        } else {
            &self.null_events
        }
    }

    pub fn pitch_bend_event(&mut self, delay: usize, value: f32) {
        debug_assert!((-1.0..=1.0).contains(&value));
        events::insert_event(&mut self.pitch_events, delay, value);
        self.cc_event(delay, extended_ccs::PITCH_BEND, value);
    }

    pub fn pitch_bend(&self) -> f32 {
        events::last_value(&self.pitch_events)
    }

    pub fn pitch_bend_events(&self) -> &EventVector {
        &self.pitch_events
    }

    pub fn channel_aftertouch_event(&mut self, delay: usize, value: f32) {
        events::insert_event(&mut self.channel_aftertouch_events, delay, value);
        self.cc_event(delay, extended_ccs::CHANNEL_AFTERTOUCH, value);
    }

    pub fn channel_aftertouch(&self) -> f32 {
        events::last_value(&self.channel_aftertouch_events)
    }

    pub fn channel_aftertouch_events(&self) -> &EventVector {
        &self.channel_aftertouch_events
    }

    pub fn poly_aftertouch_event(&mut self, delay: usize, note: u8, value: f32) {
        if (note as usize) < 128 {
            events::insert_event(&mut self.poly_aftertouch_events[note as usize], delay, value);
        }
    }

    pub fn poly_aftertouch(&self, note: u8) -> f32 {
        if (note as usize) < 128 {
            events::last_value(&self.poly_aftertouch_events[note as usize])
        } else {
            0.0
        }
    }

    pub fn poly_aftertouch_events(&self, note: u8) -> &EventVector {
        if (note as usize) < 128 {
            &self.poly_aftertouch_events[note as usize]
        } else {
            &self.null_events
        }
    }

    //=======================================
    // Per-note state

    /// Pin or move a note's base pitch independently from its number.
    pub fn note_base_pitch_event(&mut self, delay: usize, note: u8, pitch: f32) {
        if (note as usize) < 128 {
            let state = &mut self.per_note[note as usize];
            events::insert_event(&mut state.base_pitch_events, delay, pitch);
            state.base_pitch_overridden = true;
        }
    }

    /// The sounding base pitch for `note`: the overridden pitch when one was
    /// set, the note number otherwise.
    pub fn note_base_pitch(&self, note: u8) -> f32 {
        let note_idx = note as usize;
        if note_idx >= 128 {
            return 0.0;
        }
        let state = &self.per_note[note_idx];
        if state.base_pitch_overridden {
            events::last_value(&state.base_pitch_events)
        } else {
            note as f32
        }
    }

    pub fn is_note_base_pitch_overridden(&self, note: u8) -> bool {
        (note as usize) < 128 && self.per_note[note as usize].base_pitch_overridden
    }

    pub fn per_note_cc_event(&mut self, delay: usize, note: u8, cc: usize, value: f32) {
        if (note as usize) >= 128 || cc >= NUM_CCS {
            return;
        }
        let state = &mut self.per_note[note as usize];
        events::insert_event(&mut state.cc_events[cc], delay, value);
        if !state.active_ccs.contains(&cc) {
            state.active_ccs.push(cc);
        }
    }

    pub fn is_per_note_cc_active(&self, note: u8, cc: usize) -> bool {
        (note as usize) < 128 && self.per_note[note as usize].active_ccs.contains(&cc)
    }

    /// The per-note component of a CC stream; zero when the note has no
    /// per-note events for this CC.
    pub fn per_note_cc_value(&self, note: u8, cc: usize) -> f32 {
        if self.is_per_note_cc_active(note, cc) {
            events::last_value(&self.per_note[note as usize].cc_events[cc])
        } else {
            0.0
        }
    }

    pub fn per_note_cc_value_at(&self, note: u8, cc: usize, delay: usize) -> f32 {
        if self.is_per_note_cc_active(note, cc) {
            events::value_at(&self.per_note[note as usize].cc_events[cc], delay)
        } else {
            0.0
        }
    }

    pub fn per_note_cc_events(&self, note: u8, cc: usize) -> &EventVector {
        if self.is_per_note_cc_active(note, cc) {
            &self.per_note[note as usize].cc_events[cc]
        } else {
            &self.null_events
        }
    }

    pub fn per_note_pitch_bend_event(&mut self, delay: usize, note: u8, value: f32) {
        debug_assert!((-1.0..=1.0).contains(&value));
        if (note as usize) < 128 {
            let state = &mut self.per_note[note as usize];
            state.bend_active = true;
            events::insert_event(&mut state.pitch_bend_events, delay, value);
        }
    }

    /// The per-note component of pitch bend; zero while inactive. Merges
    /// additively with the channel bend on the caller's side.
    pub fn per_note_pitch_bend(&self, note: u8) -> f32 {
        let note_idx = note as usize;
        if note_idx < 128 && self.per_note[note_idx].bend_active {
            events::last_value(&self.per_note[note_idx].pitch_bend_events)
        } else {
            0.0
        }
    }

    pub fn per_note_pitch_bend_events(&self, note: u8) -> &EventVector {
        let note_idx = note as usize;
        if note_idx < 128 && self.per_note[note_idx].bend_active {
            &self.per_note[note_idx].pitch_bend_events
        } else {
            &self.null_events
        }
    }

    pub fn manage_per_note_state(&mut self, note: u8, flags: u32) {
        if (note as usize) >= 128 {
            return;
        }
        if flags & PER_NOTE_RESET != 0 {
            self.per_note[note as usize].active_ccs.clear();
        }
        // Detach is accepted but has no observable effect yet.
        let _ = flags & PER_NOTE_DETACH;
    }

    //=======================================
    // Clock

    pub fn internal_clock(&self) -> u64 {
        self.internal_clock
    }

    /// Advance the sample clock and flush all event vectors down to their
    /// final values. Call once per render block.
    pub fn advance_time(&mut self, num_samples: usize) {
        self.internal_clock += num_samples as u64;
        self.flush_events();
    }

    pub fn flush_events(&mut self) {
        for ev in &mut self.cc_events {
            events::flush(ev);
        }
        for ev in &mut self.poly_aftertouch_events {
            events::flush(ev);
        }
        events::flush(&mut self.pitch_events);
        events::flush(&mut self.channel_aftertouch_events);

        for state in &mut self.per_note {
            for &cc in &state.active_ccs {
                events::flush(&mut state.cc_events[cc]);
            }
            events::flush(&mut state.base_pitch_events);
            events::flush(&mut state.pitch_bend_events);
            if events::last_value(&state.pitch_bend_events) == 0.0 {
                state.bend_active = false;
            }
        }
    }

    /// Reset note bookkeeping (clocks, held notes, alternate flip-flop).
    pub fn reset_note_states(&mut self) {
        self.last_note_velocities = [0.0; 128];
        self.velocity_override = 0.0;
        self.active_notes = 0;
        self.internal_clock = 0;
        self.last_note_played = None;
        self.alternate = 0.0;
        self.note_states = [false; 128];
        self.note_on_times = [0; 128];
        self.note_off_times = [0; 128];

        for slot in [
            extended_ccs::NOTE_ON_VELOCITY,
            extended_ccs::KEYBOARD_NOTE_NUMBER,
            extended_ccs::UNIPOLAR_RANDOM,
            extended_ccs::BIPOLAR_RANDOM,
            extended_ccs::KEYBOARD_NOTE_GATE,
            extended_ccs::ALTERNATE,
        ] {
            self.cc_events[slot].clear();
            self.cc_events[slot].push(Event::new(0, 0.0));
        }

        for (i, state) in self.per_note.iter_mut().enumerate() {
            state.base_pitch_overridden = false;
            state.base_pitch_events.clear();
            state.base_pitch_events.push(Event::new(0, i as f32));
        }
    }

    /// Reset all controller streams to zero base values.
    pub fn reset_event_states(&mut self) {
        let reset = |ev: &mut EventVector| {
            ev.clear();
            ev.push(Event::new(0, 0.0));
        };
        for ev in &mut self.cc_events {
            reset(ev);
        }
        for ev in &mut self.poly_aftertouch_events {
            reset(ev);
        }
        reset(&mut self.pitch_events);
        reset(&mut self.channel_aftertouch_events);
        for state in &mut self.per_note {
            for ev in &mut state.cc_events {
                reset(ev);
            }
            reset(&mut state.pitch_bend_events);
            state.bend_active = false;
            state.active_ccs.clear();
        }
    }
}
