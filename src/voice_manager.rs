//! Voice pool: selection, polyphony, stealing and group choke
//!
//! The manager owns a fixed pool of voices. Note-on scans the region table
//! and starts one voice per matching region, enforcing the polyphony rules:
//!
//! 1. A free voice is taken when one exists.
//! 2. When a region `polyphony` or `note_polyphony` limit binds, the oldest
//!    voice in the competing set is stolen (FIFO within the constraint).
//! 3. Otherwise the voice with the lowest current envelope level is stolen,
//!    with age breaking ties.
//!
//! Stolen and fast-choked voices ramp to silence over the fast-release time
//! before their slot frees, so a steal still needs a free slot for the new
//! voice; with none available the note is dropped and counted.

use crate::bus::StereoBus;
use crate::midi_state::MidiState;
use crate::region::{NumRange, Region, SwitchState, TriggerKind};
use crate::voice::{RenderContext, TriggerEvent, TriggerType, Voice, VoiceStart, VoiceState};
use std::sync::Arc;
use tracing::debug;

/// A release-triggered region deferred by the sustain pedal.
#[derive(Clone, Copy, Debug)]
struct PendingRelease {
    note: u8,
    velocity: f32,
    duration: f32,
}

pub struct VoiceManager {
    voices: Vec<Voice>,
    next_voice_index: usize,
    sequence_counters: Vec<u32>,
    switch_state: SwitchState,
    keyswitch_range: Option<NumRange<u8>>,
    last_note_on: Option<u8>,
    pending_releases: Vec<PendingRelease>,
    /// Notes dropped because no voice slot was available.
    dropped_notes: u64,
}

impl VoiceManager {
    pub fn new(max_voices: usize, sample_rate: f32) -> Self {
        Self {
            voices: (0..max_voices).map(|_| Voice::new(sample_rate)).collect(),
            next_voice_index: 0,
            sequence_counters: Vec::new(),
            switch_state: SwitchState::default(),
            keyswitch_range: None,
            last_note_on: None,
            pending_releases: Vec::with_capacity(16),
            dropped_notes: 0,
        }
    }

    /// Reset per-instrument state after a region table swap.
    pub fn prepare(&mut self, num_regions: usize, keyswitch_range: Option<NumRange<u8>>) {
        self.sequence_counters.clear();
        self.sequence_counters.resize(num_regions, 0);
        self.switch_state = SwitchState::default();
        self.keyswitch_range = keyswitch_range;
        self.pending_releases.clear();
    }

    //=======================================
    // Queries

    pub fn num_active_voices(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_free()).count()
    }

    pub fn num_free_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_free()).count()
    }

    pub fn max_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn dropped_notes(&self) -> u64 {
        self.dropped_notes
    }

    pub fn switch_state(&self) -> &SwitchState {
        &self.switch_state
    }

    //=======================================
    // Events

    /// Start voices for a note-on. The MIDI state must already carry the
    /// note-on event. Returns the number of voices started.
    #[allow(clippy::too_many_arguments)]
    pub fn note_on(
        &mut self,
        delay: usize,
        note: u8,
        velocity: f32,
        rand_unipolar: f32,
        rand_bipolar: f32,
        regions: &[Arc<Region>],
        midi: &MidiState,
        bpm: f32,
        engine_clock: u64,
    ) -> usize {
        self.switch_state.previous_note = self.last_note_on;
        self.last_note_on = Some(note);
        if let Some(range) = self.keyswitch_range {
            if range.contains(note) {
                self.switch_state.last = Some(note);
            }
        }

        let mut started = 0;
        for (index, region) in regions.iter().enumerate() {
            // The sequence counter advances once per note-on reaching the
            // region's key range, before the position predicate is tested.
            let counts = matches!(
                region.trigger,
                TriggerKind::Attack | TriggerKind::First | TriggerKind::Legato
            ) && !region.disabled()
                && region.key_range.contains(note);
            if !counts {
                continue;
            }
            self.sequence_counters[index] += 1;
            let sequence_count = self.sequence_counters[index];

            if region.matches_note_on(
                delay,
                note,
                velocity,
                rand_unipolar,
                sequence_count,
                midi,
                bpm,
                &self.switch_state,
            ) {
                let start = VoiceStart {
                    region: region.clone(),
                    region_index: index,
                    trigger: TriggerEvent {
                        trigger_type: TriggerType::NoteOn,
                        number: note,
                        value: velocity,
                    },
                    delay,
                    rand_unipolar,
                    rand_bipolar,
                    note_duration: None,
                };
                if self.start_voice(start, midi, engine_clock) {
                    started += 1;
                }
            }
        }
        started
    }

    /// Release held voices and fire release-triggered regions. The MIDI
    /// state must already carry the note-off event. Returns the number of
    /// release voices started.
    #[allow(clippy::too_many_arguments)]
    pub fn note_off(
        &mut self,
        delay: usize,
        note: u8,
        rand_unipolar: f32,
        rand_bipolar: f32,
        regions: &[Arc<Region>],
        midi: &MidiState,
        bpm: f32,
        engine_clock: u64,
        sustain_down: bool,
    ) -> usize {
        // Release playing voices on this note
        for voice in &mut self.voices {
            if voice.note() == Some(note)
                && voice.trigger().trigger_type == TriggerType::NoteOn
                && !voice.is_free()
            {
                voice.release(delay, sustain_down);
            }
        }

        // Release-triggered regions fire with the recorded note-on velocity
        let velocity = midi.note_velocity(note);
        let duration = midi.note_duration(note, delay);
        let mut started = 0;
        for (index, region) in regions.iter().enumerate() {
            if !region.matches_note_off(
                delay,
                note,
                velocity,
                rand_unipolar,
                midi,
                bpm,
                &self.switch_state,
            ) {
                continue;
            }
            if region.trigger == TriggerKind::Release && sustain_down {
                self.pending_releases.push(PendingRelease {
                    note,
                    velocity,
                    duration,
                });
                continue;
            }
            let start = VoiceStart {
                region: region.clone(),
                region_index: index,
                trigger: TriggerEvent {
                    trigger_type: TriggerType::NoteOff,
                    number: note,
                    value: velocity,
                },
                delay,
                rand_unipolar,
                rand_bipolar,
                note_duration: Some(duration),
            };
            if self.start_voice(start, midi, engine_clock) {
                started += 1;
            }
        }
        started
    }

    /// Controller change: fire controller-triggered regions on threshold
    /// crossings and manage the sustain pedal. `previous` is the CC value
    /// before this event was applied.
    #[allow(clippy::too_many_arguments)]
    pub fn cc(
        &mut self,
        delay: usize,
        cc: usize,
        previous: f32,
        value: f32,
        rand_unipolar: f32,
        rand_bipolar: f32,
        regions: &[Arc<Region>],
        midi: &MidiState,
        engine_clock: u64,
        sustain_cancels_release: bool,
    ) {
        for (index, region) in regions.iter().enumerate() {
            if region.matches_cc_trigger(cc, previous, value) {
                let start = VoiceStart {
                    region: region.clone(),
                    region_index: index,
                    trigger: TriggerEvent {
                        trigger_type: TriggerType::Cc,
                        number: cc.min(127) as u8,
                        value,
                    },
                    delay,
                    rand_unipolar,
                    rand_bipolar,
                    note_duration: None,
                };
                self.start_voice(start, midi, engine_clock);
            }
        }

        if cc == crate::config::SUSTAIN_CC {
            let threshold = crate::config::SUSTAIN_THRESHOLD;
            if previous >= threshold && value < threshold {
                self.sustain_pedal_up(delay, rand_unipolar, rand_bipolar, regions, midi, engine_clock);
            } else if previous < threshold && value >= threshold && sustain_cancels_release {
                for voice in &mut self.voices {
                    voice.cancel_release();
                }
            }
        }
    }

    fn sustain_pedal_up(
        &mut self,
        delay: usize,
        rand_unipolar: f32,
        rand_bipolar: f32,
        regions: &[Arc<Region>],
        midi: &MidiState,
        engine_clock: u64,
    ) {
        for voice in &mut self.voices {
            voice.sustain_released(delay);
        }

        // Fire the release regions the pedal was holding back
        let pending = std::mem::take(&mut self.pending_releases);
        for entry in pending {
            for (index, region) in regions.iter().enumerate() {
                if region.trigger != TriggerKind::Release
                    || region.disabled()
                    || !region.key_range.contains(entry.note)
                    || !region.vel_range.contains(entry.velocity)
                {
                    continue;
                }
                let start = VoiceStart {
                    region: region.clone(),
                    region_index: index,
                    trigger: TriggerEvent {
                        trigger_type: TriggerType::NoteOff,
                        number: entry.note,
                        value: entry.velocity,
                    },
                    delay,
                    rand_unipolar,
                    rand_bipolar,
                    note_duration: Some(entry.duration),
                };
                self.start_voice(start, midi, engine_clock);
            }
        }
    }

    /// Silence everything through the fast-off ramp.
    pub fn all_sound_off(&mut self) {
        for voice in &mut self.voices {
            if !voice.is_free() {
                voice.fast_off();
            }
        }
    }

    //=======================================
    // Allocation

    /// A voice counts against polyphony limits while it is not dying.
    fn counts_for_polyphony(voice: &Voice) -> bool {
        matches!(voice.state(), VoiceState::Playing | VoiceState::Releasing)
    }

    fn start_voice(&mut self, start: VoiceStart, midi: &MidiState, engine_clock: u64) -> bool {
        let region = start.region.clone();

        if region.polyphony == Some(0) {
            return false;
        }

        // Group choke: the new region's off_by names the group to silence.
        if let Some(off_group) = region.off_by {
            for voice in &mut self.voices {
                let chokes = voice
                    .region()
                    .map(|r| r.group == off_group)
                    .unwrap_or(false);
                if chokes && !voice.is_free() {
                    voice.off(start.delay);
                }
            }
        }

        // Per-note polyphony across the pool.
        if let Some(limit) = region.note_polyphony {
            let note = start.trigger.number;
            let competing: Vec<usize> = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| Self::counts_for_polyphony(v) && v.note() == Some(note))
                .map(|(i, _)| i)
                .collect();
            if competing.len() >= limit {
                let new_amplitude = region.velocity_gain(start.trigger.value);
                let victim = if region.note_selfmask {
                    // Only steal a voice that is not louder than the newcomer
                    competing
                        .iter()
                        .copied()
                        .filter(|&i| self.voices[i].current_amplitude() <= new_amplitude)
                        .min_by_key(|&i| self.voices[i].start_clock())
                } else {
                    competing.iter().copied().min_by_key(|&i| self.voices[i].start_clock())
                };
                match victim {
                    Some(idx) => self.voices[idx].fast_off(),
                    None => return false, // every competitor is louder
                }
            }
        }

        // Per-region polyphony.
        if let Some(limit) = region.polyphony {
            let competing: Vec<usize> = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| {
                    Self::counts_for_polyphony(v) && v.region_index() == start.region_index
                })
                .map(|(i, _)| i)
                .collect();
            if competing.len() >= limit {
                if let Some(idx) = competing
                    .iter()
                    .copied()
                    .min_by_key(|&i| self.voices[i].start_clock())
                {
                    self.voices[idx].fast_off();
                }
            }
        }

        let Some(slot) = self.allocate_slot() else {
            self.dropped_notes += 1;
            debug!(note = start.trigger.number, "voice pool exhausted, note dropped");
            return false;
        };
        self.voices[slot].start(start, midi, engine_clock);
        self.next_voice_index = (slot + 1) % self.voices.len();
        true
    }

    /// Find a free slot, or make one by stealing the weakest voice.
    fn allocate_slot(&mut self) -> Option<usize> {
        let len = self.voices.len();
        if len == 0 {
            return None;
        }
        for i in 0..len {
            let idx = (self.next_voice_index + i) % len;
            if self.voices[idx].is_free() {
                return Some(idx);
            }
        }

        // Pool full: steal the voice with the lowest envelope level, oldest
        // first on ties, and ramp it out. The new note is dropped for this
        // block; the slot frees once the ramp completes.
        let victim = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state() != VoiceState::FastOff)
            .min_by(|(_, a), (_, b)| {
                a.current_amplitude()
                    .partial_cmp(&b.current_amplitude())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.start_clock().cmp(&b.start_clock()))
            })
            .map(|(i, _)| i);
        if let Some(idx) = victim {
            self.voices[idx].fast_off();
        }
        None
    }

    //=======================================
    // Render

    pub fn render_active(&mut self, ctx: &RenderContext, buses: &mut [StereoBus], nframes: usize) {
        for voice in &mut self.voices {
            if !voice.is_free() {
                voice.render_block(ctx, buses, nframes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveTable;
    use crate::region::{LoopMode, NumRange, OffMode};
    use crate::sample::SampleBuffer;

    const RATE: f32 = 48_000.0;

    fn basic_region(id: u32) -> Region {
        let mut region = Region::new(id);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.amp_eg.release = 0.01;
        region
    }

    struct Rig {
        manager: VoiceManager,
        regions: Vec<Arc<Region>>,
        midi: MidiState,
        clock: u64,
    }

    impl Rig {
        fn new(regions: Vec<Region>, max_voices: usize) -> Self {
            let regions: Vec<Arc<Region>> = regions.into_iter().map(Arc::new).collect();
            let mut manager = VoiceManager::new(max_voices, RATE);
            manager.prepare(regions.len(), None);
            Self {
                manager,
                regions,
                midi: MidiState::new(RATE, 11),
                clock: 0,
            }
        }

        fn note_on(&mut self, delay: usize, note: u8, velocity: f32) -> usize {
            self.midi.note_on_event(delay, note, velocity);
            self.manager.note_on(
                delay, note, velocity, 0.3, 0.0, &self.regions, &self.midi, 120.0, self.clock,
            )
        }

        fn note_off(&mut self, delay: usize, note: u8) -> usize {
            self.midi.note_off_event(delay, note, 0.0);
            self.manager.note_off(
                delay, note, 0.3, 0.0, &self.regions, &self.midi, 120.0, self.clock, false,
            )
        }

        fn render(&mut self, frames: usize) -> StereoBus {
            let curves = CurveTable::new();
            let ctx = RenderContext {
                midi: &self.midi,
                curves: &curves,
                bpm: 120.0,
                sustain_down: false,
                sample_quality: 2,
            };
            let mut buses = vec![StereoBus::new(frames)];
            self.manager.render_active(&ctx, &mut buses, frames);
            self.midi.advance_time(frames);
            self.clock += frames as u64;
            buses.remove(0)
        }
    }

    #[test]
    fn note_on_starts_matching_voices() {
        let mut rig = Rig::new(vec![basic_region(0)], 8);
        assert_eq!(rig.note_on(0, 60, 1.0), 1);
        assert_eq!(rig.manager.num_active_voices(), 1);
        let bus = rig.render(256);
        assert!(bus.peak() > 0.1);
    }

    #[test]
    fn empty_region_table_is_a_noop() {
        let mut rig = Rig::new(vec![], 8);
        assert_eq!(rig.note_on(0, 60, 1.0), 0);
        assert_eq!(rig.manager.num_active_voices(), 0);
    }

    #[test]
    fn pool_invariant_holds() {
        let mut rig = Rig::new(vec![basic_region(0)], 4);
        for note in 60..70 {
            rig.note_on(0, note, 1.0);
            assert_eq!(
                rig.manager.num_active_voices() + rig.manager.num_free_voices(),
                rig.manager.max_voices()
            );
        }
    }

    #[test]
    fn full_pool_drops_note_and_ramps_victim() {
        let mut rig = Rig::new(vec![basic_region(0)], 2);
        assert_eq!(rig.note_on(0, 60, 1.0), 1);
        assert_eq!(rig.note_on(0, 61, 1.0), 1);
        // Third note finds no free slot: dropped, a victim starts fading
        assert_eq!(rig.note_on(0, 62, 1.0), 0);
        assert_eq!(rig.manager.dropped_notes(), 1);
        // After the fast ramp the slot frees
        rig.render(512);
        assert!(rig.manager.num_free_voices() >= 1);
    }

    #[test]
    fn polyphony_zero_never_starts() {
        let mut region = basic_region(0);
        region.polyphony = Some(0);
        let mut rig = Rig::new(vec![region], 8);
        assert_eq!(rig.note_on(0, 60, 1.0), 0);
    }

    #[test]
    fn region_polyphony_steals_oldest() {
        let mut region = basic_region(0);
        region.polyphony = Some(2);
        let mut rig = Rig::new(vec![region], 8);
        rig.note_on(0, 60, 1.0);
        rig.render(64);
        rig.note_on(0, 61, 1.0);
        rig.render(64);
        rig.note_on(0, 62, 1.0);
        // Oldest voice fast-offs; once its ramp ends only two count
        for _ in 0..10 {
            rig.render(256);
        }
        assert_eq!(rig.manager.num_active_voices(), 2);
    }

    #[test]
    fn note_polyphony_selfmask_prefers_quieter_victim() {
        let mut r1 = basic_region(0);
        r1.note_polyphony = Some(1);
        let mut r2 = basic_region(1);
        r2.note_polyphony = Some(1);
        let mut rig = Rig::new(vec![r1, r2], 8);

        rig.note_on(0, 60, 0.5);
        // Both regions matched, but note_polyphony=1 let the second steal
        // the first (equal amplitude counts as maskable)
        rig.render(1024);
        rig.note_on(0, 60, 1.0);
        rig.render(1024);
        // Ramps have finished; exactly one voice remains
        let live = rig
            .manager
            .voices()
            .iter()
            .filter(|v| VoiceManager::counts_for_polyphony(v))
            .count();
        assert_eq!(live, 1);
    }

    #[test]
    fn selfmask_keeps_louder_voice() {
        let mut region = basic_region(0);
        region.note_polyphony = Some(1);
        let mut rig = Rig::new(vec![region], 8);
        rig.note_on(0, 60, 1.0);
        rig.render(512);
        // A quieter strike must not displace the louder voice
        assert_eq!(rig.note_on(0, 60, 0.2), 0);
    }

    #[test]
    fn group_choke_fast_offs_members() {
        let mut keys = basic_region(0);
        keys.group = 1;
        let mut damper = basic_region(1);
        damper.group = 2;
        damper.off_by = Some(1);
        damper.key_range = NumRange::new(40, 40);
        let mut rig = Rig::new(vec![keys, damper], 8);

        rig.note_on(0, 60, 1.0);
        rig.render(256);
        rig.note_on(0, 40, 1.0);
        // The group-1 voice is in its fast-off ramp; 5 ms at 48 kHz is 240
        // samples, so after 512 it is silent and free
        rig.render(512);
        let group1_alive = rig
            .manager
            .voices()
            .iter()
            .any(|v| v.region().map(|r| r.group == 1).unwrap_or(false));
        assert!(!group1_alive, "choked voice should be gone");
    }

    #[test]
    fn off_mode_normal_uses_release() {
        let mut keys = basic_region(0);
        keys.group = 1;
        keys.off_mode = OffMode::Normal;
        keys.amp_eg.release = 0.2;
        let mut damper = basic_region(1);
        damper.group = 2;
        damper.off_by = Some(1);
        damper.key_range = NumRange::new(40, 40);
        let mut rig = Rig::new(vec![keys, damper], 8);

        rig.note_on(0, 60, 1.0);
        rig.render(256);
        rig.note_on(0, 40, 1.0);
        rig.render(512);
        // A 200 ms release keeps the choked voice alive well past 512
        // samples
        let group1_alive = rig
            .manager
            .voices()
            .iter()
            .any(|v| !v.is_free() && v.region().map(|r| r.group == 1).unwrap_or(false));
        assert!(group1_alive, "normal off mode should release, not cut");
    }

    #[test]
    fn release_trigger_fires_on_note_off() {
        let mut release = basic_region(0);
        release.trigger = TriggerKind::Release;
        let mut rig = Rig::new(vec![basic_region(1), release], 8);

        rig.note_on(0, 60, 0.8);
        rig.render(256);
        let started = rig.note_off(0, 60);
        assert_eq!(started, 1);
        let release_voice = rig
            .manager
            .voices()
            .iter()
            .find(|v| v.trigger().trigger_type == TriggerType::NoteOff)
            .expect("release voice");
        // Fired with the recorded note-on velocity
        assert!((release_voice.trigger().value - 0.8).abs() < 1e-6);
    }

    #[test]
    fn one_shot_survives_note_off() {
        let mut region = basic_region(0);
        region.loop_desc.mode = LoopMode::OneShot;
        let mut rig = Rig::new(vec![region], 8);
        rig.note_on(0, 60, 1.0);
        rig.note_off(64, 60);
        rig.render(512);
        assert_eq!(rig.manager.num_active_voices(), 1);
    }

    #[test]
    fn sequence_regions_alternate() {
        let mut first = basic_region(0);
        first.seq_length = 2;
        first.seq_position = 1;
        let mut second = basic_region(1);
        second.seq_length = 2;
        second.seq_position = 2;
        let mut rig = Rig::new(vec![first, second], 8);

        rig.note_on(0, 60, 1.0);
        let first_region = rig
            .manager
            .voices()
            .iter()
            .find(|v| !v.is_free())
            .map(|v| v.region_index());
        assert_eq!(first_region, Some(0));
        rig.note_off(0, 60);
        for _ in 0..10 {
            rig.render(512);
        }

        rig.note_on(0, 60, 1.0);
        let second_region = rig
            .manager
            .voices()
            .iter()
            .find(|v| !v.is_free())
            .map(|v| v.region_index());
        assert_eq!(second_region, Some(1));
    }

    #[test]
    fn cc_trigger_starts_voice_on_crossing() {
        let mut region = basic_region(0);
        region.trigger = TriggerKind::Controller;
        region.on_cc_range = Some((80, NumRange::new(0.5, 1.0)));
        let regions: Vec<Arc<Region>> = vec![Arc::new(region)];
        let mut manager = VoiceManager::new(8, RATE);
        manager.prepare(1, None);
        let mut midi = MidiState::new(RATE, 11);

        let previous = midi.cc_value(80);
        midi.cc_event(0, 80, 0.8);
        manager.cc(0, 80, previous, 0.8, 0.3, 0.0, &regions, &midi, 0, false);
        assert_eq!(manager.num_active_voices(), 1);
        assert_eq!(
            manager.voices()[0].trigger().trigger_type,
            TriggerType::Cc
        );
    }

    #[test]
    fn sustain_pedal_defers_release_regions() {
        let mut release = basic_region(0);
        release.trigger = TriggerKind::Release;
        let regions: Vec<Arc<Region>> = vec![Arc::new(release), Arc::new(basic_region(1))];
        let mut manager = VoiceManager::new(8, RATE);
        manager.prepare(2, None);
        let mut midi = MidiState::new(RATE, 11);

        // Pedal down, then note on and off: the release region must wait
        midi.cc_event(0, 64, 1.0);
        midi.note_on_event(0, 60, 0.9);
        manager.note_on(0, 60, 0.9, 0.3, 0.0, &regions, &midi, 120.0, 0);
        midi.note_off_event(100, 60, 0.0);
        let started = manager.note_off(100, 60, 0.3, 0.0, &regions, &midi, 120.0, 0, true);
        assert_eq!(started, 0);

        // Pedal up fires it
        let previous = midi.cc_value(64);
        midi.cc_event(200, 64, 0.0);
        manager.cc(200, 64, previous, 0.0, 0.3, 0.0, &regions, &midi, 0, false);
        let has_release_voice = manager
            .voices()
            .iter()
            .any(|v| v.trigger().trigger_type == TriggerType::NoteOff);
        assert!(has_release_voice);
    }
}
