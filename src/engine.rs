//! The engine: region table, event entry points and block rendering
//!
//! The engine owns the region table behind an [`ArcSwap`]: loads build a new
//! table and swap it atomically, and voices keep the regions they play alive
//! through their own `Arc` clones, so a reload never interrupts a sounding
//! note. Control threads post events through a single-producer queue drained
//! at the top of each render block; everything else on the render path is
//! allocation- and lock-free.

use crate::bus::StereoBus;
use crate::config::{
    self, extended_ccs, DEFAULT_MAX_VOICES, DEFAULT_SAMPLES_PER_BLOCK, DEFAULT_SAMPLE_QUALITY,
    FREEWHEELING_SAMPLE_QUALITY, NUM_CCS, SUSTAIN_CC, SUSTAIN_THRESHOLD,
};
use crate::curve::CurveTable;
use crate::midi_state::MidiState;
use crate::region::{NumRange, Region};
use crate::voice::RenderContext;
use crate::voice_manager::VoiceManager;
use arc_swap::ArcSwap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use tracing::{debug, info};

/// Bit array sized for the key and controller slot inventories.
pub type KeySlots = [u8; 16];
pub type CcSlots = [u8; NUM_CCS / 8];

fn set_bit(bits: &mut [u8], index: usize) {
    if index / 8 < bits.len() {
        bits[index / 8] |= 1 << (index % 8);
    }
}

/// The immutable, swappable view of a loaded instrument.
pub struct RegionTable {
    pub regions: Vec<Arc<Region>>,
    pub keyswitch_range: Option<NumRange<u8>>,
    pub num_groups: usize,
    pub key_slots: KeySlots,
    pub cc_slots: CcSlots,
}

impl RegionTable {
    pub fn empty() -> Self {
        Self {
            regions: Vec::new(),
            keyswitch_range: None,
            num_groups: 0,
            key_slots: [0; 16],
            cc_slots: [0; NUM_CCS / 8],
        }
    }

    pub fn build(regions: Vec<Region>) -> Self {
        let mut keyswitch_lo = None;
        let mut keyswitch_hi = None;
        let mut groups = Vec::new();
        let mut key_slots = [0u8; 16];
        let mut cc_slots = [0u8; NUM_CCS / 8];

        for region in &regions {
            for sw in [region.sw_last, region.sw_down, region.sw_up, region.sw_previous]
                .into_iter()
                .flatten()
            {
                keyswitch_lo = Some(keyswitch_lo.map_or(sw, |lo: u8| lo.min(sw)));
                keyswitch_hi = Some(keyswitch_hi.map_or(sw, |hi: u8| hi.max(sw)));
            }
            if region.group != 0 && !groups.contains(&region.group) {
                groups.push(region.group);
            }
            if !region.disabled() {
                for key in region.key_range.lo..=region.key_range.hi {
                    set_bit(&mut key_slots, key as usize);
                }
            }
            region.used_ccs(&mut |cc| set_bit(&mut cc_slots, cc));
        }

        let keyswitch_range = match (keyswitch_lo, keyswitch_hi) {
            (Some(lo), Some(hi)) => Some(NumRange::new(lo, hi)),
            _ => None,
        };

        Self {
            regions: regions.into_iter().map(Arc::new).collect(),
            keyswitch_range,
            num_groups: groups.len(),
            key_slots,
            cc_slots,
        }
    }
}

/// A timestamped control event posted from a non-realtime thread.
#[derive(Clone, Copy, Debug)]
pub enum ControlEvent {
    NoteOn { delay: usize, note: u8, velocity: f32 },
    NoteOff { delay: usize, note: u8, velocity: f32 },
    Cc { delay: usize, cc: usize, value: f32 },
    PitchBend { delay: usize, value: f32 },
    ChannelAftertouch { delay: usize, value: f32 },
    PolyAftertouch { delay: usize, note: u8, value: f32 },
}

/// The producer half of the control queue. It is not clonable: the queue
/// is single-producer, single-consumer.
pub struct EngineController {
    producer: HeapProd<ControlEvent>,
}

impl EngineController {
    /// Post an event; returns false when the queue is full.
    pub fn send(&mut self, event: ControlEvent) -> bool {
        self.producer.try_push(event).is_ok()
    }
}

pub struct Engine {
    regions: ArcSwap<RegionTable>,
    pub(crate) midi: MidiState,
    pub(crate) curves: CurveTable,
    pub(crate) vm: VoiceManager,
    rng: SmallRng,
    sample_rate: f32,
    max_block_size: usize,
    bpm: f32,
    clock: u64,

    control_rx: HeapCons<ControlEvent>,
    controller_taken: Option<EngineController>,

    // Global options, all reachable over dispatch
    pub(crate) sample_quality: u8,
    pub(crate) oscillator_quality: u8,
    pub(crate) freewheeling_sample_quality: u8,
    pub(crate) freewheeling_oscillator_quality: u8,
    pub(crate) freewheeling: bool,
    pub(crate) sustain_cancels_release: bool,
    pub(crate) cc_defaults: Vec<f32>,

    cc_changed: CcSlots,
    cc_changed_previous: CcSlots,
}

impl Engine {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_config(sample_rate, DEFAULT_MAX_VOICES, DEFAULT_SAMPLES_PER_BLOCK)
    }

    pub fn with_config(sample_rate: f32, max_voices: usize, max_block_size: usize) -> Self {
        let ring = HeapRb::<ControlEvent>::new(config::CONTROL_QUEUE_CAPACITY);
        let (producer, consumer) = ring.split();
        info!(sample_rate, max_voices, max_block_size, "engine created");
        Self {
            regions: ArcSwap::from_pointee(RegionTable::empty()),
            midi: MidiState::new(sample_rate, 0x5f3759df),
            curves: CurveTable::new(),
            vm: VoiceManager::new(max_voices, sample_rate),
            rng: SmallRng::seed_from_u64(0x9e3779b97f4a7c15),
            sample_rate,
            max_block_size,
            bpm: 120.0,
            clock: 0,
            control_rx: consumer,
            controller_taken: Some(EngineController { producer }),
            sample_quality: DEFAULT_SAMPLE_QUALITY,
            oscillator_quality: 1,
            freewheeling_sample_quality: FREEWHEELING_SAMPLE_QUALITY,
            freewheeling_oscillator_quality: 2,
            freewheeling: false,
            sustain_cancels_release: false,
            cc_defaults: vec![0.0; NUM_CCS],
            cc_changed: [0; NUM_CCS / 8],
            cc_changed_previous: [0; NUM_CCS / 8],
        }
    }

    /// Hand out the control-queue producer. Returns `None` after the first
    /// call; there is exactly one producer.
    pub fn take_controller(&mut self) -> Option<EngineController> {
        self.controller_taken.take()
    }

    //=======================================
    // Loading

    /// Swap in a freshly built region table. Voices started from the old
    /// table keep their region `Arc`s and play out undisturbed.
    pub fn load_regions(&mut self, regions: Vec<Region>) {
        let table = RegionTable::build(regions);
        info!(
            num_regions = table.regions.len(),
            num_groups = table.num_groups,
            "region table loaded"
        );
        self.vm.prepare(table.regions.len(), table.keyswitch_range);
        self.regions.store(Arc::new(table));
    }

    pub fn region_table(&self) -> Arc<RegionTable> {
        self.regions.load_full()
    }

    /// Copy-on-write mutation of one region: clones the table spine and the
    /// touched region, applies `f`, swaps. Voices keep the old copy.
    pub(crate) fn with_region_mut(&self, index: usize, f: impl FnOnce(&mut Region)) -> bool {
        let current = self.regions.load_full();
        if index >= current.regions.len() {
            return false;
        }
        let mut regions = current.regions.clone();
        f(Arc::make_mut(&mut regions[index]));
        self.regions.store(Arc::new(RegionTable {
            regions,
            keyswitch_range: current.keyswitch_range,
            num_groups: current.num_groups,
            key_slots: current.key_slots,
            cc_slots: current.cc_slots,
        }));
        true
    }

    //=======================================
    // Accessors

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.bpm = bpm.clamp(1.0, 1000.0);
    }

    pub fn num_regions(&self) -> usize {
        self.regions.load().regions.len()
    }

    pub fn num_groups(&self) -> usize {
        self.regions.load().num_groups
    }

    /// Count of regions with resident sample data.
    pub fn num_samples(&self) -> usize {
        self.regions
            .load()
            .regions
            .iter()
            .filter(|r| r.sample.is_some())
            .count()
    }

    pub fn num_active_voices(&self) -> usize {
        self.vm.num_active_voices()
    }

    pub fn num_curves(&self) -> usize {
        self.curves.num_curves()
    }

    pub fn curves_mut(&mut self) -> &mut CurveTable {
        &mut self.curves
    }

    pub fn midi_state(&self) -> &MidiState {
        &self.midi
    }

    pub fn dropped_notes(&self) -> u64 {
        self.vm.dropped_notes()
    }

    pub fn set_freewheeling(&mut self, on: bool) {
        self.freewheeling = on;
        debug!(freewheeling = on, "freewheeling changed");
    }

    pub fn sustain_down(&self) -> bool {
        self.midi.cc_value(SUSTAIN_CC) >= SUSTAIN_THRESHOLD
    }

    //=======================================
    // Events (audio thread)

    pub fn note_on(&mut self, delay: usize, note: u8, velocity: f32) -> usize {
        if note > 127 {
            return 0;
        }
        let velocity = velocity.clamp(0.0, 1.0);
        self.midi.note_on_event(delay, note, velocity);
        let rand_unipolar: f32 = self.rng.gen_range(0.0..1.0);
        let rand_bipolar: f32 = self.rng.gen_range(-1.0..1.0);
        let table = self.regions.load_full();
        self.vm.note_on(
            delay,
            note,
            velocity,
            rand_unipolar,
            rand_bipolar,
            &table.regions,
            &self.midi,
            self.bpm,
            self.clock,
        )
    }

    pub fn note_off(&mut self, delay: usize, note: u8, velocity: f32) -> usize {
        if note > 127 {
            return 0;
        }
        self.midi.note_off_event(delay, note, velocity.clamp(0.0, 1.0));
        let rand_unipolar: f32 = self.rng.gen_range(0.0..1.0);
        let rand_bipolar: f32 = self.rng.gen_range(-1.0..1.0);
        let table = self.regions.load_full();
        let sustain = self.sustain_down();
        self.vm.note_off(
            delay,
            note,
            rand_unipolar,
            rand_bipolar,
            &table.regions,
            &self.midi,
            self.bpm,
            self.clock,
            sustain,
        )
    }

    pub fn cc(&mut self, delay: usize, cc: usize, value: f32) {
        if cc >= NUM_CCS {
            return;
        }
        let previous = self.midi.cc_value(cc);
        let value = value.clamp(0.0, 1.0);
        self.midi.cc_event(delay, cc, value);
        set_bit(&mut self.cc_changed, cc);
        let rand_unipolar: f32 = self.rng.gen_range(0.0..1.0);
        let rand_bipolar: f32 = self.rng.gen_range(-1.0..1.0);
        let table = self.regions.load_full();
        let cancel = self.sustain_cancels_release;
        self.vm.cc(
            delay,
            cc,
            previous,
            value,
            rand_unipolar,
            rand_bipolar,
            &table.regions,
            &self.midi,
            self.clock,
            cancel,
        );
    }

    pub fn pitch_bend(&mut self, delay: usize, value: f32) {
        self.midi.pitch_bend_event(delay, value.clamp(-1.0, 1.0));
        set_bit(&mut self.cc_changed, extended_ccs::PITCH_BEND);
    }

    pub fn channel_aftertouch(&mut self, delay: usize, value: f32) {
        self.midi
            .channel_aftertouch_event(delay, value.clamp(-1.0, 1.0));
        set_bit(&mut self.cc_changed, extended_ccs::CHANNEL_AFTERTOUCH);
    }

    pub fn poly_aftertouch(&mut self, delay: usize, note: u8, value: f32) {
        self.midi
            .poly_aftertouch_event(delay, note, value.clamp(0.0, 1.0));
    }

    pub fn all_notes_off(&mut self, delay: usize) {
        for note in 0..128u8 {
            if self.midi.is_note_pressed(note) {
                self.note_off(delay, note, 0.0);
            }
        }
    }

    pub fn all_sound_off(&mut self) {
        self.vm.all_sound_off();
    }

    //=======================================
    // Render

    fn drain_control_queue(&mut self) {
        while let Some(event) = self.control_rx.try_pop() {
            match event {
                ControlEvent::NoteOn { delay, note, velocity } => {
                    self.note_on(delay, note, velocity);
                }
                ControlEvent::NoteOff { delay, note, velocity } => {
                    self.note_off(delay, note, velocity);
                }
                ControlEvent::Cc { delay, cc, value } => self.cc(delay, cc, value),
                ControlEvent::PitchBend { delay, value } => self.pitch_bend(delay, value),
                ControlEvent::ChannelAftertouch { delay, value } => {
                    self.channel_aftertouch(delay, value)
                }
                ControlEvent::PolyAftertouch { delay, note, value } => {
                    self.poly_aftertouch(delay, note, value)
                }
            }
        }
    }

    /// Render one block into the provided buses (`0` = main) and advance
    /// the MIDI clock. `nframes` must not exceed the configured block size.
    pub fn render_block(&mut self, buses: &mut [StereoBus], nframes: usize) {
        let nframes = nframes.min(self.max_block_size);
        self.drain_control_queue();

        for bus in buses.iter_mut() {
            bus.clear();
        }

        let quality = if self.freewheeling {
            self.freewheeling_sample_quality
        } else {
            self.sample_quality
        };
        let ctx = RenderContext {
            midi: &self.midi,
            curves: &self.curves,
            bpm: self.bpm,
            sustain_down: self.midi.cc_value(SUSTAIN_CC) >= SUSTAIN_THRESHOLD,
            sample_quality: quality,
        };
        self.vm.render_active(&ctx, buses, nframes);

        self.midi.advance_time(nframes);
        self.clock += nframes as u64;
        self.cc_changed_previous = self.cc_changed;
        self.cc_changed = [0; NUM_CCS / 8];
    }

    //=======================================
    // Inventories for dispatch

    pub fn key_slots(&self) -> KeySlots {
        self.regions.load().key_slots
    }

    pub fn cc_slots(&self) -> CcSlots {
        self.regions.load().cc_slots
    }

    pub fn cc_changed(&self) -> CcSlots {
        self.cc_changed
    }

    pub fn cc_changed_previous(&self) -> CcSlots {
        self.cc_changed_previous
    }
}
