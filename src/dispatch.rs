//! Control dispatch: a path/typetag message bus
//!
//! Messages address engine state by path (`/region12/volume`) plus a
//! signature string over the argument types `{i, h, f, s, b, T, F, N}`.
//! Query messages have an empty signature and return typed values; set
//! messages carry arguments and return an empty acknowledgement. Digit runs
//! in a path are pattern indices: `/region12/delay` matches the pattern
//! `/region&/delay` with index 12.
//!
//! The path table is compiled once: every `(pattern, signature)` pair gets
//! an FNV-1a hash computed with digit runs collapsed to `&`, so resolving a
//! message is a hash lookup plus one pattern verification. Out-of-range
//! indices answer with the null type tag.

use crate::engine::Engine;
use crate::modulation::{ModSource, ModTarget};
use crate::region::{NumRange, OffMode};
use rosc::OscType;
use std::collections::HashMap;
use std::sync::OnceLock;

const MAX_INDICES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionField {
    Enabled,
    Delay,
    Offset,
    End,
    Trigger,
    LoopMode,
    LoopRange,
    LoopCrossfade,
    Group,
    OffBy,
    OffModeField,
    OffTime,
    Polyphony,
    NotePolyphony,
    NoteSelfmask,
    KeyRange,
    VelRange,
    BendRange,
    CcRange,
    PitchKeycenter,
    Transpose,
    Tune,
    BendUp,
    BendDown,
    Volume,
    Amplitude,
    Pan,
    Width,
    Position,
    RtDecay,
    SeqLength,
    SeqPosition,
    AmpegAttack,
    AmpegDecay,
    AmpegSustain,
    AmpegRelease,
    AmpegDelay,
    AmpegHold,
    AmpegStart,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FilterField {
    Cutoff,
    Resonance,
    Gain,
    Kind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EqField {
    Frequency,
    Bandwidth,
    Gain,
}

/// Targets addressable through the `/region&/<target>_cc&` depth
/// endpoints. Pitch and width carry write paths like the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DepthTarget {
    Volume,
    Amplitude,
    Pan,
    Width,
    Position,
    Pitch,
    Cutoff,
}

impl DepthTarget {
    fn mod_target(&self) -> ModTarget {
        match self {
            DepthTarget::Volume => ModTarget::Volume,
            DepthTarget::Amplitude => ModTarget::Amplitude,
            DepthTarget::Pan => ModTarget::Pan,
            DepthTarget::Width => ModTarget::Width,
            DepthTarget::Position => ModTarget::Position,
            DepthTarget::Pitch => ModTarget::Pitch,
            DepthTarget::Cutoff => ModTarget::FilCutoff(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Hello,
    NumRegions,
    NumGroups,
    NumCurves,
    NumSamples,
    NumActiveVoices,
    KeySlots,
    CcSlots,
    CcChanged,
    CcChangedPrev,
    CcValue,
    CcDefault,
    Aftertouch,
    PolyAftertouch,
    PitchBend,
    SampleQuality,
    OscillatorQuality,
    FreewheelingSampleQuality,
    FreewheelingOscillatorQuality,
    SustainCancelsRelease,
    Region(RegionField),
    Filter(FilterField),
    Eq(EqField),
    CcDepth(DepthTarget),
    VoiceTriggerValue,
    VoiceTriggerNumber,
    VoiceTriggerType,
    VoiceRemainingDelay,
    VoiceSourcePosition,
}

struct Entry {
    pattern: &'static str,
    sig: &'static str,
    op: Op,
    set: bool,
}

struct DispatchTable {
    entries: Vec<Entry>,
    by_hash: HashMap<u64, Vec<u32>>,
}

fn feed_byte(hash: &mut u64, byte: u8) {
    *hash ^= byte as u64;
    *hash = hash.wrapping_mul(0x100000001b3);
}

/// FNV-1a over the path (digit runs collapse to `&`) plus the signature.
/// Hashing a pattern string through the same function leaves it unchanged,
/// which is what makes the compiled table line up.
fn hash_message(path: &str, sig: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut in_digits = false;
    for &byte in path.as_bytes() {
        if byte.is_ascii_digit() {
            if !in_digits {
                feed_byte(&mut hash, b'&');
            }
            in_digits = true;
        } else {
            in_digits = false;
            feed_byte(&mut hash, byte);
        }
    }
    feed_byte(&mut hash, b',');
    for &byte in sig.as_bytes() {
        feed_byte(&mut hash, byte);
    }
    hash
}

/// Verify `path` against `pattern`, extracting the digit-run indices.
/// Returns the number of indices on success.
fn match_pattern(pattern: &str, path: &str, indices: &mut [usize; MAX_INDICES]) -> Option<usize> {
    let pattern = pattern.as_bytes();
    let path = path.as_bytes();
    let mut pi = 0;
    let mut qi = 0;
    let mut count = 0;
    while pi < pattern.len() {
        if pattern[pi] == b'&' {
            let start = qi;
            let mut value = 0usize;
            while qi < path.len() && path[qi].is_ascii_digit() {
                value = value * 10 + (path[qi] - b'0') as usize;
                qi += 1;
            }
            if qi == start || count >= MAX_INDICES {
                return None;
            }
            indices[count] = value;
            count += 1;
            pi += 1;
        } else if qi < path.len() && pattern[pi] == path[qi] {
            pi += 1;
            qi += 1;
        } else {
            return None;
        }
    }
    (qi == path.len()).then_some(count)
}

impl DispatchTable {
    fn build() -> Self {
        let mut entries = Vec::new();
        let mut add = |pattern: &'static str, sig: &'static str, op: Op, set: bool| {
            entries.push(Entry { pattern, sig, op, set });
        };

        add("/hello", "", Op::Hello, false);
        add("/num_regions", "", Op::NumRegions, false);
        add("/num_groups", "", Op::NumGroups, false);
        add("/num_curves", "", Op::NumCurves, false);
        add("/num_samples", "", Op::NumSamples, false);
        add("/num_active_voices", "", Op::NumActiveVoices, false);
        add("/key/slots", "", Op::KeySlots, false);
        add("/cc/slots", "", Op::CcSlots, false);
        add("/cc/changed", "", Op::CcChanged, false);
        add("/cc/changed~", "", Op::CcChangedPrev, false);

        add("/cc&/value", "", Op::CcValue, false);
        add("/cc&/value", "f", Op::CcValue, true);
        add("/cc&/default", "", Op::CcDefault, false);
        add("/cc&/default", "f", Op::CcDefault, true);
        add("/aftertouch", "", Op::Aftertouch, false);
        add("/aftertouch", "f", Op::Aftertouch, true);
        add("/poly_aftertouch/&", "", Op::PolyAftertouch, false);
        add("/poly_aftertouch/&", "f", Op::PolyAftertouch, true);
        add("/pitch_bend", "", Op::PitchBend, false);
        add("/pitch_bend", "f", Op::PitchBend, true);

        add("/sample_quality", "", Op::SampleQuality, false);
        add("/sample_quality", "i", Op::SampleQuality, true);
        add("/oscillator_quality", "", Op::OscillatorQuality, false);
        add("/oscillator_quality", "i", Op::OscillatorQuality, true);
        add("/freewheeling_sample_quality", "", Op::FreewheelingSampleQuality, false);
        add("/freewheeling_sample_quality", "i", Op::FreewheelingSampleQuality, true);
        add(
            "/freewheeling_oscillator_quality",
            "",
            Op::FreewheelingOscillatorQuality,
            false,
        );
        add(
            "/freewheeling_oscillator_quality",
            "i",
            Op::FreewheelingOscillatorQuality,
            true,
        );
        add("/sustain_cancels_release", "", Op::SustainCancelsRelease, false);
        add("/sustain_cancels_release", "T", Op::SustainCancelsRelease, true);
        add("/sustain_cancels_release", "F", Op::SustainCancelsRelease, true);

        use RegionField::*;
        let region_f = [
            ("/region&/delay", Delay),
            ("/region&/loop_crossfade", LoopCrossfade),
            ("/region&/off_time", OffTime),
            ("/region&/tune", Tune),
            ("/region&/bend_up", BendUp),
            ("/region&/bend_down", BendDown),
            ("/region&/volume", Volume),
            ("/region&/amplitude", Amplitude),
            ("/region&/pan", Pan),
            ("/region&/width", Width),
            ("/region&/position", Position),
            ("/region&/rt_decay", RtDecay),
            ("/region&/ampeg_attack", AmpegAttack),
            ("/region&/ampeg_decay", AmpegDecay),
            ("/region&/ampeg_sustain", AmpegSustain),
            ("/region&/ampeg_release", AmpegRelease),
            ("/region&/ampeg_delay", AmpegDelay),
            ("/region&/ampeg_hold", AmpegHold),
            ("/region&/ampeg_start", AmpegStart),
        ];
        for (pattern, field) in region_f {
            add(pattern, "", Op::Region(field), false);
            add(pattern, "f", Op::Region(field), true);
        }

        let region_i = [
            ("/region&/group", Group),
            ("/region&/off_by", OffBy),
            ("/region&/polyphony", Polyphony),
            ("/region&/note_polyphony", NotePolyphony),
            ("/region&/pitch_keycenter", PitchKeycenter),
            ("/region&/transpose", Transpose),
            ("/region&/sequence_length", SeqLength),
            ("/region&/sequence_position", SeqPosition),
        ];
        for (pattern, field) in region_i {
            add(pattern, "", Op::Region(field), false);
            add(pattern, "i", Op::Region(field), true);
        }

        add("/region&/enabled", "", Op::Region(Enabled), false);
        add("/region&/trigger", "", Op::Region(Trigger), false);
        add("/region&/loop_mode", "", Op::Region(LoopMode), false);
        add("/region&/loop_mode", "s", Op::Region(LoopMode), true);
        add("/region&/off_mode", "", Op::Region(OffModeField), false);
        add("/region&/off_mode", "s", Op::Region(OffModeField), true);
        add("/region&/note_selfmask", "", Op::Region(NoteSelfmask), false);
        add("/region&/note_selfmask", "T", Op::Region(NoteSelfmask), true);
        add("/region&/note_selfmask", "F", Op::Region(NoteSelfmask), true);
        add("/region&/offset", "", Op::Region(Offset), false);
        add("/region&/offset", "h", Op::Region(Offset), true);
        add("/region&/end", "", Op::Region(End), false);
        add("/region&/end", "h", Op::Region(End), true);
        add("/region&/loop_range", "", Op::Region(LoopRange), false);
        add("/region&/loop_range", "hh", Op::Region(LoopRange), true);
        add("/region&/key_range", "", Op::Region(KeyRange), false);
        add("/region&/key_range", "ii", Op::Region(KeyRange), true);
        add("/region&/vel_range", "", Op::Region(VelRange), false);
        add("/region&/vel_range", "ff", Op::Region(VelRange), true);
        add("/region&/bend_range", "", Op::Region(BendRange), false);
        add("/region&/bend_range", "ff", Op::Region(BendRange), true);
        add("/region&/cc_range&", "", Op::Region(CcRange), false);
        add("/region&/cc_range&", "ff", Op::Region(CcRange), true);

        let filter_f = [
            ("/region&/filter&/cutoff", FilterField::Cutoff),
            ("/region&/filter&/resonance", FilterField::Resonance),
            ("/region&/filter&/gain", FilterField::Gain),
        ];
        for (pattern, field) in filter_f {
            add(pattern, "", Op::Filter(field), false);
            add(pattern, "f", Op::Filter(field), true);
        }
        add("/region&/filter&/type", "", Op::Filter(FilterField::Kind), false);

        let eq_f = [
            ("/region&/eq&/frequency", EqField::Frequency),
            ("/region&/eq&/bandwidth", EqField::Bandwidth),
            ("/region&/eq&/gain", EqField::Gain),
        ];
        for (pattern, field) in eq_f {
            add(pattern, "", Op::Eq(field), false);
            add(pattern, "f", Op::Eq(field), true);
        }

        let depths = [
            ("/region&/volume_cc&", DepthTarget::Volume),
            ("/region&/amplitude_cc&", DepthTarget::Amplitude),
            ("/region&/pan_cc&", DepthTarget::Pan),
            ("/region&/width_cc&", DepthTarget::Width),
            ("/region&/position_cc&", DepthTarget::Position),
            ("/region&/pitch_cc&", DepthTarget::Pitch),
            ("/region&/cutoff_cc&", DepthTarget::Cutoff),
        ];
        for (pattern, target) in depths {
            add(pattern, "", Op::CcDepth(target), false);
            add(pattern, "f", Op::CcDepth(target), true);
        }

        add("/voice&/trigger_value", "", Op::VoiceTriggerValue, false);
        add("/voice&/trigger_number", "", Op::VoiceTriggerNumber, false);
        add("/voice&/trigger_type", "", Op::VoiceTriggerType, false);
        add("/voice&/remaining_delay", "", Op::VoiceRemainingDelay, false);
        add("/voice&/source_position", "", Op::VoiceSourcePosition, false);

        let mut by_hash: HashMap<u64, Vec<u32>> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            by_hash
                .entry(hash_message(entry.pattern, entry.sig))
                .or_default()
                .push(index as u32);
        }

        Self { entries, by_hash }
    }

    fn lookup(&self, path: &str, sig: &str) -> Option<(&Entry, [usize; MAX_INDICES])> {
        let hash = hash_message(path, sig);
        let bucket = self.by_hash.get(&hash)?;
        let mut indices = [0usize; MAX_INDICES];
        for &entry_index in bucket {
            let entry = &self.entries[entry_index as usize];
            if entry.sig == sig && match_pattern(entry.pattern, path, &mut indices).is_some() {
                return Some((entry, indices));
            }
        }
        None
    }
}

static TABLE: OnceLock<DispatchTable> = OnceLock::new();

fn table() -> &'static DispatchTable {
    TABLE.get_or_init(DispatchTable::build)
}

//=======================================
// Argument helpers

fn arg_f(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index)? {
        OscType::Float(v) => Some(*v),
        OscType::Double(v) => Some(*v as f32),
        OscType::Int(v) => Some(*v as f32),
        _ => None,
    }
}

fn arg_i(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index)? {
        OscType::Int(v) => Some(*v),
        OscType::Long(v) => Some(*v as i32),
        _ => None,
    }
}

fn arg_h(args: &[OscType], index: usize) -> Option<i64> {
    match args.get(index)? {
        OscType::Long(v) => Some(*v),
        OscType::Int(v) => Some(*v as i64),
        _ => None,
    }
}

fn arg_s<'a>(args: &'a [OscType], index: usize) -> Option<&'a str> {
    match args.get(index)? {
        OscType::String(v) => Some(v.as_str()),
        _ => None,
    }
}

fn sig_bool(sig: &str) -> bool {
    sig == "T"
}

fn nil() -> Option<Vec<OscType>> {
    Some(vec![OscType::Nil])
}

fn ack() -> Option<Vec<OscType>> {
    Some(Vec::new())
}

fn blob(bytes: &[u8]) -> Option<Vec<OscType>> {
    Some(vec![OscType::Blob(bytes.to_vec())])
}

impl Engine {
    /// Resolve and execute one dispatch message. Returns `None` for an
    /// unknown `(path, signature)` pair; queries return their typed values,
    /// sets return an empty acknowledgement, and an out-of-range index
    /// returns the null type tag.
    pub fn dispatch(
        &mut self,
        delay: usize,
        path: &str,
        sig: &str,
        args: &[OscType],
    ) -> Option<Vec<OscType>> {
        let (entry, indices) = table().lookup(path, sig)?;
        let set = entry.set;

        match entry.op {
            Op::Hello => ack(),
            Op::NumRegions => Some(vec![OscType::Int(self.num_regions() as i32)]),
            Op::NumGroups => Some(vec![OscType::Int(self.num_groups() as i32)]),
            Op::NumCurves => Some(vec![OscType::Int(self.num_curves() as i32)]),
            Op::NumSamples => Some(vec![OscType::Int(self.num_samples() as i32)]),
            Op::NumActiveVoices => Some(vec![OscType::Int(self.num_active_voices() as i32)]),
            Op::KeySlots => blob(&self.key_slots()),
            Op::CcSlots => blob(&self.cc_slots()),
            Op::CcChanged => blob(&self.cc_changed()),
            Op::CcChangedPrev => blob(&self.cc_changed_previous()),

            Op::CcValue => {
                let cc = indices[0];
                if cc >= crate::config::NUM_CCS {
                    return nil();
                }
                if set {
                    self.cc(delay, cc, arg_f(args, 0)?);
                    ack()
                } else {
                    Some(vec![OscType::Float(self.midi.cc_value(cc))])
                }
            }
            Op::CcDefault => {
                let cc = indices[0];
                if cc >= crate::config::NUM_CCS {
                    return nil();
                }
                if set {
                    self.cc_defaults[cc] = arg_f(args, 0)?.clamp(0.0, 1.0);
                    ack()
                } else {
                    Some(vec![OscType::Float(self.cc_defaults[cc])])
                }
            }
            Op::Aftertouch => {
                if set {
                    self.channel_aftertouch(delay, arg_f(args, 0)?);
                    ack()
                } else {
                    Some(vec![OscType::Float(self.midi.channel_aftertouch())])
                }
            }
            Op::PolyAftertouch => {
                let note = indices[0];
                if note >= 128 {
                    return nil();
                }
                if set {
                    self.poly_aftertouch(delay, note as u8, arg_f(args, 0)?);
                    ack()
                } else {
                    Some(vec![OscType::Float(self.midi.poly_aftertouch(note as u8))])
                }
            }
            Op::PitchBend => {
                if set {
                    self.pitch_bend(delay, arg_f(args, 0)?);
                    ack()
                } else {
                    Some(vec![OscType::Float(self.midi.pitch_bend())])
                }
            }

            Op::SampleQuality => {
                if set {
                    self.sample_quality = arg_i(args, 0)?.clamp(0, 10) as u8;
                    ack()
                } else {
                    Some(vec![OscType::Int(self.sample_quality as i32)])
                }
            }
            Op::OscillatorQuality => {
                if set {
                    self.oscillator_quality = arg_i(args, 0)?.clamp(0, 10) as u8;
                    ack()
                } else {
                    Some(vec![OscType::Int(self.oscillator_quality as i32)])
                }
            }
            Op::FreewheelingSampleQuality => {
                if set {
                    self.freewheeling_sample_quality = arg_i(args, 0)?.clamp(0, 10) as u8;
                    ack()
                } else {
                    Some(vec![OscType::Int(self.freewheeling_sample_quality as i32)])
                }
            }
            Op::FreewheelingOscillatorQuality => {
                if set {
                    self.freewheeling_oscillator_quality = arg_i(args, 0)?.clamp(0, 10) as u8;
                    ack()
                } else {
                    Some(vec![OscType::Int(
                        self.freewheeling_oscillator_quality as i32,
                    )])
                }
            }
            Op::SustainCancelsRelease => {
                if set {
                    self.sustain_cancels_release = sig_bool(sig);
                    ack()
                } else {
                    Some(vec![OscType::Bool(self.sustain_cancels_release)])
                }
            }

            Op::Region(field) => self.dispatch_region(field, indices, sig, args, set),
            Op::Filter(field) => self.dispatch_filter(field, indices, args, set),
            Op::Eq(field) => self.dispatch_eq(field, indices, args, set),
            Op::CcDepth(target) => self.dispatch_cc_depth(target, indices, args, set),

            Op::VoiceTriggerValue => self.voice_query(indices[0], |v| {
                vec![OscType::Float(v.trigger().value)]
            }),
            Op::VoiceTriggerNumber => self.voice_query(indices[0], |v| {
                vec![OscType::Int(v.trigger().number as i32)]
            }),
            Op::VoiceTriggerType => self.voice_query(indices[0], |v| {
                vec![OscType::String(v.trigger().trigger_type.as_str().into())]
            }),
            Op::VoiceRemainingDelay => self.voice_query(indices[0], |v| {
                vec![OscType::Long(v.remaining_delay() as i64)]
            }),
            Op::VoiceSourcePosition => self.voice_query(indices[0], |v| {
                vec![OscType::Long(v.source_position() as i64)]
            }),
        }
    }

    fn voice_query(
        &self,
        index: usize,
        f: impl FnOnce(&crate::voice::Voice) -> Vec<OscType>,
    ) -> Option<Vec<OscType>> {
        match self.vm.voice(index) {
            Some(voice) if !voice.is_free() => Some(f(voice)),
            _ => nil(),
        }
    }

    fn dispatch_region(
        &mut self,
        field: RegionField,
        indices: [usize; MAX_INDICES],
        sig: &str,
        args: &[OscType],
        set: bool,
    ) -> Option<Vec<OscType>> {
        use RegionField::*;
        let region_index = indices[0];
        let table = self.region_table();
        let Some(region) = table.regions.get(region_index) else {
            return nil();
        };

        if !set {
            let reply = match field {
                Enabled => vec![OscType::Bool(!region.disabled())],
                Delay => vec![OscType::Float(region.delay)],
                Offset => vec![OscType::Long(region.offset as i64)],
                End => vec![OscType::Long(region.sample_end as i64)],
                Trigger => vec![OscType::String(region.trigger.as_str().into())],
                LoopMode => vec![OscType::String(region.loop_desc.mode.as_str().into())],
                LoopRange => vec![
                    OscType::Long(region.loop_desc.start as i64),
                    OscType::Long(region.loop_desc.end as i64),
                ],
                LoopCrossfade => vec![OscType::Float(region.loop_desc.crossfade)],
                Group => vec![OscType::Int(region.group as i32)],
                OffBy => match region.off_by {
                    Some(group) => vec![OscType::Int(group as i32)],
                    None => vec![OscType::Nil],
                },
                OffModeField => {
                    let name = match region.off_mode {
                        OffMode::Normal => "normal",
                        OffMode::Fast => "fast",
                        OffMode::Time => "time",
                    };
                    vec![OscType::String(name.into())]
                }
                OffTime => vec![OscType::Float(region.off_time)],
                Polyphony => match region.polyphony {
                    Some(limit) => vec![OscType::Int(limit as i32)],
                    None => vec![OscType::Nil],
                },
                NotePolyphony => match region.note_polyphony {
                    Some(limit) => vec![OscType::Int(limit as i32)],
                    None => vec![OscType::Nil],
                },
                NoteSelfmask => vec![OscType::Bool(region.note_selfmask)],
                KeyRange => vec![
                    OscType::Int(region.key_range.lo as i32),
                    OscType::Int(region.key_range.hi as i32),
                ],
                VelRange => vec![
                    OscType::Float(region.vel_range.lo),
                    OscType::Float(region.vel_range.hi),
                ],
                BendRange => vec![
                    OscType::Float(region.bend_range.lo),
                    OscType::Float(region.bend_range.hi),
                ],
                CcRange => {
                    let cc = indices[1];
                    match region.cc_conditions.iter().find(|(c, _)| *c == cc) {
                        Some((_, range)) => {
                            vec![OscType::Float(range.lo), OscType::Float(range.hi)]
                        }
                        None => vec![OscType::Float(0.0), OscType::Float(1.0)],
                    }
                }
                PitchKeycenter => vec![OscType::Int(region.pitch_keycenter as i32)],
                Transpose => vec![OscType::Int(region.transpose)],
                Tune => vec![OscType::Float(region.tune)],
                BendUp => vec![OscType::Float(region.bend_up)],
                BendDown => vec![OscType::Float(region.bend_down)],
                Volume => vec![OscType::Float(region.volume)],
                Amplitude => vec![OscType::Float(region.amplitude)],
                Pan => vec![OscType::Float(region.pan)],
                Width => vec![OscType::Float(region.width)],
                Position => vec![OscType::Float(region.position)],
                RtDecay => vec![OscType::Float(region.rt_decay)],
                SeqLength => vec![OscType::Int(region.seq_length as i32)],
                SeqPosition => vec![OscType::Int(region.seq_position as i32)],
                AmpegAttack => vec![OscType::Float(region.amp_eg.attack)],
                AmpegDecay => vec![OscType::Float(region.amp_eg.decay)],
                AmpegSustain => vec![OscType::Float(region.amp_eg.sustain)],
                AmpegRelease => vec![OscType::Float(region.amp_eg.release)],
                AmpegDelay => vec![OscType::Float(region.amp_eg.delay)],
                AmpegHold => vec![OscType::Float(region.amp_eg.hold)],
                AmpegStart => vec![OscType::Float(region.amp_eg.start)],
            };
            return Some(reply);
        }

        drop(table);
        let applied = match field {
            Delay => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.delay = v.max(0.0))
            }),
            Offset => arg_h(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.offset = v.max(0) as usize)
            }),
            End => arg_h(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.sample_end = v.max(0) as usize)
            }),
            LoopMode => arg_s(args, 0).and_then(|v| {
                let mode = match v {
                    "no_loop" => Some(crate::region::LoopMode::NoLoop),
                    "one_shot" => Some(crate::region::LoopMode::OneShot),
                    "loop_continuous" => Some(crate::region::LoopMode::Continuous),
                    "loop_sustain" => Some(crate::region::LoopMode::Sustain),
                    _ => None,
                }?;
                Some(self.with_region_mut(region_index, |r| r.loop_desc.mode = mode))
            }),
            LoopRange => arg_h(args, 0).zip(arg_h(args, 1)).map(|(start, end)| {
                self.with_region_mut(region_index, |r| {
                    r.loop_desc.start = start.max(0) as usize;
                    r.loop_desc.end = end.max(0) as usize;
                })
            }),
            LoopCrossfade => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.loop_desc.crossfade = v.max(0.0))
            }),
            Group => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.group = v.max(0) as u32)
            }),
            OffBy => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| {
                    r.off_by = if v <= 0 { None } else { Some(v as u32) };
                })
            }),
            OffModeField => arg_s(args, 0).and_then(|v| {
                let mode = match v {
                    "normal" => Some(OffMode::Normal),
                    "fast" => Some(OffMode::Fast),
                    "time" => Some(OffMode::Time),
                    _ => None,
                }?;
                Some(self.with_region_mut(region_index, |r| r.off_mode = mode))
            }),
            OffTime => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.off_time = v.max(0.0))
            }),
            Polyphony => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| {
                    r.polyphony = if v < 0 { None } else { Some(v as usize) };
                })
            }),
            NotePolyphony => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| {
                    r.note_polyphony = if v < 0 { None } else { Some(v as usize) };
                })
            }),
            NoteSelfmask => {
                let on = sig_bool(sig);
                Some(self.with_region_mut(region_index, |r| r.note_selfmask = on))
            }
            KeyRange => arg_i(args, 0).zip(arg_i(args, 1)).map(|(lo, hi)| {
                self.with_region_mut(region_index, |r| {
                    r.key_range = NumRange::new(lo.clamp(0, 127) as u8, hi.clamp(0, 127) as u8);
                })
            }),
            VelRange => arg_f(args, 0).zip(arg_f(args, 1)).map(|(lo, hi)| {
                self.with_region_mut(region_index, |r| r.vel_range = NumRange::new(lo, hi))
            }),
            BendRange => arg_f(args, 0).zip(arg_f(args, 1)).map(|(lo, hi)| {
                self.with_region_mut(region_index, |r| r.bend_range = NumRange::new(lo, hi))
            }),
            // The range end comes from the second argument.
            CcRange => arg_f(args, 0).zip(arg_f(args, 1)).map(|(lo, hi)| {
                let cc = indices[1];
                self.with_region_mut(region_index, |r| {
                    match r.cc_conditions.iter_mut().find(|(c, _)| *c == cc) {
                        Some((_, range)) => *range = NumRange::new(lo, hi),
                        None => r.cc_conditions.push((cc, NumRange::new(lo, hi))),
                    }
                })
            }),
            PitchKeycenter => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.pitch_keycenter = v.clamp(0, 127) as u8)
            }),
            Transpose => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.transpose = v)
            }),
            Tune => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.tune = v)
            }),
            BendUp => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.bend_up = v)
            }),
            BendDown => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.bend_down = v)
            }),
            Volume => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.volume = v)
            }),
            Amplitude => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amplitude = v.max(0.0))
            }),
            Pan => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.pan = v.clamp(-1.0, 1.0))
            }),
            Width => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.width = v.clamp(-1.0, 1.0))
            }),
            Position => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.position = v.clamp(-1.0, 1.0))
            }),
            RtDecay => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.rt_decay = v.max(0.0))
            }),
            SeqLength => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.seq_length = v.max(1) as u32)
            }),
            SeqPosition => arg_i(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.seq_position = v.max(1) as u32)
            }),
            AmpegAttack => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.attack = v.max(0.0))
            }),
            AmpegDecay => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.decay = v.max(0.0))
            }),
            AmpegSustain => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.sustain = v.clamp(0.0, 1.0))
            }),
            AmpegRelease => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.release = v.max(0.0))
            }),
            AmpegDelay => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.delay = v.max(0.0))
            }),
            AmpegHold => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.hold = v.max(0.0))
            }),
            AmpegStart => arg_f(args, 0).map(|v| {
                self.with_region_mut(region_index, |r| r.amp_eg.start = v.clamp(0.0, 1.0))
            }),
            Enabled | Trigger => None,
        };
        match applied {
            Some(_) => ack(),
            None => None,
        }
    }

    fn dispatch_filter(
        &mut self,
        field: FilterField,
        indices: [usize; MAX_INDICES],
        args: &[OscType],
        set: bool,
    ) -> Option<Vec<OscType>> {
        let region_index = indices[0];
        let filter_index = indices[1];
        let table = self.region_table();
        let Some(region) = table.regions.get(region_index) else {
            return nil();
        };
        let Some(filter) = region.filters.get(filter_index) else {
            return nil();
        };

        if !set {
            let reply = match field {
                FilterField::Cutoff => vec![OscType::Float(filter.cutoff)],
                FilterField::Resonance => vec![OscType::Float(filter.resonance)],
                FilterField::Gain => vec![OscType::Float(filter.gain)],
                FilterField::Kind => vec![OscType::String(format!("{:?}", filter.kind).to_lowercase())],
            };
            return Some(reply);
        }

        drop(table);
        let value = arg_f(args, 0)?;
        self.with_region_mut(region_index, |r| {
            if let Some(filter) = r.filters.get_mut(filter_index) {
                match field {
                    FilterField::Cutoff => filter.cutoff = value.max(0.0),
                    FilterField::Resonance => filter.resonance = value,
                    FilterField::Gain => filter.gain = value,
                    FilterField::Kind => {}
                }
            }
        });
        ack()
    }

    fn dispatch_eq(
        &mut self,
        field: EqField,
        indices: [usize; MAX_INDICES],
        args: &[OscType],
        set: bool,
    ) -> Option<Vec<OscType>> {
        let region_index = indices[0];
        let eq_index = indices[1];
        let table = self.region_table();
        let Some(region) = table.regions.get(region_index) else {
            return nil();
        };
        let Some(eq) = region.equalizers.get(eq_index) else {
            return nil();
        };

        if !set {
            let reply = match field {
                EqField::Frequency => vec![OscType::Float(eq.frequency)],
                EqField::Bandwidth => vec![OscType::Float(eq.bandwidth)],
                EqField::Gain => vec![OscType::Float(eq.gain)],
            };
            return Some(reply);
        }

        drop(table);
        let value = arg_f(args, 0)?;
        self.with_region_mut(region_index, |r| {
            if let Some(eq) = r.equalizers.get_mut(eq_index) {
                match field {
                    EqField::Frequency => eq.frequency = value.max(0.0),
                    EqField::Bandwidth => eq.bandwidth = value.max(0.01),
                    EqField::Gain => eq.gain = value,
                }
            }
        });
        ack()
    }

    /// Depth get/set on the controller connection feeding a target. The
    /// lookup is a linear scan over the region's connections, which is
    /// accepted at control rate; a set on a missing connection creates it.
    fn dispatch_cc_depth(
        &mut self,
        target: DepthTarget,
        indices: [usize; MAX_INDICES],
        args: &[OscType],
        set: bool,
    ) -> Option<Vec<OscType>> {
        let region_index = indices[0];
        let cc = indices[1];
        let mod_target = target.mod_target();
        let table = self.region_table();
        let Some(region) = table.regions.get(region_index) else {
            return nil();
        };

        if !set {
            return match region.cc_mod_depth(cc, mod_target) {
                Some(depth) => Some(vec![OscType::Float(depth)]),
                None => nil(),
            };
        }

        drop(table);
        let depth = arg_f(args, 0)?;
        self.with_region_mut(region_index, |r| {
            r.get_or_create_connection(ModSource::controller(cc), mod_target)
                .source_depth = depth;
        });
        ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Region, TriggerKind};
    use crate::sample::SampleBuffer;
    use std::sync::Arc;

    const RATE: f32 = 48_000.0;

    fn engine() -> Engine {
        let mut engine = Engine::new(RATE);
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.key_range = NumRange::new(60, 72);
        region.filters.push(crate::filter::FilterDescription {
            cutoff: 800.0,
            ..Default::default()
        });
        engine.load_regions(vec![region]);
        engine
    }

    #[test]
    fn pattern_hash_collapses_digit_runs() {
        assert_eq!(
            hash_message("/region12/delay", ""),
            hash_message("/region&/delay", "")
        );
        assert_ne!(
            hash_message("/region12/delay", ""),
            hash_message("/region12/delay", "f")
        );
    }

    #[test]
    fn pattern_match_extracts_indices() {
        let mut indices = [0usize; MAX_INDICES];
        let n = match_pattern("/region&/filter&/cutoff", "/region3/filter1/cutoff", &mut indices);
        assert_eq!(n, Some(2));
        assert_eq!(&indices[..2], &[3, 1]);
        assert!(match_pattern("/region&/delay", "/region/delay", &mut indices).is_none());
        assert!(match_pattern("/region&/delay", "/region5/volume", &mut indices).is_none());
    }

    #[test]
    fn inventory_queries() {
        let mut engine = engine();
        assert_eq!(
            engine.dispatch(0, "/num_regions", "", &[]),
            Some(vec![OscType::Int(1)])
        );
        assert_eq!(
            engine.dispatch(0, "/num_active_voices", "", &[]),
            Some(vec![OscType::Int(0)])
        );
        let slots = engine.dispatch(0, "/key/slots", "", &[]).unwrap();
        match &slots[0] {
            OscType::Blob(bytes) => {
                assert_eq!(bytes.len(), 16);
                assert_ne!(bytes[60 / 8] & (1 << (60 % 8)), 0);
            }
            other => panic!("expected blob, got {other:?}"),
        }
    }

    #[test]
    fn unknown_path_returns_none() {
        let mut engine = engine();
        assert_eq!(engine.dispatch(0, "/no_such_thing", "", &[]), None);
        // Right path, wrong signature
        assert_eq!(engine.dispatch(0, "/num_regions", "f", &[OscType::Float(1.0)]), None);
    }

    #[test]
    fn out_of_range_region_is_nil() {
        let mut engine = engine();
        assert_eq!(
            engine.dispatch(0, "/region7/volume", "", &[]),
            Some(vec![OscType::Nil])
        );
    }

    #[test]
    fn region_get_and_set_roundtrip() {
        let mut engine = engine();
        engine.dispatch(0, "/region0/volume", "f", &[OscType::Float(-6.0)]);
        assert_eq!(
            engine.dispatch(0, "/region0/volume", "", &[]),
            Some(vec![OscType::Float(-6.0)])
        );

        engine.dispatch(
            0,
            "/region0/key_range",
            "ii",
            &[OscType::Int(36), OscType::Int(48)],
        );
        assert_eq!(
            engine.dispatch(0, "/region0/key_range", "", &[]),
            Some(vec![OscType::Int(36), OscType::Int(48)])
        );
    }

    #[test]
    fn cc_range_set_reads_both_arguments() {
        let mut engine = engine();
        engine.dispatch(
            0,
            "/region0/cc_range64",
            "ff",
            &[OscType::Float(0.25), OscType::Float(0.75)],
        );
        assert_eq!(
            engine.dispatch(0, "/region0/cc_range64", "", &[]),
            Some(vec![OscType::Float(0.25), OscType::Float(0.75)])
        );
    }

    #[test]
    fn cc_value_set_feeds_midi_state() {
        let mut engine = engine();
        engine.dispatch(0, "/cc74/value", "f", &[OscType::Float(0.7)]);
        assert_eq!(
            engine.dispatch(0, "/cc74/value", "", &[]),
            Some(vec![OscType::Float(0.7)])
        );
        assert_eq!(engine.midi_state().cc_value(74), 0.7);
    }

    #[test]
    fn filter_endpoints_use_nested_index() {
        let mut engine = engine();
        assert_eq!(
            engine.dispatch(0, "/region0/filter0/cutoff", "", &[]),
            Some(vec![OscType::Float(800.0)])
        );
        engine.dispatch(0, "/region0/filter0/cutoff", "f", &[OscType::Float(1200.0)]);
        assert_eq!(
            engine.dispatch(0, "/region0/filter0/cutoff", "", &[]),
            Some(vec![OscType::Float(1200.0)])
        );
        assert_eq!(
            engine.dispatch(0, "/region0/filter3/cutoff", "", &[]),
            Some(vec![OscType::Nil])
        );
    }

    #[test]
    fn depth_endpoints_create_connections() {
        let mut engine = engine();
        // No connection yet
        assert_eq!(
            engine.dispatch(0, "/region0/pitch_cc1", "", &[]),
            Some(vec![OscType::Nil])
        );
        engine.dispatch(0, "/region0/pitch_cc1", "f", &[OscType::Float(1200.0)]);
        assert_eq!(
            engine.dispatch(0, "/region0/pitch_cc1", "", &[]),
            Some(vec![OscType::Float(1200.0)])
        );
        // The width depth write path exists too
        engine.dispatch(0, "/region0/width_cc20", "f", &[OscType::Float(0.5)]);
        assert_eq!(
            engine.dispatch(0, "/region0/width_cc20", "", &[]),
            Some(vec![OscType::Float(0.5)])
        );
    }

    #[test]
    fn voice_introspection_reports_trigger() {
        let mut engine = engine();
        engine.note_on(0, 60, 0.8);
        // Find the live voice slot
        let mut found = false;
        for index in 0..64 {
            let path = format!("/voice{index}/trigger_type");
            if let Some(reply) = engine.dispatch(0, &path, "", &[]) {
                if reply == vec![OscType::String("note_on".into())] {
                    let value = engine
                        .dispatch(0, &format!("/voice{index}/trigger_value"), "", &[])
                        .unwrap();
                    assert_eq!(value, vec![OscType::Float(0.8)]);
                    let number = engine
                        .dispatch(0, &format!("/voice{index}/trigger_number"), "", &[])
                        .unwrap();
                    assert_eq!(number, vec![OscType::Int(60)]);
                    found = true;
                    break;
                }
            }
        }
        assert!(found, "no live voice reported");
    }

    #[test]
    fn note_off_trigger_type_string() {
        let mut engine = engine();
        let mut region = Region::new(0);
        region.set_sample(Arc::new(SampleBuffer::from_mono(vec![0.5; 48_000], RATE)));
        region.trigger = TriggerKind::Release;
        engine.load_regions(vec![region]);

        engine.note_on(0, 60, 1.0);
        engine.note_off(0, 60, 0.0);
        let mut seen = Vec::new();
        for index in 0..64 {
            if let Some(reply) = engine.dispatch(0, &format!("/voice{index}/trigger_type"), "", &[])
            {
                if let Some(OscType::String(s)) = reply.into_iter().next() {
                    seen.push(s);
                }
            }
        }
        assert!(
            seen.iter().any(|s| s == "note_off"),
            "release voice should report note_off, saw {seen:?}"
        );
    }

    #[test]
    fn boolean_option_roundtrip() {
        let mut engine = engine();
        assert_eq!(
            engine.dispatch(0, "/sustain_cancels_release", "", &[]),
            Some(vec![OscType::Bool(false)])
        );
        engine.dispatch(0, "/sustain_cancels_release", "T", &[]);
        assert_eq!(
            engine.dispatch(0, "/sustain_cancels_release", "", &[]),
            Some(vec![OscType::Bool(true)])
        );
    }
}
