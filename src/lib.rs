//! # Strata - Region-Based Sample Playback Engine
//!
//! Strata is a realtime sample-playback synthesizer engine. Instruments are
//! tables of [regions](region::Region): samples with the pitch, velocity
//! and controller conditions under which they trigger, per-region
//! envelopes, LFOs, filter/EQ chains, and a modulation matrix connecting
//! controllers and generators to playback parameters.
//!
//! ## Core Features
//!
//! - **Bounded voice pool**: fixed polyphony with stealing, per-region and
//!   per-note limits, group choke and self-masking
//! - **Sample-accurate events**: controller changes apply at their sample
//!   offset inside a block, not at block boundaries
//! - **Modulation matrix**: controllers, envelopes, LFOs and aftertouch
//!   feeding amplitude, pitch, cutoff, pan, width and more, with curves,
//!   smoothing, stepping and depth modulation
//! - **Loop machinery**: one-shot, continuous and sustain loops with
//!   seam crossfades and reverse playback
//! - **Atomic reloads**: region tables swap without interrupting sounding
//!   voices
//! - **Control dispatch**: a path/typetag message surface for inventory,
//!   runtime controllers and region/voice introspection
//!
//! ## Quick Start
//!
//! ```
//! use strata::engine::Engine;
//! use strata::region::Region;
//! use strata::sample::SampleBuffer;
//! use strata::bus::StereoBus;
//! use std::sync::Arc;
//!
//! let mut engine = Engine::new(48_000.0);
//!
//! // One region playing a short sine, mapped to key 60
//! let data: Vec<f32> = (0..48_000)
//!     .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / 48_000.0).sin())
//!     .collect();
//! let mut region = Region::new(0);
//! region.set_sample(Arc::new(SampleBuffer::from_mono(data, 48_000.0)));
//! engine.load_regions(vec![region]);
//!
//! // Play a note and render a block
//! engine.note_on(0, 60, 1.0);
//! let mut buses = vec![StereoBus::new(1024)];
//! engine.render_block(&mut buses, 1024);
//! assert!(buses[0].peak() > 0.0);
//! ```
//!
//! ## Architecture
//!
//! Data flows leaves-first through the render path:
//!
//! 1. [`midi_state`] holds sorted per-controller event vectors
//! 2. [`voice_manager`] selects regions and drives the voice pool
//! 3. [`mod_matrix`] resolves each voice's connections at control rate
//! 4. [`voice`] reads samples, ticks generators, runs filters and panning
//! 5. Output accumulates into [`bus::StereoBus`] buffers per effect send
//!
//! The audio thread never allocates or locks: region tables are immutable
//! behind an atomic swap, control threads feed a single-producer queue, and
//! every voice's scratch space is preallocated.

pub mod bus;
pub mod config;
pub mod curve;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod filter;
pub mod flex_envelope;
pub mod lfo;
pub mod midi_state;
pub mod mod_matrix;
pub mod modulation;
pub mod panning;
pub mod region;
pub mod sample;
pub mod smoother;
pub mod voice;
pub mod voice_manager;

pub use engine::{ControlEvent, Engine, EngineController};
pub use error::EngineError;
