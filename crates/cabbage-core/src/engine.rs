//! The seam between the core and a synthesis engine.
//!
//! [`Engine`] is implemented by the Csound backend (`cabbage-csound`) and
//! by the scripted engine used in tests. An engine processes one k-cycle
//! at a time against interleaved `spin`/`spout` buffers of
//! `ksmps * channels` samples.
//!
//! Engine callbacks (MIDI, graphs, breakpoints) are not registered as
//! globals. Instead, [`Engine::perform_ksmps`] receives an [`EngineHost`]
//! for the duration of the call and the engine forwards every callback to
//! it.

use crate::debug::{BreakpointRequest, BreakpointSnapshot, DebugCommand};
use crate::document::{ChannelDirection, ChannelRate, OrchestraDocument};
use crate::error::{CompileError, EngineError, EngineRuntimeError};

/// Engine settings fixed at compile time.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSettings {
    /// Host sample rate, when known. Overrides the orchestra's `sr`.
    pub sample_rate: Option<f64>,
    /// Command-line style options applied before compiling.
    pub options: Vec<String>,
    /// Enable the engine debugger.
    pub debug: bool,
}

impl CompileSettings {
    /// Every option for `document`: configured options, host sample
    /// rate and widget macros, in that order.
    pub fn options_for(&self, document: &OrchestraDocument) -> Vec<String> {
        let mut options = self.options.clone();
        if let Some(sr) = self.sample_rate {
            options.push(format!("--sample-rate={}", sr));
        }
        options.extend(document.macro_options());
        options
    }
}

/// A channel reported by the engine after compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineChannelInfo {
    pub name: String,
    pub rate: ChannelRate,
    pub direction: ChannelDirection,
    pub default_value: f64,
}

/// Result of one [`Engine::perform_ksmps`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformStatus {
    /// `spout` holds a new k-cycle.
    Continue,
    /// The score has ended; `spout` is not meaningful.
    Finished,
}

/// One frame drawn by an engine display opcode.
#[derive(Debug, Clone, Copy)]
pub struct DisplayFrame<'a> {
    /// Engine-assigned window id.
    pub id: usize,
    pub caption: &'a str,
    pub points: &'a [f64],
    pub min: f64,
    pub max: f64,
    /// Vertical scale factor (the engine's running absolute maximum).
    pub y_scale: f64,
}

/// Callbacks an engine makes into its host while performing.
///
/// Called on the audio thread. Implementations only touch pre-allocated
/// state; [`EngineHost::breakpoint`] is the one call allowed to block.
pub trait EngineHost {
    /// Fill `buf` with pending MIDI input bytes and return the count.
    fn read_midi(&mut self, buf: &mut [u8]) -> usize;

    /// Accept MIDI output bytes. Returns the count consumed.
    fn write_midi(&mut self, bytes: &[u8]) -> usize;

    /// A display was created by the orchestra.
    fn make_display(&mut self, id: usize, caption: &str);

    /// A display has new data.
    fn draw_display(&mut self, frame: &DisplayFrame<'_>);

    /// A display was destroyed.
    fn kill_display(&mut self, id: usize);

    /// A breakpoint was hit. Blocks until the debugger releases it.
    fn breakpoint(&mut self, snapshot: BreakpointSnapshot) -> DebugCommand;
}

/// A host that ignores every callback.
pub struct NullHost;

impl EngineHost for NullHost {
    fn read_midi(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    fn write_midi(&mut self, bytes: &[u8]) -> usize {
        bytes.len()
    }

    fn make_display(&mut self, _id: usize, _caption: &str) {}

    fn draw_display(&mut self, _frame: &DisplayFrame<'_>) {}

    fn kill_display(&mut self, _id: usize) {}

    fn breakpoint(&mut self, _snapshot: BreakpointSnapshot) -> DebugCommand {
        DebugCommand::Continue
    }
}

/// Opaque handle to an engine channel, resolved once after compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSlot(pub usize);

/// A compiled-and-started synthesis engine.
///
/// Methods taking `&mut self` other than `compile`, `bind_channel` and
/// `reset` are called on the audio thread and must not allocate, lock or
/// perform I/O.
pub trait Engine: Send {
    /// Compile and start `document`. Called once per instance.
    fn compile(
        &mut self,
        document: &OrchestraDocument,
        settings: &CompileSettings,
    ) -> Result<(), CompileError>;

    /// Engine console output accumulated since the last call.
    fn take_messages(&mut self) -> String;

    fn sample_rate(&self) -> f64;

    /// Samples per k-cycle.
    fn ksmps(&self) -> usize;

    fn input_channels(&self) -> usize;

    fn output_channels(&self) -> usize;

    /// Full-scale amplitude of the orchestra.
    fn zero_dbfs(&self) -> f64;

    /// Channels the compiled orchestra exposes.
    fn channels(&self) -> Vec<EngineChannelInfo>;

    /// Resolve (creating if needed) a channel for real-time access.
    fn bind_channel(&mut self, name: &str, rate: ChannelRate) -> Option<ChannelSlot>;

    fn set_control(&mut self, slot: ChannelSlot, value: f64);

    fn control(&self, slot: ChannelSlot) -> f64;

    /// Copy the current k-cycle of an audio channel into `out`.
    fn read_audio_channel(&self, slot: ChannelSlot, out: &mut [f64]);

    /// Interleaved input buffer for the next k-cycle.
    fn spin_mut(&mut self) -> &mut [f64];

    /// Interleaved output of the last k-cycle.
    fn spout(&self) -> &[f64];

    /// Run one k-cycle.
    fn perform_ksmps(
        &mut self,
        host: &mut dyn EngineHost,
    ) -> Result<PerformStatus, EngineRuntimeError>;

    /// Contents of function table `number`, if it exists.
    fn table(&self, number: i32) -> Option<&[f64]>;

    /// Apply a debugger request. Ignored when the debugger is disabled.
    fn apply_breakpoint(&mut self, request: &BreakpointRequest);

    /// Rewind the performance to its start.
    fn reset(&mut self) -> Result<(), EngineRuntimeError>;
}

/// Creates fresh engine instances.
pub trait EngineFactory: Send {
    type Engine: Engine;

    fn create(&self) -> Result<Self::Engine, EngineError>;
}

impl<E, F> EngineFactory for F
where
    E: Engine,
    F: Fn() -> Result<E, EngineError> + Send,
{
    type Engine = E;

    fn create(&self) -> Result<E, EngineError> {
        self()
    }
}
