//! # Cabbage core
//!
//! Real-time processing core for Csound-based audio plugins.
//!
//! The core embeds a synthesis engine behind the [`Engine`] trait and
//! bridges everything the GUI does into the host's audio callback without
//! locks or allocation on the audio thread.
//!
//! ## Architecture
//!
//! ```text
//! GUI (ControlHandle)                          host audio thread
//!     │ set_channel / send_midi / resume            │
//!     ▼                                             ▼
//! ChannelBridge · MidiBridge · Debugger ──► AudioCallbackAdapter
//!     ▲                                             │
//!     │ get_channel / displays / snapshots          ▼
//! SignalInspector ◄──────────────────────── EngineHandle<F: EngineFactory>
//! ```
//!
//! [`CsoundPluginProcessor`] ties these together behind the plugin host
//! contract: prepare, release, process, and state save/restore.

pub mod adapter;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod debug;
pub mod document;
pub mod engine;
mod error;
pub mod handle;
pub mod inspector;
pub mod midi;
pub mod processor;
pub mod state;
pub mod transport;
mod triple_buffer;

#[cfg(test)]
mod test_engine;

pub use adapter::{AudioCallbackAdapter, FaultReport};
pub use channel::{ChannelBridge, ChannelLayout, ChannelSpec};
pub use config::Config;
pub use debug::{
    BreakpointRequest, BreakpointSnapshot, DebugBreakpointBridge, DebugCommand, VariableBinding,
    VariableValue,
};
pub use document::{ChannelDirection, ChannelRate, OrchestraDocument};
pub use engine::{
    ChannelSlot, CompileSettings, DisplayFrame, Engine, EngineChannelInfo, EngineFactory,
    EngineHost, PerformStatus,
};
pub use error::{
    ChannelError, CompileError, CompileResult, ConfigError, EngineError, EngineRuntimeError,
    StateError,
};
pub use handle::EngineHandle;
pub use inspector::{SignalDisplay, SignalInspector};
pub use midi::{MidiBridge, MidiBuffer, MidiEvent};
pub use processor::{ControlHandle, CsoundPluginProcessor};
pub use state::PluginState;
pub use transport::Transport;
