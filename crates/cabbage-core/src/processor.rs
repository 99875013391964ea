//! The plugin host contract.
//!
//! [`CsoundPluginProcessor`] is what a plugin wrapper drives: it owns the
//! engine handle and the audio-thread adapter, and shares the bridges with
//! any number of [`ControlHandle`]s held by the GUI.
//!
//! ```ignore
//! let mut processor = CsoundPluginProcessor::new(factory, Config::default());
//! processor.load_document(csd_text)?;
//! processor.prepare_to_play(48000.0, 512)?;
//!
//! let gui = processor.controller();
//! gui.set_channel("gain", 0.7)?;
//!
//! // audio thread
//! processor.process_block(&mut channels, &mut midi);
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::adapter::{AudioCallbackAdapter, Bridges, FaultReport};
use crate::channel::{ChannelBridge, ChannelLayout};
use crate::config::Config;
use crate::debug::{BreakpointRequest, BreakpointSnapshot, DebugBreakpointBridge};
use crate::document::OrchestraDocument;
use crate::engine::EngineFactory;
use crate::error::{ChannelError, CompileError, StateError};
use crate::handle::EngineHandle;
use crate::inspector::{SignalDisplay, SignalInspector};
use crate::midi::{MidiBridge, MidiBuffer, MidiEvent};
use crate::state::PluginState;
use crate::transport::Transport;

/// State shared between the processor and its control handles.
struct SharedState {
    channels: ChannelBridge,
    midi: MidiBridge,
    inspector: SignalInspector,
    debugger: DebugBreakpointBridge,
    faults: FaultReport,
    midi_output_overflows: AtomicU64,
    document_generation: AtomicU64,
    diagnostics: ArcSwap<String>,
}

impl SharedState {
    fn bridges(&self) -> Bridges<'_> {
        Bridges {
            midi: &self.midi,
            inspector: &self.inspector,
            debugger: &self.debugger,
            faults: &self.faults,
        }
    }
}

/// An embedded orchestra behind a plugin host interface.
pub struct CsoundPluginProcessor<F: EngineFactory> {
    config: Config,
    handle: EngineHandle<F>,
    adapter: AudioCallbackAdapter,
    shared: Arc<SharedState>,
}

impl<F: EngineFactory> CsoundPluginProcessor<F> {
    pub fn new(factory: F, config: Config) -> Self {
        let shared = Arc::new(SharedState {
            channels: ChannelBridge::new(),
            midi: MidiBridge::new(config.midi_queue_capacity, config.midi_output_capacity),
            inspector: SignalInspector::new(config.max_display_points),
            debugger: DebugBreakpointBridge::new(config.breakpoint_timeout),
            faults: FaultReport::default(),
            midi_output_overflows: AtomicU64::new(0),
            document_generation: AtomicU64::new(0),
            diagnostics: ArcSwap::from_pointee(String::new()),
        });
        Self {
            handle: EngineHandle::new(factory, config.engine_options.clone(), config.debug_mode),
            adapter: AudioCallbackAdapter::new(
                config.gui_refresh_rate,
                config.max_displays,
                config.max_display_points,
            ),
            config,
            shared,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle for the GUI side.
    pub fn controller(&self) -> ControlHandle {
        ControlHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Compile `text` and make it the active orchestra.
    ///
    /// On failure the previous orchestra keeps playing and the engine
    /// output is kept in [`diagnostics`](Self::diagnostics).
    pub fn load_document(&mut self, text: impl Into<String>) -> Result<(), CompileError> {
        let document = OrchestraDocument::parse(text);
        let result = self.handle.compile(document);
        self.store_diagnostics();
        let layout = result?;
        self.install(layout, false);
        let generation = self.shared.document_generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::info!(
            "orchestra compiled ({} channels, generation {})",
            self.handle.channel_count(),
            generation
        );
        Ok(())
    }

    /// Read a `.csd` file and [`load_document`](Self::load_document) it.
    pub fn load_csd_file(&mut self, path: &Path) -> Result<(), CompileError> {
        let text = std::fs::read_to_string(path).map_err(|source| CompileError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.load_document(text)
    }

    /// Size the engine for the host. May recompile the current orchestra
    /// at the host sample rate, keeping channel values.
    pub fn prepare_to_play(
        &mut self,
        sample_rate: f64,
        max_block_size: usize,
    ) -> Result<(), CompileError> {
        log::debug!("prepare_to_play: {} Hz, {} frames", sample_rate, max_block_size);
        let result = self.handle.prepare(sample_rate, max_block_size);
        self.store_diagnostics();
        if let Some(layout) = result? {
            self.install(layout, true);
        }
        self.adapter.rewind();
        Ok(())
    }

    /// Stop the engine. The orchestra is recompiled by the next
    /// [`prepare_to_play`](Self::prepare_to_play).
    pub fn release_resources(&mut self) {
        self.handle.release();
        self.shared.midi.inbound().clear();
        self.shared.midi.outbound().clear();
    }

    /// Rewind the score without recompiling.
    pub fn reset(&mut self) {
        if let Err(err) = self.handle.reset() {
            log::warn!("engine reset failed: {}", err);
            self.shared.faults.record(err);
        }
        self.adapter.rewind();
    }

    /// Process one block in place. `midi` carries host input on entry and
    /// engine output on return. Real-time safe.
    pub fn process_block(&mut self, audio: &mut [&mut [f32]], midi: &mut MidiBuffer) {
        self.run_block(audio, midi, None);
    }

    /// [`process_block`](Self::process_block) with host transport information.
    pub fn process_block_with_transport(
        &mut self,
        audio: &mut [&mut [f32]],
        midi: &mut MidiBuffer,
        transport: &Transport,
    ) {
        self.run_block(audio, midi, Some(transport));
    }

    fn run_block(
        &mut self,
        audio: &mut [&mut [f32]],
        midi: &mut MidiBuffer,
        transport: Option<&Transport>,
    ) {
        let shared = &*self.shared;
        self.adapter
            .process_block(&mut self.handle, &shared.bridges(), audio, midi, transport);
        if midi.has_overflowed() {
            shared.midi_output_overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serialize the orchestra and the current channel values.
    pub fn get_state_information(&self) -> Vec<u8> {
        let document = self
            .handle
            .document()
            .or_else(|| self.handle.retained_document())
            .map(|doc| doc.text().to_string())
            .unwrap_or_default();
        PluginState::new(document, self.shared.channels.current_values()).to_bytes()
    }

    /// Restore a blob from [`get_state_information`](Self::get_state_information).
    ///
    /// A different document is compiled first; channel values are staged
    /// for the next block. Values for channels the orchestra no longer has
    /// are skipped.
    pub fn set_state_information(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let state = PluginState::from_bytes(bytes)?;
        let current = self
            .handle
            .document()
            .or_else(|| self.handle.retained_document())
            .map(|doc| doc.text().to_string());
        if !state.document.is_empty() && current.as_deref() != Some(state.document.as_str()) {
            self.load_document(state.document)?;
        }
        for (name, value) in &state.channels {
            if let Err(err) = self.shared.channels.set_channel(name, *value) {
                log::debug!("skipping stored value: {}", err);
            }
        }
        Ok(())
    }

    /// Engine output from the last compile.
    pub fn diagnostics(&self) -> Arc<String> {
        self.shared.diagnostics.load_full()
    }

    pub fn is_compiled(&self) -> bool {
        self.handle.is_compiled()
    }

    pub fn input_channels(&self) -> usize {
        self.handle.input_channels()
    }

    pub fn output_channels(&self) -> usize {
        self.handle.output_channels()
    }

    pub fn channel_count(&self) -> usize {
        self.handle.channel_count()
    }

    pub fn accepts_midi(&self) -> bool {
        true
    }

    pub fn produces_midi(&self) -> bool {
        true
    }

    /// The statement that created table `number`, for display next to its scope.
    pub fn table_statement(&self, number: i32) -> Option<String> {
        self.handle
            .document()?
            .table_statement(number)
            .map(str::to_string)
    }

    fn install(&mut self, layout: ChannelLayout, keep_values: bool) {
        let previous = if keep_values {
            self.shared.channels.current_values()
        } else {
            Vec::new()
        };
        self.adapter.install(self.shared.channels.install(layout));
        self.shared.inspector.clear();
        for (name, value) in previous {
            if let Err(err) = self.shared.channels.set_channel(&name, value) {
                log::warn!("value not carried over to the new orchestra: {}", err);
            }
        }
    }

    fn store_diagnostics(&self) {
        self.shared
            .diagnostics
            .store(Arc::new(self.handle.diagnostics().to_string()));
    }
}

/// GUI-side access to a running processor. Cheap to clone; every call is
/// non-blocking.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<SharedState>,
}

impl ControlHandle {
    /// Stage a value for the next block.
    pub fn set_channel(&self, name: &str, value: f64) -> Result<(), ChannelError> {
        self.shared.channels.set_channel(name, value)
    }

    /// Value published by the last completed block.
    pub fn get_channel(&self, name: &str) -> Result<f64, ChannelError> {
        self.shared.channels.get_channel(name)
    }

    /// Like [`get_channel`](Self::get_channel), with 0 for unknown names.
    pub fn get_channel_or_default(&self, name: &str) -> f64 {
        self.shared.channels.get_channel_or_default(name)
    }

    pub fn get_channel_array(&self, name: &str) -> Result<Vec<f64>, ChannelError> {
        self.shared.channels.get_channel_array(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.shared.channels.channel_names()
    }

    /// Inject a MIDI event, as from an on-screen keyboard.
    pub fn send_midi(&self, event: MidiEvent) {
        self.shared.midi.push_input(event);
    }

    /// Events dropped by the host-to-engine queue.
    pub fn midi_input_dropped(&self) -> u64 {
        self.shared.midi.inbound().dropped()
    }

    /// Events dropped by the engine-to-host queue.
    pub fn midi_output_dropped(&self) -> u64 {
        self.shared.midi.outbound().dropped()
    }

    /// Blocks whose host MIDI output buffer filled up.
    pub fn midi_output_overflows(&self) -> u64 {
        self.shared.midi_output_overflows.load(Ordering::Relaxed)
    }

    pub fn resume_breakpoint(&self) {
        self.shared.debugger.resume();
    }

    /// Resume and stop pausing at breakpoints. Call on UI shutdown.
    pub fn detach_debugger(&self) {
        self.shared.debugger.detach();
    }

    pub fn attach_debugger(&self) {
        self.shared.debugger.attach();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.debugger.is_paused()
    }

    pub fn latest_breakpoint(&self) -> Option<Arc<BreakpointSnapshot>> {
        self.shared.debugger.latest()
    }

    pub fn poll_breakpoint(&self, seen: u64) -> Option<(u64, Arc<BreakpointSnapshot>)> {
        self.shared.debugger.poll(seen)
    }

    /// Queue a breakpoint edit, applied at the next block start.
    pub fn request_breakpoint(&self, request: BreakpointRequest) -> bool {
        self.shared.debugger.request(request)
    }

    pub fn breakpoint_timeouts(&self) -> u64 {
        self.shared.debugger.timeouts()
    }

    /// One-shot: true once after each inspector capture.
    pub fn should_refresh_displays(&self) -> bool {
        self.shared.inspector.should_refresh()
    }

    pub fn watch_table(&self, number: i32) {
        self.shared.inspector.watch_table(number);
    }

    pub fn unwatch_table(&self, number: i32) {
        self.shared.inspector.unwatch_table(number);
    }

    pub fn table_display(&self, number: i32) -> Option<Arc<SignalDisplay>> {
        self.shared.inspector.table_display(number)
    }

    /// Engine graph for `variable` of display `kind` ("fft", "waveform", ...).
    pub fn display(&self, variable: &str, kind: &str) -> Option<Arc<SignalDisplay>> {
        self.shared.inspector.display(variable, kind)
    }

    pub fn displays(&self) -> Vec<Arc<SignalDisplay>> {
        self.shared.inspector.displays()
    }

    /// Incremented on every successful compile of a new document.
    pub fn document_generation(&self) -> u64 {
        self.shared.document_generation.load(Ordering::Acquire)
    }

    pub fn document_changed_since(&self, seen: u64) -> bool {
        self.document_generation() != seen
    }

    /// Audio blocks that faulted and were silenced.
    pub fn fault_count(&self) -> u64 {
        self.shared.faults.count()
    }

    pub fn last_fault_code(&self) -> Option<i32> {
        self.shared.faults.last_code()
    }

    /// Engine output from the last compile.
    pub fn diagnostics(&self) -> Arc<String> {
        self.shared.diagnostics.load_full()
    }
}
