//! The real-time block protocol.
//!
//! [`AudioCallbackAdapter`] owns the audio-thread half of every bridge
//! (the channel publisher, display staging, scratch vectors) and runs the
//! per-block sequence:
//!
//! 1. apply queued breakpoint edits and host transport values;
//! 2. pull staged channel writes into the engine;
//! 3. queue host MIDI for the engine's read callback;
//! 4. map host audio into the engine layout, process, and map it back;
//! 5. hand engine MIDI output to the host;
//! 6. publish channel values;
//! 7. every `gui_refresh_rate` blocks, publish displays and capture tables.
//!
//! Everything here is allocation-free except step 7, which runs at the
//! throttled cadence.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::channel::{ChannelPublisher, StagedUpdate};
use crate::debug::{BreakpointSnapshot, DebugBreakpointBridge, DebugCommand};
use crate::engine::{DisplayFrame, EngineFactory, EngineHost};
use crate::error::EngineRuntimeError;
use crate::handle::EngineHandle;
use crate::inspector::{DisplayStaging, SignalInspector};
use crate::midi::{MidiBridge, MidiBuffer, MidiEvent};
use crate::transport::Transport;

/// Audio-thread faults, readable from the control plane.
#[derive(Debug, Default)]
pub struct FaultReport {
    count: AtomicU64,
    last_code: AtomicI32,
}

impl FaultReport {
    pub fn record(&self, error: EngineRuntimeError) {
        self.last_code.store(error.code(), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Faulted blocks since creation.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Engine code of the most recent fault.
    pub fn last_code(&self) -> Option<i32> {
        (self.count() > 0).then(|| self.last_code.load(Ordering::Relaxed))
    }
}

/// Bridges shared between the audio thread and the control plane.
pub struct Bridges<'a> {
    pub midi: &'a MidiBridge,
    pub inspector: &'a SignalInspector,
    pub debugger: &'a DebugBreakpointBridge,
    pub faults: &'a FaultReport,
}

/// Engine callbacks for one block, confined to the bridges.
struct BlockHost<'a> {
    midi: &'a MidiBridge,
    pending_midi: &'a mut Option<MidiEvent>,
    staging: &'a mut DisplayStaging,
    debugger: &'a DebugBreakpointBridge,
}

impl EngineHost for BlockHost<'_> {
    fn read_midi(&mut self, buf: &mut [u8]) -> usize {
        self.midi.read_bytes(self.pending_midi, buf)
    }

    fn write_midi(&mut self, bytes: &[u8]) -> usize {
        self.midi.write_bytes(bytes, 0)
    }

    fn make_display(&mut self, id: usize, caption: &str) {
        self.staging.make(id, caption);
    }

    fn draw_display(&mut self, frame: &DisplayFrame<'_>) {
        self.staging.draw(frame);
    }

    fn kill_display(&mut self, id: usize) {
        self.staging.kill(id);
    }

    fn breakpoint(&mut self, snapshot: BreakpointSnapshot) -> DebugCommand {
        self.debugger.on_breakpoint(snapshot)
    }
}

/// Audio-thread state for the block protocol.
pub struct AudioCallbackAdapter {
    publisher: Option<ChannelPublisher>,
    staged: Vec<StagedUpdate>,
    outputs: Vec<f64>,
    staging: DisplayStaging,
    pending_midi: Option<MidiEvent>,
    refresh_rate: u32,
    blocks_since_refresh: u32,
    sample_position: u64,
}

impl AudioCallbackAdapter {
    pub fn new(refresh_rate: u32, max_displays: usize, max_display_points: usize) -> Self {
        Self {
            publisher: None,
            staged: Vec::new(),
            outputs: Vec::new(),
            staging: DisplayStaging::new(max_displays, max_display_points),
            pending_midi: None,
            refresh_rate: refresh_rate.max(1),
            blocks_since_refresh: 0,
            sample_position: 0,
        }
    }

    /// Switch to a newly installed channel set. Control plane only.
    pub fn install(&mut self, publisher: ChannelPublisher) {
        let layout = publisher.layout();
        self.staged = Vec::with_capacity(layout.len());
        self.outputs = layout.default_values();
        self.publisher = Some(publisher);
        self.staging.reset();
        self.pending_midi = None;
        self.blocks_since_refresh = 0;
    }

    /// Samples processed since creation, or since the last `rewind`.
    pub fn sample_position(&self) -> u64 {
        self.sample_position
    }

    pub fn rewind(&mut self) {
        self.sample_position = 0;
    }

    /// Run one host block.
    ///
    /// `audio` is processed in place. `midi` carries host input on entry and
    /// the engine's output on return. Engine faults silence the block and are
    /// recorded in `bridges.faults`.
    pub fn process_block<F: EngineFactory>(
        &mut self,
        handle: &mut EngineHandle<F>,
        bridges: &Bridges<'_>,
        audio: &mut [&mut [f32]],
        midi: &mut MidiBuffer,
        transport: Option<&Transport>,
    ) {
        let frames = audio.iter().map(|ch| ch.len()).min().unwrap_or(0);

        if !handle.is_compiled() || !handle.is_prepared() {
            for ch in audio.iter_mut() {
                ch.fill(0.0);
            }
            midi.clear();
            self.sample_position += frames as u64;
            return;
        }

        // 1. debugger edits and transport
        bridges
            .debugger
            .drain_requests(|request| handle.apply_breakpoint(request));
        let sample_rate = handle.sample_rate().unwrap_or(0.0);
        let transport = transport.copied().unwrap_or_default();
        handle.set_transport(&transport.channel_values(sample_rate, self.sample_position));

        // 2. staged channel writes
        if let Some(publisher) = &self.publisher {
            publisher.pull_staged_updates(&mut self.staged);
            for update in &self.staged {
                handle.set_channel(update.index, update.value);
            }
        }

        // 3. host MIDI in, in arrival order
        for event in midi.iter() {
            bridges.midi.push_input(*event);
        }
        midi.clear();

        // 4. audio
        let chunk = handle.max_block_size().max(1);
        let mut offset = 0;
        while offset < frames {
            let len = chunk.min(frames - offset);
            handle.buffers_mut().load_inputs(audio, offset, len);
            let mut host = BlockHost {
                midi: bridges.midi,
                pending_midi: &mut self.pending_midi,
                staging: &mut self.staging,
                debugger: bridges.debugger,
            };
            if let Err(err) = handle.process(len, &mut host) {
                bridges.faults.record(err);
            }
            handle.buffers().store_outputs(audio, offset, len);
            offset += len;
        }

        // 5. engine MIDI out
        while let Some(event) = bridges.midi.outbound().pop() {
            if !midi.push(event) {
                break;
            }
        }

        // 6. channel values
        if let Some(publisher) = self.publisher.as_mut() {
            handle.collect_outputs(&mut self.outputs);
            publisher.publish_outputs(&self.outputs);
        }

        // 7. throttled inspector capture
        self.blocks_since_refresh += 1;
        if self.blocks_since_refresh >= self.refresh_rate {
            self.blocks_since_refresh = 0;
            bridges.inspector.publish_staged(&mut self.staging);
            bridges.inspector.capture_watched(&*handle);
            bridges.inspector.mark_refreshed();
        }

        self.sample_position += frames as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBridge;
    use crate::document::OrchestraDocument;
    use crate::engine::EngineFactory;
    use crate::test_engine::{scripted_factory, ScriptedEngine, CSD};
    use std::time::Duration;

    struct Rig<F: EngineFactory> {
        handle: EngineHandle<F>,
        adapter: AudioCallbackAdapter,
        channels: ChannelBridge,
        midi: MidiBridge,
        inspector: SignalInspector,
        debugger: DebugBreakpointBridge,
        faults: FaultReport,
    }

    impl<F: EngineFactory> Rig<F> {
        fn run(&mut self, audio: &mut [&mut [f32]], midi: &mut MidiBuffer) {
            let bridges = Bridges {
                midi: &self.midi,
                inspector: &self.inspector,
                debugger: &self.debugger,
                faults: &self.faults,
            };
            self.adapter
                .process_block(&mut self.handle, &bridges, audio, midi, None);
        }

        fn run_silent(&mut self, frames: usize) {
            let mut left = vec![0.0f32; frames];
            let mut right = vec![0.0f32; frames];
            let mut audio: [&mut [f32]; 2] = [&mut left, &mut right];
            let mut midi = MidiBuffer::with_capacity(16);
            self.run(&mut audio, &mut midi);
        }
    }

    fn rig(refresh_rate: u32) -> Rig<impl EngineFactory<Engine = ScriptedEngine>> {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        handle.prepare(44100.0, 16).unwrap();
        let layout = handle.compile(OrchestraDocument::parse(CSD)).unwrap();
        let channels = ChannelBridge::new();
        let mut adapter = AudioCallbackAdapter::new(refresh_rate, 4, 64);
        adapter.install(channels.install(layout));
        Rig {
            handle,
            adapter,
            channels,
            midi: MidiBridge::new(16, 16),
            inspector: SignalInspector::new(64),
            debugger: DebugBreakpointBridge::new(Duration::from_millis(10)),
            faults: FaultReport::default(),
        }
    }

    #[test]
    fn test_channel_round_trip_through_block() {
        let mut rig = rig(50);
        assert_eq!(rig.channels.get_channel("gain").unwrap(), 0.5);
        rig.channels.set_channel("gain", 0.8).unwrap();
        assert_eq!(rig.channels.get_channel("gain").unwrap(), 0.5);
        rig.run_silent(16);
        assert_eq!(rig.channels.get_channel("gain").unwrap(), 0.8);
        // 16 frames at ksmps 4, first k-cycle performed at frame 4
        assert_eq!(rig.channels.get_channel("meter").unwrap(), 3.0);
    }

    #[test]
    fn test_no_read_ahead() {
        let mut rig = rig(50);
        for n in 1..=20 {
            rig.channels.set_channel("gain", n as f64).unwrap();
            rig.run_silent(8);
            rig.channels.set_channel("gain", -1.0).unwrap();
            assert_eq!(rig.channels.get_channel("gain").unwrap(), n as f64);
        }
    }

    #[test]
    fn test_audio_mapping_to_fewer_host_channels() {
        let mut rig = rig(50);
        rig.channels.set_channel("gain", 1.0).unwrap();
        let mut mono = vec![1.0f32; 16];
        let mut audio: [&mut [f32]; 1] = [&mut mono];
        let mut midi = MidiBuffer::with_capacity(4);
        rig.run(&mut audio, &mut midi);
        assert_eq!(&mono[..4], &[0.0; 4]);
        assert_eq!(&mono[4..], &[1.0; 12]);
    }

    #[test]
    fn test_extra_host_channels_are_zeroed() {
        let mut rig = rig(50);
        let mut chans = vec![vec![1.0f32; 8]; 3];
        let mut audio: Vec<&mut [f32]> = chans.iter_mut().map(|c| c.as_mut_slice()).collect();
        let mut midi = MidiBuffer::with_capacity(4);
        rig.run(&mut audio, &mut midi);
        assert_eq!(chans[2], vec![0.0; 8]);
    }

    #[test]
    fn test_blocks_longer_than_prepared_are_split() {
        let mut rig = rig(50);
        rig.run_silent(40);
        assert_eq!(rig.adapter.sample_position(), 40);
        // k-cycles at frames 4, 8, ..., 36
        assert_eq!(rig.channels.get_channel("meter").unwrap(), 9.0);
    }

    #[test]
    fn test_midi_passes_through_engine() {
        let mut rig = rig(50);
        let mut midi = MidiBuffer::with_capacity(8);
        midi.push(MidiEvent::note_on(0, 60, 100));
        midi.push(MidiEvent::note_off(0, 60, 0));
        let mut left = vec![0.0f32; 8];
        let mut audio: [&mut [f32]; 1] = [&mut left];
        rig.run(&mut audio, &mut midi);
        let out: Vec<Vec<u8>> = midi.iter().map(|e| e.bytes().to_vec()).collect();
        assert_eq!(out, vec![vec![0x90, 60, 100], vec![0x80, 60, 0]]);
    }

    #[test]
    fn test_runtime_fault_is_recorded_and_silenced() {
        let mut rig = rig(50);
        rig.channels.set_channel("fail", 1.0).unwrap();
        let mut left = vec![1.0f32; 8];
        let mut audio: [&mut [f32]; 1] = [&mut left];
        let mut midi = MidiBuffer::with_capacity(4);
        rig.run(&mut audio, &mut midi);
        assert_eq!(left, vec![0.0; 8]);
        assert_eq!(rig.faults.count(), 1);
        assert_eq!(rig.faults.last_code(), Some(-1));
    }

    #[test]
    fn test_inspector_capture_is_throttled() {
        let mut rig = rig(3);
        rig.inspector.watch_table(1);
        rig.run_silent(8);
        rig.run_silent(8);
        assert!(!rig.inspector.should_refresh());
        rig.run_silent(8);
        assert!(rig.inspector.should_refresh());
        assert!(!rig.inspector.should_refresh());
        assert_eq!(rig.inspector.table_display(1).unwrap().points, vec![1.0; 8]);
        assert!(rig.inspector.display("aSig", "fft").is_some());
    }

    #[test]
    fn test_breakpoint_requests_reach_engine() {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), true);
        handle.prepare(44100.0, 16).unwrap();
        let layout = handle.compile(OrchestraDocument::parse(CSD)).unwrap();
        let channels = ChannelBridge::new();
        let mut adapter = AudioCallbackAdapter::new(50, 4, 64);
        adapter.install(channels.install(layout));
        let mut rig = Rig {
            handle,
            adapter,
            channels,
            midi: MidiBridge::new(16, 16),
            inspector: SignalInspector::new(64),
            debugger: DebugBreakpointBridge::new(Duration::from_millis(1)),
            faults: FaultReport::default(),
        };
        rig.debugger.detach();
        rig.debugger.request(crate::debug::BreakpointRequest::SetInstrument {
            instrument: 1.0,
            skip: 0,
        });
        rig.run_silent(8);
        let snapshot = rig.debugger.latest().unwrap();
        assert_eq!(snapshot.instrument, 1.0);
        assert_eq!(snapshot.kcounter, 1);
    }

    #[test]
    fn test_unprepared_handle_outputs_silence() {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        handle.compile(OrchestraDocument::parse(CSD)).unwrap();
        let mut adapter = AudioCallbackAdapter::new(50, 1, 8);
        let midi = MidiBridge::new(4, 4);
        let inspector = SignalInspector::new(8);
        let debugger = DebugBreakpointBridge::new(Duration::from_millis(1));
        let faults = FaultReport::default();
        let bridges = Bridges {
            midi: &midi,
            inspector: &inspector,
            debugger: &debugger,
            faults: &faults,
        };
        let mut left = vec![1.0f32; 4];
        let mut audio: [&mut [f32]; 1] = [&mut left];
        let mut host_midi = MidiBuffer::with_capacity(4);
        adapter.process_block(&mut handle, &bridges, &mut audio, &mut host_midi, None);
        assert_eq!(left, vec![0.0; 4]);
    }
}
