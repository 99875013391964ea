//! Lifecycle of one embedded engine.
//!
//! [`EngineHandle`] compiles documents into fresh engine instances and only
//! swaps a new instance in once it compiled and started, so a failed compile
//! never disturbs the running one. Without any successful compile the
//! handle outputs silence.
//!
//! The handle is not shared. Control-plane operations (`compile`,
//! `prepare`, `release`, `reset`) take `&mut self` and therefore cannot
//! overlap `process`, which mirrors the host's guarantee that
//! `prepareToPlay`/`releaseResources` never run concurrently with audio.

use std::sync::Arc;

use crate::buffers::BlockBuffers;
use crate::channel::ChannelLayout;
use crate::debug::BreakpointRequest;
use crate::document::{ChannelDirection, ChannelRate, OrchestraDocument};
use crate::engine::{
    ChannelSlot, CompileSettings, Engine, EngineFactory, EngineHost, PerformStatus,
};
use crate::error::{CompileError, EngineRuntimeError};
use crate::inspector::TableSource;
use crate::transport;

/// Host audio configuration from `prepare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrepareSpec {
    pub sample_rate: f64,
    pub max_block_size: usize,
}

/// Where a layout channel lives in the engine and in the published vector.
#[derive(Debug, Clone, Copy)]
struct BoundChannel {
    slot: Option<ChannelSlot>,
    rate: ChannelRate,
    offset: usize,
    len: usize,
}

struct ActiveEngine<E> {
    engine: E,
    document: Arc<OrchestraDocument>,
    compiled_rate: Option<f64>,
    bindings: Vec<BoundChannel>,
    transport_slots: [Option<ChannelSlot>; 8],
    ksmps: usize,
    inputs: usize,
    outputs: usize,
    scale: f64,
    // Frames of the current k-cycle already exchanged with spin/spout.
    position: usize,
    finished: bool,
}

impl<E: Engine> ActiveEngine<E> {
    /// Bind every document and engine channel and build the layout.
    fn bind(
        mut engine: E,
        document: Arc<OrchestraDocument>,
        compiled_rate: Option<f64>,
    ) -> (Self, ChannelLayout) {
        let ksmps = engine.ksmps().max(1);

        let mut declared: Vec<(String, ChannelRate, ChannelDirection, f64)> = document
            .channel_declarations()
            .into_iter()
            .map(|d| (d.name, d.rate, d.direction, d.default_value))
            .collect();
        for info in engine.channels() {
            match declared.iter_mut().find(|(name, ..)| *name == info.name) {
                Some(existing) => existing.2 = existing.2.merge(info.direction),
                None => declared.push((info.name, info.rate, info.direction, info.default_value)),
            }
        }
        let layout = ChannelLayout::new(declared, ksmps);

        let mut bindings = Vec::with_capacity(layout.len());
        for spec in layout.specs() {
            let slot = engine.bind_channel(&spec.name, spec.rate);
            if slot.is_none() {
                log::warn!("engine could not bind channel '{}'", spec.name);
            }
            if let (Some(slot), ChannelRate::Control) = (slot, spec.rate) {
                if spec.direction.accepts_input() {
                    engine.set_control(slot, spec.default_value);
                }
            }
            bindings.push(BoundChannel {
                slot,
                rate: spec.rate,
                offset: spec.offset,
                len: spec.len,
            });
        }

        let mut transport_slots = [None; 8];
        for (slot, name) in transport_slots.iter_mut().zip(transport::channels::ALL) {
            if layout.index_of(name).is_some() || document.text().contains(name) {
                *slot = engine.bind_channel(name, ChannelRate::Control);
            }
        }

        let zero_dbfs = engine.zero_dbfs();
        let active = Self {
            inputs: engine.input_channels(),
            outputs: engine.output_channels(),
            scale: if zero_dbfs > 0.0 { zero_dbfs } else { 1.0 },
            engine,
            document,
            compiled_rate,
            bindings,
            transport_slots,
            ksmps,
            position: 0,
            finished: false,
        };
        (active, layout)
    }
}

/// Owner of the active engine instance and its buffers.
pub struct EngineHandle<F: EngineFactory> {
    factory: F,
    options: Vec<String>,
    debug: bool,
    active: Option<ActiveEngine<F::Engine>>,
    retained: Option<Arc<OrchestraDocument>>,
    prepared: Option<PrepareSpec>,
    buffers: BlockBuffers,
    diagnostics: String,
}

impl<F: EngineFactory> EngineHandle<F> {
    /// An uncompiled handle. `options` are passed to every compile.
    pub fn new(factory: F, options: Vec<String>, debug: bool) -> Self {
        Self {
            factory,
            options,
            debug,
            active: None,
            retained: None,
            prepared: None,
            buffers: BlockBuffers::new(),
            diagnostics: String::new(),
        }
    }

    /// Compile `document` into a fresh engine and make it active.
    ///
    /// On failure the previously active engine (if any) keeps running and
    /// the engine's console output is available from
    /// [`diagnostics`](Self::diagnostics).
    pub fn compile(&mut self, document: OrchestraDocument) -> Result<ChannelLayout, CompileError> {
        let spec = self.prepared;
        self.compile_shared(Arc::new(document), spec)
    }

    /// Compile against `spec`. Nothing on `self` changes unless the
    /// compile succeeds.
    fn compile_shared(
        &mut self,
        document: Arc<OrchestraDocument>,
        spec: Option<PrepareSpec>,
    ) -> Result<ChannelLayout, CompileError> {
        if !document.has_orchestra() {
            self.diagnostics = CompileError::MissingOrchestra.to_string();
            return Err(CompileError::MissingOrchestra);
        }
        let settings = CompileSettings {
            sample_rate: spec.map(|p| p.sample_rate),
            options: self.options.clone(),
            debug: self.debug,
        };

        let mut engine = self.factory.create()?;
        let result = engine.compile(&document, &settings);
        self.diagnostics = engine.take_messages();
        if let Err(mut err) = result {
            if let CompileError::Rejected { diagnostics, .. }
            | CompileError::StartFailed { diagnostics, .. } = &mut err
            {
                if diagnostics.is_empty() {
                    diagnostics.clone_from(&self.diagnostics);
                }
            }
            log::error!("{}\n{}", err, err.diagnostics());
            return Err(err);
        }

        let (active, layout) = ActiveEngine::bind(engine, Arc::clone(&document), settings.sample_rate);
        if let Some(spec) = spec {
            self.buffers = BlockBuffers::allocate(active.inputs, active.outputs, spec.max_block_size);
        }
        log::debug!(
            "compiled orchestra: {} in / {} out, ksmps {}, {} channels",
            active.inputs,
            active.outputs,
            active.ksmps,
            layout.len()
        );
        self.active = Some(active);
        self.retained = Some(document);
        self.prepared = spec;
        Ok(layout)
    }

    /// Size the buffers for the host configuration.
    ///
    /// If the retained document was compiled at another sample rate (or was
    /// released), it is recompiled here and the new layout is returned. A
    /// failed recompile leaves the previous configuration in effect.
    pub fn prepare(
        &mut self,
        sample_rate: f64,
        max_block_size: usize,
    ) -> Result<Option<ChannelLayout>, CompileError> {
        let spec = PrepareSpec {
            sample_rate,
            max_block_size,
        };

        let needs_compile = match &self.active {
            Some(active) => active.compiled_rate != Some(sample_rate),
            None => self.retained.is_some(),
        };
        if needs_compile {
            if let Some(document) = self.retained.clone() {
                return self.compile_shared(document, Some(spec)).map(Some);
            }
        }

        self.prepared = Some(spec);

        let (inputs, outputs) = self
            .active
            .as_ref()
            .map_or((0, 0), |a| (a.inputs, a.outputs));
        self.buffers = BlockBuffers::allocate(inputs, outputs, max_block_size);
        if let Some(active) = self.active.as_mut() {
            active.position = 0;
        }
        Ok(None)
    }

    /// Stop the engine and free its buffers. The document is kept so the
    /// next `prepare` can recompile it. Idempotent.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            log::debug!("releasing engine");
            self.retained = Some(active.document);
        }
        self.prepared = None;
        self.buffers = BlockBuffers::new();
    }

    /// Rewind the performance without recompiling.
    pub fn reset(&mut self) -> Result<(), EngineRuntimeError> {
        if let Some(active) = self.active.as_mut() {
            active.engine.reset()?;
            active.position = 0;
            active.finished = false;
        }
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some() && self.buffers.is_allocated()
    }

    /// Whether the score of the active engine has ended.
    pub fn is_finished(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.finished)
    }

    /// Engine console output from the last compile.
    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// Document of the active engine.
    pub fn document(&self) -> Option<&Arc<OrchestraDocument>> {
        self.active.as_ref().map(|a| &a.document)
    }

    /// Document that the next `prepare` would recompile.
    pub fn retained_document(&self) -> Option<&Arc<OrchestraDocument>> {
        self.retained.as_ref()
    }

    pub fn input_channels(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.inputs)
    }

    pub fn output_channels(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.outputs)
    }

    pub fn ksmps(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.ksmps)
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.engine.sample_rate())
    }

    /// Number of channels in the active layout.
    pub fn channel_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.bindings.len())
    }

    pub fn max_block_size(&self) -> usize {
        self.buffers.max_frames()
    }

    pub(crate) fn buffers_mut(&mut self) -> &mut BlockBuffers {
        &mut self.buffers
    }

    pub(crate) fn buffers(&self) -> &BlockBuffers {
        &self.buffers
    }

    /// Push a staged value into the engine. Real-time safe.
    pub fn set_channel(&mut self, index: usize, value: f64) {
        if let Some(active) = self.active.as_mut() {
            if let Some(BoundChannel {
                slot: Some(slot),
                rate: ChannelRate::Control,
                ..
            }) = active.bindings.get(index)
            {
                active.engine.set_control(*slot, value);
            }
        }
    }

    /// Write host transport values into the reserved channels. Real-time safe.
    pub fn set_transport(&mut self, values: &[f64; 8]) {
        if let Some(active) = self.active.as_mut() {
            for (slot, &value) in active.transport_slots.iter().zip(values) {
                if let Some(slot) = slot {
                    active.engine.set_control(*slot, value);
                }
            }
        }
    }

    /// Read every channel into `out`, laid out like the channel layout.
    /// Real-time safe.
    pub fn collect_outputs(&self, out: &mut [f64]) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        for bound in &active.bindings {
            let Some(slot) = bound.slot else {
                continue;
            };
            let Some(dst) = out.get_mut(bound.offset..bound.offset + bound.len) else {
                continue;
            };
            match bound.rate {
                ChannelRate::Control => dst[0] = active.engine.control(slot),
                ChannelRate::Audio => active.engine.read_audio_channel(slot, dst),
            }
        }
    }

    pub fn apply_breakpoint(&mut self, request: &BreakpointRequest) {
        if let Some(active) = self.active.as_mut() {
            active.engine.apply_breakpoint(request);
        }
    }

    /// Run the engine over the first `frames` samples of the block buffers.
    ///
    /// Fills spin from the input buffers and output buffers from spout,
    /// performing a k-cycle whenever ksmps frames have been exchanged. The
    /// k-cycle position carries over between calls. Without an engine, or
    /// after the score ended, the output is silence. An engine fault zeroes
    /// the whole block and is returned for reporting.
    ///
    /// Real-time safe.
    pub fn process(
        &mut self,
        frames: usize,
        host: &mut dyn EngineHost,
    ) -> Result<(), EngineRuntimeError> {
        let frames = frames.min(self.buffers.max_frames());
        let Some(active) = self.active.as_mut() else {
            self.buffers.clear_outputs(frames);
            return Ok(());
        };
        if active.finished {
            self.buffers.clear_outputs(frames);
            return Ok(());
        }

        let (ksmps, nin, nout, scale) = (active.ksmps, active.inputs, active.outputs, active.scale);
        for i in 0..frames {
            if active.position == ksmps {
                active.position = 0;
                match active.engine.perform_ksmps(host) {
                    Ok(PerformStatus::Continue) => {}
                    Ok(PerformStatus::Finished) => {
                        active.finished = true;
                        for out in &mut self.buffers.outputs {
                            out[i..frames].fill(0.0);
                        }
                        return Ok(());
                    }
                    Err(err) => {
                        self.buffers.clear_outputs(frames);
                        return Err(err);
                    }
                }
            }

            let pos = active.position;
            let spin = active.engine.spin_mut();
            for (ch, input) in self.buffers.inputs.iter().enumerate().take(nin) {
                if let Some(s) = spin.get_mut(pos * nin + ch) {
                    *s = input[i] * scale;
                }
            }
            let spout = active.engine.spout();
            for (ch, output) in self.buffers.outputs.iter_mut().enumerate().take(nout) {
                output[i] = spout.get(pos * nout + ch).map_or(0.0, |&s| s / scale);
            }
            active.position += 1;
        }
        Ok(())
    }
}

impl<F: EngineFactory> TableSource for EngineHandle<F> {
    fn table(&self, number: i32) -> Option<&[f64]> {
        self.active.as_ref()?.engine.table(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullHost;
    use crate::error::EngineError;
    use crate::test_engine::{scripted_factory, ScriptedEngine, CSD, FAILING_CSD};
    use std::sync::atomic::Ordering;

    fn prepared_handle() -> EngineHandle<impl EngineFactory<Engine = ScriptedEngine>> {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, vec!["-n".to_string()], false);
        handle.prepare(44100.0, 64).unwrap();
        handle.compile(OrchestraDocument::parse(CSD)).unwrap();
        handle
    }

    #[test]
    fn test_uncompiled_outputs_silence() {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        handle.prepare(44100.0, 8).unwrap();
        assert!(!handle.is_compiled());
        handle.buffers_mut().outputs.push(vec![1.0; 8]);
        handle.process(8, &mut NullHost).unwrap();
        assert_eq!(handle.buffers().outputs[0], vec![0.0; 8]);
    }

    #[test]
    fn test_compile_reports_channels() {
        let handle = prepared_handle();
        assert!(handle.is_compiled());
        assert_eq!(handle.channel_count(), 3);
        assert_eq!(handle.input_channels(), 2);
        assert_eq!(handle.output_channels(), 2);
        assert_eq!(handle.ksmps(), Some(4));
    }

    #[test]
    fn test_failed_compile_keeps_previous_engine() {
        let mut handle = prepared_handle();
        let err = handle
            .compile(OrchestraDocument::parse(FAILING_CSD))
            .unwrap_err();
        assert!(matches!(err, CompileError::Rejected { .. }));
        assert!(err.diagnostics().contains("syntax error"));
        assert!(handle.diagnostics().contains("syntax error"));

        assert!(handle.is_compiled());
        assert_eq!(handle.channel_count(), 3);
        assert_eq!(handle.document().unwrap().text(), CSD);
    }

    #[test]
    fn test_failed_first_compile_stays_uncompiled() {
        let (factory, _) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        assert!(handle.compile(OrchestraDocument::parse(FAILING_CSD)).is_err());
        assert!(!handle.is_compiled());
        assert_eq!(handle.channel_count(), 0);
    }

    #[test]
    fn test_missing_orchestra() {
        let (factory, created) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        assert!(matches!(
            handle.compile(OrchestraDocument::parse("<Cabbage></Cabbage>")),
            Err(CompileError::MissingOrchestra)
        ));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_process_scales_and_delays_by_ksmps() {
        let mut handle = prepared_handle();
        for (ch, input) in handle.buffers_mut().inputs.iter_mut().enumerate() {
            for (i, s) in input.iter_mut().enumerate() {
                *s = (i + ch) as f64;
            }
        }
        handle.process(12, &mut NullHost).unwrap();
        let out = &handle.buffers().outputs[0];
        // gain defaults to 0.5 and output lags input by one k-cycle (4 frames)
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(&out[4..12], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5]);
        assert_eq!(handle.buffers().outputs[1][4], 0.5);
    }

    #[test]
    fn test_position_carries_across_blocks() {
        let mut handle = prepared_handle();
        handle.buffers_mut().inputs[0][..6].fill(1.0);
        handle.process(6, &mut NullHost).unwrap();
        handle.buffers_mut().inputs[0][..6].fill(1.0);
        handle.process(6, &mut NullHost).unwrap();
        // frames 4..8 of the stream are the first k-cycle's output
        assert_eq!(&handle.buffers().outputs[0][..2], &[0.5, 0.5]);
    }

    #[test]
    fn test_prepare_at_new_rate_recompiles() {
        let (factory, created) = scripted_factory();
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        handle.compile(OrchestraDocument::parse(CSD)).unwrap();
        assert_eq!(handle.sample_rate(), Some(44100.0));

        let layout = handle.prepare(48000.0, 32).unwrap();
        assert!(layout.is_some());
        assert_eq!(handle.sample_rate(), Some(48000.0));
        assert_eq!(created.load(Ordering::SeqCst), 2);

        assert!(handle.prepare(48000.0, 64).unwrap().is_none());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(handle.max_block_size(), 64);
    }

    #[test]
    fn test_failed_recompile_keeps_previous_configuration() {
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory = move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ScriptedEngine::new())
            } else {
                Err(EngineError::CreateFailed)
            }
        };
        let mut handle = EngineHandle::new(factory, Vec::new(), false);
        handle.prepare(44100.0, 64).unwrap();
        handle.compile(OrchestraDocument::parse(CSD)).unwrap();

        assert!(handle.prepare(48000.0, 16).is_err());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(handle.is_prepared());
        assert_eq!(handle.prepared, Some(PrepareSpec { sample_rate: 44100.0, max_block_size: 64 }));
        assert_eq!(handle.sample_rate(), Some(44100.0));
        assert_eq!(handle.max_block_size(), 64);

        handle.buffers_mut().inputs[0].fill(1.0);
        assert!(handle.process(64, &mut NullHost).is_ok());
    }

    #[test]
    fn test_release_is_idempotent_and_retains_document() {
        let mut handle = prepared_handle();
        handle.release();
        handle.release();
        assert!(!handle.is_compiled());
        assert!(!handle.is_prepared());
        assert!(handle.retained_document().is_some());

        let layout = handle.prepare(44100.0, 64).unwrap();
        assert_eq!(layout.map(|l| l.len()), Some(3));
        assert!(handle.is_compiled());
    }

    #[test]
    fn test_runtime_fault_zeroes_block() {
        let mut handle = prepared_handle();
        handle.buffers_mut().inputs[0].fill(1.0);
        handle.process(8, &mut NullHost).unwrap();
        handle.set_channel(2, 1.0); // "fail"
        let err = handle.process(8, &mut NullHost).unwrap_err();
        assert_eq!(err, EngineRuntimeError::PerformFailed(-1));
        assert!(handle.buffers().outputs[0][..8].iter().all(|&s| s == 0.0));

        handle.set_channel(2, 0.0);
        assert!(handle.process(8, &mut NullHost).is_ok());
    }

    #[test]
    fn test_collect_outputs_reads_engine_values() {
        let mut handle = prepared_handle();
        handle.set_channel(0, 0.25);
        let mut out = vec![0.0; 3];
        handle.collect_outputs(&mut out);
        assert_eq!(out, vec![0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_table_source() {
        let handle = prepared_handle();
        assert_eq!(handle.table(1).map(<[f64]>::len), Some(8));
        assert!(handle.table(2).is_none());
    }
}
