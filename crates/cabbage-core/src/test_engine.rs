//! Scripted engine for tests.
//!
//! Behaves like a tiny orchestra: output is input times the `gain`
//! channel, delayed by one k-cycle through spin/spout. It echoes MIDI
//! input to MIDI output, counts k-cycles into `meter`, and draws its
//! output to display 1. Setting `fail` makes the next k-cycle fail, and
//! setting `stop` ends the score. A document containing `ERROR` does not
//! compile.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::debug::{BreakpointRequest, BreakpointSnapshot, VariableBinding, VariableValue};
use crate::document::{ChannelRate, OrchestraDocument};
use crate::engine::{
    ChannelSlot, CompileSettings, DisplayFrame, Engine, EngineChannelInfo, EngineFactory,
    EngineHost, PerformStatus,
};
use crate::error::{CompileError, EngineError, EngineRuntimeError};

pub const CSD: &str = r#"<Cabbage>
form caption("Test") size(200, 100), pluginid("tst1")
hslider bounds(0, 0, 100, 20), channel("gain"), range(0, 1, 0.5)
</Cabbage>
<CsoundSynthesizer>
<CsOptions>
-n -d
</CsOptions>
<CsInstruments>
sr = 44100
ksmps = 4
nchnls = 2
0dbfs = 1

chn_k "meter", 2
chn_k "fail", 1
giTab ftgen 1, 0, 8, 10, 1

instr 1
endin
</CsInstruments>
<CsScore>
i1 0 z
</CsScore>
</CsoundSynthesizer>
"#;

pub const ALT_CSD: &str = r#"<Cabbage>
form caption("Filter"), pluginid("flt1")
rslider bounds(0, 0, 60, 60), channel("cutoff"), range(20, 20000, 1000)
</Cabbage>
<CsoundSynthesizer>
<CsInstruments>
sr = 44100
ksmps = 8
nchnls = 1
0dbfs = 1

instr 1
endin
</CsInstruments>
</CsoundSynthesizer>
"#;

pub const FAILING_CSD: &str = r#"<Cabbage>
form caption("Broken")
rslider channel("broken"), range(0, 1, 0)
</Cabbage>
<CsoundSynthesizer>
<CsInstruments>
ksmps = 4
instr 1
ERROR
endin
</CsInstruments>
</CsoundSynthesizer>
"#;

pub struct ScriptedEngine {
    document: Option<OrchestraDocument>,
    sample_rate: f64,
    ksmps: usize,
    inputs: usize,
    outputs: usize,
    zero_dbfs: f64,
    values: Vec<(String, f64)>,
    spin: Vec<f64>,
    spout: Vec<f64>,
    tables: Vec<(i32, Vec<f64>)>,
    messages: String,
    kcycles: u64,
    debug: bool,
    instrument_breakpoint: Option<f64>,
    display_made: bool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            document: None,
            sample_rate: 44100.0,
            ksmps: 1,
            inputs: 0,
            outputs: 0,
            zero_dbfs: 1.0,
            values: Vec::new(),
            spin: Vec::new(),
            spout: Vec::new(),
            tables: Vec::new(),
            messages: String::new(),
            kcycles: 0,
            debug: false,
            instrument_breakpoint: None,
            display_made: false,
        }
    }

    fn value(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn set_value(&mut self, name: &str, value: f64) {
        if let Some(entry) = self.values.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        }
    }
}

/// A factory counting the engines it creates.
pub fn scripted_factory() -> (
    impl EngineFactory<Engine = ScriptedEngine>,
    Arc<AtomicUsize>,
) {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let factory = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, EngineError>(ScriptedEngine::new())
    };
    (factory, created)
}

impl Engine for ScriptedEngine {
    fn compile(
        &mut self,
        document: &OrchestraDocument,
        settings: &CompileSettings,
    ) -> Result<(), CompileError> {
        if document.text().contains("ERROR") {
            self.messages = "error: syntax error, unexpected T_IDENT (token \"ERROR\")\n".to_string();
            return Err(CompileError::Rejected {
                code: 1,
                diagnostics: String::new(),
            });
        }
        let header = document.header();
        self.sample_rate = settings
            .sample_rate
            .or(header.sample_rate)
            .unwrap_or(44100.0);
        self.ksmps = header.ksmps.unwrap_or(4) as usize;
        self.inputs = document.intended_input_count() as usize;
        self.outputs = document.intended_channel_count() as usize;
        self.zero_dbfs = header.zero_dbfs.unwrap_or(1.0);
        self.spin = vec![0.0; self.ksmps * self.inputs];
        self.spout = vec![0.0; self.ksmps * self.outputs];
        self.tables = (1..=16)
            .filter(|n| document.table_statement(*n).is_some())
            .map(|n| (n, vec![f64::from(n); 8]))
            .collect();
        self.debug = settings.debug;
        self.messages = format!("options: {}\nSECTION 1:\n", settings.options.join(" "));
        self.document = Some(document.clone());
        Ok(())
    }

    fn take_messages(&mut self) -> String {
        std::mem::take(&mut self.messages)
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn ksmps(&self) -> usize {
        self.ksmps
    }

    fn input_channels(&self) -> usize {
        self.inputs
    }

    fn output_channels(&self) -> usize {
        self.outputs
    }

    fn zero_dbfs(&self) -> f64 {
        self.zero_dbfs
    }

    fn channels(&self) -> Vec<EngineChannelInfo> {
        self.document
            .as_ref()
            .map(|doc| {
                doc.channel_declarations()
                    .into_iter()
                    .map(|d| EngineChannelInfo {
                        name: d.name,
                        rate: d.rate,
                        direction: d.direction,
                        default_value: d.default_value,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bind_channel(&mut self, name: &str, _rate: ChannelRate) -> Option<ChannelSlot> {
        if let Some(index) = self.values.iter().position(|(n, _)| n == name) {
            return Some(ChannelSlot(index));
        }
        self.values.push((name.to_string(), 0.0));
        Some(ChannelSlot(self.values.len() - 1))
    }

    fn set_control(&mut self, slot: ChannelSlot, value: f64) {
        if let Some(entry) = self.values.get_mut(slot.0) {
            entry.1 = value;
        }
    }

    fn control(&self, slot: ChannelSlot) -> f64 {
        self.values.get(slot.0).map_or(0.0, |(_, v)| *v)
    }

    fn read_audio_channel(&self, slot: ChannelSlot, out: &mut [f64]) {
        out.fill(self.control(slot));
    }

    fn spin_mut(&mut self) -> &mut [f64] {
        &mut self.spin
    }

    fn spout(&self) -> &[f64] {
        &self.spout
    }

    fn perform_ksmps(
        &mut self,
        host: &mut dyn EngineHost,
    ) -> Result<PerformStatus, EngineRuntimeError> {
        if self.value("fail").unwrap_or(0.0) > 0.0 {
            return Err(EngineRuntimeError::PerformFailed(-1));
        }
        if self.value("stop").unwrap_or(0.0) > 0.0 {
            return Ok(PerformStatus::Finished);
        }

        let mut midi = [0u8; 32];
        let n = host.read_midi(&mut midi);
        if n > 0 {
            host.write_midi(&midi[..n]);
        }

        let gain = self.value("gain").unwrap_or(1.0);
        for frame in 0..self.ksmps {
            for ch in 0..self.outputs {
                self.spout[frame * self.outputs + ch] = if self.inputs > 0 {
                    self.spin[frame * self.inputs + ch % self.inputs] * gain
                } else {
                    0.0
                };
            }
        }
        self.kcycles += 1;
        self.set_value("meter", self.kcycles as f64);

        if !self.display_made {
            host.make_display(1, "fft of aSig");
            self.display_made = true;
        }
        host.draw_display(&DisplayFrame {
            id: 1,
            caption: "",
            points: &self.spout,
            min: -1.0,
            max: 1.0,
            y_scale: 1.0,
        });

        if let (true, Some(instrument)) = (self.debug, self.instrument_breakpoint) {
            host.breakpoint(BreakpointSnapshot {
                instrument,
                line: 0,
                kcounter: self.kcycles,
                variables: vec![VariableBinding {
                    name: "kgain".to_string(),
                    type_name: "k".to_string(),
                    value: VariableValue::Scalar(gain),
                }],
            });
        }
        Ok(PerformStatus::Continue)
    }

    fn table(&self, number: i32) -> Option<&[f64]> {
        self.tables
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, t)| t.as_slice())
    }

    fn apply_breakpoint(&mut self, request: &BreakpointRequest) {
        match *request {
            BreakpointRequest::SetInstrument { instrument, .. } => {
                self.instrument_breakpoint = Some(instrument)
            }
            BreakpointRequest::RemoveInstrument(_) | BreakpointRequest::ClearAll => {
                self.instrument_breakpoint = None
            }
            _ => {}
        }
    }

    fn reset(&mut self) -> Result<(), EngineRuntimeError> {
        self.kcycles = 0;
        self.spout.fill(0.0);
        self.set_value("stop", 0.0);
        Ok(())
    }
}
