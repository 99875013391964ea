//! [`Engine`] implementation over a libcsound instance.
//!
//! Csound calls back into the host for MIDI, graphs and breakpoints. Each
//! instance is created with a pointer to its own boxed [`HostContext`] as
//! host data; the `extern "C"` callbacks below recover it with
//! `csoundGetHostData` and forward to the [`EngineHost`] that
//! [`Engine::perform_ksmps`] installed for the duration of the call.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::PathBuf;
use std::ptr;

use cabbage_core::{
    BreakpointRequest, BreakpointSnapshot, ChannelDirection, ChannelRate, ChannelSlot,
    CompileError, CompileSettings, Config, DisplayFrame, Engine, EngineChannelInfo, EngineError,
    EngineFactory, EngineHost, EngineRuntimeError, OrchestraDocument, PerformStatus,
    VariableBinding, VariableValue,
};

use crate::api::{
    Csound, CsoundApi, DebugBreakpointInfo, DebugVariable, Myflt, StringDat, Windat,
    CSOUND_AUDIO_CHANNEL, CSOUND_CHANNEL_TYPE_MASK, CSOUND_CONTROL_CHANNEL, CSOUND_INPUT_CHANNEL,
    CSOUND_OUTPUT_CHANNEL,
};

/// Options that route MIDI through the host callbacks.
const HOST_MIDI_OPTIONS: [&str; 3] = ["-+rtmidi=NULL", "-M0", "-Q0"];

/// Per-instance state reachable from Csound callbacks.
struct HostContext {
    /// `*mut &mut dyn EngineHost`, valid only inside `perform_ksmps`.
    host: *mut c_void,
    ksmps: usize,
    breakpoint_hit: bool,
}

#[derive(Debug, Clone, Copy)]
struct BoundSlot {
    ptr: *mut Myflt,
    rate: ChannelRate,
}

/// One Csound instance.
pub struct CsoundEngine {
    api: &'static CsoundApi,
    csound: *mut Csound,
    context: Box<HostContext>,
    slots: Vec<BoundSlot>,
    spin: *mut Myflt,
    spout: *mut Myflt,
    sample_rate: f64,
    ksmps: usize,
    inputs: usize,
    outputs: usize,
    zero_dbfs: f64,
    debug: bool,
    started: bool,
}

// SAFETY: a Csound instance may be used from any thread as long as calls
// are not concurrent, which `&mut self` on every mutating method ensures.
// The raw pointers are owned by the instance and freed in `Drop`.
unsafe impl Send for CsoundEngine {}

impl CsoundEngine {
    pub fn new(api: &'static CsoundApi) -> Result<Self, EngineError> {
        let mut context = Box::new(HostContext {
            host: ptr::null_mut(),
            ksmps: 0,
            breakpoint_hit: false,
        });
        let host_data = (&mut *context as *mut HostContext).cast::<c_void>();
        // SAFETY: `host_data` points into a Box that outlives the instance.
        let csound = unsafe { (api.create)(host_data) };
        if csound.is_null() {
            return Err(EngineError::CreateFailed);
        }
        // SAFETY: `csound` is a live instance.
        unsafe { (api.create_message_buffer)(csound, 0) };
        Ok(Self {
            api,
            csound,
            context,
            slots: Vec::new(),
            spin: ptr::null_mut(),
            spout: ptr::null_mut(),
            sample_rate: 0.0,
            ksmps: 1,
            inputs: 0,
            outputs: 0,
            zero_dbfs: 1.0,
            debug: false,
            started: false,
        })
    }

    fn set_option(&mut self, option: &str) -> Result<(), EngineError> {
        let text = CString::new(option).map_err(|_| EngineError::OptionRejected {
            option: option.to_string(),
            code: -1,
        })?;
        // SAFETY: live instance, nul-terminated option.
        let code = unsafe { (self.api.set_option)(self.csound, text.as_ptr()) };
        if code != 0 {
            return Err(EngineError::OptionRejected {
                option: option.to_string(),
                code,
            });
        }
        Ok(())
    }

    fn install_callbacks(&mut self) {
        let api = self.api;
        let cs = self.csound;
        // SAFETY: live instance; every callback matches its C signature.
        unsafe {
            (api.set_host_implemented_midi_io)(cs, 1);
            (api.set_midi_in_open_callback)(cs, Some(midi_open));
            (api.set_midi_read_callback)(cs, Some(midi_read));
            (api.set_midi_out_open_callback)(cs, Some(midi_open));
            (api.set_midi_write_callback)(cs, Some(midi_write));
            (api.set_is_graphable)(cs, 1);
            (api.set_make_graph_callback)(cs, Some(make_graph));
            (api.set_draw_graph_callback)(cs, Some(draw_graph));
            (api.set_kill_graph_callback)(cs, Some(kill_graph));
            (api.set_exit_graph_callback)(cs, Some(exit_graph));
        }
    }
}

impl Drop for CsoundEngine {
    fn drop(&mut self) {
        // SAFETY: the instance is live until `destroy`; nothing uses it after.
        unsafe {
            if self.debug {
                (self.api.debugger_clean)(self.csound);
            }
            (self.api.destroy_message_buffer)(self.csound);
            (self.api.destroy)(self.csound);
        }
    }
}

impl Engine for CsoundEngine {
    fn compile(
        &mut self,
        document: &OrchestraDocument,
        settings: &CompileSettings,
    ) -> Result<(), CompileError> {
        for option in settings.options_for(document) {
            self.set_option(&option)?;
        }
        for option in HOST_MIDI_OPTIONS {
            self.set_option(option)?;
        }
        self.install_callbacks();

        let text = CString::new(document.text()).map_err(|_| CompileError::Rejected {
            code: -1,
            diagnostics: "document contains a nul byte".to_string(),
        })?;
        // SAFETY: live instance, nul-terminated text.
        let code = unsafe { (self.api.compile_csd_text)(self.csound, text.as_ptr()) };
        if code != 0 {
            return Err(CompileError::Rejected {
                code,
                diagnostics: String::new(),
            });
        }
        // SAFETY: live instance with a compiled orchestra.
        let code = unsafe { (self.api.start)(self.csound) };
        if code != 0 {
            return Err(CompileError::StartFailed {
                code,
                diagnostics: String::new(),
            });
        }
        self.started = true;

        let api = self.api;
        let cs = self.csound;
        // SAFETY: live, started instance.
        unsafe {
            self.sample_rate = (api.get_sr)(cs);
            self.ksmps = ((api.get_ksmps)(cs) as usize).max(1);
            self.outputs = (api.get_nchnls)(cs) as usize;
            self.inputs = (api.get_nchnls_input)(cs) as usize;
            self.zero_dbfs = (api.get_0dbfs)(cs);
            self.spin = (api.get_spin)(cs);
            self.spout = (api.get_spout)(cs);
        }
        self.context.ksmps = self.ksmps;

        if settings.debug {
            // SAFETY: live, started instance; the callback ignores user data.
            unsafe {
                (api.debugger_init)(cs);
                (api.set_breakpoint_callback)(cs, Some(breakpoint), ptr::null_mut());
            }
            self.debug = true;
        }
        Ok(())
    }

    fn take_messages(&mut self) -> String {
        let mut out = String::new();
        // SAFETY: live instance with a message buffer; each message pointer
        // is valid until popped.
        unsafe {
            while (self.api.get_message_count)(self.csound) > 0 {
                let message = (self.api.get_first_message)(self.csound);
                if !message.is_null() {
                    out.push_str(&CStr::from_ptr(message).to_string_lossy());
                }
                (self.api.pop_first_message)(self.csound);
            }
        }
        out
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
        let mut list = ptr::null_mut();
        // SAFETY: live instance; the list is released below.
        let count = unsafe { (self.api.list_channels)(self.csound, &mut list) };
        if count <= 0 || list.is_null() {
            return Vec::new();
        }
        // SAFETY: Csound returned `count` entries at `list`.
        let entries = unsafe { std::slice::from_raw_parts(list, count as usize) };
        let channels = entries
            .iter()
            .filter_map(|entry| {
                let (rate, direction) = classify_channel(entry.kind)?;
                // SAFETY: channel names are nul-terminated and live with the list.
                let name = unsafe { CStr::from_ptr(entry.name) }
                    .to_string_lossy()
                    .into_owned();
                Some(EngineChannelInfo {
                    name,
                    rate,
                    direction,
                    default_value: entry.hints.dflt,
                })
            })
            .collect();
        // SAFETY: `list` came from `list_channels` on this instance.
        unsafe { (self.api.delete_channel_list)(self.csound, list) };
        channels
    }

    fn bind_channel(&mut self, name: &str, rate: ChannelRate) -> Option<ChannelSlot> {
        let name = CString::new(name).ok()?;
        let rate_bits = match rate {
            ChannelRate::Control => CSOUND_CONTROL_CHANNEL,
            ChannelRate::Audio => CSOUND_AUDIO_CHANNEL,
        };
        let kind = rate_bits | CSOUND_INPUT_CHANNEL | CSOUND_OUTPUT_CHANNEL;
        let mut ptr = ptr::null_mut();
        // SAFETY: live instance, nul-terminated name.
        let code = unsafe { (self.api.get_channel_ptr)(self.csound, &mut ptr, name.as_ptr(), kind) };
        if code != 0 || ptr.is_null() {
            return None;
        }
        self.slots.push(BoundSlot { ptr, rate });
        Some(ChannelSlot(self.slots.len() - 1))
    }

    fn set_control(&mut self, slot: ChannelSlot, value: f64) {
        if let Some(BoundSlot {
            ptr,
            rate: ChannelRate::Control,
        }) = self.slots.get(slot.0)
        {
            // SAFETY: channel pointers stay valid for the instance lifetime.
            unsafe { **ptr = value };
        }
    }

    fn control(&self, slot: ChannelSlot) -> f64 {
        match self.slots.get(slot.0) {
            // SAFETY: as in `set_control`.
            Some(bound) => unsafe { *bound.ptr },
            None => 0.0,
        }
    }

    fn read_audio_channel(&self, slot: ChannelSlot, out: &mut [f64]) {
        let Some(bound) = self.slots.get(slot.0) else {
            out.fill(0.0);
            return;
        };
        let len = match bound.rate {
            ChannelRate::Audio => self.ksmps,
            ChannelRate::Control => 1,
        };
        // SAFETY: audio channels hold ksmps samples, control channels one.
        let data = unsafe { std::slice::from_raw_parts(bound.ptr, len) };
        for (dst, &src) in out.iter_mut().zip(data) {
            *dst = src;
        }
    }

    fn spin_mut(&mut self) -> &mut [f64] {
        if self.spin.is_null() {
            return &mut [];
        }
        // SAFETY: spin holds ksmps * nchnls_i samples owned by the instance.
        unsafe { std::slice::from_raw_parts_mut(self.spin, self.ksmps * self.inputs) }
    }

    fn spout(&self) -> &[f64] {
        if self.spout.is_null() {
            return &[];
        }
        // SAFETY: spout holds ksmps * nchnls samples owned by the instance.
        unsafe { std::slice::from_raw_parts(self.spout, self.ksmps * self.outputs) }
    }

    fn perform_ksmps(
        &mut self,
        host: &mut dyn EngineHost,
    ) -> Result<PerformStatus, EngineRuntimeError> {
        if !self.started {
            return Err(EngineRuntimeError::LayoutMismatch);
        }
        let mut host = host;
        self.context.host = (&mut host as *mut &mut dyn EngineHost).cast::<c_void>();
        // SAFETY: started instance; `host` outlives the call and callbacks
        // only run inside it.
        let code = unsafe { (self.api.perform_ksmps)(self.csound) };
        self.context.host = ptr::null_mut();

        if std::mem::take(&mut self.context.breakpoint_hit) {
            // SAFETY: the debugger is initialised whenever breakpoints fire.
            unsafe { (self.api.debug_continue)(self.csound) };
        }
        match code {
            0 => Ok(PerformStatus::Continue),
            c if c > 0 => Ok(PerformStatus::Finished),
            c => Err(EngineRuntimeError::PerformFailed(c)),
        }
    }

    fn table(&self, number: i32) -> Option<&[f64]> {
        let mut data = ptr::null_mut();
        // SAFETY: live instance.
        let len = unsafe { (self.api.get_table)(self.csound, &mut data, number) };
        if len <= 0 || data.is_null() {
            return None;
        }
        // SAFETY: Csound reported `len` samples at `data`.
        Some(unsafe { std::slice::from_raw_parts(data, len as usize) })
    }

    fn apply_breakpoint(&mut self, request: &BreakpointRequest) {
        if !self.debug {
            return;
        }
        let (api, cs) = (self.api, self.csound);
        // SAFETY: the debugger was initialised in `compile`.
        unsafe {
            match *request {
                BreakpointRequest::SetLine {
                    line,
                    instrument,
                    skip,
                } => (api.set_breakpoint)(cs, line, instrument, skip),
                BreakpointRequest::RemoveLine { line, instrument } => {
                    (api.remove_breakpoint)(cs, line, instrument)
                }
                BreakpointRequest::SetInstrument { instrument, skip } => {
                    (api.set_instrument_breakpoint)(cs, instrument, skip)
                }
                BreakpointRequest::RemoveInstrument(instrument) => {
                    (api.remove_instrument_breakpoint)(cs, instrument)
                }
                BreakpointRequest::ClearAll => (api.clear_breakpoints)(cs),
            }
        }
    }

    fn reset(&mut self) -> Result<(), EngineRuntimeError> {
        if self.started {
            // SAFETY: started instance.
            unsafe { (self.api.rewind_score)(self.csound) };
        }
        Ok(())
    }
}

/// Creates [`CsoundEngine`]s, loading libcsound on first use.
#[derive(Debug, Clone, Default)]
pub struct CsoundFactory {
    library: Option<PathBuf>,
}

impl CsoundFactory {
    /// A factory using the platform's default library names.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            library: config.csound_library.clone(),
        }
    }

    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library = Some(path.into());
        self
    }
}

impl EngineFactory for CsoundFactory {
    type Engine = CsoundEngine;

    fn create(&self) -> Result<CsoundEngine, EngineError> {
        let api = CsoundApi::load(self.library.as_deref())?;
        CsoundEngine::new(api)
    }
}

/// Rate and direction of a `csoundListChannels` entry. String and PVS
/// channels are not exchanged with the GUI.
fn classify_channel(kind: c_int) -> Option<(ChannelRate, ChannelDirection)> {
    let rate = match kind & CSOUND_CHANNEL_TYPE_MASK {
        CSOUND_CONTROL_CHANNEL => ChannelRate::Control,
        CSOUND_AUDIO_CHANNEL => ChannelRate::Audio,
        _ => return None,
    };
    let input = kind & CSOUND_INPUT_CHANNEL != 0;
    let output = kind & CSOUND_OUTPUT_CHANNEL != 0;
    let direction = match (input, output) {
        (true, false) => ChannelDirection::Input,
        (false, true) => ChannelDirection::Output,
        _ => ChannelDirection::Bidirectional,
    };
    Some((rate, direction))
}

/// Text up to the first nul of a fixed-size C buffer.
fn fixed_c_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    match std::str::from_utf8(&bytes[..end]) {
        Ok(text) => text,
        Err(err) => std::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or(""),
    }
}

/// Decode a debugger variable from its type tag.
fn decode_variable(
    type_name: &str,
    scalar: Option<f64>,
    text: Option<&str>,
    samples: Option<&[f64]>,
) -> VariableValue {
    match type_name {
        "i" | "k" | "r" | "c" => scalar.map_or(VariableValue::Opaque, VariableValue::Scalar),
        "S" => text.map_or(VariableValue::Opaque, |t| VariableValue::Text(t.to_string())),
        "a" => samples.map_or(VariableValue::Opaque, |s| VariableValue::Array(s.to_vec())),
        _ => VariableValue::Opaque,
    }
}

/// The context and host of `csound`, when called inside `perform_ksmps`.
///
/// # Safety
///
/// `csound` must be an instance created by [`CsoundEngine::new`].
unsafe fn current_host<'a>(csound: *mut Csound) -> Option<(&'a mut HostContext, &'a mut dyn EngineHost)> {
    let api = CsoundApi::get()?;
    // SAFETY: host data is the instance's boxed `HostContext`.
    let context = unsafe { (api.get_host_data)(csound).cast::<HostContext>().as_mut()? };
    if context.host.is_null() {
        return None;
    }
    // SAFETY: set by `perform_ksmps` to a live `&mut dyn EngineHost`.
    let host = unsafe { &mut **context.host.cast::<&mut dyn EngineHost>() };
    Some((context, host))
}

unsafe extern "C" fn midi_open(
    _csound: *mut Csound,
    user_data: *mut *mut c_void,
    _device: *const c_char,
) -> c_int {
    if !user_data.is_null() {
        // SAFETY: Csound passes a valid out-pointer.
        unsafe { *user_data = ptr::null_mut() };
    }
    0
}

unsafe extern "C" fn midi_read(
    csound: *mut Csound,
    _user_data: *mut c_void,
    buf: *mut u8,
    nbytes: c_int,
) -> c_int {
    if buf.is_null() || nbytes <= 0 {
        return 0;
    }
    // SAFETY: called by our instance during `perform_ksmps`.
    let Some((_, host)) = (unsafe { current_host(csound) }) else {
        return 0;
    };
    // SAFETY: Csound provides `nbytes` writable bytes.
    let buf = unsafe { std::slice::from_raw_parts_mut(buf, nbytes as usize) };
    host.read_midi(buf) as c_int
}

unsafe extern "C" fn midi_write(
    csound: *mut Csound,
    _user_data: *mut c_void,
    buf: *const u8,
    nbytes: c_int,
) -> c_int {
    if buf.is_null() || nbytes <= 0 {
        return 0;
    }
    // SAFETY: called by our instance during `perform_ksmps`.
    let Some((_, host)) = (unsafe { current_host(csound) }) else {
        return nbytes;
    };
    // SAFETY: Csound provides `nbytes` readable bytes.
    let bytes = unsafe { std::slice::from_raw_parts(buf, nbytes as usize) };
    host.write_midi(bytes) as c_int
}

unsafe extern "C" fn make_graph(csound: *mut Csound, windat: *mut Windat, name: *const c_char) {
    // SAFETY: Csound passes a valid window.
    let Some(windat) = (unsafe { windat.as_ref() }) else {
        return;
    };
    // SAFETY: called by our instance.
    let Some((_, host)) = (unsafe { current_host(csound) }) else {
        return;
    };
    let caption = if name.is_null() {
        caption_of(windat)
    } else {
        // SAFETY: non-null names are nul-terminated.
        unsafe { CStr::from_ptr(name) }.to_str().unwrap_or("")
    };
    host.make_display(windat.windid, caption);
}

unsafe extern "C" fn draw_graph(csound: *mut Csound, windat: *mut Windat) {
    // SAFETY: Csound passes a valid window.
    let Some(windat) = (unsafe { windat.as_ref() }) else {
        return;
    };
    // SAFETY: called by our instance.
    let Some((_, host)) = (unsafe { current_host(csound) }) else {
        return;
    };
    let points = if windat.fdata.is_null() || windat.npts <= 0 {
        &[][..]
    } else {
        // SAFETY: `fdata` holds `npts` samples for the duration of the call.
        unsafe { std::slice::from_raw_parts(windat.fdata, windat.npts as usize) }
    };
    host.draw_display(&DisplayFrame {
        id: windat.windid,
        caption: caption_of(windat),
        points,
        min: windat.min,
        max: windat.max,
        y_scale: windat.oabsmax,
    });
}

unsafe extern "C" fn kill_graph(csound: *mut Csound, windat: *mut Windat) {
    // SAFETY: Csound passes a valid window.
    let Some(windat) = (unsafe { windat.as_ref() }) else {
        return;
    };
    // SAFETY: called by our instance.
    if let Some((_, host)) = unsafe { current_host(csound) } {
        host.kill_display(windat.windid);
    }
}

unsafe extern "C" fn exit_graph(_csound: *mut Csound) -> c_int {
    0
}

unsafe extern "C" fn breakpoint(
    csound: *mut Csound,
    info: *mut DebugBreakpointInfo,
    _user_data: *mut c_void,
) {
    // SAFETY: Csound passes valid breakpoint info.
    let Some(info) = (unsafe { info.as_ref() }) else {
        return;
    };
    // SAFETY: called by our instance during `perform_ksmps`.
    let Some((context, host)) = (unsafe { current_host(csound) }) else {
        return;
    };
    // SAFETY: the breakpoint instrument is valid or null.
    let instr = unsafe { info.breakpoint_instr.as_ref() };
    let snapshot = BreakpointSnapshot {
        instrument: instr.map_or(0.0, |i| i.p1),
        line: info.line,
        kcounter: instr.map_or(0, |i| i.kcounter),
        // SAFETY: the variable list is a valid, null-terminated linked list.
        variables: unsafe { collect_variables(info.instr_var_list, context.ksmps) },
    };
    host.breakpoint(snapshot);
    context.breakpoint_hit = true;
}

/// # Safety
///
/// `head` must be null or the head of a valid `debug_variable_t` list.
unsafe fn collect_variables(head: *mut DebugVariable, ksmps: usize) -> Vec<VariableBinding> {
    let mut out = Vec::new();
    let mut cursor = head;
    // SAFETY: every `next` pointer is valid or null.
    while let Some(var) = unsafe { cursor.as_ref() } {
        cursor = var.next;
        if var.name.is_null() || var.type_name.is_null() {
            continue;
        }
        // SAFETY: names and type tags are nul-terminated.
        let (name, type_name) = unsafe {
            (
                CStr::from_ptr(var.name).to_string_lossy().into_owned(),
                CStr::from_ptr(var.type_name).to_string_lossy().into_owned(),
            )
        };
        let value = if var.data.is_null() {
            VariableValue::Opaque
        } else {
            // SAFETY: the data layout follows the type tag: MYFLT for i/k,
            // STRINGDAT for S, ksmps MYFLTs for a.
            unsafe {
                match type_name.as_str() {
                    "S" => {
                        let text = var.data.cast::<StringDat>().as_ref().and_then(|s| {
                            (!s.data.is_null()).then(|| CStr::from_ptr(s.data).to_string_lossy())
                        });
                        decode_variable(&type_name, None, text.as_deref(), None)
                    }
                    "a" => {
                        let samples = std::slice::from_raw_parts(var.data.cast::<Myflt>(), ksmps);
                        decode_variable(&type_name, None, None, Some(samples))
                    }
                    _ => decode_variable(&type_name, Some(*var.data.cast::<Myflt>()), None, None),
                }
            }
        };
        out.push(VariableBinding {
            name,
            type_name,
            value,
        });
    }
    out
}

fn caption_of(windat: &Windat) -> &str {
    // SAFETY: `c_char` and `u8` have the same size and alignment.
    let bytes = unsafe {
        std::slice::from_raw_parts(windat.caption.as_ptr().cast::<u8>(), windat.caption.len())
    };
    fixed_c_str(bytes)
}
