//! The Csound C API, resolved at runtime.
//!
//! libcsound is opened once per process and its function table is kept in
//! a `OnceLock`. Everything else (engine instances, callbacks) is
//! per-instance and reaches the table through [`CsoundApi::get`].

use std::ffi::{c_char, c_int, c_void};
use std::path::Path;
use std::sync::OnceLock;

use libloading::Library;

use crate::error::{LoadError, Result};

/// Csound sample type (libcsound64).
pub type Myflt = f64;

/// Opaque engine instance.
#[repr(C)]
pub struct Csound {
    _private: [u8; 0],
}

pub const CSOUND_CONTROL_CHANNEL: c_int = 1;
pub const CSOUND_AUDIO_CHANNEL: c_int = 2;
pub const CSOUND_CHANNEL_TYPE_MASK: c_int = 15;
pub const CSOUND_INPUT_CHANNEL: c_int = 16;
pub const CSOUND_OUTPUT_CHANNEL: c_int = 32;

/// `CAPSIZE` in `cwindow.h`.
pub const CAPTION_SIZE: usize = 60;

/// `WINDAT`: one engine graph window.
#[repr(C)]
pub struct Windat {
    pub windid: usize,
    pub fdata: *mut Myflt,
    pub npts: i32,
    pub caption: [c_char; CAPTION_SIZE],
    pub waitflg: i16,
    pub polarity: i16,
    pub max: Myflt,
    pub min: Myflt,
    pub absmax: Myflt,
    pub oabsmax: Myflt,
    pub danflag: c_int,
    pub absflag: c_int,
}

#[repr(C)]
pub struct ControlChannelHints {
    pub behav: c_int,
    pub dflt: Myflt,
    pub min: Myflt,
    pub max: Myflt,
    pub x: c_int,
    pub y: c_int,
    pub width: c_int,
    pub height: c_int,
    pub attributes: *mut c_char,
}

/// `controlChannelInfo_t`
#[repr(C)]
pub struct ControlChannelInfo {
    pub name: *mut c_char,
    pub kind: c_int,
    pub hints: ControlChannelHints,
}

/// `STRINGDAT`
#[repr(C)]
pub struct StringDat {
    pub data: *mut c_char,
    pub size: c_int,
}

/// `debug_instr_t`
#[repr(C)]
pub struct DebugInstr {
    pub var_pool_head: *mut c_void,
    pub lclbas: *mut Myflt,
    pub instrptr: *mut c_void,
    pub p1: Myflt,
    pub p2: Myflt,
    pub p3: Myflt,
    pub kcounter: u64,
    pub line: c_int,
    pub next: *mut DebugInstr,
}

/// `debug_variable_t`
#[repr(C)]
pub struct DebugVariable {
    pub name: *const c_char,
    pub type_name: *const c_char,
    pub data: *mut c_void,
    pub next: *mut DebugVariable,
}

/// `debug_bkpt_info_t`
#[repr(C)]
pub struct DebugBreakpointInfo {
    pub breakpoint_instr: *mut DebugInstr,
    pub instr_var_list: *mut DebugVariable,
    pub instr_list_head: *mut DebugInstr,
    pub line: c_int,
}

pub type MidiOpenFn = unsafe extern "C" fn(*mut Csound, *mut *mut c_void, *const c_char) -> c_int;
pub type MidiReadFn = unsafe extern "C" fn(*mut Csound, *mut c_void, *mut u8, c_int) -> c_int;
pub type MidiWriteFn = unsafe extern "C" fn(*mut Csound, *mut c_void, *const u8, c_int) -> c_int;
pub type MakeGraphFn = unsafe extern "C" fn(*mut Csound, *mut Windat, *const c_char);
pub type GraphFn = unsafe extern "C" fn(*mut Csound, *mut Windat);
pub type ExitGraphFn = unsafe extern "C" fn(*mut Csound) -> c_int;
pub type BreakpointFn = unsafe extern "C" fn(*mut Csound, *mut DebugBreakpointInfo, *mut c_void);

macro_rules! csound_api {
    ($($field:ident = $symbol:literal: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        /// Resolved libcsound entry points.
        pub struct CsoundApi {
            _library: Library,
            $(pub $field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl CsoundApi {
            fn resolve(library: Library) -> Result<Self> {
                $(
                    // SAFETY: the signature matches the declaration in csound.h
                    // (or csdebug.h / cwindow.h) for this symbol.
                    let $field = unsafe {
                        *library
                            .get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                concat!($symbol, "\0").as_bytes(),
                            )
                            .map_err(|_| LoadError::MissingSymbol($symbol))?
                    };
                )*
                Ok(Self { _library: library, $($field,)* })
            }
        }
    };
}

csound_api! {
    create = "csoundCreate": fn(*mut c_void) -> *mut Csound;
    destroy = "csoundDestroy": fn(*mut Csound);
    set_option = "csoundSetOption": fn(*mut Csound, *const c_char) -> c_int;
    compile_csd_text = "csoundCompileCsdText": fn(*mut Csound, *const c_char) -> c_int;
    start = "csoundStart": fn(*mut Csound) -> c_int;
    perform_ksmps = "csoundPerformKsmps": fn(*mut Csound) -> c_int;
    rewind_score = "csoundRewindScore": fn(*mut Csound);
    get_host_data = "csoundGetHostData": fn(*mut Csound) -> *mut c_void;
    get_sr = "csoundGetSr": fn(*mut Csound) -> Myflt;
    get_ksmps = "csoundGetKsmps": fn(*mut Csound) -> u32;
    get_nchnls = "csoundGetNchnls": fn(*mut Csound) -> u32;
    get_nchnls_input = "csoundGetNchnlsInput": fn(*mut Csound) -> u32;
    get_0dbfs = "csoundGet0dBFS": fn(*mut Csound) -> Myflt;
    get_spin = "csoundGetSpin": fn(*mut Csound) -> *mut Myflt;
    get_spout = "csoundGetSpout": fn(*mut Csound) -> *mut Myflt;
    get_channel_ptr = "csoundGetChannelPtr": fn(*mut Csound, *mut *mut Myflt, *const c_char, c_int) -> c_int;
    list_channels = "csoundListChannels": fn(*mut Csound, *mut *mut ControlChannelInfo) -> c_int;
    delete_channel_list = "csoundDeleteChannelList": fn(*mut Csound, *mut ControlChannelInfo);
    get_table = "csoundGetTable": fn(*mut Csound, *mut *mut Myflt, c_int) -> c_int;
    create_message_buffer = "csoundCreateMessageBuffer": fn(*mut Csound, c_int);
    destroy_message_buffer = "csoundDestroyMessageBuffer": fn(*mut Csound);
    get_first_message = "csoundGetFirstMessage": fn(*mut Csound) -> *const c_char;
    pop_first_message = "csoundPopFirstMessage": fn(*mut Csound);
    get_message_count = "csoundGetMessageCnt": fn(*mut Csound) -> c_int;
    set_host_implemented_midi_io = "csoundSetHostImplementedMIDIIO": fn(*mut Csound, c_int);
    set_midi_in_open_callback = "csoundSetExternalMidiInOpenCallback": fn(*mut Csound, Option<MidiOpenFn>);
    set_midi_read_callback = "csoundSetExternalMidiReadCallback": fn(*mut Csound, Option<MidiReadFn>);
    set_midi_out_open_callback = "csoundSetExternalMidiOutOpenCallback": fn(*mut Csound, Option<MidiOpenFn>);
    set_midi_write_callback = "csoundSetExternalMidiWriteCallback": fn(*mut Csound, Option<MidiWriteFn>);
    set_is_graphable = "csoundSetIsGraphable": fn(*mut Csound, c_int) -> c_int;
    set_make_graph_callback = "csoundSetMakeGraphCallback": fn(*mut Csound, Option<MakeGraphFn>);
    set_draw_graph_callback = "csoundSetDrawGraphCallback": fn(*mut Csound, Option<GraphFn>);
    set_kill_graph_callback = "csoundSetKillGraphCallback": fn(*mut Csound, Option<GraphFn>);
    set_exit_graph_callback = "csoundSetExitGraphCallback": fn(*mut Csound, Option<ExitGraphFn>);
    debugger_init = "csoundDebuggerInit": fn(*mut Csound);
    debugger_clean = "csoundDebuggerClean": fn(*mut Csound);
    set_breakpoint_callback = "csoundSetBreakpointCallback": fn(*mut Csound, Option<BreakpointFn>, *mut c_void);
    debug_continue = "csoundDebugContinue": fn(*mut Csound);
    set_breakpoint = "csoundSetBreakpoint": fn(*mut Csound, c_int, c_int, c_int);
    remove_breakpoint = "csoundRemoveBreakpoint": fn(*mut Csound, c_int, c_int);
    set_instrument_breakpoint = "csoundSetInstrumentBreakpoint": fn(*mut Csound, Myflt, c_int);
    remove_instrument_breakpoint = "csoundRemoveInstrumentBreakpoint": fn(*mut Csound, Myflt);
    clear_breakpoints = "csoundClearBreakpoints": fn(*mut Csound);
}

static API: OnceLock<CsoundApi> = OnceLock::new();

/// Library names tried when no path is configured.
pub fn default_library_names() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &[
            "/Library/Frameworks/CsoundLib64.framework/CsoundLib64",
            "libcsound64.dylib",
        ]
    } else if cfg!(target_os = "windows") {
        &["csound64.dll"]
    } else {
        &["libcsound64.so", "libcsound64.so.6.0"]
    }
}

impl CsoundApi {
    /// The process-wide table, loading it on first use.
    ///
    /// `library` is only consulted by the first successful call.
    pub fn load(library: Option<&Path>) -> Result<&'static CsoundApi> {
        if let Some(api) = API.get() {
            return Ok(api);
        }
        let library = match library {
            Some(path) => open(path)?,
            None => open_default()?,
        };
        let api = CsoundApi::resolve(library)?;
        // A concurrent loader may have won; either table is equivalent.
        let _ = API.set(api);
        API.get().ok_or(LoadError::NotFound(Vec::new()))
    }

    /// The table, if it has been loaded.
    pub fn get() -> Option<&'static CsoundApi> {
        API.get()
    }
}

fn open(path: &Path) -> Result<Library> {
    log::debug!("loading Csound from {}", path.display());
    // SAFETY: libcsound's initializers have no preconditions on the host.
    unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
        path: path.display().to_string(),
        source,
    })
}

fn open_default() -> Result<Library> {
    for name in default_library_names() {
        // SAFETY: as in `open`.
        if let Ok(library) = unsafe { Library::new(name) } {
            log::debug!("loaded Csound as {}", name);
            return Ok(library);
        }
    }
    Err(LoadError::NotFound(
        default_library_names().iter().map(|s| s.to_string()).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names_are_64_bit_builds() {
        assert!(!default_library_names().is_empty());
        assert!(default_library_names().iter().all(|n| n.contains("64")));
    }

    #[test]
    fn test_missing_library_reports_path() {
        let err = open(Path::new("/nonexistent/libcsound64.so")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/libcsound64.so"));
    }
}
