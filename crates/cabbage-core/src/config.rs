//! Engine configuration.
//!
//! Settings that tune the real-time core: display throttling, queue
//! capacities, debugger behaviour and the options passed to the engine.
//! A `Config` can be built in code or loaded from a TOML file:
//!
//! ```toml
//! gui_refresh_rate = 25
//! midi_queue_capacity = 2048
//! debug_mode = true
//! breakpoint_timeout_ms = 10000
//! engine_options = ["-n", "-d", "-m0"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default number of audio blocks between inspector captures.
pub const DEFAULT_GUI_REFRESH_RATE: u32 = 50;

/// Default capacity of each MIDI FIFO.
pub const DEFAULT_MIDI_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of the host MIDI output buffer.
pub const DEFAULT_MIDI_OUTPUT_CAPACITY: usize = 512;

/// Default time a breakpoint may hold the engine before it continues on its own.
pub const DEFAULT_BREAKPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of engine display slots.
pub const DEFAULT_MAX_DISPLAYS: usize = 16;

/// Default number of points kept per display.
pub const DEFAULT_MAX_DISPLAY_POINTS: usize = 8192;

/// Runtime configuration for a [`crate::CsoundPluginProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Audio blocks between inspector captures.
    pub gui_refresh_rate: u32,
    /// Capacity of the host-to-engine MIDI FIFO.
    pub midi_queue_capacity: usize,
    /// Capacity of the engine-to-host MIDI FIFO.
    pub midi_output_capacity: usize,
    /// Enable the engine debugger and breakpoint callbacks.
    pub debug_mode: bool,
    /// Longest a breakpoint may pause the engine without a resume.
    pub breakpoint_timeout: Duration,
    /// Number of display slots pre-allocated for engine graphs.
    pub max_displays: usize,
    /// Points kept per display or captured table.
    pub max_display_points: usize,
    /// Command-line style options applied before every compile.
    pub engine_options: Vec<String>,
    /// Explicit path to the engine shared library.
    pub csound_library: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gui_refresh_rate: DEFAULT_GUI_REFRESH_RATE,
            midi_queue_capacity: DEFAULT_MIDI_QUEUE_CAPACITY,
            midi_output_capacity: DEFAULT_MIDI_OUTPUT_CAPACITY,
            debug_mode: false,
            breakpoint_timeout: DEFAULT_BREAKPOINT_TIMEOUT,
            max_displays: DEFAULT_MAX_DISPLAYS,
            max_display_points: DEFAULT_MAX_DISPLAY_POINTS,
            engine_options: vec!["-n".to_string(), "-d".to_string()],
            csound_library: None,
        }
    }
}

impl Config {
    /// Set the inspector capture cadence in blocks.
    pub fn with_gui_refresh_rate(mut self, blocks: u32) -> Self {
        self.gui_refresh_rate = blocks;
        self
    }

    /// Set the MIDI FIFO capacity.
    pub fn with_midi_queue_capacity(mut self, capacity: usize) -> Self {
        self.midi_queue_capacity = capacity;
        self
    }

    /// Set the host MIDI output buffer capacity.
    pub fn with_midi_output_capacity(mut self, capacity: usize) -> Self {
        self.midi_output_capacity = capacity;
        self
    }

    /// Enable or disable the engine debugger.
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    /// Set the breakpoint pause timeout.
    pub fn with_breakpoint_timeout(mut self, timeout: Duration) -> Self {
        self.breakpoint_timeout = timeout;
        self
    }

    /// Set display slot count and per-display point capacity.
    pub fn with_display_capacity(mut self, displays: usize, points: usize) -> Self {
        self.max_displays = displays;
        self.max_display_points = points;
        self
    }

    /// Replace the engine option list.
    pub fn with_engine_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Set an explicit engine library path.
    pub fn with_csound_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.csound_library = Some(path.into());
        self
    }

    /// Parse a config from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gui_refresh_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "gui_refresh_rate",
                reason: "must be at least 1 block",
            });
        }
        if self.midi_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "midi_queue_capacity",
                reason: "must be greater than 0",
            });
        }
        if self.midi_output_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "midi_output_capacity",
                reason: "must be greater than 0",
            });
        }
        if self.breakpoint_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "breakpoint_timeout_ms",
                reason: "must be greater than 0",
            });
        }
        Ok(())
    }
}

/// On-disk shape of [`Config`]. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    gui_refresh_rate: Option<u32>,
    midi_queue_capacity: Option<usize>,
    midi_output_capacity: Option<usize>,
    debug_mode: Option<bool>,
    breakpoint_timeout_ms: Option<u64>,
    max_displays: Option<usize>,
    max_display_points: Option<usize>,
    engine_options: Option<Vec<String>>,
    csound_library: Option<PathBuf>,
}

impl ConfigFile {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            gui_refresh_rate: self.gui_refresh_rate.unwrap_or(defaults.gui_refresh_rate),
            midi_queue_capacity: self
                .midi_queue_capacity
                .unwrap_or(defaults.midi_queue_capacity),
            midi_output_capacity: self
                .midi_output_capacity
                .unwrap_or(defaults.midi_output_capacity),
            debug_mode: self.debug_mode.unwrap_or(defaults.debug_mode),
            breakpoint_timeout: self
                .breakpoint_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.breakpoint_timeout),
            max_displays: self.max_displays.unwrap_or(defaults.max_displays),
            max_display_points: self
                .max_display_points
                .unwrap_or(defaults.max_display_points),
            engine_options: self.engine_options.unwrap_or(defaults.engine_options),
            csound_library: self.csound_library.or(defaults.csound_library),
        }
    }
}
