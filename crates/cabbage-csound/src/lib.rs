//! Csound backend for `cabbage-core`.
//!
//! libcsound is opened at runtime with `libloading`, so building does not
//! require Csound to be installed:
//!
//! ```rust,ignore
//! use cabbage_core::{Config, CsoundPluginProcessor};
//! use cabbage_csound::CsoundFactory;
//!
//! let config = Config::load("cabbage.toml".as_ref())?;
//! let factory = CsoundFactory::from_config(&config);
//! let mut processor = CsoundPluginProcessor::new(factory, config);
//! processor.load_csd_file("synth.csd".as_ref())?;
//! ```

pub mod api;
mod engine;
mod error;

pub use api::{default_library_names, CsoundApi};
pub use engine::{CsoundEngine, CsoundFactory};
pub use error::{LoadError, Result};
