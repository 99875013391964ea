//! Plugin export for Cabbage.
//!
//! [`export_plugin`] turns a `.csd` document into a plugin by copying a
//! prebuilt template and patching its identity placeholders with
//! [`patcher`].

mod error;
mod export;
pub mod patcher;

pub use error::{ExportError, Result};
pub use export::{
    default_template_dir, derive_plugin_id, export_plugin, normalize_plugin_id, ExportReport,
    ExportRequest, PluginKind,
};
pub use patcher::{find_pattern, patch_id, patch_name, PatchReport};
