//! Export of a `.csd` document as a standalone plugin.
//!
//! Exporting copies a prebuilt plugin template next to the document,
//! writes the document beside it under the same base name (the plugin
//! loads it from there at runtime), and patches the copy's ID and name.

use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::{Path, PathBuf};

use cabbage_core::OrchestraDocument;

use crate::error::{ExportError, Result};
use crate::patcher::{self, PatchReport};

/// Which prebuilt template to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Effect,
    Synth,
    Lv2Effect,
    Lv2Synth,
}

impl PluginKind {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "effect" | "vst" | "fx" => Some(PluginKind::Effect),
            "synth" | "vsti" | "instrument" => Some(PluginKind::Synth),
            "lv2-effect" | "lv2-fx" => Some(PluginKind::Lv2Effect),
            "lv2-synth" | "lv2-ins" => Some(PluginKind::Lv2Synth),
            _ => None,
        }
    }

    /// Template file name without extension.
    pub fn template_stem(self) -> &'static str {
        match self {
            PluginKind::Effect => "CabbagePluginEffect",
            PluginKind::Synth => "CabbagePluginSynth",
            PluginKind::Lv2Effect => "CabbagePluginEffectLV2",
            PluginKind::Lv2Synth => "CabbagePluginSynthLV2",
        }
    }

    /// Template file name with the platform library extension.
    pub fn template_file_name(self) -> String {
        format!("{}.{}", self.template_stem(), DLL_EXTENSION)
    }
}

/// Parameters for [`export_plugin`].
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub kind: PluginKind,
    pub source: PathBuf,
    /// Defaults to `source` with the library extension.
    pub destination: Option<PathBuf>,
    /// Defaults to the directory of the running executable.
    pub template_dir: Option<PathBuf>,
    pub overwrite: bool,
}

impl ExportRequest {
    pub fn new(kind: PluginKind, source: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            source: source.into(),
            destination: None,
            template_dir: None,
            overwrite: false,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Where the plugin library will be written.
    pub fn artifact_path(&self) -> PathBuf {
        self.destination
            .clone()
            .unwrap_or_else(|| self.source.clone())
            .with_extension(DLL_EXTENSION)
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub artifact: PathBuf,
    /// The document written beside the artifact.
    pub document: PathBuf,
    pub plugin_id: [u8; 4],
    pub id_patches: PatchReport,
    pub name_patches: PatchReport,
    /// Non-fatal problems to show the user.
    pub warnings: Vec<String>,
}

impl ExportReport {
    pub fn plugin_id_str(&self) -> &str {
        std::str::from_utf8(&self.plugin_id).unwrap_or("????")
    }
}

/// Export `request.source` as a plugin.
///
/// A missing template, an existing destination (without `overwrite`) or a
/// failed copy abort the export. Missing placeholders in the template do
/// not: they are logged and listed in [`ExportReport::warnings`].
pub fn export_plugin(request: &ExportRequest) -> Result<ExportReport> {
    let template_dir = match &request.template_dir {
        Some(dir) => dir.clone(),
        None => default_template_dir()?,
    };
    let template = template_dir.join(request.kind.template_file_name());
    if !template.is_file() {
        return Err(ExportError::ArtifactMissing { path: template });
    }

    let text = fs::read_to_string(&request.source).map_err(ExportError::io(&request.source))?;

    let artifact = request.artifact_path();
    if artifact.exists() && !request.overwrite {
        return Err(ExportError::DestinationExists(artifact));
    }
    fs::copy(&template, &artifact).map_err(|source| ExportError::ArtifactCopyFailed {
        from: template.clone(),
        to: artifact.clone(),
        source,
    })?;
    log::info!("copied {} to {}", template.display(), artifact.display());

    let document = artifact.with_extension("csd");
    if !same_file(&document, &request.source) {
        fs::write(&document, &text).map_err(ExportError::io(&document))?;
    }

    let mut warnings = Vec::new();
    let stem = file_stem(&artifact);
    let plugin_id = match OrchestraDocument::parse(text).plugin_id() {
        Some(id) => match normalize_plugin_id(id) {
            Some(bytes) => bytes,
            None => {
                warnings.push(format!(
                    "pluginid(\"{}\") is not 4 ASCII characters, deriving one from the file name",
                    id
                ));
                derive_plugin_id(&stem)
            }
        },
        None => derive_plugin_id(&stem),
    };

    let id_patches = patcher::patch_id(&artifact, plugin_id).map_err(ExportError::io(&artifact))?;
    if !id_patches.found() {
        warnings.push(format!(
            "plugin ID placeholder not found in {}",
            artifact.display()
        ));
    }
    let name_patches = patcher::patch_name(&artifact, &stem).map_err(ExportError::io(&artifact))?;
    if !name_patches.found() {
        warnings.push(format!(
            "plugin name placeholder not found in {}",
            artifact.display()
        ));
    }

    Ok(ExportReport {
        artifact,
        document,
        plugin_id,
        id_patches,
        name_patches,
        warnings,
    })
}

/// The running executable's directory.
pub fn default_template_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(ExportError::io("<current executable>"))?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// A 4-byte ID from a file stem: its first four ASCII alphanumerics,
/// lowercased, padded with `_`.
pub fn derive_plugin_id(stem: &str) -> [u8; 4] {
    let mut id = [b'_'; 4];
    for (slot, c) in id.iter_mut().zip(
        stem.bytes()
            .filter(u8::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase()),
    ) {
        *slot = c;
    }
    id
}

/// A declared `pluginid` as 4 bytes. Shorter IDs are padded with `_`.
pub fn normalize_plugin_id(id: &str) -> Option<[u8; 4]> {
    if id.is_empty() || id.len() > 4 || !id.bytes().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    let mut bytes = [b'_'; 4];
    bytes[..id.len()].copy_from_slice(id.as_bytes());
    Some(bytes)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::{ID_PLACEHOLDER, NAME_PLACEHOLDER};

    const DOC: &str = r#"<Cabbage>
form caption("Tape Delay") size(400, 200), pluginid("TpD1")
</Cabbage>
<CsoundSynthesizer>
<CsInstruments>
instr 1
endin
</CsInstruments>
</CsoundSynthesizer>
"#;

    fn template_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 256];
        bytes[16..20].copy_from_slice(ID_PLACEHOLDER);
        bytes[100..104].copy_from_slice(ID_PLACEHOLDER);
        bytes[140..156].copy_from_slice(NAME_PLACEHOLDER);
        bytes
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(kind: PluginKind, template: Option<Vec<u8>>, doc: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("templates")).unwrap();
            if let Some(bytes) = template {
                fs::write(
                    dir.path().join("templates").join(kind.template_file_name()),
                    bytes,
                )
                .unwrap();
            }
            fs::write(dir.path().join("TapeDelay.csd"), doc).unwrap();
            Self { dir }
        }

        fn request(&self, kind: PluginKind) -> ExportRequest {
            ExportRequest::new(kind, self.dir.path().join("TapeDelay.csd"))
                .with_template_dir(self.dir.path().join("templates"))
                .with_destination(self.dir.path().join("out").join("TapeDelay"))
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(PluginKind::from_name("effect"), Some(PluginKind::Effect));
        assert_eq!(PluginKind::from_name("VSTi"), Some(PluginKind::Synth));
        assert_eq!(PluginKind::from_name("lv2-fx"), Some(PluginKind::Lv2Effect));
        assert_eq!(PluginKind::from_name("au"), None);
        assert!(PluginKind::Lv2Synth
            .template_file_name()
            .starts_with("CabbagePluginSynthLV2."));
    }

    #[test]
    fn test_derive_plugin_id() {
        assert_eq!(&derive_plugin_id("TapeDelay"), b"tape");
        assert_eq!(&derive_plugin_id("my-fx"), b"myfx");
        assert_eq!(&derive_plugin_id("a1"), b"a1__");
        assert_eq!(&derive_plugin_id("---"), b"____");
    }

    #[test]
    fn test_normalize_plugin_id() {
        assert_eq!(normalize_plugin_id("TpD1"), Some(*b"TpD1"));
        assert_eq!(normalize_plugin_id("ab"), Some(*b"ab__"));
        assert_eq!(normalize_plugin_id("toolong"), None);
        assert_eq!(normalize_plugin_id(""), None);
    }

    #[test]
    fn test_missing_template() {
        let fixture = Fixture::new(PluginKind::Synth, None, DOC);
        let err = export_plugin(&fixture.request(PluginKind::Synth)).unwrap_err();
        match err {
            ExportError::ArtifactMissing { path } => {
                assert!(path.ends_with(PluginKind::Synth.template_file_name()))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_export_patches_copy_and_writes_document() {
        let fixture = Fixture::new(PluginKind::Effect, Some(template_bytes()), DOC);
        fs::create_dir(fixture.dir.path().join("out")).unwrap();
        let report = export_plugin(&fixture.request(PluginKind::Effect)).unwrap();

        assert_eq!(report.plugin_id_str(), "TpD1");
        assert_eq!(report.id_patches.offsets, vec![16, 100]);
        assert_eq!(report.name_patches.offsets, vec![140]);
        assert!(report.warnings.is_empty());

        let artifact = fs::read(&report.artifact).unwrap();
        assert_eq!(&artifact[16..20], b"TpD1");
        assert_eq!(&artifact[100..104], b"TpD1");
        assert_eq!(&artifact[140..156], b"TapeDelay       ");
        assert_eq!(fs::read_to_string(&report.document).unwrap(), DOC);
        assert_eq!(report.document.file_name().unwrap(), "TapeDelay.csd");

        // the template itself is untouched
        let template = fixture
            .dir
            .path()
            .join("templates")
            .join(PluginKind::Effect.template_file_name());
        assert_eq!(fs::read(template).unwrap(), template_bytes());
    }

    #[test]
    fn test_export_without_pluginid_derives_one() {
        let doc = DOC.replace(", pluginid(\"TpD1\")", "");
        let fixture = Fixture::new(PluginKind::Effect, Some(template_bytes()), &doc);
        fs::create_dir(fixture.dir.path().join("out")).unwrap();
        let report = export_plugin(&fixture.request(PluginKind::Effect)).unwrap();
        assert_eq!(&report.plugin_id, b"tape");
    }

    #[test]
    fn test_existing_destination_needs_overwrite() {
        let fixture = Fixture::new(PluginKind::Effect, Some(template_bytes()), DOC);
        fs::create_dir(fixture.dir.path().join("out")).unwrap();
        let request = fixture.request(PluginKind::Effect);
        fs::write(request.artifact_path(), b"old").unwrap();

        assert!(matches!(
            export_plugin(&request),
            Err(ExportError::DestinationExists(_))
        ));
        let report = export_plugin(&request.with_overwrite(true)).unwrap();
        assert_eq!(fs::read(&report.artifact).unwrap().len(), 256);
    }

    #[test]
    fn test_copy_failure() {
        let fixture = Fixture::new(PluginKind::Effect, Some(template_bytes()), DOC);
        // "out" directory was never created
        let err = export_plugin(&fixture.request(PluginKind::Effect)).unwrap_err();
        assert!(matches!(err, ExportError::ArtifactCopyFailed { .. }));
    }

    #[test]
    fn test_template_without_placeholders_warns() {
        let fixture = Fixture::new(PluginKind::Effect, Some(vec![0u8; 64]), DOC);
        fs::create_dir(fixture.dir.path().join("out")).unwrap();
        let report = export_plugin(&fixture.request(PluginKind::Effect)).unwrap();
        assert!(!report.id_patches.found());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_default_destination_is_beside_source() {
        let request = ExportRequest::new(PluginKind::Effect, "/tmp/plugins/Chorus.csd");
        assert_eq!(
            request.artifact_path(),
            PathBuf::from("/tmp/plugins/Chorus").with_extension(DLL_EXTENSION)
        );
    }
}
