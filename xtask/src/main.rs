//! Command-line tooling for Cabbage documents.
//!
//! Usage: cargo xtask <command> ...
//!   export <kind> <file.csd> [--output PATH] [--templates DIR] [--force] [--verbose]
//!   patch <artifact> [--id XXXX] [--name NAME] [--verbose]
//!   inspect <file.csd>

mod util;

use std::fs;
use std::path::{Path, PathBuf};

use cabbage_core::OrchestraDocument;
use cabbage_export::{export_plugin, patch_id, patch_name, ExportRequest, PluginKind};

use util::{flag_value, parse_plugin_id, positionals, print_error, print_warning, shorten_path};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    let Some(command) = args.first() else {
        print_usage();
        std::process::exit(1);
    };
    let rest = &args[1..];

    let result = match command.as_str() {
        "export" => export(rest, verbose),
        "patch" => patch(rest, verbose),
        "inspect" => inspect(rest),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => Err(format!("Unknown command '{}'", other)),
    };

    if let Err(e) = result {
        print_error(&e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise warnings, or debug output with `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn print_usage() {
    eprintln!("Usage: cargo xtask <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  export <kind> <file.csd>   Export a document as a plugin");
    eprintln!("  patch <artifact>           Rewrite the ID or name of an exported plugin");
    eprintln!("  inspect <file.csd>         List the channels a document declares");
    eprintln!();
    eprintln!("Kinds:");
    eprintln!("  effect, synth, lv2-effect, lv2-synth");
    eprintln!();
    eprintln!("Export options:");
    eprintln!("  --output PATH     Plugin path (default: next to the document)");
    eprintln!("  --templates DIR   Directory holding the plugin templates");
    eprintln!("  --force           Overwrite an existing plugin");
    eprintln!();
    eprintln!("Patch options:");
    eprintln!("  --id XXXX         4-character plugin ID");
    eprintln!("  --name NAME       Plugin name (at most 16 bytes)");
    eprintln!();
    eprintln!("  --verbose         Show debug output (RUST_LOG overrides)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  cargo xtask export synth ~/Cabbage/Pad.csd --force");
    eprintln!("  cargo xtask patch Pad.so --id Pad1");
}

fn export(args: &[String], verbose: bool) -> Result<(), String> {
    let valued = ["--output", "--templates"];
    let positional = positionals(args, &valued);
    let [kind, source] = positional[..] else {
        return Err("export expects <kind> <file.csd>".to_string());
    };
    let kind = PluginKind::from_name(kind).ok_or_else(|| {
        format!(
            "Unknown plugin kind '{}', expected effect, synth, lv2-effect or lv2-synth",
            kind
        )
    })?;

    let mut request =
        ExportRequest::new(kind, source).with_overwrite(args.iter().any(|a| a == "--force"));
    if let Some(output) = flag_value(args, "--output")? {
        request = request.with_destination(output);
    }
    if let Some(dir) = flag_value(args, "--templates")? {
        request = request.with_template_dir(dir);
    }

    verbose!(verbose, "Template: {}", kind.template_file_name());
    let report = export_plugin(&request).map_err(|e| e.to_string())?;

    for warning in &report.warnings {
        print_warning(warning);
    }
    status!(
        "Exported {} ({})",
        shorten_path(&report.artifact),
        report.plugin_id_str()
    );
    verbose!(verbose, "  Document: {}", shorten_path(&report.document));
    verbose!(
        verbose,
        "  ID written at {:?}, name at {:?}",
        report.id_patches.offsets,
        report.name_patches.offsets
    );
    Ok(())
}

fn patch(args: &[String], verbose: bool) -> Result<(), String> {
    let positional = positionals(args, &["--id", "--name"]);
    let [artifact] = positional[..] else {
        return Err("patch expects <artifact>".to_string());
    };
    let artifact = PathBuf::from(artifact);
    if !artifact.is_file() {
        return Err(format!("{} does not exist", shorten_path(&artifact)));
    }

    let id = flag_value(args, "--id")?.map(parse_plugin_id).transpose()?;
    let name = flag_value(args, "--name")?;
    if id.is_none() && name.is_none() {
        return Err("patch needs --id or --name".to_string());
    }

    if let Some(id) = id {
        let report = patch_id(&artifact, id).map_err(|e| io_error(&artifact, e))?;
        if !report.found() {
            print_warning("plugin ID placeholder not found, the plugin may already be patched");
        }
        verbose!(verbose, "  ID written at {:?}", report.offsets);
    }
    if let Some(name) = name {
        let report = patch_name(&artifact, name).map_err(|e| io_error(&artifact, e))?;
        if !report.found() {
            print_warning("plugin name placeholder not found, the plugin may already be patched");
        }
        verbose!(verbose, "  Name written at {:?}", report.offsets);
    }
    status!("Patched {}", shorten_path(&artifact));
    Ok(())
}

fn inspect(args: &[String]) -> Result<(), String> {
    let positional = positionals(args, &[]);
    let [source] = positional[..] else {
        return Err("inspect expects <file.csd>".to_string());
    };
    let path = Path::new(source);
    let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let document = OrchestraDocument::parse(text);
    if !document.has_orchestra() {
        print_warning("no <CsInstruments> section found");
    }

    status!("{}", shorten_path(path));
    if let Some(id) = document.plugin_id() {
        status!("  Plugin ID: {}", id);
    }
    status!(
        "  Audio: {} in, {} out",
        document.intended_input_count(),
        document.intended_channel_count()
    );
    for channel in document.channel_declarations() {
        status!(
            "  {:<20} {:?} {:?} default {}",
            channel.name,
            channel.rate,
            channel.direction,
            channel.default_value
        );
    }
    Ok(())
}

fn io_error(path: &Path, e: std::io::Error) -> String {
    format!("{}: {}", shorten_path(path), e)
}
