use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use accel_cl::{device_info, get_platforms, Backend, Context, Device, Platform, Program};
use accel_soft::{SoftConfig, SoftRuntime};
use anyhow::{anyhow, bail, Context as _};
use clap::Parser;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    name = "accel-clc",
    about = "Build device source offline, print its build log and optionally embed it in a Rust module."
)]
struct Args {
    /// List platforms and devices, then exit
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with_all = ["input", "output"])]
    list: bool,

    /// Device source file to build
    #[arg(required_unless_present = "list")]
    input: Option<PathBuf>,

    /// Rust module to write (defaults to "<input stem>.rs" next to the input; needs --emit-rust)
    output: Option<PathBuf>,

    /// Platform index as shown by --list
    #[arg(long, value_name = "N", default_value_t = 0)]
    platform: usize,

    /// Device index within the platform as shown by --list
    #[arg(long, value_name = "N", default_value_t = 0)]
    device: usize,

    /// Build options passed through verbatim
    #[arg(long, value_name = "STR", default_value = "", allow_hyphen_values = true)]
    options: String,

    /// Write a Rust module embedding the source after a successful build
    #[arg(long, action = clap::ArgAction::SetTrue)]
    emit_rust: bool,

    /// JSON description of the software platform (defaults to ACCEL_SOFT_* environment overrides)
    #[arg(long, value_name = "FILE.json")]
    device_config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run(Args::parse())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.device_config.as_deref())?;
    let runtime = SoftRuntime::new(config).context("start software platform")?;
    let backend: Arc<dyn Backend> = runtime;
    let platforms = get_platforms(&backend).context("enumerate platforms")?;

    if args.list {
        return list(&platforms);
    }

    let Some(input) = args.input.as_deref() else {
        bail!("an INPUT file is required unless --list is given");
    };
    if args.output.is_some() && !args.emit_rust {
        bail!("OUTPUT is only written with --emit-rust");
    }

    let platform = platforms.get(args.platform).ok_or_else(|| {
        anyhow!(
            "platform index {} out of range ({} available)",
            args.platform,
            platforms.len()
        )
    })?;
    let devices = platform
        .get_devices()
        .with_context(|| format!("enumerate devices of platform {}", args.platform))?;
    let device = devices.get(args.device).ok_or_else(|| {
        anyhow!(
            "device index {} out of range ({} available on platform {})",
            args.device,
            devices.len(),
            args.platform
        )
    })?;

    let source =
        fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
    let kernels = build(platform, device, &source, &args.options)
        .with_context(|| format!("build {}", input.display()))?;

    for name in &kernels {
        println!("kernel {name}");
    }

    if args.emit_rust {
        let output = match args.output {
            Some(path) => path,
            None => input.with_extension("rs"),
        };
        let module = rust_module(input, &source, &args.options, &kernels)?;
        fs::write(&output, module).with_context(|| format!("write {}", output.display()))?;
        info!(path = %output.display(), "wrote rust module");
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SoftConfig> {
    match path {
        Some(path) => {
            let json =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            SoftConfig::from_json(&json).with_context(|| format!("parse {}", path.display()))
        }
        None => SoftConfig::from_env().context("read ACCEL_SOFT_* environment"),
    }
}

fn list(platforms: &[Platform]) -> anyhow::Result<()> {
    for (p, platform) in platforms.iter().enumerate() {
        println!(
            "platform {p}: {} ({}, {})",
            platform.name(),
            platform.vendor(),
            platform.version()
        );
        let devices = platform
            .get_devices()
            .with_context(|| format!("enumerate devices of platform {p}"))?;
        for (d, device) in devices.iter().enumerate() {
            let kind = device.info(device_info::TYPE)?;
            println!(
                "  device {d}: {} [{}] compute units {}, global memory {} bytes",
                device.name()?,
                accel_cl::InfoValue::render(&kind),
                device.max_compute_units()?,
                device.global_mem_size()?,
            );
        }
    }
    Ok(())
}

/// Builds `source` for `device` and returns its kernel names.
fn build(
    platform: &Platform,
    device: &Device,
    source: &str,
    options: &str,
) -> anyhow::Result<Vec<String>> {
    let context = Context::new(platform, std::slice::from_ref(device))?;
    let program = Program::with_source(&context, source)?;
    debug!(options, "building");

    // A failed build carries its logs in the error itself.
    program.build_for(std::slice::from_ref(device), options)?;
    let log = program.build_log(device);
    if !log.trim().is_empty() {
        eprint!("{log}");
    }
    Ok(program.kernel_names()?)
}

fn rust_module(
    input: &Path,
    source: &str,
    options: &str,
    kernels: &[String],
) -> anyhow::Result<String> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file stem", input.display()))?;
    let ident = const_ident(stem);
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = String::new();
    writeln!(out, "// Generated by accel-clc from {file_name}. Do not edit.")?;
    writeln!(out)?;
    writeln!(out, "/// Device source of `{file_name}`.")?;
    writeln!(out, "pub const {ident}_SOURCE: &str = {};", raw_literal(source))?;
    writeln!(out)?;
    writeln!(out, "/// Options the source was checked with.")?;
    writeln!(out, "pub const {ident}_OPTIONS: &str = {options:?};")?;
    writeln!(out)?;
    let names: Vec<String> = kernels.iter().map(|k| format!("{k:?}")).collect();
    writeln!(out, "pub const {ident}_KERNELS: &[&str] = &[{}];", names.join(", "))?;
    Ok(out)
}

/// Upper-cased stem with every non-identifier character replaced by `_`.
fn const_ident(stem: &str) -> String {
    let mut ident: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// A raw string literal with enough `#`s that no run inside `text` can close it.
fn raw_literal(text: &str) -> String {
    let mut longest = 0;
    let mut run = None::<usize>;
    for c in text.chars() {
        run = match (c, run) {
            ('"', _) => Some(0),
            ('#', Some(n)) => Some(n + 1),
            _ => None,
        };
        if let Some(n) = run {
            longest = longest.max(n + 1);
        }
    }
    let hashes = "#".repeat(longest);
    format!("r{hashes}\"{text}\"{hashes}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_come_from_the_stem() {
        assert_eq!(const_ident("square"), "SQUARE");
        assert_eq!(const_ident("blur-5x5.v2"), "BLUR_5X5_V2");
        assert_eq!(const_ident("3d"), "_3D");
    }

    #[test]
    fn raw_literals_outlast_embedded_quotes() {
        assert_eq!(raw_literal("plain"), "r\"plain\"");
        assert_eq!(raw_literal("a \"b\""), "r#\"a \"b\"\"#");
        assert_eq!(raw_literal("x \"## y"), "r###\"x \"## y\"###");
    }
}
