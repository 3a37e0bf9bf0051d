use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use prefix_pack::config::{load_config, PackConfig};
use prefix_pack::{CondaMetaBaseline, PackOptions, PackageRequest, Packer, Platform};

const CONFIG_FLAG: &str = "--config";

fn usage() -> &'static str {
    "Usage:\n  prefix-pack build <prefix> <name> <version> <build_number> [--config <file>]\n  prefix-pack list <prefix> <name> <version> <build_number> [--config <file>]"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (args, config_path) = split_config_flag(args)?;

    match args.as_slice() {
        [cmd, prefix, name, version, build_number] if cmd == "build" => build(
            Path::new(prefix),
            &parse_request(name, version, build_number)?,
            config_path.as_deref(),
        ),
        [cmd, prefix, name, version, build_number] if cmd == "list" => list(
            Path::new(prefix),
            &parse_request(name, version, build_number)?,
            config_path.as_deref(),
        ),
        _ => bail!(usage()),
    }
}

fn split_config_flag(args: Vec<String>) -> Result<(Vec<String>, Option<PathBuf>)> {
    let mut rest = Vec::with_capacity(args.len());
    let mut config = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == CONFIG_FLAG {
            let Some(path) = iter.next() else {
                bail!("{CONFIG_FLAG} requires a file argument\n{}", usage());
            };
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((rest, config))
}

fn parse_request(name: &str, version: &str, build_number: &str) -> Result<PackageRequest> {
    let build_number = build_number
        .parse::<u64>()
        .with_context(|| format!("build number must be a non-negative integer, got '{build_number}'"))?;
    Ok(PackageRequest::new(name, version, build_number))
}

fn resolve_options(config_path: Option<&Path>) -> Result<PackOptions> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => PackConfig::default(),
    };
    let cwd = std::env::current_dir().context("resolving current directory")?;
    config.into_options(&cwd, Platform::host())
}

fn build(prefix: &Path, request: &PackageRequest, config_path: Option<&Path>) -> Result<()> {
    let options = resolve_options(config_path)?;
    let packer = Packer::new(&CondaMetaBaseline, options);
    let packed = packer.pack(prefix, request).with_context(|| {
        format!(
            "packaging '{}' from prefix '{}'",
            request.name,
            prefix.display()
        )
    })?;

    println!("{}", packed.archive.path.display());
    Ok(())
}

fn list(prefix: &Path, request: &PackageRequest, config_path: Option<&Path>) -> Result<()> {
    let options = resolve_options(config_path)?;
    let packer = Packer::new(&CondaMetaBaseline, options);
    let plan = packer
        .plan(prefix, request)
        .with_context(|| format!("planning package from prefix '{}'", prefix.display()))?;

    println!("# {}", plan.archive_name);
    for file in &plan.files {
        println!("{file}");
    }
    Ok(())
}
