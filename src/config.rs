//! Packer configuration file.
//!
//! ```toml
//! [pack]
//! output_dir = "dist"
//! format = "tar.bz2"
//! placeholder = "/opt/anaconda1anaconda2anaconda3"
//! platform = "linux"
//! arch = "x86_64"
//! extra_excludes = ["share/doc/"]
//! ```
//!
//! Every key is optional.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::ArchiveFormat;
use crate::manifest::Platform;
use crate::pack::PackOptions;
use crate::relocate::ShebangRelocator;
use crate::select::ExclusionRules;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    pack: PackConfig,
}

/// The `[pack]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackConfig {
    pub output_dir: Option<PathBuf>,
    pub format: Option<String>,
    pub placeholder: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    #[serde(default)]
    pub extra_excludes: Vec<String>,
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> Result<PackConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading packer config '{}'", path.display()))?;
    parse_config(&text).with_context(|| format!("parsing packer config '{}'", path.display()))
}

/// Parse configuration text.
pub fn parse_config(text: &str) -> Result<PackConfig> {
    let parsed: ConfigToml = toml::from_str(text)?;
    Ok(parsed.pack)
}

impl PackConfig {
    /// Resolve into packer options.
    ///
    /// `base_dir` anchors a relative `output_dir` and is the output directory
    /// when none is configured. `host` supplies platform values not set here.
    pub fn into_options(self, base_dir: &Path, host: Platform) -> Result<PackOptions> {
        let output_dir = match self.output_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };

        let platform = Platform::new(
            non_empty("platform", self.platform)?.unwrap_or(host.platform),
            non_empty("arch", self.arch)?.unwrap_or(host.arch),
        );

        let mut options = PackOptions::new(output_dir, platform);

        if let Some(format) = self.format {
            options.format = format.parse::<ArchiveFormat>().map_err(anyhow::Error::msg)?;
        }

        if let Some(placeholder) = non_empty("placeholder", self.placeholder)? {
            if !placeholder.starts_with('/') {
                bail!("placeholder must be an absolute path, got '{}'", placeholder);
            }
            options.relocator = ShebangRelocator::new(placeholder);
        }

        let mut extra = Vec::with_capacity(self.extra_excludes.len());
        for raw in self.extra_excludes {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                bail!("extra_excludes entries must not be empty");
            }
            if trimmed.starts_with('/') {
                bail!(
                    "extra_excludes entries are prefix-relative, got absolute '{}'",
                    trimmed
                );
            }
            extra.push(trimmed.to_string());
        }
        options.rules = ExclusionRules::default().with_extra_prefixes(extra);

        Ok(options)
    }
}

fn non_empty(field: &str, value: Option<String>) -> Result<Option<String>> {
    match value {
        Some(v) if v.trim().is_empty() => bail!("{field} must not be empty"),
        Some(v) => Ok(Some(v.trim().to_string())),
        None => Ok(None),
    }
}
