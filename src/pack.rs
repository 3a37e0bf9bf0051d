//! Archive assembly: turning a prefix snapshot into one package file.
//!
//! [`Packer::plan`] decides what goes into the package without touching the
//! filesystem beyond reading it. [`Packer::pack`] writes the archive:
//!
//! ```text
//! walk prefix ──┐
//!               ├─> select new files ──> python requirement ──> PackageInfo
//! baseline ─────┘          │
//!                          └─> per file: relocate shebang? ──> tar entry
//!                                                   └─> info/{files,index.json,has_prefix}
//! ```
//!
//! All rewritten scripts and manifest members live in a scoped staging
//! directory that is removed on every exit path. The archive itself only
//! appears under its final name after it has been completely written.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::archive::{ArchiveFormat, ArchiveSummary, ArchiveWriter};
use crate::baseline::BaselineProvider;
use crate::error::{IoContext, PackError, Result};
use crate::manifest::{python_requirement, PackageInfo, Platform};
use crate::relocate::ShebangRelocator;
use crate::select::{select_new_files, ExclusionRules};
use crate::walk::walk_files;

/// Directory of metadata members inside the archive.
pub const INFO_DIR: &str = "info";

const FILES_MEMBER: &str = "files";
const INDEX_MEMBER: &str = "index.json";
const HAS_PREFIX_MEMBER: &str = "has_prefix";

/// Identity of the package being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub name: String,
    pub version: String,
    pub build_number: u64,
}

impl PackageRequest {
    pub fn new(name: impl Into<String>, version: impl Into<String>, build_number: u64) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            build_number,
        }
    }

    fn validate(&self) -> Result<()> {
        check_component("name", &self.name)?;
        check_component("version", &self.version)?;
        if self.version.contains('-') {
            return Err(PackError::InvalidPackage {
                field: "version",
                value: self.version.clone(),
                reason: "must not contain '-'",
            });
        }
        Ok(())
    }
}

fn check_component(field: &'static str, value: &str) -> Result<()> {
    let reason = if value.trim().is_empty() {
        "must not be empty"
    } else if value.contains('/') || value.contains('\\') {
        "must not contain path separators"
    } else if value.chars().any(char::is_whitespace) {
        "must not contain whitespace"
    } else {
        return Ok(());
    };
    Err(PackError::InvalidPackage {
        field,
        value: value.to_string(),
        reason,
    })
}

/// Settings shared by every package built with one [`Packer`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Directory the archive is written to.
    pub output_dir: PathBuf,
    pub format: ArchiveFormat,
    pub platform: Platform,
    pub rules: ExclusionRules,
    pub relocator: ShebangRelocator,
    /// Parent for the staging directory; the system temp dir when unset.
    pub staging_root: Option<PathBuf>,
}

impl PackOptions {
    pub fn new(output_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            output_dir: output_dir.into(),
            format: ArchiveFormat::default(),
            platform,
            rules: ExclusionRules::default(),
            relocator: ShebangRelocator::default(),
            staging_root: None,
        }
    }
}

/// What a package would contain, computed without writing anything.
#[derive(Debug, Clone)]
pub struct PackagePlan {
    pub prefix: PathBuf,
    /// Selected prefix-relative paths, sorted.
    pub files: Vec<String>,
    pub info: PackageInfo,
    /// File name of the archive, e.g. `foo-1.0-py27_0.tar.bz2`.
    pub archive_name: String,
}

/// A package archive that was written successfully.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    pub info: PackageInfo,
    pub files: Vec<String>,
    /// Files whose interpreter directive was rewritten.
    pub has_prefix: Vec<String>,
    pub archive: ArchiveSummary,
}

/// Builds package archives from prefix snapshots.
pub struct Packer<'a> {
    baseline: &'a dyn BaselineProvider,
    options: PackOptions,
}

impl<'a> Packer<'a> {
    pub fn new(baseline: &'a dyn BaselineProvider, options: PackOptions) -> Self {
        Self { baseline, options }
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Determine the package contents and metadata for `prefix`.
    pub fn plan(&self, prefix: &Path, request: &PackageRequest) -> Result<PackagePlan> {
        request.validate()?;

        let walked = walk_files(prefix)?;
        let tracked = self.baseline.tracked_files(prefix)?;
        let selected = select_new_files(&walked, &tracked, &self.options.rules);
        info!(
            "{}: {} files on disk, {} tracked, {} new",
            prefix.display(),
            walked.len(),
            tracked.len(),
            selected.len()
        );

        let requires_python = python_requirement(&selected, self.baseline, prefix)?;
        let info = PackageInfo::new(
            &request.name,
            &request.version,
            request.build_number,
            &self.options.platform,
            requires_python,
        );
        let archive_name = format!("{}.{}", info.dist_name(), self.options.format.extension());

        Ok(PackagePlan {
            prefix: prefix.to_path_buf(),
            files: selected.into_iter().collect(),
            info,
            archive_name,
        })
    }

    /// Write the package archive for `prefix` into the output directory.
    pub fn pack(&self, prefix: &Path, request: &PackageRequest) -> Result<PackedArchive> {
        let plan = self.plan(prefix, request)?;
        let packed = self.with_staging(|staging| self.write_archive(&plan, staging))?;

        info!(
            "wrote {} ({} bytes, sha256 {})",
            packed.archive.path.display(),
            packed.archive.size_bytes,
            packed.archive.sha256
        );
        Ok(packed)
    }

    /// Run `f` in a fresh staging directory that is removed whatever `f` returns.
    fn with_staging<T>(&self, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let staging = self.create_staging()?;
        let result = f(staging.path());
        let staging_path = staging.path().to_path_buf();
        let cleanup = staging
            .close()
            .io_context(|| format!("removing staging directory '{}'", staging_path.display()));

        let value = result?;
        cleanup?;
        Ok(value)
    }

    fn create_staging(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("prefix-pack-");
        match &self.options.staging_root {
            Some(root) => builder
                .tempdir_in(root)
                .io_context(|| format!("creating staging directory in '{}'", root.display())),
            None => builder
                .tempdir()
                .io_context(|| "creating staging directory"),
        }
    }

    fn write_archive(&self, plan: &PackagePlan, staging: &Path) -> Result<PackedArchive> {
        let output_dir = &self.options.output_dir;
        fs::create_dir_all(output_dir)
            .io_context(|| format!("creating output directory '{}'", output_dir.display()))?;

        let destination = output_dir.join(&plan.archive_name);
        let mut writer = ArchiveWriter::create(&destination, self.options.format)?;

        let mut has_prefix = Vec::new();
        for rel in &plan.files {
            let staged = if ShebangRelocator::applies_to(rel) {
                self.options.relocator.relocate(staging, &plan.prefix, rel)?
            } else {
                None
            };
            match staged {
                Some(staged) => {
                    writer.append_path(&staged, rel)?;
                    has_prefix.push(rel.clone());
                }
                None => writer.append_path(&plan.prefix.join(rel), rel)?,
            }
        }
        debug!("{} files need prefix substitution", has_prefix.len());

        let info_dir = staging.join(INFO_DIR);
        fs::create_dir_all(&info_dir)
            .io_context(|| format!("creating '{}'", info_dir.display()))?;

        let mut members = vec![
            (FILES_MEMBER, line_list(&plan.files)),
            (INDEX_MEMBER, plan.info.to_index_json()?),
        ];
        if !has_prefix.is_empty() {
            members.push((HAS_PREFIX_MEMBER, line_list(&has_prefix)));
        }
        for (member, content) in members {
            let path = write_info_member(&info_dir, member, &content)?;
            writer.append_path(&path, &format!("{}/{}", INFO_DIR, member))?;
        }

        let archive = writer.finish()?;
        Ok(PackedArchive {
            info: plan.info.clone(),
            files: plan.files.clone(),
            has_prefix,
            archive,
        })
    }
}

fn line_list(paths: &[String]) -> String {
    paths.iter().map(|p| format!("{}\n", p)).collect()
}

fn write_info_member(info_dir: &Path, member: &str, content: &str) -> Result<PathBuf> {
    let path = info_dir.join(member);
    fs::write(&path, content).io_context(|| format!("writing '{}'", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
        .io_context(|| format!("setting permissions on '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::open_archive;
    use crate::baseline::{CondaMetaBaseline, StaticBaseline};
    use crate::FileSet;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        prefix: PathBuf,
        output: PathBuf,
        staging_root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let prefix = temp.path().join("prefix");
            let output = temp.path().join("dist");
            let staging_root = temp.path().join("staging");
            fs::create_dir_all(&prefix).unwrap();
            fs::create_dir_all(&staging_root).unwrap();
            Self {
                _temp: temp,
                prefix,
                output,
                staging_root,
            }
        }

        fn write(&self, rel: &str, content: &[u8]) {
            let path = self.prefix.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn options(&self) -> PackOptions {
            let mut options = PackOptions::new(&self.output, Platform::new("linux", "x86_64"));
            options.staging_root = Some(self.staging_root.clone());
            options
        }

        fn staging_is_empty(&self) -> bool {
            fs::read_dir(&self.staging_root).unwrap().count() == 0
        }

        fn output_entries(&self) -> usize {
            match fs::read_dir(&self.output) {
                Ok(rd) => rd.count(),
                Err(_) => 0,
            }
        }
    }

    fn read_members(path: &Path, format: ArchiveFormat) -> BTreeMap<String, Vec<u8>> {
        let mut archive = open_archive(path, format).unwrap();
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(name, data);
        }
        out
    }

    #[test]
    fn test_pack_end_to_end() {
        let fx = Fixture::new();
        fx.write("bin/run", b"#!/usr/bin/python\nimport x\n");
        fx.write("lib/x.py", b"print(1)\n");
        fx.write("LICENSE.txt", b"license");

        let baseline = StaticBaseline::default();
        let packer = Packer::new(&baseline, fx.options());
        let packed = packer
            .pack(&fx.prefix, &PackageRequest::new("run", "1.0", 0))
            .unwrap();

        assert_eq!(packed.archive.path, fx.output.join("run-1.0-0.tar.bz2"));
        assert_eq!(packed.files, vec!["bin/run", "lib/x.py"]);
        assert_eq!(packed.has_prefix, vec!["bin/run"]);

        let members = read_members(&packed.archive.path, ArchiveFormat::TarBz2);
        let names: Vec<&str> = members.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "bin/run",
                "info/files",
                "info/has_prefix",
                "info/index.json",
                "lib/x.py"
            ]
        );
        assert_eq!(
            members["bin/run"],
            b"#!/opt/anaconda1anaconda2anaconda3/bin/python\nimport x\n"
        );
        assert_eq!(members["lib/x.py"], b"print(1)\n");
        assert_eq!(members["info/files"], b"bin/run\nlib/x.py\n");
        assert_eq!(members["info/has_prefix"], b"bin/run\n");

        let index: serde_json::Value = serde_json::from_slice(&members["info/index.json"]).unwrap();
        assert_eq!(index["name"], "run");
        assert_eq!(index["build"], "0");
        assert_eq!(index["build_number"], 0);
        assert_eq!(index["requires"], serde_json::json!([]));

        assert!(fx.staging_is_empty());
        // Original script is untouched.
        let original = fs::read(fx.prefix.join("bin/run")).unwrap();
        assert!(original.starts_with(b"#!/usr/bin/python"));
    }

    #[test]
    fn test_pack_without_relocation_has_no_has_prefix() {
        let fx = Fixture::new();
        fx.write("bin/tool", b"#!/bin/sh\nexit 0\n");

        let baseline = StaticBaseline::default();
        let packed = Packer::new(&baseline, fx.options())
            .pack(&fx.prefix, &PackageRequest::new("tool", "2.0", 5))
            .unwrap();

        assert!(packed.has_prefix.is_empty());
        let members = read_members(&packed.archive.path, ArchiveFormat::TarBz2);
        assert!(!members.contains_key("info/has_prefix"));
        assert_eq!(members["bin/tool"], b"#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn test_pack_python_package_with_conda_meta() {
        let fx = Fixture::new();
        fx.write(
            "conda-meta/python-2.7.3-0.json",
            br#"{"name": "python", "version": "2.7.3", "files": ["bin/python", "lib/python2.7/os.py"]}"#,
        );
        fx.write("bin/python", b"\x7fELF");
        fx.write("lib/python2.7/os.py", b"");
        fx.write("lib/python2.7/os.pyc", b"");
        fx.write("lib/python2.7/site-packages/foo/__init__.py", b"");
        fx.write("lib/python2.7/site-packages/foo/__init__.py~", b"");

        let packer = Packer::new(&CondaMetaBaseline, fx.options());
        let request = PackageRequest::new("foo", "0.1", 3);

        let plan = packer.plan(&fx.prefix, &request).unwrap();
        assert_eq!(plan.files, vec!["lib/python2.7/site-packages/foo/__init__.py"]);
        assert_eq!(plan.info.build, "py27_3");
        assert_eq!(plan.info.requires, vec!["python 2.7"]);
        assert_eq!(plan.archive_name, "foo-0.1-py27_3.tar.bz2");
        // Planning writes nothing.
        assert_eq!(fx.output_entries(), 0);

        let packed = packer.pack(&fx.prefix, &request).unwrap();
        assert_eq!(packed.archive.path, fx.output.join("foo-0.1-py27_3.tar.bz2"));
    }

    #[test]
    fn test_pack_missing_python_version_aborts_before_archive() {
        let fx = Fixture::new();
        fx.write("lib/python3.11/site-packages/foo.py", b"");

        let baseline = StaticBaseline::default();
        let result = Packer::new(&baseline, fx.options())
            .pack(&fx.prefix, &PackageRequest::new("foo", "1.0", 0));

        assert!(matches!(
            result,
            Err(PackError::MissingDependencyVersion { .. })
        ));
        assert_eq!(fx.output_entries(), 0);
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_pack_failure_removes_staging_and_partial_archive() {
        let fx = Fixture::new();
        fx.write("bin/a", b"#!/usr/bin/python\nok\n");
        fx.write("bin/b", b"#!/usr/bin/python\n\xff\xfe");

        let baseline = StaticBaseline::default();
        let result = Packer::new(&baseline, fx.options())
            .pack(&fx.prefix, &PackageRequest::new("bad", "1.0", 0));

        assert!(matches!(result, Err(PackError::UnreadableExecutable { .. })));
        assert!(fx.staging_is_empty());
        assert_eq!(fx.output_entries(), 0);
    }

    #[test]
    fn test_manifest_write_failure_removes_staging_and_partial_archive() {
        let fx = Fixture::new();
        fx.write("bin/run", b"#!/usr/bin/python\nok\n");
        fx.write("lib/x.py", b"");

        let baseline = StaticBaseline::default();
        let packer = Packer::new(&baseline, fx.options());
        let plan = packer
            .plan(&fx.prefix, &PackageRequest::new("late", "1.0", 0))
            .unwrap();

        let mut payload_staged = false;
        let result = packer.with_staging(|staging| {
            // A plain file where the info directory goes fails the manifest write.
            fs::write(staging.join(INFO_DIR), b"").io_context(|| "blocking info dir")?;
            let result = packer.write_archive(&plan, staging);
            payload_staged = staging.join("payload/bin/run").is_file();
            result
        });

        match result {
            Err(PackError::Io { context, .. }) => {
                assert!(context.ends_with("info'"), "unexpected failure: {context}")
            }
            other => panic!("expected manifest write failure, got {other:?}"),
        }
        assert!(payload_staged);
        assert!(fx.staging_is_empty());
        assert_eq!(fx.output_entries(), 0);
    }

    #[test]
    fn test_pack_relocates_script_behind_bin_symlink() {
        let fx = Fixture::new();
        fx.write(
            "lib/python2.7/site-packages/pkg/cli.py",
            b"#!/build/prefix/bin/python\nmain()\n",
        );
        fs::create_dir_all(fx.prefix.join("bin")).unwrap();
        std::os::unix::fs::symlink(
            "../lib/python2.7/site-packages/pkg/cli.py",
            fx.prefix.join("bin/cli"),
        )
        .unwrap();
        std::os::unix::fs::symlink("nowhere", fx.prefix.join("bin/dangling")).unwrap();

        let baseline = StaticBaseline::default().with_version("python", "2.7.3");
        let packed = Packer::new(&baseline, fx.options())
            .pack(&fx.prefix, &PackageRequest::new("pkg", "1.0", 0))
            .unwrap();

        assert_eq!(packed.has_prefix, vec!["bin/cli"]);
        let mut archive = open_archive(&packed.archive.path, ArchiveFormat::TarBz2).unwrap();
        let mut kinds = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            kinds.insert(name, (entry.header().entry_type(), entry.header().mode().unwrap()));
        }
        assert_eq!(kinds["bin/cli"], (tar::EntryType::Regular, 0o755));
        assert_eq!(kinds["bin/dangling"].0, tar::EntryType::Symlink);

        let members = read_members(&packed.archive.path, ArchiveFormat::TarBz2);
        assert_eq!(
            members["bin/cli"],
            b"#!/opt/anaconda1anaconda2anaconda3/bin/python\nmain()\n"
        );
    }

    #[test]
    fn test_pack_baseline_files_excluded() {
        let fx = Fixture::new();
        fx.write("bin/old", b"old");
        fx.write("bin/new", b"new");
        fx.write("pkgs/cached.tar.bz2", b"x");

        let tracked: FileSet = ["bin/old".to_string()].into_iter().collect();
        let baseline = StaticBaseline::new(tracked);
        let mut options = fx.options();
        options.format = ArchiveFormat::TarZst;
        let packed = Packer::new(&baseline, options)
            .pack(&fx.prefix, &PackageRequest::new("new", "1", 1))
            .unwrap();

        assert_eq!(packed.archive.path, fx.output.join("new-1-1.tar.zst"));
        let members = read_members(&packed.archive.path, ArchiveFormat::TarZst);
        assert!(members.contains_key("bin/new"));
        assert!(!members.contains_key("bin/old"));
        assert!(!members.contains_key("pkgs/cached.tar.bz2"));
    }

    #[test]
    fn test_pack_is_reproducible() {
        let fx = Fixture::new();
        fx.write("bin/run", b"#!/usr/bin/env python\n");
        fx.write("share/data", b"data");

        let baseline = StaticBaseline::default();
        let packer = Packer::new(&baseline, fx.options());
        let request = PackageRequest::new("repro", "1.0", 0);
        let first = packer.pack(&fx.prefix, &request).unwrap();
        let second = packer.pack(&fx.prefix, &request).unwrap();
        assert_eq!(first.archive.sha256, second.archive.sha256);
    }

    #[test]
    fn test_invalid_request() {
        let fx = Fixture::new();
        let baseline = StaticBaseline::default();
        let packer = Packer::new(&baseline, fx.options());
        for request in [
            PackageRequest::new("", "1.0", 0),
            PackageRequest::new("foo", "1.0-beta", 0),
            PackageRequest::new("a/b", "1.0", 0),
        ] {
            let result = packer.plan(&fx.prefix, &request);
            assert!(matches!(result, Err(PackError::InvalidPackage { .. })));
        }
    }
}
