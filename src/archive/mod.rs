//! Compressed tar output.
//!
//! Archives are written deterministically: every entry gets `mtime = 0` and
//! root ownership, so the same inputs always produce the same bytes. Output
//! goes to a temporary file next to the destination and is renamed into
//! place only once the compressor has been finished. Dropping an unfinished
//! [`ArchiveWriter`] removes the temporary file.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use tempfile::NamedTempFile;

use crate::error::{IoContext, PackError, Result};

/// Compression applied to the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// bzip2-compressed tar, the classic conda package format.
    #[default]
    TarBz2,
    /// zstd-compressed tar.
    TarZst,
}

impl ArchiveFormat {
    /// File name extension, without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarZst => "tar.zst",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "tar.bz2" | "bz2" => Ok(ArchiveFormat::TarBz2),
            "tar.zst" | "zst" | "zstd" => Ok(ArchiveFormat::TarZst),
            other => Err(format!(
                "unsupported archive format '{}' (expected 'tar.bz2' or 'tar.zst')",
                other
            )),
        }
    }
}

enum Encoder {
    Bz2(bzip2::write::BzEncoder<File>),
    Zst(zstd::stream::Encoder<'static, File>),
}

impl Encoder {
    fn new(format: ArchiveFormat, out: File) -> io::Result<Self> {
        Ok(match format {
            ArchiveFormat::TarBz2 => {
                Encoder::Bz2(bzip2::write::BzEncoder::new(out, bzip2::Compression::best()))
            }
            ArchiveFormat::TarZst => Encoder::Zst(zstd::stream::Encoder::new(out, 3)?),
        })
    }

    fn finish(self) -> io::Result<File> {
        match self {
            Encoder::Bz2(e) => e.finish(),
            Encoder::Zst(e) => e.finish(),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Bz2(e) => e.write(buf),
            Encoder::Zst(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Bz2(e) => e.flush(),
            Encoder::Zst(e) => e.flush(),
        }
    }
}

/// A finished archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Streaming writer for one compressed tar archive.
pub struct ArchiveWriter {
    builder: TarBuilder<Encoder>,
    temp: NamedTempFile,
    destination: PathBuf,
}

impl ArchiveWriter {
    /// Start an archive that will become `destination` once finished.
    pub fn create(destination: &Path, format: ArchiveFormat) -> Result<Self> {
        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(dir)
            .io_context(|| format!("creating temporary archive in '{}'", dir.display()))?;
        let out = temp
            .as_file()
            .try_clone()
            .io_context(|| format!("opening '{}'", temp.path().display()))?;
        let encoder = Encoder::new(format, out)
            .io_context(|| format!("starting {} encoder", format))?;

        Ok(Self {
            builder: TarBuilder::new(encoder),
            temp,
            destination: destination.to_path_buf(),
        })
    }

    /// Append the file or symlink at `src` under the archive name `name`.
    ///
    /// Symlinks are stored as links and never followed.
    pub fn append_path(&mut self, src: &Path, name: &str) -> Result<()> {
        let md = fs::symlink_metadata(src)
            .io_context(|| format!("reading metadata of '{}'", src.display()))?;

        if md.file_type().is_symlink() {
            let target =
                fs::read_link(src).io_context(|| format!("reading link '{}'", src.display()))?;
            let mut header =
                deterministic_header(tar::EntryType::Symlink, 0, md.permissions().mode());
            // Targets past the 100-byte header field go into a GNU long-link entry.
            self.builder
                .append_link(&mut header, name, &target)
                .io_context(|| format!("appending link '{}'", name))?;
            return Ok(());
        }

        if !md.is_file() {
            return Err(PackError::Io {
                context: format!("appending '{}'", name),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a regular file or symlink", src.display()),
                ),
            });
        }

        let mut f = File::open(src).io_context(|| format!("opening '{}'", src.display()))?;
        let mut header =
            deterministic_header(tar::EntryType::Regular, md.len(), md.permissions().mode());
        self.builder
            .append_data(&mut header, name, &mut f)
            .io_context(|| format!("appending '{}'", name))?;
        Ok(())
    }

    /// Append in-memory content as a regular file.
    pub fn append_bytes(&mut self, name: &str, data: &[u8], mode: u32) -> Result<()> {
        let mut header = deterministic_header(tar::EntryType::Regular, data.len() as u64, mode);
        self.builder
            .append_data(&mut header, name, data)
            .io_context(|| format!("appending '{}'", name))?;
        Ok(())
    }

    /// Finalize the compressor and move the archive to its destination.
    pub fn finish(self) -> Result<ArchiveSummary> {
        let Self {
            builder,
            temp,
            destination,
        } = self;

        let encoder = builder
            .into_inner()
            .io_context(|| "finalizing tar stream")?;
        let file = encoder
            .finish()
            .io_context(|| "finishing compressed stream")?;
        file.sync_all()
            .io_context(|| format!("syncing '{}'", temp.path().display()))?;
        drop(file);

        temp.persist(&destination).map_err(|e| PackError::Io {
            context: format!("moving archive into place at '{}'", destination.display()),
            source: e.error,
        })?;

        let (sha256, size_bytes) = sha256_file(&destination)?;
        Ok(ArchiveSummary {
            path: destination,
            size_bytes,
            sha256,
        })
    }
}

fn deterministic_header(kind: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode & 0o7777);
    header
}

/// SHA-256 hex digest and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Open a finished archive for reading, undoing its compression.
pub fn open_archive(path: &Path, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>> {
    let f = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(f)),
        ArchiveFormat::TarZst => Box::new(
            zstd::stream::Decoder::new(f)
                .io_context(|| format!("reading zstd stream '{}'", path.display()))?,
        ),
    };
    Ok(tar::Archive::new(reader))
}
