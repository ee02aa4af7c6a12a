//! Deterministic tar.gz layer production.
//!
//! Three layer shapes are produced here: the source data layer (the
//! project tree rewritten under `/func/`), the certificates layer (the
//! host CA bundle at both canonical in-container paths), and the
//! executable layer (a single compiled binary at `/func/f`). Directory
//! walks are sorted and gzip parameters are fixed, so an unchanged input
//! tree produces an identical blob.
//!
//! Every archive streams through two hashers at once: one over the
//! compressed bytes (the blob digest) and one over the raw tar bytes (the
//! layer's diffID). The finished file is renamed into `blobs/sha256/`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use funcforge_core::{BuildError, Result};
use tar::EntryType;

use super::blob::{self, HashingWriter};
use super::job::BuildJob;
use super::types::{Descriptor, Hash, MEDIA_TYPE_LAYER};
use crate::function::Platform;

/// Owner written into every tar entry.
pub const DEFAULT_UID: u64 = 1000;
pub const DEFAULT_GID: u64 = 1000;

/// Basenames excluded from the data layer at any depth.
pub const DEFAULT_IGNORED: [&str; 4] = [".git", ".func", ".funcignore", ".gitignore"];

/// In-container locations of the CA bundle.
const CONTAINER_CERT_PATHS: [&str; 2] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-certificates.crt",
];

/// Host locations searched for a CA bundle, in order.
const HOST_CERT_PATHS: [&str; 4] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// A produced layer: its blob descriptor and uncompressed diffID.
#[derive(Debug, Clone)]
pub struct Layer {
    pub descriptor: Descriptor,
    pub diff_id: Hash,
}

type CompressedSink = HashingWriter<BufWriter<File>>;
type RawSink = HashingWriter<GzEncoder<CompressedSink>>;

/// Streams a tar.gz archive into a temporary file, hashing the compressed
/// and uncompressed byte streams as they pass through.
struct LayerWriter {
    temp: PathBuf,
    builder: tar::Builder<RawSink>,
}

impl LayerWriter {
    fn create(temp: PathBuf) -> Result<Self> {
        let file = File::create(&temp)
            .map_err(|e| BuildError::BlobWrite(format!("{}: {}", temp.display(), e)))?;
        let compressed = HashingWriter::new(BufWriter::new(file));
        let gz = GzEncoder::new(compressed, Compression::default());
        let mut builder = tar::Builder::new(HashingWriter::new(gz));
        builder.follow_symlinks(false);
        Ok(Self { temp, builder })
    }

    /// Finish the archive and move it to its content-addressed path.
    fn finish(mut self, blobs_dir: &Path) -> Result<Layer> {
        self.builder
            .finish()
            .map_err(|e| BuildError::BlobWrite(format!("{}: {}", self.temp.display(), e)))?;
        let raw = self
            .builder
            .into_inner()
            .map_err(|e| BuildError::BlobWrite(format!("{}: {}", self.temp.display(), e)))?;
        let (gz, diff_id, _) = raw.finalize();
        let compressed = gz
            .finish()
            .map_err(|e| BuildError::BlobWrite(format!("{}: {}", self.temp.display(), e)))?;
        let (buffered, digest, size) = compressed.finalize();
        buffered
            .into_inner()
            .map_err(|e| BuildError::BlobWrite(format!("{}: {}", self.temp.display(), e)))?;

        blob::place(&self.temp, blobs_dir, &digest.hex)?;

        Ok(Layer {
            descriptor: Descriptor {
                media_type: MEDIA_TYPE_LAYER.to_string(),
                size: size as i64,
                digest,
                platform: None,
            },
            diff_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Layer producers
// ---------------------------------------------------------------------------

/// Produce the shared source data layer for a build.
pub fn write_data_layer(job: &BuildJob) -> Result<Layer> {
    new_data_tarball(
        &job.function.root,
        job.build_dir().join("datalayer.tar.gz"),
        &job.blobs_dir(),
        job.verbose,
    )
}

/// Produce the shared certificates layer for a build.
pub fn write_certs_layer(job: &BuildJob) -> Result<Layer> {
    let source = host_cert_bundle(&job.build_dir()).ok_or_else(|| {
        BuildError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "no CA certificate bundle found on this host",
        ))
    })?;
    new_certs_tarball(
        &source,
        job.build_dir().join("certslayer.tar.gz"),
        &job.blobs_dir(),
    )
}

/// Wrap a compiled binary as a per-platform executable layer.
pub fn write_exe_layer(job: &BuildJob, exe: &Path, platform: &Platform) -> Result<Layer> {
    new_exe_tarball(
        exe,
        job.build_dir().join(format!(
            "execlayer.{}.{}.tar.gz",
            platform.os, platform.architecture
        )),
        &job.blobs_dir(),
    )
}

/// Archive an auxiliary directory under `prefix` (e.g. a dependency tree
/// under `/func/lib`).
pub fn write_dir_layer(
    job: &BuildJob,
    source: &Path,
    prefix: &str,
    temp_name: &str,
) -> Result<Layer> {
    new_dir_tarball(
        source,
        prefix,
        job.build_dir().join(temp_name),
        &job.blobs_dir(),
    )
}

/// Locate the CA bundle used for the certificates layer.
///
/// `FUNC_CA_BUNDLE` overrides; a bundle staged into the build directory
/// (e.g. by scaffolding) comes next; then the well-known host paths.
pub fn host_cert_bundle(build_dir: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FUNC_CA_BUNDLE") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let staged = build_dir.join("ca-certificates.crt");
    if staged.is_file() {
        return Some(staged);
    }
    HOST_CERT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

pub(crate) fn new_data_tarball(
    root: &Path,
    temp: PathBuf,
    blobs_dir: &Path,
    verbose: bool,
) -> Result<Layer> {
    let mut lw = LayerWriter::create(temp)?;

    let meta = fs::metadata(root)?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(file_mode(&meta) & 0o7777);
    header.set_mtime(mtime(&meta));
    set_ownership(&mut header);
    append_entry(&mut lw.builder, &mut header, "/func", io::empty())?;

    append_tree(&mut lw.builder, root, root, "/func", &DEFAULT_IGNORED, verbose)?;
    lw.finish(blobs_dir)
}

pub(crate) fn new_certs_tarball(source: &Path, temp: PathBuf, blobs_dir: &Path) -> Result<Layer> {
    let mut lw = LayerWriter::create(temp)?;
    let meta = fs::metadata(source)?;

    for container_path in CONTAINER_CERT_PATHS {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        header.set_mode(file_mode(&meta) & 0o7777);
        header.set_mtime(mtime(&meta));
        set_ownership(&mut header);

        let file = File::open(source)?;
        append_entry(&mut lw.builder, &mut header, container_path, file)?;
        tracing::debug!(entry = container_path, "certs layer entry");
    }
    lw.finish(blobs_dir)
}

pub(crate) fn new_exe_tarball(exe: &Path, temp: PathBuf, blobs_dir: &Path) -> Result<Layer> {
    let mut lw = LayerWriter::create(temp)?;
    let meta = fs::metadata(exe)?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(meta.len());
    // Force permission bits to 0755, preserving any high mode bits.
    header.set_mode(((file_mode(&meta) & !0o777) | 0o755) & 0o7777);
    header.set_mtime(mtime(&meta));
    set_ownership(&mut header);

    let file = File::open(exe)?;
    append_entry(&mut lw.builder, &mut header, "/func/f", file)?;
    lw.finish(blobs_dir)
}

pub(crate) fn new_dir_tarball(
    source: &Path,
    prefix: &str,
    temp: PathBuf,
    blobs_dir: &Path,
) -> Result<Layer> {
    let mut lw = LayerWriter::create(temp)?;

    let meta = fs::metadata(source)?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(file_mode(&meta) & 0o7777);
    header.set_mtime(mtime(&meta));
    set_ownership(&mut header);
    append_entry(&mut lw.builder, &mut header, prefix, io::empty())?;

    append_tree(&mut lw.builder, source, source, prefix, &[], false)?;
    lw.finish(blobs_dir)
}

// ---------------------------------------------------------------------------
// Tree walking
// ---------------------------------------------------------------------------

fn append_tree<W: Write>(
    tw: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    prefix: &str,
    ignored: &[&str],
    verbose: bool,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .and_then(|rd| rd.collect::<io::Result<Vec<_>>>())?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if ignored.iter().any(|i| name == *i) {
            continue;
        }
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        let tar_name = entry_name(root, &path, prefix);

        if meta.file_type().is_symlink() {
            let target = validated_link_target(root, &path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime(mtime(&meta));
            set_ownership(&mut header);
            append_symlink(tw, &mut header, &tar_name, &target)?;
        } else if meta.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(file_mode(&meta) & 0o7777);
            header.set_mtime(mtime(&meta));
            set_ownership(&mut header);
            append_entry(tw, &mut header, &tar_name, io::empty())?;
            append_tree(tw, root, &path, prefix, ignored, verbose)?;
        } else {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            header.set_mode(file_mode(&meta) & 0o7777);
            header.set_mtime(mtime(&meta));
            set_ownership(&mut header);
            let file = File::open(&path)?;
            append_entry(tw, &mut header, &tar_name, file)?;
        }

        if verbose {
            tracing::debug!(entry = %tar_name, "data layer entry");
        }
    }
    Ok(())
}

/// Archive-internal name for `path`: `prefix` plus the forward-slash
/// normalized path relative to `root`.
fn entry_name(root: &Path, path: &Path, prefix: &str) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut name = String::from(prefix);
    for component in rel.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

/// Validate a symlink's target and return it verbatim for the archive.
///
/// Absolute targets will not resolve once the tree is rehomed under
/// `/func`, and relative targets must not escape the project root.
pub(crate) fn validated_link_target(root: &Path, path: &Path) -> Result<PathBuf> {
    let target = fs::read_link(path)?;
    if target.is_absolute() {
        return Err(BuildError::AbsoluteLink(path.to_path_buf()));
    }

    let resolved = normalize(&path.parent().unwrap_or(root).join(&target));
    if !resolved.starts_with(normalize(root)) {
        return Err(BuildError::LinkEscapesRoot(path.to_path_buf()));
    }
    Ok(target)
}

/// Lexically normalize a path, collapsing `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------------

const GNU_LONG_NAME: &str = "././@LongLink";

fn set_ownership(header: &mut tar::Header) {
    header.set_uid(DEFAULT_UID);
    header.set_gid(DEFAULT_GID);
}

/// Write `name` into the header's raw name field, emitting a GNU long-name
/// entry first when it does not fit.
///
/// `Header::set_path` refuses absolute archive names, and every name here
/// is absolute (`/func/…`, `/etc/…`), so the field is filled directly.
fn append_entry<W: Write, R: Read>(
    tw: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    data: R,
) -> Result<()> {
    if name.len() > 100 {
        append_gnu_long(tw, EntryType::GNULongName, name)?;
    }
    set_raw_name(header, name);
    header.set_cksum();
    tw.append(header, data)?;
    Ok(())
}

fn append_symlink<W: Write>(
    tw: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    target: &Path,
) -> Result<()> {
    let target_str = target.to_string_lossy();
    if target_str.len() > 100 {
        append_gnu_long(tw, EntryType::GNULongLink, &target_str)?;
    }
    set_raw_link_name(header, &target_str);
    append_entry(tw, header, name, io::empty())
}

/// Emit a GNU long-name ('L') or long-link ('K') pseudo entry.
fn append_gnu_long<W: Write>(tw: &mut tar::Builder<W>, kind: EntryType, value: &str) -> Result<()> {
    let mut data = value.as_bytes().to_vec();
    data.push(0);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    set_raw_name(&mut header, GNU_LONG_NAME);
    header.set_cksum();
    tw.append(&header, data.as_slice())?;
    Ok(())
}

fn set_raw_name(header: &mut tar::Header, name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(100);
    let old = header.as_old_mut();
    old.name = [0; 100];
    old.name[..n].copy_from_slice(&bytes[..n]);
}

fn set_raw_link_name(header: &mut tar::Header, target: &str) {
    let bytes = target.as_bytes();
    let n = bytes.len().min(100);
    let old = header.as_old_mut();
    old.linkname = [0; 100];
    old.linkname[..n].copy_from_slice(&bytes[..n]);
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn mtime(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
