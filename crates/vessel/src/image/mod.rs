//! Container image descriptors.
//!
//! An [`Image`] wraps an opened filesystem artifact: a sandbox directory,
//! a plain ext3 or squashfs file, or a SIF container whose primary system
//! partition supplies the filesystem. The open file handle is held for the
//! lifetime of the descriptor so mounts can reference it by fd-path.

pub mod sif;

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use vessel_common::{VesselError, VesselResult};

/// Kind of filesystem artifact backing an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A plain directory.
    Sandbox,
    /// An ext3 filesystem image (possibly a SIF partition).
    Ext3,
    /// A squashfs filesystem image (possibly a SIF partition).
    Squashfs,
}

/// Squashfs superblock magic, little- and big-endian.
const SQUASHFS_MAGICS: [&[u8; 4]; 2] = [b"hsqs", b"sqsh"];
/// Ext superblock magic value, at byte 0x438 of the image.
const EXT_MAGIC_OFFSET: usize = 0x438;
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

/// How much of the file head is needed to discriminate formats.
const HEADER_PROBE_LEN: usize = 2048;

/// An opened container image.
#[derive(Debug)]
pub struct Image {
    /// Path the image was opened from.
    pub path: PathBuf,
    /// Discriminated kind. SIF containers report their partition's
    /// filesystem.
    pub kind: ImageKind,
    /// Held-open backing file; `None` only for sandbox directories.
    pub file: Option<File>,
    /// Byte offset of the mountable filesystem within the file.
    pub offset: u64,
    /// Byte length of the mountable filesystem.
    pub size: u64,
    /// Whether the image was opened for writing. Always false for
    /// sandboxes: a directory cannot be mounted read-write as an image.
    pub writable: bool,
}

impl Image {
    /// Open `path` and discriminate its format.
    ///
    /// # Errors
    ///
    /// [`VesselError::Image`] when the format cannot be identified or the
    /// SIF partition cannot be resolved; [`VesselError::Io`] on plain I/O
    /// failures.
    pub fn open(path: &Path, writable: bool) -> VesselResult<Self> {
        let metadata = std::fs::metadata(path)?;

        if metadata.is_dir() {
            return Ok(Self {
                path: path.to_path_buf(),
                kind: ImageKind::Sandbox,
                file: None,
                offset: 0,
                size: 0,
                writable: false,
            });
        }

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;

        let mut header = [0u8; HEADER_PROBE_LEN];
        let read = read_head(&mut file, &mut header)?;
        let header = &header[..read];

        let mut image = Self {
            path: path.to_path_buf(),
            kind: ImageKind::Squashfs,
            file: None,
            offset: 0,
            size: metadata.len(),
            writable,
        };

        if sif::is_sif(header) {
            let partition = sif::resolve_partition(&mut file)?;
            image.kind = match partition.fs {
                sif::PartitionFs::Squashfs => ImageKind::Squashfs,
                sif::PartitionFs::Ext3 => ImageKind::Ext3,
            };
            image.offset = partition.offset;
            image.size = partition.size;
        } else if header.len() >= 4 && SQUASHFS_MAGICS.iter().any(|m| &header[..4] == *m) {
            image.kind = ImageKind::Squashfs;
        } else if header.len() >= EXT_MAGIC_OFFSET + 2
            && header[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2] == EXT_MAGIC
        {
            image.kind = ImageKind::Ext3;
        } else {
            return Err(VesselError::image(format!(
                "unknown image format: {}",
                path.display()
            )));
        }

        image.file = Some(file);
        tracing::debug!(path = %path.display(), kind = ?image.kind, offset = image.offset, "opened image");
        Ok(image)
    }

    /// The kernel filesystem name for mounting this image.
    #[must_use]
    pub fn fstype(&self) -> &'static str {
        match self.kind {
            ImageKind::Sandbox => "",
            ImageKind::Ext3 => "ext3",
            ImageKind::Squashfs => "squashfs",
        }
    }

    /// Mount source referencing the held-open file by fd-path.
    ///
    /// # Errors
    ///
    /// [`VesselError::Image`] for sandbox images, which have no file.
    pub fn fd_source(&self) -> VesselResult<String> {
        match &self.file {
            Some(file) => Ok(format!("/proc/self/fd/{}", file.as_raw_fd())),
            None => Err(VesselError::image("sandbox images have no backing file")),
        }
    }

    /// Whether the image lives under one of the administrator-allowed
    /// path prefixes. An empty list means no restriction.
    pub fn authorized_path(&self, allowed: &[String]) -> VesselResult<bool> {
        if allowed.is_empty() {
            return Ok(true);
        }
        let resolved = std::fs::canonicalize(&self.path)?;
        Ok(allowed
            .iter()
            .any(|prefix| resolved.starts_with(Path::new(prefix))))
    }

    /// Whether the image is owned by one of the allowed UIDs. An empty
    /// list means no restriction.
    pub fn authorized_owner(&self, uids: &[u32]) -> VesselResult<bool> {
        if uids.is_empty() {
            return Ok(true);
        }
        let metadata = std::fs::metadata(&self.path)?;
        Ok(uids.contains(&metadata.uid()))
    }

    /// Whether the image is owned by one of the allowed GIDs. An empty
    /// list means no restriction.
    pub fn authorized_group(&self, gids: &[u32]) -> VesselResult<bool> {
        if gids.is_empty() {
            return Ok(true);
        }
        let metadata = std::fs::metadata(&self.path)?;
        Ok(gids.contains(&metadata.gid()))
    }
}

/// Read up to `buf.len()` bytes from the file head.
fn read_head(file: &mut File, buf: &mut [u8]) -> VesselResult<usize> {
    use std::io::Seek;
    let mut total = 0;
    file.seek(std::io::SeekFrom::Start(0))?;
    while total < buf.len() {
        let read = file.read(&mut buf[total..])?;
        if read == 0 {
            break;
        }
        total += read;
    }
    Ok(total)
}
