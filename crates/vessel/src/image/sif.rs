//! SIF (single-file container image) reader.
//!
//! SIF embeds one or more partition blobs behind a descriptor table. The
//! engine needs exactly one thing from it: the extent and filesystem of
//! the default-group system partition, so the partition can be mounted
//! through a loop device at the right offset.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header: 128 bytes
//!   0   launch script        32 bytes
//!   32  magic "SIF_MAGIC"    10 bytes
//!   42  version               3 bytes
//!   45  arch                  3 bytes
//!   48  uuid                 16 bytes
//!   64  ctime, mtime, dfree, dtotal          4 x i64
//!   96  descroff, descrlen, dataoff, datalen 4 x i64
//! descriptor: 585 bytes, packed
//!   0   datatype i32, 4 used u8, 5 id u32, 9 groupid u32, 13 link u32
//!   17  fileoff i64, 25 filelen i64, 33 storelen i64
//!   41  ctime, mtime, uid, gid               4 x i64
//!   73  name 128 bytes, 201 extra 384 bytes
//! partition extra: fstype i32, parttype i32
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use vessel_common::{VesselError, VesselResult};

/// Magic bytes identifying a SIF file.
pub const MAGIC: &[u8] = b"SIF_MAGIC";
/// Offset of the magic inside the header, after the launch script.
pub const MAGIC_OFFSET: usize = 32;

const HEADER_LEN: usize = 128;
const DESCR_OFF_FIELD: usize = 96;
const DESCR_LEN_FIELD: usize = 104;
const DESCRIPTOR_LEN: usize = 585;

const DATA_PARTITION: i32 = 0x4004;
const GROUP_MASK: u32 = 0xF000_0000;
const DEFAULT_GROUP: u32 = GROUP_MASK | 1;

const PART_SYSTEM: i32 = 1;
const FS_SQUASH: i32 = 1;
const FS_EXT3: i32 = 2;

/// Filesystem held by a SIF system partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFs {
    /// SquashFS partition.
    Squashfs,
    /// Ext3 partition.
    Ext3,
}

/// Extent and filesystem of the primary system partition.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    /// Byte offset of the partition blob in the SIF file.
    pub offset: u64,
    /// Byte length of the partition blob.
    pub size: u64,
    /// Filesystem inside the blob.
    pub fs: PartitionFs,
}

/// Check whether a header block carries the SIF magic.
#[must_use]
pub fn is_sif(header: &[u8]) -> bool {
    header.len() >= MAGIC_OFFSET + MAGIC.len()
        && &header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] == MAGIC
}

/// Locate the default-group system partition.
///
/// # Errors
///
/// - the chosen descriptor is not a system partition,
/// - its filesystem is neither squashfs nor ext3,
/// - no default-group partition exists, or the descriptor table is
///   truncated.
pub fn resolve_partition(file: &mut File) -> VesselResult<Partition> {
    let mut header = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0)).map_err(VesselError::Io)?;
    file.read_exact(&mut header)
        .map_err(|err| VesselError::image(format!("short SIF header: {err}")))?;
    if !is_sif(&header) {
        return Err(VesselError::image("not a SIF image"));
    }

    let descr_off = read_i64(&header, DESCR_OFF_FIELD);
    let descr_len = read_i64(&header, DESCR_LEN_FIELD);
    if descr_off < 0 || descr_len < 0 {
        return Err(VesselError::image("corrupt SIF descriptor table extent"));
    }
    let count = (descr_len as usize) / DESCRIPTOR_LEN;

    file.seek(SeekFrom::Start(descr_off as u64))
        .map_err(VesselError::Io)?;
    let mut table = vec![0u8; count * DESCRIPTOR_LEN];
    file.read_exact(&mut table)
        .map_err(|err| VesselError::image(format!("short SIF descriptor table: {err}")))?;

    for raw in table.chunks_exact(DESCRIPTOR_LEN) {
        let datatype = read_i32(raw, 0);
        let used = raw[4] != 0;
        let groupid = read_u32(raw, 9);
        if !used || datatype != DATA_PARTITION || groupid != DEFAULT_GROUP {
            continue;
        }

        let fileoff = read_i64(raw, 17);
        let filelen = read_i64(raw, 25);
        let fstype = read_i32(raw, 201);
        let parttype = read_i32(raw, 205);

        if parttype != PART_SYSTEM {
            return Err(VesselError::image("found partition is not a system partition"));
        }
        let fs = match fstype {
            FS_SQUASH => PartitionFs::Squashfs,
            FS_EXT3 => PartitionFs::Ext3,
            other => {
                return Err(VesselError::image(format!(
                    "unknown file system type: {other}"
                )));
            }
        };
        if fileoff < 0 || filelen < 0 {
            return Err(VesselError::image("corrupt SIF partition extent"));
        }
        return Ok(Partition {
            offset: fileoff as u64,
            size: filelen as u64,
            fs,
        });
    }

    Err(VesselError::image("no default-group system partition found"))
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::testutil::{build_sif, TestDescriptor};
    use super::*;

    fn sif_file(descriptors: &[TestDescriptor]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_sif(descriptors)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn resolves_default_partition() {
        let file = sif_file(&[TestDescriptor::default()]);
        let mut handle = file.reopen().unwrap();
        let part = resolve_partition(&mut handle).unwrap();
        assert_eq!(part.offset, 4096);
        assert_eq!(part.size, 1 << 20);
        assert_eq!(part.fs, PartitionFs::Squashfs);
    }

    #[test]
    fn skips_foreign_groups() {
        let file = sif_file(&[
            TestDescriptor {
                groupid: GROUP_MASK | 2,
                fstype: FS_EXT3,
                ..TestDescriptor::default()
            },
            TestDescriptor {
                fileoff: 8192,
                fstype: FS_EXT3,
                ..TestDescriptor::default()
            },
        ]);
        let mut handle = file.reopen().unwrap();
        let part = resolve_partition(&mut handle).unwrap();
        assert_eq!(part.offset, 8192);
        assert_eq!(part.fs, PartitionFs::Ext3);
    }

    #[test]
    fn non_system_partition_rejected() {
        let file = sif_file(&[TestDescriptor {
            parttype: 3,
            ..TestDescriptor::default()
        }]);
        let mut handle = file.reopen().unwrap();
        let err = resolve_partition(&mut handle).unwrap_err();
        assert!(err.to_string().contains("not a system partition"));
    }

    #[test]
    fn unknown_fs_rejected() {
        let file = sif_file(&[TestDescriptor {
            fstype: 9,
            ..TestDescriptor::default()
        }]);
        let mut handle = file.reopen().unwrap();
        let err = resolve_partition(&mut handle).unwrap_err();
        assert!(err.to_string().contains("unknown file system type"));
    }

    #[test]
    fn missing_partition_rejected() {
        let file = sif_file(&[TestDescriptor {
            used: false,
            ..TestDescriptor::default()
        }]);
        let mut handle = file.reopen().unwrap();
        assert!(resolve_partition(&mut handle).is_err());
    }
}
