//! Positioned I/O on raw backing files and block devices
//!
//! The backing store behind every virtual image is either a regular file of
//! fixed size or a block device. Uploads land here as positioned writes;
//! downloads read from here via file-slice descriptors.

use crate::queue::ChunkQueue;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use vdigate_core::{Error, Result, SECTOR_SIZE};

/// Size of a backing file or block device in bytes.
///
/// Regular files report their metadata length; block devices are measured by
/// seeking to the end.
pub fn device_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::not_found(format!("backing path {} missing", path.display()))
        }
        _ => Error::from(e),
    })?;

    if meta.file_type().is_file() {
        return Ok(meta.len());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if meta.file_type().is_block_device() {
            let mut file = File::open(path)?;
            return Ok(file.seek(SeekFrom::End(0))?);
        }
    }

    Err(Error::forbidden(format!(
        "{} is not a regular file or block device",
        path.display()
    )))
}

/// Check that a backing path exists, is a regular file or block device, and
/// has exactly the expected size.
pub fn probe_backing(path: &Path, expected_size: u64) -> Result<()> {
    let size = device_size(path)?;
    if size != expected_size {
        return Err(Error::bad_request(format!(
            "backing device {} is {} bytes, expected {}",
            path.display(),
            size,
            expected_size
        )));
    }
    Ok(())
}

/// Open a backing device for writing after verifying its size.
pub fn open_for_write(path: &Path, expected_size: u64) -> Result<File> {
    probe_backing(path, expected_size)?;
    let file = OpenOptions::new().write(true).open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::not_found(format!("backing path {} missing", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            Error::forbidden(format!("cannot open {} for writing", path.display()))
        }
        _ => Error::from(e),
    })?;
    Ok(file)
}

/// Drain the whole queue into the device starting at `start`.
///
/// Returns the number of bytes written. A short drain (device error) is an
/// I/O error, never silent.
pub fn write_queue_at(path: &Path, q: &mut ChunkQueue, start: u64) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::not_found(format!("backing path {} missing", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            Error::forbidden(format!("cannot open {} for writing", path.display()))
        }
        _ => Error::from(e),
    })?;

    file.seek(SeekFrom::Start(start))?;
    let want = q.available();
    let written = q.write_to(&mut file, want)?;
    if written != want {
        return Err(Error::internal(format!(
            "wrote {} of {} bytes to {}",
            written,
            want,
            path.display()
        )));
    }
    tracing::debug!(path = %path.display(), start, written, "queue drained to device");
    Ok(written as u64)
}

/// Zero one virtual block of the device, in sector-sized bursts.
pub fn zero_block(file: &mut File, block_index: u64, block_size: u32) -> Result<()> {
    let zeros = [0u8; SECTOR_SIZE as usize];
    file.seek(SeekFrom::Start(block_index * u64::from(block_size)))?;
    for _ in 0..(u64::from(block_size) / SECTOR_SIZE) {
        file.write_all(&zeros)?;
    }
    Ok(())
}
