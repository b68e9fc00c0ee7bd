//! Raw (VHD-unaware) upload paths
//!
//! Plain HTTP PUT of bytes into a backing device: either the whole device
//! in one body, or a `Content-Range` window of it.

use std::path::Path;

use vdigate_core::{ContentRange, Error, Result};
use vdigate_pipeline::{blockio, ChunkQueue};

/// Write a whole-device body. The body length must equal the device size
/// exactly.
pub fn write_whole(path: &Path, q: &mut ChunkQueue, content_length: u64) -> Result<()> {
    if q.available() as u64 != content_length {
        return Err(Error::bad_request(
            "request body does not match Content-Length",
        ));
    }
    let device = blockio::device_size(path)?;
    if device != content_length {
        return Err(Error::range_not_satisfiable(format!(
            "device is {} bytes but Content-Length is {}",
            device, content_length
        )));
    }
    blockio::write_queue_at(path, q, 0)?;
    Ok(())
}

/// Write a `Content-Range` window of the device.
pub fn write_range(
    path: &Path,
    q: &mut ChunkQueue,
    range: &ContentRange,
    content_length: u64,
) -> Result<()> {
    if q.available() as u64 != content_length {
        return Err(Error::bad_request(
            "request body does not match Content-Length",
        ));
    }
    check_range(path, range, content_length)?;
    blockio::write_queue_at(path, q, range.start)?;
    Ok(())
}

/// Validate a `Content-Range` against the device and the declared body
/// length.
pub fn check_range(path: &Path, range: &ContentRange, content_length: u64) -> Result<()> {
    if !range.matches_content_length(content_length) {
        return Err(Error::bad_request(format!(
            "Content-Range bytes {}-{}/{} does not match Content-Length {}",
            range.start, range.end, range.total, content_length
        )));
    }
    let device = blockio::device_size(path)?;
    if range.total > device {
        return Err(Error::range_not_satisfiable(format!(
            "range total {} exceeds device size {}",
            range.total, device
        )));
    }
    Ok(())
}
