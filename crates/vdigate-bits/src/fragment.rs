//! Fragment application
//!
//! Fragments arrive in any request order but must land contiguously. The
//! session's cursor is the single source of truth: a fragment starting past
//! it is rejected with 416 so the client can resume, a fragment entirely
//! behind it is acknowledged without work, and an overlapping fragment has
//! its already-consumed prefix discarded before the remainder feeds the
//! sink.

use crate::packet::E_INVALIDARG;
use crate::session::{Session, Sink};
use vdigate_core::{ContentRange, Error};
use vdigate_pipeline::{blockio, ChunkQueue};

/// Result of applying one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentOutcome {
    /// HTTP status for the ack (200 on success)
    pub http_status: u16,
    /// Value for `BITS-Received-Content-Range`: the next byte the client
    /// should send on success, the resume point or the fragment's first
    /// byte on error
    pub received: u64,
    /// `BITS-Error-Code` value when the fragment failed
    pub error_code: Option<&'static str>,
}

impl FragmentOutcome {
    fn ok(received: u64) -> Self {
        Self {
            http_status: 200,
            received,
            error_code: None,
        }
    }

    fn error(http_status: u16, received: u64) -> Self {
        Self {
            http_status,
            received,
            error_code: Some(E_INVALIDARG),
        }
    }

    pub fn is_success(&self) -> bool {
        self.http_status == 200
    }
}

/// Map a pipeline error to a fragment ack.
///
/// 416 and 501 from the underlying write path are translated to 400 per the
/// BITS protocol; other statuses pass through. The echoed offset is the
/// fragment's first byte, telling the client to resend it.
fn pipeline_error(err: &Error, range_start: u64) -> FragmentOutcome {
    let status = match err.http_status() {
        416 | 501 => 400,
        other => other,
    };
    tracing::warn!(%err, status, "fragment write failed");
    FragmentOutcome::error(status, range_start)
}

/// Apply one fragment's body to a session.
///
/// `range` is the fragment's `Content-Range`; `content_length` the declared
/// body length; `body` the body bytes. The session cursor advances exactly
/// as far as bytes were consumed, which is what the ack reports.
pub fn apply_fragment(
    session: &mut Session,
    range: &ContentRange,
    content_length: u64,
    body: &mut ChunkQueue,
) -> FragmentOutcome {
    if !range.matches_content_length(content_length) {
        tracing::warn!(
            start = range.start,
            end = range.end,
            content_length,
            "fragment range does not match its Content-Length"
        );
        return FragmentOutcome::error(400, range.start);
    }

    let abs_off = session.abs_off();

    // Contiguity: a gap means a lost fragment; tell the client where to
    // resume.
    if range.start > abs_off {
        tracing::warn!(
            start = range.start,
            abs_off,
            "fragment starts past the write cursor"
        );
        return FragmentOutcome::error(416, abs_off);
    }

    // Entirely behind the cursor: a duplicate; ack without consuming.
    if range.end < abs_off {
        tracing::debug!(
            end = range.end,
            abs_off,
            "fragment already consumed, acking"
        );
        return FragmentOutcome::ok(abs_off);
    }

    // Fast-forward the overlap: the cursor is authoritative.
    let overlap = abs_off - range.start;
    if overlap > 0 {
        tracing::debug!(overlap, "discarding already-consumed fragment prefix");
        body.discard(overlap as usize);
    }

    // The body must not run past the declared range.
    let remaining = range.end + 1 - abs_off;
    if body.available() as u64 > remaining {
        tracing::warn!(
            available = body.available(),
            remaining,
            "fragment body longer than its declared range"
        );
        return FragmentOutcome::error(400, range.start);
    }

    match session.sink_mut() {
        Sink::Vhd(import) => match import.advance(body) {
            Ok(_) => FragmentOutcome::ok(import.abs_off()),
            Err(err) => pipeline_error(&err, range.start),
        },
        Sink::Raw { path, off } => {
            let device = match blockio::device_size(path) {
                Ok(size) => size,
                Err(err) => return pipeline_error(&err, range.start),
            };
            if range.total > device {
                let err = Error::range_not_satisfiable(format!(
                    "range total {} exceeds device size {}",
                    range.total, device
                ));
                return pipeline_error(&err, range.start);
            }
            match blockio::write_queue_at(path, body, abs_off) {
                Ok(written) => {
                    *off = abs_off + written;
                    FragmentOutcome::ok(*off)
                }
                Err(err) => pipeline_error(&err, range.start),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, Sink};
    use bytes::Bytes;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::NamedTempFile;
    use vdigate_export::{ExportParams, Segment, VhdExport};
    use vdigate_import::{VhdImport, WriteMode};

    const MIB: u64 = 1024 * 1024;

    fn queue(data: &[u8]) -> ChunkQueue {
        let mut q = ChunkQueue::new();
        q.push(Bytes::copy_from_slice(data));
        q
    }

    fn content_range(start: u64, end: u64, total: u64) -> ContentRange {
        ContentRange::parse(&format!("bytes {}-{}/{}", start, end, total)).unwrap()
    }

    fn raw_backing(len: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    fn raw_session(file: &NamedTempFile) -> Session {
        Session::new(Sink::Raw {
            path: file.path().to_path_buf(),
            off: 0,
        })
    }

    fn contents(file: &NamedTempFile) -> Vec<u8> {
        let mut out = Vec::new();
        std::fs::File::open(file.path())
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_raw_fragments_in_order() {
        let file = raw_backing(16);
        let mut session = raw_session(&file);

        let out = apply_fragment(
            &mut session,
            &content_range(0, 7, 16),
            8,
            &mut queue(b"01234567"),
        );
        assert_eq!(out, FragmentOutcome::ok(8));

        let out = apply_fragment(
            &mut session,
            &content_range(8, 15, 16),
            8,
            &mut queue(b"89abcdef"),
        );
        assert_eq!(out, FragmentOutcome::ok(16));
        assert_eq!(contents(&file), b"0123456789abcdef");
    }

    #[test]
    fn test_fragment_past_cursor_is_416() {
        let file = raw_backing(1 << 20);
        let mut session = raw_session(&file);

        apply_fragment(
            &mut session,
            &content_range(0, 65535, 1 << 20),
            65536,
            &mut queue(&vec![0xAA; 65536]),
        );
        assert_eq!(session.abs_off(), 65536);

        // A fragment starting past the cursor echoes the resume offset
        let out = apply_fragment(
            &mut session,
            &content_range(100_000, 165_535, 1 << 20),
            65536,
            &mut queue(&vec![0xBB; 65536]),
        );
        assert_eq!(out.http_status, 416);
        assert_eq!(out.received, 65536);
        assert_eq!(out.error_code, Some(E_INVALIDARG));

        // Retrying from the echoed offset succeeds
        let out = apply_fragment(
            &mut session,
            &content_range(65536, 131_071, 1 << 20),
            65536,
            &mut queue(&vec![0xCC; 65536]),
        );
        assert_eq!(out, FragmentOutcome::ok(131_072));
    }

    #[test]
    fn test_overlapping_fragment_fast_forwards() {
        let file = raw_backing(1 << 20);
        let mut session = raw_session(&file);

        apply_fragment(
            &mut session,
            &content_range(0, 131_071, 1 << 20),
            131_072,
            &mut queue(&vec![0x11; 131_072]),
        );
        assert_eq!(session.abs_off(), 131_072);

        // Overlaps the cursor: the consumed prefix is skipped
        let body: Vec<u8> = (0..100_001).map(|i| (i % 251) as u8).collect();
        let out = apply_fragment(
            &mut session,
            &content_range(100_000, 200_000, 1 << 20),
            100_001,
            &mut queue(&body),
        );
        assert_eq!(out, FragmentOutcome::ok(200_001));

        // Only the unseen suffix landed, at the cursor position
        let data = contents(&file);
        assert_eq!(&data[131_072..200_001], &body[131_072 - 100_000..]);
    }

    #[test]
    fn test_duplicate_fragment_is_noop_ack() {
        let file = raw_backing(1 << 20);
        let mut session = raw_session(&file);

        apply_fragment(
            &mut session,
            &content_range(0, 65535, 1 << 20),
            65536,
            &mut queue(&vec![0xAA; 65536]),
        );

        let out = apply_fragment(
            &mut session,
            &content_range(0, 65535, 1 << 20),
            65536,
            &mut queue(&vec![0xEE; 65536]),
        );
        assert_eq!(out, FragmentOutcome::ok(65536));

        // The duplicate did not overwrite anything
        assert!(contents(&file)[..65536].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_range_content_length_mismatch() {
        let file = raw_backing(1 << 20);
        let mut session = raw_session(&file);
        let out = apply_fragment(
            &mut session,
            &content_range(0, 99, 1 << 20),
            50,
            &mut queue(&[0u8; 50]),
        );
        assert_eq!(out.http_status, 400);
        assert_eq!(out.received, 0);
    }

    #[test]
    fn test_raw_total_exceeding_device_translates_to_400() {
        let file = raw_backing(1024);
        let mut session = raw_session(&file);
        let out = apply_fragment(
            &mut session,
            &content_range(0, 511, 4096),
            512,
            &mut queue(&[0u8; 512]),
        );
        // 416 from the write path is translated to 400 for BITS
        assert_eq!(out.http_status, 400);
        assert_eq!(out.error_code, Some(E_INVALIDARG));
        assert_eq!(out.received, 0);
    }

    fn export_stream(backing: &NamedTempFile, size: u64) -> Vec<u8> {
        let export = VhdExport::prepare(ExportParams::new(backing.path(), size)).unwrap();
        let mut out = Vec::new();
        for seg in export.all_segments() {
            match seg {
                Segment::Memory(b) => out.extend_from_slice(&b),
                Segment::FileSlice { path, offset, len } => {
                    let mut f = std::fs::File::open(path).unwrap();
                    f.seek(SeekFrom::Start(offset)).unwrap();
                    let mut buf = vec![0u8; len as usize];
                    f.read_exact(&mut buf).unwrap();
                    out.extend_from_slice(&buf);
                }
            }
        }
        out
    }

    #[test]
    fn test_vhd_upload_across_fragments() {
        let mut source = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..4 * MIB).map(|i| (i % 256) as u8).collect();
        source.write_all(&data).unwrap();
        source.flush().unwrap();
        let stream = export_stream(&source, 4 * MIB);
        let total = stream.len() as u64;

        let dest = raw_backing(4 * MIB);
        let mut session = Session::new(Sink::Vhd(VhdImport::new(
            dest.path(),
            WriteMode::Dense {
                zero_unallocated: false,
            },
        )));

        // Deliver in 64 KiB fragments with a duplicate thrown in
        let frag = 65536usize;
        let mut start = 0usize;
        while start < stream.len() {
            let end = (start + frag).min(stream.len());
            let out = apply_fragment(
                &mut session,
                &content_range(start as u64, end as u64 - 1, total),
                (end - start) as u64,
                &mut queue(&stream[start..end]),
            );
            assert!(out.is_success(), "fragment {}-{} failed: {:?}", start, end, out);
            assert_eq!(out.received, end as u64);

            if start == frag {
                // Replay the first fragment; the ack still points at the cursor
                let out = apply_fragment(
                    &mut session,
                    &content_range(0, frag as u64 - 1, total),
                    frag as u64,
                    &mut queue(&stream[..frag]),
                );
                assert_eq!(out, FragmentOutcome::ok(end as u64));
            }
            start = end;
        }

        assert_eq!(contents(&dest), data);
    }
}
