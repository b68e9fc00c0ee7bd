//! HTTP dispatch
//!
//! One fallback handler owns every request: the gateway speaks GET/HEAD
//! (synthesized VHD download), PUT (raw or VHD upload), and the custom
//! BITS_POST method, switched per configured path. Errors map to statuses
//! through the workspace error type; BITS responses additionally carry the
//! protocol's ack and error headers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use vdigate_bits::packet::{protocols_match, CONTEXT_SERVER, E_INVALIDARG, PROTOCOL_GUID_BRACED};
use vdigate_bits::session::normalize_session_id;
use vdigate_bits::{apply_fragment, PacketType, Session, SessionRegistry, Sink};
use vdigate_core::{ContentRange, Error, RequestRange};
use vdigate_export::{Segment, VhdExport};
use vdigate_import::{raw, Progress, VhdImport, WriteMode};
use vdigate_pipeline::ChunkQueue;

use crate::config::{GatewayConfig, PathConfig};

/// Read size for streaming file slices into response bodies
const READ_CHUNK: u64 = 64 * 1024;

/// Shared application state
pub struct AppState {
    pub config: GatewayConfig,
    pub bits: Mutex<BitsState>,
}

/// BITS bookkeeping: live sessions plus the active session per path
#[derive(Default)]
pub struct BitsState {
    pub registry: SessionRegistry,
    pub active: HashMap<String, String>,
}

/// Build the gateway router
pub fn app(config: GatewayConfig) -> Router {
    let state = Arc::new(AppState {
        config,
        bits: Mutex::new(BitsState::default()),
    });
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let Some(pc) = state.config.paths.get(&path) else {
        tracing::debug!(%path, "no configuration for path");
        return plain_error(StatusCode::NOT_FOUND, "unknown path");
    };

    if parts.method == Method::GET {
        handle_get(pc, &parts.headers, false).await
    } else if parts.method == Method::HEAD {
        handle_get(pc, &parts.headers, true).await
    } else if parts.method == Method::PUT {
        handle_put(pc, &parts.headers, body).await
    } else if parts.method.as_str() == "BITS_POST" {
        handle_bits(&state, pc, &path, &parts.headers, body).await
    } else {
        tracing::debug!(method = %parts.method, "unsupported verb");
        plain_error(StatusCode::NOT_IMPLEMENTED, "unsupported verb")
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn plain_error(status: StatusCode, msg: &str) -> Response<Body> {
    (status, msg.to_string()).into_response()
}

fn error_response(err: &Error) -> Response<Body> {
    tracing::warn!(%err, "request failed");
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// Collect a request body into a chunk queue
async fn collect_body(body: Body, q: &mut ChunkQueue) -> Result<(), Response<Body>> {
    let mut stream = body.into_data_stream();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(bytes) => q.push(bytes),
            Err(err) => {
                tracing::warn!(%err, "request body error");
                return Err(plain_error(StatusCode::BAD_REQUEST, "request body error"));
            }
        }
    }
    Ok(())
}

//
// GET / HEAD
//

async fn handle_get(pc: &PathConfig, headers: &HeaderMap, head: bool) -> Response<Body> {
    if !pc.enable_getvhd {
        return plain_error(StatusCode::NOT_IMPLEMENTED, "GET VHD not enabled for path");
    }

    let export = match pc
        .getvhd
        .to_export_params(&pc.backing)
        .and_then(VhdExport::prepare)
    {
        Ok(export) => export,
        Err(err) => return error_response(&err),
    };
    let total = export.total_size();

    if head {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, total)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let (status, start, end) = match header_str(headers, "range") {
        None => (StatusCode::OK, 0, total - 1),
        Some(value) => match RequestRange::parse(value) {
            Ok(range) if range.end < total => (StatusCode::PARTIAL_CONTENT, range.start, range.end),
            Ok(range) => {
                tracing::warn!(end = range.end, total, "range end beyond synthesized image");
                return plain_error(StatusCode::BAD_REQUEST, "range end beyond image");
            }
            Err(err) => return error_response(&err),
        },
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, end - start + 1);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, total),
        );
    }

    builder
        .body(segments_body(export.segments(start, end)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Stream segments as a response body, reading file slices lazily
fn segments_body(segments: Vec<Segment>) -> Body {
    let stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send>> =
        Box::pin(async_stream::try_stream! {
            for seg in segments {
                match seg {
                    Segment::Memory(bytes) => yield bytes,
                    Segment::FileSlice { path, offset, len } => {
                        let mut file = tokio::fs::File::open(&path).await?;
                        file.seek(std::io::SeekFrom::Start(offset)).await?;
                        let mut remaining = len;
                        while remaining > 0 {
                            let take = remaining.min(READ_CHUNK) as usize;
                            let mut buf = vec![0u8; take];
                            file.read_exact(&mut buf).await?;
                            remaining -= take as u64;
                            yield Bytes::from(buf);
                        }
                    }
                }
            }
        });
    Body::from_stream(stream)
}

//
// PUT
//

async fn handle_put(pc: &PathConfig, headers: &HeaderMap, body: Body) -> Response<Body> {
    let content_range = header_str(headers, "content-range");

    if pc.enable_putvhd {
        if content_range.is_some() {
            return plain_error(
                StatusCode::NOT_IMPLEMENTED,
                "Content-Range not supported for VHD upload",
            );
        }
        return put_vhd(pc, body).await;
    }

    if pc.enable_put {
        return put_raw(pc, content_range, body).await;
    }

    plain_error(StatusCode::NOT_IMPLEMENTED, "PUT not enabled for path")
}

/// Streaming VHD upload: the state machine advances as body frames arrive,
/// so the whole image is never buffered.
async fn put_vhd(pc: &PathConfig, body: Body) -> Response<Body> {
    let mode = if pc.putvhd_sparse {
        WriteMode::Sparse
    } else {
        WriteMode::Dense {
            zero_unallocated: true,
        }
    };
    let mut import = VhdImport::new(&pc.backing, mode);
    let mut q = ChunkQueue::new();
    let mut progress = Progress::NeedMore;

    let mut stream = body.into_data_stream();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(bytes) => q.push(bytes),
            Err(err) => {
                tracing::warn!(%err, "VHD upload body error");
                return plain_error(StatusCode::BAD_REQUEST, "request body error");
            }
        }
        progress = match import.advance(&mut q) {
            Ok(p) => p,
            Err(err) => return error_response(&err),
        };
    }

    match progress {
        Progress::Done => StatusCode::OK.into_response(),
        Progress::NeedMore => {
            plain_error(StatusCode::BAD_REQUEST, "request too short to be a VHD")
        }
    }
}

async fn put_raw(pc: &PathConfig, content_range: Option<&str>, body: Body) -> Response<Body> {
    let mut q = ChunkQueue::new();
    if let Err(resp) = collect_body(body, &mut q).await {
        return resp;
    }
    let content_length = q.available() as u64;

    let result = match content_range {
        Some(value) => ContentRange::parse(value)
            .and_then(|range| raw::write_range(&pc.backing, &mut q, &range, content_length)),
        None => raw::write_whole(&pc.backing, &mut q, content_length),
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&err),
    }
}

//
// BITS
//

/// Response skeleton every BITS packet gets: an Ack with no body
fn ack_builder(status: StatusCode) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header("BITS-Packet-Type", "Ack")
        .header(header::CONTENT_LENGTH, 0)
}

fn finish(builder: axum::http::response::Builder) -> Response<Body> {
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// A failed BITS packet: 400-class ack carrying the protocol error headers
fn bits_error(status: StatusCode, session_id: Option<&str>) -> Response<Body> {
    let mut builder = ack_builder(status)
        .header("BITS-Error-Code", E_INVALIDARG)
        .header("BITS-Error-Context", CONTEXT_SERVER);
    if let Some(id) = session_id {
        builder = builder.header("BITS-Session-Id", id);
    }
    finish(builder)
}

async fn handle_bits(
    state: &AppState,
    pc: &PathConfig,
    path: &str,
    headers: &HeaderMap,
    body: Body,
) -> Response<Body> {
    if !pc.enable_bits && !pc.enable_bitsvhd {
        return plain_error(StatusCode::NOT_IMPLEMENTED, "BITS not enabled for path");
    }

    let Some(packet) = PacketType::parse(header_str(headers, "BITS-Packet-Type")) else {
        tracing::warn!("missing or unknown BITS-Packet-Type");
        return bits_error(StatusCode::BAD_REQUEST, None);
    };

    let mut q = ChunkQueue::new();
    if let Err(resp) = collect_body(body, &mut q).await {
        return resp;
    }

    if packet.forbids_content() && !q.is_empty() {
        tracing::warn!(?packet, "unexpected request body");
        return bits_error(StatusCode::BAD_REQUEST, None);
    }

    match packet {
        PacketType::CreateSession => create_session(state, pc, path, headers).await,
        PacketType::Ping => finish(ack_builder(StatusCode::OK)),
        PacketType::Fragment => fragment(state, path, headers, &mut q).await,
        PacketType::CloseSession | PacketType::CancelSession => {
            close_session(state, path, headers).await
        }
    }
}

async fn create_session(
    state: &AppState,
    pc: &PathConfig,
    path: &str,
    headers: &HeaderMap,
) -> Response<Body> {
    if !protocols_match(header_str(headers, "BITS-Supported-Protocols")) {
        tracing::warn!("no supported BITS protocol offered");
        return bits_error(StatusCode::BAD_REQUEST, None);
    }

    let sink = if pc.enable_bitsvhd {
        let mode = if pc.bitsvhd_sparse {
            WriteMode::Sparse
        } else {
            WriteMode::Dense {
                zero_unallocated: true,
            }
        };
        Sink::Vhd(VhdImport::new(&pc.backing, mode))
    } else {
        Sink::Raw {
            path: pc.backing.clone(),
            off: 0,
        }
    };

    let session = Session::new(sink);
    let id = session.id().to_string();

    let mut bits = state.bits.lock().await;
    if let Some(old) = bits.active.insert(path.to_string(), id.clone()) {
        tracing::debug!(session = %old, "create-session replaces a live session");
        bits.registry.remove(&old);
    }
    bits.registry.insert(session);
    tracing::info!(session = %id, %path, "BITS session created");

    finish(
        ack_builder(StatusCode::OK)
            .header("BITS-Protocol", PROTOCOL_GUID_BRACED)
            .header("BITS-Session-Id", id),
    )
}

/// Validate the request's session id against the path's active session.
fn active_session_id(
    bits: &BitsState,
    path: &str,
    headers: &HeaderMap,
) -> Result<String, Response<Body>> {
    let Some(raw_id) = header_str(headers, "BITS-Session-Id") else {
        tracing::warn!("missing BITS-Session-Id");
        return Err(bits_error(StatusCode::BAD_REQUEST, None));
    };
    let Some(id) = normalize_session_id(raw_id) else {
        tracing::warn!(raw_id, "malformed BITS-Session-Id");
        return Err(bits_error(StatusCode::BAD_REQUEST, None));
    };
    if bits.active.get(path) != Some(&id) || !bits.registry.contains(&id) {
        tracing::warn!(session = %id, %path, "session id does not match the active session");
        return Err(bits_error(StatusCode::BAD_REQUEST, Some(&id)));
    }
    Ok(id)
}

async fn fragment(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    q: &mut ChunkQueue,
) -> Response<Body> {
    let mut bits = state.bits.lock().await;
    let id = match active_session_id(&bits, path, headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let range = match header_str(headers, "content-range").map(ContentRange::parse) {
        Some(Ok(range)) => range,
        Some(Err(err)) => {
            tracing::warn!(%err, "bad fragment Content-Range");
            return bits_error(StatusCode::BAD_REQUEST, Some(&id));
        }
        None => {
            tracing::warn!("fragment without Content-Range");
            return bits_error(StatusCode::BAD_REQUEST, Some(&id));
        }
    };

    let content_length = header_str(headers, "content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(q.available() as u64);

    let Some(session) = bits.registry.get_mut(&id) else {
        return bits_error(StatusCode::BAD_REQUEST, Some(&id));
    };
    let outcome = apply_fragment(session, &range, content_length, q);

    let mut builder = ack_builder(
        StatusCode::from_u16(outcome.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    )
    .header("BITS-Session-Id", &id)
    .header("BITS-Received-Content-Range", outcome.received);
    if let Some(code) = outcome.error_code {
        builder = builder
            .header("BITS-Error-Code", code)
            .header("BITS-Error-Context", CONTEXT_SERVER);
    }
    finish(builder)
}

async fn close_session(state: &AppState, path: &str, headers: &HeaderMap) -> Response<Body> {
    let mut bits = state.bits.lock().await;
    let id = match active_session_id(&bits, path, headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    bits.registry.remove(&id);
    bits.active.remove(path);
    tracing::info!(session = %id, %path, "BITS session ended");

    finish(ack_builder(StatusCode::OK).header("BITS-Session-Id", id))
}
