//! permessage-deflate (RFC 7692): extension negotiation and the per-message codec.

use crate::error::{ ChatError, Result };
use flate2::{ Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status };

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer removed by the sender after a sync flush and restored before inflating.
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_WINDOW_BITS: u8 = 15;
const MIN_WINDOW_BITS: u8 = 8;
const CHUNK: usize = 4096;

/// Parameters the server accepted in its `Sec-WebSocket-Extensions` answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

/// Reads the server's extension answer. `offered` tells whether we asked for
/// permessage-deflate; an extension we never offered fails the handshake.
pub fn negotiate(header: Option<&str>, offered: bool) -> Result<Option<DeflateParams>> {
    let header = match header.map(str::trim) {
        Some(h) if !h.is_empty() => h,
        _ => {
            return Ok(None);
        }
    };

    let mut accepted: Option<DeflateParams> = None;
    for extension in header.split(',') {
        let mut parts = extension.split(';').map(str::trim);
        let name = parts.next().unwrap_or_default();
        if !name.eq_ignore_ascii_case(EXTENSION_NAME) || !offered {
            return Err(extension_error(format!("server enabled unrequested extension '{}'", name)));
        }
        if accepted.is_some() {
            return Err(extension_error("permessage-deflate accepted twice".to_string()));
        }

        let mut params = DeflateParams::default();
        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                None => (param, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "server_no_context_takeover" => {
                    params.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    params.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    params.server_max_window_bits = Some(window_bits(key, value)?);
                }
                "client_max_window_bits" => {
                    params.client_max_window_bits = Some(window_bits(key, value)?);
                }
                other => {
                    return Err(extension_error(format!("unknown parameter '{}'", other)));
                }
            }
        }
        accepted = Some(params);
    }
    Ok(accepted)
}

fn window_bits(key: &str, value: Option<&str>) -> Result<u8> {
    let bits = value
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|b| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(b))
        .ok_or_else(|| extension_error(format!("invalid value for {}", key)))?;
    Ok(bits)
}

fn extension_error(reason: String) -> ChatError {
    ChatError::Extension(reason)
}

/// Per-connection compression state for one negotiated permessage-deflate session.
pub struct DeflateCodec {
    params: DeflateParams,
    inflater: Decompress,
    deflater: Compress,
}

impl DeflateCodec {
    pub fn new(params: DeflateParams) -> Self {
        Self {
            params,
            inflater: Decompress::new(false),
            deflater: Compress::new(Compression::default(), false),
        }
    }

    pub fn params(&self) -> &DeflateParams {
        &self.params
    }

    /// Outbound compression is only used with a full 15-bit window, since
    /// the encoder cannot be narrowed to a smaller one the server demanded.
    pub fn compresses_outbound(&self) -> bool {
        self.params.client_max_window_bits.map_or(true, |b| b == MAX_WINDOW_BITS)
    }

    /// Inflates one complete compressed message payload, refusing output past `max_size`.
    pub fn inflate(&mut self, payload: &[u8], max_size: usize) -> Result<Vec<u8>> {
        if self.params.server_no_context_takeover {
            self.inflater.reset(false);
        }

        let mut input = Vec::with_capacity(payload.len() + SYNC_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&SYNC_TRAILER);

        let mut output = Vec::with_capacity(CHUNK.max(payload.len() * 2));
        let start_in = self.inflater.total_in();
        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK.max(output.capacity()));
            }
            let consumed = (self.inflater.total_in() - start_in) as usize;
            let before = (self.inflater.total_in(), self.inflater.total_out());
            let status = self.inflater
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| extension_error(format!("inflate failed: {}", e)))?;
            if output.len() > max_size {
                return Err(ChatError::MessageTooLarge { size: output.len(), max_size });
            }

            let consumed = (self.inflater.total_in() - start_in) as usize;
            let progressed = before != (self.inflater.total_in(), self.inflater.total_out());
            let has_room = output.len() < output.capacity();
            if status == Status::StreamEnd || (consumed >= input.len() && has_room) {
                break;
            }
            if !progressed && has_room {
                return Err(extension_error("inflate made no progress".to_string()));
            }
        }
        Ok(output)
    }

    /// Deflates one message payload with a sync flush and strips the trailer.
    pub fn deflate(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.params.client_no_context_takeover {
            self.deflater.reset();
        }

        let mut output = Vec::with_capacity(CHUNK.max(payload.len() / 2));
        let start_in = self.deflater.total_in();
        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK.max(output.capacity()));
            }
            let consumed = (self.deflater.total_in() - start_in) as usize;
            self.deflater
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| extension_error(format!("deflate failed: {}", e)))?;
            let consumed = (self.deflater.total_in() - start_in) as usize;
            if consumed >= payload.len() && output.len() < output.capacity() {
                break;
            }
        }
        if output.ends_with(&SYNC_TRAILER) {
            output.truncate(output.len() - SYNC_TRAILER.len());
        }
        Ok(output)
    }
}
