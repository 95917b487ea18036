use crate::error::{ ChatError, Result };
use crate::models::websocket::{ ChatRequest, ResponseFrame };
use crate::websocket::Connection;
use log::{ debug, trace };

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledReply {
    pub text: String,
    /// `chat_id` carried by the terminal frame, if any.
    pub chat_id: Option<String>,
}

/// Sends `request` as a single text message and collects content fragments until
/// the `end` frame. There is no timeout; a server that never sends `end` but keeps
/// the connection open blocks the caller.
pub async fn assemble_response(
    connection: &mut dyn Connection,
    request: &ChatRequest
) -> Result<AssembledReply> {
    let payload = serde_json::to_string(request)?;
    debug!(
        "Sending request for chat {} with {} prompt turns",
        request.chat_id,
        request.prompt.len()
    );
    connection.send_text(payload).await?;

    let mut fragments: Vec<String> = Vec::new();
    let mut frames = 0usize;
    loop {
        let raw = match connection.recv_text().await? {
            Some(raw) => raw,
            None => {
                return Err(ChatError::StreamClosed { frames });
            }
        };
        frames += 1;

        let frame: ResponseFrame = serde_json::from_str(&raw)?;
        trace!("Frame {}: {:?}", frames, frame);

        let is_end = frame.is_end();
        if let Some(content) = frame.content {
            fragments.push(content);
        }
        if is_end {
            debug!("Response complete after {} frames", frames);
            return Ok(AssembledReply {
                text: fragments.concat().trim().to_string(),
                chat_id: frame.chat_id,
            });
        }
    }
}
