use serde::{ Serialize, Deserialize };
use serde_json::{ Map, Value };

use super::chat::Turn;

pub const END_FRAME_TYPE: &str = "end";

/// Outbound message, sent once per turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub chat_id: String,
    pub metadata: Map<String, Value>,
    pub prompt: Vec<Turn>,
}

impl ChatRequest {
    pub fn new(chat_id: String, prompt: Vec<Turn>) -> Self {
        Self { chat_id, metadata: Map::new(), prompt }
    }
}

/// Inbound message; every key is optional.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl ResponseFrame {
    pub fn is_end(&self) -> bool {
        self.frame_type.as_deref() == Some(END_FRAME_TYPE)
    }
}
