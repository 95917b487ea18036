use serde::{ Serialize, Deserialize };

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub content: String,
    pub role: Role,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { content: content.into(), role: Role::User }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self { content: content.into(), role: Role::Model }
    }
}

/// Append-only list of turns exchanged within one chat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// History followed by the pending turn, as sent on the wire.
    pub fn with_pending(&self, pending: Turn) -> Vec<Turn> {
        let mut prompt = Vec::with_capacity(self.turns.len() + 1);
        prompt.extend(self.turns.iter().cloned());
        prompt.push(pending);
        prompt
    }
}
