use crate::assembler::{ assemble_response, AssembledReply };
use crate::error::Result;
use crate::input::{ read_query, LineSource };
use crate::models::chat::{ Conversation, Turn };
use crate::models::websocket::ChatRequest;
use crate::render::Renderer;
use crate::websocket::Connector;
use log::{ debug, info, warn };
use uuid::Uuid;

/// In-band control commands. The whole query must equal the command, ignoring case;
/// surrounding whitespace makes it an ordinary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Exit,
    Clear,
    New,
}

impl Command {
    pub fn parse(query: &str) -> Option<Self> {
        match query.to_lowercase().as_str() {
            "!exit" => Some(Command::Exit),
            "!clear" => Some(Command::Clear),
            "!new" => Some(Command::New),
            _ => None,
        }
    }
}

/// Per-process chat state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    chat_id: Option<String>,
    conversation: Conversation,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Builds the payload for `query` without touching the recorded history.
    pub fn build_request(&self, query: &str) -> ChatRequest {
        let chat_id = self.chat_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        ChatRequest::new(chat_id, self.conversation.with_pending(Turn::user(query)))
    }

    /// Records a completed exchange.
    pub fn record(&mut self, query: &str, reply: AssembledReply) {
        if self.chat_id != reply.chat_id {
            debug!("Chat id changed: {:?} -> {:?}", self.chat_id, reply.chat_id);
        }
        self.chat_id = reply.chat_id;
        self.conversation.push(Turn::user(query));
        self.conversation.push(Turn::model(reply.text));
    }

    pub fn reset(&mut self) {
        self.chat_id = None;
        self.conversation.clear();
    }
}

/// Drives the read / command / exchange loop for one terminal session.
pub struct ChatController<C, R> {
    connector: C,
    renderer: R,
    session: Session,
}

impl<C: Connector, R: Renderer> ChatController<C, R> {
    pub fn new(connector: C, renderer: R) -> Self {
        Self { connector, renderer, session: Session::new() }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Clears the screen and prints the help banner.
    pub fn show_banner(&mut self) -> Result<()> {
        self.renderer.clear()?;
        self.renderer.banner()
    }

    /// Runs until `!exit` or end of input. Any transport failure is returned as is.
    ///
    /// The query is lowercased once; that form is both matched against the
    /// commands and sent and recorded as the user turn.
    pub async fn run(&mut self, input: &mut dyn LineSource) -> Result<()> {
        loop {
            self.renderer.prompt()?;
            let Some(query) = read_query(input).await? else {
                info!("Input closed, leaving chat");
                return Ok(());
            };
            let query = query.to_lowercase();

            match Command::parse(&query) {
                Some(Command::Exit) => {
                    info!("Exit requested");
                    return Ok(());
                }
                Some(Command::Clear) => {
                    self.show_banner()?;
                }
                Some(Command::New) => {
                    self.show_banner()?;
                    self.session.reset();
                    info!("Started a new conversation");
                }
                None => {
                    self.exchange(&query).await?;
                }
            }
        }
    }

    /// Sends one user turn and renders the reply. History is only updated on success.
    pub async fn exchange(&mut self, query: &str) -> Result<()> {
        let request = self.session.build_request(query);

        self.renderer.start_thinking();
        let outcome = self.round_trip(&request).await;
        self.renderer.stop_thinking();
        let reply = outcome?;

        self.renderer.reply(&reply.text)?;
        self.session.record(query, reply);
        debug!("Conversation now holds {} turns", self.session.conversation().len());
        Ok(())
    }

    async fn round_trip(&self, request: &ChatRequest) -> Result<AssembledReply> {
        let mut connection = self.connector.connect().await?;
        let outcome = assemble_response(connection.as_mut(), request).await;
        if let Err(e) = connection.close().await {
            warn!("Failed to close connection cleanly: {}", e);
        }
        outcome
    }
}
