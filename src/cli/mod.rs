use clap::builder::{ BoolishValueParser, FalseyValueParser };
use clap::Parser;
use url::Url;

use crate::error::{ ChatError, Result };

pub const DEFAULT_URL: &str = "wss://api.shako.ai/api/chat";
pub const DEFAULT_ORIGIN: &str = "https://shako.ai";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/113.0";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chat with Shako AI from the terminal", long_about = None)]
pub struct Args {
    // --- Endpoint Args ---
    /// WebSocket endpoint of the chat service (ws:// or wss://)
    #[arg(long, env = "SHAKO_URL", default_value = DEFAULT_URL)]
    pub url: String,

    /// Origin header sent with the handshake
    #[arg(long, env = "SHAKO_ORIGIN", default_value = DEFAULT_ORIGIN)]
    pub origin: String,

    /// User-Agent header sent with the handshake
    #[arg(long, env = "SHAKO_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Do not advertise the permessage-deflate extension
    #[arg(long, env = "SHAKO_NO_DEFLATE", default_value = "false")]
    pub no_deflate: bool,

    // --- Terminal Args ---
    /// Render replies without ANSI styling
    #[arg(long, env = "NO_COLOR", value_parser = FalseyValueParser::new())]
    pub no_color: bool,

    /// Enable debug logging on stderr
    #[arg(long, env = "DEBUG", value_parser = BoolishValueParser::new())]
    pub debug: bool,
}

impl Args {
    /// Parses and checks the endpoint URL.
    pub fn endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| ChatError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other =>
                Err(ChatError::InvalidUrl {
                    url: self.url.clone(),
                    reason: format!("unsupported scheme '{}', expected ws or wss", other),
                }),
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug { "debug" } else { "warn" }
    }
}
