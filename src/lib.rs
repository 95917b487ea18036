pub mod assembler;
pub mod cli;
pub mod deflate;
pub mod error;
pub mod input;
pub mod models;
pub mod render;
pub mod session;
pub mod websocket;

use cli::Args;
use input::ReaderLines;
use log::info;
use render::TerminalRenderer;
use session::ChatController;
use std::error::Error;
use websocket::WsConnector;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let connector = WsConnector::from_args(&args)?;

    info!("--- Chat Configuration ---");
    info!("Endpoint: {}", connector.url());
    info!("Origin: {}", args.origin);
    info!("User-Agent: {}", args.user_agent);
    info!("Advertise permessage-deflate: {}", !args.no_deflate);
    info!("Colour output: {}", !args.no_color);
    info!("--------------------------");

    let renderer = TerminalRenderer::new(!args.no_color);
    let mut controller = ChatController::new(connector, renderer);
    controller.show_banner()?;

    let mut input = ReaderLines::stdin();
    controller.run(&mut input).await?;

    Ok(())
}
