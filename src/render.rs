//! Terminal output: banner, prompt, thinking spinner and Markdown replies.
//!
//! Replies are parsed with `pulldown-cmark` and written as ANSI-styled text
//! through `crossterm`, or as plain text when colour is disabled.

use crate::error::Result;
use crossterm::cursor::{ MoveTo, MoveToColumn };
use crossterm::execute;
use crossterm::style::{ Attribute, Color, ContentStyle, Stylize };
use crossterm::terminal::{ Clear, ClearType };
use pulldown_cmark::{ Event, Options, Parser, Tag, TagEnd };
use std::io::{ self, IsTerminal, Write };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::task::JoinHandle;

pub const BANNER: &str = "\
Shako - A command-line tool for interacting with Shako AI chatbot. (https://shako.ai)
    DOUBLE \"enter\" to send a message.
    - Type \"!exit\" to exit the program.
    - Type \"!clear\" to clear the console.
    - Type \"!new\" to start a new conversation.
";

const PROMPT_LABEL: &str = "You";
const PROMPT_COLOR: Color = Color::AnsiValue(121);
const THINKING_MESSAGE: &str = "Please wait! Shako is thinking..";
const SPINNER_FRAMES: [&str; 4] = ["∙∙∙", "●∙∙", "∙●∙", "∙∙●"];
const SPINNER_INTERVAL: Duration = Duration::from_millis(120);
const RULE_WIDTH: usize = 40;
const CODE_INDENT: &str = "    ";

/// Everything the chat loop shows to the user.
pub trait Renderer: Send {
    fn clear(&mut self) -> Result<()>;

    fn banner(&mut self) -> Result<()>;

    fn prompt(&mut self) -> Result<()>;

    /// Shows a progress indicator until `stop_thinking` is called.
    fn start_thinking(&mut self);

    fn stop_thinking(&mut self);

    /// Renders a reply given as Markdown.
    fn reply(&mut self, markdown: &str) -> Result<()>;
}

pub struct TerminalRenderer {
    styled: bool,
    /// The spinner rewrites its line with `\r`, so it only runs on a terminal.
    animate: bool,
    spinner: Option<Spinner>,
}

impl TerminalRenderer {
    pub fn new(styled: bool) -> Self {
        Self::with_animation(styled, io::stdout().is_terminal())
    }

    pub fn with_animation(styled: bool, animate: bool) -> Self {
        Self { styled, animate, spinner: None }
    }
}

impl Renderer for TerminalRenderer {
    fn clear(&mut self) -> Result<()> {
        execute!(io::stdout(), Clear(ClearType::All), MoveTo(0, 0))?;
        Ok(())
    }

    fn banner(&mut self) -> Result<()> {
        println!("{}", BANNER);
        Ok(())
    }

    fn prompt(&mut self) -> Result<()> {
        let mut out = io::stdout();
        if self.styled {
            write!(out, "{} : ", PROMPT_LABEL.with(PROMPT_COLOR))?;
        } else {
            write!(out, "{} : ", PROMPT_LABEL)?;
        }
        out.flush()?;
        Ok(())
    }

    fn start_thinking(&mut self) {
        if self.animate && self.spinner.is_none() {
            self.spinner = Some(Spinner::start(THINKING_MESSAGE, self.styled));
        }
    }

    fn stop_thinking(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop();
        }
    }

    fn reply(&mut self, markdown: &str) -> Result<()> {
        let mut out = io::stdout();
        writeln!(out, "{}", render_markdown(markdown, self.styled))?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}

impl Drop for TerminalRenderer {
    fn drop(&mut self) {
        self.stop_thinking();
    }
}

/// Animated status line drawn by a background task.
///
/// The `running` flag is checked under the same lock the task holds while
/// drawing, so no frame is written after `stop` returns.
struct Spinner {
    running: Arc<Mutex<bool>>,
    handle: JoinHandle<()>,
}

impl Spinner {
    fn start(message: &'static str, styled: bool) -> Self {
        let running = Arc::new(Mutex::new(true));
        let flag = Arc::clone(&running);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPINNER_INTERVAL);
            for frame in SPINNER_FRAMES.iter().cycle() {
                ticker.tick().await;
                let Ok(running) = flag.lock() else {
                    break;
                };
                if !*running {
                    break;
                }
                let mut out = io::stdout();
                let _ = if styled {
                    write!(out, "\r{} {}", frame.with(Color::Blue), message.bold().with(Color::Blue))
                } else {
                    write!(out, "\r{} {}", frame, message)
                };
                let _ = out.flush();
            }
        });
        Self { running, handle }
    }

    fn stop(self) {
        if let Ok(mut running) = self.running.lock() {
            *running = false;
            let _ = execute!(io::stdout(), MoveToColumn(0), Clear(ClearType::CurrentLine));
        }
        self.handle.abort();
    }
}

/// Renders Markdown into terminal text, with ANSI styling when `styled` is set.
pub fn render_markdown(markdown: &str, styled: bool) -> String {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut writer = MarkdownWriter::new(styled);
    for event in Parser::new_ext(markdown, options) {
        writer.event(event);
    }
    writer.finish()
}

struct MarkdownWriter {
    styled: bool,
    out: String,
    at_line_start: bool,
    item_pending: bool,
    bold: usize,
    italic: usize,
    strike: usize,
    heading: bool,
    in_code_block: bool,
    quote_depth: usize,
    lists: Vec<Option<u64>>,
    links: Vec<String>,
}

impl MarkdownWriter {
    fn new(styled: bool) -> Self {
        Self {
            styled,
            out: String::new(),
            at_line_start: true,
            item_pending: false,
            bold: 0,
            italic: 0,
            strike: 0,
            heading: false,
            in_code_block: false,
            quote_depth: 0,
            lists: Vec::new(),
            links: Vec::new(),
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => {
                let style = if self.in_code_block { code_style() } else { self.text_style() };
                self.write(&text, style);
            }
            Event::Code(code) => {
                if self.styled {
                    self.write(&code, code_style());
                } else {
                    self.write(&format!("`{}`", code), ContentStyle::new());
                }
            }
            Event::Html(html) | Event::InlineHtml(html) => self.write(&html, ContentStyle::new()),
            Event::SoftBreak | Event::HardBreak => self.newline(),
            Event::Rule => {
                self.blank_line();
                self.write(&"─".repeat(RULE_WIDTH), dim_style());
                self.end_line();
            }
            Event::TaskListMarker(done) => {
                self.write(if done { "[x] " } else { "[ ] " }, ContentStyle::new());
            }
            Event::FootnoteReference(label) => {
                self.write(&format!("[^{}]", label), dim_style());
            }
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => {
                if !self.item_pending {
                    self.blank_line();
                }
            }
            Tag::Heading { .. } => {
                self.blank_line();
                self.heading = true;
            }
            Tag::BlockQuote => {
                self.blank_line();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(_) => {
                self.blank_line();
                self.in_code_block = true;
            }
            Tag::List(start) => {
                if self.lists.is_empty() {
                    self.blank_line();
                } else {
                    self.end_line();
                }
                self.lists.push(start);
            }
            Tag::Item => {
                self.end_line();
                let indent = "  ".repeat(self.lists.len().saturating_sub(1));
                let bullet = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let bullet = format!("{}. ", n);
                        *n += 1;
                        bullet
                    }
                    _ => "• ".to_string(),
                };
                self.write(&indent, ContentStyle::new());
                let bullet_style = self.color(Color::Cyan);
                self.write(&bullet, bullet_style);
                self.item_pending = true;
            }
            Tag::Emphasis => {
                self.italic += 1;
            }
            Tag::Strong => {
                self.bold += 1;
            }
            Tag::Strikethrough => {
                self.strike += 1;
            }
            Tag::Link { dest_url, .. } | Tag::Image { dest_url, .. } => {
                self.links.push(dest_url.to_string());
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.end_line(),
            TagEnd::Heading(_) => {
                self.heading = false;
                self.end_line();
            }
            TagEnd::BlockQuote => {
                self.end_line();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                self.end_line();
            }
            TagEnd::List(_) => {
                self.lists.pop();
                self.end_line();
            }
            TagEnd::Item => {
                self.item_pending = false;
                self.end_line();
            }
            TagEnd::Emphasis => {
                self.italic = self.italic.saturating_sub(1);
            }
            TagEnd::Strong => {
                self.bold = self.bold.saturating_sub(1);
            }
            TagEnd::Strikethrough => {
                self.strike = self.strike.saturating_sub(1);
            }
            TagEnd::Link | TagEnd::Image => {
                if let Some(url) = self.links.pop() {
                    if !url.is_empty() {
                        self.write(&format!(" ({})", url), dim_style());
                    }
                }
            }
            _ => {}
        }
    }

    fn text_style(&self) -> ContentStyle {
        let mut style = ContentStyle::new();
        if self.bold > 0 || self.heading {
            style.attributes.set(Attribute::Bold);
        }
        if self.italic > 0 {
            style.attributes.set(Attribute::Italic);
        }
        if self.strike > 0 {
            style.attributes.set(Attribute::CrossedOut);
        }
        if self.heading {
            style.attributes.set(Attribute::Underlined);
            style.foreground_color = Some(Color::Magenta);
        } else if !self.links.is_empty() {
            style.attributes.set(Attribute::Underlined);
            style.foreground_color = Some(Color::Blue);
        }
        style
    }

    fn color(&self, color: Color) -> ContentStyle {
        let mut style = ContentStyle::new();
        style.foreground_color = Some(color);
        style
    }

    fn write(&mut self, text: &str, style: ContentStyle) {
        for (i, segment) in text.split('\n').enumerate() {
            if i > 0 {
                self.newline();
            }
            if segment.is_empty() {
                continue;
            }
            self.line_prefix();
            self.item_pending = false;
            if self.styled {
                self.out.push_str(&style.apply(segment).to_string());
            } else {
                self.out.push_str(segment);
            }
        }
    }

    fn line_prefix(&mut self) {
        if !self.at_line_start {
            return;
        }
        self.at_line_start = false;
        for _ in 0..self.quote_depth {
            if self.styled {
                self.out.push_str(&dim_style().apply("│ ").to_string());
            } else {
                self.out.push_str("│ ");
            }
        }
        if self.in_code_block {
            self.out.push_str(CODE_INDENT);
        }
    }

    fn newline(&mut self) {
        self.out.push('\n');
        self.at_line_start = true;
    }

    fn end_line(&mut self) {
        if !self.at_line_start {
            self.newline();
        }
    }

    fn blank_line(&mut self) {
        self.end_line();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.newline();
        }
    }

    fn finish(self) -> String {
        self.out.trim_end_matches('\n').to_string()
    }
}

fn code_style() -> ContentStyle {
    let mut style = ContentStyle::new();
    style.foreground_color = Some(Color::Yellow);
    style
}

fn dim_style() -> ContentStyle {
    let mut style = ContentStyle::new();
    style.attributes.set(Attribute::Dim);
    style
}
