use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{ AsyncBufReadExt, AsyncRead, BufReader, Lines };

/// Source of raw input lines; `None` means input is exhausted.
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> Result<Option<String>>;
}

pub struct ReaderLines<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> ReaderLines<R> {
    pub fn new(reader: R) -> Self {
        Self { lines: BufReader::new(reader).lines() }
    }
}

impl ReaderLines<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for ReaderLines<R> {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}

/// Reads lines until a blank one ("double enter") and joins them with `\n`.
///
/// Returns `None` when input ends before anything was typed. Input that ends
/// mid-batch yields what was collected so far.
pub async fn read_query(source: &mut dyn LineSource) -> Result<Option<String>> {
    let mut lines: Vec<String> = Vec::new();
    loop {
        match source.next_line().await? {
            Some(line) if line.is_empty() => {
                return Ok(Some(lines.join("\n")));
            }
            Some(line) => lines.push(line),
            None if lines.is_empty() => {
                return Ok(None);
            }
            None => {
                return Ok(Some(lines.join("\n")));
            }
        }
    }
}
