//! Rendering-layer seam.
//!
//! The orchestrator pushes status/text/emotion updates through [`Display`];
//! user intent comes back as the closed [`UiEvent`] enum over mpsc, so the
//! UI's capability surface is statically enumerable.

use crate::error::Result;
use crate::state::ListeningMode;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    ToggleChat,
    StartListening(ListeningMode),
    StopListening,
    Abort,
    SendText(String),
}

pub type UiEventSender = mpsc::Sender<UiEvent>;
pub type UiEventReceiver = mpsc::Receiver<UiEvent>;

pub fn ui_channel() -> (UiEventSender, UiEventReceiver) {
    mpsc::channel(32)
}

#[async_trait]
pub trait Display: Send + Sync {
    async fn update_status(&self, status: &str, connected: bool) -> Result<()>;

    async fn update_text(&self, text: &str) -> Result<()>;

    async fn update_emotion(&self, emotion: &str) -> Result<()>;

    /// One-line user-visible failure notice.
    async fn alert(&self, title: &str, message: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Minimal terminal renderer: prints a line only when something changed.
pub struct ConsoleDisplay {
    last_line: Mutex<String>,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        ConsoleDisplay {
            last_line: Mutex::new(String::new()),
        }
    }

    fn print_if_changed(&self, line: String) {
        let mut last = match self.last_line.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *last != line {
            println!("{line}");
            *last = line;
        }
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Display for ConsoleDisplay {
    async fn update_status(&self, status: &str, connected: bool) -> Result<()> {
        let marker = if connected { "*" } else { " " };
        self.print_if_changed(format!("[{marker}] {status}"));
        Ok(())
    }

    async fn update_text(&self, text: &str) -> Result<()> {
        if !text.is_empty() {
            self.print_if_changed(format!("    {text}"));
        }
        Ok(())
    }

    async fn update_emotion(&self, emotion: &str) -> Result<()> {
        log::debug!("emotion: {emotion}");
        Ok(())
    }

    async fn alert(&self, title: &str, message: &str) -> Result<()> {
        eprintln!("!! {title}: {message}");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
