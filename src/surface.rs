//! Chat surface capability interface.
//!
//! Platform adapters (Telegram, Discord, CLI, ...) each implement this small
//! trait; tasks that run with no live chat attached get the `SilentSurface`,
//! which records replies instead of sending them anywhere.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Error;

/// The fixed capability set a tool or worker may use to talk back to a chat.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Send a plain text reply.
    async fn reply(&self, text: &str) -> Result<(), Error>;

    /// Send a file from disk.
    async fn reply_document(&self, path: &Path, caption: Option<&str>) -> Result<(), Error>;

    /// Send an ephemeral progress note (adapters may drop these).
    async fn progress(&self, text: &str) -> Result<(), Error> {
        self.reply(text).await
    }
}

/// Surface used when a task runs headless. Replies are buffered so the
/// runtime can fold them into the task result.
#[derive(Default)]
pub struct SilentSurface {
    replies: Arc<Mutex<Vec<String>>>,
}

impl SilentSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything replied so far.
    pub async fn take_replies(&self) -> Vec<String> {
        std::mem::take(&mut *self.replies.lock().await)
    }
}

#[async_trait]
impl ChatSurface for SilentSurface {
    async fn reply(&self, text: &str) -> Result<(), Error> {
        self.replies.lock().await.push(text.to_string());
        Ok(())
    }

    async fn reply_document(&self, path: &Path, caption: Option<&str>) -> Result<(), Error> {
        let note = match caption {
            Some(c) => format!("[file: {}] {}", path.display(), c),
            None => format!("[file: {}]", path.display()),
        };
        self.replies.lock().await.push(note);
        Ok(())
    }

    async fn progress(&self, _text: &str) -> Result<(), Error> {
        // Headless tasks have nobody watching progress.
        Ok(())
    }
}
