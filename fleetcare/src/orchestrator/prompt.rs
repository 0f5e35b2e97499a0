//! Confirmation gates between the worker and the foreground.
//!
//! The worker asks through [`Confirm`]. [`PromptChannel`] forwards each
//! question to the foreground as a [`Prompt`] carrying a oneshot reply, and
//! the worker awaits that reply. A reply sender dropped without an answer
//! counts as "no".

use std::fmt;
use std::future::Future;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::rules::OperationKind;

/// Answers the questions a run may ask.
pub trait Confirm: Send + Sync {
    /// Whether to start the next operation.
    fn ask_continue(&self, operation: OperationKind) -> impl Future<Output = bool> + Send;

    /// Whether to reboot a device.
    fn ask_reboot(&self, device: &str) -> impl Future<Output = bool> + Send;
}

/// Answers every question with a fixed decision.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl AutoConfirm {
    pub fn yes() -> Self {
        Self(true)
    }

    pub fn no() -> Self {
        Self(false)
    }
}

impl Default for AutoConfirm {
    fn default() -> Self {
        Self::yes()
    }
}

impl Confirm for AutoConfirm {
    async fn ask_continue(&self, _operation: OperationKind) -> bool {
        self.0
    }

    async fn ask_reboot(&self, _device: &str) -> bool {
        self.0
    }
}

/// What the worker is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    Continue(OperationKind),
    Reboot(String),
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Question::Continue(kind) => write!(f, "Proceed with '{kind}'?"),
            Question::Reboot(device) => write!(f, "Reboot {device} now?"),
        }
    }
}

/// A question in flight, answered once through `reply`.
#[derive(Debug)]
pub struct Prompt {
    pub question: Question,
    pub reply: oneshot::Sender<bool>,
}

impl Prompt {
    /// Send the answer back to the worker.
    pub fn answer(self, yes: bool) {
        if self.reply.send(yes).is_err() {
            debug!("Worker stopped waiting for: {}", self.question);
        }
    }
}

/// [`Confirm`] implementation that forwards questions over a channel.
#[derive(Debug, Clone)]
pub struct PromptChannel {
    tx: mpsc::Sender<Prompt>,
}

impl PromptChannel {
    /// Create the worker side and the receiver the foreground reads.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Prompt>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    async fn ask(&self, question: Question) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .tx
            .send(Prompt {
                question: question.clone(),
                reply,
            })
            .await
            .is_err()
        {
            warn!("No one is answering prompts; treating '{question}' as declined");
            return false;
        }

        match answer.await {
            Ok(yes) => yes,
            Err(_) => {
                warn!("Prompt '{question}' dropped without an answer; treating as declined");
                false
            }
        }
    }
}

impl Confirm for PromptChannel {
    async fn ask_continue(&self, operation: OperationKind) -> bool {
        self.ask(Question::Continue(operation)).await
    }

    async fn ask_reboot(&self, device: &str) -> bool {
        self.ask(Question::Reboot(device.to_string())).await
    }
}
