use crate::domain::ports::{Observer, ObserverId};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// An observer that writes labelled updates to a text sink.
///
/// Used by the command line front-end to show what a client sees.
pub struct ConsoleObserver<W: Write + Send> {
    id: ObserverId,
    label: String,
    sink: Mutex<W>,
}

impl ConsoleObserver<io::Stdout> {
    pub fn stdout(label: impl Into<String>) -> Self {
        Self::new(label, io::stdout())
    }
}

impl<W: Write + Send> ConsoleObserver<W> {
    pub fn new(label: impl Into<String>, sink: W) -> Self {
        Self {
            id: ObserverId::new(),
            label: label.into(),
            sink: Mutex::new(sink),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Consumes the observer and returns the sink.
    pub fn into_inner(self) -> W {
        self.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: &str, body: &str) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let result = writeln!(sink, "[{}] {kind}:", self.label)
            .and_then(|_| {
                for line in body.lines() {
                    writeln!(sink, "  {line}")?;
                }
                Ok(())
            })
            .and_then(|_| sink.flush());
        if let Err(e) = result {
            warn!(observer = %self.id, error = %e, "Failed to write update");
        }
    }
}

impl<W: Write + Send> Observer for ConsoleObserver<W> {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn update_state(&self, state: &str) {
        self.emit("channel", state);
    }

    fn update_balance(&self, balance: &str) {
        self.emit("balance", balance);
    }
}
