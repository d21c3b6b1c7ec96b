//! Leveled logging capability injected into the converter.
//!
//! Library code never touches a global logger directly. A [`Converter`]
//! holds an `Arc<dyn Logger>`; the CLI passes a [`TracingLogger`], tests use
//! the silent [`NoopLogger`] default.
//!
//! [`Converter`]: crate::convert::Converter

/// Sink for operator-facing messages.
pub trait Logger: Send + Sync {
    /// Informational message.
    fn info(&self, message: &str);

    /// Something unexpected that does not stop the conversion.
    fn warn(&self, message: &str);
}

/// Forwards messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}
