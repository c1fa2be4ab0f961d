//! Channel type definitions for inter-task communication

use tokio::sync::{mpsc, watch};

use super::types::EventLogEntry;

/// Create the unbounded channel feeding a pair's event journal writer
///
/// Unbounded so that recording an event never blocks a cycle.
pub fn create_event_channel() -> (
    mpsc::UnboundedSender<EventLogEntry>,
    mpsc::UnboundedReceiver<EventLogEntry>,
) {
    mpsc::unbounded_channel()
}

/// Create a shutdown signal shared by all pair workers
pub fn create_shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
