//! Hooks into the platform layer
//!
//! The core does not record anything itself. When a command changes the
//! device state it asks the registered [`RecordingHandler`]; status text and
//! controller connection changes go to every registered [`StatusSink`].

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// Failure reported by a recording handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Starts and stops the actual capture pipelines
pub trait RecordingHandler: Send + Sync {
    /// Warm up sensors. Most platforms need nothing here.
    fn on_prepare_requested(&self, _session_id: Option<&str>) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_recording_start_requested(
        &self,
        session_id: &str,
        start_timestamp: i64,
    ) -> Result<(), HandlerError>;

    fn on_recording_stop_requested(&self, session_id: &str) -> Result<(), HandlerError>;
}

/// Receives human-readable status lines
pub trait StatusSink: Send + Sync {
    fn on_status(&self, message: &str);

    /// Controller link went up or down. Called once per transition, so a
    /// preemption shows up as a disconnect followed by a connect.
    fn on_connection_changed(&self, _connected: bool, _peer_address: Option<&str>) {}
}

#[derive(Default)]
pub struct HandlerRegistry {
    recording: RwLock<Option<Arc<dyn RecordingHandler>>>,
    status: RwLock<Vec<Arc<dyn StatusSink>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recording_handler(&self, handler: Arc<dyn RecordingHandler>) {
        *self.recording.write() = Some(handler);
    }

    pub fn clear_recording_handler(&self) {
        *self.recording.write() = None;
    }

    pub fn recording_handler(&self) -> Option<Arc<dyn RecordingHandler>> {
        self.recording.read().clone()
    }

    pub fn add_status_sink(&self, sink: Arc<dyn StatusSink>) {
        self.status.write().push(sink);
    }

    pub fn clear_status_sinks(&self) {
        self.status.write().clear();
    }

    /// Log and fan out a status line
    pub fn status(&self, message: &str) {
        tracing::info!("{}", message);
        // Clone out so a sink may register another sink without deadlocking
        let sinks: Vec<_> = self.status.read().clone();
        for sink in sinks {
            sink.on_status(message);
        }
    }

    pub fn connection_changed(&self, connected: bool, peer_address: Option<&str>) {
        let sinks: Vec<_> = self.status.read().clone();
        for sink in sinks {
            sink.on_connection_changed(connected, peer_address);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording doubles shared by the controller and dispatcher tests

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Prepare(Option<String>),
        Start(String, i64),
        Stop(String),
    }

    #[derive(Default)]
    pub struct RecordingSpy {
        pub calls: Mutex<Vec<Call>>,
        pub fail_start: Mutex<Option<String>>,
        pub fail_stop: Mutex<Option<String>>,
    }

    impl RecordingSpy {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl RecordingHandler for RecordingSpy {
        fn on_prepare_requested(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
            self.calls.lock().push(Call::Prepare(session_id.map(str::to_string)));
            Ok(())
        }

        fn on_recording_start_requested(
            &self,
            session_id: &str,
            start_timestamp: i64,
        ) -> Result<(), HandlerError> {
            self.calls
                .lock()
                .push(Call::Start(session_id.to_string(), start_timestamp));
            match self.fail_start.lock().clone() {
                Some(reason) => Err(HandlerError(reason)),
                None => Ok(()),
            }
        }

        fn on_recording_stop_requested(&self, session_id: &str) -> Result<(), HandlerError> {
            self.calls.lock().push(Call::Stop(session_id.to_string()));
            match self.fail_stop.lock().clone() {
                Some(reason) => Err(HandlerError(reason)),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    pub struct StatusLog(pub Mutex<Vec<String>>);

    impl StatusSink for StatusLog {
        fn on_status(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    /// Records link transitions as `up <peer>` / `down <peer>`
    #[derive(Default)]
    pub struct ConnectionLog(pub Mutex<Vec<String>>);

    impl ConnectionLog {
        pub fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl StatusSink for ConnectionLog {
        fn on_status(&self, _message: &str) {}

        fn on_connection_changed(&self, connected: bool, peer_address: Option<&str>) {
            let state = if connected { "up" } else { "down" };
            self.0
                .lock()
                .push(format!("{} {}", state, peer_address.unwrap_or("-")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StatusLog;
    use super::*;

    #[test]
    fn test_status_fans_out() {
        let registry = HandlerRegistry::new();
        let a = Arc::new(StatusLog::default());
        let b = Arc::new(StatusLog::default());
        registry.add_status_sink(a.clone());
        registry.add_status_sink(b.clone());

        registry.status("connected");
        assert_eq!(*a.0.lock(), vec!["connected".to_string()]);
        assert_eq!(*b.0.lock(), vec!["connected".to_string()]);
    }

    #[test]
    fn test_connection_changes_fan_out() {
        let registry = HandlerRegistry::new();
        let status = Arc::new(StatusLog::default());
        let links = Arc::new(super::testing::ConnectionLog::default());
        registry.add_status_sink(status.clone());
        registry.add_status_sink(links.clone());

        registry.connection_changed(true, Some("10.0.0.2:5000"));
        registry.connection_changed(false, None);

        assert_eq!(links.entries(), vec!["up 10.0.0.2:5000", "down -"]);
        // Sinks that only want text are untouched
        assert!(status.0.lock().is_empty());
    }

    #[test]
    fn test_handler_can_be_replaced() {
        let registry = HandlerRegistry::new();
        assert!(registry.recording_handler().is_none());

        registry.set_recording_handler(Arc::new(super::testing::RecordingSpy::default()));
        assert!(registry.recording_handler().is_some());
        registry.clear_recording_handler();
        assert!(registry.recording_handler().is_none());
    }
}
