//! Bridges the platform callback onto the core's handler traits

use std::sync::Arc;

use crate::device::{HandlerError, RecordingHandler, StatusSink};

use super::types::CaptureCallback;

pub(crate) struct CallbackBridge {
    callback: Arc<dyn CaptureCallback>,
}

impl CallbackBridge {
    pub fn new(callback: Arc<dyn CaptureCallback>) -> Self {
        Self { callback }
    }
}

impl RecordingHandler for CallbackBridge {
    fn on_prepare_requested(&self, session_id: Option<&str>) -> Result<(), HandlerError> {
        if self
            .callback
            .on_prepare_requested(session_id.map(str::to_string))
        {
            Ok(())
        } else {
            Err(HandlerError::new("platform could not prepare sensors"))
        }
    }

    fn on_recording_start_requested(
        &self,
        session_id: &str,
        start_timestamp: i64,
    ) -> Result<(), HandlerError> {
        if self
            .callback
            .on_recording_start_requested(session_id.to_string(), start_timestamp)
        {
            Ok(())
        } else {
            Err(HandlerError::new("platform could not start recording"))
        }
    }

    fn on_recording_stop_requested(&self, session_id: &str) -> Result<(), HandlerError> {
        if self.callback.on_recording_stop_requested(session_id.to_string()) {
            Ok(())
        } else {
            Err(HandlerError::new("platform could not stop recording"))
        }
    }
}

impl StatusSink for CallbackBridge {
    fn on_status(&self, message: &str) {
        self.callback.on_status(message.to_string());
    }

    fn on_connection_changed(&self, connected: bool, peer_address: Option<&str>) {
        self.callback
            .on_connection_changed(connected, peer_address.map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakePlatform {
        refuse: bool,
        events: Mutex<Vec<String>>,
    }

    impl CaptureCallback for FakePlatform {
        fn on_prepare_requested(&self, session_id: Option<String>) -> bool {
            self.events.lock().push(format!("prepare {:?}", session_id));
            !self.refuse
        }

        fn on_recording_start_requested(&self, session_id: String, start_timestamp: i64) -> bool {
            self.events
                .lock()
                .push(format!("start {} {}", session_id, start_timestamp));
            !self.refuse
        }

        fn on_recording_stop_requested(&self, session_id: String) -> bool {
            self.events.lock().push(format!("stop {}", session_id));
            !self.refuse
        }

        fn on_status(&self, message: String) {
            self.events.lock().push(format!("status {}", message));
        }

        fn on_connection_changed(&self, connected: bool, peer_address: Option<String>) {
            self.events
                .lock()
                .push(format!("connected {} {:?}", connected, peer_address));
        }
    }

    #[test]
    fn test_refusal_becomes_handler_error() {
        let platform = Arc::new(FakePlatform {
            refuse: true,
            ..Default::default()
        });
        let bridge = CallbackBridge::new(platform.clone());

        assert!(bridge.on_recording_start_requested("s1", 5).is_err());
        assert!(bridge.on_recording_stop_requested("s1").is_err());
        assert_eq!(
            *platform.events.lock(),
            vec!["start s1 5".to_string(), "stop s1".to_string()]
        );
    }

    #[test]
    fn test_status_is_forwarded() {
        let platform = Arc::new(FakePlatform::default());
        let bridge = CallbackBridge::new(platform.clone());

        assert!(bridge.on_prepare_requested(Some("s1")).is_ok());
        StatusSink::on_status(&bridge, "ready");
        assert_eq!(
            *platform.events.lock(),
            vec!["prepare Some(\"s1\")".to_string(), "status ready".to_string()]
        );
    }

    #[test]
    fn test_connection_changes_are_forwarded() {
        let platform = Arc::new(FakePlatform::default());
        let bridge = CallbackBridge::new(platform.clone());

        StatusSink::on_connection_changed(&bridge, true, Some("10.0.0.2:50000"));
        StatusSink::on_connection_changed(&bridge, false, None);
        assert_eq!(
            *platform.events.lock(),
            vec![
                "connected true Some(\"10.0.0.2:50000\")".to_string(),
                "connected false None".to_string(),
            ]
        );
    }
}
