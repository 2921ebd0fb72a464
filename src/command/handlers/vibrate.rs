//! vibrateDevice handler

use super::CapabilityHandler;
use agent_shared::Outcome;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_DURATION_MS: u64 = 500;
pub const MAX_DURATION_MS: u64 = 10_000;

/// Platform actuator behind the vibrateDevice command
pub trait Vibrator: Send + Sync {
    fn vibrate(&self, duration: Duration) -> Result<(), String>;
}

/// Used on platforms without a vibration motor
pub struct NoopVibrator;

impl Vibrator for NoopVibrator {
    fn vibrate(&self, duration: Duration) -> Result<(), String> {
        info!("  [VIBRATE] {}ms pulse requested (no actuator)", duration.as_millis());
        Ok(())
    }
}

pub struct VibrateHandler {
    vibrator: Arc<dyn Vibrator>,
}

impl VibrateHandler {
    pub fn new(vibrator: Arc<dyn Vibrator>) -> Self {
        Self { vibrator }
    }
}

#[async_trait]
impl CapabilityHandler for VibrateHandler {
    async fn handle(&self, params: Value) -> Outcome {
        let duration_ms = match parse_duration(&params) {
            Ok(ms) => ms,
            Err(message) => return Outcome::failure(message),
        };

        match self.vibrator.vibrate(Duration::from_millis(duration_ms)) {
            Ok(()) => Outcome::ok(json!({ "duration": duration_ms })),
            Err(e) => Outcome::failure(format!("vibration failed: {}", e)),
        }
    }
}

/// `duration` in milliseconds; absent means the default pulse
fn parse_duration(params: &Value) -> Result<u64, String> {
    let raw = match params.get("duration") {
        None | Some(Value::Null) => return Ok(DEFAULT_DURATION_MS),
        Some(raw) => raw,
    };
    let duration = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    duration
        .filter(|ms| (1..=MAX_DURATION_MS).contains(ms))
        .ok_or_else(|| {
            format!(
                "duration must be an integer between 1 and {} ms, got {}",
                MAX_DURATION_MS, raw
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingVibrator {
        pulses: Mutex<Vec<Duration>>,
    }

    impl Vibrator for RecordingVibrator {
        fn vibrate(&self, duration: Duration) -> Result<(), String> {
            self.pulses.lock().unwrap().push(duration);
            Ok(())
        }
    }

    struct BrokenVibrator;

    impl Vibrator for BrokenVibrator {
        fn vibrate(&self, _: Duration) -> Result<(), String> {
            Err("motor unavailable".into())
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(&Value::Null), Ok(DEFAULT_DURATION_MS));
        assert_eq!(parse_duration(&json!({})), Ok(DEFAULT_DURATION_MS));
        assert_eq!(parse_duration(&json!({"duration": 250})), Ok(250));
        assert_eq!(parse_duration(&json!({"duration": "1200"})), Ok(1200));
        assert!(parse_duration(&json!({"duration": 0})).is_err());
        assert!(parse_duration(&json!({"duration": -5})).is_err());
        assert!(parse_duration(&json!({"duration": 10_001})).is_err());
        assert!(parse_duration(&json!({"duration": [1]})).is_err());
    }

    #[tokio::test]
    async fn test_vibrate_echoes_duration() {
        let vibrator = Arc::new(RecordingVibrator::default());
        let handler = VibrateHandler::new(vibrator.clone());

        let outcome = handler.handle(json!({"duration": 500})).await;
        assert_eq!(outcome, Outcome::ok(json!({"duration": 500})));
        assert_eq!(*vibrator.pulses.lock().unwrap(), vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn test_invalid_duration_is_handler_failure() {
        let handler = VibrateHandler::new(Arc::new(NoopVibrator));
        let outcome = handler.handle(json!({"duration": "soon"})).await;
        assert!(matches!(
            outcome,
            Outcome::Err { kind: agent_shared::ErrorKind::HandlerFailure, .. }
        ));
    }

    #[tokio::test]
    async fn test_actuator_failure() {
        let handler = VibrateHandler::new(Arc::new(BrokenVibrator));
        match handler.handle(Value::Null).await {
            Outcome::Err { message, .. } => assert!(message.contains("motor unavailable")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
