//! Command dispatcher - resolves capability handlers by name and normalizes their outcomes

use super::handlers::{
    self, CapabilityHandler, NoopVibrator, SystemInfoHandler, VibrateHandler,
};
use crate::descriptor::DescriptorSource;
use agent_shared::{ErrorKind, Outcome};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dispatch table from command name to capability handler
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl Dispatcher {
    /// Create an empty dispatch table
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch table with the reference handlers registered
    pub fn with_builtin(source: DescriptorSource) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(
            handlers::VIBRATE_DEVICE,
            Arc::new(VibrateHandler::new(Arc::new(NoopVibrator))),
        );
        dispatcher.register(
            handlers::GET_SYSTEM_INFO,
            Arc::new(SystemInfoHandler::new(source)),
        );
        dispatcher
    }

    /// Register a handler, returning the one it replaces
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Execute `name` with `params`.
    ///
    /// Never panics and yields exactly one outcome: unknown names become
    /// `UnknownCommand`, handler panics become `HandlerFailure`.
    pub async fn dispatch(&self, name: &str, params: Value) -> Outcome {
        let Some(handler) = self.handlers.get(name) else {
            return Outcome::err(ErrorKind::UnknownCommand, name);
        };

        debug!("Dispatching {}", name);
        match AssertUnwindSafe(handler.handle(params)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("Handler for {} panicked: {}", name, message);
                Outcome::failure(format!("handler panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
