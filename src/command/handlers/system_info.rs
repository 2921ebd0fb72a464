//! getSystemInfo handler

use super::CapabilityHandler;
use crate::descriptor::DescriptorSource;
use agent_shared::Outcome;
use async_trait::async_trait;
use serde_json::Value;

/// Returns the same descriptor the presence heartbeat carries
pub struct SystemInfoHandler {
    source: DescriptorSource,
}

impl SystemInfoHandler {
    pub fn new(source: DescriptorSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl CapabilityHandler for SystemInfoHandler {
    async fn handle(&self, _params: Value) -> Outcome {
        Outcome::ok(Value::Object(self.source.snapshot()))
    }
}
