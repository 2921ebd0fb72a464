//! Device identity and descriptor snapshot

use serde_json::{json, Map, Value};
use std::fs;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Computes the descriptor announced by the presence manager
#[derive(Debug, Clone)]
pub struct DescriptorSource {
    device_id: String,
}

impl DescriptorSource {
    /// Resolve the device id: explicit override, then the OS machine id,
    /// then the hostname.
    pub fn resolve(override_id: Option<&str>) -> Self {
        let device_id = override_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(machine_id)
            .unwrap_or_else(hostname);
        Self { device_id }
    }

    pub fn with_id(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Identity, platform and resource fields for this device
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("deviceId".into(), json!(self.device_id));
        fields.insert("hostname".into(), json!(hostname()));
        fields.insert("os".into(), json!(std::env::consts::OS));
        fields.insert("family".into(), json!(std::env::consts::FAMILY));
        fields.insert("arch".into(), json!(std::env::consts::ARCH));
        fields.insert("agentVersion".into(), json!(AGENT_VERSION));
        fields.insert(
            "cpus".into(),
            json!(std::thread::available_parallelism().map_or(1, |n| n.get())),
        );

        if let Ok(text) = fs::read_to_string("/proc/meminfo") {
            let memory = parse_meminfo(&text);
            if let Some(total) = memory.total_kb {
                fields.insert("memTotalKb".into(), json!(total));
            }
            if let Some(available) = memory.available_kb {
                fields.insert("memAvailableKb".into(), json!(available));
            }
        }

        fields
    }
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        let id = fs::read_to_string(path).ok()?;
        let id = id.trim();
        (!id.is_empty()).then(|| id.to_string())
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".into())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_kb: Option<u64>,
    pub available_kb: Option<u64>,
}

/// Parse the fields we report from `/proc/meminfo`
pub fn parse_meminfo(text: &str) -> MemorySnapshot {
    let mut snapshot = MemorySnapshot::default();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(label), Some(amount)) = (parts.next(), parts.next()) else {
            continue;
        };
        let amount = amount.parse().ok();
        match label {
            "MemTotal:" => snapshot.total_kb = amount,
            "MemAvailable:" => snapshot.available_kb = amount,
            _ => {}
        }
    }
    snapshot
}
