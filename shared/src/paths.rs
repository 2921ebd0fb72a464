//! Persisted layout under a device's root path
//!
//! ```text
//! <prefix>/<device-id>/descriptor/*          heartbeat fields
//! <prefix>/<device-id>/commands/<push-key>   {name, params}
//! <prefix>/<device-id>/responses/<push-key>  {command, success, result|error, timestamp}
//! ```

pub const DESCRIPTOR: &str = "descriptor";
pub const COMMANDS: &str = "commands";
pub const RESPONSES: &str = "responses";

/// Split a path into its non-empty segments
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Join two paths, normalizing separators
pub fn join(base: &str, child: &str) -> String {
    segments(base)
        .chain(segments(child))
        .collect::<Vec<_>>()
        .join("/")
}

/// Paths owned by a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    root: String,
}

impl DevicePaths {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        Self {
            root: join(prefix, device_id),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn descriptor(&self) -> String {
        join(&self.root, DESCRIPTOR)
    }

    pub fn descriptor_field(&self, field: &str) -> String {
        join(&self.descriptor(), field)
    }

    pub fn commands(&self) -> String {
        join(&self.root, COMMANDS)
    }

    pub fn command(&self, key: &str) -> String {
        join(&self.commands(), key)
    }

    pub fn responses(&self) -> String {
        join(&self.root, RESPONSES)
    }

    pub fn response(&self, key: &str) -> String {
        join(&self.responses(), key)
    }
}
