//! Identifier generation.
//!
//! Widget and connection ids come from a random (v4) UUID so two workers
//! generating ids concurrently never collide in practice. Worker ids are
//! stable for the process lifetime and appear in every route and binding.

use std::fmt;

use uuid::Uuid;

/// Identity of one worker process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Use a configured id, or generate `worker-<random>` when absent.
    pub fn from_config(configured: Option<&str>) -> Self {
        match configured {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::generate(),
        }
    }

    pub fn generate() -> Self {
        Self(format!("worker-{}", short_uuid()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn new_widget_id() -> String {
    format!("w-{}", Uuid::new_v4().simple())
}

pub fn new_connection_id() -> String {
    format!("conn-{}", Uuid::new_v4().simple())
}

/// Publisher-assigned id used by consumers to drop duplicate deliveries.
pub fn new_event_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Local id for a registered callable.
pub fn new_handle_id() -> String {
    format!("cb-{}", short_uuid())
}

fn short_uuid() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(12);
    s
}
