//! Filters for listing nodes on the lock service.

use std::collections::BTreeMap;

/// Query-string filters for `GET {lock_server}/nodes/`.
///
/// Booleans are sent as `0`/`1`. A comma-separated `machine_type` is
/// rewritten to the server's `a|b` alternation syntax when encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockQuery {
    params: BTreeMap<String, String>,
}

impl LockQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only nodes whose lock state matches.
    pub fn locked(self, locked: bool) -> Self {
        self.flag("locked", locked)
    }

    /// Only nodes of these machine types (`"smithi"` or `"smithi,mira"`).
    pub fn machine_type(self, machine_type: &str) -> Self {
        self.param("machine_type", machine_type)
    }

    /// Any boolean filter (`up`, `is_vm`, ...).
    pub fn flag(mut self, key: &str, value: bool) -> Self {
        self.params
            .insert(key.to_string(), if value { "1" } else { "0" }.to_string());
        self
    }

    /// Any string filter (`os_type`, `locked_by`, ...).
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Encode as `k=v&k=v`, without the leading `?`.
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| {
                let value = if key == "machine_type" {
                    value.replace(',', "|")
                } else {
                    value.clone()
                };
                format!("{}={}", urlencoding::encode(key), urlencoding::encode(&value))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}
