use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub environment_id: String,
    /// Key used by event producers
    pub external_id: String,
    #[serde(default)]
    pub name: String,
}

impl Customer {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            environment_id: String::new(),
            external_id: external_id.into(),
            name: String::new(),
        }
    }
}
