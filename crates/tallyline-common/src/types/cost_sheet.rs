use serde::{Deserialize, Serialize};

use crate::types::price::Status;

/// Internal cost definition for a tenant environment; prices attach to it
/// with entity type COSTSHEET
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostSheet {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub environment_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Status,
}

impl CostSheet {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            environment_id: String::new(),
            name: String::new(),
            status: Status::Published,
        }
    }
}
