use serde::{Deserialize, Serialize};

/// Billing-facing label attached 1:1 to a meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub meter_id: String,
    #[serde(default)]
    pub unit_singular: String,
    #[serde(default)]
    pub unit_plural: String,
}

impl Feature {
    pub fn new(id: impl Into<String>, name: impl Into<String>, meter_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            meter_id: meter_id.into(),
            unit_singular: String::new(),
            unit_plural: String::new(),
        }
    }
}
