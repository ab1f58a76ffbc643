//! Core data model for usage rating

pub mod cost_sheet;
pub mod customer;
pub mod event;
pub mod feature;
pub mod meter;
pub mod price;
pub mod subscription;
pub mod usage;
