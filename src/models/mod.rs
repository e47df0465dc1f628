// Data models for ALM payloads

pub mod entity;

pub use entity::{Entity, EntityPage};
