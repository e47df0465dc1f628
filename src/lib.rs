// ALM client - Library root

pub mod auth;
pub mod client;
pub mod collection;
pub mod config;
pub mod error;
pub mod http_client;
pub mod models;
pub mod mutation;

pub use client::AlmClient;
pub use config::{BackendProfile, ClientOptions, ProfileCatalog};
pub use error::{AlmError, Result};
pub use models::Entity;
