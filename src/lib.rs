pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod translate;

pub use client::{HttpProvider, ProviderClient};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use models::ModelDirectory;
pub use server::{build_router, AppState};
