//! tasklift: ephemeral remote compute sessions for coding agents.
//!
//! This crate provisions short-lived execution environments (EC2 instances,
//! ECS tasks, GitHub Codespaces, Docker containers, or local workspaces),
//! runs task commands inside them, and tears them down again.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Providers**: The uniform [`ComputeProvider`] facade, one implementation
//!   per backend, selected once from configuration via [`Provider`]
//! - **Environment drivers**: Per-backend create/poll/destroy of a single
//!   physical execution unit
//! - **Multiplexer**: Maps logical sessions onto environments, either 1:1 or
//!   many-to-one onto a shared per-repository service
//! - **Transport**: Runs commands and moves files over SSH or the provider's
//!   own exec API
//! - **Readiness**: Bounded polling shared by every driver
//!
//! # Example
//!
//! ```no_run
//! use tasklift::config::load_config;
//! use tasklift::credentials::Credentials;
//! use tasklift::provider::{ComputeProvider, ExecOptions, Provider, ProviderContext, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("tasklift.toml"))?;
//!     let provider = Provider::from_config(&config, ProviderContext::new(Credentials::from_env()))?;
//!     provider.initialize().await?;
//!
//!     let session = provider.create_session(&SessionOptions::new("task-1")).await?;
//!     let result = provider
//!         .execute_command(&session.id, "echo hi", &ExecOptions::default())
//!         .await;
//!     println!("{}", result.output);
//!     provider.terminate_session(&session.id).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod credentials;
pub mod environment;
pub mod events;
pub mod multiplexer;
pub mod provider;
pub mod readiness;
pub mod repository;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use credentials::{Credentials, KeyMaterial};
pub use environment::{Environment, EnvironmentStatus};
pub use events::{EventSink, ProviderEvent};
pub use provider::{
    ComputeProvider, Provider, ProviderContext, ProviderError, ProviderKind, ProviderResult,
    Session, SessionStatus, TaskResult,
};
