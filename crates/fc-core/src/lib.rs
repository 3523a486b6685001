//! Pure data model for the farm coordinator: resources, framework
//! configuration, the ownership state machine, seize bookkeeping, and
//! config loading. No I/O beyond reading config files, no async, no
//! subprocess spawning — those live in `fc-cli` and `fc-server`.

pub mod config;
pub mod error;
pub mod framework;
pub mod ownership;
pub mod resource;
pub mod seize;

pub use config::{ApiServerConfig, ClusterConfig, Config};
pub use error::ConfigError;
pub use framework::FrameworkConfig;
pub use ownership::{AcceptOutcome, Availability, OwnershipState, OwnershipTable, ReturnOutcome};
pub use resource::{FrameworkId, JobId, Resource, ResourceId, ResourceRegistry};
pub use seize::SeizeRecord;
