// Core data models for stagehand
// These structs represent the domain entities

pub mod cadence;
pub mod error_record;
pub mod lock;
pub mod event;
pub mod stage;
pub mod task;

pub use cadence::*;
pub use error_record::*;
pub use lock::*;
pub use event::*;
pub use stage::*;
pub use task::*;
