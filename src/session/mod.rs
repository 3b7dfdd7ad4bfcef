//! Session subsystem: one supervised game-server process and the
//! protocol channels used to talk to it.

pub mod controller;
pub mod dmb;
pub mod events;
pub mod process;
pub mod topic;

pub use controller::{
    ApiValidationStatus, LaunchResult, LaunchSpec, RebootState, SessionController,
};
pub use dmb::DmbProvider;
pub use process::ProcessHandle;
