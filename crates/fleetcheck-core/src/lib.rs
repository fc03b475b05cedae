//! Device fleet orchestrator: boots a pool of Android emulator workers, binds
//! one UI-automation session to each, and drains a shared queue of phone
//! numbers, recording confirmed registrations into a durable output dataset.

pub mod adb;
pub mod auth;
pub mod avd;
pub mod cancel;
pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod phone;
pub mod poll;
pub mod ports;
pub mod queue;
pub mod session;
pub mod store;

pub use cancel::ShutdownFlag;
pub use error::WorkerError;
