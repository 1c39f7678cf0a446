#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

pub mod config;
pub mod context;
pub mod credits;
pub mod db;
pub mod directory;
pub mod format;
pub mod gateway;
pub mod health;
pub mod outbound;
pub mod providers;
pub mod worker;
