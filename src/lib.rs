#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::ignored_unit_patterns
)]

pub mod config;
pub mod control;
pub mod daemon;
pub mod db;
pub mod debounce;
pub mod error;
pub mod event;
pub mod fragment;
pub mod graphics;
pub mod instance;
pub mod model;
pub mod recorder;
pub mod registry;
pub mod runner;
pub mod sync;

#[cfg(test)]
pub mod testutil;
