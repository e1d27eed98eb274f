//! Process bootstrap for the `slotwatch` binary.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod telegram;
