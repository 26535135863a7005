//! Application runtime composition modules.

pub(crate) mod context;
pub(crate) mod exit_handler;
pub(crate) mod get;
pub(crate) mod progress;
pub(crate) mod shell;
pub(crate) mod terminal;
