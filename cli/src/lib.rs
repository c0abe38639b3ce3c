//! Model Mirror CLI - export and import models between instances.

pub mod commands;
pub mod output;
