//! Built-in tool set.

pub mod exec;
pub mod files;
pub mod read;
pub mod respond;
pub mod schedule;
pub mod search;
pub mod session_info;
pub mod skill;
