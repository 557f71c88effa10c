//! Library half of the `flowgate` binary, exposed so the command
//! implementations can be driven from integration tests.

pub mod commands;
