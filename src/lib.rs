pub mod aggregate;
pub mod capture;
pub mod catalog;
pub mod classify;
pub mod cli;
pub mod config;
pub mod harness;
pub mod launcher;
pub mod log;
pub mod monitor;
pub mod report;
pub mod session;
pub mod tmux;
