// Built-in flow classes

//! # Built-in Flows
//!
//! - [`ClientActionRunner`]: run one agent action and keep its replies
//! - [`OnlineNotification`]: alert an address once the agent answers
//! - [`GetClientStats`]: collect and downsample resource statistics
//! - [`UpdateConfiguration`]: set agent configuration options and read them back
//! - [`LaunchBinary`]: upload an executable chunk by chunk and run it
//! - [`ExecutePythonHack`]: run a Python snippet with `py_args`
//!
//! [`FlowRegistry::standard`](super::flow::FlowRegistry::standard) registers
//! all of them.

mod action_runner;
mod client_stats;
mod launch_binary;
mod online_notification;
mod python_hack;
mod update_configuration;

pub use action_runner::{ClientActionRunner, ClientActionRunnerArgs};
pub use client_stats::{GetClientStats, GetClientStatsArgs};
pub use launch_binary::{
    ExecuteBinaryRequest, ExecuteBinaryResponse, LaunchBinary, LaunchBinaryArgs, DEFAULT_BINARY_CHUNK_SIZE,
};
pub use online_notification::{OnlineNotification, OnlineNotificationArgs};
pub use python_hack::{ExecutePythonHack, ExecutePythonHackArgs, ExecutePythonRequest, ExecutePythonResponse};
pub use update_configuration::{UpdateConfiguration, UpdateConfigurationArgs};
