#![warn(rust_2018_idioms)]

//! WebRTC SFU load generator.
//!
//! Simulated participants join a room on the SFU under test, publish looped
//! audio and video, subscribe to each other according to a viewing layout and
//! measure what they receive: packets, loss, reordering, bitrate and one-way
//! audio latency.

pub mod agent;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod loadtest;
pub mod media;
pub mod sequence;
pub mod stats;
pub mod tester;

pub use agent::{AgentLoadTest, AgentRoomStats};
pub use config::{AgentLoadTestParams, FindMaxParams, Layout, LoadTestParams};
pub use error::{Error, Result};
pub use loadtest::{LoadTest, LoadTestReport};
pub use tester::{Tester, TesterParams, TesterState};
