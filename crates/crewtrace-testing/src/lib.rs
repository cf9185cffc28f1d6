//! Testing utilities for crewtrace.
//!
//! Provides:
//! - JSONL transcript fixtures that mimic the external agent's log format
//! - Mock collaborators (terminal sink, process probe, notifier, inference)
//! - A `TestWorld` that wires a full runtime against the mocks

pub mod fixtures;
pub mod mocks;
pub mod world;

pub use fixtures::TranscriptFixture;
pub use mocks::{EchoInference, MockProcessProbe, MockTerminalSink, RecordingNotifier};
pub use world::{test_config, TestWorld};
