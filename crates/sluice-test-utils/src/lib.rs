//! Scripted capability fakes and fixtures shared by the Sluice test suites.

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeServices, RecordingLoader, RecordingQueries, ScriptedExistence};
pub use fixtures::{test_config, write_sample_source, SAMPLE_CSV};
