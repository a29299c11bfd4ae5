pub mod canvas;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod presentation;
pub mod provider;
pub mod rubric;
pub mod score;
pub mod server;
pub mod sse;
pub mod upload;

pub use canvas::{ExportOptions, Point, StrokeSession, Surface};
pub use client::{CritiqueSession, Submission};
pub use config::Settings;
pub use error::{RelayError, Result};
pub use provider::CritiqueClient;
pub use rubric::{Rubric, RubricVariant};
pub use score::{CritiqueReport, LabeledScoreParser, ScoreCard, ScoreParser};
pub use server::{RelayServer, ShutdownHandle};
pub use upload::{ImageRelay, ObjectStore, Storage};
