#![forbid(unsafe_code)]

pub mod admin;
pub mod answers;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gate;
pub mod live_services;
pub mod registry;
pub mod results;
pub mod sync;

pub use live_core::Clock;

pub use admin::{Cancellation, SessionAdminService};
pub use answers::{AnswerReceipt, AnswerSubmissionService};
pub use catalog::CatalogService;
pub use config::{ConfigError, LiveConfig};
pub use error::{ErrorKind, LiveServicesInitError, LiveSessionError, Operation};
pub use gate::{AppliedTransition, RefreshReport, StatusGate};
pub use live_services::LiveServices;
pub use registry::{JoinOutcome, ParticipantRegistry, RegistrationOutcome, Unregistration};
pub use results::{LeaderboardEntry, QuestionStats, ResultsService, SessionStatistics};
pub use sync::{DetailView, ListView, SessionFeed, SyncClient};
