mod ids;
mod participant;
mod question;
mod session;
mod status;

pub use ids::{ParseIdError, SessionId, UserId};
pub use participant::{Participant, Registration, Role, SlotWrite, UserProfile};
pub use question::{DEFAULT_POINTS, Question, QuestionSelection};
pub use session::{
    LiveSession, PersistedSession, RegistrationWrite, SessionDraft, SessionError, SessionPatch,
};
pub use status::{ParseStatusError, SessionStatus};
