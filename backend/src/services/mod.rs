// Integration services consumed by workflow actions

pub mod ai;
pub mod documents;
pub mod email;

pub use ai::{AiClient, AiProvider, AiRequest};
pub use documents::{DataEventReceiver, DataEventSender, DataLayer, PgDocumentStore};
pub use email::{EmailService, EmailTransport, OutgoingEmail};
