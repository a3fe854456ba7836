mod orchestrator;

pub use orchestrator::{SendOrchestrator, SendRejection, SendTicket};
