mod orchestrator;


pub use orchestrator::{session_title, ChatOrchestrator, DEFAULT_SESSION_TITLE};
