pub mod commands;
pub mod methods;
pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{RequestFrame, StratumError};
pub use server::serve;
pub use session::{ClosedSession, Session, SessionState};
