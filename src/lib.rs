pub mod agent;
pub mod brain;
pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

pub use agent::PolicyAgent;
pub use brain::{Brain, Decision, DeepQBrain, DqnSettings};
pub use config::{RunMode, ServerConfig};
pub use error::{ParleyError, ProtocolError, Result, ValidationError};
pub use protocol::{Framing, Request};
pub use server::PolicyServer;
pub use session::{Session, SummaryRow};
pub use store::PolicyStore;
