// Authentication module
// Manages the login/session token lifecycle and request decoration

mod decorator;
mod manager;
mod session;

pub use decorator::RequestDecorator;
pub use manager::AuthController;
pub use session::{SessionAction, SessionState, SessionTokenStore, SESSION_REUSE_WINDOW_MINUTES};
