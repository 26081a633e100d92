pub mod message;
pub mod session;
pub mod subscription;
pub mod token;

pub use message::{ChatMessage, MessageStatus, SenderType};
pub use session::{Session, SessionStatus, VisitorInfo};
pub use subscription::Subscription;
pub use token::StoredToken;
