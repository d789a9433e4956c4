pub mod chat;
pub mod health;
pub mod ip;

pub use chat::{chat_handler, chat_stream_handler};
pub use health::{health_handler, root_handler, API_PREFIX};
pub use ip::ip_handler;
