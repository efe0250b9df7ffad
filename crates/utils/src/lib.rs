pub mod config;
pub mod handler;
pub mod message;
pub mod message_id;
pub mod mime;
pub mod server;
pub mod upstream;

pub use config::*;
pub use handler::*;
pub use message::*;
pub use message_id::*;
pub use mime::*;
pub use server::*;
pub use upstream::*;
