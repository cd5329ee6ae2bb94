pub mod analysis;
pub mod chat;
pub mod events;
pub mod products;
pub mod session;
