pub mod api;
pub mod events;
pub mod handshake;
pub mod models;
pub mod tags;
