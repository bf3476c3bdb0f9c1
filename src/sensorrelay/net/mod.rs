pub mod connection;
pub mod connector;
pub mod events;
pub mod reconnector;
pub mod server;
