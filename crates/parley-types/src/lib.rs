pub mod events;
pub mod mail;
pub mod models;
