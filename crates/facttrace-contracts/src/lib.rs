pub mod chat;
pub mod events;
pub mod models;
pub mod report;
pub mod sources;
