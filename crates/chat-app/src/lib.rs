pub mod app;
pub mod chat;
pub mod command;
pub mod composer;
pub mod settings;
