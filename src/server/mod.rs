pub mod activity;
pub mod auth;
pub mod config;
pub mod connection;
pub mod database;
pub mod directory;
pub mod invites;
pub mod messages;
pub mod presence;
pub mod session;
