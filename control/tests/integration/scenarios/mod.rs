pub mod cafe;
pub mod endpoints;
pub mod mergeable;
pub mod removal;
pub mod secrets;
pub mod virtual_server;
