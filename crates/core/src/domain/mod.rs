pub mod file;
pub mod job;
pub mod message;
pub mod session;
