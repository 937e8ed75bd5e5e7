pub mod bootstrap;
pub mod credential;
mod deletion;
mod probe;
