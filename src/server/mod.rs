mod access;
mod admin;
mod download;
pub mod dto;
pub mod response;
mod router;

pub use router::{AppState, create_router};
