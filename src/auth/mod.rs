mod helpers;
mod middleware;
mod token;

pub use middleware::{AuthError, RequireAdmin, RequirePrincipal};
pub use token::{TokenGenerator, parse_token};
