pub mod auth;

pub use auth::{auth_middleware, credential_token, AuthCaller, ACCESS_COOKIE, REFRESH_COOKIE};
