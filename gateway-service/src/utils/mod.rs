pub mod password;
pub mod validation;

pub use password::{verify_password, Password, PasswordHashString};
pub use validation::ValidatedJson;
