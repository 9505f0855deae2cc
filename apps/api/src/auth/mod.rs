pub mod activation;
pub mod handlers;
pub mod identity;
pub mod password;
pub mod tokens;
