pub mod checkout;
pub mod handlers;
pub mod stripe;
pub mod webhook;
