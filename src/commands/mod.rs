pub mod health;
pub mod stream;
