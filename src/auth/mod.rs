//! Access-token support driven by `JWT_SECRET_KEY` and `JWT_VALIDITY`.

pub mod token;

pub use token::{Claims, JwtSettings, JwtUtil};
