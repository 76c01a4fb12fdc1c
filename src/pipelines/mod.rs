pub mod aggregate;
pub mod functional;
