pub mod abundance;
pub mod file;
pub mod records;
pub mod reference;
pub mod store;
