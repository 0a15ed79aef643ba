pub mod aggregate;
pub mod annotate;
pub mod compare;
pub mod full;
