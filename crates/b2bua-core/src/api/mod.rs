//! Public entry points

pub mod b2bua;

pub use b2bua::{B2bua, B2buaBuilder, NewDialog};
