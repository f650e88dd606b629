pub mod command;
pub mod common;
pub mod entity;

pub use command::*;
pub use common::*;
pub use entity::*;
