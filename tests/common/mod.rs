#![allow(dead_code)]

pub mod builders;
pub mod handlers;

pub use builders::*;
pub use handlers::*;
