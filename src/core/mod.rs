//! Core constants, errors and traits shared by every layer.

mod constants;
mod error;
mod traits;

pub mod util;

pub use constants::*;
pub use error::*;
pub use traits::*;
