mod error;
pub mod gateway;
pub(crate) mod utils;

pub use error::{DittoError, Result};
