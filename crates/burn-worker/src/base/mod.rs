pub mod error;
mod logging;

pub use error::{Error, Result};
pub use logging::{init_logging, normalize_level};
