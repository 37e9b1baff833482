mod config;
pub use config::*;
mod error;
pub use error::*;
pub mod kernel;
mod optimizer;
pub use optimizer::*;
mod persist;
pub use persist::*;
mod state;
pub use state::*;
mod tensor;
pub use tensor::*;
mod variant;
pub use variant::*;
