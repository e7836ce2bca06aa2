pub mod errors;
mod id;
pub mod regexp;

pub type Result<T, E = errors::WithBacktrace> = core::result::Result<T, E>;

pub use id::hex_quads;
