pub mod transport;
pub mod util;

pub use util::PROGRAM_VERSION_NAME;
