pub mod keys;
pub mod r#type;
pub mod version;

pub use keys::Keys;
pub use version::PROGRAM_VERSION_NAME;
