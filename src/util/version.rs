pub const PROGRAM_VERSION_NAME: &str = concat!("gnet-rs/", env!("CARGO_PKG_VERSION"));
