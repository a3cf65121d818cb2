pub mod buffer;
pub mod dos_path;
pub mod duplicate;
pub mod guard;
pub mod kernel;
pub mod name;
pub mod open_files;
pub mod resolver;
pub mod snapshot;
#[cfg(windows)]
pub mod winapi;
