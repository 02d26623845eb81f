pub mod archive;
pub mod cmd;
pub mod fs;
pub mod time;
pub mod tracing;
