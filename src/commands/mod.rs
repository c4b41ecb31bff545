pub mod format;
pub mod inspect;
pub mod selftest;

pub use format::cmd_format;
pub use inspect::cmd_inspect;
pub use selftest::cmd_selftest;
