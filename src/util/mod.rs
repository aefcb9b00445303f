pub mod bytes;
pub(crate) mod lock;
pub mod time;
