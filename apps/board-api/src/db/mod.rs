pub mod boards;
pub mod kv;
pub mod presence;
