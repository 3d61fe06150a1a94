pub mod member;
pub mod presence;
pub mod task;
