pub mod check;
pub mod common;
pub mod discover;
pub mod run;
pub mod status;
pub mod sync;
