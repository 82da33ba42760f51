pub mod completions;
pub mod migrate;
pub mod verify;
