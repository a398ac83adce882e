pub mod osint;
pub mod resume;
