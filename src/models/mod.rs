pub mod document;
pub mod enums;
pub mod job;
pub mod matrix_entry;
pub mod requirement;

pub use document::*;
pub use enums::*;
pub use job::*;
pub use matrix_entry::*;
pub use requirement::*;
