pub mod form;
pub mod prelude;
pub mod upload;

pub use form::{FormEngine, FormOptions};
pub use upload::UploadEngine;
