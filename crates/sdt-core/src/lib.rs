pub mod config;
pub mod error;
pub mod metadata;
pub mod portal;
pub mod report;

pub use error::{SdtError, SdtResult};
pub use metadata::{MetaData, Purpose};
pub use report::{Progress, Warnings};
