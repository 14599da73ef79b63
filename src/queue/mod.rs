//! Upload queue: public scheduler handle and its worker.

mod scheduler;
mod worker;

pub use scheduler::{NewUpload, UploadScheduler};
