//! Session lifecycle state machine: open/close/resume, event and screen
//! tagging, opt-in state, and upload staging on top of the event store.

pub mod manager;

pub use manager::SessionManager;

use pulse_store::StoreError;
use pulse_uploader::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}
