//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the store and federation operations.

mod follow;
mod inbox;
mod note;

pub use follow::FollowService;
pub use inbox::InboxProcessor;
pub use note::NoteService;
