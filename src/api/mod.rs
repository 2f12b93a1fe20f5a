pub mod enrollments;
pub mod preview;
pub mod senders;
pub mod sequences;
pub mod webhooks;
