pub mod retry;
pub mod view;

pub use retry::{AttemptError, RetryPolicy, RetryReason};
pub use view::{classify_response, ViewFetcher, ViewSource};
