//! Execution engine trait — the collaborator that actually exports and
//! uploads bookmarks.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DispatchReply, DispatchRequest};

/// Performs a backup and reports how it went.
///
/// An `Err` means the message never got a reply (transport failure) and is
/// treated exactly like a reply with `status = error`.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchReply>;
}
