//! Auxiliary content tools.
//!
//! Only `search_past_actions` is hosted in-process; it answers "what did
//! the coworker do here before" by scanning the workspace audit log. The
//! remaining auxiliary tools (web browsing, document writers, code
//! execution, Drive search, audio capture) are external collaborators:
//! their descriptors live in the registry, their handlers do not live in
//! this crate.

use super::{ToolContext, ToolError, ToolHandler, ToolOutput};
use crate::audit::AuditLog;

/// Most recent matches returned by an audit search.
const MAX_SEARCH_MATCHES: usize = 20;

/// `search_past_actions`: substring search over the workspace audit log.
pub struct SearchPastActions;

impl ToolHandler for SearchPastActions {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query = ctx.required("query")?;
        let root = ctx.scope.resolve(ctx.required("workspace_root")?)?;

        let log = AuditLog::for_workspace(&root);
        if !log.path().exists() {
            return Ok(ToolOutput::text("No audit logs found in this workspace."));
        }

        let matches = log.search(query, MAX_SEARCH_MATCHES)?;
        if matches.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No matches found for '{query}' in audit logs."
            )));
        }
        Ok(ToolOutput::text(matches.join("\n")))
    }
}
