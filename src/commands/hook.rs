use std::io::Read;
use std::path::Path;

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hook::{self, HookAdapter, HookInput, HookRequest};
use crate::identity;
use crate::store::repo::{self, Repo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    SessionEnd,
}

/// Entry point for host hooks. Always exits 0; a denial travels in the
/// JSON written to stdout.
pub fn run(event: HookEvent, session_id: Option<&str>, fallback_cwd: &Path) -> Result<i32> {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        warn!(error = %e, "could not read hook input; allowing");
        return Ok(0);
    }
    if let Some(response) = respond(event, &raw, session_id, fallback_cwd) {
        println!("{response}");
    }
    Ok(0)
}

/// The host response for one hook invocation, `None` for "say nothing".
pub fn respond(
    event: HookEvent,
    raw: &str,
    session_id: Option<&str>,
    fallback_cwd: &Path,
) -> Option<serde_json::Value> {
    let input = match HookInput::parse(raw) {
        Ok(input) => input,
        Err(e) => {
            hook::degraded(&e);
            return None;
        }
    };
    let request = HookRequest::from_input(&input, fallback_cwd);

    let root = match repo::find_coordination_root(&request.cwd) {
        Ok(root) => root,
        Err(e) => {
            debug!(cwd = %request.cwd.display(), "no coordination root");
            hook::degraded(&e);
            return None;
        }
    };
    let repo = match Repo::open(&root) {
        Ok(repo) => repo,
        Err(e) => {
            hook::degraded(&e);
            return None;
        }
    };

    let key = identity::resolve_session_key(session_id.or(input.session_id.as_deref()));
    let me = repo.identities.get_or_create(&key, &request.cwd);
    let latch_dir = repo.latch_dir();
    let adapter = HookAdapter::new(&repo.manager, &me, &repo.config, &latch_dir);

    match event {
        HookEvent::PreToolUse => {
            let decision = adapter.evaluate(&request);
            debug!(instance = %me.id, tool = %request.tool_name, ?decision, "pre-tool-use");
            decision.to_host_response()
        }
        HookEvent::PostToolUse => {
            adapter.after_write(&request);
            None
        }
        HookEvent::SessionEnd => {
            let released = adapter.end_session();
            info!(instance = %me.id, count = released.len(), "session ended; locks released");
            None
        }
    }
}
