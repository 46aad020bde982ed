//! Filesystem tool suite.
//!
//! In-process handlers for the directory and file tools: scan, list,
//! bounded read, organize-plan proposal, plan execution, soft delete, and
//! trash restore. All operations resolve every path they touch through
//! the job's [`WorkspaceScope`] before dereferencing it, independent of
//! the gateway's pre-submit validation.
//!
//! Mutations are restricted to renames: plan execution and soft delete
//! move files, never overwrite or remove them. Re-execution after a lease
//! reclaim must converge, so every move checks its destination first:
//! a missing source or an identical destination is a skip, and a
//! differing destination is a recorded conflict.

use std::fs;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ToolContext, ToolError, ToolHandler, ToolOutput};
use crate::audit::{AuditLog, JobAudit};
use crate::plan::{OrganizePlan, PlanMove};

/// Scan results are truncated past this many files.
const MAX_SCAN_ITEMS: usize = 2000;

/// Listing results are truncated past this many entries.
const MAX_LIST_ITEMS: usize = 500;

/// Default byte cap for `read_file`.
const DEFAULT_READ_CAP: u64 = 1_000_000;

/// Per-file cap when hashing during a scan.
const HASH_CAP: u64 = 25_000_000;

/// Trash directory name inside each workspace root.
pub const TRASH_DIR_NAME: &str = ".trash";

// =============================================================================
// Shared helpers
// =============================================================================

/// Depth-first walk in per-directory sorted order.
///
/// Entries that cannot be read or stat'ed are skipped, matching the
/// best-effort semantics of a scan over a live user workspace. Symlinks
/// are reported but never traversed.
fn walk<F>(root: &Path, visit: &mut F) -> ControlFlow<()>
where
    F: FnMut(&Path, &fs::Metadata) -> ControlFlow<()>,
{
    let Ok(entries) = fs::read_dir(root) else {
        return ControlFlow::Continue(());
    };
    let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        visit(&path, &meta)?;
        if meta.is_dir() {
            walk(&path, visit)?;
        }
    }
    ControlFlow::Continue(())
}

/// Seconds since the Unix epoch of a file's mtime, zero when unavailable.
fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Lowercase extension including the leading dot, empty when none.
fn dotted_ext(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Hex SHA-256 of a file, reading at most `cap` bytes.
fn sha256_file(path: &Path, cap: u64) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    let mut total: u64 = 0;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
        if total > cap {
            break;
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}

/// Byte-for-byte file comparison, short-circuiting on length.
fn files_identical(a: &Path, b: &Path) -> std::io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut fa = fs::File::open(a)?;
    let mut fb = fs::File::open(b)?;
    let mut ba = vec![0_u8; 64 * 1024];
    let mut bb = vec![0_u8; 64 * 1024];
    loop {
        let ra = fa.read(&mut ba)?;
        let rb = fb.read(&mut bb)?;
        if ra != rb || ba[..ra] != bb[..rb] {
            return Ok(false);
        }
        if ra == 0 {
            return Ok(true);
        }
    }
}

/// Opens the audit log under a resolved workspace root, scoped to the job.
fn audit_for(ctx: &ToolContext, workspace_root: &Path) -> JobAudit {
    AuditLog::for_workspace(workspace_root).scoped(ctx.job_id.clone())
}

/// The workspace root for a mutating tool: the `workspace_root` param if
/// present, else the first allowed root.
fn workspace_root(ctx: &ToolContext) -> Result<PathBuf, ToolError> {
    match ctx.params.get("workspace_root") {
        Some(root) => Ok(ctx.scope.resolve(root)?),
        None => Ok(ctx.scope.roots()[0].clone()),
    }
}

// =============================================================================
// scan_index
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ScanRecord {
    path: String,
    size: u64,
    mtime: u64,
    ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScanReport {
    truncated: bool,
    files: Vec<ScanRecord>,
}

/// `scan_index`: recursive per-file metadata, optionally content hashes.
pub struct ScanIndex;

impl ToolHandler for ScanIndex {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let root = ctx.scope.resolve(ctx.required("root")?)?;
        let hash_files = ctx.optional("hash_files", "false").eq_ignore_ascii_case("true");

        let mut files = Vec::new();
        let mut truncated = false;
        let _ = walk(&root, &mut |path, meta| {
            if !meta.is_file() {
                return ControlFlow::Continue(());
            }
            if files.len() >= MAX_SCAN_ITEMS {
                truncated = true;
                return ControlFlow::Break(());
            }
            let sha256 = if hash_files {
                sha256_file(path, HASH_CAP).ok()
            } else {
                None
            };
            files.push(ScanRecord {
                path: path.display().to_string(),
                size: meta.len(),
                mtime: mtime_secs(meta),
                ext: dotted_ext(path),
                sha256,
            });
            ControlFlow::Continue(())
        });

        debug!(root = %root.display(), count = files.len(), truncated, "scan_index complete");
        ToolOutput::json(&ScanReport { truncated, files })
    }
}

// =============================================================================
// list_files
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ListItem {
    path: String,
    is_dir: bool,
    size: u64,
    mtime: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListReport {
    truncated: bool,
    items: Vec<ListItem>,
}

/// `list_files`: every file and directory under a root, bounded.
pub struct ListFiles;

impl ToolHandler for ListFiles {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let root = ctx.scope.resolve(ctx.required("root")?)?;

        let mut items = Vec::new();
        let mut truncated = false;
        let _ = walk(&root, &mut |path, meta| {
            if items.len() >= MAX_LIST_ITEMS {
                truncated = true;
                return ControlFlow::Break(());
            }
            items.push(ListItem {
                path: path.display().to_string(),
                is_dir: meta.is_dir(),
                size: meta.len(),
                mtime: mtime_secs(meta),
            });
            ControlFlow::Continue(())
        });

        ToolOutput::json(&ListReport { truncated, items })
    }
}

// =============================================================================
// read_file
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ReadReport {
    path: String,
    size: u64,
    read_bytes: usize,
    truncated: bool,
    data_base64: String,
}

/// `read_file`: bounded read of one file, payload base64-encoded.
pub struct ReadFile;

impl ToolHandler for ReadFile {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = ctx.scope.resolve(ctx.required("path")?)?;
        let max_bytes: u64 = match ctx.params.get("max_bytes") {
            Some(raw) => raw.parse().map_err(|_| ToolError::InvalidParam {
                name: "max_bytes".to_string(),
                reason: format!("not a byte count: {raw}"),
            })?,
            None => DEFAULT_READ_CAP,
        };

        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            return Err(ToolError::IsDirectory {
                path: path.display().to_string(),
            });
        }
        let size = meta.len();

        let mut data = Vec::new();
        fs::File::open(&path)?
            .take(max_bytes)
            .read_to_end(&mut data)?;

        ToolOutput::json(&ReadReport {
            path: path.display().to_string(),
            size,
            read_bytes: data.len(),
            truncated: size > max_bytes,
            data_base64: STANDARD.encode(&data),
        })
    }
}

// =============================================================================
// organize_plan
// =============================================================================

/// `organize_plan`: dry-run move plan grouping files by extension.
///
/// Dot-prefixed names (the audit log, the trash directory) are excluded
/// from planning; organizing must never relocate its own bookkeeping.
pub struct ProposeOrganizePlan;

impl ToolHandler for ProposeOrganizePlan {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let root = ctx.scope.resolve(ctx.required("root")?)?;
        let policy = ctx.optional("policy", "by_ext");

        let mut moves = Vec::new();
        let _ = walk(&root, &mut |path, meta| {
            // Anything under a dot-prefixed component (the audit log, the
            // trash area) stays where it is.
            let hidden = path.strip_prefix(&root).ok().is_some_and(|rel| {
                rel.components().any(|c| {
                    matches!(
                        c,
                        std::path::Component::Normal(name)
                            if name.to_str().is_some_and(|n| n.starts_with('.'))
                    )
                })
            });
            if hidden || !meta.is_file() {
                return ControlFlow::Continue(());
            }

            let bucket = if policy == "by_ext" {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase);
                ext.filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "no_ext".to_string())
            } else {
                "misc".to_string()
            };

            let Some(name) = path.file_name() else {
                return ControlFlow::Continue(());
            };
            let dest = root.join(&bucket).join(name);
            if dest != path {
                moves.push(PlanMove {
                    from: path.display().to_string(),
                    to: dest.display().to_string(),
                });
            }
            ControlFlow::Continue(())
        });

        let plan = OrganizePlan::new(policy, moves);
        debug!(root = %root.display(), count = plan.count, "organize plan proposed");
        ToolOutput::json(&plan)
    }
}

// =============================================================================
// execute_plan
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct MoveFailure {
    from: String,
    to: String,
    error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExecuteReport {
    applied: u64,
    skipped: u64,
    errors: Vec<MoveFailure>,
}

/// `execute_plan`: applies an approved move plan idempotently.
///
/// Per move: a missing source is a skip (the move already happened or the
/// file is gone), an identical destination is a skip, a differing
/// destination is a recorded conflict. Skips and conflicts are audited
/// alongside applied moves so a re-executed job leaves a complete trail.
pub struct ExecutePlanTool;

impl ExecutePlanTool {
    fn apply_move(
        ctx: &ToolContext,
        audit: &JobAudit,
        mv: &PlanMove,
    ) -> Result<MoveOutcome, ToolError> {
        let src = ctx.scope.resolve(&mv.from)?;
        let dst = ctx.scope.resolve(&mv.to)?;

        if !src.exists() {
            audit.append(
                ctx.now_ms,
                "move_skipped",
                Some(&src),
                Some(serde_json::json!({"to": dst.display().to_string(), "reason": "source_missing"})),
            )?;
            return Ok(MoveOutcome::Skipped);
        }

        if dst.exists() {
            if files_identical(&src, &dst)? {
                audit.append(
                    ctx.now_ms,
                    "move_skipped",
                    Some(&src),
                    Some(serde_json::json!({"to": dst.display().to_string(), "reason": "destination_identical"})),
                )?;
                return Ok(MoveOutcome::Skipped);
            }
            audit.append(
                ctx.now_ms,
                "move_conflict",
                Some(&src),
                Some(serde_json::json!({"to": dst.display().to_string()})),
            )?;
            return Err(ToolError::StateConflict {
                path: dst.display().to_string(),
                reason: "destination exists with different content".to_string(),
            });
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        audit.append(
            ctx.now_ms,
            "move",
            Some(&src),
            Some(serde_json::json!({"to": dst.display().to_string()})),
        )?;
        Ok(MoveOutcome::Applied)
    }
}

enum MoveOutcome {
    Applied,
    Skipped,
}

impl ToolHandler for ExecutePlanTool {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let Some(plan_bytes) = ctx.plan.as_deref() else {
            return Err(ToolError::InvalidParam {
                name: "plan_job_id".to_string(),
                reason: "verified plan result unavailable".to_string(),
            });
        };
        let plan: OrganizePlan = serde_json::from_slice(plan_bytes)?;

        let root = workspace_root(ctx)?;
        let audit = audit_for(ctx, &root);

        let mut applied = 0_u64;
        let mut skipped = 0_u64;
        let mut errors = Vec::new();
        for mv in &plan.moves {
            match Self::apply_move(ctx, &audit, mv) {
                Ok(MoveOutcome::Applied) => applied += 1,
                Ok(MoveOutcome::Skipped) => skipped += 1,
                Err(err @ ToolError::Audit(_)) => return Err(err),
                Err(err) => errors.push(MoveFailure {
                    from: mv.from.clone(),
                    to: mv.to.clone(),
                    error: err.to_string(),
                }),
            }
        }

        debug!(applied, skipped, errors = errors.len(), "plan executed");
        ToolOutput::json(&ExecuteReport {
            applied,
            skipped,
            errors,
        })
    }
}

// =============================================================================
// soft_delete
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct SoftDeleteReport {
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
}

/// `soft_delete`: reversible move into `<workspace_root>/.trash/`.
pub struct SoftDelete;

impl ToolHandler for SoftDelete {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = ctx.scope.resolve(ctx.required("path")?)?;
        let root = workspace_root(ctx)?;

        if !path.exists() {
            return ToolOutput::json(&SoftDeleteReport {
                deleted: false,
                reason: Some("not_found".to_string()),
                from: Some(path.display().to_string()),
                to: None,
            });
        }

        let trash_dir = root.join(TRASH_DIR_NAME);
        fs::create_dir_all(&trash_dir)?;

        let base = path
            .file_name()
            .ok_or_else(|| ToolError::InvalidParam {
                name: "path".to_string(),
                reason: "path has no file name".to_string(),
            })?
            .to_string_lossy()
            .into_owned();

        // Unique trash name; re-execution of the same job lands on the same
        // timestamp, so probe for a free slot rather than overwrite.
        let mut candidate = trash_dir.join(format!("{base}.{}", ctx.now_ms));
        let mut bump = 0_u32;
        while candidate.exists() {
            bump += 1;
            candidate = trash_dir.join(format!("{base}.{}.{bump}", ctx.now_ms));
        }
        let dst = ctx.scope.resolve(&candidate)?;

        fs::rename(&path, &dst)?;
        audit_for(ctx, &root).append(
            ctx.now_ms,
            "soft_delete",
            Some(&path),
            Some(serde_json::json!({"to": dst.display().to_string()})),
        )?;

        ToolOutput::json(&SoftDeleteReport {
            deleted: true,
            reason: None,
            from: Some(path.display().to_string()),
            to: Some(dst.display().to_string()),
        })
    }
}

// =============================================================================
// restore
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct RestoreReport {
    restored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
}

/// `restore`: moves an item back out of the trash area.
pub struct RestoreFromTrash;

impl ToolHandler for RestoreFromTrash {
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let trash_item = ctx.scope.resolve(ctx.required("trash_item_path")?)?;
        let restore_to = ctx.scope.resolve(ctx.required("restore_to")?)?;
        let root = workspace_root(ctx)?;

        if !trash_item.exists() {
            return ToolOutput::json(&RestoreReport {
                restored: false,
                reason: Some("not_found".to_string()),
                from: Some(trash_item.display().to_string()),
                to: None,
            });
        }
        if restore_to.exists() {
            return ToolOutput::json(&RestoreReport {
                restored: false,
                reason: Some("destination_exists".to_string()),
                from: Some(trash_item.display().to_string()),
                to: Some(restore_to.display().to_string()),
            });
        }

        if let Some(parent) = restore_to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&trash_item, &restore_to)?;
        audit_for(ctx, &root).append(
            ctx.now_ms,
            "restore",
            Some(&trash_item),
            Some(serde_json::json!({"to": restore_to.display().to_string()})),
        )?;

        ToolOutput::json(&RestoreReport {
            restored: true,
            reason: None,
            from: Some(trash_item.display().to_string()),
            to: Some(restore_to.display().to_string()),
        })
    }
}
