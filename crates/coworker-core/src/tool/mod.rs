//! Tool registry and dispatch.
//!
//! The registry is the single source of truth about every job type the
//! server accepts: its wire-stable numeric id, parameter schema, result
//! MIME type, which of its parameters are path-shaped (and therefore
//! subject to workspace scoping), and, decisive for the approval gate,
//! whether it mutates the filesystem.
//!
//! Not every registered tool is hosted in-process. Descriptors for
//! external collaborators (headless browsing, document writers, code
//! execution, audio capture) are listed so the gateway can validate and
//! advertise them; dispatching one without a bound handler fails the job
//! with a typed error. [`ToolHandler`] is the seam where deployments plug
//! real implementations in.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::audit::AuditError;
use crate::scope::{ScopeError, WorkspaceScope};

pub mod extended;
pub mod fs;

/// Job parameters: a flat string-to-string map, as submitted on the wire.
pub type JobParams = BTreeMap<String, String>;

/// Wire-stable tool identifiers.
///
/// The numeric values are part of the HTTP contract and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolId {
    /// Recursive scan producing per-file metadata (optionally hashes).
    ScanIndex = 1,
    /// Shallow-ish listing of files and directories.
    ListFiles = 2,
    /// Bounded read of a single file.
    ReadFile = 3,
    /// Dry-run organization plan.
    OrganizePlan = 4,
    /// Apply a previously approved organization plan.
    ExecutePlan = 5,
    /// Reversible move into the workspace trash area.
    SoftDelete = 6,
    /// Move an item back out of the trash area.
    Restore = 7,
    /// Fetch and extract text from a URL.
    BrowseWeb = 8,
    /// Write a spreadsheet file.
    CreateExcel = 9,
    /// Write a Word document.
    CreateWord = 10,
    /// Write a PDF document.
    CreatePdf = 11,
    /// Execute a code snippet in a sandbox.
    ExecutePython = 12,
    /// Search the workspace audit log.
    SearchPastActions = 13,
    /// Search a connected Google Drive.
    SearchGoogleDrive = 14,
    /// Capture and transcribe meeting audio.
    ListenMeeting = 15,
}

impl ToolId {
    /// The numeric wire id.
    #[must_use]
    pub const fn wire_id(self) -> i64 {
        self as i64
    }

    /// Parses a wire id.
    #[must_use]
    pub const fn from_wire(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::ScanIndex),
            2 => Some(Self::ListFiles),
            3 => Some(Self::ReadFile),
            4 => Some(Self::OrganizePlan),
            5 => Some(Self::ExecutePlan),
            6 => Some(Self::SoftDelete),
            7 => Some(Self::Restore),
            8 => Some(Self::BrowseWeb),
            9 => Some(Self::CreateExcel),
            10 => Some(Self::CreateWord),
            11 => Some(Self::CreatePdf),
            12 => Some(Self::ExecutePython),
            13 => Some(Self::SearchPastActions),
            14 => Some(Self::SearchGoogleDrive),
            15 => Some(Self::ListenMeeting),
            _ => None,
        }
    }

    /// The registry name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// The full descriptor for this tool.
    #[must_use]
    pub fn descriptor(self) -> &'static ToolDescriptor {
        &REGISTRY[self as usize - 1]
    }
}

/// Static description of one tool.
#[derive(Debug)]
pub struct ToolDescriptor {
    /// The tool's id.
    pub id: ToolId,
    /// Registry name, stable on the wire.
    pub name: &'static str,
    /// Whether executing this tool mutates the filesystem. Mutating tools
    /// require an approval token at submission and at worker claim.
    pub mutating: bool,
    /// Whether this server build hosts an in-process handler.
    pub hosted: bool,
    /// Parameters that must be present.
    pub required_params: &'static [&'static str],
    /// Parameters that may be present.
    pub optional_params: &'static [&'static str],
    /// Parameters whose values are filesystem paths; the gateway
    /// canonicalizes and scope-checks these before accepting a job.
    pub path_params: &'static [&'static str],
    /// MIME type of the result bytes on success.
    pub result_mime: &'static str,
}

impl ToolDescriptor {
    /// All parameter keys, required first.
    #[must_use]
    pub fn param_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::with_capacity(self.required_params.len() + self.optional_params.len());
        keys.extend_from_slice(self.required_params);
        keys.extend_from_slice(self.optional_params);
        keys
    }

    /// Shape-checks submitted params: every required key present, no key
    /// outside the declared schema.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::MissingParam`] or [`ToolError::UnknownParam`].
    pub fn validate_params(&self, params: &JobParams) -> Result<(), ToolError> {
        for required in self.required_params {
            if !params.contains_key(*required) {
                return Err(ToolError::MissingParam {
                    name: (*required).to_string(),
                });
            }
        }
        for key in params.keys() {
            let known = self.required_params.contains(&key.as_str())
                || self.optional_params.contains(&key.as_str());
            if !known {
                return Err(ToolError::UnknownParam { name: key.clone() });
            }
        }
        Ok(())
    }
}

/// The static tool catalog, indexed by `wire_id - 1`.
static REGISTRY: [ToolDescriptor; 15] = [
    ToolDescriptor {
        id: ToolId::ScanIndex,
        name: "scan_index",
        mutating: false,
        hosted: true,
        required_params: &["root"],
        optional_params: &["hash_files"],
        path_params: &["root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::ListFiles,
        name: "list_files",
        mutating: false,
        hosted: true,
        required_params: &["root"],
        optional_params: &[],
        path_params: &["root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::ReadFile,
        name: "read_file",
        mutating: false,
        hosted: true,
        required_params: &["path"],
        optional_params: &["max_bytes"],
        path_params: &["path"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::OrganizePlan,
        name: "organize_plan",
        mutating: false,
        hosted: true,
        required_params: &["root"],
        optional_params: &["policy"],
        path_params: &["root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::ExecutePlan,
        name: "execute_plan",
        mutating: true,
        hosted: true,
        required_params: &["plan_job_id"],
        optional_params: &["workspace_root"],
        path_params: &["workspace_root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::SoftDelete,
        name: "soft_delete",
        mutating: true,
        hosted: true,
        required_params: &["path", "workspace_root"],
        optional_params: &[],
        path_params: &["path", "workspace_root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::Restore,
        name: "restore",
        mutating: true,
        hosted: true,
        required_params: &["trash_item_path", "restore_to", "workspace_root"],
        optional_params: &[],
        path_params: &["trash_item_path", "restore_to", "workspace_root"],
        result_mime: "application/json",
    },
    ToolDescriptor {
        id: ToolId::BrowseWeb,
        name: "browse_web",
        mutating: false,
        hosted: false,
        required_params: &["url"],
        optional_params: &[],
        path_params: &[],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::CreateExcel,
        name: "create_excel",
        mutating: false,
        hosted: false,
        required_params: &["path", "data"],
        optional_params: &[],
        path_params: &["path"],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::CreateWord,
        name: "create_word",
        mutating: false,
        hosted: false,
        required_params: &["path", "content"],
        optional_params: &[],
        path_params: &["path"],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::CreatePdf,
        name: "create_pdf",
        mutating: false,
        hosted: false,
        required_params: &["path", "content"],
        optional_params: &[],
        path_params: &["path"],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::ExecutePython,
        name: "execute_python",
        mutating: false,
        hosted: false,
        required_params: &["code"],
        optional_params: &[],
        path_params: &[],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::SearchPastActions,
        name: "search_past_actions",
        mutating: false,
        hosted: true,
        required_params: &["query", "workspace_root"],
        optional_params: &[],
        path_params: &["workspace_root"],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::SearchGoogleDrive,
        name: "search_google_drive",
        mutating: false,
        hosted: false,
        required_params: &["query"],
        optional_params: &[],
        path_params: &[],
        result_mime: "text/plain",
    },
    ToolDescriptor {
        id: ToolId::ListenMeeting,
        name: "listen_meeting",
        mutating: false,
        hosted: false,
        required_params: &["duration"],
        optional_params: &[],
        path_params: &[],
        result_mime: "text/plain",
    },
];

/// The full descriptor catalog in wire-id order.
#[must_use]
pub fn descriptors() -> &'static [ToolDescriptor] {
    &REGISTRY
}

/// Descriptor lookup by id.
#[must_use]
pub fn descriptor(id: ToolId) -> &'static ToolDescriptor {
    id.descriptor()
}

/// Errors a tool handler can raise.
#[derive(Debug, Error)]
pub enum ToolError {
    /// A required parameter was absent.
    #[error("missing parameter: {name}")]
    MissingParam {
        /// Parameter name.
        name: String,
    },

    /// A parameter outside the tool's schema was supplied.
    #[error("unknown parameter: {name}")]
    UnknownParam {
        /// Parameter name.
        name: String,
    },

    /// A parameter was present but unusable.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam {
        /// Parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A path failed workspace scoping.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// An audit append failed; the mutation is not considered recorded.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// The target exists with different content than expected.
    #[error("state conflict at {path}: {reason}")]
    StateConflict {
        /// The conflicting path.
        path: String,
        /// What differed.
        reason: String,
    },

    /// The plan result changed between approval and execution.
    #[error("PlanDriftError: plan result bytes changed after approval")]
    PlanDrift,

    /// The tool is registered but this server build hosts no handler.
    #[error("tool {name} is not hosted by this server")]
    NotHosted {
        /// Registry name of the tool.
        name: &'static str,
    },

    /// The expected path was a directory (or vice versa).
    #[error("path is a directory, not a file: {path}")]
    IsDirectory {
        /// The offending path.
        path: String,
    },

    /// Underlying filesystem failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Result serialization failure.
    #[error("result serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything a handler invocation receives.
///
/// The context owns its data so execution can be moved onto a blocking
/// thread while the worker's heartbeat keeps the lease alive.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The executing job's id (stamped into audit entries).
    pub job_id: String,
    /// Parameters as submitted.
    pub params: JobParams,
    /// Scope over the job's `allowed_roots`; handlers re-validate every
    /// path they touch against it.
    pub scope: WorkspaceScope,
    /// Server clock at dispatch, milliseconds since the Unix epoch.
    pub now_ms: u64,
    /// For `execute_plan`: the plan result bytes, already verified against
    /// the consumed approval's hash.
    pub plan: Option<Vec<u8>>,
}

impl ToolContext {
    /// Fetches a required string parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::MissingParam`] when absent.
    pub fn required(&self, name: &str) -> Result<&str, ToolError> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ToolError::MissingParam {
                name: name.to_string(),
            })
    }

    /// Fetches an optional parameter with a default.
    #[must_use]
    pub fn optional<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.params.get(name).map_or(default, String::as_str)
    }
}

/// A tool result: opaque bytes plus their MIME type.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Result payload, stored verbatim in the result row.
    pub bytes: Vec<u8>,
    /// MIME type of the payload.
    pub content_type: String,
}

impl ToolOutput {
    /// A JSON result from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Serialize`] if encoding fails.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, ToolError> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
            content_type: "application/json".to_string(),
        })
    }

    /// A plain-text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            bytes: text.into().into_bytes(),
            content_type: "text/plain".to_string(),
        }
    }
}

/// One hosted tool implementation.
pub trait ToolHandler: Send + Sync {
    /// Executes the tool.
    ///
    /// Handlers must re-validate every path they touch against
    /// `ctx.scope`, append one audit entry per externally observable
    /// mutation, and return deterministic bytes for unchanged inputs.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError`]; the worker records it as the job's
    /// failure message.
    fn execute(&self, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// The dispatch table from tool id to hosted handler.
pub struct ToolSet {
    handlers: HashMap<ToolId, Box<dyn ToolHandler>>,
}

impl ToolSet {
    /// An empty set with no hosted tools.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The built-in set: the filesystem suite plus audit search.
    #[must_use]
    pub fn builtin() -> Self {
        let mut set = Self::empty();
        set.register(ToolId::ScanIndex, Box::new(fs::ScanIndex));
        set.register(ToolId::ListFiles, Box::new(fs::ListFiles));
        set.register(ToolId::ReadFile, Box::new(fs::ReadFile));
        set.register(ToolId::OrganizePlan, Box::new(fs::ProposeOrganizePlan));
        set.register(ToolId::ExecutePlan, Box::new(fs::ExecutePlanTool));
        set.register(ToolId::SoftDelete, Box::new(fs::SoftDelete));
        set.register(ToolId::Restore, Box::new(fs::RestoreFromTrash));
        set.register(
            ToolId::SearchPastActions,
            Box::new(extended::SearchPastActions),
        );
        set
    }

    /// Binds (or replaces) the handler for a tool id.
    pub fn register(&mut self, id: ToolId, handler: Box<dyn ToolHandler>) {
        self.handlers.insert(id, handler);
    }

    /// Whether a handler is bound for `id`.
    #[must_use]
    pub fn hosts(&self, id: ToolId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Dispatches to the bound handler.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotHosted`] for unbound ids, otherwise
    /// whatever the handler returns.
    pub fn execute(&self, id: ToolId, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        match self.handlers.get(&id) {
            Some(handler) => handler.execute(ctx),
            None => Err(ToolError::NotHosted {
                name: id.descriptor().name,
            }),
        }
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hosted: Vec<_> = self.handlers.keys().map(|id| id.name()).collect();
        hosted.sort_unstable();
        f.debug_struct("ToolSet").field("hosted", &hosted).finish()
    }
}
