//! Access policy for the query validator.
//!
//! A [`QueryPolicy`] is an explicit value built at process start (from the
//! app's TOML config) and handed to the [`Validator`](crate::validate::Validator).
//!
//! The allow/deny token checks here are defense-in-depth only. String
//! matching can be evaded and is not a proof of safety; what actually
//! confines a general search is the typed parse into a
//! [`ReadCall`](crate::general::ReadCall), which can only express reads.

use std::collections::BTreeSet;

/// Read verbs a general search may call.
pub const DEFAULT_ALLOWED_VERBS: &[&str] = &[
    "aggregate",
    "map_reduce",
    "distinct",
    "count_documents",
    "index_information",
    "find_one",
    "find",
];

/// Tokens that reject a non-admin general search.
/// Matched against the whitespace-stripped, lowercased query. A token that
/// starts with `.` names a method prefix and only matches a call of it
/// (`.delete_many(`), never a dotted field path such as `'photometry.updated_at'`.
pub const DEFAULT_DENIED_TOKENS: &[&str] = &[
    "import",
    "pymongo",
    "shutil",
    "subprocess",
    "spawn",
    "popen",
    "os.system",
    "system(",
    "sys.modules",
    "exec(",
    "eval(",
    "call(",
    "run(",
    "open(",
    "lambda",
    "__",
    ".command",
    ".bulk_write",
    ".insert",
    ".update",
    ".delete",
    ".replace",
    ".drop",
    ".rename",
    ".create_index",
    ".create_collection",
    "$where",
    "$function",
    "$accumulator",
    "$out",
    "$merge",
];

/// Collections holding accounts, task records, and statistics.
pub const DEFAULT_PRIVILEGED_COLLECTIONS: &[&str] = &["users", "queries", "stats"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPolicy {
    pub admin_username: String,
    pub allowed_verbs: Vec<String>,
    pub denied_tokens: Vec<String>,
    pub privileged_collections: BTreeSet<String>,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            allowed_verbs: DEFAULT_ALLOWED_VERBS.iter().map(|s| s.to_string()).collect(),
            denied_tokens: DEFAULT_DENIED_TOKENS.iter().map(|s| s.to_string()).collect(),
            privileged_collections: DEFAULT_PRIVILEGED_COLLECTIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl QueryPolicy {
    pub fn is_admin(&self, username: &str) -> bool {
        username == self.admin_username
    }

    pub fn is_privileged(&self, collection: &str) -> bool {
        self.privileged_collections.contains(collection)
    }

    /// True when the query calls at least one allowed verb (`.verb(`).
    pub fn calls_allowed_verb(&self, query: &str) -> bool {
        let compact = strip_whitespace(query);
        self.allowed_verbs
            .iter()
            .any(|verb| compact.contains(&format!(".{verb}(")))
    }

    /// First deny token found in the query, if any.
    pub fn denied_token(&self, query: &str) -> Option<&str> {
        let compact = strip_whitespace(query).to_ascii_lowercase();
        self.denied_tokens
            .iter()
            .find(|token| {
                let token = token.to_ascii_lowercase();
                if token.starts_with('.') {
                    calls_method(&compact, &token)
                } else {
                    compact.contains(&token)
                }
            })
            .map(String::as_str)
    }
}

/// True when `prefix` is followed by identifier characters and then `(`.
fn calls_method(compact: &str, prefix: &str) -> bool {
    compact.match_indices(prefix).any(|(at, _)| {
        compact[at + prefix.len()..]
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_')
            .starts_with('(')
    })
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}
