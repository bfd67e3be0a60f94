use crate::rule::{Chain, Rule, Table};
use crate::set::SetName;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("chain {chain} already exists in table {table}")]
    ChainExists { table: Table, chain: Chain },

    #[error("no chain {chain} in table {table}")]
    NoSuchChain { table: Table, chain: Chain },

    #[error("set {0} already exists")]
    SetExists(SetName),

    #[error("no set named {0}")]
    NoSuchSet(SetName),

    #[error("set {0} is still referenced")]
    SetInUse(SetName),

    #[error("invalid set name {name:?}: {reason}")]
    InvalidSetName { name: String, reason: &'static str },

    #[error("iptables -F. table: {table:?}, chain: {chain:?}")]
    ClearChain {
        table: Table,
        chain: Chain,
        #[source]
        source: Box<Error>,
    },

    #[error("iptables -N. table: {table:?}, chain: {chain:?}")]
    CreateChain {
        table: Table,
        chain: Chain,
        #[source]
        source: Box<Error>,
    },

    #[error("iptables -S. table: {table:?}, chain: {chain:?}")]
    ListRules {
        table: Table,
        chain: Chain,
        #[source]
        source: Box<Error>,
    },

    #[error("iptables -A. table: {table:?}, chain: {chain:?}, rule: {rule}")]
    AppendRule {
        table: Table,
        chain: Chain,
        rule: Rule,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to list ipsets with prefix {prefix:?}")]
    ListSets {
        prefix: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to create ipset {set}")]
    CreateSet {
        set: SetName,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to flush ipset {set}")]
    FlushSet {
        set: SetName,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to destroy ipset {set}")]
    DestroySet {
        set: SetName,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to add {entry} to ipset {set}")]
    AddEntry {
        set: SetName,
        entry: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to remove {entry} from ipset {set}")]
    DelEntry {
        set: SetName,
        entry: String,
        #[source]
        source: Box<Error>,
    },

    #[error("must set node name via --node-name or $HOSTNAME")]
    MissingNodeName,

    #[error("unknown reconcile mode {0:?} (expected append or replace)")]
    InvalidReconcileMode(String),

    #[error("failed to read config {path:?}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// True when the chain is missing, directly or beneath a context wrapper.
    pub fn is_no_such_chain(&self) -> bool {
        match self {
            Error::NoSuchChain { .. } => true,
            Error::ListRules { source, .. } | Error::ClearChain { source, .. } => {
                source.is_no_such_chain()
            }
            _ => false,
        }
    }
}
