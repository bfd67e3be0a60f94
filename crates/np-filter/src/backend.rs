use async_trait::async_trait;
use np_core::{Chain, Result, Rule, SetName, SetType, Table};

/// Table, chain and named-set operations against the node's packet filter.
///
/// One handle is shared by every writer; callers serialize command sequences
/// themselves.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Empty a chain, creating it first if it does not exist.
    async fn clear_chain(&self, table: Table, chain: Chain) -> Result<()>;

    /// Fails with [`np_core::Error::ChainExists`] if the chain is already there.
    async fn new_chain(&self, table: Table, chain: Chain) -> Result<()>;

    async fn append_rule(&self, table: Table, chain: Chain, rule: &Rule) -> Result<()>;

    /// Rules in chain order, without the chain declaration.
    async fn list_rules(&self, table: Table, chain: Chain) -> Result<Vec<Rule>>;

    /// Sets whose name starts with `prefix`.
    async fn list_sets(&self, prefix: &str) -> Result<Vec<SetName>>;

    async fn create_set(&self, set: &SetName, kind: SetType) -> Result<()>;

    async fn flush_set(&self, set: &SetName) -> Result<()>;

    async fn destroy_set(&self, set: &SetName) -> Result<()>;

    async fn add_entry(&self, set: &SetName, entry: &str) -> Result<()>;

    async fn del_entry(&self, set: &SetName, entry: &str) -> Result<()>;

    async fn list_entries(&self, set: &SetName) -> Result<Vec<String>>;
}
