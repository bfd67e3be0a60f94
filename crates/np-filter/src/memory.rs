use crate::backend::Backend;
use async_trait::async_trait;
use np_core::{Chain, Error, Result, Rule, SetName, SetType, Table};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Backend operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ClearChain,
    NewChain,
    AppendRule,
    ListRules,
    ListSets,
    CreateSet,
    FlushSet,
    DestroySet,
    AddEntry,
    DelEntry,
    ListEntries,
}

#[derive(Debug)]
struct MemorySet {
    kind: SetType,
    entries: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    chains: BTreeMap<(Table, Chain), Vec<Rule>>,
    sets: BTreeMap<SetName, MemorySet>,
    calls: HashMap<Op, usize>,
    failing: HashSet<Op>,
}

/// In-memory packet filter used by tests and `--dry-run`.
///
/// Mirrors kernel behavior where it matters for convergence: a set cannot be
/// destroyed while a rule or a list:set still references it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: Op) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if state.failing.contains(&op) {
            return Err(Error::Command {
                command: format!("{:?}", op),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(state)
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: Op) {
        self.lock().failing.insert(op);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Snapshot of a chain's rules, `None` if the chain does not exist.
    pub fn rules(&self, chain: Chain) -> Option<Vec<Rule>> {
        self.lock().chains.get(&(Table::Filter, chain)).cloned()
    }

    pub fn entries(&self, set: &SetName) -> Option<Vec<String>> {
        self.lock()
            .sets
            .get(set)
            .map(|s| s.entries.iter().cloned().collect())
    }

    pub fn has_set(&self, set: &SetName) -> bool {
        self.lock().sets.contains_key(set)
    }

    /// Seed a chain without counting a call.
    pub fn insert_chain(&self, chain: Chain, rules: Vec<Rule>) {
        self.lock().chains.insert((Table::Filter, chain), rules);
    }

    /// Seed a set without counting a call.
    pub fn insert_set<I, S>(&self, set: SetName, kind: SetType, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().sets.insert(
            set,
            MemorySet {
                kind,
                entries: entries.into_iter().map(Into::into).collect(),
            },
        );
    }
}

impl MemoryState {
    fn is_referenced(&self, set: &SetName) -> bool {
        let by_rule = self
            .chains
            .values()
            .flatten()
            .any(|rule| rule.referenced_sets().any(|name| name == set.as_str()));
        let by_list = self
            .sets
            .values()
            .any(|s| s.kind == SetType::ListSet && s.entries.contains(set.as_str()));
        by_rule || by_list
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn clear_chain(&self, table: Table, chain: Chain) -> Result<()> {
        let mut state = self.enter(Op::ClearChain)?;
        state.chains.entry((table, chain)).or_default().clear();
        Ok(())
    }

    async fn new_chain(&self, table: Table, chain: Chain) -> Result<()> {
        let mut state = self.enter(Op::NewChain)?;
        if state.chains.contains_key(&(table, chain)) {
            return Err(Error::ChainExists { table, chain });
        }
        state.chains.insert((table, chain), Vec::new());
        Ok(())
    }

    async fn append_rule(&self, table: Table, chain: Chain, rule: &Rule) -> Result<()> {
        let mut state = self.enter(Op::AppendRule)?;
        match state.chains.get_mut(&(table, chain)) {
            Some(rules) => {
                rules.push(rule.clone());
                Ok(())
            }
            None => Err(Error::NoSuchChain { table, chain }),
        }
    }

    async fn list_rules(&self, table: Table, chain: Chain) -> Result<Vec<Rule>> {
        let state = self.enter(Op::ListRules)?;
        state
            .chains
            .get(&(table, chain))
            .cloned()
            .ok_or(Error::NoSuchChain { table, chain })
    }

    async fn list_sets(&self, prefix: &str) -> Result<Vec<SetName>> {
        let state = self.enter(Op::ListSets)?;
        Ok(state
            .sets
            .keys()
            .filter(|name| name.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create_set(&self, set: &SetName, kind: SetType) -> Result<()> {
        let mut state = self.enter(Op::CreateSet)?;
        if state.sets.contains_key(set) {
            return Err(Error::SetExists(set.clone()));
        }
        state.sets.insert(
            set.clone(),
            MemorySet {
                kind,
                entries: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn flush_set(&self, set: &SetName) -> Result<()> {
        let mut state = self.enter(Op::FlushSet)?;
        let members = state
            .sets
            .get_mut(set)
            .ok_or_else(|| Error::NoSuchSet(set.clone()))?;
        members.entries.clear();
        Ok(())
    }

    async fn destroy_set(&self, set: &SetName) -> Result<()> {
        let mut state = self.enter(Op::DestroySet)?;
        if !state.sets.contains_key(set) {
            return Err(Error::NoSuchSet(set.clone()));
        }
        if state.is_referenced(set) {
            return Err(Error::SetInUse(set.clone()));
        }
        state.sets.remove(set);
        Ok(())
    }

    async fn add_entry(&self, set: &SetName, entry: &str) -> Result<()> {
        let mut state = self.enter(Op::AddEntry)?;
        let members = state
            .sets
            .get_mut(set)
            .ok_or_else(|| Error::NoSuchSet(set.clone()))?;
        members.entries.insert(entry.to_string());
        Ok(())
    }

    async fn del_entry(&self, set: &SetName, entry: &str) -> Result<()> {
        let mut state = self.enter(Op::DelEntry)?;
        let members = state
            .sets
            .get_mut(set)
            .ok_or_else(|| Error::NoSuchSet(set.clone()))?;
        members.entries.remove(entry);
        Ok(())
    }

    async fn list_entries(&self, set: &SetName) -> Result<Vec<String>> {
        let state = self.enter(Op::ListEntries)?;
        state
            .sets
            .get(set)
            .map(|s| s.entries.iter().cloned().collect())
            .ok_or_else(|| Error::NoSuchSet(set.clone()))
    }
}
