use crate::backend::Backend;
use np_core::{
    Chain, ChainStatus, Error, FilterStatus, Result, SET_NAME_PREFIX, SetStatus, Table,
};

pub struct FilterStatusCollector<'a> {
    backend: &'a dyn Backend,
}

impl<'a> FilterStatusCollector<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    pub async fn collect(&self) -> Result<FilterStatus> {
        let mut status = FilterStatus::new();

        for chain in Chain::ALL {
            match self.backend.list_rules(Table::Filter, chain).await {
                Ok(rules) => status.chains.push(ChainStatus {
                    chain,
                    exists: true,
                    rules: rules.len(),
                }),
                Err(e) if e.is_no_such_chain() => status.chains.push(ChainStatus {
                    chain,
                    exists: false,
                    rules: 0,
                }),
                Err(e) => {
                    return Err(Error::ListRules {
                        table: Table::Filter,
                        chain,
                        source: Box::new(e),
                    });
                }
            }
        }

        let sets = self
            .backend
            .list_sets(SET_NAME_PREFIX)
            .await
            .map_err(|e| Error::ListSets {
                prefix: SET_NAME_PREFIX.to_string(),
                source: Box::new(e),
            })?;

        for name in sets {
            let entries = self.backend.list_entries(&name).await?;
            status.sets.push(SetStatus {
                name,
                entries: entries.len(),
            });
        }

        Ok(status)
    }
}
