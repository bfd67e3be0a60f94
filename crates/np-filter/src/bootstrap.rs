use crate::backend::Backend;
use np_core::{Chain, Error, Result, SET_NAME_PREFIX, SetName, Table};
use tracing::{debug, error, info};

/// Resets owned filter state to a known baseline on startup.
pub struct Bootstrapper<'a> {
    backend: &'a dyn Backend,
}

impl<'a> Bootstrapper<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Empty the owned chains, then drop the owned sets.
    ///
    /// Chains go first so that no rule still references a set when it is
    /// destroyed. The egress chain is left alone and keeps isolating egress
    /// traffic until the base rules are reinstalled.
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting owned chains and sets");
        self.reset_chains().await?;
        self.reset_sets().await
    }

    async fn reset_chains(&self) -> Result<()> {
        for chain in Chain::RESET_ORDER {
            debug!(%chain, "Clearing chain");
            self.backend
                .clear_chain(Table::Filter, chain)
                .await
                .map_err(|e| {
                    error!(%chain, error = %e, "Failed to clear chain");
                    Error::ClearChain {
                        table: Table::Filter,
                        chain,
                        source: Box::new(e),
                    }
                })?;
        }
        Ok(())
    }

    async fn reset_sets(&self) -> Result<()> {
        let sets = self
            .backend
            .list_sets(SET_NAME_PREFIX)
            .await
            .map_err(|e| {
                error!(prefix = SET_NAME_PREFIX, error = %e, "Failed to list sets");
                Error::ListSets {
                    prefix: SET_NAME_PREFIX.to_string(),
                    source: Box::new(e),
                }
            })?;
        debug!(count = sets.len(), "Found owned sets");

        // Flush everything before destroying anything: list:set members are
        // only released once the list holding them is empty.
        for set in &sets {
            self.flush(set).await?;
        }

        for set in sets.iter().filter(|set| !set.is_local_pods()) {
            self.destroy(set).await?;
        }

        Ok(())
    }

    async fn flush(&self, set: &SetName) -> Result<()> {
        debug!(%set, "Flushing set");
        self.backend.flush_set(set).await.map_err(|e| {
            error!(%set, error = %e, "Failed to flush set");
            Error::FlushSet {
                set: set.clone(),
                source: Box::new(e),
            }
        })
    }

    async fn destroy(&self, set: &SetName) -> Result<()> {
        debug!(%set, "Destroying set");
        self.backend.destroy_set(set).await.map_err(|e| {
            error!(%set, error = %e, "Failed to destroy set");
            Error::DestroySet {
                set: set.clone(),
                source: Box::new(e),
            }
        })
    }
}
