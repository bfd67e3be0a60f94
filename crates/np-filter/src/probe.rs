use crate::backend::Backend;
use np_core::{Error, Result, SetName};

/// Check whether a set exists by listing sets matching its exact name.
///
/// `ipset create -exist` is not usable here, so existence has to be read
/// before creating.
pub async fn set_exists(backend: &dyn Backend, name: &SetName) -> Result<bool> {
    let sets = backend
        .list_sets(name.as_str())
        .await
        .map_err(|source| Error::ListSets {
            prefix: name.to_string(),
            source: Box::new(source),
        })?;
    Ok(sets.iter().any(|set| set == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use np_core::SetType;

    #[tokio::test]
    async fn prefix_match_is_not_existence() {
        let backend = MemoryBackend::new();
        backend.insert_set(
            SetName::new("netpol-local-pods-v2").unwrap(),
            SetType::HashIp,
            Vec::<String>::new(),
        );

        assert!(!set_exists(&backend, &SetName::local_pods()).await.unwrap());

        backend.insert_set(SetName::local_pods(), SetType::HashIp, Vec::<String>::new());
        assert!(set_exists(&backend, &SetName::local_pods()).await.unwrap());
    }
}
