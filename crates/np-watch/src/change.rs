use crate::resource::ObjectKey;

/// A typed change to one watched object.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<K> {
    Added(K),
    Updated { old: K, new: K },
    Deleted(Deleted<K>),
}

/// How a deletion was observed.
#[derive(Clone, Debug, PartialEq)]
pub enum Deleted<K> {
    /// The watch delivered the deleted object itself.
    Live(K),
    /// The deletion happened while the watch was disconnected. Only the last
    /// cached state is known, which may be stale.
    FinalStateUnknown { key: String, last_known: K },
}

impl<K> Deleted<K> {
    pub fn into_last_known(self) -> K {
        match self {
            Deleted::Live(obj) => obj,
            Deleted::FinalStateUnknown { last_known, .. } => last_known,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Deleted::FinalStateUnknown { .. })
    }
}

impl<K: ObjectKey> Change<K> {
    pub fn key(&self) -> String {
        match self {
            Change::Added(obj) | Change::Updated { new: obj, .. } => obj.key(),
            Change::Deleted(Deleted::Live(obj)) => obj.key(),
            Change::Deleted(Deleted::FinalStateUnknown { key, .. }) => key.clone(),
        }
    }
}

impl<K> Change<K> {
    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Added(_) => "add",
            Change::Updated { .. } => "update",
            Change::Deleted(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_yields_last_known_value() {
        let deleted = Deleted::FinalStateUnknown {
            key: "prod/web".to_string(),
            last_known: 7,
        };
        assert!(deleted.is_tombstone());
        assert_eq!(deleted.into_last_known(), 7);

        let live = Deleted::Live(3);
        assert!(!live.is_tombstone());
        assert_eq!(live.into_last_known(), 3);
    }
}
