pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("policy engine failed to {change} {resource} {key}")]
    Engine {
        resource: &'static str,
        change: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{resource} watch ended")]
    WatchEnded { resource: &'static str },

    #[error("{resource} watch task failed")]
    Task {
        resource: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}
