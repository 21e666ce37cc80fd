pub mod server;
pub mod sessions;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Sessions(sessions::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(args) => server::execute(args).await,
            Self::Sessions(args) => sessions::execute(args).await,
        }
    }
}
