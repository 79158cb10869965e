use async_trait::async_trait;
use eyre::Result;

pub mod events;
pub mod runs;
pub mod search;
pub mod sessions;
pub mod tools;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

pub(crate) fn format_time(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
