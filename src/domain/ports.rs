use crate::utils::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Message-based instrument link (a VXI-11 core channel in production).
#[async_trait]
pub trait Instrument: Send {
    async fn write(&mut self, command: &str) -> Result<()>;

    async fn read_raw(&mut self) -> Result<Bytes>;

    /// Write a query and read the answer as text, without the trailing line ending.
    async fn ask(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let raw = self.read_raw().await?;
        Ok(String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    /// Device clear.
    async fn clear(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens instrument links to one scope.
#[async_trait]
pub trait Connector: Send + Sync {
    type Instrument: Instrument + 'static;

    async fn open(&self) -> Result<Self::Instrument>;
}

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Settings of a repeated acquisition run.
pub trait ConfigProvider: Send + Sync {
    fn output_path(&self) -> &str;
    fn output_formats(&self) -> &[String];
    fn channels(&self) -> &[u8];
    fn acquisition_count(&self) -> usize;
    fn tick(&self) -> Duration;
    /// `None` keeps the model default.
    fn single(&self) -> Option<bool>;
    fn busy_wait(&self) -> bool;
    fn convert_to_volts(&self) -> bool;
    fn record_length(&self) -> Option<u64>;
    fn average_count(&self) -> Option<u32>;
}
