use crate::core::connection::ScopeConnection;
use crate::core::waveform::convert_waveforms;
use crate::domain::model::{AcquisitionStamp, ChannelSelection, Waveforms};
use crate::domain::ports::{ConfigProvider, Connector, Storage};
use crate::utils::error::{Result, ScopeError};
use crate::utils::pacing::tick_control;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<String>,
    pub samples: BTreeMap<u8, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSummary {
    pub model: String,
    pub identifier: Option<String>,
    pub firmware: Option<String>,
    pub channels: Vec<u8>,
    pub units: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub acquisitions: Vec<AcquisitionRecord>,
    pub skipped: usize,
}

/// Result of an engine run.
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub output_path: String,
    pub summary: AcquisitionSummary,
}

/// Repeated, paced acquisitions written to storage.
pub struct AcquisitionEngine<C: Connector, S: Storage, P: ConfigProvider> {
    connection: Arc<ScopeConnection<C>>,
    storage: S,
    config: P,
}

impl<C: Connector, S: Storage, P: ConfigProvider> AcquisitionEngine<C, S, P> {
    pub fn new(connection: Arc<ScopeConnection<C>>, storage: S, config: P) -> Self {
        Self {
            connection,
            storage,
            config,
        }
    }

    pub fn connection(&self) -> &Arc<ScopeConnection<C>> {
        &self.connection
    }

    pub async fn run(&self) -> Result<AcquisitionReport> {
        let started_at = Utc::now();
        let channels = ChannelSelection::from(self.config.channels());

        tracing::info!(
            "🚀 Starting {} acquisition(s) on channels {:?}",
            self.config.acquisition_count(),
            channels.channels()
        );

        // 連線與擷取設定
        self.connection.connect().await?;
        self.prepare().await?;

        let vertical = if self.config.convert_to_volts() && !channels.is_empty() {
            let settings = self.connection.get_vertical_settings(&channels).await?;
            tracing::debug!("Vertical settings (scale, position): {:?}", settings);
            Some(settings)
        } else {
            None
        };

        let mut acquisitions = Vec::new();
        let mut skipped = 0;

        for index in 0..self.config.acquisition_count() {
            let stamp = tick_control(self.config.tick(), || async {
                let stamp = self
                    .connection
                    .stamp_acquisition(&channels, self.config.single(), self.config.busy_wait())
                    .await?;
                Ok::<_, ScopeError>((!stamp.raw.is_empty()).then_some(stamp))
            })
            .await?;

            let Some(stamp) = stamp else {
                tracing::warn!("⚠️  Acquisition {} returned no data", index);
                skipped += 1;
                continue;
            };

            let waveforms = self.convert(&channels, &stamp, vertical.as_ref())?;
            let record = self.store(index, &stamp, &channels, &waveforms).await?;
            tracing::info!(
                "📈 Acquisition {} stored ({} bytes read)",
                index,
                stamp.raw.byte_len()
            );
            acquisitions.push(record);
        }

        let identity = self.connection.identity().await;
        let summary = AcquisitionSummary {
            model: self.connection.model().to_string(),
            identifier: identity.as_ref().map(|i| i.raw.clone()),
            firmware: identity.as_ref().map(|i| i.firmware.to_string()),
            channels: channels.channels().to_vec(),
            units: if vertical.is_some() { "volts" } else { "divisions" }.to_string(),
            started_at,
            finished_at: Utc::now(),
            acquisitions,
            skipped,
        };

        let json_data = serde_json::to_string_pretty(&summary)?;
        self.storage.write_file("summary.json", json_data.as_bytes()).await?;

        Ok(AcquisitionReport {
            output_path: self.config.output_path().to_string(),
            summary,
        })
    }

    async fn prepare(&self) -> Result<()> {
        self.connection.set_binary_readout().await?;

        if let Some(length) = self.config.record_length() {
            self.connection.set_record_length(length).await?;
            tracing::debug!("Record length set to {} points", length);
        }

        if let Some(count) = self.config.average_count() {
            self.connection.set_acquisition_count(count).await?;
            tracing::debug!("Single acquisition averages {} waveforms", count);
        }

        Ok(())
    }

    fn convert(
        &self,
        channels: &ChannelSelection,
        stamp: &AcquisitionStamp,
        vertical: Option<&(BTreeMap<u8, f64>, BTreeMap<u8, f64>)>,
    ) -> Result<Waveforms> {
        let data = self.connection.parse_waveform_string(channels, &stamp.raw)?;
        match vertical {
            Some((scales, positions)) => convert_waveforms(&data, Some(scales), Some(positions)),
            None => convert_waveforms(&data, None, None),
        }
    }

    async fn store(
        &self,
        index: usize,
        stamp: &AcquisitionStamp,
        channels: &ChannelSelection,
        waveforms: &Waveforms,
    ) -> Result<AcquisitionRecord> {
        let mut files = Vec::new();
        let formats = self.config.output_formats();

        if formats.iter().any(|f| f == "csv") {
            let name = format!("acquisition_{:04}.csv", index);
            let csv_data = waveforms_to_csv(channels, waveforms)?;
            self.storage.write_file(&name, &csv_data).await?;
            files.push(name);
        }

        if formats.iter().any(|f| f == "json") {
            let name = format!("acquisition_{:04}.json", index);
            let payload = serde_json::json!({
                "index": index,
                "timestamp": stamp.timestamp,
                "waveforms": waveforms,
            });
            let json_data = serde_json::to_vec_pretty(&payload)?;
            self.storage.write_file(&name, &json_data).await?;
            files.push(name);
        }

        Ok(AcquisitionRecord {
            index,
            timestamp: stamp.timestamp,
            files,
            samples: waveforms
                .iter()
                .map(|(&channel, values)| (channel, values.len()))
                .collect(),
        })
    }
}

/// One row per sample index, one column per channel. Shorter traces leave
/// their trailing cells empty.
pub fn waveforms_to_csv(channels: &ChannelSelection, waveforms: &Waveforms) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["sample".to_string()];
    header.extend(channels.channels().iter().map(|c| format!("channel{}", c)));
    writer.write_record(&header)?;

    let rows = waveforms.values().map(Vec::len).max().unwrap_or(0);
    for row in 0..rows {
        let mut record = vec![row.to_string()];
        for channel in channels.channels() {
            let cell = waveforms
                .get(channel)
                .and_then(|values| values.get(row))
                .map(|v| v.to_string())
                .unwrap_or_default();
            record.push(cell);
        }
        writer.write_record(&record)?;
    }

    writer.into_inner().map_err(|e| {
        ScopeError::IoError(std::io::Error::new(e.error().kind(), e.error().to_string()))
    })
}
