//! Waveform readout, completion waits and time-stamped acquisitions.

use super::connection::{parse_int, ScopeConnection};
use super::waveform::{convert_waveforms, parse_acquisition};
use crate::domain::model::{
    AcquisitionStamp, ChannelSelection, RawAcquisition, RawWaveforms, ScopeModel, Waveforms,
};
use crate::domain::ports::{Connector, Instrument};
use crate::utils::error::{Result, ScopeError};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Event status register bit set once pending operations complete (`*OPC`).
const ESR_OPERATION_COMPLETE: i64 = 1;

impl<C: Connector> ScopeConnection<C> {
    /// Read the raw waveform data of the given channels.
    ///
    /// The RTM is queried channel by channel. The RTO returns every exported
    /// channel in one multichannel block, requested through the first channel.
    pub async fn get_waveform_string(
        &self,
        channels: impl Into<ChannelSelection>,
    ) -> Result<RawAcquisition> {
        let channels = channels.into();

        match self.model {
            ScopeModel::Rtm => {
                let mut blocks = Vec::with_capacity(channels.len());
                for &channel in channels.channels() {
                    let mut link = self.link.lock().await;
                    let instrument = link.connected_instrument()?;
                    instrument.write(&format!("CHAN{}:DATA?", channel)).await?;
                    blocks.push(instrument.read_raw().await?);
                }
                Ok(RawAcquisition::PerChannel(blocks))
            }
            ScopeModel::Rto => {
                let Some(first) = channels.first() else {
                    return Ok(RawAcquisition::Interleaved(Bytes::new()));
                };
                let mut link = self.link.lock().await;
                let instrument = link.connected_instrument()?;
                instrument
                    .write(&format!("CHAN{}:WAV1:DATA:VAL?", first))
                    .await?;
                Ok(RawAcquisition::Interleaved(instrument.read_raw().await?))
            }
            ScopeModel::Generic => Err(self.unsupported("get_waveform_string")),
        }
    }

    /// Parse raw data read from this scope into per-channel samples.
    pub fn parse_waveform_string(
        &self,
        channels: impl Into<ChannelSelection>,
        raw: &RawAcquisition,
    ) -> Result<RawWaveforms> {
        parse_acquisition(self.model.sample_format(), &channels.into(), raw)
    }

    pub async fn get_waveform_data(
        &self,
        channels: impl Into<ChannelSelection>,
    ) -> Result<RawWaveforms> {
        let channels = channels.into();
        let raw = self.get_waveform_string(&channels).await?;
        self.parse_waveform_string(&channels, &raw)
    }

    /// Waveforms in divisions, or in volts when `scales` are given.
    pub async fn get_waveforms(
        &self,
        channels: impl Into<ChannelSelection>,
        scales: Option<&BTreeMap<u8, f64>>,
        positions: Option<&BTreeMap<u8, f64>>,
    ) -> Result<Waveforms> {
        let data = self.get_waveform_data(channels).await?;
        convert_waveforms(&data, scales, positions)
    }

    /// Current scale and position of each channel, for conversion to volts.
    pub async fn get_vertical_settings(
        &self,
        channels: &ChannelSelection,
    ) -> Result<(BTreeMap<u8, f64>, BTreeMap<u8, f64>)> {
        let mut scales = BTreeMap::new();
        let mut positions = BTreeMap::new();
        for &channel in channels.channels() {
            scales.insert(channel, self.get_channel_scale(channel).await?);
            positions.insert(channel, self.get_channel_position(channel).await?);
        }
        Ok((scales, positions))
    }

    /// Wait for the pending commands to complete.
    ///
    /// With `busy`, poll the event status register until the operation complete
    /// bit is set, failing with a VXI-11 timeout after the io timeout.
    /// Otherwise start a single acquisition and let the scope block on `*OPC?`.
    pub async fn wait(&self, busy: bool) -> Result<()> {
        if !busy {
            self.ask_all(&["RUNS", "*OPC?"]).await?;
            return Ok(());
        }

        let deadline = Instant::now() + self.settings.io_timeout;
        self.write("*OPC").await?;

        loop {
            let command = "*ESR?";
            let esr = parse_int(command, &self.ask(command).await?)?;
            if esr & ESR_OPERATION_COMPLETE != 0 {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(ScopeError::timeout("wait"));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Read the waveform data along with the time it was taken.
    ///
    /// With `single` (default depends on the model) and a non-empty selection,
    /// a single acquisition is started first and waited for.
    pub async fn stamp_acquisition(
        &self,
        channels: impl Into<ChannelSelection>,
        single: Option<bool>,
        busy: bool,
    ) -> Result<AcquisitionStamp> {
        let channels = channels.into();
        let single = single.unwrap_or_else(|| self.model.default_single());

        if !channels.is_empty() && single {
            self.write("RUNS").await?;
            self.wait(busy).await?;
        }

        let timestamp = chrono::Utc::now();
        let raw = self.get_waveform_string(&channels).await?;
        Ok(AcquisitionStamp { timestamp, raw })
    }
}
