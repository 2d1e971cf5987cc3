//! IEEE 488.2 binary block parsing and sample conversion.

use crate::domain::model::{
    ChannelSelection, RawAcquisition, RawTrace, RawWaveforms, SampleFormat, Waveforms,
};
use crate::utils::error::{Result, ScopeError};
use std::collections::BTreeMap;

/// Number of vertical divisions covered by the full sample range.
pub const VERTICAL_DIVISIONS: f64 = 10.0;

fn invalid(reason: impl Into<String>) -> ScopeError {
    ScopeError::InvalidBlock {
        reason: reason.into(),
    }
}

/// Payload of a `#<n><length><payload>` block.
///
/// `#0` marks an indefinite-length block; its payload runs to the end of the
/// data, without the terminating newline.
pub fn block_payload(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'#') {
        return Err(invalid("block does not start with '#'"));
    }

    let digits = match data.get(1) {
        Some(c) if c.is_ascii_digit() => usize::from(c - b'0'),
        _ => return Err(invalid("missing length digit count")),
    };

    if digits == 0 {
        let payload = &data[2..];
        return Ok(payload.strip_suffix(b"\n").unwrap_or(payload));
    }

    let header_end = 2 + digits;
    let length_field = data
        .get(2..header_end)
        .ok_or_else(|| invalid("truncated length field"))?;
    let length: usize = std::str::from_utf8(length_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("bad length field {:?}", length_field)))?;

    data.get(header_end..header_end + length).ok_or_else(|| {
        invalid(format!(
            "declared {} bytes but only {} received",
            length,
            data.len().saturating_sub(header_end)
        ))
    })
}

fn decode_samples(format: SampleFormat, samples: impl Iterator<Item = u8>) -> RawTrace {
    match format {
        SampleFormat::U8 => RawTrace::U8(samples.collect()),
        SampleFormat::I8 => RawTrace::I8(samples.map(|b| b as i8).collect()),
    }
}

/// Split one block of interleaved samples into per-channel traces.
///
/// The channel at position `i` of the selection owns bytes `i`, `i + n`,
/// `i + 2n`... where `n` is the number of channels.
pub fn parse_waveform_block(
    format: SampleFormat,
    channels: &ChannelSelection,
    data: &[u8],
) -> Result<RawWaveforms> {
    let mut result = BTreeMap::new();
    if channels.is_empty() || data.is_empty() {
        return Ok(result);
    }

    let payload = block_payload(data)?;
    let stride = channels.len();
    for (index, &channel) in channels.channels().iter().enumerate() {
        let samples = payload.iter().skip(index).step_by(stride).copied();
        result.insert(channel, decode_samples(format, samples));
    }
    Ok(result)
}

/// Parse a raw acquisition: one interleaved block, or one block per channel.
pub fn parse_acquisition(
    format: SampleFormat,
    channels: &ChannelSelection,
    raw: &RawAcquisition,
) -> Result<RawWaveforms> {
    match raw {
        RawAcquisition::Interleaved(data) => parse_waveform_block(format, channels, data),
        RawAcquisition::PerChannel(blocks) => {
            let mut result = BTreeMap::new();
            for (&channel, block) in channels.channels().iter().zip(blocks) {
                let single = ChannelSelection::new(vec![channel]);
                result.extend(parse_waveform_block(format, &single, block)?);
            }
            Ok(result)
        }
    }
}

/// Convert raw samples to divisions, or to volts when scales are given.
///
/// The sample range maps onto the 10 vertical divisions around the middle of
/// the integer range. With `positions`, the channel position (in divisions,
/// times the scale) is subtracted.
pub fn convert_waveforms(
    data: &RawWaveforms,
    scales: Option<&BTreeMap<u8, f64>>,
    positions: Option<&BTreeMap<u8, f64>>,
) -> Result<Waveforms> {
    let lookup = |table: &BTreeMap<u8, f64>, channel: u8, what: &str| {
        table
            .get(&channel)
            .copied()
            .ok_or_else(|| ScopeError::MissingConfigError {
                field: format!("{} of channel {}", what, channel),
            })
    };

    let mut result = BTreeMap::new();
    for (&channel, trace) in data {
        let format = trace.format();
        let median = (format.max() + format.min()) * 0.5;

        let scale = match scales {
            Some(table) => Some(lookup(table, channel, "scale")?),
            None => None,
        };
        let factor = VERTICAL_DIVISIONS / (format.max() - format.min()) * scale.unwrap_or(1.0);

        let offset = match positions {
            Some(table) => lookup(table, channel, "position")? * scale.unwrap_or(1.0),
            None => 0.0,
        };

        let values = trace
            .to_f64()
            .into_iter()
            .map(|raw| (raw - median) * factor - offset)
            .collect();
        result.insert(channel, values);
    }
    Ok(result)
}
