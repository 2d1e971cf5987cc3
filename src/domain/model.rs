use crate::utils::error::{Result, ScopeError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Number of analog input channels on the supported scopes.
pub const ANALOG_CHANNELS: u8 = 4;

/// Scope family. Decides the SCPI dialect used by [`ScopeConnection`](crate::core::ScopeConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeModel {
    Generic,
    Rtm,
    Rto,
}

impl ScopeModel {
    /// Source names indexed 1..=5 (four channels then the external input).
    fn source_names(&self) -> [&'static str; 5] {
        match self {
            ScopeModel::Generic => ["channel1", "channel2", "channel3", "channel4", "external"],
            ScopeModel::Rtm => ["CH1", "CH2", "CH3", "CH4", "EXT"],
            ScopeModel::Rto => ["CHAN1", "CHAN2", "CHAN3", "CHAN4", "EXT"],
        }
    }

    pub fn source_name(&self, index: u8) -> Option<&'static str> {
        let names = self.source_names();
        match index {
            1..=5 => Some(names[usize::from(index) - 1]),
            _ => None,
        }
    }

    pub fn source_index(&self, name: &str) -> Option<u8> {
        self.source_names()
            .iter()
            .position(|candidate| *candidate == name)
            .map(|pos| pos as u8 + 1)
    }

    pub fn trigger_name(&self) -> &'static str {
        match self {
            ScopeModel::Generic => "trigger",
            ScopeModel::Rtm => "TRIG:A",
            ScopeModel::Rto => "TRIG",
        }
    }

    /// Argument of `FORMAT:DATA`.
    pub fn data_format(&self) -> &'static str {
        match self {
            ScopeModel::Generic => "uint8",
            ScopeModel::Rtm => "UINT,8",
            ScopeModel::Rto => "INT,8",
        }
    }

    pub fn sample_format(&self) -> SampleFormat {
        // data_format 一定是合法格式
        SampleFormat::from_data_format(self.data_format()).unwrap_or(SampleFormat::U8)
    }

    /// Whether `stamp_acquisition` triggers a single acquisition by default.
    /// The RTM is read while running continuously.
    pub fn default_single(&self) -> bool {
        !matches!(self, ScopeModel::Rtm)
    }

    pub fn detect(identity: &Identity) -> Self {
        let model = identity.model.trim().to_ascii_uppercase();
        if model.starts_with("RTM") {
            ScopeModel::Rtm
        } else if model.starts_with("RTO") {
            ScopeModel::Rto
        } else {
            ScopeModel::Generic
        }
    }
}

impl fmt::Display for ScopeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeModel::Generic => "generic",
            ScopeModel::Rtm => "RTM",
            ScopeModel::Rto => "RTO",
        };
        f.write_str(name)
    }
}

/// Model selection from configuration: `auto` defers to the `*IDN?` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSelection {
    Auto,
    Fixed(ScopeModel),
}

impl FromStr for ModelSelection {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ModelSelection::Auto),
            "generic" => Ok(ModelSelection::Fixed(ScopeModel::Generic)),
            "rtm" => Ok(ModelSelection::Fixed(ScopeModel::Rtm)),
            "rto" => Ok(ModelSelection::Fixed(ScopeModel::Rto)),
            other => Err(ScopeError::InvalidConfigValueError {
                field: "scope.model".to_string(),
                value: other.to_string(),
                reason: "Valid models: auto, generic, rtm, rto".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    I8,
}

impl SampleFormat {
    /// `"UINT,8"` -> `uint8`, `"INT,8"` -> `int8`.
    pub fn from_data_format(format: &str) -> Option<Self> {
        match format.replace(',', "").to_ascii_lowercase().as_str() {
            "uint8" => Some(SampleFormat::U8),
            "int8" => Some(SampleFormat::I8),
            _ => None,
        }
    }

    pub fn min(&self) -> f64 {
        match self {
            SampleFormat::U8 => f64::from(u8::MIN),
            SampleFormat::I8 => f64::from(i8::MIN),
        }
    }

    pub fn max(&self) -> f64 {
        match self {
            SampleFormat::U8 => f64::from(u8::MAX),
            SampleFormat::I8 => f64::from(i8::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion(pub Vec<u32>);

impl FromStr for FirmwareVersion {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .split('.')
            .map(|part| part.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(FirmwareVersion)
            .map_err(|_| ScopeError::unexpected("*IDN?", s))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

/// Parsed `*IDN?` answer: `manufacturer,model,serial,firmware`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: FirmwareVersion,
    /// Whole answer, trimmed.
    pub raw: String,
}

impl Identity {
    pub fn parse(idn: &str) -> Result<Self> {
        let fields: Vec<&str> = idn.trim().split(',').collect();
        let [manufacturer, model, serial, firmware] = fields.as_slice() else {
            return Err(ScopeError::unexpected("*IDN?", idn));
        };

        Ok(Identity {
            manufacturer: manufacturer.trim().to_string(),
            model: model.trim().to_string(),
            serial: serial.trim().to_string(),
            firmware: firmware.parse().map_err(|_| ScopeError::unexpected("*IDN?", idn))?,
            raw: idn.trim().to_string(),
        })
    }

    pub fn is_tested(&self) -> bool {
        TESTED_MODELS
            .iter()
            .any(|tested| tested.model == self.model && tested.firmware == self.firmware.0.as_slice())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TestedModel {
    pub model: &'static str,
    pub firmware: &'static [u32],
}

/// Scope/firmware pairs this library has been validated against.
pub const TESTED_MODELS: &[TestedModel] = &[
    TestedModel {
        model: "RTM2054",
        firmware: &[5, 502],
    },
    TestedModel {
        model: "RTO1004",
        firmware: &[2, 15, 2, 0],
    },
];

/// Channels included in an acquisition, in acquisition order.
///
/// A plain list keeps its order. A map of channel to enabled flag keeps only the
/// enabled channels, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSelection(Vec<u8>);

impl ChannelSelection {
    pub fn new(channels: Vec<u8>) -> Self {
        Self(channels)
    }

    pub fn channels(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }
}

impl From<Vec<u8>> for ChannelSelection {
    fn from(channels: Vec<u8>) -> Self {
        Self(channels)
    }
}

impl From<&[u8]> for ChannelSelection {
    fn from(channels: &[u8]) -> Self {
        Self(channels.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for ChannelSelection {
    fn from(channels: [u8; N]) -> Self {
        Self(channels.to_vec())
    }
}

impl From<&ChannelSelection> for ChannelSelection {
    fn from(selection: &ChannelSelection) -> Self {
        selection.clone()
    }
}

impl From<BTreeMap<u8, bool>> for ChannelSelection {
    fn from(enabled: BTreeMap<u8, bool>) -> Self {
        Self(
            enabled
                .into_iter()
                .filter_map(|(channel, on)| on.then_some(channel))
                .collect(),
        )
    }
}

impl From<HashMap<u8, bool>> for ChannelSelection {
    fn from(enabled: HashMap<u8, bool>) -> Self {
        let sorted: BTreeMap<u8, bool> = enabled.into_iter().collect();
        sorted.into()
    }
}

/// Generates the index/mnemonic mapping shared by the SCPI enumerations.
macro_rules! scpi_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $mnemonic:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $($name::$variant => $mnemonic),+
                }
            }

            pub fn from_mnemonic(answer: &str) -> Option<Self> {
                let answer = answer.trim().to_ascii_uppercase();
                Self::ALL.iter().copied().find(|v| v.mnemonic() == answer)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.mnemonic())
            }
        }
    };
}

/// Numeric form shared by every model: the declaration order.
macro_rules! scpi_index {
    ($($name:ident),+) => {
        $(
            impl $name {
                pub fn index(&self) -> u8 {
                    Self::ALL.iter().position(|v| v == self).unwrap_or_default() as u8
                }

                pub fn from_index(index: u8) -> Option<Self> {
                    Self::ALL.get(usize::from(index)).copied()
                }
            }
        )+
    };
}

scpi_enum!(
    /// Vertical input coupling.
    ChannelCoupling {
        Dc => "DC",
        Ac => "AC",
        DcLimit => "DCL",
        AcLimit => "ACL",
    }
);

scpi_enum!(
    TriggerSlope {
        Negative => "NEG",
        Positive => "POS",
        Either => "EITH",
    }
);

scpi_enum!(
    /// Edge trigger coupling. The RTM accepts DC/AC/HF, the RTO DC/AC/DCL/ACL.
    TriggerCoupling {
        Dc => "DC",
        Ac => "AC",
        Hf => "HF",
        DcLimit => "DCL",
        AcLimit => "ACL",
    }
);

scpi_index!(ChannelCoupling, TriggerSlope);

impl TriggerCoupling {
    /// Couplings accepted by `model`, in the order of their numeric form.
    pub fn table(model: ScopeModel) -> &'static [TriggerCoupling] {
        use TriggerCoupling::*;
        match model {
            ScopeModel::Rto => &[Dc, Ac, DcLimit, AcLimit],
            ScopeModel::Generic | ScopeModel::Rtm => &[Dc, Ac, Hf],
        }
    }

    pub fn supported_by(&self, model: ScopeModel) -> bool {
        Self::table(model).contains(self)
    }

    /// Numeric form on `model`, `None` when the model lacks this coupling.
    pub fn index_for(&self, model: ScopeModel) -> Option<u8> {
        Self::table(model)
            .iter()
            .position(|v| v == self)
            .map(|i| i as u8)
    }

    pub fn from_index_for(model: ScopeModel, index: u8) -> Option<Self> {
        Self::table(model).get(usize::from(index)).copied()
    }
}

/// Trigger source, numbered 1..=4 for channels and 5 for the external input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Channel(u8),
    External,
}

impl TriggerSource {
    pub fn index(&self) -> u8 {
        match self {
            TriggerSource::Channel(channel) => *channel,
            TriggerSource::External => ANALOG_CHANNELS + 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1..=ANALOG_CHANNELS => Some(TriggerSource::Channel(index)),
            5 => Some(TriggerSource::External),
            _ => None,
        }
    }
}

/// Raw answer of a waveform query, before block parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawAcquisition {
    /// A single block with the channel samples interleaved.
    Interleaved(Bytes),
    /// One block per channel, in selection order.
    PerChannel(Vec<Bytes>),
}

impl RawAcquisition {
    pub fn is_empty(&self) -> bool {
        match self {
            RawAcquisition::Interleaved(data) => data.is_empty(),
            RawAcquisition::PerChannel(blocks) => blocks.iter().all(|b| b.is_empty()),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            RawAcquisition::Interleaved(data) => data.len(),
            RawAcquisition::PerChannel(blocks) => blocks.iter().map(|b| b.len()).sum(),
        }
    }
}

/// Samples of one channel in the scope's native integer format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTrace {
    U8(Vec<u8>),
    I8(Vec<i8>),
}

impl RawTrace {
    pub fn format(&self) -> SampleFormat {
        match self {
            RawTrace::U8(_) => SampleFormat::U8,
            RawTrace::I8(_) => SampleFormat::I8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawTrace::U8(values) => values.len(),
            RawTrace::I8(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            RawTrace::U8(values) => values.iter().map(|&v| f64::from(v)).collect(),
            RawTrace::I8(values) => values.iter().map(|&v| f64::from(v)).collect(),
        }
    }
}

pub type RawWaveforms = BTreeMap<u8, RawTrace>;
pub type Waveforms = BTreeMap<u8, Vec<f64>>;

/// An acquisition tagged with the time its data was read.
#[derive(Debug, Clone)]
pub struct AcquisitionStamp {
    pub timestamp: DateTime<Utc>,
    pub raw: RawAcquisition,
}
