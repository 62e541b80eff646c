//! Samples, timestamps and the archiver's sample types.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Source timestamp of a sample (seconds + nanoseconds past the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the epoch.
    pub secs: i64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl Timestamp {
    /// Build a timestamp, folding excess nanoseconds into seconds.
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self {
            secs: secs + (nanos / 1_000_000_000) as i64,
            nanos: nanos % 1_000_000_000,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// This timestamp shifted forward by `d`.
    pub fn plus(self, d: Duration) -> Self {
        let total = self.nanos as u64 + d.subsec_nanos() as u64;
        Self::new(
            self.secs + d.as_secs() as i64 + (total / 1_000_000_000) as i64,
            (total % 1_000_000_000) as u32,
        )
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self::new(-(d.as_secs() as i64), 0)
                } else {
                    Self::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// A received PV value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    /// Scalar string.
    Str(String),
    /// Scalar integer (byte, short, int, enum index).
    Int(i64),
    /// Scalar floating point.
    Double(f64),
    /// String waveform.
    StrArray(Vec<String>),
    /// Integer waveform.
    IntArray(Vec<i64>),
    /// Floating point waveform.
    DoubleArray(Vec<f64>),
    /// Opaque structure bytes.
    Bytes(Vec<u8>),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Str(s) => f.write_str(s),
            SampleValue::Int(v) => write!(f, "{}", v),
            SampleValue::Double(v) => write!(f, "{}", v),
            SampleValue::StrArray(v) => write!(f, "{:?}", v),
            SampleValue::IntArray(v) => write!(f, "{:?}", v),
            SampleValue::DoubleArray(v) => write!(f, "{:?}", v),
            SampleValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// One timestamped observation of a PV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Source timestamp.
    pub timestamp: Timestamp,
    /// The value.
    pub value: SampleValue,
    /// Alarm status.
    pub status: i32,
    /// Alarm severity.
    pub severity: i32,
}

impl Sample {
    /// A sample with no alarm.
    pub fn new(timestamp: Timestamp, value: SampleValue) -> Self {
        Self {
            timestamp,
            value,
            status: 0,
            severity: 0,
        }
    }

    /// Set alarm status and severity.
    pub fn with_alarm(mut self, status: i32, severity: i32) -> Self {
        self.status = status;
        self.severity = severity;
        self
    }
}

/// Declared storage type of an archived PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    /// `DBR_SCALAR_STRING`
    ScalarString,
    /// `DBR_SCALAR_SHORT`
    ScalarShort,
    /// `DBR_SCALAR_FLOAT`
    ScalarFloat,
    /// `DBR_SCALAR_ENUM`
    ScalarEnum,
    /// `DBR_SCALAR_BYTE`
    ScalarByte,
    /// `DBR_SCALAR_INT`
    ScalarInt,
    /// `DBR_SCALAR_DOUBLE`
    ScalarDouble,
    /// `DBR_WAVEFORM_STRING`
    WaveformString,
    /// `DBR_WAVEFORM_SHORT`
    WaveformShort,
    /// `DBR_WAVEFORM_FLOAT`
    WaveformFloat,
    /// `DBR_WAVEFORM_ENUM`
    WaveformEnum,
    /// `DBR_WAVEFORM_BYTE`
    WaveformByte,
    /// `DBR_WAVEFORM_INT`
    WaveformInt,
    /// `DBR_WAVEFORM_DOUBLE`
    WaveformDouble,
    /// `DBR_V4_GENERIC_BYTES`
    V4GenericBytes,
}

const TYPE_NAMES: [(SampleType, &str); 15] = [
    (SampleType::ScalarString, "DBR_SCALAR_STRING"),
    (SampleType::ScalarShort, "DBR_SCALAR_SHORT"),
    (SampleType::ScalarFloat, "DBR_SCALAR_FLOAT"),
    (SampleType::ScalarEnum, "DBR_SCALAR_ENUM"),
    (SampleType::ScalarByte, "DBR_SCALAR_BYTE"),
    (SampleType::ScalarInt, "DBR_SCALAR_INT"),
    (SampleType::ScalarDouble, "DBR_SCALAR_DOUBLE"),
    (SampleType::WaveformString, "DBR_WAVEFORM_STRING"),
    (SampleType::WaveformShort, "DBR_WAVEFORM_SHORT"),
    (SampleType::WaveformFloat, "DBR_WAVEFORM_FLOAT"),
    (SampleType::WaveformEnum, "DBR_WAVEFORM_ENUM"),
    (SampleType::WaveformByte, "DBR_WAVEFORM_BYTE"),
    (SampleType::WaveformInt, "DBR_WAVEFORM_INT"),
    (SampleType::WaveformDouble, "DBR_WAVEFORM_DOUBLE"),
    (SampleType::V4GenericBytes, "DBR_V4_GENERIC_BYTES"),
];

impl SampleType {
    /// Canonical `DBR_*` name.
    pub fn name(self) -> &'static str {
        TYPE_NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, name)| *name)
            .unwrap_or("DBR_V4_GENERIC_BYTES")
    }

    /// Whether a received value can be stored under this type.
    pub fn accepts(self, value: &SampleValue) -> bool {
        use SampleType::*;
        matches!(
            (self, value),
            (ScalarString, SampleValue::Str(_))
                | (ScalarShort | ScalarEnum | ScalarByte | ScalarInt, SampleValue::Int(_))
                | (ScalarFloat | ScalarDouble, SampleValue::Double(_))
                | (WaveformString, SampleValue::StrArray(_))
                | (
                    WaveformShort | WaveformEnum | WaveformByte | WaveformInt,
                    SampleValue::IntArray(_)
                )
                | (WaveformFloat | WaveformDouble, SampleValue::DoubleArray(_))
                | (V4GenericBytes, SampleValue::Bytes(_))
        )
    }
}

impl FromStr for SampleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim();
        TYPE_NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(wanted))
            .map(|(t, _)| *t)
            .ok_or_else(|| format!("unknown sample type: {}", s))
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
