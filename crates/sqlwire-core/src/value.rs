//! Decoded column values and bindable statement parameters.

use std::fmt;

use serde::Serialize;

use crate::error::{ClientErrorKind, Error, Result};

/// A value decoded from a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Signed integer of any width
    Int(i64),
    /// Unsigned integer of any width
    UInt(u64),
    /// 4-byte IEEE754 float
    Float(f32),
    /// 8-byte IEEE754 double
    Double(f64),
    /// Exact decimal kept as its ASCII text to avoid precision loss
    Decimal(String),
    /// Character data converted to the connection encoding
    Text(String),
    /// Raw bytes (BIT columns and binary-charset columns)
    Bytes(Vec<u8>),
    /// DATE, DATETIME or TIMESTAMP
    DateTime(DateTime),
    /// TIME, as a signed duration
    Time(TimeSpan),
    /// YEAR
    Year(u16),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, if it is an integer that fits in `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Year(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Year(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of text-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) | Value::Decimal(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::UInt(_) => "unsigned int",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
            Value::Year(_) => "year",
        }
    }
}

/// Calendar timestamp as transmitted by the server.
///
/// Zero dates (`0000-00-00`) are legal here, which is why this is not a
/// `chrono` type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl DateTime {
    pub const fn date(year: u16, month: u8, day: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour: 0,
            minute: 0,
            second: 0,
            microsecond: 0,
        }
    }

    pub const fn with_time(mut self, hour: u8, minute: u8, second: u8) -> Self {
        self.hour = hour;
        self.minute = minute;
        self.second = second;
        self
    }

    pub const fn with_microsecond(mut self, microsecond: u32) -> Self {
        self.microsecond = microsecond;
        self
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )?;
        if self.microsecond != 0 {
            write!(f, ".{:06}", self.microsecond)?;
        }
        Ok(())
    }
}

/// Signed time span for TIME columns.
///
/// TIME values may be negative and may exceed 24 hours, so the day count is
/// kept separately from the clock fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TimeSpan {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

impl TimeSpan {
    /// Total hours including whole days.
    pub fn total_hours(&self) -> u64 {
        u64::from(self.days) * 24 + u64::from(self.hours)
    }

    /// The span as signed microseconds, or `None` if it does not fit in an
    /// `i64` (the wire day count allows spans far beyond that).
    pub fn as_micros(&self) -> Option<i64> {
        let secs = self.total_hours() * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds);
        let micros = i64::try_from(secs)
            .ok()?
            .checked_mul(1_000_000)?
            .checked_add(i64::from(self.microseconds))?;
        Some(if self.negative { -micros } else { micros })
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.total_hours(),
            self.minutes,
            self.seconds
        )?;
        if self.microseconds != 0 {
            write!(f, ".{:06}", self.microseconds)?;
        }
        Ok(())
    }
}

/// A value the caller binds to a prepared statement parameter.
///
/// The variant is chosen by the caller; nothing is inferred at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(DateTime),
}

impl Param {
    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }
}

macro_rules! param_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Param::Int(i64::from(v))
            }
        })*
    };
}

macro_rules! param_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Param::UInt(u64::from(v))
            }
        })*
    };
}

param_from_signed!(i8, i16, i32, i64);
param_from_unsigned!(u8, u16, u32, u64);

impl From<f32> for Param {
    fn from(v: f32) -> Self {
        Param::Double(f64::from(v))
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Double(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Param::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

impl From<DateTime> for Param {
    fn from(v: DateTime) -> Self {
        Param::DateTime(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map_or(Param::Null, Into::into)
    }
}

impl TryFrom<i128> for Param {
    type Error = Error;

    fn try_from(v: i128) -> Result<Self> {
        if let Ok(i) = i64::try_from(v) {
            Ok(Param::Int(i))
        } else if let Ok(u) = u64::try_from(v) {
            Ok(Param::UInt(u))
        } else {
            Err(Error::client(
                ClientErrorKind::ValueTooLarge,
                format!("value too large: {}", v),
            ))
        }
    }
}

impl TryFrom<Value> for Param {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Null => Ok(Param::Null),
            Value::Int(i) => Ok(Param::Int(i)),
            Value::UInt(u) => Ok(Param::UInt(u)),
            Value::Float(f) => Ok(Param::Double(f64::from(f))),
            Value::Double(d) => Ok(Param::Double(d)),
            Value::Decimal(s) | Value::Text(s) => Ok(Param::Text(s)),
            Value::Bytes(b) => Ok(Param::Bytes(b)),
            Value::DateTime(dt) => Ok(Param::DateTime(dt)),
            Value::Year(y) => Ok(Param::Int(i64::from(y))),
            other @ Value::Time(_) => Err(Error::client(
                ClientErrorKind::UnsupportedValue,
                format!("{} is not supported as a parameter", other.kind_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_from_integers() {
        assert_eq!(Param::from(-5_i8), Param::Int(-5));
        assert_eq!(Param::from(u64::MAX), Param::UInt(u64::MAX));
        assert_eq!(Param::from(None::<i32>), Param::Null);
        assert_eq!(Param::from(Some("x")), Param::Text("x".to_string()));
    }

    #[test]
    fn test_param_from_i128() {
        assert_eq!(Param::try_from(-1_i128).unwrap(), Param::Int(-1));
        assert_eq!(
            Param::try_from(i128::from(u64::MAX)).unwrap(),
            Param::UInt(u64::MAX)
        );
        let err = Param::try_from(i128::from(u64::MAX) + 1).unwrap_err();
        assert_eq!(err.client_kind(), Some(ClientErrorKind::ValueTooLarge));
        let err = Param::try_from(i128::from(i64::MIN) - 1).unwrap_err();
        assert_eq!(err.client_kind(), Some(ClientErrorKind::ValueTooLarge));
    }

    #[test]
    fn test_param_from_value_rejects_time() {
        let err = Param::try_from(Value::Time(TimeSpan::default())).unwrap_err();
        assert_eq!(err.client_kind(), Some(ClientErrorKind::UnsupportedValue));
        assert!(err.to_string().contains("time"));
    }

    #[test]
    fn test_datetime_display() {
        let dt = DateTime::date(2024, 2, 29).with_time(13, 5, 9);
        assert_eq!(dt.to_string(), "2024-02-29 13:05:09");
        assert_eq!(
            dt.with_microsecond(120).to_string(),
            "2024-02-29 13:05:09.000120"
        );
    }

    #[test]
    fn test_time_span() {
        let t = TimeSpan {
            negative: true,
            days: 1,
            hours: 10,
            minutes: 20,
            seconds: 30,
            microseconds: 0,
        };
        assert_eq!(t.total_hours(), 34);
        assert_eq!(t.to_string(), "-34:20:30");
        assert_eq!(t.as_micros(), Some(-(34 * 3600 + 20 * 60 + 30) * 1_000_000));
    }

    #[test]
    fn test_time_span_micros_out_of_range() {
        let t = TimeSpan {
            negative: false,
            days: u32::MAX,
            hours: 23,
            minutes: 59,
            seconds: 59,
            microseconds: 999_999,
        };
        assert_eq!(t.total_hours(), u64::from(u32::MAX) * 24 + 23);
        assert_eq!(t.as_micros(), None);

        let t = TimeSpan {
            days: 106_751_991,
            ..TimeSpan::default()
        };
        assert_eq!(t.as_micros(), Some(106_751_991 * 86_400 * 1_000_000));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let json = serde_json::to_string(&vec![Value::Int(1), Value::Null, Value::Text("a".into())])
            .unwrap();
        assert_eq!(json, r#"[1,null,"a"]"#);
    }
}
