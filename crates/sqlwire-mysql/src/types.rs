//! Column metadata and value codecs.
//!
//! Rows arrive in one of two formats:
//!
//! - **Text** (plain queries): every value is a length-encoded string, or
//!   0xFB for NULL.
//! - **Binary** (prepared statements): a 0x00 header, a NULL bitmap offset
//!   by two bits, then each non-NULL value in a type-specific layout.
//!
//! Bound parameters always use the binary layout.

use sqlwire_core::{ClientErrorKind, DateTime, Error, Param, Result, TimeSpan, Value};

use crate::charset::Charset;
use crate::protocol::{Command, Packet, PacketWriter, charset as ids, cursor_type, field_flags};

/// MySQL column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::Int24
                | FieldType::LongLong
        )
    }

    /// Types the server flags as numeric.
    pub fn is_numeric(self) -> bool {
        self.is_integer()
            || matches!(
                self,
                FieldType::Decimal
                    | FieldType::NewDecimal
                    | FieldType::Float
                    | FieldType::Double
                    | FieldType::Year
            )
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub db: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
    /// Only present in COM_FIELD_LIST responses
    pub default: Option<Vec<u8>>,
}

impl Field {
    pub fn parse(mut pkt: Packet) -> Result<Self> {
        let _catalog = pkt.read_lenenc_bytes()?;
        let db = lenenc_name(&mut pkt)?;
        let table = lenenc_name(&mut pkt)?;
        let org_table = lenenc_name(&mut pkt)?;
        let name = lenenc_name(&mut pkt)?;
        let org_name = lenenc_name(&mut pkt)?;
        let _fixed_len = pkt.read_lenenc_int()?;
        let charset = pkt.read_u16_le()?;
        let length = pkt.read_u32_le()?;
        let column_type = pkt.read_u8()?;
        let mut flags = pkt.read_u16_le()?;
        let decimals = pkt.read_u8()?;
        pkt.skip(2.min(pkt.remaining()))?;
        let default = if pkt.is_empty() {
            None
        } else {
            pkt.read_lenenc_bytes()?.map(<[u8]>::to_vec)
        };

        if FieldType::from_u8(column_type).is_some_and(FieldType::is_numeric) {
            flags |= field_flags::NUM;
        }

        Ok(Self {
            db,
            table,
            org_table,
            name,
            org_name,
            charset,
            length,
            column_type,
            flags,
            decimals,
            default,
        })
    }

    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u8(self.column_type)
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & field_flags::UNSIGNED != 0
    }

    pub fn is_num(&self) -> bool {
        self.flags & field_flags::NUM != 0
    }

    pub fn is_not_null(&self) -> bool {
        self.flags & field_flags::NOT_NULL != 0
    }

    pub fn is_pri_key(&self) -> bool {
        self.flags & field_flags::PRI_KEY != 0
    }

    /// Data in the binary charset is never converted to text.
    pub fn is_binary(&self) -> bool {
        self.charset == ids::BINARY_ID
    }

    /// Charset to decode this column's text with.
    ///
    /// Id 0 means the server did not say, so the connection charset applies.
    /// Any other id the client cannot convert is an error rather than a
    /// silent reinterpretation.
    fn text_charset(&self, connection: Charset) -> Result<Charset> {
        if self.charset == 0 {
            return Ok(connection);
        }
        Charset::from_id(self.charset).ok_or_else(|| {
            Error::client(
                ClientErrorKind::Charset,
                format!(
                    "unsupported charset id {} in column '{}'",
                    self.charset, self.name
                ),
            )
        })
    }
}

fn lenenc_name(pkt: &mut Packet) -> Result<String> {
    Ok(pkt.read_lenenc_string()?.unwrap_or_default())
}

// ==================== Text protocol ====================

/// Decode a text-protocol row.
pub fn decode_text_row(mut pkt: Packet, fields: &[Field], charset: Charset) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let value = match pkt.read_lenenc_bytes()? {
            None => Value::Null,
            Some(raw) => decode_text_value(raw, field, charset)?,
        };
        values.push(value);
    }
    Ok(values)
}

fn decode_text_value(raw: &[u8], field: &Field, charset: Charset) -> Result<Value> {
    let Some(ty) = field.field_type() else {
        return string_value(raw, field, charset);
    };

    match ty {
        t if t.is_integer() => {
            let text = ascii(raw, field)?;
            if field.is_unsigned() {
                text.parse().map(Value::UInt).map_err(|_| bad_number(field, text))
            } else {
                text.parse().map(Value::Int).map_err(|_| bad_number(field, text))
            }
        }
        FieldType::Float => {
            let text = ascii(raw, field)?;
            text.parse().map(Value::Float).map_err(|_| bad_number(field, text))
        }
        FieldType::Double => {
            let text = ascii(raw, field)?;
            text.parse().map(Value::Double).map_err(|_| bad_number(field, text))
        }
        FieldType::Year => {
            let text = ascii(raw, field)?;
            text.parse().map(Value::Year).map_err(|_| bad_number(field, text))
        }
        FieldType::Decimal | FieldType::NewDecimal => {
            Ok(Value::Decimal(ascii(raw, field)?.to_string()))
        }
        FieldType::Bit | FieldType::Geometry => Ok(Value::Bytes(raw.to_vec())),
        _ => string_value(raw, field, charset),
    }
}

fn string_value(raw: &[u8], field: &Field, charset: Charset) -> Result<Value> {
    if field.is_binary() && field.field_type() != Some(FieldType::Json) {
        return Ok(Value::Bytes(raw.to_vec()));
    }
    let charset = match field.text_charset(charset)? {
        Charset::Binary => Charset::Utf8,
        other => other,
    };
    charset.decode(raw).map(Value::Text)
}

// The packet is fully framed by now, so a bad value only spoils its own row.
fn ascii<'a>(raw: &'a [u8], field: &Field) -> Result<&'a str> {
    std::str::from_utf8(raw)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| {
            Error::client(
                ClientErrorKind::Conversion,
                format!("non-ascii numeric data in column '{}'", field.name),
            )
        })
}

fn bad_number(field: &Field, text: &str) -> Error {
    Error::client(
        ClientErrorKind::Conversion,
        format!("invalid numeric value '{}' in column '{}'", text, field.name),
    )
}

// ==================== Binary protocol ====================

/// Decode a binary-protocol row.
pub fn decode_binary_row(
    mut pkt: Packet,
    fields: &[Field],
    charset: Charset,
) -> Result<Vec<Value>> {
    if pkt.read_u8()? != 0x00 {
        return Err(Error::protocol("invalid binary row header"));
    }
    let bitmap = pkt.read_bytes((fields.len() + 7 + 2) / 8)?.to_vec();

    let mut values = Vec::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(&mut pkt, field, charset)?);
        }
    }
    Ok(values)
}

fn decode_binary_value(pkt: &mut Packet, field: &Field, charset: Charset) -> Result<Value> {
    let unsigned = field.is_unsigned();
    let Some(ty) = field.field_type() else {
        let raw = pkt.read_lenenc_bytes()?.unwrap_or_default().to_vec();
        return string_value(&raw, field, charset);
    };

    Ok(match ty {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let v = pkt.read_u8()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i8))
            }
        }
        FieldType::Short => {
            let v = pkt.read_u16_le()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i16))
            }
        }
        FieldType::Year => Value::Year(pkt.read_u16_le()?),
        FieldType::Long | FieldType::Int24 => {
            let v = pkt.read_u32_le()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i32))
            }
        }
        FieldType::LongLong => {
            let v = pkt.read_u64_le()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        FieldType::Float => Value::Float(f32::from_bits(pkt.read_u32_le()?)),
        FieldType::Double => Value::Double(f64::from_bits(pkt.read_u64_le()?)),
        FieldType::Decimal | FieldType::NewDecimal => {
            let raw = pkt.read_lenenc_bytes()?.unwrap_or_default().to_vec();
            Value::Decimal(ascii(&raw, field)?.to_string())
        }
        FieldType::Date | FieldType::NewDate | FieldType::DateTime | FieldType::Timestamp => {
            decode_binary_datetime(pkt)?
        }
        FieldType::Time => Value::Time(decode_binary_time(pkt)?),
        FieldType::Bit | FieldType::Geometry => {
            Value::Bytes(pkt.read_lenenc_bytes()?.unwrap_or_default().to_vec())
        }
        _ => {
            let raw = pkt.read_lenenc_bytes()?.unwrap_or_default().to_vec();
            string_value(&raw, field, charset)?
        }
    })
}

fn decode_binary_datetime(pkt: &mut Packet) -> Result<Value> {
    let len = pkt.read_u8()?;
    if len == 0 {
        return Ok(Value::Null);
    }
    if !matches!(len, 4 | 7 | 11) {
        return Err(Error::protocol(format!("invalid datetime length: {}", len)));
    }
    let year = pkt.read_u16_le()?;
    let month = pkt.read_u8()?;
    let day = pkt.read_u8()?;
    let mut dt = DateTime::date(year, month, day);
    if len >= 7 {
        let (h, mi, s) = (pkt.read_u8()?, pkt.read_u8()?, pkt.read_u8()?);
        dt = dt.with_time(h, mi, s);
    }
    if len == 11 {
        dt = dt.with_microsecond(pkt.read_u32_le()?);
    }
    Ok(Value::DateTime(dt))
}

fn decode_binary_time(pkt: &mut Packet) -> Result<TimeSpan> {
    let len = pkt.read_u8()?;
    if len == 0 {
        return Ok(TimeSpan::default());
    }
    if !matches!(len, 8 | 12) {
        return Err(Error::protocol(format!("invalid time length: {}", len)));
    }
    let negative = pkt.read_u8()? != 0;
    let days = pkt.read_u32_le()?;
    let (hours, minutes, seconds) = (pkt.read_u8()?, pkt.read_u8()?, pkt.read_u8()?);
    let microseconds = if len == 12 { pkt.read_u32_le()? } else { 0 };
    Ok(TimeSpan {
        negative,
        days,
        hours,
        minutes,
        seconds,
        microseconds,
    })
}

// ==================== Parameters ====================

/// Flag OR-ed into a parameter type code for unsigned values.
pub const UNSIGNED_PARAM: u16 = 0x8000;

/// Wire type code and encoded bytes for one parameter (`None` for NULL).
pub fn encode_param(param: &Param, charset: Charset) -> Result<(u16, Option<Vec<u8>>)> {
    let mut w = PacketWriter::new();
    let ty = match param {
        Param::Null => return Ok((FieldType::Null as u16, None)),
        Param::Int(v) => {
            if let Ok(v) = i32::try_from(*v) {
                w.write_u32_le(v as u32);
                FieldType::Long as u16
            } else {
                w.write_u64_le(*v as u64);
                FieldType::LongLong as u16
            }
        }
        Param::UInt(v) => {
            if let Ok(v) = i32::try_from(*v) {
                w.write_u32_le(v as u32);
                FieldType::Long as u16
            } else if i64::try_from(*v).is_ok() {
                w.write_u64_le(*v);
                FieldType::LongLong as u16
            } else {
                w.write_u64_le(*v);
                FieldType::LongLong as u16 | UNSIGNED_PARAM
            }
        }
        Param::Double(v) => {
            w.write_u64_le(v.to_bits());
            FieldType::Double as u16
        }
        Param::Text(s) => {
            w.write_lenenc_bytes(&charset.encode(s)?);
            FieldType::String as u16
        }
        Param::Bytes(b) => {
            w.write_lenenc_bytes(b);
            FieldType::Blob as u16
        }
        Param::DateTime(dt) => {
            w.write_u8(11);
            w.write_u16_le(dt.year);
            w.write_u8(dt.month);
            w.write_u8(dt.day);
            w.write_u8(dt.hour);
            w.write_u8(dt.minute);
            w.write_u8(dt.second);
            w.write_u32_le(dt.microsecond);
            FieldType::DateTime as u16
        }
    };
    Ok((ty, Some(w.into_bytes())))
}

/// Build a COM_STMT_EXECUTE payload.
pub fn build_execute(statement_id: u32, params: &[Param], charset: Charset) -> Result<Vec<u8>> {
    let mut w = PacketWriter::with_capacity(16 + params.len() * 12);
    w.write_u8(Command::StmtExecute as u8);
    w.write_u32_le(statement_id);
    w.write_u8(cursor_type::NO_CURSOR);
    w.write_u32_le(1); // iteration count

    if params.is_empty() {
        return Ok(w.into_bytes());
    }

    let mut bitmap = vec![0u8; params.len().div_ceil(8)];
    let mut types = Vec::with_capacity(params.len());
    let mut values = Vec::new();
    for (i, param) in params.iter().enumerate() {
        let (ty, data) = encode_param(param, charset)?;
        match data {
            Some(data) => values.extend_from_slice(&data),
            None => bitmap[i / 8] |= 1 << (i % 8),
        }
        types.push(ty);
    }

    w.write_bytes(&bitmap);
    w.write_u8(1); // new params bound
    for ty in types {
        w.write_u16_le(ty);
    }
    w.write_bytes(&values);
    Ok(w.into_bytes())
}

/// Reject a statement execution with the wrong number of parameters.
pub fn check_param_count(expected: usize, given: usize) -> Result<()> {
    if expected == given {
        Ok(())
    } else {
        Err(Error::client(
            ClientErrorKind::ParamCountMismatch,
            format!("parameter count mismatch: expected {}, got {}", expected, given),
        ))
    }
}
