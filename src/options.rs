//! Typed configuration options of a mod.
//!
//! Options are declared with a type, a default and a current value. Mods reference them with
//! `[[name]]` placeholders which are replaced by the packed value when the code is finalized.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum OptionError {
    #[error("Configuration option '{0}' is missing a type")]
    MissingType(String),
    #[error("Configuration option '{0}' has an unrecognized type: {1}")]
    UnrecognizedType(String, String),
    #[error("Configuration option '{0}' is missing a value")]
    MissingValue(String),
    #[error("Configuration option '{0}' is missing a default")]
    MissingDefault(String),
    #[error("Invalid value for configuration option '{0}': {1}")]
    InvalidValue(String, String),
    #[error("Value {1} of configuration option '{0}' does not fit in {2} byte(s)")]
    OutOfRange(String, OptionValue, usize),
    #[error("Value {1} of configuration option '{0}' is outside {2}-{3}")]
    OutsideRange(String, OptionValue, i64, i64),
    #[error("Value {1} of configuration option '{0}' sets bits outside mask 0x{2:X}")]
    OutsideMask(String, OptionValue, u64),
    #[error("Invalid configuration declaration: {0}")]
    InvalidDeclaration(String),
}

/// Type names as written in mod files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::EnumString, strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum OptionType {
    Int8,
    Uint8,
    Mask8,
    Int16,
    Uint16,
    Mask16,
    Int32,
    Uint32,
    Mask32,
    Float,
}

/// Shape of an option, validated once when the mod is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionKind {
    Int {
        width: usize,
        signed: bool,
        range: Option<(i64, i64)>,
    },
    Mask {
        width: usize,
        mask: Option<u64>,
    },
    Float,
}

impl From<OptionType> for OptionKind {
    fn from(option_type: OptionType) -> Self {
        let int = |width, signed| OptionKind::Int {
            width,
            signed,
            range: None,
        };
        let mask = |width| OptionKind::Mask { width, mask: None };
        match option_type {
            OptionType::Int8 => int(1, true),
            OptionType::Uint8 => int(1, false),
            OptionType::Int16 => int(2, true),
            OptionType::Uint16 => int(2, false),
            OptionType::Int32 => int(4, true),
            OptionType::Uint32 => int(4, false),
            OptionType::Mask8 => mask(1),
            OptionType::Mask16 => mask(2),
            OptionType::Mask32 => mask(4),
            OptionType::Float => OptionKind::Float,
        }
    }
}

impl OptionKind {
    pub fn option_type(&self) -> OptionType {
        match self {
            OptionKind::Int { width: 1, signed, .. } => {
                if *signed { OptionType::Int8 } else { OptionType::Uint8 }
            }
            OptionKind::Int { width: 2, signed, .. } => {
                if *signed { OptionType::Int16 } else { OptionType::Uint16 }
            }
            OptionKind::Int { signed, .. } => {
                if *signed { OptionType::Int32 } else { OptionType::Uint32 }
            }
            OptionKind::Mask { width: 1, .. } => OptionType::Mask8,
            OptionKind::Mask { width: 2, .. } => OptionType::Mask16,
            OptionKind::Mask { .. } => OptionType::Mask32,
            OptionKind::Float => OptionType::Float,
        }
    }

    /// Size of the option's value in bytes.
    pub fn width(&self) -> usize {
        match self {
            OptionKind::Int { width, .. } | OptionKind::Mask { width, .. } => *width,
            OptionKind::Float => 4,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, OptionKind::Int { signed: true, .. })
    }

    pub fn parse_value(&self, text: &str) -> Option<OptionValue> {
        let text = text.trim();
        match self {
            OptionKind::Float => text.parse::<f32>().ok().map(OptionValue::Float),
            _ => parse_int(text).map(OptionValue::Int),
        }
    }

    fn value_from_json(&self, value: &Value) -> Option<OptionValue> {
        match (self, value) {
            (_, Value::String(text)) => self.parse_value(text),
            (OptionKind::Float, Value::Number(number)) => {
                number.as_f64().map(|v| OptionValue::Float(v as f32))
            }
            (_, Value::Number(number)) => number.as_i64().map(OptionValue::Int),
            _ => None,
        }
    }

    /// Pack a value into `width` big-endian bytes.
    pub fn pack(&self, value: OptionValue, width: usize) -> Option<Vec<u8>> {
        match (self, value) {
            (OptionKind::Float, OptionValue::Float(value)) if width == 4 => {
                Some(value.to_bits().to_be_bytes().to_vec())
            }
            (OptionKind::Float, _) => None,
            (_, OptionValue::Int(value)) => pack_int(value, width, self.is_signed()),
            (_, OptionValue::Float(_)) => None,
        }
    }
}

/// Big-endian bytes of an integer truncated to `width`, if the value is representable.
pub fn pack_int(value: i64, width: usize, signed: bool) -> Option<Vec<u8>> {
    if width == 0 || width > 8 {
        return None;
    }
    let bits = (width * 8) as u32;
    let (min, max) = if bits >= 64 {
        (i64::MIN, i64::MAX)
    } else if signed {
        // Also accept the unsigned spelling of negative numbers, e.g. 0xFF for an int8.
        (-(1i64 << (bits - 1)), (1i64 << bits) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    };
    if value < min || value > max {
        return None;
    }

    let bytes = (value as u64).to_be_bytes();
    Some(bytes[8 - width..].to_vec())
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, text),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Float(f32),
}

impl OptionValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(value) => Some(*value),
            OptionValue::Float(_) => None,
        }
    }

    /// Text form, hexadecimal when `hex` is set and the value is an integer.
    pub fn format(&self, hex: bool) -> String {
        match self {
            OptionValue::Int(value) if hex && *value < 0 => format!("-0x{:X}", value.unsigned_abs()),
            OptionValue::Int(value) if hex => format!("0x{:X}", value),
            OptionValue::Int(value) => value.to_string(),
            OptionValue::Float(value) => value.to_string(),
        }
    }

    fn to_json(self, hex: bool) -> Value {
        match self {
            OptionValue::Int(_) if hex => Value::String(self.format(true)),
            OptionValue::Int(value) => Value::from(value),
            OptionValue::Float(value) => Value::from(value as f64),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

/// Named value of an enumerated option.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumMember {
    pub value: OptionValue,
    pub name: String,
    pub comment: Option<String>,
}

/// A validated configuration option.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub name: String,
    pub kind: OptionKind,
    pub default: OptionValue,
    pub value: OptionValue,
    pub members: Vec<EnumMember>,
    pub annotation: Option<String>,
    /// Written in hexadecimal in the source
    pub hex: bool,
}

impl Configuration {
    /// A value must fit the option's width and respect its declared range or mask.
    fn check_fits(&self, value: OptionValue) -> Result<(), OptionError> {
        if self.kind.pack(value, self.kind.width()).is_none() {
            return Err(OptionError::OutOfRange(
                self.name.clone(),
                value,
                self.kind.width(),
            ));
        }
        match (&self.kind, value) {
            (
                OptionKind::Int {
                    range: Some((lo, hi)),
                    ..
                },
                OptionValue::Int(int),
            ) if int < *lo || int > *hi => Err(OptionError::OutsideRange(
                self.name.clone(),
                value,
                *lo,
                *hi,
            )),
            (
                OptionKind::Mask {
                    mask: Some(mask), ..
                },
                OptionValue::Int(int),
            ) if int as u64 & !mask != 0 => {
                Err(OptionError::OutsideMask(self.name.clone(), value, *mask))
            }
            _ => Ok(()),
        }
    }

    pub fn set_value(&mut self, value: OptionValue) -> Result<(), OptionError> {
        self.check_fits(value)?;
        self.value = value;
        Ok(())
    }

    /// Current value packed to the option's own width.
    pub fn packed(&self) -> Option<Vec<u8>> {
        self.kind.pack(self.value, self.kind.width())
    }

    /// Parse a legacy text declaration: `type name = default[; lo-hi | (mask)] [# comment]`.
    pub fn parse_declaration(line: &str) -> Result<Configuration, OptionError> {
        let invalid = || OptionError::InvalidDeclaration(line.trim().to_owned());
        let (declaration, annotation) = match line.split_once('#') {
            Some((declaration, comment)) => (declaration, Some(comment.trim().to_owned())),
            None => (line, None),
        };
        let (left, right) = declaration.split_once('=').ok_or_else(invalid)?;
        let (type_name, name) = left.trim().split_once(char::is_whitespace).ok_or_else(invalid)?;
        let name = name.trim().to_owned();
        if name.is_empty() {
            return Err(invalid());
        }
        let option_type = OptionType::from_str(type_name)
            .map_err(|_| OptionError::UnrecognizedType(name.clone(), type_name.to_owned()))?;
        let mut kind = OptionKind::from(option_type);

        let (default_text, extra) = match right.split_once(';') {
            Some((default, extra)) => (default.trim(), Some(extra.trim())),
            None => (right.trim(), None),
        };
        let default = kind
            .parse_value(default_text)
            .ok_or_else(|| OptionError::InvalidValue(name.clone(), default_text.to_owned()))?;

        if let Some(extra) = extra.filter(|extra| !extra.is_empty()) {
            match &mut kind {
                OptionKind::Mask { mask, .. } => {
                    let inner = extra
                        .strip_prefix('(')
                        .and_then(|rest| rest.strip_suffix(')'))
                        .ok_or_else(invalid)?;
                    *mask = Some(parse_int(inner).ok_or_else(invalid)? as u64);
                }
                OptionKind::Int { range, .. } => {
                    *range = Some(parse_range(extra).ok_or_else(invalid)?);
                }
                OptionKind::Float => return Err(invalid()),
            }
        }

        let configuration = Configuration {
            name,
            kind,
            default,
            value: default,
            members: vec![],
            annotation: annotation.filter(|comment| !comment.is_empty()),
            hex: default_text.to_ascii_lowercase().contains("0x"),
        };
        configuration.check_fits(default)?;

        Ok(configuration)
    }

    /// Parse an enumerated member line: `value: Name [# comment]`.
    pub fn parse_member(&self, line: &str) -> Result<EnumMember, OptionError> {
        let invalid = || OptionError::InvalidDeclaration(line.trim().to_owned());
        let (value, rest) = line.split_once(':').ok_or_else(invalid)?;
        let (name, comment) = match rest.split_once('#') {
            Some((name, comment)) => (name, Some(comment.trim().to_owned())),
            None => (rest, None),
        };
        let value = self
            .kind
            .parse_value(value)
            .ok_or_else(|| OptionError::InvalidValue(self.name.clone(), value.trim().to_owned()))?;

        Ok(EnumMember {
            value,
            name: name.trim().to_owned(),
            comment: comment.filter(|comment| !comment.is_empty()),
        })
    }

    /// Legacy text declaration, the inverse of [`Configuration::parse_declaration`].
    pub fn declaration(&self) -> String {
        let mut line = format!(
            "{} {} = {}",
            self.kind.option_type(),
            self.name,
            self.default.format(self.hex)
        );
        match &self.kind {
            OptionKind::Int {
                range: Some((lo, hi)),
                ..
            } => line.push_str(&format!(
                "; {}-{}",
                OptionValue::Int(*lo).format(self.hex),
                OptionValue::Int(*hi).format(self.hex)
            )),
            OptionKind::Mask {
                mask: Some(mask), ..
            } => line.push_str(&format!("; (0x{:X})", mask)),
            _ => (),
        }
        if let Some(annotation) = &self.annotation {
            line.push_str(&format!(" # {}", annotation));
        }
        line
    }

    pub fn member_line(&self, member: &EnumMember) -> String {
        let mut line = format!("{}: {}", member.value.format(self.hex), member.name);
        if let Some(comment) = &member.comment {
            line.push_str(&format!(" # {}", comment));
        }
        line
    }

    /// Validate a configuration entry read from JSON.
    pub fn from_raw(name: &str, raw: &RawConfiguration) -> Result<Configuration, OptionError> {
        let type_name = raw
            .type_name
            .as_deref()
            .ok_or_else(|| OptionError::MissingType(name.to_owned()))?;
        let option_type = OptionType::from_str(type_name)
            .map_err(|_| OptionError::UnrecognizedType(name.to_owned(), type_name.to_owned()))?;
        let base = OptionKind::from(option_type);

        let read = |value: &Value| {
            base.value_from_json(value)
                .ok_or_else(|| OptionError::InvalidValue(name.to_owned(), value.to_string()))
        };
        let int = |value: &Value| match read(value)? {
            OptionValue::Int(int) => Ok(int),
            OptionValue::Float(_) => Err(OptionError::InvalidValue(name.to_owned(), value.to_string())),
        };
        let value = read(
            raw.value
                .as_ref()
                .ok_or_else(|| OptionError::MissingValue(name.to_owned()))?,
        )?;
        let default = read(
            raw.default
                .as_ref()
                .ok_or_else(|| OptionError::MissingDefault(name.to_owned()))?,
        )?;
        let mut members = vec![];
        for member in raw.members.iter().flatten() {
            members.push(EnumMember {
                value: read(&member.value)?,
                name: member.name.clone(),
                comment: member.comment.clone(),
            });
        }

        let kind = match &base {
            OptionKind::Int { width, signed, .. } => OptionKind::Int {
                width: *width,
                signed: *signed,
                range: match &raw.range {
                    Some([lo, hi]) => Some((int(lo)?, int(hi)?)),
                    None => None,
                },
            },
            OptionKind::Mask { width, .. } => OptionKind::Mask {
                width: *width,
                mask: raw.mask.as_ref().map(int).transpose()?.map(|mask| mask as u64),
            },
            OptionKind::Float => OptionKind::Float,
        };

        let hex = [&raw.value, &raw.default]
            .into_iter()
            .flatten()
            .any(|value| matches!(value, Value::String(text) if text.to_ascii_lowercase().contains("0x")));

        let configuration = Configuration {
            name: name.to_owned(),
            kind,
            default,
            value,
            members,
            annotation: raw.annotation.clone(),
            hex,
        };
        configuration.check_fits(default)?;
        configuration.check_fits(value)?;

        Ok(configuration)
    }

    pub fn to_raw(&self) -> RawConfiguration {
        let (range, mask) = match &self.kind {
            OptionKind::Int { range, .. } => (
                range.map(|(lo, hi)| {
                    [
                        OptionValue::Int(lo).to_json(self.hex),
                        OptionValue::Int(hi).to_json(self.hex),
                    ]
                }),
                None,
            ),
            OptionKind::Mask { mask, .. } => (
                None,
                mask.map(|mask| Value::String(format!("0x{:X}", mask))),
            ),
            OptionKind::Float => (None, None),
        };

        RawConfiguration {
            type_name: Some(self.kind.option_type().to_string()),
            value: Some(self.value.to_json(self.hex)),
            default: Some(self.default.to_json(self.hex)),
            range,
            mask,
            members: if self.members.is_empty() {
                None
            } else {
                Some(
                    self.members
                        .iter()
                        .map(|member| RawMember {
                            name: member.name.clone(),
                            value: member.value.to_json(self.hex),
                            comment: member.comment.clone(),
                        })
                        .collect(),
                )
            },
            annotation: self.annotation.clone(),
        }
    }
}

fn parse_range(text: &str) -> Option<(i64, i64)> {
    // The separator is the first '-' that is not a sign.
    let text = text.trim();
    let split = text
        .char_indices()
        .skip(1)
        .find(|(ix, ch)| *ch == '-' && !text[..*ix].trim_end().ends_with('-'))
        .map(|(ix, _)| ix)?;
    let lo = parse_int(&text[..split])?;
    let hi = parse_int(&text[split + 1..])?;
    Some((lo, hi))
}

/// Unvalidated configuration entry as stored in `codes.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfiguration {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[Value; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<RawMember>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMember {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Look up an option by name.
pub fn find<'a>(configurations: &'a [Configuration], name: &str) -> Option<&'a Configuration> {
    configurations.iter().find(|option| option.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_declaration() {
        let option = Configuration::parse_declaration("uint8 Player Speed = 5; 1-10 # Speed multiplier")
            .unwrap();
        assert_eq!(option.name, "Player Speed");
        assert_eq!(
            option.kind,
            OptionKind::Int {
                width: 1,
                signed: false,
                range: Some((1, 10))
            }
        );
        assert_eq!(option.default, OptionValue::Int(5));
        assert_eq!(option.annotation.as_deref(), Some("Speed multiplier"));
        assert_eq!(
            option.declaration(),
            "uint8 Player Speed = 5; 1-10 # Speed multiplier"
        );

        let option = Configuration::parse_declaration("mask16 Flags = 0x0101; (0x0F0F)").unwrap();
        assert_eq!(option.kind, OptionKind::Mask { width: 2, mask: Some(0x0F0F) });
        assert_eq!(option.declaration(), "mask16 Flags = 0x101; (0xF0F)");

        let option = Configuration::parse_declaration("int16 Offset = -4; -10--1").unwrap();
        assert_eq!(
            option.kind,
            OptionKind::Int { width: 2, signed: true, range: Some((-10, -1)) }
        );

        let option = Configuration::parse_declaration("float Gravity = 0.5").unwrap();
        assert_eq!(option.default, OptionValue::Float(0.5));
    }

    #[test]
    fn test_declaration_errors() {
        assert_eq!(
            Configuration::parse_declaration("short Speed = 5"),
            Err(OptionError::UnrecognizedType("Speed".to_string(), "short".to_string()))
        );
        assert_eq!(
            Configuration::parse_declaration("uint8 Speed = 300"),
            Err(OptionError::OutOfRange("Speed".to_string(), OptionValue::Int(300), 1))
        );
        assert_eq!(
            Configuration::parse_declaration("uint8 Speed"),
            Err(OptionError::InvalidDeclaration("uint8 Speed".to_string()))
        );
    }

    #[test]
    fn test_range_and_mask_enforced() {
        assert_eq!(
            Configuration::parse_declaration("uint8 Frames = 50; 0-10"),
            Err(OptionError::OutsideRange("Frames".to_string(), OptionValue::Int(50), 0, 10))
        );
        assert_eq!(
            Configuration::parse_declaration("mask8 Flags = 0xF0; (0x0F)"),
            Err(OptionError::OutsideMask("Flags".to_string(), OptionValue::Int(0xF0), 0x0F))
        );

        let mut option = Configuration::parse_declaration("uint8 Frames = 2; 0-10").unwrap();
        assert_eq!(
            option.set_value(OptionValue::Int(200)),
            Err(OptionError::OutsideRange("Frames".to_string(), OptionValue::Int(200), 0, 10))
        );
        assert_eq!(option.value, OptionValue::Int(2));
        assert_eq!(option.set_value(OptionValue::Int(10)), Ok(()));

        let mut option = Configuration::parse_declaration("mask8 Flags = 0x01; (0x0F)").unwrap();
        assert_eq!(option.set_value(OptionValue::Int(0x0C)), Ok(()));
        assert!(option.set_value(OptionValue::Int(0x10)).is_err());

        let raw: RawConfiguration = serde_json::from_value(json!({
            "type": "int16",
            "value": 100,
            "default": 0,
            "range": [-10, 10]
        }))
        .unwrap();
        assert_eq!(
            Configuration::from_raw("Offset", &raw),
            Err(OptionError::OutsideRange("Offset".to_string(), OptionValue::Int(100), -10, 10))
        );
    }

    #[test]
    fn test_members() {
        let option = Configuration::parse_declaration("uint8 Stage = 2").unwrap();
        let member = option.parse_member("  2: Battlefield # default").unwrap();
        assert_eq!(
            member,
            EnumMember {
                value: OptionValue::Int(2),
                name: "Battlefield".to_string(),
                comment: Some("default".to_string()),
            }
        );
        assert_eq!(option.member_line(&member), "2: Battlefield # default");
    }

    #[test]
    fn test_pack() {
        let uint16 = OptionKind::from(OptionType::Uint16);
        assert_eq!(uint16.pack(OptionValue::Int(0x1234), 2), Some(vec![0x12, 0x34]));
        assert_eq!(uint16.pack(OptionValue::Int(0x10000), 2), None);
        assert_eq!(uint16.pack(OptionValue::Int(-1), 2), None);

        let int8 = OptionKind::from(OptionType::Int8);
        assert_eq!(int8.pack(OptionValue::Int(-1), 1), Some(vec![0xFF]));
        assert_eq!(int8.pack(OptionValue::Int(-1), 4), Some(vec![0xFF; 4]));

        let float = OptionKind::from(OptionType::Float);
        assert_eq!(
            float.pack(OptionValue::Float(1.0), 4),
            Some(vec![0x3F, 0x80, 0x00, 0x00])
        );
        assert_eq!(float.pack(OptionValue::Float(1.0), 2), None);
    }

    #[test]
    fn test_from_raw() {
        let raw: RawConfiguration = serde_json::from_value(json!({
            "type": "int32",
            "value": "0x10",
            "default": 8,
            "range": [0, 64],
            "members": [{ "name": "Eight", "value": 8 }]
        }))
        .unwrap();
        let option = Configuration::from_raw("Size", &raw).unwrap();
        assert_eq!(option.value, OptionValue::Int(16));
        assert_eq!(option.default, OptionValue::Int(8));
        assert!(option.hex);
        assert_eq!(option.members.len(), 1);

        let missing_default = RawConfiguration {
            type_name: Some("uint8".to_string()),
            value: Some(json!(1)),
            ..Default::default()
        };
        assert_eq!(
            Configuration::from_raw("Size", &missing_default),
            Err(OptionError::MissingDefault("Size".to_string()))
        );
        assert_eq!(
            Configuration::from_raw("Size", &RawConfiguration::default()),
            Err(OptionError::MissingType("Size".to_string()))
        );
    }
}
