// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Tessera data types, [Schema] and [Field]

use std::fmt::{self, Formatter};
use std::sync::Arc;

use arrow_schema::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::location;

mod field;
mod schema;

use crate::{Error, Result};
pub use field::Field;
pub use schema::Schema;

/// LogicalType is a string presentation of arrow type,
/// so it can be serialized into the manifest.
///
/// Nested types (`list`, `large_list`, `struct`, `fixed_size_list:{n}`) only
/// describe the container, the element types live in the children of the
/// owning [`Field`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalType(String);

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl LogicalType {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_list(&self) -> bool {
        self.0 == "list"
    }

    fn is_large_list(&self) -> bool {
        self.0 == "large_list"
    }

    fn is_struct(&self) -> bool {
        self.0 == "struct"
    }

    /// Check whether the logical type is a FixedSizeList, and if so, return the size.
    fn fsl_size(&self) -> Option<i32> {
        self.0
            .strip_prefix("fixed_size_list:")
            .and_then(|size| size.parse::<i32>().ok())
    }

    fn is_nested(&self) -> bool {
        self.is_list() || self.is_large_list() || self.is_struct() || self.fsl_size().is_some()
    }
}

impl TryFrom<String> for LogicalType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        let lt = Self(s);
        if !lt.is_nested() {
            // Fail early on types we cannot map back to arrow.
            DataType::try_from(&lt)?;
        }
        Ok(lt)
    }
}

impl From<LogicalType> for String {
    fn from(lt: LogicalType) -> Self {
        lt.0
    }
}

/// Types without parameters, and the name each is stored under.
const SIMPLE_TYPES: [(DataType, &str); 27] = [
    (DataType::Null, "null"),
    (DataType::Boolean, "bool"),
    (DataType::Int8, "int8"),
    (DataType::UInt8, "uint8"),
    (DataType::Int16, "int16"),
    (DataType::UInt16, "uint16"),
    (DataType::Int32, "int32"),
    (DataType::UInt32, "uint32"),
    (DataType::Int64, "int64"),
    (DataType::UInt64, "uint64"),
    (DataType::Float16, "halffloat"),
    (DataType::Float32, "float"),
    (DataType::Float64, "double"),
    (DataType::Utf8, "string"),
    (DataType::Binary, "binary"),
    (DataType::LargeUtf8, "large_string"),
    (DataType::LargeBinary, "large_binary"),
    (DataType::Date32, "date32:day"),
    (DataType::Date64, "date64:ms"),
    (DataType::Time32(TimeUnit::Second), "time32:s"),
    (DataType::Time32(TimeUnit::Millisecond), "time32:ms"),
    (DataType::Time64(TimeUnit::Microsecond), "time64:us"),
    (DataType::Time64(TimeUnit::Nanosecond), "time64:ns"),
    (DataType::Duration(TimeUnit::Second), "duration:s"),
    (DataType::Duration(TimeUnit::Millisecond), "duration:ms"),
    (DataType::Duration(TimeUnit::Microsecond), "duration:us"),
    (DataType::Duration(TimeUnit::Nanosecond), "duration:ns"),
];

const TIME_UNITS: [(TimeUnit, &str); 4] = [
    (TimeUnit::Second, "s"),
    (TimeUnit::Millisecond, "ms"),
    (TimeUnit::Microsecond, "us"),
    (TimeUnit::Nanosecond, "ns"),
];

fn time_unit_name(unit: &TimeUnit) -> &'static str {
    TIME_UNITS
        .iter()
        .find(|(u, _)| u == unit)
        .map(|(_, name)| *name)
        .unwrap_or_default()
}

fn unsupported(what: impl fmt::Display) -> Error {
    Error::Schema {
        message: format!("Unsupported logical type: {what}"),
        location: location!(),
    }
}

impl TryFrom<&DataType> for LogicalType {
    type Error = Error;

    fn try_from(dt: &DataType) -> Result<Self> {
        if let Some((_, name)) = SIMPLE_TYPES.iter().find(|(t, _)| t == dt) {
            return Ok(Self(name.to_string()));
        }
        let name = match dt {
            DataType::Decimal128(precision, scale) => format!("decimal:128:{precision}:{scale}"),
            DataType::Decimal256(precision, scale) => format!("decimal:256:{precision}:{scale}"),
            DataType::Timestamp(unit, tz) => format!(
                "timestamp:{}:{}",
                time_unit_name(unit),
                tz.as_deref().unwrap_or("-")
            ),
            DataType::FixedSizeBinary(len) => format!("fixed_size_binary:{len}"),
            DataType::Dictionary(key, value) => format!(
                "dict:{}:{}:false",
                Self::try_from(value.as_ref())?,
                Self::try_from(key.as_ref())?
            ),
            DataType::Struct(_) => "struct".to_string(),
            DataType::List(_) => "list".to_string(),
            DataType::LargeList(_) => "large_list".to_string(),
            DataType::FixedSizeList(_, len) => format!("fixed_size_list:{len}"),
            _ => {
                return Err(Error::Schema {
                    message: format!("Unsupported data type: {:?}", dt),
                    location: location!(),
                })
            }
        };
        Ok(Self(name))
    }
}

/// Map a non-nested logical type back to arrow.
impl TryFrom<&LogicalType> for DataType {
    type Error = Error;

    fn try_from(lt: &LogicalType) -> Result<Self> {
        if let Some((t, _)) = SIMPLE_TYPES.iter().find(|(_, name)| *name == lt.as_str()) {
            return Ok(t.clone());
        }

        let number = |part: &str| part.parse::<i32>().map_err(|_| unsupported(lt));
        let nested = |part: &str| Self::try_from(&LogicalType(part.to_string()));
        match lt.as_str().split(':').collect::<Vec<_>>().as_slice() {
            ["fixed_size_binary", len] => Ok(Self::FixedSizeBinary(number(*len)?)),
            ["dict", value, key, _] => Ok(Self::Dictionary(
                Box::new(nested(*key)?),
                Box::new(nested(*value)?),
            )),
            ["decimal", bits, precision, scale] => {
                let precision = u8::try_from(number(*precision)?).map_err(|_| unsupported(lt))?;
                let scale = i8::try_from(number(*scale)?).map_err(|_| unsupported(lt))?;
                match *bits {
                    "128" => Ok(Self::Decimal128(precision, scale)),
                    "256" => Ok(Self::Decimal256(precision, scale)),
                    _ => Err(Error::Schema {
                        message: format!(
                            "Only Decimal128 and Decimal256 is supported. Found {bits}"
                        ),
                        location: location!(),
                    }),
                }
            }
            ["timestamp", unit, tz] => {
                let (unit, _) = TIME_UNITS
                    .iter()
                    .find(|(_, name)| name == unit)
                    .ok_or_else(|| unsupported(lt))?;
                let tz: Option<Arc<str>> = (*tz != "-").then(|| (*tz).into());
                Ok(Self::Timestamp(*unit, tz))
            }
            _ => Err(unsupported(lt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case(DataType::Int64, "int64")]
    #[case(DataType::Utf8, "string")]
    #[case(DataType::Float16, "halffloat")]
    #[case(DataType::Decimal128(10, 2), "decimal:128:10:2")]
    #[case(DataType::Timestamp(TimeUnit::Microsecond, None), "timestamp:us:-")]
    #[case(DataType::Timestamp(TimeUnit::Second, Some("UTC".into())), "timestamp:s:UTC")]
    #[case(DataType::FixedSizeBinary(16), "fixed_size_binary:16")]
    #[case(DataType::Duration(TimeUnit::Nanosecond), "duration:ns")]
    #[case(DataType::Decimal256(40, -3), "decimal:256:40:-3")]
    #[case(
        DataType::Dictionary(Box::new(DataType::UInt16), Box::new(DataType::Utf8)),
        "dict:string:uint16:false"
    )]
    fn test_logical_type_mapping(#[case] data_type: DataType, #[case] expected: &str) {
        let lt = LogicalType::try_from(&data_type).unwrap();
        assert_eq!(lt.as_str(), expected);
        assert_eq!(DataType::try_from(&lt).unwrap(), data_type);
    }

    #[test]
    fn test_reject_unknown_logical_type() {
        let err = serde_json::from_str::<LogicalType>("\"not_a_type\"").unwrap_err();
        assert!(err.to_string().contains("not_a_type"), "{}", err);
        for invalid in ["decimal:64:10:2", "timestamp:days:-", "fixed_size_binary:x"] {
            assert!(serde_json::from_str::<LogicalType>(&format!("\"{invalid}\"")).is_err());
        }
        let lt: LogicalType = serde_json::from_str("\"fixed_size_list:4\"").unwrap();
        assert_eq!(lt.fsl_size(), Some(4));
    }
}
