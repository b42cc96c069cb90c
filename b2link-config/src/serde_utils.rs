// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;

use byte_unit::Byte;
use serde::{Deserialize, Deserializer, de};

fn expand<E: de::Error>(value: &str) -> Result<String, E> {
    shellexpand::env(value)
        .map(|expanded| expanded.into_owned())
        .map_err(de::Error::custom)
}

/// Helper for serde macro so you can use shellexpand variables in the json
/// configuration files when the value is a string.
pub fn convert_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    let value = String::deserialize(deserializer)?;
    expand(&value)
}

/// Same as `convert_string_with_shellexpand`, but supports `Option<String>`.
/// An expansion that results in an empty string is treated as `None`.
pub fn convert_optional_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let Some(value) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let expanded = expand::<D::Error>(&value)?;
    if expanded.is_empty() {
        Ok(None)
    } else {
        Ok(Some(expanded))
    }
}

/// Helper for serde macro so you can use shellexpand variables in the json
/// configuration files when the number is a numeric type.
pub fn convert_numeric_with_shellexpand<'de, D, T, E>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    E: fmt::Display,
    T: TryFrom<u64> + FromStr<Err = E>,
    <T as TryFrom<u64>>::Error: fmt::Display,
{
    struct NumericVisitor<T>(PhantomData<T>);

    impl<T, FromStrErr> de::Visitor<'_> for NumericVisitor<T>
    where
        FromStrErr: fmt::Display,
        T: TryFrom<u64> + FromStr<Err = FromStrErr>,
        <T as TryFrom<u64>>::Error: fmt::Display,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or a string containing a number")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            v.try_into().map_err(de::Error::custom)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            let v = u64::try_from(v).map_err(de::Error::custom)?;
            v.try_into().map_err(de::Error::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            expand::<E>(v)?.trim().parse::<T>().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(NumericVisitor::<T>(PhantomData))
}

/// Deserializes a duration into whole seconds. Accepts a plain number of
/// seconds or a human readable string such as `"1m 30s"` or `"$TIMEOUT"`.
pub fn convert_duration_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u64, D::Error> {
    struct DurationVisitor;

    impl de::Visitor<'_> for DurationVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number of seconds or a human readable duration")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v).map_err(de::Error::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let expanded = expand::<E>(v)?;
            let trimmed = expanded.trim();
            if let Ok(secs) = trimmed.parse::<u64>() {
                return Ok(secs);
            }
            humantime::parse_duration(trimmed)
                .map(|duration| duration.as_secs())
                .map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Deserializes a byte size. Accepts a plain number of bytes or a string
/// such as `"100MB"`, `"5MiB"` or `"$PART_SIZE"`.
pub fn convert_data_size_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u64, D::Error> {
    struct DataSizeVisitor;

    impl de::Visitor<'_> for DataSizeVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number of bytes or a data size string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v).map_err(de::Error::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let expanded = expand::<E>(v)?;
            let byte_size = Byte::parse_str(expanded.trim(), true).map_err(de::Error::custom)?;
            u64::try_from(byte_size.as_u128()).map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(DataSizeVisitor)
}
