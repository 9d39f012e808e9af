use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A monetary amount in a concrete asset.
///
/// Serialized with the value as a string, the way amounts travel in
/// Open Payments resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amount {
    #[serde(
        serialize_with = "serialize_string_u64",
        deserialize_with = "deserialize_string_u64"
    )]
    pub value: u64,
    pub asset_code: String,
    pub asset_scale: u8,
}

impl Amount {
    pub fn new(value: u64, asset_code: impl Into<String>, asset_scale: u8) -> Self {
        Amount {
            value,
            asset_code: asset_code.into(),
            asset_scale,
        }
    }

    /// Same currency, i.e. the same code at the same scale.
    pub fn same_asset(&self, other: &Amount) -> bool {
        self.asset_code == other.asset_code && self.asset_scale == other.asset_scale
    }
}

fn serialize_string_u64<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

fn deserialize_string_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(string) => string.parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(number) => Ok(number),
    }
}
