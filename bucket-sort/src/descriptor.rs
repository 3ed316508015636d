//! Record and key layout descriptions used to specialize the kernel library.

use sort_runtime::Substitutions;

use crate::SortError;

/// Immutable description of the records one [`BucketSorter`](crate::BucketSorter) sorts.
///
/// The string fields are spliced into the kernel source as-is, so they must be
/// valid Metal Shading Language. `sort_key` is an expression over a record
/// named `value`, e.g. `value` or `value.x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    /// MSL type of one record (`DATA_TYPE`).
    pub data_type: String,
    /// MSL type of the extracted key (`KEY_TYPE`).
    pub key_type: String,
    /// Key extraction expression (`SORT_KEY`).
    pub sort_key: String,
    /// A key no larger than any real key (`MIN_KEY`).
    pub min_key: String,
    /// A key no smaller than any real key (`MAX_KEY`).
    pub max_key: String,
    /// A record whose key is `max_key`, used as sort padding (`MAX_VALUE`).
    pub max_value: String,
    /// Bytes per record.
    pub data_size: usize,
    /// Bytes per key.
    pub key_size: usize,
}

impl RecordDescriptor {
    /// Checks `data_size >= key_size > 0` and that every name is present.
    pub fn validate(&self) -> Result<(), SortError> {
        if self.key_size == 0 {
            return Err(SortError::InvalidArgument("key size must be positive".into()));
        }
        if self.data_size < self.key_size {
            return Err(SortError::InvalidArgument(format!(
                "record size {} is smaller than key size {}",
                self.data_size, self.key_size
            )));
        }
        for (name, value) in [
            ("DATA_TYPE", &self.data_type),
            ("KEY_TYPE", &self.key_type),
            ("SORT_KEY", &self.sort_key),
            ("MIN_KEY", &self.min_key),
            ("MAX_KEY", &self.max_key),
            ("MAX_VALUE", &self.max_value),
        ] {
            if value.trim().is_empty() {
                return Err(SortError::InvalidArgument(format!("{} is empty", name)));
            }
        }
        Ok(())
    }

    pub fn substitutions(&self) -> Substitutions {
        Substitutions::new()
            .with("DATA_TYPE", self.data_type.as_str())
            .with("KEY_TYPE", self.key_type.as_str())
            .with("SORT_KEY", self.sort_key.as_str())
            .with("MIN_KEY", self.min_key.as_str())
            .with("MAX_KEY", self.max_key.as_str())
            .with("MAX_VALUE", self.max_value.as_str())
    }

    fn scalar(ty: &str, min_key: &str, max_key: &str, size: usize) -> Self {
        Self {
            data_type: ty.to_string(),
            key_type: ty.to_string(),
            sort_key: "value".to_string(),
            min_key: min_key.to_string(),
            max_key: max_key.to_string(),
            max_value: max_key.to_string(),
            data_size: size,
            key_size: size,
        }
    }

    pub fn scalar_u32() -> Self {
        Self::scalar("uint", "0u", "0xFFFFFFFFu", 4)
    }

    pub fn scalar_i32() -> Self {
        Self::scalar("int", "(-2147483647 - 1)", "2147483647", 4)
    }

    pub fn scalar_f32() -> Self {
        Self::scalar("float", "-INFINITY", "INFINITY", 4)
    }

    pub fn scalar_u64() -> Self {
        Self::scalar("ulong", "0ul", "0xFFFFFFFFFFFFFFFFul", 8)
    }

    pub fn scalar_i64() -> Self {
        Self::scalar("long", "(-9223372036854775807l - 1)", "9223372036854775807l", 8)
    }

    /// `uint2` records sorted by `.x`; `.y` travels with the key as payload.
    pub fn keyed_u32_pair() -> Self {
        Self {
            data_type: "uint2".to_string(),
            key_type: "uint".to_string(),
            sort_key: "value.x".to_string(),
            min_key: "0u".to_string(),
            max_key: "0xFFFFFFFFu".to_string(),
            max_value: "uint2(0xFFFFFFFFu, 0xFFFFFFFFu)".to_string(),
            data_size: 8,
            key_size: 4,
        }
    }

    /// `float2` records sorted by `.x`.
    pub fn keyed_f32_pair() -> Self {
        Self {
            data_type: "float2".to_string(),
            key_type: "float".to_string(),
            sort_key: "value.x".to_string(),
            min_key: "-INFINITY".to_string(),
            max_key: "INFINITY".to_string(),
            max_value: "float2(INFINITY, INFINITY)".to_string(),
            data_size: 8,
            key_size: 4,
        }
    }
}
