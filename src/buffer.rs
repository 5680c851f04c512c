//! Named tensor buffers and the per-name exclusive slots that guard them.
//!
//! Each registered name owns one `tokio::sync::Mutex`. Consensus rounds,
//! exact broadcasts and window syncs hold it for their whole duration, which
//! makes operations on the same name strictly sequential while different
//! names proceed concurrently.

use crate::error::{DiffuseError, Result};
use crate::types::DataType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Element storage of a tensor buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::F64(_) => DataType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements widened to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::F64(v) => v.clone(),
        }
    }

    /// Overwrite with `values`, narrowing to the storage type.
    fn assign_f64(&mut self, values: &[f64]) {
        match self {
            TensorData::F32(v) => {
                v.clear();
                v.extend(values.iter().map(|&x| x as f32));
            }
            TensorData::F64(v) => {
                v.clear();
                v.extend_from_slice(values);
            }
        }
    }

    /// Native little-endian element bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::F64(v) => encode_f64(v),
        }
    }

    /// Rebuild from native little-endian element bytes.
    pub fn from_le_bytes(dtype: DataType, bytes: &[u8]) -> Result<Self> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(DiffuseError::DecodeFailed(format!(
                "{} payload of {} bytes is not a multiple of {width}",
                dtype,
                bytes.len()
            )));
        }
        Ok(match dtype {
            DataType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::F64 => TensorData::F64(decode_f64(bytes)?),
        })
    }
}

/// Encode `f64` elements as little-endian bytes.
pub fn encode_f64(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode little-endian `f64` elements.
pub fn decode_f64(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(DiffuseError::DecodeFailed(format!(
            "f64 payload of {} bytes is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// A named tensor owned by the local rank.
///
/// Shared with other ranks only by value. `version` increases with every
/// in-place update made by this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    pub name: String,
    pub shape: Vec<usize>,
    pub version: u64,
    pub data: TensorData,
}

impl TensorBuffer {
    /// Build a buffer, checking that `shape` matches the element count.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let name = name.into();
        let Some(numel) = shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d)) else {
            return Err(DiffuseError::BufferMismatch {
                name,
                reason: format!("shape {shape:?} overflows the element count"),
            });
        };
        if numel != data.len() {
            return Err(DiffuseError::BufferMismatch {
                name,
                reason: format!("shape {shape:?} holds {numel} elements, data has {}", data.len()),
            });
        }
        Ok(Self {
            name,
            shape,
            version: 0,
            data,
        })
    }

    /// One-dimensional `f32` buffer.
    pub fn from_f32(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape: vec![values.len()],
            version: 0,
            data: TensorData::F32(values),
        }
    }

    /// One-dimensional `f64` buffer.
    pub fn from_f64(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            shape: vec![values.len()],
            version: 0,
            data: TensorData::F64(values),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_f64(&self) -> Vec<f64> {
        self.data.to_f64()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::F64(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Replace the contents with merged values and bump the version.
    pub fn assign_f64(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(self.mismatch(format!(
                "expected {} elements, got {}",
                self.len(),
                values.len()
            )));
        }
        self.data.assign_f64(values);
        self.version += 1;
        Ok(())
    }

    /// Fail unless `other` has the same dtype and shape.
    pub fn check_compatible(&self, dtype: DataType, shape: &[usize]) -> Result<()> {
        if self.dtype() != dtype {
            return Err(self.mismatch(format!("dtype {} vs {}", self.dtype(), dtype)));
        }
        if self.shape != shape {
            return Err(self.mismatch(format!("shape {:?} vs {shape:?}", self.shape)));
        }
        Ok(())
    }

    /// Check that an `f64` wire payload has this buffer's element count.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if len != self.len() {
            return Err(self.mismatch(format!("expected {} elements, got {len}", self.len())));
        }
        Ok(())
    }

    pub(crate) fn mismatch(&self, reason: String) -> DiffuseError {
        DiffuseError::BufferMismatch {
            name: self.name.clone(),
            reason,
        }
    }

    pub(crate) fn wire_shape(&self) -> Vec<u64> {
        self.shape.iter().map(|&d| d as u64).collect()
    }

    /// Rebuild a buffer from the fields of a wire message.
    pub(crate) fn from_wire(
        name: &str,
        dtype: u8,
        shape: &[u64],
        version: u64,
        payload: &[u8],
    ) -> Result<Self> {
        let dtype = DataType::from_u8(dtype)
            .ok_or_else(|| DiffuseError::DecodeFailed(format!("unknown dtype {dtype}")))?;
        let shape = shape
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<std::result::Result<Vec<usize>, _>>()
            .map_err(|_| DiffuseError::DecodeFailed(format!("dimension in {shape:?} out of range")))?;
        let data = TensorData::from_le_bytes(dtype, payload)?;
        let mut buf = Self::new(name, shape, data)?;
        buf.version = version;
        Ok(buf)
    }
}

/// Exclusive access to one named buffer.
pub type BufferGuard = OwnedMutexGuard<TensorBuffer>;

/// Registry of the named buffers of this rank.
#[derive(Default)]
pub struct BufferRegistry {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<TensorBuffer>>>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<TensorBuffer>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<TensorBuffer>>> {
        self.slots()
            .get(name)
            .cloned()
            .ok_or_else(|| DiffuseError::UnknownBuffer {
                name: name.to_string(),
            })
    }

    /// Register `buffer`, or overwrite the value of an existing one.
    ///
    /// Overwriting waits for any operation currently holding the name and
    /// keeps the version strictly increasing.
    pub async fn register(&self, buffer: TensorBuffer) {
        let existing = {
            let mut slots = self.slots();
            match slots.get(&buffer.name) {
                Some(slot) => Arc::clone(slot),
                None => {
                    slots.insert(
                        buffer.name.clone(),
                        Arc::new(tokio::sync::Mutex::new(buffer)),
                    );
                    return;
                }
            }
        };
        let mut guard = existing.lock().await;
        let version = buffer.version.max(guard.version + 1);
        *guard = TensorBuffer { version, ..buffer };
    }

    /// Lock `name` for exclusive use.
    pub async fn lock(&self, name: &str) -> Result<BufferGuard> {
        Ok(self.slot(name)?.lock_owned().await)
    }

    /// Lock `name`, creating an empty placeholder if it is not registered.
    ///
    /// Used by receivers of an exact broadcast, which may not hold the buffer
    /// yet. The placeholder is removed again by [`discard_placeholder`](Self::discard_placeholder)
    /// if nothing gets installed.
    pub(crate) async fn lock_or_placeholder(&self, name: &str) -> (BufferGuard, bool) {
        let (slot, created) = {
            let mut slots = self.slots();
            match slots.get(name) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(tokio::sync::Mutex::new(TensorBuffer::from_f64(
                        name,
                        Vec::new(),
                    )));
                    slots.insert(name.to_string(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };
        (slot.lock_owned().await, created)
    }

    pub(crate) fn discard_placeholder(&self, name: &str) {
        self.slots().remove(name);
    }

    /// Copy of the current value of `name`.
    pub async fn get(&self, name: &str) -> Result<TensorBuffer> {
        Ok(self.slot(name)?.lock().await.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove `name`, returning its last value.
    pub async fn remove(&self, name: &str) -> Result<TensorBuffer> {
        let slot = self
            .slots()
            .remove(name)
            .ok_or_else(|| DiffuseError::UnknownBuffer {
                name: name.to_string(),
            })?;
        let value = slot.lock().await.clone();
        Ok(value)
    }
}
