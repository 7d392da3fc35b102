use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::*;

/// Identifier of a view (image) in a collection.
pub type ViewId = u32;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kind of keypoint descriptor. Fixes the descriptor length and is used as the
/// key under which matches are stored.
pub enum DescriptorType {
    /// 128 unsigned-byte components.
    Sift,
    /// 128 float components.
    SiftFloat,
    /// 64 float components.
    Surf,
    /// 64 float components.
    Akaze,
}

impl DescriptorType {
    /// Number of components of one descriptor.
    pub fn dim(self) -> usize {
        match self {
            DescriptorType::Sift | DescriptorType::SiftFloat => 128,
            DescriptorType::Surf | DescriptorType::Akaze => 64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Ordered descriptors of one view. The position of a descriptor is the
/// feature id used in correspondences.
///
/// Components are stored contiguously, widened to `f32`.
pub struct DescriptorSet {
    desc_type: DescriptorType,
    data: Vec<f32>,
}

impl DescriptorSet {
    pub fn new(desc_type: DescriptorType) -> Self {
        Self {
            desc_type,
            data: Vec::new(),
        }
    }

    /// Build a set from packed unsigned-byte descriptors (e.g. SIFT as written
    /// by most describers). `bytes.len()` must be a multiple of the type's length.
    pub fn from_bytes(desc_type: DescriptorType, bytes: &[u8]) -> LocResult<Self> {
        let dim = desc_type.dim();
        if bytes.len() % dim != 0 {
            return Err(LocErr::PartialDescriptor {
                len: bytes.len(),
                dim,
            });
        }
        Ok(Self {
            desc_type,
            data: bytes.iter().map(|&b| b as f32).collect(),
        })
    }

    /// Build a set from one vector per descriptor.
    pub fn from_rows<I, R>(desc_type: DescriptorType, rows: I) -> LocResult<Self>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[f32]>,
    {
        let mut set = Self::new(desc_type);
        for row in rows {
            set.push(row.as_ref())?;
        }
        Ok(set)
    }

    /// Append one descriptor.
    pub fn push(&mut self, desc: &[f32]) -> LocResult<()> {
        if desc.len() != self.dim() {
            return Err(LocErr::DimensionMismatch {
                expected: self.dim(),
                found: desc.len(),
            });
        }
        self.data.extend_from_slice(desc);
        Ok(())
    }

    pub fn desc_type(&self) -> DescriptorType {
        self.desc_type
    }

    pub fn dim(&self) -> usize {
        self.desc_type.dim()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dim()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Descriptor `i`.
    ///
    /// Panics if `i >= self.len()`.
    pub fn get(&self, i: usize) -> &[f32] {
        let dim = self.dim();
        &self.data[i * dim..(i + 1) * dim]
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim())
    }

    /// Keep only the descriptors whose index is listed, in the listed order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.dim());
        for &i in indices {
            data.extend_from_slice(self.get(i));
        }
        Self {
            desc_type: self.desc_type,
            data,
        }
    }
}

/// Squared Euclidean distance between two descriptors.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .fold(0., |acc, (x, y)| {
            let d = x - y;
            acc + d * d
        })
}

/// Source of descriptor sets, keyed by view and descriptor type.
///
/// A view without descriptors of the requested type may return `None`; it is
/// treated exactly like an empty set. Returned sets must stay stable for the
/// lifetime of the provider.
pub trait RegionsProvider: Sync {
    fn descriptors(&self, view: ViewId, desc_type: DescriptorType) -> Option<&DescriptorSet>;

    fn descriptor_count(&self, view: ViewId, desc_type: DescriptorType) -> usize {
        self.descriptors(view, desc_type).map_or(0, DescriptorSet::len)
    }
}

#[derive(Debug, Default, Clone)]
/// Descriptor sets of a whole collection held in memory.
pub struct RegionsPerView {
    regions: HashMap<(ViewId, DescriptorType), DescriptorSet>,
}

impl RegionsPerView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `set` for `view` under its own descriptor type.
    pub fn insert(&mut self, view: ViewId, set: DescriptorSet) {
        let key = set.desc_type();
        self.insert_as(view, key, set);
    }

    /// Store `set` for `view` under an explicit describer key. The set keeps
    /// its own type tag, which matchers compare against the reference view.
    pub fn insert_as(&mut self, view: ViewId, key: DescriptorType, set: DescriptorSet) {
        self.regions.insert((view, key), set);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl RegionsProvider for RegionsPerView {
    fn descriptors(&self, view: ViewId, desc_type: DescriptorType) -> Option<&DescriptorSet> {
        self.regions.get(&(view, desc_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_widens_components() {
        let bytes: Vec<u8> = (0..=255).collect();
        let set = DescriptorSet::from_bytes(DescriptorType::Sift, &bytes).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1)[0], 128.);
        assert_eq!(set.get(1)[127], 255.);
    }

    #[test]
    fn test_from_bytes_rejects_partial_descriptor() {
        let bytes = vec![0u8; 130];
        let err = DescriptorSet::from_bytes(DescriptorType::Sift, &bytes).unwrap_err();
        assert!(matches!(err, LocErr::PartialDescriptor { len: 130, dim: 128 }));
        assert_eq!(
            err.to_string(),
            "130 bytes do not split into descriptors of length 128"
        );
    }

    #[test]
    fn test_push_checks_length() {
        let mut set = DescriptorSet::new(DescriptorType::Akaze);
        assert!(set.push(&[0.; 64]).is_ok());
        assert!(set.push(&[0.; 128]).is_err());
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn test_select_keeps_order() {
        let set = DescriptorSet::from_rows(
            DescriptorType::Surf,
            (0..4).map(|i| vec![i as f32; 64]),
        )
        .unwrap();
        let sub = set.select(&[3, 1]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get(0)[0], 3.);
        assert_eq!(sub.get(1)[0], 1.);
    }

    #[test]
    fn test_missing_view_counts_as_empty() {
        let mut regions = RegionsPerView::new();
        regions.insert(0, DescriptorSet::from_bytes(DescriptorType::Sift, &[1; 256]).unwrap());
        assert_eq!(regions.descriptor_count(0, DescriptorType::Sift), 2);
        assert_eq!(regions.descriptor_count(1, DescriptorType::Sift), 0);
        assert_eq!(regions.descriptor_count(0, DescriptorType::Akaze), 0);
    }

    #[test]
    fn test_l2_squared() {
        assert_eq!(l2_squared(&[0., 0.], &[3., 4.]), 25.);
        assert_eq!(l2_squared(&[1., 1.], &[1., 1.]), 0.);
    }
}
