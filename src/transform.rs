use anyhow::*;
use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AffineTransform {
    /// 3x4 affine transformation matrix in xyz coordinate order
    pub matrix: [[f64; 4]; 3],
}
impl AffineTransform {
    pub fn identity() -> Self {
        Self::scale_translate([1.0; 3], [0.0; 3])
    }

    pub fn scale_translate(scale: [f64; 3], translation: [f64; 3]) -> Self {
        AffineTransform {
            matrix: [
                [scale[0], 0.0, 0.0, translation[0]],
                [0.0, scale[1], 0.0, translation[1]],
                [0.0, 0.0, scale[2], translation[2]],
            ],
        }
    }

    /// Maps voxel coordinates of a level downsampled by `factors` into level 0 coordinates.
    ///
    /// Coarse voxel centers sit in the middle of the fine voxels they cover, hence the
    /// `(f - 1) / 2` translation. Axes beyond the third are ignored, missing ones are 1.
    pub fn mipmap_transform(factors: &[f64]) -> Self {
        let mut scale = [1.0; 3];
        for (s, f) in scale.iter_mut().zip(factors) {
            *s = *f;
        }
        Self::scale_translate(scale, scale.map(|s| (s - 1.0) / 2.0))
    }

    fn homogeneous(&self) -> Matrix4<f64> {
        let m = &self.matrix;
        Matrix4::new(
            m[0][0], m[0][1], m[0][2], m[0][3], //
            m[1][0], m[1][1], m[1][2], m[1][3], //
            m[2][0], m[2][1], m[2][2], m[2][3], //
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn from_homogeneous(h: &Matrix4<f64>) -> Self {
        AffineTransform {
            matrix: [
                [h[(0, 0)], h[(0, 1)], h[(0, 2)], h[(0, 3)]],
                [h[(1, 0)], h[(1, 1)], h[(1, 2)], h[(1, 3)]],
                [h[(2, 0)], h[(2, 1)], h[(2, 2)], h[(2, 3)]],
            ],
        }
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let p = self.homogeneous() * Vector4::new(point[0], point[1], point[2], 1.0);
        [p[0], p[1], p[2]]
    }

    /// Invert this affine transformation matrix
    pub fn invert(&self) -> Result<Self, Error> {
        let inv = self
            .homogeneous()
            .try_inverse()
            .ok_or_else(|| anyhow!("Matrix is not invertible"))?;
        Ok(Self::from_homogeneous(&inv))
    }

    /// `self` applied after `first`.
    pub fn after(&self, first: &AffineTransform) -> Self {
        Self::from_homogeneous(&(self.homogeneous() * first.homogeneous()))
    }

    pub fn scale(&self) -> [f64; 3] {
        [self.matrix[0][0], self.matrix[1][1], self.matrix[2][2]]
    }
}
