use super::GridError;
use nalgebra::{Point3, Vector3};

/// An orthorhombic, fully periodic simulation box with its origin at zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicBox {
    lengths: Vector3<f64>,
}

impl PeriodicBox {
    /// Creates a box with the given edge lengths.
    ///
    /// # Errors
    ///
    /// Returns [`GridError::InvalidBoxLength`] if any length is not positive and finite.
    pub fn new(lengths: [f64; 3]) -> Result<Self, GridError> {
        for (axis, &length) in lengths.iter().enumerate() {
            if !(length.is_finite() && length > 0.0) {
                return Err(GridError::InvalidBoxLength { axis, length });
            }
        }
        Ok(Self {
            lengths: Vector3::from(lengths),
        })
    }

    pub fn lengths(&self) -> &Vector3<f64> {
        &self.lengths
    }

    pub fn length(&self, axis: usize) -> f64 {
        self.lengths[axis]
    }

    pub fn min_length(&self) -> f64 {
        self.lengths.min()
    }

    pub fn volume(&self) -> f64 {
        self.lengths.product()
    }

    /// Maps a displacement onto its shortest periodic image.
    pub fn minimum_image(&self, delta: Vector3<f64>) -> Vector3<f64> {
        delta.zip_map(&self.lengths, |d, l| d - l * (d / l).round())
    }

    /// Shortest periodic vector pointing from `from` to `to`.
    pub fn displacement(&self, from: &Point3<f64>, to: &Point3<f64>) -> Vector3<f64> {
        self.minimum_image(to - from)
    }

    pub fn distance(&self, from: &Point3<f64>, to: &Point3<f64>) -> f64 {
        self.displacement(from, to).norm()
    }

    /// The translation corresponding to `image` box lengths along each axis.
    pub fn shift(&self, image: [i32; 3]) -> Vector3<f64> {
        Vector3::new(
            image[0] as f64 * self.lengths.x,
            image[1] as f64 * self.lengths.y,
            image[2] as f64 * self.lengths.z,
        )
    }

    /// Folds `position` into `[0, L)` along every axis.
    ///
    /// Returns the number of box lengths removed per axis and adds the same count to `image`,
    /// so that `position + shift(image)` is unchanged. Non-finite coordinates are left alone.
    pub fn fold(&self, position: &mut Point3<f64>, image: &mut [i32; 3]) -> [i32; 3] {
        let mut folded = [0i32; 3];
        for axis in 0..3 {
            let length = self.lengths[axis];
            let x = position[axis];
            if !x.is_finite() {
                continue;
            }
            let mut k = (x / length).floor();
            let mut wrapped = x - k * length;
            // x slightly below zero can round up to exactly L
            if wrapped >= length {
                wrapped -= length;
                k += 1.0;
            }
            if wrapped < 0.0 {
                wrapped = 0.0;
            }
            position[axis] = wrapped;
            folded[axis] = k as i32;
            image[axis] += k as i32;
        }
        folded
    }

    /// Position in the unbounded frame, undoing all folds recorded in `image`.
    pub fn unfold(&self, position: &Point3<f64>, image: [i32; 3]) -> Point3<f64> {
        position + self.shift(image)
    }

    /// Returns `true` if `position` lies in `[0, L)` along every axis.
    pub fn contains(&self, position: &Point3<f64>) -> bool {
        (0..3).all(|axis| position[axis] >= 0.0 && position[axis] < self.lengths[axis])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(l: f64) -> PeriodicBox {
        PeriodicBox::new([l, l, l]).unwrap()
    }

    #[test]
    fn rejects_non_positive_lengths() {
        assert!(matches!(
            PeriodicBox::new([10.0, 0.0, 10.0]),
            Err(GridError::InvalidBoxLength { axis: 1, .. })
        ));
        assert!(PeriodicBox::new([10.0, 10.0, f64::INFINITY]).is_err());
    }

    #[test]
    fn minimum_image_wraps_long_displacements() {
        let b = cube(10.0);
        let d = b.minimum_image(Vector3::new(9.0, -6.0, 4.0));
        assert!((d - Vector3::new(-1.0, 4.0, 4.0)).norm() < 1e-12);
    }

    #[test]
    fn displacement_across_the_boundary_is_short() {
        let b = cube(10.0);
        let a = Point3::new(0.2, 5.0, 5.0);
        let c = Point3::new(9.9, 5.0, 5.0);
        assert!((b.distance(&a, &c) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn fold_updates_image_counters_and_preserves_unfolded_position() {
        let b = cube(10.0);
        let original = Point3::new(-0.5, 23.0, 5.0);
        let mut position = original;
        let mut image = [0, 0, 0];

        let folded = b.fold(&mut position, &mut image);

        assert_eq!(folded, [-1, 2, 0]);
        assert_eq!(image, [-1, 2, 0]);
        assert!((position - Point3::new(9.5, 3.0, 5.0)).norm() < 1e-12);
        assert!((b.unfold(&position, image) - original).norm() < 1e-12);
    }

    #[test]
    fn fold_of_tiny_negative_coordinate_stays_inside_box() {
        let b = cube(10.0);
        let mut position = Point3::new(-1e-17, 0.0, 0.0);
        let mut image = [0, 0, 0];
        b.fold(&mut position, &mut image);
        assert!(b.contains(&position));
        assert_eq!(image, [0, 0, 0]);
    }

    #[test]
    fn shift_scales_box_lengths() {
        let b = PeriodicBox::new([2.0, 3.0, 4.0]).unwrap();
        assert_eq!(b.shift([1, -1, 2]), Vector3::new(2.0, -3.0, 8.0));
        assert_eq!(b.volume(), 24.0);
    }
}
