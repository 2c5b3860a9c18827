//! The TI vector-field kernel: pure numeric functions implementing
//! Grossman et al. 2017's maximal-modulation-envelope construction.
//!
//! No I/O, no globals — every function here takes arrays in and returns
//! arrays out. `ndarray`/`rayon` process large per-element numeric arrays
//! the way a calibration pipeline processes per-channel data: plain
//! `Array2<f64>` rows, `par_iter` over rows for the element-wise regime
//! selection.

use crate::error::{TiError, TiResult};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;

/// Computes the TI envelope amplitude vectors for a pair of field arrays.
///
/// `e1`/`e2` must both be `(N, 3)`. Returns a `(N, 3)` array of TI vectors.
pub fn ti_vectors(e1: &Array2<f64>, e2: &Array2<f64>) -> TiResult<Array2<f64>> {
    check_field_shape(e1, "E1")?;
    check_field_shape(e2, "E2")?;
    if e1.shape() != e2.shape() {
        return Err(TiError::Input(format!(
            "E1 and E2 must have the same shape, got {:?} and {:?}",
            e1.shape(),
            e2.shape()
        )));
    }

    let n = e1.nrows();
    let mut out = Array2::<f64>::zeros((n, 3));

    let rows: Vec<([f64; 3], [f64; 3])> = (0..n)
        .map(|i| (row3(e1, i), row3(e2, i)))
        .collect();

    let results: Vec<[f64; 3]> = rows.into_par_iter().map(|(r1, r2)| ti_row(r1, r2)).collect();

    for (i, row) in results.into_iter().enumerate() {
        out.row_mut(i).assign(&Array1::from_vec(row.to_vec()));
    }

    Ok(out)
}

/// `mti_vectors(E1,E2,E3,E4) = ti_vectors(ti_vectors(E1,E2), ti_vectors(E3,E4))`.
/// All four arrays must share an identical `(N, 3)` shape.
pub fn mti_vectors(
    e1: &Array2<f64>,
    e2: &Array2<f64>,
    e3: &Array2<f64>,
    e4: &Array2<f64>,
) -> TiResult<Array2<f64>> {
    for (label, arr) in [("E1", e1), ("E2", e2), ("E3", e3), ("E4", e4)] {
        check_field_shape(arr, label)?;
    }
    let shape = e1.shape();
    if e2.shape() != shape || e3.shape() != shape || e4.shape() != shape {
        return Err(TiError::Input(
            "E1, E2, E3, E4 must all share an identical (N,3) shape".into(),
        ));
    }

    let ti_ab = ti_vectors(e1, e2)?;
    let ti_cd = ti_vectors(e3, e4)?;
    ti_vectors(&ti_ab, &ti_cd)
}

/// Per-element magnitude of a TI vector field, e.g. `TI_max = |ti_vectors(E1,E2)|`.
pub fn field_magnitude(field: &Array2<f64>) -> Array1<f64> {
    field.map_axis(Axis(1), |row| row.iter().map(|v| v * v).sum::<f64>().sqrt())
}

fn check_field_shape(arr: &Array2<f64>, label: &str) -> TiResult<()> {
    if arr.ncols() != 3 {
        return Err(TiError::Input(format!(
            "{label} must have shape (N,3), got (N,{})",
            arr.ncols()
        )));
    }
    Ok(())
}

fn row3(arr: &Array2<f64>, i: usize) -> [f64; 3] {
    [arr[[i, 0]], arr[[i, 1]], arr[[i, 2]]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn neg(a: [f64; 3]) -> [f64; 3] {
    [-a[0], -a[1], -a[2]]
}

/// The Grossman 2017 construction for one pair of field vectors.
fn ti_row(e1_in: [f64; 3], e2_in: [f64; 3]) -> [f64; 3] {
    let norm1 = norm(e1_in);
    let norm2_in = norm(e2_in);

    // Preprocess: ensure |E1| >= |E2|, and that the fields point into the
    // same half-space.
    let (mut e1, mut e2) = if norm2_in > norm1 { (e2_in, e1_in) } else { (e1_in, e2_in) };
    if dot(e1, e2) < 0.0 {
        e2 = neg(e2);
    }

    let norm_e1 = norm(e1);
    let norm_e2 = norm(e2);

    let cos_alpha = if norm_e1 == 0.0 || norm_e2 == 0.0 {
        1.0
    } else {
        (dot(e1, e2) / (norm_e1 * norm_e2)).clamp(-1.0, 1.0)
    };

    if norm_e2 <= norm_e1 * cos_alpha {
        // Regime 1: the smaller field never overtakes the larger one.
        return scale(e2, 2.0);
    }

    // Regime 2: compute the maximal envelope via the bisector direction.
    let h = sub(e1, e2);
    let h_norm = norm(h);
    let e_h = if h_norm == 0.0 { [0.0, 0.0, 0.0] } else { scale(h, 1.0 / h_norm) };
    let e2_parallel = scale(e_h, dot(e2, e_h));
    let e2_perp = sub(e2, e2_parallel);
    scale(e2_perp, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mismatched_shapes_are_rejected() {
        let e1 = Array2::<f64>::zeros((3, 3));
        let e2 = Array2::<f64>::zeros((4, 3));
        assert!(ti_vectors(&e1, &e2).is_err());
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        let e1 = Array2::<f64>::zeros((3, 2));
        let e2 = Array2::<f64>::zeros((3, 2));
        assert!(ti_vectors(&e1, &e2).is_err());
    }

    #[test]
    fn identical_fields_give_regime1_result() {
        let e1 = array![[1.0, 0.0, 0.0]];
        let e2 = array![[1.0, 0.0, 0.0]];
        let ti = ti_vectors(&e1, &e2).unwrap();
        assert!((ti[[0, 0]] - 2.0).abs() < 1e-12);
        assert!(ti[[0, 1]].abs() < 1e-12);
    }

    #[test]
    fn symmetric_in_pair_order() {
        let e1 = array![[1.0, 0.2, 0.0], [0.5, 0.5, 0.1]];
        let e2 = array![[0.6, -0.3, 0.2], [0.2, 0.8, -0.1]];
        let ti_ab = ti_vectors(&e1, &e2).unwrap();
        let ti_ba = ti_vectors(&e2, &e1).unwrap();
        for i in 0..2 {
            for j in 0..3 {
                assert!((ti_ab[[i, j]] - ti_ba[[i, j]]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn orthogonal_equal_magnitude_is_regime_boundary() {
        // |E2| == |E1| * cos(alpha) with alpha = 90deg (cos=0) means |E2|
        // must be 0 to sit exactly on the boundary; use a tiny E2 instead
        // to exercise both branches without relying on floating equality.
        let e1 = array![[1.0, 0.0, 0.0]];
        let e2 = array![[0.0, 0.0, 0.0]];
        let ti = ti_vectors(&e1, &e2).unwrap();
        assert!(ti[[0, 0]].abs() < 1e-12);
        assert!(ti[[0, 1]].abs() < 1e-12);
    }

    #[test]
    fn mti_is_ti_of_ti() {
        let e1 = array![[1.0, 0.0, 0.0]];
        let e2 = array![[0.6, 0.2, 0.0]];
        let e3 = array![[0.3, -0.4, 0.1]];
        let e4 = array![[0.1, 0.1, 0.2]];
        let direct = mti_vectors(&e1, &e2, &e3, &e4).unwrap();
        let ab = ti_vectors(&e1, &e2).unwrap();
        let cd = ti_vectors(&e3, &e4).unwrap();
        let composed = ti_vectors(&ab, &cd).unwrap();
        assert_eq!(direct, composed);
    }

    #[test]
    fn mti_requires_identical_shapes() {
        let e1 = Array2::<f64>::zeros((2, 3));
        let e2 = Array2::<f64>::zeros((2, 3));
        let e3 = Array2::<f64>::zeros((2, 3));
        let e4 = Array2::<f64>::zeros((3, 3));
        assert!(mti_vectors(&e1, &e2, &e3, &e4).is_err());
    }
}
