//! Per-tile accumulation of autocorrelation weights. The health publisher
//! turns these sums into averages once a second.

/// Hard upper bound on the array size; the health datagram carries exactly
/// this many slots per polarisation regardless of the live tile count.
pub const NTILES_MAX: usize = 256;

/// Fold one integration's weights region into the running per-tile sums.
///
/// Baselines are enumerated upper-triangular as `(i, j)` with
/// `0 <= j <= i < ntiles`; the autocorrelations are the rows where `i == j`.
/// Within each baseline's 4-pol group, xx sits at slot 0 and yy at slot 3.
pub fn accumulate_autos(
    weights: &[f32],
    ntiles: usize,
    sums_x: &mut [f32; NTILES_MAX],
    sums_y: &mut [f32; NTILES_MAX],
) {
    let ntiles = ntiles.min(NTILES_MAX);
    let nbaselines = ntiles * (ntiles + 1) / 2;
    if weights.len() < nbaselines * 4 {
        return;
    }

    let mut ordinal = 0usize;
    for i in 0..ntiles {
        for j in 0..=i {
            if i == j {
                let xx = ordinal * 4;
                sums_x[i] += weights[xx];
                sums_y[i] += weights[xx + 3];
            }
            ordinal += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autocorrelations_land_on_their_tiles() {
        // 2 tiles -> 3 baselines in (i,j) order: (0,0) (1,0) (1,1)
        let mut weights = vec![0.0f32; 3 * 4];
        weights[0] = 1.5; // (0,0) xx
        weights[3] = 2.5; // (0,0) yy
        weights[8] = 10.0; // (1,1) xx
        weights[11] = 20.0; // (1,1) yy
        // cross terms must be ignored
        weights[4] = 99.0;
        weights[7] = 99.0;

        let mut x = [0.0f32; NTILES_MAX];
        let mut y = [0.0f32; NTILES_MAX];
        accumulate_autos(&weights, 2, &mut x, &mut y);
        accumulate_autos(&weights, 2, &mut x, &mut y);

        assert_eq!(x[0], 3.0);
        assert_eq!(y[0], 5.0);
        assert_eq!(x[1], 20.0);
        assert_eq!(y[1], 40.0);
        assert_eq!(x[2], 0.0);
    }

    #[test]
    fn short_buffer_is_ignored() {
        let mut x = [0.0f32; NTILES_MAX];
        let mut y = [0.0f32; NTILES_MAX];
        accumulate_autos(&[1.0; 4], 4, &mut x, &mut y);
        assert!(x.iter().all(|&v| v == 0.0));
    }
}
