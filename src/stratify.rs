//! Assignment of particle slots to strata.
//!
//! Stratified initialization and stratified updates spread `N` slots evenly over `K`
//! strata. `B = N / K` slots go to each stratum, laid out either in contiguous blocks
//! or interleaved with stride `K`; the trailing `N - K * B` slots receive independently
//! drawn random strata.

use std::str::FromStr;

use rand::Rng;

use crate::error::{Result, SmcError};

/// How grouped slots are arranged in the particle arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Members of a group occupy adjacent slots.
    #[default]
    Contiguous,
    /// Members of a group are spaced at a fixed stride.
    Interleaved,
}

impl FromStr for Layout {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "contiguous" => Ok(Layout::Contiguous),
            "interleaved" => Ok(Layout::Interleaved),
            other => Err(SmcError::Configuration(format!(
                "unknown layout '{other}' (expected contiguous or interleaved)"
            ))),
        }
    }
}

/// Returns the (0-based) stratum of each of the `n_slots` slots.
///
/// # Examples
///
/// ```rust
/// use rand::{rngs::SmallRng, SeedableRng};
/// use smc_ensemble::stratify::{stratify, Layout};
///
/// let mut rng = SmallRng::seed_from_u64(42);
/// let strata = stratify(6, 3, Layout::Contiguous, &mut rng).unwrap();
/// assert_eq!(strata, vec![0, 0, 1, 1, 2, 2]);
/// let strata = stratify(6, 3, Layout::Interleaved, &mut rng).unwrap();
/// assert_eq!(strata, vec![0, 1, 2, 0, 1, 2]);
/// ```
pub fn stratify<R: Rng + ?Sized>(
    n_slots: usize,
    n_strata: usize,
    layout: Layout,
    rng: &mut R,
) -> Result<Vec<usize>> {
    if n_strata == 0 {
        return Err(SmcError::InvalidArgument(
            "stratification needs at least one stratum".into(),
        ));
    }
    let block = n_slots / n_strata;
    let n_even = block * n_strata;
    let mut strata = Vec::with_capacity(n_slots);
    for i in 0..n_even {
        strata.push(match layout {
            Layout::Contiguous => i / block,
            Layout::Interleaved => i % n_strata,
        });
    }
    strata.extend((n_even..n_slots).map(|_| rng.gen_range(0..n_strata)));
    Ok(strata)
}
