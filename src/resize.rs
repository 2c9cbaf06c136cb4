/*!
Operations that change the population size.

- [`ParticleEnsemble::resize`]: resample `N` particles into `M` with the multinomial,
  residual or optimal (Fearnhead–Clifford) algorithm.
- [`ParticleEnsemble::replicate`] / [`ParticleEnsemble::dereplicate`]: multiply or divide
  the population by an integer factor.
- [`ParticleEnsemble::coalesce`]: merge particles with equal keys.
- [`ParticleEnsemble::introduce`]: append freshly generated particles.

None of these are available on views; a view cannot change the size of its backing
ensemble.
*/

use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;

use log::debug;
use rand::Rng;

use crate::choices::ChoiceMap;
use crate::distributions::Categorical;
use crate::ensemble::ParticleEnsemble;
use crate::error::{Result, SmcError};
use crate::init;
use crate::model::{GenerativeModel, ProgramTrace, Proposal};
use crate::resample::{
    self, rescale_to_mass, Priorities, ResampleMethod, ResampleOptions, Selection,
};
use crate::stratify::Layout;
use crate::weights::{self, safe_softmax};

/// Algorithm used by [`ParticleEnsemble::resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMethod {
    Multinomial,
    Residual,
    /// Fearnhead–Clifford optimal resampling; only shrinks the population.
    Optimal,
}

impl FromStr for ResizeMethod {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multinomial" => Ok(ResizeMethod::Multinomial),
            "residual" => Ok(ResizeMethod::Residual),
            "optimal" => Ok(ResizeMethod::Optimal),
            other => Err(SmcError::Configuration(format!(
                "unknown resize method '{other}' (expected multinomial, residual or optimal)"
            ))),
        }
    }
}

/// How [`ParticleEnsemble::dereplicate`] picks one particle per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DereplicateMethod {
    /// Keep the first member with its weight; exact inverse of `replicate`.
    #[default]
    KeepFirst,
    /// Draw a member in proportion to its weight and give it the block's average weight.
    Sample,
}

impl FromStr for DereplicateMethod {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keepfirst" => Ok(DereplicateMethod::KeepFirst),
            "sample" => Ok(DereplicateMethod::Sample),
            other => Err(SmcError::Configuration(format!(
                "unknown dereplication method '{other}' (expected keepfirst or sample)"
            ))),
        }
    }
}

/**
Fearnhead–Clifford selection of `target` distinct particles.

Finds the inverse threshold `c` with `sum_i min(c * p_i, 1) = target`. Particles with
`c * p_i >= 1` are kept once with weight `p_i`; the others share the remaining slots
through one systematic pass over the masses `c * p_i`, each receiving weight `1 / c`.
Returns the selected indices and their (normalized) new weights.
*/
pub(crate) fn optimal_indices<R: Rng + ?Sized>(
    probs: &[f64],
    target: usize,
    rng: &mut R,
) -> (Vec<usize>, Vec<f64>) {
    let n = probs.len();
    let positive = probs.iter().filter(|&&p| p > 0.0).count();
    if positive <= target {
        // Not enough mass carriers: keep all of them and pad with zero-mass particles.
        let mut kept: Vec<usize> = (0..n).filter(|&i| probs[i] > 0.0).collect();
        let mut omega: Vec<f64> = kept.iter().map(|&i| probs[i]).collect();
        let padding: Vec<usize> = (0..n)
            .filter(|&i| probs[i] <= 0.0)
            .take(target - positive)
            .collect();
        omega.extend(std::iter::repeat(0.0).take(padding.len()));
        kept.extend(padding);
        return (kept, omega);
    }

    let mut ascending: Vec<usize> = (0..n).collect();
    ascending.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));
    let mut acc = 0.0;
    let prefix: Vec<f64> = ascending
        .iter()
        .map(|&i| {
            acc += probs[i];
            acc
        })
        .collect();

    // `above` counts the weights larger than the candidate threshold at position `j`.
    let (mut j, mut c) = (n - target, 1.0 / prefix[n - target]);
    for above in 0..target {
        let pos = n - 1 - above;
        let inv = (target - above) as f64 / prefix[pos];
        if inv * probs[ascending[pos]] <= 1.0 {
            j = pos;
            c = inv;
            break;
        }
    }

    let mut selected: Vec<usize> = ascending[j + 1..].to_vec();
    let mut omega: Vec<f64> = selected.iter().map(|&i| probs[i]).collect();

    let mut residual: Vec<usize> = ascending[..=j].to_vec();
    residual.sort_unstable();
    let masses: Vec<f64> = residual.iter().map(|&i| c * probs[i]).collect();
    let draws = target - selected.len();
    let u: f64 = rng.gen();
    let mut ptr = 0;
    let mut cum = masses[0];
    for r in 0..draws {
        let position = u + r as f64;
        while cum <= position && ptr + 1 < residual.len() {
            ptr += 1;
            cum += masses[ptr];
        }
        selected.push(residual[ptr]);
        omega.push(1.0 / c);
        // Every mass is below one, so the next position lies past this bucket.
        if ptr + 1 < residual.len() {
            ptr += 1;
            cum += masses[ptr];
        }
    }
    (selected, omega)
}

fn optimal_select<R: Rng + ?Sized>(
    log_weights: &[f64],
    target: usize,
    options: &ResampleOptions,
    rng: &mut R,
) -> Result<Selection> {
    let priorities = Priorities::compute(log_weights, options)?;
    let (parents, omega) = optimal_indices(&priorities.probs, target, rng);
    let corrected: Vec<f64> = parents
        .iter()
        .zip(omega.iter())
        .map(|(&p, &w)| {
            if w <= 0.0 {
                f64::NEG_INFINITY
            } else if priorities.fallback {
                w.ln()
            } else {
                w.ln() + log_weights[p] - priorities.probs[p].ln()
            }
        })
        .collect();
    Ok(Selection {
        parents,
        log_weights: rescale_to_mass(corrected, target),
    })
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /**
    Resamples the ensemble into `target` particles.

    Folds `logsumexp(log_weights) - log(N)` into the log marginal-likelihood estimate
    and leaves total mass `target`. The optimal method requires `target <= N` and is a
    no-op for `target == N`.

    # Errors

    - [`SmcError::InvalidArgument`] for an empty ensemble, `target == 0`, or an optimal
      resize with `target > N`.
    - [`SmcError::InvalidWeights`] for degenerate weights under the error policy.
    */
    pub fn resize(
        &mut self,
        method: ResizeMethod,
        target: usize,
        options: &ResampleOptions,
    ) -> Result<&mut Self> {
        let n = self.len();
        if n == 0 || target == 0 {
            return Err(SmcError::InvalidArgument(format!(
                "cannot resize {n} particles to {target}"
            )));
        }
        let log_weights = self.log_weights.clone();
        let selection = match method {
            ResizeMethod::Multinomial => resample::select(
                &log_weights,
                ResampleMethod::Multinomial,
                target,
                options,
                &mut self.rng,
            )?,
            ResizeMethod::Residual => resample::select(
                &log_weights,
                ResampleMethod::Residual,
                target,
                options,
                &mut self.rng,
            )?,
            ResizeMethod::Optimal => {
                if target > n {
                    return Err(SmcError::InvalidArgument(format!(
                        "optimal resize cannot grow {n} particles to {target}"
                    )));
                }
                if target == n {
                    return Ok(self);
                }
                optimal_select(&log_weights, target, options, &mut self.rng)?
            }
        };
        let increment = weights::log_ml_increment(&log_weights);
        debug!("{method:?} resize {n} -> {target}, log ML increment {increment:.4}");
        self.log_ml_estimate += increment;
        self.install_generation(selection.parents, selection.log_weights);
        Ok(self)
    }

    /// Makes `k` copies of every particle with unchanged weights.
    ///
    /// Contiguous layout puts the copies of particle `i` at `i * k .. (i + 1) * k`;
    /// interleaved layout puts them at `i, i + N, i + 2N, ...`.
    pub fn replicate(&mut self, k: usize, layout: Layout) -> Result<&mut Self> {
        if k == 0 {
            return Err(SmcError::InvalidArgument(
                "replication factor must be positive".into(),
            ));
        }
        let n = self.len();
        let parents: Vec<usize> = match layout {
            Layout::Contiguous => (0..n * k).map(|i| i / k).collect(),
            Layout::Interleaved => (0..n * k).map(|i| i % n).collect(),
        };
        let log_weights = parents.iter().map(|&p| self.log_weights[p]).collect();
        self.install_generation(parents, log_weights);
        Ok(self)
    }

    /// Reduces the population by the factor `k`, keeping one particle per block of `k`
    /// (blocks follow the same layout as [`replicate`](Self::replicate)).
    pub fn dereplicate(
        &mut self,
        k: usize,
        layout: Layout,
        method: DereplicateMethod,
    ) -> Result<&mut Self> {
        let n = self.len();
        if k == 0 || n % k != 0 {
            return Err(SmcError::InvalidArgument(format!(
                "cannot dereplicate {n} particles by a factor of {k}"
            )));
        }
        let m = n / k;
        let member = |block: usize, j: usize| match layout {
            Layout::Contiguous => block * k + j,
            Layout::Interleaved => j * m + block,
        };
        let mut parents = Vec::with_capacity(m);
        let mut log_weights = Vec::with_capacity(m);
        for block in 0..m {
            match method {
                DereplicateMethod::KeepFirst => {
                    let first = member(block, 0);
                    parents.push(first);
                    log_weights.push(self.log_weights[first]);
                }
                DereplicateMethod::Sample => {
                    let block_weights: Vec<f64> =
                        (0..k).map(|j| self.log_weights[member(block, j)]).collect();
                    let (probs, invalid) = safe_softmax(&block_weights);
                    let choice = if invalid {
                        self.rng.gen_range(0..k)
                    } else {
                        Categorical::new(&probs).sample(&mut self.rng)
                    };
                    parents.push(member(block, choice));
                    log_weights.push(weights::logsumexp(&block_weights) - (k as f64).ln());
                }
            }
        }
        self.install_generation(parents, log_weights);
        Ok(self)
    }

    /**
    Merges particles whose `key` is equal into one representative each.

    The representative is the group's first member; its weight is
    `logsumexp(group) + log(N_new / N_old)`.
    */
    pub fn coalesce_by<K, F>(&mut self, key: F) -> Result<&mut Self>
    where
        K: Hash + Eq,
        F: Fn(&Tr) -> K,
    {
        let n_old = self.len();
        let mut group_of: HashMap<K, usize> = HashMap::new();
        let mut groups: Vec<(usize, Vec<f64>)> = Vec::new();
        for (i, trace) in self.traces.iter().enumerate() {
            let g = *group_of.entry(key(trace)).or_insert_with(|| {
                groups.push((i, Vec::new()));
                groups.len() - 1
            });
            groups[g].1.push(self.log_weights[i]);
        }
        let n_new = groups.len();
        let scale = (n_new as f64 / n_old as f64).ln();
        let (parents, log_weights) = groups
            .into_iter()
            .map(|(rep, ws)| (rep, weights::logsumexp(&ws) + scale))
            .unzip();
        debug!("coalesced {n_old} particles into {n_new}");
        self.install_generation(parents, log_weights);
        Ok(self)
    }
}

impl<Tr: ProgramTrace> ParticleEnsemble<Tr> {
    /// Merges particles with identical choices. See [`coalesce_by`](Self::coalesce_by).
    pub fn coalesce(&mut self) -> Result<&mut Self> {
        self.coalesce_by(|trace| trace.choices().clone())
    }

    /**
    Appends `count` particles generated from `model` under `observations`.

    The log marginal-likelihood estimate is first folded into the existing weights and
    reset to zero, since the new particles are weighted on an absolute scale.
    */
    pub fn introduce<M>(
        &mut self,
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        count: usize,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        self.fold_estimate_into_weights();
        for _ in 0..count {
            let (trace, log_weight) =
                init::generate_particle(model, args, observations, &mut self.rng)?;
            self.push_particle(trace, log_weight);
        }
        Ok(self)
    }

    /// Like [`introduce`](Self::introduce), with the new particles' unobserved choices
    /// drawn from `proposal`.
    pub fn introduce_with_proposal<M, Q>(
        &mut self,
        model: &M,
        args: &M::Args,
        observations: &ChoiceMap,
        proposal: &Q,
        count: usize,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<ChoiceMap>,
    {
        self.fold_estimate_into_weights();
        for _ in 0..count {
            let (trace, log_weight) =
                init::propose_particle(model, args, observations, proposal, &mut self.rng)?;
            self.push_particle(trace, log_weight);
        }
        Ok(self)
    }

    fn fold_estimate_into_weights(&mut self) {
        let estimate = self.log_ml_estimate;
        self.log_weights.iter_mut().for_each(|w| *w += estimate);
        self.log_ml_estimate = 0.0;
    }

    /// Introduced particles have no parent and record their own index. The staging
    /// buffer grows with them, so a failed generation leaves every container the same length.
    fn push_particle(&mut self, trace: Tr, log_weight: f64) {
        self.parents.push(self.traces.len());
        self.staging.push(trace.clone());
        self.traces.push(trace);
        self.log_weights.push(log_weight);
    }
}
