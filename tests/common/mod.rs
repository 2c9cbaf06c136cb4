#![allow(dead_code)]

use std::cell::Cell;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use smc_ensemble::choices::{ChoiceMap, ChoiceValue};
use smc_ensemble::distributions::normal_log_density;
use smc_ensemble::error::{Result, SmcError};
use smc_ensemble::model::{GenerativeModel, ProgramTrace, Proposal, UpdateResult};

pub const SEED: u64 = 42;

pub fn x_addr(t: usize) -> String {
    format!("x{t}")
}

pub fn y_addr(t: usize) -> String {
    format!("y{t}")
}

/// Observations `y0 .. y{values.len() - 1}`.
pub fn observations(values: &[f64]) -> ChoiceMap {
    values
        .iter()
        .enumerate()
        .map(|(t, &y)| (y_addr(t), y))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTrace<A> {
    pub choices: ChoiceMap,
    pub score: f64,
    pub args: A,
}

impl<A: Clone> ProgramTrace for SimpleTrace<A> {
    type Args = A;

    fn score(&self) -> f64 {
        self.score
    }

    fn choices(&self) -> &ChoiceMap {
        &self.choices
    }

    fn args(&self) -> &A {
        &self.args
    }
}

fn gaussian(mean: f64, sd: f64) -> Result<Normal<f64>> {
    Normal::new(mean, sd).map_err(|e| SmcError::Model(format!("bad normal: {e}")))
}

/// Gaussian random walk observed with noise:
/// `x0 ~ N(0, prior_sd)`, `x_t ~ N(x_{t-1}, step_sd)`, `y_t ~ N(x_t, obs_sd)`.
/// The argument is the number of time steps.
#[derive(Debug, Clone, Copy)]
pub struct RandomWalkModel {
    pub prior_sd: f64,
    pub step_sd: f64,
    pub obs_sd: f64,
}

#[derive(Default)]
struct Execution {
    choices: ChoiceMap,
    score: f64,
    constrained: f64,
    fresh: f64,
}

impl RandomWalkModel {
    pub fn new(prior_sd: f64, step_sd: f64, obs_sd: f64) -> Self {
        Self {
            prior_sd,
            step_sd,
            obs_sd,
        }
    }

    /// Takes each value from `constraints`, then from `keep`, and samples the rest.
    fn execute<R: Rng + ?Sized>(
        &self,
        steps: usize,
        constraints: &ChoiceMap,
        keep: &ChoiceMap,
        rng: &mut R,
    ) -> Result<Execution> {
        let mut exec = Execution::default();
        let mut prev_x = 0.0;
        for t in 0..steps {
            let x_sd = if t == 0 { self.prior_sd } else { self.step_sd };
            let x = Self::visit(&x_addr(t), prev_x, x_sd, constraints, keep, &mut exec, rng)?;
            Self::visit(&y_addr(t), x, self.obs_sd, constraints, keep, &mut exec, rng)?;
            prev_x = x;
        }
        Ok(exec)
    }

    fn visit<R: Rng + ?Sized>(
        address: &str,
        mean: f64,
        sd: f64,
        constraints: &ChoiceMap,
        keep: &ChoiceMap,
        exec: &mut Execution,
        rng: &mut R,
    ) -> Result<f64> {
        let value = if let Some(v) = constraints.get(address) {
            let v = v
                .as_f64()
                .ok_or_else(|| SmcError::Model(format!("{address} must be real")))?;
            exec.constrained += normal_log_density(v, mean, sd);
            v
        } else if let Some(v) = keep.get_f64(address) {
            v
        } else {
            let v = gaussian(mean, sd)?.sample(rng);
            exec.fresh += normal_log_density(v, mean, sd);
            v
        };
        exec.score += normal_log_density(value, mean, sd);
        exec.choices.insert(address, value);
        Ok(value)
    }
}

impl GenerativeModel for RandomWalkModel {
    type Args = usize;
    type Trace = SimpleTrace<usize>;

    fn simulate<R: Rng + ?Sized>(&self, args: &usize, rng: &mut R) -> Result<Self::Trace> {
        let exec = self.execute(*args, &ChoiceMap::new(), &ChoiceMap::new(), rng)?;
        Ok(SimpleTrace {
            choices: exec.choices,
            score: exec.score,
            args: *args,
        })
    }

    fn generate<R: Rng + ?Sized>(
        &self,
        args: &usize,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<(Self::Trace, f64)> {
        let exec = self.execute(*args, constraints, &ChoiceMap::new(), rng)?;
        let trace = SimpleTrace {
            choices: exec.choices,
            score: exec.score,
            args: *args,
        };
        Ok((trace, exec.constrained))
    }

    fn update<R: Rng + ?Sized>(
        &self,
        trace: &Self::Trace,
        args: &usize,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<UpdateResult<Self::Trace>> {
        let exec = self.execute(*args, constraints, &trace.choices, rng)?;
        let discard: ChoiceMap = trace
            .choices
            .iter()
            .filter(|(addr, _)| constraints.contains(addr) || !exec.choices.contains(addr))
            .map(|(addr, value)| (addr.clone(), *value))
            .collect();
        let log_weight = exec.score - trace.score - exec.fresh;
        Ok(UpdateResult {
            trace: SimpleTrace {
                choices: exec.choices,
                score: exec.score,
                args: *args,
            },
            log_weight,
            discard,
        })
    }
}

/// A single discrete parameter, uniform over `{-2, -1, 0, 1, 2}`, at address `param`.
#[derive(Debug, Clone, Copy)]
pub struct UniformParamModel;

pub const PARAM: &str = "param";

impl UniformParamModel {
    fn log_prob(value: i64) -> f64 {
        if (-2..=2).contains(&value) {
            -(5f64.ln())
        } else {
            f64::NEG_INFINITY
        }
    }

    fn trace(value: i64) -> SimpleTrace<()> {
        SimpleTrace {
            choices: [(PARAM, value)].into_iter().collect(),
            score: Self::log_prob(value),
            args: (),
        }
    }

    fn constrained(constraints: &ChoiceMap) -> Result<Option<i64>> {
        constraints
            .get(PARAM)
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| SmcError::Model("param must be an integer".into()))
            })
            .transpose()
    }
}

impl GenerativeModel for UniformParamModel {
    type Args = ();
    type Trace = SimpleTrace<()>;

    fn simulate<R: Rng + ?Sized>(&self, _args: &(), rng: &mut R) -> Result<Self::Trace> {
        Ok(Self::trace(rng.gen_range(-2..=2)))
    }

    fn generate<R: Rng + ?Sized>(
        &self,
        args: &(),
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<(Self::Trace, f64)> {
        match Self::constrained(constraints)? {
            Some(value) => Ok((Self::trace(value), Self::log_prob(value))),
            None => Ok((self.simulate(args, rng)?, 0.0)),
        }
    }

    fn update<R: Rng + ?Sized>(
        &self,
        trace: &Self::Trace,
        _args: &(),
        constraints: &ChoiceMap,
        _rng: &mut R,
    ) -> Result<UpdateResult<Self::Trace>> {
        match Self::constrained(constraints)? {
            Some(value) => {
                let new = Self::trace(value);
                Ok(UpdateResult {
                    log_weight: new.score - trace.score,
                    trace: new,
                    discard: trace.choices.clone(),
                })
            }
            None => Ok(UpdateResult {
                trace: trace.clone(),
                log_weight: 0.0,
                discard: ChoiceMap::new(),
            }),
        }
    }
}

pub fn param_of(trace: &SimpleTrace<()>) -> i64 {
    trace
        .choices
        .get(PARAM)
        .and_then(ChoiceValue::as_i64)
        .unwrap()
}

/// `N(mean, sd)` at one address, independent of its input.
#[derive(Debug, Clone)]
pub struct IndependentGaussian {
    pub address: String,
    pub mean: f64,
    pub sd: f64,
}

impl IndependentGaussian {
    pub fn new(address: &str, mean: f64, sd: f64) -> Self {
        Self {
            address: address.to_string(),
            mean,
            sd,
        }
    }
}

impl<In: ?Sized> Proposal<In> for IndependentGaussian {
    fn propose<R: Rng + ?Sized>(&self, _input: &In, rng: &mut R) -> Result<(ChoiceMap, f64)> {
        let value = gaussian(self.mean, self.sd)?.sample(rng);
        let choices = [(self.address.as_str(), value)].into_iter().collect();
        Ok((choices, normal_log_density(value, self.mean, self.sd)))
    }

    fn assess(&self, _input: &In, choices: &ChoiceMap) -> Result<f64> {
        let value = choices
            .get_f64(&self.address)
            .ok_or_else(|| SmcError::Model(format!("missing {}", self.address)))?;
        Ok(normal_log_density(value, self.mean, self.sd))
    }
}

/// Proposes the next latent state `x_T ~ N(x_{T-1}, sd)` of a `T`-step random-walk trace.
#[derive(Debug, Clone)]
pub struct NextStateProposal {
    pub sd: f64,
}

impl NextStateProposal {
    fn center(trace: &SimpleTrace<usize>) -> Result<(String, f64)> {
        let steps = trace.args;
        let last = steps
            .checked_sub(1)
            .and_then(|t| trace.choices.get_f64(&x_addr(t)))
            .ok_or_else(|| SmcError::Model("trace has no latent state".into()))?;
        Ok((x_addr(steps), last))
    }
}

impl Proposal<SimpleTrace<usize>> for NextStateProposal {
    fn propose<R: Rng + ?Sized>(
        &self,
        trace: &SimpleTrace<usize>,
        rng: &mut R,
    ) -> Result<(ChoiceMap, f64)> {
        let (address, mean) = Self::center(trace)?;
        let value = gaussian(mean, self.sd)?.sample(rng);
        let mut choices = ChoiceMap::new();
        choices.insert(address, value);
        Ok((choices, normal_log_density(value, mean, self.sd)))
    }

    fn assess(&self, trace: &SimpleTrace<usize>, choices: &ChoiceMap) -> Result<f64> {
        let (address, mean) = Self::center(trace)?;
        let value = choices
            .get_f64(&address)
            .ok_or_else(|| SmcError::Model(format!("missing {address}")))?;
        Ok(normal_log_density(value, mean, self.sd))
    }
}

/// Wraps a proposal and fails once `budget` draws have been made.
#[derive(Debug)]
pub struct ExhaustingProposal<Q> {
    pub inner: Q,
    remaining: Cell<usize>,
}

impl<Q> ExhaustingProposal<Q> {
    pub fn new(inner: Q, budget: usize) -> Self {
        Self {
            inner,
            remaining: Cell::new(budget),
        }
    }
}

impl<In: ?Sized, Q: Proposal<In>> Proposal<In> for ExhaustingProposal<Q> {
    fn propose<R: Rng + ?Sized>(&self, input: &In, rng: &mut R) -> Result<(ChoiceMap, f64)> {
        let left = self.remaining.get();
        if left == 0 {
            return Err(SmcError::Model("proposal budget exhausted".into()));
        }
        self.remaining.set(left - 1);
        self.inner.propose(input, rng)
    }

    fn assess(&self, input: &In, choices: &ChoiceMap) -> Result<f64> {
        self.inner.assess(input, choices)
    }
}

/// Wraps a model whose `generate` fails once `budget` calls have been made.
#[derive(Debug)]
pub struct ExhaustingModel<M> {
    pub inner: M,
    remaining: Cell<usize>,
}

impl<M> ExhaustingModel<M> {
    pub fn new(inner: M, budget: usize) -> Self {
        Self {
            inner,
            remaining: Cell::new(budget),
        }
    }
}

impl<M: GenerativeModel> GenerativeModel for ExhaustingModel<M> {
    type Args = M::Args;
    type Trace = M::Trace;

    fn simulate<R: Rng + ?Sized>(&self, args: &M::Args, rng: &mut R) -> Result<M::Trace> {
        self.inner.simulate(args, rng)
    }

    fn generate<R: Rng + ?Sized>(
        &self,
        args: &M::Args,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<(M::Trace, f64)> {
        let left = self.remaining.get();
        if left == 0 {
            return Err(SmcError::Model("generation budget exhausted".into()));
        }
        self.remaining.set(left - 1);
        self.inner.generate(args, constraints, rng)
    }

    fn update<R: Rng + ?Sized>(
        &self,
        trace: &M::Trace,
        args: &M::Args,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<UpdateResult<M::Trace>> {
        self.inner.update(trace, args, constraints, rng)
    }
}
