/*!
Interfaces to the probabilistic-program runtime.

The ensemble engine never looks inside a program. It needs five capabilities from
the runtime, split over three traits:

- [`ProgramTrace`]: a recorded execution exposing its score, its choices and the
  arguments it was run with.
- [`GenerativeModel`]: `simulate`, `generate` and `update` over traces.
- [`Proposal`]: `propose` (sample choices and their log density) and `assess`
  (score given choices), conditioned on some input such as the current trace.

Trace handles are cloned freely by the engine, so implementors should make
`Clone` cheap (for example by wrapping the trace contents in an `Rc` or `Arc`).
*/

use rand::Rng;

use crate::choices::ChoiceMap;
use crate::error::Result;

/// A recorded execution of a generative model.
pub trait ProgramTrace: Clone {
    /// Arguments the program was executed with.
    type Args: Clone;

    /// Log joint density of all random choices in the trace.
    fn score(&self) -> f64;

    /// The random choices recorded in the trace.
    fn choices(&self) -> &ChoiceMap;

    fn args(&self) -> &Self::Args;
}

/// Outcome of [`GenerativeModel::update`].
#[derive(Debug, Clone)]
pub struct UpdateResult<Tr> {
    /// The updated trace.
    pub trace: Tr,
    /// Incremental importance weight of the update.
    pub log_weight: f64,
    /// Previously recorded choices that the update overwrote or removed.
    pub discard: ChoiceMap,
}

/// A generative model as seen by the ensemble engine.
pub trait GenerativeModel {
    type Args: Clone;
    type Trace: ProgramTrace<Args = Self::Args>;

    /// Runs the program unconstrained.
    fn simulate<R: Rng + ?Sized>(&self, args: &Self::Args, rng: &mut R) -> Result<Self::Trace>;

    /// Runs the program with `constraints` fixed, returning the trace and the log
    /// importance weight of the constrained choices.
    fn generate<R: Rng + ?Sized>(
        &self,
        args: &Self::Args,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<(Self::Trace, f64)>;

    /// Re-executes `trace` under `args`, overwriting choices with `constraints`.
    fn update<R: Rng + ?Sized>(
        &self,
        trace: &Self::Trace,
        args: &Self::Args,
        constraints: &ChoiceMap,
        rng: &mut R,
    ) -> Result<UpdateResult<Self::Trace>>;
}

/// A proposal distribution over choice maps, conditioned on `In`.
pub trait Proposal<In: ?Sized> {
    /// Samples choices, returning them with their log density.
    fn propose<R: Rng + ?Sized>(&self, input: &In, rng: &mut R) -> Result<(ChoiceMap, f64)>;

    /// Log density of `choices` under the proposal.
    fn assess(&self, input: &In, choices: &ChoiceMap) -> Result<f64>;
}
