/*!
Trace translators: generalized SMC moves.

A translator maps a particle's trace to a new trace and returns the incremental log
importance weight of the move. [`ParticleEnsemble::translate`] applies one to every
particle, adding the returned weight to the particle's log weight.

Two translators are provided:

- [`ExtendingTranslator`] samples auxiliary choices from a forward proposal conditioned
  on the old trace, optionally passes them through a [`Bijection`], and updates the trace
  under new arguments and observations. The update must not discard any choice already
  in the trace unless the extend-only check is switched off.

  `log_weight = update_weight - forward_score + log|det J|`

- [`UpdatingTranslator`] may rewrite existing choices. The discarded choices (or the
  auxiliary output of the bijection) are scored under a backward proposal conditioned on
  the new trace.

  `log_weight = (new_score - old_score) + backward_score - forward_score + log|det J|`

  With [`TranslateOptions::check_round_trip`] the move is inverted after every
  application and the result compared against the starting point.

# Examples

```rust
use std::sync::Arc;
use smc_ensemble::choices::ChoiceMap;
use smc_ensemble::translate::{Bijection, Transformed};

// x -> 2x on the auxiliary address "u", written to the model address "x".
let double = Bijection::new(|_model: &ChoiceMap, aux: &ChoiceMap| {
    let u = aux.get_f64("u").unwrap_or(0.0);
    Ok(Transformed {
        model: [("x", 2.0 * u)].into_iter().collect(),
        aux: ChoiceMap::new(),
        log_abs_det: 2f64.ln(),
    })
});
let out = double
    .apply(&ChoiceMap::new(), &[("u", 1.5)].into_iter().collect())
    .unwrap();
assert_eq!(out.model.get_f64("x"), Some(3.0));
assert!(!double.is_paired());
```
*/

use std::fmt;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::choices::ChoiceMap;
use crate::ensemble::{ParticleEnsemble, ParticleSlots, SubEnsemble};
use crate::error::{Result, RoundTripComponent, SmcError};
use crate::model::{GenerativeModel, ProgramTrace, Proposal};

/// Output of one direction of a [`Bijection`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Choices to write into the model trace.
    pub model: ChoiceMap,
    /// Auxiliary choices implied for the opposite-direction proposal.
    pub aux: ChoiceMap,
    /// `log|det J|` of the map at its input.
    pub log_abs_det: f64,
}

/// One direction of a bijection: `(model choices, auxiliary choices) -> Transformed`.
pub type TransformFn = Arc<dyn Fn(&ChoiceMap, &ChoiceMap) -> Result<Transformed> + Send + Sync>;

/// A deterministic, differentiable map between (model, auxiliary) choice spaces,
/// optionally paired with its inverse.
#[derive(Clone)]
pub struct Bijection {
    forward: TransformFn,
    inverse: Option<TransformFn>,
}

impl fmt::Debug for Bijection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bijection")
            .field("paired", &self.is_paired())
            .finish()
    }
}

impl Bijection {
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(&ChoiceMap, &ChoiceMap) -> Result<Transformed> + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
            inverse: None,
        }
    }

    /// Records `inverse` as the inverse of this map.
    pub fn pair<F>(mut self, inverse: F) -> Self
    where
        F: Fn(&ChoiceMap, &ChoiceMap) -> Result<Transformed> + Send + Sync + 'static,
    {
        self.inverse = Some(Arc::new(inverse));
        self
    }

    pub fn is_paired(&self) -> bool {
        self.inverse.is_some()
    }

    pub fn apply(&self, model: &ChoiceMap, aux: &ChoiceMap) -> Result<Transformed> {
        (self.forward)(model, aux)
    }

    /// The paired inverse, with this map as its own inverse.
    pub fn inverse(&self) -> Option<Bijection> {
        self.inverse.as_ref().map(|inverse| Bijection {
            forward: Arc::clone(inverse),
            inverse: Some(Arc::clone(&self.forward)),
        })
    }
}

/// Per-call options of [`ParticleEnsemble::translate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslateOptions {
    /// Invert every move and compare with the starting point.
    pub check_round_trip: bool,
    /// Absolute tolerance of the round-trip comparison.
    pub tolerance: f64,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            check_round_trip: false,
            tolerance: 1e-8,
        }
    }
}

impl TranslateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_round_trip(mut self, check: bool) -> Self {
        self.check_round_trip = check;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// A move from an old trace to a new one with an incremental log importance weight.
pub trait TraceTranslator<Tr> {
    fn apply<R: Rng + ?Sized>(
        &self,
        prev: &Tr,
        options: &TranslateOptions,
        rng: &mut R,
    ) -> Result<(Tr, f64)>;
}

/// Updates `prev` under `constraints`, rejecting the update if it discarded anything.
pub(crate) fn extend_trace<M, R>(
    model: &M,
    prev: &M::Trace,
    args: &M::Args,
    constraints: &ChoiceMap,
    extend_only: bool,
    rng: &mut R,
) -> Result<(M::Trace, f64)>
where
    M: GenerativeModel,
    R: Rng + ?Sized,
{
    let result = model.update(prev, args, constraints, rng)?;
    if extend_only && !result.discard.is_empty() {
        return Err(SmcError::StructuralUpdate {
            discarded: result.discard.addresses().cloned().collect(),
        });
    }
    Ok((result.trace, result.log_weight))
}

/// Extends traces with new choices proposed from the old trace.
pub struct ExtendingTranslator<M: GenerativeModel, Q> {
    model: M,
    new_args: M::Args,
    observations: ChoiceMap,
    proposal: Q,
    transform: Option<Bijection>,
    extend_only: bool,
}

impl<M, Q> ExtendingTranslator<M, Q>
where
    M: GenerativeModel,
    Q: Proposal<M::Trace>,
{
    pub fn new(model: M, new_args: M::Args, observations: ChoiceMap, proposal: Q) -> Self {
        Self {
            model,
            new_args,
            observations,
            proposal,
            transform: None,
            extend_only: true,
        }
    }

    /// Passes the proposed choices through `transform` before the update.
    pub fn transform(mut self, transform: Bijection) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Allows (`false`) or forbids (`true`, the default) updates that discard choices.
    pub fn extend_only(mut self, extend_only: bool) -> Self {
        self.extend_only = extend_only;
        self
    }
}

impl<M, Q> TraceTranslator<M::Trace> for ExtendingTranslator<M, Q>
where
    M: GenerativeModel,
    Q: Proposal<M::Trace>,
{
    fn apply<R: Rng + ?Sized>(
        &self,
        prev: &M::Trace,
        _options: &TranslateOptions,
        rng: &mut R,
    ) -> Result<(M::Trace, f64)> {
        let (aux, forward_score) = self.proposal.propose(prev, rng)?;
        let (proposed, log_abs_det) = match &self.transform {
            Some(bijection) => {
                let out = bijection.apply(prev.choices(), &aux)?;
                (out.model, out.log_abs_det)
            }
            None => (aux, 0.0),
        };
        let constraints = proposed.merge(&self.observations);
        let (trace, update_weight) = extend_trace(
            &self.model,
            prev,
            &self.new_args,
            &constraints,
            self.extend_only,
            rng,
        )?;
        Ok((trace, update_weight - forward_score + log_abs_det))
    }
}

/// Moves traces with a forward proposal, scoring the reverse move under a backward
/// proposal.
pub struct UpdatingTranslator<M: GenerativeModel, F, B> {
    model: M,
    new_args: M::Args,
    observations: ChoiceMap,
    forward: F,
    backward: B,
    transform: Option<Bijection>,
}

/// State produced by one forward pass, kept for the round-trip check.
struct ForwardPass<Tr> {
    trace: Tr,
    forward_choices: ChoiceMap,
    backward_choices: ChoiceMap,
    log_weight: f64,
}

impl<M, F, B> UpdatingTranslator<M, F, B>
where
    M: GenerativeModel,
    F: Proposal<M::Trace>,
    B: Proposal<M::Trace>,
{
    pub fn new(
        model: M,
        new_args: M::Args,
        observations: ChoiceMap,
        forward: F,
        backward: B,
    ) -> Self {
        Self {
            model,
            new_args,
            observations,
            forward,
            backward,
            transform: None,
        }
    }

    /// Maps (old choices, forward choices) to (new choices, backward choices). The
    /// bijection must be paired with its inverse.
    pub fn transform(mut self, transform: Bijection) -> Self {
        self.transform = Some(transform);
        self
    }

    fn forward_pass<R: Rng + ?Sized>(
        &self,
        prev: &M::Trace,
        rng: &mut R,
    ) -> Result<ForwardPass<M::Trace>> {
        let (forward_choices, forward_score) = self.forward.propose(prev, rng)?;
        let (proposed, implied_backward, log_abs_det) = match &self.transform {
            Some(bijection) => {
                if !bijection.is_paired() {
                    return Err(SmcError::Configuration(
                        "updating translator needs a bijection paired with its inverse".into(),
                    ));
                }
                let out = bijection.apply(prev.choices(), &forward_choices)?;
                (out.model, Some(out.aux), out.log_abs_det)
            }
            None => (forward_choices.clone(), None, 0.0),
        };
        let constraints = proposed.merge(&self.observations);
        let result = self.model.update(prev, &self.new_args, &constraints, rng)?;
        let backward_choices = implied_backward.unwrap_or(result.discard);
        let backward_score = self.backward.assess(&result.trace, &backward_choices)?;
        let log_weight = result.trace.score() - prev.score() + backward_score - forward_score
            + log_abs_det;
        Ok(ForwardPass {
            trace: result.trace,
            forward_choices,
            backward_choices,
            log_weight,
        })
    }

    /// Runs the inverse move from the new trace and compares it with the old one.
    fn check_round_trip<R: Rng + ?Sized>(
        &self,
        prev: &M::Trace,
        pass: &ForwardPass<M::Trace>,
        tolerance: f64,
        rng: &mut R,
    ) -> Result<()> {
        let (constraints, implied_forward, log_abs_det) = match &self.transform {
            Some(bijection) => {
                let inverse = bijection.inverse().ok_or_else(|| {
                    SmcError::Configuration("round-trip check needs a paired inverse".into())
                })?;
                let out = inverse.apply(pass.trace.choices(), &pass.backward_choices)?;
                (out.model, Some(out.aux), out.log_abs_det)
            }
            None => (pass.backward_choices.clone(), None, 0.0),
        };
        let result = self.model.update(&pass.trace, prev.args(), &constraints, rng)?;
        let recovered_forward = implied_forward.unwrap_or(result.discard);

        if !result.trace.choices().approx_eq(prev.choices(), tolerance) {
            return Err(SmcError::RoundTrip {
                component: RoundTripComponent::ModelState,
                detail: format!(
                    "inverse move produced {:?}, expected {:?}",
                    result.trace.choices(),
                    prev.choices()
                ),
            });
        }
        if !recovered_forward.approx_eq(&pass.forward_choices, tolerance) {
            return Err(SmcError::RoundTrip {
                component: RoundTripComponent::AuxiliaryChoices,
                detail: format!(
                    "inverse move implied forward choices {:?}, sampled {:?}",
                    recovered_forward, pass.forward_choices
                ),
            });
        }
        let forward_score = self.forward.assess(&result.trace, &recovered_forward)?;
        let backward_score = self.backward.assess(&pass.trace, &pass.backward_choices)?;
        let reverse_weight = result.trace.score() - pass.trace.score() + forward_score
            - backward_score
            + log_abs_det;
        if (reverse_weight + pass.log_weight).abs() > tolerance {
            return Err(SmcError::RoundTrip {
                component: RoundTripComponent::Weight,
                detail: format!(
                    "forward weight {} and inverse weight {} do not cancel",
                    pass.log_weight, reverse_weight
                ),
            });
        }
        Ok(())
    }
}

impl<M, F, B> TraceTranslator<M::Trace> for UpdatingTranslator<M, F, B>
where
    M: GenerativeModel,
    F: Proposal<M::Trace>,
    B: Proposal<M::Trace>,
{
    fn apply<R: Rng + ?Sized>(
        &self,
        prev: &M::Trace,
        options: &TranslateOptions,
        rng: &mut R,
    ) -> Result<(M::Trace, f64)> {
        let pass = self.forward_pass(prev, rng)?;
        if options.check_round_trip {
            self.check_round_trip(prev, &pass, options.tolerance, rng)?;
        }
        Ok((pass.trace, pass.log_weight))
    }
}

/// Moves every slot with `step`, adding the returned log weight to the slot's weight.
/// Parents are reset to the identity.
pub(crate) fn move_slots<Tr, S, F>(slots: &mut S, mut step: F) -> Result<()>
where
    Tr: Clone,
    S: ParticleSlots<Tr>,
    F: FnMut(usize, &Tr, &mut SmallRng) -> Result<(Tr, f64)>,
{
    for i in 0..slots.slot_count() {
        let (trace, log_weight) = slots.with_trace(i, |prev, rng| step(i, prev, rng))?;
        slots.stage(i, trace);
        slots.add_log_weight(i, log_weight);
        slots.set_parent(i, i);
    }
    slots.commit();
    Ok(())
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /// Applies `translator` to every particle. Weights are incremented by the move's
    /// log weight; the log marginal-likelihood estimate is unchanged.
    pub fn translate<T>(&mut self, translator: &T, options: &TranslateOptions) -> Result<&mut Self>
    where
        T: TraceTranslator<Tr>,
    {
        move_slots(self, |_, prev, rng| translator.apply(prev, options, rng))?;
        Ok(self)
    }
}

impl<Tr: Clone> SubEnsemble<'_, Tr> {
    /// Applies `translator` to every particle of the view.
    pub fn translate<T>(&mut self, translator: &T, options: &TranslateOptions) -> Result<&mut Self>
    where
        T: TraceTranslator<Tr>,
    {
        move_slots(self, |_, prev, rng| translator.apply(prev, options, rng))?;
        Ok(self)
    }
}
