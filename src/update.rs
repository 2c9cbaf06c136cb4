//! Advancing every particle to new arguments and observations.
//!
//! All three variants run the model's `update` on each trace and add its weight to the
//! particle's log weight. Updates here only extend traces: an update that discards a
//! previously recorded choice fails with [`SmcError::StructuralUpdate`]. Use an
//! [`UpdatingTranslator`](crate::translate::UpdatingTranslator) for moves that rewrite
//! existing choices.

use crate::choices::ChoiceMap;
use crate::ensemble::{ParticleEnsemble, ParticleSlots, SubEnsemble};
use crate::error::{Result, SmcError};
use crate::model::{GenerativeModel, Proposal};
use crate::stratify::{stratify, Layout};
use crate::translate::{extend_trace, move_slots};

fn update_slots<M, S>(
    slots: &mut S,
    model: &M,
    new_args: &M::Args,
    observations: &ChoiceMap,
) -> Result<()>
where
    M: GenerativeModel,
    S: ParticleSlots<M::Trace>,
{
    move_slots(slots, |_, prev, rng| {
        extend_trace(model, prev, new_args, observations, true, rng)
    })
}

fn update_slots_with_proposal<M, Q, S>(
    slots: &mut S,
    model: &M,
    new_args: &M::Args,
    observations: &ChoiceMap,
    proposal: &Q,
) -> Result<()>
where
    M: GenerativeModel,
    Q: Proposal<M::Trace>,
    S: ParticleSlots<M::Trace>,
{
    move_slots(slots, |_, prev, rng| {
        let (proposed, proposal_score) = proposal.propose(prev, rng)?;
        let constraints = proposed.merge(observations);
        let (trace, log_weight) = extend_trace(model, prev, new_args, &constraints, true, rng)?;
        Ok((trace, log_weight - proposal_score))
    })
}

fn update_slots_stratified<M, S>(
    slots: &mut S,
    model: &M,
    new_args: &M::Args,
    observations: &ChoiceMap,
    strata: &[ChoiceMap],
    layout: Layout,
) -> Result<()>
where
    M: GenerativeModel,
    S: ParticleSlots<M::Trace>,
{
    if strata.is_empty() {
        return Err(SmcError::InvalidArgument(
            "stratified update needs at least one stratum".into(),
        ));
    }
    let assignment = stratify(slots.slot_count(), strata.len(), layout, slots.rng())?;
    let constraints: Vec<ChoiceMap> = strata.iter().map(|s| s.merge(observations)).collect();
    let log_k = (strata.len() as f64).ln();
    move_slots(slots, |i, prev, rng| {
        let (trace, log_weight) =
            extend_trace(model, prev, new_args, &constraints[assignment[i]], true, rng)?;
        Ok((trace, log_weight + log_k))
    })
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /**
    Updates every trace to `new_args` with `observations` as constraints.

    # Errors

    - [`SmcError::StructuralUpdate`] if an update discards a recorded choice.
    - [`SmcError::Model`] failures from the model.
    */
    pub fn update<M>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        update_slots(self, model, new_args, observations)?;
        Ok(self)
    }

    /// Updates every trace with new choices drawn from `proposal` given the old trace;
    /// the proposal score is subtracted from the weight.
    pub fn update_with_proposal<M, Q>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
        proposal: &Q,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<Tr>,
    {
        update_slots_with_proposal(self, model, new_args, observations, proposal)?;
        Ok(self)
    }

    /// Updates every trace with the choices of its assigned stratum merged into the
    /// constraints. Weights gain `log K` for `K` strata.
    pub fn update_stratified<M>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
        strata: &[ChoiceMap],
        layout: Layout,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        update_slots_stratified(self, model, new_args, observations, strata, layout)?;
        Ok(self)
    }
}

impl<Tr: Clone> SubEnsemble<'_, Tr> {
    pub fn update<M>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        update_slots(self, model, new_args, observations)?;
        Ok(self)
    }

    pub fn update_with_proposal<M, Q>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
        proposal: &Q,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<Tr>,
    {
        update_slots_with_proposal(self, model, new_args, observations, proposal)?;
        Ok(self)
    }

    /// Strata are assigned over the view's own slots.
    pub fn update_stratified<M>(
        &mut self,
        model: &M,
        new_args: &M::Args,
        observations: &ChoiceMap,
        strata: &[ChoiceMap],
        layout: Layout,
    ) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
    {
        update_slots_stratified(self, model, new_args, observations, strata, layout)?;
        Ok(self)
    }
}
