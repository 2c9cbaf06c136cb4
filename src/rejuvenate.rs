/*!
Metropolis–Hastings rejuvenation.

Rejuvenation moves particles with an MCMC kernel that leaves the current target
invariant. Weights and the log marginal-likelihood estimate are unchanged and parents
are reset to the identity, so it is typically run right after resampling to restore
diversity among duplicated particles.

The kernel proposes new values for some addresses conditioned on the current trace,
runs the model's `update` with them, and scores the discarded values under the same
proposal conditioned on the new trace. In log space the acceptance ratio is

\[
\log \alpha = w_{\text{update}} + \log q(\text{discard} \mid x') - \log q(\text{proposed} \mid x).
\]
*/

use log::debug;
use rand::Rng;

use crate::ensemble::{ParticleEnsemble, ParticleSlots, SubEnsemble};
use crate::error::Result;
use crate::model::{GenerativeModel, ProgramTrace, Proposal};

/**
Performs one Metropolis–Hastings step on `trace`.

Returns the next state and whether the proposal was accepted.

# Errors

Propagates failures of the model and the proposal.
*/
pub fn mh_step<M, Q, R>(
    model: &M,
    proposal: &Q,
    trace: &M::Trace,
    rng: &mut R,
) -> Result<(M::Trace, bool)>
where
    M: GenerativeModel,
    Q: Proposal<M::Trace>,
    R: Rng + ?Sized,
{
    let (proposed, log_q_forward) = proposal.propose(trace, rng)?;
    let result = model.update(trace, trace.args(), &proposed, rng)?;
    let log_q_backward = proposal.assess(&result.trace, &result.discard)?;
    let log_accept_ratio = result.log_weight + log_q_backward - log_q_forward;
    let u: f64 = rng.gen();
    if log_accept_ratio > u.ln() {
        Ok((result.trace, true))
    } else {
        Ok((trace.clone(), false))
    }
}

fn rejuvenate_slots<M, Q, S>(slots: &mut S, model: &M, proposal: &Q, n_iters: usize) -> Result<f64>
where
    M: GenerativeModel,
    Q: Proposal<M::Trace>,
    S: ParticleSlots<M::Trace>,
{
    let n = slots.slot_count();
    let mut accepted = 0usize;
    for i in 0..n {
        let (trace, n_accepted) = slots.with_trace(i, |prev, rng| -> Result<(M::Trace, usize)> {
            let mut current = prev.clone();
            let mut n_accepted = 0;
            for _ in 0..n_iters {
                let (next, accept) = mh_step(model, proposal, &current, rng)?;
                current = next;
                n_accepted += accept as usize;
            }
            Ok((current, n_accepted))
        })?;
        accepted += n_accepted;
        slots.stage(i, trace);
        slots.set_parent(i, i);
    }
    slots.commit();
    let total = n * n_iters;
    let rate = if total == 0 {
        0.0
    } else {
        accepted as f64 / total as f64
    };
    slots.set_acceptance_rate(rate);
    Ok(rate)
}

impl<Tr: Clone> ParticleEnsemble<Tr> {
    /**
    Applies `n_iters` Metropolis–Hastings steps to every particle.

    The mean acceptance rate is logged at debug level and available afterwards from
    [`last_acceptance_rate`](Self::last_acceptance_rate).
    */
    pub fn rejuvenate<M, Q>(&mut self, model: &M, proposal: &Q, n_iters: usize) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<Tr>,
    {
        let rate = rejuvenate_slots(self, model, proposal, n_iters)?;
        debug!(
            "rejuvenated {} particles x {n_iters} steps, acceptance rate {rate:.3}",
            self.len()
        );
        Ok(self)
    }
}

impl<Tr: Clone> SubEnsemble<'_, Tr> {
    pub fn rejuvenate<M, Q>(&mut self, model: &M, proposal: &Q, n_iters: usize) -> Result<&mut Self>
    where
        M: GenerativeModel<Trace = Tr>,
        Q: Proposal<Tr>,
    {
        rejuvenate_slots(self, model, proposal, n_iters)?;
        Ok(self)
    }
}
