mod common;

use approx::assert_abs_diff_eq;
use common::*;
use smc_ensemble::choices::ChoiceMap;
use smc_ensemble::distributions::normal_log_density;
use smc_ensemble::ensemble::ParticleEnsemble;
use smc_ensemble::error::{RoundTripComponent, SmcError};
use smc_ensemble::stratify::Layout;
use smc_ensemble::translate::{
    Bijection, ExtendingTranslator, TranslateOptions, Transformed, UpdatingTranslator,
};

const PRIOR_SD: f64 = 1.0;
const STEP_SD: f64 = 0.5;
const OBS_SD: f64 = 0.4;

fn model() -> RandomWalkModel {
    RandomWalkModel::new(PRIOR_SD, STEP_SD, OBS_SD)
}

fn one_step_ensemble(n: usize) -> ParticleEnsemble<SimpleTrace<usize>> {
    ParticleEnsemble::initialize(&model(), &1, &observations(&[0.5]), n, SEED).unwrap()
}

fn x(trace: &SimpleTrace<usize>, t: usize) -> f64 {
    trace.choices.get_f64(&x_addr(t)).unwrap()
}

#[test]
fn extending_weight_matches_closed_form() {
    let mut ens = one_step_ensemble(50);
    let before = ens.log_weights().to_vec();
    let proposal = NextStateProposal { sd: 0.8 };
    let obs: ChoiceMap = [(y_addr(1), 0.7)].into_iter().collect();
    let translator = ExtendingTranslator::new(model(), 2, obs, proposal);
    ens.translate(&translator, &TranslateOptions::default())
        .unwrap();

    for (i, trace) in ens.traces().iter().enumerate() {
        let (x0, x1) = (x(trace, 0), x(trace, 1));
        let model_delta =
            normal_log_density(x1, x0, STEP_SD) + normal_log_density(0.7, x1, OBS_SD);
        let forward = normal_log_density(x1, x0, 0.8);
        assert_abs_diff_eq!(
            ens.log_weights()[i] - before[i],
            model_delta - forward,
            epsilon = 1e-10
        );
        assert_eq!(trace.args, 2);
    }
    assert_eq!(ens.parents(), (0..50).collect::<Vec<_>>().as_slice());
    assert_eq!(ens.log_ml_estimate(), 0.0);
}

#[test]
fn extending_translator_rejects_discards() {
    let mut ens = one_step_ensemble(10);
    // Re-observing y0 overwrites a committed choice.
    let obs: ChoiceMap = [(y_addr(0), 2.0), (y_addr(1), 0.7)].into_iter().collect();
    let strict = ExtendingTranslator::new(model(), 2, obs.clone(), NextStateProposal { sd: 0.8 });
    match ens.translate(&strict, &TranslateOptions::default()) {
        Err(SmcError::StructuralUpdate { discarded }) => assert_eq!(discarded, vec![y_addr(0)]),
        other => panic!("expected a structural update error, got {other:?}"),
    }

    let mut ens = one_step_ensemble(10);
    let lenient =
        ExtendingTranslator::new(model(), 2, obs, NextStateProposal { sd: 0.8 }).extend_only(false);
    ens.translate(&lenient, &TranslateOptions::default())
        .unwrap();
    assert!(ens.traces().iter().all(|t| t.choices.get_f64("y0") == Some(2.0)));
}

#[test]
fn extending_with_bijection_adds_jacobian() {
    let mut ens = one_step_ensemble(20);
    let before = ens.log_weights().to_vec();
    let stretch = Bijection::new(|model: &ChoiceMap, aux: &ChoiceMap| {
        let x0 = model.get_f64("x0").unwrap_or(0.0);
        let u = aux.get_f64("u").unwrap_or(0.0);
        Ok(Transformed {
            model: [("x1", x0 + 2.0 * u)].into_iter().collect(),
            aux: ChoiceMap::new(),
            log_abs_det: 2f64.ln(),
        })
    });
    let obs: ChoiceMap = [(y_addr(1), -0.2)].into_iter().collect();
    let translator =
        ExtendingTranslator::new(model(), 2, obs, IndependentGaussian::new("u", 0.0, 1.0))
            .transform(stretch);
    ens.translate(&translator, &TranslateOptions::default())
        .unwrap();

    for (i, trace) in ens.traces().iter().enumerate() {
        let (x0, x1) = (x(trace, 0), x(trace, 1));
        let u = (x1 - x0) / 2.0;
        let expected = normal_log_density(x1, x0, STEP_SD) + normal_log_density(-0.2, x1, OBS_SD)
            - normal_log_density(u, 0.0, 1.0)
            + 2f64.ln();
        assert_abs_diff_eq!(ens.log_weights()[i] - before[i], expected, epsilon = 1e-9);
        assert!(!trace.choices.contains("u"));
    }
}

/// `x0 -> x0 + u`, with backward auxiliary `-u`. The map is its own inverse.
fn shift(model: &ChoiceMap, aux: &ChoiceMap) -> smc_ensemble::Result<Transformed> {
    let x0 = model
        .get_f64("x0")
        .ok_or_else(|| SmcError::Model("no x0".into()))?;
    let u = aux
        .get_f64("u")
        .ok_or_else(|| SmcError::Model("no u".into()))?;
    Ok(Transformed {
        model: [("x0", x0 + u)].into_iter().collect(),
        aux: [("u", -u)].into_iter().collect(),
        log_abs_det: 0.0,
    })
}

#[test]
fn updating_translator_passes_round_trip_check() {
    let mut ens = one_step_ensemble(30);
    let old = ens.clone();
    let translator = UpdatingTranslator::new(
        model(),
        1,
        ChoiceMap::new(),
        IndependentGaussian::new("u", 0.0, 0.3),
        IndependentGaussian::new("u", 0.0, 0.3),
    )
    .transform(Bijection::new(shift).pair(shift));
    ens.translate(&translator, &TranslateOptions::new().check_round_trip(true))
        .unwrap();

    for i in 0..ens.len() {
        let (prev, next) = (&old.traces()[i], &ens.traces()[i]);
        // Symmetric auxiliary proposal and unit Jacobian: only the score ratio remains.
        assert_abs_diff_eq!(
            ens.log_weights()[i] - old.log_weights()[i],
            next.score - prev.score,
            epsilon = 1e-9
        );
        assert_eq!(next.choices.get_f64("y0"), Some(0.5));
    }
}

#[test]
fn updating_translator_without_transform_scores_discards() {
    let mut ens = one_step_ensemble(30);
    let old = ens.clone();
    let translator = UpdatingTranslator::new(
        model(),
        1,
        ChoiceMap::new(),
        IndependentGaussian::new("x0", 0.0, 2.0),
        IndependentGaussian::new("x0", 1.0, 2.0),
    );
    ens.translate(&translator, &TranslateOptions::new().check_round_trip(true))
        .unwrap();

    for i in 0..ens.len() {
        let (prev, next) = (&old.traces()[i], &ens.traces()[i]);
        let expected = next.score - prev.score + normal_log_density(x(prev, 0), 1.0, 2.0)
            - normal_log_density(x(next, 0), 0.0, 2.0);
        assert_abs_diff_eq!(
            ens.log_weights()[i] - old.log_weights()[i],
            expected,
            epsilon = 1e-9
        );
    }
}

#[test]
fn mismatched_inverse_fails_round_trip() {
    let mut ens = one_step_ensemble(5);
    let wrong_inverse = |model: &ChoiceMap, aux: &ChoiceMap| -> smc_ensemble::Result<Transformed> {
        let mut out = shift(model, aux)?;
        out.model = out
            .model
            .iter()
            .map(|(a, v)| (a.clone(), v.as_f64().unwrap_or(0.0) + 1.0))
            .collect();
        Ok(out)
    };
    let translator = UpdatingTranslator::new(
        model(),
        1,
        ChoiceMap::new(),
        IndependentGaussian::new("u", 0.0, 0.3),
        IndependentGaussian::new("u", 0.0, 0.3),
    )
    .transform(Bijection::new(shift).pair(wrong_inverse));
    match ens.translate(&translator, &TranslateOptions::new().check_round_trip(true)) {
        Err(SmcError::RoundTrip { component, .. }) => {
            assert_eq!(component, RoundTripComponent::ModelState)
        }
        other => panic!("expected a round-trip failure, got {other:?}"),
    }
}

fn shift_translator<G>(
    inverse: G,
) -> UpdatingTranslator<RandomWalkModel, IndependentGaussian, IndependentGaussian>
where
    G: Fn(&ChoiceMap, &ChoiceMap) -> smc_ensemble::Result<Transformed> + Send + Sync + 'static,
{
    UpdatingTranslator::new(
        model(),
        1,
        ChoiceMap::new(),
        IndependentGaussian::new("u", 0.0, 0.3),
        IndependentGaussian::new("u", 0.0, 0.3),
    )
    .transform(Bijection::new(shift).pair(inverse))
}

#[test]
fn wrong_auxiliary_inverse_fails_round_trip() {
    let mut ens = one_step_ensemble(5);
    let translator = shift_translator(|model: &ChoiceMap, aux: &ChoiceMap| {
        let mut out = shift(model, aux)?;
        out.aux = [("u", 1.0)].into_iter().collect();
        Ok(out)
    });
    match ens.translate(&translator, &TranslateOptions::new().check_round_trip(true)) {
        Err(SmcError::RoundTrip { component, .. }) => {
            assert_eq!(component, RoundTripComponent::AuxiliaryChoices)
        }
        other => panic!("expected a round-trip failure, got {other:?}"),
    }
}

#[test]
fn non_cancelling_jacobian_fails_round_trip() {
    let mut ens = one_step_ensemble(5);
    let translator = shift_translator(|model: &ChoiceMap, aux: &ChoiceMap| {
        let mut out = shift(model, aux)?;
        out.log_abs_det = 0.7;
        Ok(out)
    });
    match ens.translate(&translator, &TranslateOptions::new().check_round_trip(true)) {
        Err(SmcError::RoundTrip { component, .. }) => {
            assert_eq!(component, RoundTripComponent::Weight)
        }
        other => panic!("expected a round-trip failure, got {other:?}"),
    }
}

#[test]
fn updating_translator_requires_paired_bijection() {
    let mut ens = one_step_ensemble(5);
    let translator = UpdatingTranslator::new(
        model(),
        1,
        ChoiceMap::new(),
        IndependentGaussian::new("u", 0.0, 0.3),
        IndependentGaussian::new("u", 0.0, 0.3),
    )
    .transform(Bijection::new(shift));
    assert!(matches!(
        ens.translate(&translator, &TranslateOptions::default()),
        Err(SmcError::Configuration(_))
    ));
}

#[test]
fn translating_a_view_leaves_other_slots_alone() {
    let mut ens = one_step_ensemble(12);
    let old = ens.clone();
    let obs: ChoiceMap = [(y_addr(1), 0.7)].into_iter().collect();
    let translator = ExtendingTranslator::new(model(), 2, obs, NextStateProposal { sd: 0.8 });
    {
        let mut views = ens.views(3, Layout::Interleaved).unwrap();
        views[1]
            .translate(&translator, &TranslateOptions::default())
            .unwrap();
    }
    for i in 0..12 {
        if i % 3 == 1 {
            assert_eq!(ens.traces()[i].args, 2);
        } else {
            assert_eq!(ens.traces()[i], old.traces()[i]);
            assert_eq!(ens.log_weights()[i], old.log_weights()[i]);
        }
    }
    assert_eq!(ens.log_ml_estimate(), 0.0);
}
