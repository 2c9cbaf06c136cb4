//! Weighted particle ensembles for sequential Monte Carlo inference over the traces of
//! probabilistic programs.
//!
//! A [`ParticleEnsemble`] holds traces, log weights, parent indices and a running log
//! marginal-likelihood estimate. Inference steps are methods on the ensemble that mutate
//! it in place and return it for chaining:
//!
//! - initialization and updates ([`init`], [`update`]),
//! - fixed-size resampling ([`resample`]) and size changes ([`resize`]),
//! - generalized moves through trace translators ([`translate`]),
//! - Metropolis–Hastings rejuvenation ([`rejuvenate`]).
//!
//! Disjoint [`SubEnsemble`] views run the fixed-size operations on part of an ensemble,
//! in parallel if desired. The model runtime is supplied by the caller through the
//! traits in [`model`].
//!
//! # Examples
//!
//! ```rust
//! use smc_ensemble::{ParticleEnsemble, ResampleMethod, ResampleOptions};
//!
//! let mut ens = ParticleEnsemble::new(vec![1, 2, 3, 4], vec![0.0, -0.5, -8.0, 1.0])
//!     .unwrap()
//!     .set_seed(42);
//! ens.resample(ResampleMethod::Residual, &ResampleOptions::default())
//!     .unwrap();
//! assert_eq!(ens.len(), 4);
//! assert!(ens.log_weights().iter().all(|&w| w == 0.0));
//! ```

pub mod choices;
pub mod distributions;
pub mod ensemble;
pub mod error;
pub mod init;
pub mod model;
pub mod rejuvenate;
pub mod resample;
pub mod resize;
pub mod smc;
pub mod stats;
pub mod stratify;
pub mod translate;
pub mod update;
pub mod weights;

pub use choices::{ChoiceMap, ChoiceValue};
pub use ensemble::{ParticleEnsemble, SubEnsemble};
pub use error::{Result, SmcError};
pub use model::{GenerativeModel, ProgramTrace, Proposal, UpdateResult};
pub use resample::{ResampleMethod, ResampleOptions};
pub use resize::{DereplicateMethod, ResizeMethod};
pub use smc::SequentialFilter;
pub use stratify::Layout;
pub use translate::{
    Bijection, ExtendingTranslator, TraceTranslator, TranslateOptions, UpdatingTranslator,
};
pub use weights::WeightPolicy;
