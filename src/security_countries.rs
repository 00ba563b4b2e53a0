//! Security-country setup and recovery rules.
//!
//! A configured user owns a fixed set of countries. Setup shows a balanced random pool to pick from;
//! recovery shows the user's countries mixed with decoys and accepts a partial match.

use crate::errors::{AppError, AppResult};
use crate::models::{Country, Region};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Unconfigured,
    Configured,
}

impl SetupState {
    /// Anything short of the full set counts as not configured.
    pub fn from_count(configured: usize, required: usize) -> Self {
        if configured >= required {
            Self::Configured
        } else {
            Self::Unconfigured
        }
    }
}

/// Draws up to `limit / 2` countries from the first pool and the remainder from the second, each pool
/// shuffled before truncation, then shuffles the combined selection.
pub fn select_setup_candidates<R: Rng + ?Sized>(
    mut africa: Vec<Country>,
    mut latam: Vec<Country>,
    limit: usize,
    rng: &mut R,
) -> Vec<Country> {
    let half = limit / 2;
    africa.shuffle(rng);
    latam.shuffle(rng);
    africa.truncate(half);
    latam.truncate(limit - half);

    let mut selected = africa;
    selected.append(&mut latam);
    selected.shuffle(rng);
    selected
}

/// Splits the active catalog into the two setup pools.
pub fn partition_by_region(countries: Vec<Country>) -> (Vec<Country>, Vec<Country>) {
    countries
        .into_iter()
        .partition(|country| country.region == Region::Africa)
}

/// Builds the recovery challenge: every correct country plus random decoys up to `total`,
/// interleaved by a final shuffle.
pub fn build_recovery_challenge<R: Rng + ?Sized>(
    active: Vec<Country>,
    correct: &BTreeSet<i64>,
    total: usize,
    rng: &mut R,
) -> Vec<Country> {
    let (mut challenge, mut decoys): (Vec<Country>, Vec<Country>) = active
        .into_iter()
        .partition(|country| correct.contains(&country.id));

    let decoys_needed = total.saturating_sub(challenge.len());
    decoys.shuffle(rng);
    decoys.truncate(decoys_needed);

    challenge.append(&mut decoys);
    challenge.shuffle(rng);
    challenge
}

pub fn count_matches(correct: &BTreeSet<i64>, selected: &[i64]) -> usize {
    let unique = selected.iter().copied().collect::<BTreeSet<i64>>();
    unique.intersection(correct).count()
}

/// Decoys in the selection are not penalized; only the overlap with the correct set matters.
pub fn verify_selection(correct: &BTreeSet<i64>, selected: &[i64], min_correct: usize) -> bool {
    count_matches(correct, selected) >= min_correct
}

/// Shape checks that need no catalog lookup: exact cardinality and no repeats.
pub fn validate_selection(country_ids: &[i64], required: usize) -> AppResult<()> {
    if country_ids.len() != required {
        return Err(AppError::Validation(format!(
            "Must select exactly {} countries",
            required
        )));
    }

    let unique = country_ids.iter().collect::<BTreeSet<_>>();
    if unique.len() != country_ids.len() {
        return Err(AppError::Validation(
            "Cannot select the same country more than once".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        build_recovery_challenge, count_matches, partition_by_region, select_setup_candidates,
        validate_selection, verify_selection, SetupState,
    };
    use crate::errors::AppError;
    use crate::models::{Country, Region};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn catalog() -> Vec<Country> {
        (1..=30)
            .map(|id| Country {
                id,
                name: format!("country-{}", id),
                region: if id <= 15 { Region::Africa } else { Region::Latam },
            })
            .collect()
    }

    fn ids(countries: &[Country]) -> BTreeSet<i64> {
        countries.iter().map(|country| country.id).collect()
    }

    #[test]
    fn setup_pool_is_balanced_across_regions() {
        let mut rng = StdRng::seed_from_u64(7);
        let (africa, latam) = partition_by_region(catalog());
        let selected = select_setup_candidates(africa, latam, 15, &mut rng);

        assert_eq!(selected.len(), 15);
        assert_eq!(ids(&selected).len(), 15);
        let african = selected.iter().filter(|c| c.region == Region::Africa).count();
        assert_eq!(african, 7);
        assert_eq!(selected.len() - african, 8);
    }

    #[test]
    fn setup_pool_is_capped_by_small_regions() {
        let mut rng = StdRng::seed_from_u64(1);
        let (africa, latam) = partition_by_region(catalog());
        let selected = select_setup_candidates(africa.into_iter().take(3).collect(), latam, 10, &mut rng);
        assert_eq!(selected.len(), 8);
    }

    #[test]
    fn setup_pool_varies_between_draws() {
        let mut rng = StdRng::seed_from_u64(42);
        let (africa, latam) = partition_by_region(catalog());
        let first = select_setup_candidates(africa.clone(), latam.clone(), 10, &mut rng);
        let second = select_setup_candidates(africa, latam, 10, &mut rng);
        let first_ids = first.iter().map(|c| c.id).collect::<Vec<_>>();
        let second_ids = second.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_ne!(first_ids, second_ids);
    }

    #[test]
    fn recovery_challenge_contains_every_correct_country_and_fills_with_decoys() {
        let mut rng = StdRng::seed_from_u64(3);
        let correct: BTreeSet<i64> = [2, 9, 17, 21, 30].into_iter().collect();
        let challenge = build_recovery_challenge(catalog(), &correct, 10, &mut rng);

        assert_eq!(challenge.len(), 10);
        let shown = ids(&challenge);
        assert_eq!(shown.len(), 10);
        assert!(correct.is_subset(&shown));
    }

    #[test]
    fn recovery_challenge_interleaves_correct_and_decoys() {
        let correct: BTreeSet<i64> = [1, 2, 3, 4, 5].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(11);
        let orderings = (0..8)
            .map(|_| {
                build_recovery_challenge(catalog(), &correct, 10, &mut rng)
                    .iter()
                    .map(|c| correct.contains(&c.id))
                    .collect::<Vec<_>>()
            })
            .collect::<BTreeSet<_>>();
        assert!(orderings.len() > 1);
    }

    #[test]
    fn verification_needs_three_matches_and_ignores_decoys() {
        let correct: BTreeSet<i64> = [1, 2, 3, 4, 5].into_iter().collect();
        assert!(verify_selection(&correct, &[1, 2, 3], 3));
        assert!(!verify_selection(&correct, &[1, 2, 6, 7], 3));
        assert!(verify_selection(&correct, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 3));
        assert_eq!(count_matches(&correct, &[1, 1, 1, 2]), 2);
    }

    #[test]
    fn selection_shape_is_checked() {
        assert!(validate_selection(&[1, 2, 3, 4, 5], 5).is_ok());
        assert!(matches!(
            validate_selection(&[1, 2, 3, 4], 5),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_selection(&[1, 2, 3, 4, 5, 6], 5),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_selection(&[1, 2, 3, 4, 4], 5),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn partial_configuration_is_unconfigured() {
        assert_eq!(SetupState::from_count(0, 5), SetupState::Unconfigured);
        assert_eq!(SetupState::from_count(4, 5), SetupState::Unconfigured);
        assert_eq!(SetupState::from_count(5, 5), SetupState::Configured);
    }
}
