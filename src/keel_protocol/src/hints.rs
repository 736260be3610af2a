//! Read-only helpers that compute list hints off-line, so that operations
//! can resolve their insert position within the bounded walk.

use crate::numeric::{compute_nominal_cr, Nicr, UsdColl, KUSD};
use crate::sorted_troves::NominalRatioSource;
use crate::state::State;
use crate::ValidationError;
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproxHint {
    pub hint: Principal,
    /// Distance between the hint's NICR and the requested one.
    pub diff: Nicr,
    /// Pass back in to continue sampling where this call stopped.
    pub latest_random_seed: u64,
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionHints {
    pub first_redemption_hint: Option<Principal>,
    /// Zero when no trove would be partially redeemed.
    pub partial_redemption_hint_nicr: Nicr,
    /// The part of the requested amount that can actually be redeemed.
    pub truncated_kusd_amount: KUSD,
}

fn next_seed(seed: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(seed);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn seed_to_u64(seed: &[u8; 32]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&seed[..8]);
    u64::from_be_bytes(bytes)
}

impl State {
    /// Samples `num_trials` owners and returns the one whose NICR is closest
    /// to `nicr`. Used as the starting hint of an insert.
    pub fn get_approx_hint(
        &self,
        nicr: Nicr,
        num_trials: u32,
        random_seed: u64,
    ) -> Result<ApproxHint, ValidationError> {
        let mut hint = self
            .sorted_troves
            .last()
            .ok_or(ValidationError::EmptyTroveList)?;
        let view = self.ledger_view();
        let mut diff = view.nominal_icr(&hint).abs_diff(nicr);

        let count = self.trove_owners.len() as u64;
        let mut seed = next_seed(&random_seed.to_be_bytes());
        for _ in 0..num_trials {
            seed = next_seed(&seed);
            let candidate = self.trove_owners[(seed_to_u64(&seed) % count) as usize];
            let candidate_diff = view.nominal_icr(&candidate).abs_diff(nicr);
            if candidate_diff < diff {
                diff = candidate_diff;
                hint = candidate;
            }
        }
        Ok(ApproxHint {
            hint,
            diff,
            latest_random_seed: seed_to_u64(&seed),
        })
    }

    /// Simulates a redemption of `kusd_amount` and returns the hints it
    /// needs. Zero `max_iterations` means no limit. Like the redemption
    /// itself, the simulation never closes the last trove.
    pub fn get_redemption_hints(
        &self,
        kusd_amount: KUSD,
        price: UsdColl,
        max_iterations: u32,
    ) -> Result<RedemptionHints, ValidationError> {
        let config = &self.config;
        let first_redemption_hint = self.first_redemption_candidate(price)?;
        let mut current = first_redemption_hint;
        let mut remaining = kusd_amount;
        let mut partial_redemption_hint_nicr = 0;
        let mut iterations = 0u32;
        let mut active_troves = self.trove_owners_count();

        while let Some(owner) = current {
            if remaining.is_zero() || (max_iterations != 0 && iterations >= max_iterations) {
                break;
            }
            iterations += 1;
            let entire = match self.entire_debt_and_coll(&owner) {
                Some(entire) => entire,
                None => break,
            };
            let net_debt = entire.debt - config.gas_compensation;
            if net_debt > remaining {
                if net_debt > config.min_net_debt {
                    let max_redeemable = remaining.min(net_debt - config.min_net_debt);
                    let new_coll = entire.coll - (max_redeemable / price).min(entire.coll);
                    let new_debt = entire.debt - max_redeemable;
                    partial_redemption_hint_nicr = compute_nominal_cr(new_coll, new_debt);
                    remaining -= max_redeemable;
                }
                break;
            }
            if active_troves <= 1 {
                break;
            }
            active_troves -= 1;
            remaining -= net_debt;
            current = self.sorted_troves.prev(&owner);
        }

        Ok(RedemptionHints {
            first_redemption_hint,
            partial_redemption_hint_nicr,
            truncated_kusd_amount: kusd_amount - remaining,
        })
    }
}
