//! Conversion of an app's final state into balance increments.

use std::collections::BTreeMap;

use super::{AppInstance, Error, OutcomeSpec};
use crate::abiencode::types::{Address, U256};
use crate::abiencode::AbiValue;

/// Interpret `app.latest_state` according to the app's outcome type.
///
/// Returns `token -> [(beneficiary, amount)]`, the free balance increments
/// applied at uninstall time. Pure; no channel mutation happens here.
pub fn compute_outcome(app: &AppInstance) -> Result<BTreeMap<Address, Vec<(Address, U256)>>, Error> {
    let mut out = BTreeMap::new();
    match &app.outcome {
        OutcomeSpec::TwoPartyFixedOutcome {
            token,
            amount,
            beneficiaries,
        } => {
            // The final state's first field selects the winner: 0 sends the
            // whole amount to the first beneficiary, 1 to the second, any
            // other value splits evenly with the remainder to the first.
            let selector = match app.latest_state.first() {
                Some(AbiValue::Uint(v)) => *v,
                _ => {
                    return Err(Error::InvalidOutcomeState(
                        "two-party fixed outcome states start with a uint selector",
                    ))
                }
            };
            let transfers = if selector == U256::zero() {
                vec![(beneficiaries[0], *amount)]
            } else if selector == U256::one() {
                vec![(beneficiaries[1], *amount)]
            } else {
                let half = *amount / 2;
                vec![(beneficiaries[0], *amount - half), (beneficiaries[1], half)]
            };
            out.insert(*token, transfers);
        }
        OutcomeSpec::SingleAssetTwoPartyCoinTransfer { token, limit } => {
            // The final state lists the transfers itself:
            // [((to, amount), ...)], capped by the interpreter limit.
            let entries = match app.latest_state.first() {
                Some(AbiValue::Array(entries)) => entries,
                _ => {
                    return Err(Error::InvalidOutcomeState(
                        "coin transfer states start with an array of (to, amount) tuples",
                    ))
                }
            };
            let mut transfers = Vec::with_capacity(entries.len());
            let mut total = U256::zero();
            for entry in entries {
                let (to, amount) = match entry {
                    AbiValue::Tuple(fields) => match fields.as_slice() {
                        [AbiValue::Address(to), AbiValue::Uint(amount)] => (*to, *amount),
                        _ => {
                            return Err(Error::InvalidOutcomeState(
                                "coin transfer entries are (address, uint256) tuples",
                            ))
                        }
                    },
                    _ => {
                        return Err(Error::InvalidOutcomeState(
                            "coin transfer entries are (address, uint256) tuples",
                        ))
                    }
                };
                // A sum past 2^256-1 exceeds every possible limit.
                total = total.checked_add(amount).ok_or(Error::OutcomeExceedsLimit {
                    limit: *limit,
                    total: U256::max_value(),
                })?;
                transfers.push((to, amount));
            }
            if total > *limit {
                return Err(Error::OutcomeExceedsLimit {
                    limit: *limit,
                    total,
                });
            }
            out.insert(*token, transfers);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abiencode::{AbiEncodings, AbiType};

    const ETH: Address = Address([0u8; 20]);

    fn fixed_outcome_app(selector: u64) -> AppInstance {
        AppInstance {
            multisig_address: Address([0xcc; 20]),
            signing_keys: vec![Address([0x01; 20]), Address([0x02; 20])],
            app_definition: Address([0xdd; 20]),
            abi_encodings: AbiEncodings {
                state: vec![AbiType::Uint256],
                action: None,
            },
            default_timeout: 100,
            app_seq_no: 1,
            latest_state: vec![AbiValue::Uint(U256::from(selector))],
            latest_version_number: 1,
            latest_timeout: 100,
            outcome: OutcomeSpec::TwoPartyFixedOutcome {
                token: ETH,
                amount: U256::from(10),
                beneficiaries: [Address([0xa1; 20]), Address([0xa2; 20])],
            },
        }
    }

    #[test]
    fn fixed_outcome_selects_winner() {
        let outcome = compute_outcome(&fixed_outcome_app(0)).unwrap();
        assert_eq!(outcome[&ETH], vec![(Address([0xa1; 20]), U256::from(10))]);

        let outcome = compute_outcome(&fixed_outcome_app(1)).unwrap();
        assert_eq!(outcome[&ETH], vec![(Address([0xa2; 20]), U256::from(10))]);
    }

    #[test]
    fn fixed_outcome_split_keeps_total() {
        let outcome = compute_outcome(&fixed_outcome_app(2)).unwrap();
        let total: U256 = outcome[&ETH]
            .iter()
            .fold(U256::zero(), |acc, (_, v)| acc + *v);
        assert_eq!(total, U256::from(10));
    }

    #[test]
    fn coin_transfer_respects_limit() {
        let mut app = fixed_outcome_app(0);
        app.outcome = OutcomeSpec::SingleAssetTwoPartyCoinTransfer {
            token: ETH,
            limit: U256::from(5),
        };
        app.abi_encodings.state = vec![AbiType::Array(Box::new(AbiType::Tuple(vec![
            AbiType::Address,
            AbiType::Uint256,
        ])))];
        app.latest_state = vec![AbiValue::Array(vec![AbiValue::Tuple(vec![
            AbiValue::Address(Address([0xa1; 20])),
            AbiValue::Uint(U256::from(6)),
        ])])];

        let err = compute_outcome(&app).unwrap_err();
        assert!(matches!(err, Error::OutcomeExceedsLimit { .. }));
    }

    #[test]
    fn coin_transfer_total_past_uint256_is_a_limit_error() {
        let mut app = fixed_outcome_app(0);
        app.outcome = OutcomeSpec::SingleAssetTwoPartyCoinTransfer {
            token: ETH,
            limit: U256::from(5),
        };
        app.abi_encodings.state = vec![AbiType::Array(Box::new(AbiType::Tuple(vec![
            AbiType::Address,
            AbiType::Uint256,
        ])))];
        app.latest_state = vec![AbiValue::Array(vec![
            AbiValue::Tuple(vec![
                AbiValue::Address(Address([0xa1; 20])),
                AbiValue::Uint(U256::max_value()),
            ]),
            AbiValue::Tuple(vec![
                AbiValue::Address(Address([0xa2; 20])),
                AbiValue::Uint(U256::one()),
            ]),
        ])];

        let err = compute_outcome(&app).unwrap_err();
        assert!(matches!(err, Error::OutcomeExceedsLimit { .. }));
    }
}
