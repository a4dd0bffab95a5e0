use crate::error::SwapError;
use crate::server::UnchargeTerms;

/// Swap fee for `amount` given a base fee and a proportional rate in parts
/// per million.
pub fn calc_fee(amount: u64, fee_base: u64, fee_rate_ppm: u64) -> u64 {
    let proportional = (u128::from(amount) * u128::from(fee_rate_ppm)) / 1_000_000;
    fee_base.saturating_add(u64::try_from(proportional).unwrap_or(u64::MAX))
}

/// Checks `amount` against the server's accepted range.
pub fn check_amount(amount: u64, terms: &UnchargeTerms) -> Result<(), SwapError> {
    if amount < terms.min_swap_amount {
        return Err(SwapError::SwapAmountTooLow {
            amount,
            min: terms.min_swap_amount,
        });
    }
    if amount > terms.max_swap_amount {
        return Err(SwapError::SwapAmountTooHigh {
            amount,
            max: terms.max_swap_amount,
        });
    }
    Ok(())
}
