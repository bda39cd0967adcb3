// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! EIP-1559 gas pricing for bridge transactions: the provider estimate,
//! scaled by the configured multiplier and clamped to the configured upper
//! bound.

use std::sync::Arc;

use ethers::providers::{Http, Middleware, Provider};
use ethers::types::U256;

use crate::error::Result;

/// Gas price oracle of one EVM chain.
#[derive(Clone)]
pub struct GasPricer {
    client: Arc<Provider<Http>>,
    upper_limit: U256,
    multiplier: f64,
}

impl GasPricer {
    /// Creates a pricer bounded by `max_gas_price` wei.
    pub fn new(
        client: Arc<Provider<Http>>,
        max_gas_price: u64,
        multiplier: f64,
    ) -> Self {
        Self {
            client,
            upper_limit: U256::from(max_gas_price),
            multiplier,
        }
    }

    /// Estimates `(max_fee_per_gas, max_priority_fee_per_gas)` for the next
    /// transaction.
    pub async fn estimate(&self) -> Result<(U256, U256)> {
        let (max_fee, priority) =
            self.client.estimate_eip1559_fees(None).await?;
        let scaled = scale(max_fee, self.multiplier);
        Ok((scaled.min(self.upper_limit), priority))
    }
}

/// Scales `value` by `multiplier` with two decimal digits of precision.
fn scale(value: U256, multiplier: f64) -> U256 {
    let hundredths = (multiplier * 100.0).round() as u64;
    value * U256::from(hundredths) / U256::from(100u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_keeps_two_decimals() {
        assert_eq!(
            scale(U256::from(100u64), 1.0),
            U256::from(100u64)
        );
        assert_eq!(
            scale(U256::from(100u64), 1.25),
            U256::from(125u64)
        );
        assert_eq!(scale(U256::from(100u64), 0.5), U256::from(50u64));
    }
}
