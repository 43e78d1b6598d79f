//! Request and response types of the simulation RPC.

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// HyperEVM block lane a transaction lands in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    /// Small blocks, ~2s confirmation.
    #[default]
    #[display("fast")]
    Fast,
    /// Large blocks, ~12s confirmation.
    #[display("secure")]
    Secure,
}

/// Transaction to simulate.
///
/// ```
/// use hypersim::types::TransactionRequest;
/// use alloy::primitives::{Address, U256};
///
/// let tx = TransactionRequest::new(Address::ZERO)
///     .to(Address::repeat_byte(0x11))
///     .value(U256::from(1_000u64));
/// assert!(tx.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: Address,
    /// `None` for contract creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

impl TransactionRequest {
    pub fn new(from: Address) -> Self {
        Self {
            from,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    #[must_use]
    pub fn value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[must_use]
    pub fn gas_limit(mut self, gas_limit: U256) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    /// Rejects requests the node would refuse outright.
    ///
    /// Contract creation (no `to`) needs init code, and legacy and EIP-1559
    /// fee fields are mutually exclusive.
    pub fn validate(&self) -> Result<()> {
        if self.to.is_none() && self.data.as_ref().is_none_or(|data| data.is_empty()) {
            return Err(Error::validation("contract creation requires `data`"));
        }
        if self.gas_price.is_some()
            && (self.max_fee_per_gas.is_some() || self.max_priority_fee_per_gas.is_some())
        {
            return Err(Error::validation(
                "`gasPrice` cannot be combined with EIP-1559 fee fields",
            ));
        }
        if let (Some(max), Some(tip)) = (self.max_fee_per_gas, self.max_priority_fee_per_gas) {
            if tip > max {
                return Err(Error::validation(
                    "`maxPriorityFeePerGas` exceeds `maxFeePerGas`",
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of `hyperevm_simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub success: bool,
    pub gas_used: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub block_type: BlockType,
    #[serde(default)]
    pub estimated_block: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimulationEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
}

/// Log emitted during simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Result of `eth_getNetworkStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub block_number: u64,
    #[serde(default)]
    pub syncing: bool,
    #[serde(default)]
    pub peer_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_wire_format() {
        let tx = TransactionRequest::new(Address::repeat_byte(0x11))
            .to(Address::repeat_byte(0x22))
            .value(U256::from(16u64));
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(
            value,
            json!({
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "value": "0x10",
            })
        );
    }

    #[test]
    fn test_validate() {
        let from = Address::ZERO;
        assert!(TransactionRequest::new(from).validate().unwrap_err().is_validation());
        assert!(TransactionRequest::new(from).data(vec![0x60, 0x80]).validate().is_ok());

        let mut tx = TransactionRequest::new(from).to(Address::ZERO);
        tx.gas_price = Some(U256::from(1u64));
        tx.max_fee_per_gas = Some(U256::from(2u64));
        assert!(tx.validate().is_err());

        let mut tx = TransactionRequest::new(from).to(Address::ZERO);
        tx.max_fee_per_gas = Some(U256::from(1u64));
        tx.max_priority_fee_per_gas = Some(U256::from(2u64));
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_parse_simulation_result() {
        let result: SimulationResult = serde_json::from_value(json!({
            "success": false,
            "gasUsed": "0x5208",
            "revertReason": "insufficient balance",
            "blockType": "secure",
            "estimatedBlock": 12,
        }))
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.gas_used, U256::from(21_000u64));
        assert_eq!(result.block_type, BlockType::Secure);
        assert_eq!(result.revert_reason.as_deref(), Some("insufficient balance"));
        assert!(result.events.is_empty());
    }
}
