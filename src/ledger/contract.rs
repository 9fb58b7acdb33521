//! Trading contract ABI.
//!
//! Encodes the three swap entry points and the prediction-validity check,
//! and classifies encoded calldata by selector for the static gas table.

use alloy::primitives::{Address, U256};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::types::{TradeParams, TradeType};

sol! {
    #[allow(missing_docs)]
    interface IAiTradingRouter {
        function swapExactETHForTokens(
            uint256 amountOutMin,
            address[] calldata path,
            address to,
            uint256 deadline
        ) external payable returns (uint256[] memory amounts);

        function swapExactTokensForETH(
            uint256 amountIn,
            uint256 amountOutMin,
            address[] calldata path,
            address to,
            uint256 deadline
        ) external returns (uint256[] memory amounts);

        function swapExactTokensForTokens(
            uint256 amountIn,
            uint256 amountOutMin,
            address[] calldata path,
            address to,
            uint256 deadline
        ) external returns (uint256[] memory amounts);

        /// Whether the caller's latest on-chain prediction is still valid.
        function isPredictionValid() external view returns (bool);
    }
}

use IAiTradingRouter::{
    isPredictionValidCall, swapExactETHForTokensCall, swapExactTokensForETHCall,
    swapExactTokensForTokensCall,
};

/// Calldata and attached native value for a trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTrade {
    pub data: Vec<u8>,
    pub value: U256,
}

/// Encode the swap call matching `params.trade_type`.
pub fn encode_trade(params: &TradeParams, recipient: Address) -> EncodedTrade {
    let path = vec![params.token_in, params.token_out];
    let deadline = U256::from(params.deadline);

    match params.trade_type {
        TradeType::NativeToToken => EncodedTrade {
            data: swapExactETHForTokensCall {
                amountOutMin: params.amount_out_min,
                path,
                to: recipient,
                deadline,
            }
            .abi_encode(),
            value: params.amount_in,
        },
        TradeType::TokenToNative => EncodedTrade {
            data: swapExactTokensForETHCall {
                amountIn: params.amount_in,
                amountOutMin: params.amount_out_min,
                path,
                to: recipient,
                deadline,
            }
            .abi_encode(),
            value: U256::ZERO,
        },
        TradeType::TokenToToken => EncodedTrade {
            data: swapExactTokensForTokensCall {
                amountIn: params.amount_in,
                amountOutMin: params.amount_out_min,
                path,
                to: recipient,
                deadline,
            }
            .abi_encode(),
            value: U256::ZERO,
        },
    }
}

pub fn encode_prediction_check() -> Vec<u8> {
    isPredictionValidCall {}.abi_encode()
}

/// Decode a single ABI `bool` return word.
pub fn decode_bool(data: &[u8]) -> Option<bool> {
    if data.len() < 32 || data[..31].iter().any(|&b| b != 0) {
        return None;
    }
    match data[31] {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// Trade type of encoded calldata, recognised by its 4-byte selector.
pub fn classify_call(data: &[u8]) -> Option<TradeType> {
    let selector: [u8; 4] = data.get(..4)?.try_into().ok()?;
    if selector == swapExactETHForTokensCall::SELECTOR {
        Some(TradeType::NativeToToken)
    } else if selector == swapExactTokensForETHCall::SELECTOR {
        Some(TradeType::TokenToNative)
    } else if selector == swapExactTokensForTokensCall::SELECTOR {
        Some(TradeType::TokenToToken)
    } else {
        None
    }
}
