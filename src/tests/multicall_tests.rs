//! tests/multicall_tests.rs - Batched reads through the multicall aggregator

use super::fakes::*;
use crate::blockchain::client::ClientError;
use crate::blockchain::multicall::MULTICALL3_ADDRESS;
use crate::blockchain::read::select_function;
use crate::blockchain::{Call, CallOutput, Multicall, MulticallError, ReadError, ReadService};
use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::eips::BlockId;
use alloy::primitives::{address, Address, Bytes, U256};
use std::sync::Arc;

const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const GARBAGE: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Splits an `aggregate((address,bytes)[])` calldata into its calls.
fn decode_aggregate(data: &Bytes) -> Result<Vec<(Address, Bytes)>, ClientError> {
    let envelope = DynSolType::Tuple(vec![DynSolType::Array(Box::new(DynSolType::Tuple(vec![
        DynSolType::Address,
        DynSolType::Bytes,
    ])))]);
    let decoded = envelope
        .abi_decode_params(&data[4..])
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let calls = match decoded {
        DynSolValue::Tuple(mut outer) if outer.len() == 1 => match outer.remove(0) {
            DynSolValue::Array(calls) => calls,
            other => return Err(ClientError::Transport(format!("unexpected calls value {:?}", other))),
        },
        other => return Err(ClientError::Transport(format!("unexpected envelope {:?}", other))),
    };

    calls
        .into_iter()
        .map(|call| match call {
            DynSolValue::Tuple(fields) => match fields.as_slice() {
                [DynSolValue::Address(target), DynSolValue::Bytes(call_data)] => {
                    Ok((*target, Bytes::from(call_data.clone())))
                }
                _ => Err(ClientError::Transport("malformed call".to_string())),
            },
            _ => Err(ClientError::Transport("malformed call".to_string())),
        })
        .collect()
}

fn encode_results(block: u64, results: Vec<Vec<u8>>) -> Bytes {
    DynSolValue::Tuple(vec![
        DynSolValue::Uint(U256::from(block), 256),
        DynSolValue::Array(results.into_iter().map(DynSolValue::Bytes).collect()),
    ])
    .abi_encode_params()
    .into()
}

/// A node hosting the aggregator: balanceOf answers 42, a garbage selector
/// answers three bytes, anything else answers nothing.
fn aggregator_node(url: &str) -> FakeChain {
    FakeChain::new(url).with_call(|to, data| {
        if to != MULTICALL3_ADDRESS {
            return Err(ClientError::Reverted("not the aggregator".to_string()));
        }

        let results = decode_aggregate(data)?
            .into_iter()
            .map(|(_, call_data)| match call_data.get(..4) {
                Some(selector) if selector == &BALANCE_OF[..] => uint_word(42).to_vec(),
                Some(selector) if selector == &GARBAGE[..] => vec![1, 2, 3],
                _ => Vec::new(),
            })
            .collect();
        Ok(encode_results(1_000, results))
    })
}

fn setup(node: FakeChain) -> (Arc<FakeChain>, Arc<ReadService>) {
    let node = Arc::new(node);
    let config = test_config(&["http://node-a"], 0);
    let reader = reader(&config, FakeConnector::default().with(node.clone()), memory_caches());
    (node, reader)
}

fn balance_call(account: Address) -> Call {
    let abi = erc20_abi();
    let function = select_function(&abi, "balanceOf", 1).unwrap();
    Call::function(TOKEN, ENV, function, &[DynSolValue::Address(account)], BlockId::latest()).unwrap()
}

#[tokio::test]
async fn test_aggregate_returns_results_in_call_order() {
    let (node, reader) = setup(aggregator_node("http://node-a"));
    let multicall = Multicall::new(reader, ENV, MULTICALL3_ADDRESS);

    let calls = vec![
        balance_call(ALICE),
        Call::new(TOKEN, Bytes::from(GARBAGE.to_vec()), vec![DynSolType::Uint(256)]),
        Call::new(TOKEN, Bytes::from(vec![0u8; 4]), vec![DynSolType::Uint(256)]),
        balance_call(BOB),
    ];

    let outputs = multicall.aggregate(&calls, BlockId::latest()).await.unwrap();
    assert_eq!(
        outputs,
        vec![
            CallOutput::Decoded(vec![DynSolValue::Uint(U256::from(42u64), 256)]),
            CallOutput::Raw(Bytes::from(vec![1, 2, 3])),
            CallOutput::Empty,
            CallOutput::Decoded(vec![DynSolValue::Uint(U256::from(42u64), 256)]),
        ]
    );
    assert_eq!(node.call_count(), 1);
}

#[tokio::test]
async fn test_empty_batch_makes_no_call() {
    let (node, reader) = setup(aggregator_node("http://node-a"));
    let multicall = Multicall::new(reader, ENV, MULTICALL3_ADDRESS);

    assert!(multicall.aggregate(&[], BlockId::latest()).await.unwrap().is_empty());
    assert_eq!(node.call_count(), 0);
}

#[tokio::test]
async fn test_cached_aggregate_primes_direct_reads() {
    let (node, reader) = setup(aggregator_node("http://node-a"));
    let multicall = Multicall::new(reader.clone(), ENV, MULTICALL3_ADDRESS);

    multicall
        .cached_aggregate(&[balance_call(ALICE)], BlockId::latest())
        .await
        .unwrap();
    assert_eq!(node.call_count(), 1);

    let out = reader
        .read(
            &TOKEN.to_string(),
            ENV,
            &erc20_abi(),
            "balanceOf",
            &[DynSolValue::Address(ALICE)],
            BlockId::latest(),
        )
        .await
        .unwrap();
    assert_eq!(out, vec![DynSolValue::Uint(U256::from(42u64), 256)]);
    assert_eq!(node.call_count(), 1);

    // Plain aggregate leaves the per-call keys alone.
    multicall
        .aggregate(&[balance_call(BOB)], BlockId::latest())
        .await
        .unwrap();
    reader
        .read(
            &TOKEN.to_string(),
            ENV,
            &erc20_abi(),
            "balanceOf",
            &[DynSolValue::Address(BOB)],
            BlockId::latest(),
        )
        .await
        .unwrap();
    assert_eq!(node.call_count(), 3);
}

#[tokio::test]
async fn test_reverted_aggregate_is_a_read_error() {
    let (_, reader) = setup(
        FakeChain::new("http://node-a").with_call(|_, _| Err(ClientError::Reverted("execution reverted".to_string()))),
    );
    let multicall = Multicall::new(reader, ENV, MULTICALL3_ADDRESS);

    let result = multicall.aggregate(&[balance_call(ALICE)], BlockId::latest()).await;
    assert!(matches!(
        result,
        Err(MulticallError::Read(ReadError::Client(ClientError::Reverted(_))))
    ));
}

#[tokio::test]
async fn test_short_result_list_is_rejected() {
    let (_, reader) = setup(FakeChain::new("http://node-a").with_call(|_, _| Ok(encode_results(1, vec![Vec::new()]))));
    let multicall = Multicall::new(reader, ENV, MULTICALL3_ADDRESS);

    let result = multicall
        .aggregate(&[balance_call(ALICE), balance_call(BOB)], BlockId::latest())
        .await;
    assert!(matches!(result, Err(MulticallError::ResultCount { expected: 2, got: 1 })));
}

#[tokio::test]
async fn test_environment_selects_aggregator_address() {
    let node = Arc::new(aggregator_node("http://node-a"));
    let mut config = test_config(&["http://node-a"], 0);
    let reader = reader(&config, FakeConnector::default().with(node.clone()), memory_caches());

    // mainnet has a known deployment of its own.
    let known = Multicall::for_environment(reader.clone(), ENV, config.chain(ENV).ok()).unwrap();
    assert_eq!(known.address(), address!("41263cba59eb80dc200f3e2544eda4ed6a90e76c"));

    // Unknown environments fall back to the canonical deployment.
    let fallback = Multicall::for_environment(reader.clone(), "base-mainnet", None).unwrap();
    assert_eq!(fallback.address(), MULTICALL3_ADDRESS);

    // A configured address wins over the known one, and is where the batch goes.
    if let Some(chain) = config.chains.get_mut(ENV) {
        chain.multicall_address = Some(MULTICALL3_ADDRESS.to_string());
    }
    let configured = Multicall::for_environment(reader.clone(), ENV, config.chain(ENV).ok()).unwrap();
    assert_eq!(configured.address(), MULTICALL3_ADDRESS);
    let outputs = configured.aggregate(&[balance_call(ALICE)], BlockId::latest()).await.unwrap();
    assert_eq!(outputs, vec![CallOutput::Decoded(vec![DynSolValue::Uint(U256::from(42u64), 256)])]);
    assert_eq!(node.call_count(), 1);

    if let Some(chain) = config.chains.get_mut(ENV) {
        chain.multicall_address = Some("0xnot-an-address".to_string());
    }
    assert!(matches!(
        Multicall::for_environment(reader, ENV, config.chain(ENV).ok()),
        Err(MulticallError::InvalidAddress { .. })
    ));
}
