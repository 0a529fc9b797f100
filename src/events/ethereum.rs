//! Ethereum HTLC contract bindings and log classification

use super::{HtlcEvent, HtlcEventKind};
use crate::chain::{BlockHeader, Chain, HtlcClassifier};
use crate::error::{RelayerError, RelayerResult};
use crate::types::{Hashlock, Secret};

use ethers::abi::RawLog;
use ethers::contract::{abigen, EthEvent, EthLogDecode};
use ethers::types::{Address, Log, H256, U256};

abigen!(
    HashedTimelock,
    r#"[
        event Locked(bytes32 indexed hashlock, address indexed sender, address indexed recipient, uint256 amount, uint256 locktime)
        event Redeemed(bytes32 indexed hashlock, bytes32 secret)
        event Refunded(bytes32 indexed hashlock)
        function locks(bytes32 hashlock) external view returns (address sender, address recipient, uint256 amount, uint256 locktime, bool redeemed, bool refunded)
        function redeem(bytes32 hashlock, bytes32 secret) external
        function refund(bytes32 hashlock) external
    ]"#
);

/// Classifies logs emitted by the configured HTLC contract
pub struct EthereumClassifier {
    contract: Address,
    topics: [H256; 3],
}

impl EthereumClassifier {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            topics: [
                LockedFilter::signature(),
                RedeemedFilter::signature(),
                RefundedFilter::signature(),
            ],
        }
    }

    fn decode_error(&self, log: &Log, message: impl std::fmt::Display) -> RelayerError {
        RelayerError::Decode {
            chain: Chain::Ethereum,
            message: format!("log {:?}: {}", log.transaction_hash, message),
        }
    }
}

/// Narrow a contract amount to the order's base-unit width
pub fn u256_to_u128(value: U256) -> Option<u128> {
    if value > U256::from(u128::MAX) {
        None
    } else {
        Some(value.as_u128())
    }
}

pub fn u256_to_u64(value: U256) -> Option<u64> {
    if value > U256::from(u64::MAX) {
        None
    } else {
        Some(value.as_u64())
    }
}

impl HtlcClassifier for EthereumClassifier {
    type Tx = Log;

    fn classify(&self, log: &Log, header: &BlockHeader) -> RelayerResult<Vec<HtlcEvent>> {
        if log.address != self.contract || log.removed == Some(true) {
            return Ok(Vec::new());
        }
        match log.topics.first() {
            Some(topic) if self.topics.contains(topic) => {}
            _ => return Ok(Vec::new()),
        }

        let tx_id = log
            .transaction_hash
            .map(|h| format!("{:?}", h))
            .ok_or_else(|| self.decode_error(log, "missing transaction hash"))?;

        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        let decoded =
            HashedTimelockEvents::decode_log(&raw).map_err(|e| self.decode_error(log, e))?;

        let mut event = HtlcEvent {
            kind: HtlcEventKind::Lock,
            chain: Chain::Ethereum,
            tx_id,
            block: header.block.clone(),
            timestamp: header.timestamp,
            hashlock: Hashlock([0u8; 32]),
            amount: 0,
            secret: None,
            counterparty: None,
            locktime: None,
            output_index: None,
            position: log
                .log_index
                .or(log.transaction_log_index)
                .and_then(u256_to_u64)
                .unwrap_or_default(),
        };

        match decoded {
            HashedTimelockEvents::LockedFilter(locked) => {
                event.hashlock = Hashlock(locked.hashlock);
                event.amount = u256_to_u128(locked.amount)
                    .ok_or_else(|| self.decode_error(log, "amount exceeds u128"))?;
                event.locktime = Some(
                    u256_to_u64(locked.locktime)
                        .ok_or_else(|| self.decode_error(log, "locktime exceeds u64"))?,
                );
                event.counterparty = Some(format!("{:?}", locked.recipient));
            }
            HashedTimelockEvents::RedeemedFilter(redeemed) => {
                event.kind = HtlcEventKind::Redeem;
                event.hashlock = Hashlock(redeemed.hashlock);
                event.secret = Some(Secret(redeemed.secret));
            }
            HashedTimelockEvents::RefundedFilter(refunded) => {
                event.kind = HtlcEventKind::Refund;
                event.hashlock = Hashlock(refunded.hashlock);
            }
        }

        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockRef;
    use chrono::Utc;
    use ethers::abi::{encode, Token};
    use ethers::types::Bytes;

    fn header() -> BlockHeader {
        BlockHeader {
            block: BlockRef {
                height: 77,
                hash: "0xblock".to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    fn contract() -> Address {
        Address::repeat_byte(0x42)
    }

    fn log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            address: contract(),
            topics,
            data: Bytes::from(data),
            transaction_hash: Some(H256::repeat_byte(0x99)),
            ..Default::default()
        }
    }

    fn address_topic(addr: Address) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(addr.as_bytes());
        H256::from(bytes)
    }

    #[test]
    fn test_locked_log() {
        let secret = Secret([6u8; 32]);
        let hashlock = secret.hashlock();
        let recipient = Address::repeat_byte(0x11);
        let data = encode(&[
            Token::Uint(U256::from(30_000u64)),
            Token::Uint(U256::from(1_900_000_000u64)),
        ]);
        let log = log(
            vec![
                LockedFilter::signature(),
                H256::from(hashlock.0),
                address_topic(Address::repeat_byte(0x22)),
                address_topic(recipient),
            ],
            data,
        );

        let events = EthereumClassifier::new(contract())
            .classify(&log, &header())
            .unwrap();

        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, HtlcEventKind::Lock);
        assert_eq!(ev.hashlock, hashlock);
        assert_eq!(ev.amount, 30_000);
        assert_eq!(ev.locktime, Some(1_900_000_000));
        assert_eq!(ev.counterparty, Some(format!("{:?}", recipient)));
        assert_eq!(ev.tx_id, format!("{:?}", H256::repeat_byte(0x99)));
    }

    #[test]
    fn test_redeemed_log_carries_secret() {
        let secret = Secret([8u8; 32]);
        let data = encode(&[Token::FixedBytes(secret.0.to_vec())]);
        let log = log(
            vec![RedeemedFilter::signature(), H256::from(secret.hashlock().0)],
            data,
        );

        let events = EthereumClassifier::new(contract())
            .classify(&log, &header())
            .unwrap();
        assert_eq!(events[0].kind, HtlcEventKind::Redeem);
        assert_eq!(events[0].secret, Some(secret));
    }

    #[test]
    fn test_batched_logs_keep_their_log_index() {
        let classifier = EthereumClassifier::new(contract());
        let keys: Vec<String> = [Secret([1u8; 32]), Secret([2u8; 32])]
            .iter()
            .enumerate()
            .map(|(i, secret)| {
                let mut refunded = log(
                    vec![RefundedFilter::signature(), H256::from(secret.hashlock().0)],
                    vec![],
                );
                refunded.log_index = Some(U256::from(i + 4));
                let events = classifier.classify(&refunded, &header()).unwrap();
                assert_eq!(events[0].position, (i + 4) as u64);
                events[0].idempotency_key()
            })
            .collect();
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn test_foreign_logs_are_ignored() {
        let secret = Secret([1u8; 32]);
        let mut foreign = log(
            vec![RefundedFilter::signature(), H256::from(secret.hashlock().0)],
            vec![],
        );
        foreign.address = Address::repeat_byte(0x01);

        let classifier = EthereumClassifier::new(contract());
        assert!(classifier.classify(&foreign, &header()).unwrap().is_empty());

        let unknown_topic = log(vec![H256::repeat_byte(0x05)], vec![]);
        assert!(classifier.classify(&unknown_topic, &header()).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_lock_data_is_decode_error() {
        let secret = Secret([2u8; 32]);
        let log = log(
            vec![
                LockedFilter::signature(),
                H256::from(secret.hashlock().0),
                address_topic(Address::zero()),
                address_topic(Address::zero()),
            ],
            vec![0u8; 10],
        );
        let err = EthereumClassifier::new(contract())
            .classify(&log, &header())
            .unwrap_err();
        assert!(matches!(err, RelayerError::Decode { chain: Chain::Ethereum, .. }));
    }

    #[test]
    fn test_u256_narrowing() {
        assert_eq!(u256_to_u128(U256::from(5u64)), Some(5));
        assert_eq!(u256_to_u128(U256::MAX), None);
        assert_eq!(u256_to_u64(U256::from(u64::MAX) + 1), None);
    }
}
