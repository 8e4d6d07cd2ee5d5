//! Genesis block construction and network presets.
//!
//! A genesis spec carries the initial balance allocations (an RLP list of
//! `(address, balance)` pairs, so presets ship as one hex blob), the genesis
//! producer and the starting gas limit. Building it creates the system
//! tables, commits the first table snapshot and derives the genesis block.

use primitive_types::U256;

use crate::block::{Block, Bloom, Header};
use crate::contracts::{system, ContractError};
use crate::rlp::{self, Item, RlpError};
use crate::state::StateDb;
use crate::store::{Db, SnapshotId, WorkingCopy};
use crate::{constants, Address};

/// Bootstrap node URLs for the main network.
pub const MAINNET_BOOTNODES: &[&str] = &[
    "enode://8f4b7a2d1c9e5b0a6d3f8c2e7a1b4d9f0c5e8a3b6d1f4c7e0a3b6d9f2c5e8a1b4d7f0a3c6e9b2d5f8a1c4e7b0d3f6a9c2e5b8d1f4a7c0e3b6d9f2a5c8e1b4@52.14.103.9:30401",
    "enode://2c5f8b1e4a7d0c3f6b9e2a5d8c1f4b7e0a3d6c9f2b5e8a1d4c7f0b3e6a9d2c5f8b1e4a7d0c3f6b9e2a5d8c1f4b7e0a3d6c9f2b5e8a1d4c7f0b3e6a9d2c5f8@18.191.44.27:30401",
    "enode://9a2d5c8f1b4e7a0d3c6f9b2e5a8d1c4f7b0e3a6d9c2f5b8e1a4d7c0f3b6e9a2d5c8f1b4e7a0d3c6f9b2e5a8d1c4f7b0e3a6d9c2f5b8e1a4d7c0f3b6e9a2d5@3.126.88.141:30401",
];

/// Bootstrap node URLs for the test network.
pub const TESTNET_BOOTNODES: &[&str] = &[
    "enode://4e7a0b3d6c9f2a5b8e1d4c7f0a3b6e9d2c5f8a1b4e7d0c3a6f9b2e5d8c1a4f7b0d3e6a9c2b5f8e1d4a7c0f3b6e9d2a5c8f1b4e7a0d3c6b9f2e5a8d1c4b7f0@172.104.162.15:30103",
    "enode://1d4a7c0f3b6e9a2d5c8f1b4e7a0d3c6f9b2e5a8d1c4f7b0e3a6d9c2f5b8e1a4d7c0f3b6e9a2d5c8f1b4e7a0d3c6f9b2e5a8d1c4f7b0e3a6d9c2f5b8e1a4d7@172.104.162.15:30203",
];

/// The genesis specification.
#[derive(Clone, Debug)]
pub struct Genesis {
    pub time: u64,
    pub gas_limit: u64,
    /// The elect-enabled witness created at genesis.
    pub producer: Address,
    /// Initial balance allocations in wei.
    pub alloc: Vec<(Address, U256)>,
}

impl Genesis {
    /// A single-producer development chain: the producer holds the full
    /// initial distribution.
    pub fn dev(producer: Address) -> Self {
        let supply =
            U256::from(constants::INITIAL_DISTRIBUTION) * U256::from(10u64).pow(18.into());
        Genesis {
            time: 0,
            gas_limit: constants::GENESIS_GAS_LIMIT,
            producer,
            alloc: vec![(producer, supply)],
        }
    }

    /// Decode an allocation preset: an RLP list of `[address, balance]`
    /// pairs.
    pub fn decode_alloc(data: &[u8]) -> Result<Vec<(Address, U256)>, RlpError> {
        let top = rlp::decode(data)?;
        top.as_list()?
            .iter()
            .map(|entry| {
                let pair = entry.as_list()?;
                if pair.len() != 2 {
                    return Err(RlpError::Expected("[address, balance] pair"));
                }
                let address_bytes = pair[0].as_bytes()?;
                if address_bytes.len() != Address::LENGTH {
                    return Err(RlpError::Expected("20 byte address"));
                }
                Ok((Address::from_slice(address_bytes), pair[1].as_u256()?))
            })
            .collect()
    }

    /// Encode allocations into the preset wire form.
    pub fn encode_alloc(alloc: &[(Address, U256)]) -> Vec<u8> {
        let items: Vec<Item> = alloc
            .iter()
            .map(|(address, balance)| {
                Item::List(vec![
                    Item::bytes(address.as_bytes()),
                    Item::big_uint(*balance),
                ])
            })
            .collect();
        rlp::encode_list(&items)
    }

    /// Materialize the genesis: system tables, first snapshot, account
    /// state and the block itself.
    pub fn build(&self, db: &Db) -> Result<(Block, SnapshotId, StateDb), ContractError> {
        let mut working = WorkingCopy::new();
        system::setup_genesis_tables(&mut working, self.producer)?;
        let snapshot = db.commit(&working);

        let mut state = StateDb::new();
        for (address, balance) in &self.alloc {
            state.add_balance(*address, *balance);
        }

        let header = Header {
            parent_hash: [0; 32],
            signature: vec![],
            root: state.root(),
            tx_hash: [0; 32],
            receipt_hash: [0; 32],
            bloom: Bloom::zero(),
            number: 0,
            gas_limit: self.gas_limit,
            gas_used: 0,
            time: self.time,
            delegate_diff: vec![],
        };
        let block = Block::new(header, vec![], None);
        Ok((block, snapshot, state))
    }
}
