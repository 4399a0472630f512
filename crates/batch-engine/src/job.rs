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

use std::collections::HashSet;

use ethereum_types::H256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use veil_relayer_store::{InsertionEntry, JobId, ResourceKey};
use veil_relayer_utils::Error;

/// A unit of work the relay engine can carry from admission to finality.
///
/// A job knows its own deterministic id and the resource keys it must hold
/// exclusively while in flight. Validation is structural only; the
/// cryptographic content is opaque to the engine.
pub trait RelayableJob:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// The deterministic id of this job.
    fn id(&self) -> JobId;

    /// The resource keys this job must reserve exclusively.
    fn conflict_keys(&self) -> Vec<ResourceKey>;

    /// Structural validation, performed before admission.
    fn validate(&self) -> veil_relayer_utils::Result<()>;
}

/// One internal transfer of an operation. Every component consumes exactly
/// two notes, revealing one nullifier for each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComponent {
    /// The nullifier of the first consumed note.
    pub nullifier_a: H256,
    /// The nullifier of the second consumed note.
    pub nullifier_b: H256,
}

/// A signed, proven user operation, admitted by the bundler.
///
/// The operation content is opaque to the relayer beyond the nullifiers it
/// consumes; those are its conflict keys, since a nullifier seen twice is
/// a double-spend attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// The internal transfers of the operation.
    pub components: Vec<TransferComponent>,
    /// The operation's zero-knowledge proof, verified on chain.
    pub proof_blob: Vec<u8>,
    /// The ABI-encoded public arguments of the operation.
    pub encoded_args: Vec<u8>,
}

impl Operation {
    /// The content digest this operation's id is derived from.
    ///
    /// Resubmitting the byte-identical operation yields the same digest,
    /// so duplicate submissions collapse onto one job id.
    pub fn digest(&self) -> H256 {
        let encoded =
            serde_json::to_vec(self).expect("operation always serializes");
        H256::from_slice(&Sha256::digest(&encoded))
    }

    /// All nullifiers this operation consumes, in component order.
    pub fn nullifiers(&self) -> impl Iterator<Item = H256> + '_ {
        self.components
            .iter()
            .flat_map(|c| [c.nullifier_a, c.nullifier_b])
    }
}

impl RelayableJob for Operation {
    fn id(&self) -> JobId {
        JobId::new(hex::encode(self.digest().as_bytes()))
    }

    fn conflict_keys(&self) -> Vec<ResourceKey> {
        self.nullifiers().map(ResourceKey::nullifier).collect()
    }

    fn validate(&self) -> veil_relayer_utils::Result<()> {
        if self.components.is_empty() {
            return Err(Error::MalformedJob(
                "operation has no transfer components".into(),
            ));
        }
        if self.proof_blob.is_empty() {
            return Err(Error::MalformedJob(
                "operation carries no proof".into(),
            ));
        }
        let mut seen = HashSet::new();
        for nullifier in self.nullifiers() {
            if nullifier.is_zero() {
                return Err(Error::MalformedJob(
                    "operation reveals a zero nullifier".into(),
                ));
            }
            if !seen.insert(nullifier) {
                return Err(Error::MalformedJob(format!(
                    "operation reveals nullifier 0x{} twice",
                    hex::encode(nullifier.as_bytes())
                )));
            }
        }
        Ok(())
    }
}

/// A single leaf slot of the insertion stream: either a real commitment or
/// a zero-fill marker padding an undersized batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafInsertion {
    /// The absolute index this job fills.
    pub merkle_index: u64,
    /// What the index will hold.
    pub entry: InsertionEntry,
}

impl LeafInsertion {
    /// A real leaf commitment at `merkle_index`.
    pub fn leaf(merkle_index: u64, commitment: H256) -> Self {
        Self {
            merkle_index,
            entry: InsertionEntry::Leaf(commitment),
        }
    }

    /// A zero-fill marker at `merkle_index`.
    pub fn zero_fill(merkle_index: u64) -> Self {
        Self {
            merkle_index,
            entry: InsertionEntry::ZeroFill,
        }
    }
}

impl RelayableJob for LeafInsertion {
    fn id(&self) -> JobId {
        JobId::from_stream_position(self.merkle_index)
    }

    fn conflict_keys(&self) -> Vec<ResourceKey> {
        vec![ResourceKey::leaf_index(self.merkle_index)]
    }

    fn validate(&self) -> veil_relayer_utils::Result<()> {
        match self.entry {
            InsertionEntry::Leaf(commitment) if commitment.is_zero() => {
                Err(Error::MalformedJob(
                    "a zero commitment must be a zero-fill marker".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(a: u8, b: u8) -> Operation {
        Operation {
            components: vec![TransferComponent {
                nullifier_a: H256::repeat_byte(a),
                nullifier_b: H256::repeat_byte(b),
            }],
            proof_blob: vec![0xaa; 32],
            encoded_args: vec![],
        }
    }

    #[test]
    fn operation_ids_are_content_derived() {
        let op = operation(1, 2);
        assert_eq!(op.id(), operation(1, 2).id());
        assert_ne!(op.id(), operation(1, 3).id());
    }

    #[test]
    fn operation_conflict_keys_cover_every_nullifier() {
        let mut op = operation(1, 2);
        op.components.push(TransferComponent {
            nullifier_a: H256::repeat_byte(3),
            nullifier_b: H256::repeat_byte(4),
        });
        assert_eq!(op.conflict_keys().len(), 4);
    }

    #[test]
    fn operation_validation_rejects_duplicate_nullifiers() {
        let op = operation(7, 7);
        assert!(matches!(
            op.validate().unwrap_err(),
            Error::MalformedJob(_)
        ));
        let mut op = operation(1, 2);
        op.proof_blob.clear();
        assert!(op.validate().is_err());
        assert!(operation(1, 2).validate().is_ok());
    }

    #[test]
    fn leaf_insertion_ids_follow_the_stream_position() {
        let job = LeafInsertion::leaf(42, H256::repeat_byte(1));
        assert_eq!(job.id().as_str(), "42-1");
        assert_eq!(
            job.conflict_keys(),
            vec![ResourceKey::leaf_index(42)]
        );
        assert!(job.validate().is_ok());
        assert!(LeafInsertion::zero_fill(43).validate().is_ok());
        assert!(LeafInsertion::leaf(44, H256::zero()).validate().is_err());
    }
}
