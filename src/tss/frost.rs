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

//! The FROST-backed [`ThresholdScheme`].
//!
//! Party identifiers are assigned at keygen time from the
//! byte-lexicographic order of the committee's peer ids, so every
//! participant derives the same mapping without coordination. The mapping
//! then travels inside the share material: a refresh may shrink the
//! committee, and the surviving key packages keep their original
//! identifiers, so identifiers must never be re-derived positionally from
//! a later participant list.

use std::collections::BTreeMap;

use async_trait::async_trait;
use frost::rand_core::OsRng;
use frost::Identifier;
use frost_secp256k1 as frost;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};

use super::ceremony::{RoundContext, ThresholdScheme};
use crate::error::{Error, Result};
use crate::store::Keyshare;

/// The content of [`Keyshare::share`]: this node's key package, the group's
/// public key package, and the committee's identifier assignment.
#[derive(Serialize, Deserialize)]
struct ShareMaterial {
    key_package: frost::keys::KeyPackage,
    pubkey_package: frost::keys::PublicKeyPackage,
    /// Peer id bytes paired with the party identifier fixed at keygen.
    identifiers: Vec<(Vec<u8>, Identifier)>,
}

impl ShareMaterial {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(share: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(share)?)
    }

    fn peer_map(&self) -> Result<BTreeMap<PeerId, Identifier>> {
        self.identifiers
            .iter()
            .map(|(bytes, id)| {
                let peer = PeerId::from_bytes(bytes).map_err(|_| {
                    Error::MalformedKeyshare("invalid peer id in share")
                })?;
                Ok((peer, *id))
            })
            .collect()
    }
}

/// Threshold signing scheme built on FROST over secp256k1.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrostScheme;

fn canonical_order(peers: &[PeerId]) -> Vec<PeerId> {
    let mut sorted = peers.to_vec();
    sorted.sort_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
    sorted
}

/// The keygen-time identifier assignment: index + 1 in canonical order.
fn identifier_table(
    peers: &[PeerId],
) -> Result<Vec<(Vec<u8>, Identifier)>> {
    canonical_order(peers)
        .into_iter()
        .enumerate()
        .map(|(index, peer)| {
            Ok((peer.to_bytes(), Identifier::try_from((index + 1) as u16)?))
        })
        .collect()
}

fn id_of(
    ids: &BTreeMap<PeerId, Identifier>,
    peer: &PeerId,
) -> Result<Identifier> {
    ids.get(peer)
        .copied()
        .ok_or(Error::Generic("peer is not part of the keyed committee"))
}

#[async_trait]
impl ThresholdScheme for FrostScheme {
    async fn keygen(&self, ctx: &mut RoundContext) -> Result<Keyshare> {
        let participants = ctx.participants().to_vec();
        let table = identifier_table(&participants)?;
        let ids: BTreeMap<PeerId, Identifier> = table
            .iter()
            .zip(canonical_order(&participants))
            .map(|((_, id), peer)| (peer, *id))
            .collect();
        let peers_by_id: BTreeMap<Identifier, PeerId> =
            ids.iter().map(|(peer, id)| (*id, *peer)).collect();
        let my_id = id_of(&ids, &ctx.local_peer())?;
        let max_signers = participants.len() as u16;
        let min_signers = ctx.threshold() as u16 + 1;

        let (round1_secret, round1_package) = frost::keys::dkg::part1(
            my_id,
            max_signers,
            min_signers,
            OsRng,
        )?;
        ctx.broadcast_round(1, &bincode::serialize(&round1_package)?);
        let gathered = ctx.gather_round(1, &participants).await?;
        let mut round1_packages: BTreeMap<
            Identifier,
            frost::keys::dkg::round1::Package,
        > = BTreeMap::new();
        for (peer, bytes) in &gathered {
            round1_packages
                .insert(id_of(&ids, peer)?, bincode::deserialize(bytes)?);
        }

        let (round2_secret, round2_out) =
            frost::keys::dkg::part2(round1_secret, &round1_packages)?;
        for (id, package) in &round2_out {
            let peer = peers_by_id
                .get(id)
                .ok_or(Error::Generic("unknown dkg recipient"))?;
            ctx.send_round(2, peer, &bincode::serialize(package)?);
        }
        let gathered = ctx.gather_round(2, &participants).await?;
        let mut round2_packages: BTreeMap<
            Identifier,
            frost::keys::dkg::round2::Package,
        > = BTreeMap::new();
        for (peer, bytes) in &gathered {
            round2_packages
                .insert(id_of(&ids, peer)?, bincode::deserialize(bytes)?);
        }

        let (key_package, pubkey_package) = frost::keys::dkg::part3(
            &round2_secret,
            &round1_packages,
            &round2_packages,
        )?;
        let public_key = pubkey_package.verifying_key().serialize()?;
        let material = ShareMaterial {
            key_package,
            pubkey_package,
            identifiers: table,
        };
        Ok(Keyshare {
            share: material.encode()?,
            public_key,
            threshold: ctx.threshold(),
            participants: canonical_order(&participants),
        })
    }

    async fn refresh(
        &self,
        ctx: &mut RoundContext,
        previous: Option<&Keyshare>,
        next: &[PeerId],
    ) -> Result<Option<Keyshare>> {
        let next_set = canonical_order(next);
        let local = ctx.local_peer();
        let staying = next_set.contains(&local);
        let min_signers = ctx.threshold() as u16 + 1;

        let (new_key_package, new_pubkey_package, material) =
            if ctx.is_leader() {
                let prev = previous.ok_or(Error::KeyshareNotFound)?;
                let material = ShareMaterial::decode(&prev.share)?;
                let ids = material.peer_map()?;
                // Zero-share refresh can only adjust existing shares.
                // TODO: switch to a resharing protocol once the frost
                // crates expose one, so a refresh can also admit new
                // committee members.
                if let Some(newcomer) = next_set
                    .iter()
                    .find(|p| !prev.participants.contains(p))
                {
                    return Err(Error::UnsupportedMembershipChange(
                        *newcomer,
                    ));
                }
                let next_ids: Vec<Identifier> = next_set
                    .iter()
                    .map(|p| id_of(&ids, p))
                    .collect::<Result<_>>()?;
                let (zero_shares, new_pubkey_package) =
                    frost::keys::refresh::compute_refreshing_shares::<
                        frost::Secp256K1Sha256,
                        _,
                    >(
                        material.pubkey_package.clone(),
                        next_set.len() as u16,
                        min_signers,
                        &next_ids,
                        &mut OsRng,
                    )?;
                let mut own_zero_share = None;
                for (peer, zero_share) in next_set.iter().zip(zero_shares)
                {
                    if peer == &local {
                        own_zero_share = Some(zero_share);
                        continue;
                    }
                    ctx.send_round(
                        1,
                        peer,
                        &bincode::serialize(&(
                            zero_share,
                            new_pubkey_package.clone(),
                        ))?,
                    );
                }
                let Some(zero_share) = own_zero_share else {
                    // a retiring leader still deals the refresh, it just
                    // keeps no share of the outcome
                    return Ok(None);
                };
                let new_key_package = frost::keys::refresh::refresh_share::<
                    frost::Secp256K1Sha256,
                >(
                    zero_share,
                    &material.key_package,
                )?;
                (new_key_package, new_pubkey_package, material)
            } else if staying {
                let prev = previous.ok_or(Error::KeyshareNotFound)?;
                let material = ShareMaterial::decode(&prev.share)?;
                let leader = ctx.leader();
                let gathered = ctx.gather_round(1, &[leader]).await?;
                let bytes = gathered
                    .get(&leader)
                    .ok_or(Error::Generic("missing refresh share"))?;
                let (zero_share, new_pubkey_package): (
                    frost::keys::SecretShare,
                    frost::keys::PublicKeyPackage,
                ) = bincode::deserialize(bytes)?;
                let new_key_package = frost::keys::refresh::refresh_share::<
                    frost::Secp256K1Sha256,
                >(
                    zero_share,
                    &material.key_package,
                )?;
                (new_key_package, new_pubkey_package, material)
            } else {
                // retiring member: nothing to refresh, the caller erases
                // the old share once the ceremony concludes
                return Ok(None);
            };

        // surviving key packages keep their keygen identifiers
        let kept_identifiers: Vec<(Vec<u8>, Identifier)> = material
            .identifiers
            .iter()
            .filter(|(bytes, _)| {
                PeerId::from_bytes(bytes)
                    .map(|peer| next_set.contains(&peer))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let public_key = new_pubkey_package.verifying_key().serialize()?;
        let refreshed = ShareMaterial {
            key_package: new_key_package,
            pubkey_package: new_pubkey_package,
            identifiers: kept_identifiers,
        };
        Ok(Some(Keyshare {
            share: refreshed.encode()?,
            public_key,
            threshold: ctx.threshold(),
            participants: next_set,
        }))
    }

    async fn sign(
        &self,
        ctx: &mut RoundContext,
        share: &Keyshare,
        digest: [u8; 32],
    ) -> Result<Vec<u8>> {
        let material = ShareMaterial::decode(&share.share)?;
        let ids = material.peer_map()?;
        let my_id = id_of(&ids, &ctx.local_peer())?;
        let signers = ctx.participants().to_vec();

        let (nonces, commitments) = frost::round1::commit(
            material.key_package.signing_share(),
            &mut OsRng,
        );
        ctx.broadcast_round(1, &bincode::serialize(&commitments)?);
        let gathered = ctx.gather_round(1, &signers).await?;
        let mut commitment_map: BTreeMap<
            Identifier,
            frost::round1::SigningCommitments,
        > = BTreeMap::new();
        commitment_map.insert(my_id, commitments);
        for (peer, bytes) in &gathered {
            commitment_map
                .insert(id_of(&ids, peer)?, bincode::deserialize(bytes)?);
        }

        let signing_package =
            frost::SigningPackage::new(commitment_map, &digest);
        let signature_share = frost::round2::sign(
            &signing_package,
            &nonces,
            &material.key_package,
        )?;

        if ctx.is_leader() {
            let mut signature_shares: BTreeMap<
                Identifier,
                frost::round2::SignatureShare,
            > = BTreeMap::new();
            signature_shares.insert(my_id, signature_share);
            let gathered = ctx.gather_round(2, &signers).await?;
            for (peer, bytes) in &gathered {
                signature_shares
                    .insert(id_of(&ids, peer)?, bincode::deserialize(bytes)?);
            }
            let signature = frost::aggregate(
                &signing_package,
                &signature_shares,
                &material.pubkey_package,
            )?;
            let bytes = signature.serialize()?;
            ctx.broadcast_round(3, &bytes);
            Ok(bytes)
        } else {
            let leader = ctx.leader();
            ctx.send_round(
                2,
                &leader,
                &bincode::serialize(&signature_share)?,
            );
            let finale = ctx.gather_round(3, &[leader]).await?;
            finale
                .get(&leader)
                .cloned()
                .ok_or(Error::Generic("missing aggregated signature"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemComm;
    use crate::tss::SessionId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn contexts(
        network: &[Arc<MemComm>],
        peers: &[PeerId],
        session: &SessionId,
        participants: &[PeerId],
        threshold: u32,
        leader: PeerId,
    ) -> Vec<(PeerId, RoundContext)> {
        peers
            .iter()
            .zip(network)
            .filter(|(peer, _)| participants.contains(peer))
            .map(|(peer, comm)| {
                (
                    *peer,
                    RoundContext::new(
                        comm.clone(),
                        session.clone(),
                        participants.to_vec(),
                        threshold,
                        leader,
                        Duration::from_secs(10),
                        CancellationToken::new(),
                    ),
                )
            })
            .collect()
    }

    async fn run_keygen(
        network: &[Arc<MemComm>],
        peers: &[PeerId],
        threshold: u32,
    ) -> Vec<(PeerId, Keyshare)> {
        let session: SessionId = "keygen-frost".into();
        let leader = canonical_order(peers)[0];
        let ctxs =
            contexts(network, peers, &session, peers, threshold, leader);
        let mut handles = Vec::new();
        for (peer, mut ctx) in ctxs {
            handles.push(tokio::spawn(async move {
                (peer, FrostScheme.keygen(&mut ctx).await.unwrap())
            }));
        }
        let mut shares = Vec::new();
        for handle in handles {
            shares.push(handle.await.unwrap());
        }
        shares
    }

    async fn run_signing(
        network: &[Arc<MemComm>],
        peers: &[PeerId],
        shares: &[(PeerId, Keyshare)],
        signers: &[PeerId],
        session: &SessionId,
        digest: [u8; 32],
    ) -> Vec<Vec<u8>> {
        let leader = canonical_order(signers)[0];
        let ctxs = contexts(network, peers, session, signers, 1, leader);
        let mut handles = Vec::new();
        for (peer, mut ctx) in ctxs {
            let share = shares
                .iter()
                .find(|(p, _)| p == &peer)
                .map(|(_, s)| s.clone())
                .unwrap();
            handles.push(tokio::spawn(async move {
                FrostScheme.sign(&mut ctx, &share, digest).await.unwrap()
            }));
        }
        let mut signatures = Vec::new();
        for handle in handles {
            signatures.push(handle.await.unwrap());
        }
        signatures
    }

    #[tokio::test]
    async fn keygen_and_sign_end_to_end() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let shares = run_keygen(&network, &peers, 1).await;

        // every participant derived the same group key
        let group_key = shares[0].1.public_key.clone();
        assert!(!group_key.is_empty());
        for (_, share) in &shares {
            assert_eq!(share.public_key, group_key);
            assert_eq!(share.threshold, 1);
        }

        let digest = ethers::utils::keccak256(b"proposal");
        let signatures = run_signing(
            &network,
            &peers,
            &shares,
            &peers,
            &"signing-frost".into(),
            digest,
        )
        .await;

        // everyone ends with the same aggregated signature, and it
        // verifies under the group key
        assert!(signatures.windows(2).all(|w| w[0] == w[1]));
        let verifying_key =
            frost::VerifyingKey::deserialize(&group_key).unwrap();
        let signature =
            frost::Signature::deserialize(&signatures[0]).unwrap();
        verifying_key.verify(&digest, &signature).unwrap();
    }

    #[tokio::test]
    async fn refresh_preserves_the_group_key_and_supports_leavers() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let shares = run_keygen(&network, &peers, 1).await;
        let group_key = shares[0].1.public_key.clone();

        // the canonically last peer leaves the committee
        let leaving = *canonical_order(&peers).last().unwrap();
        let next: Vec<PeerId> =
            peers.iter().copied().filter(|p| p != &leaving).collect();
        let leader = canonical_order(&next)[0];

        let session: SessionId = "refresh-frost".into();
        // refresh runs over the union: everybody participates
        let ctxs = contexts(&network, &peers, &session, &peers, 1, leader);
        let mut handles = Vec::new();
        for (peer, mut ctx) in ctxs {
            let share = shares
                .iter()
                .find(|(p, _)| p == &peer)
                .map(|(_, s)| s.clone())
                .unwrap();
            let next = next.clone();
            handles.push(tokio::spawn(async move {
                let refreshed = FrostScheme
                    .refresh(&mut ctx, Some(&share), &next)
                    .await
                    .unwrap();
                (peer, refreshed)
            }));
        }
        let mut refreshed = Vec::new();
        for handle in handles {
            refreshed.push(handle.await.unwrap());
        }

        let mut staying_shares = Vec::new();
        for (peer, share) in refreshed {
            if peer == leaving {
                assert!(share.is_none(), "leaver must retire its share");
            } else {
                let share = share.expect("staying member keeps a share");
                assert_eq!(share.public_key, group_key);
                assert_eq!(share.participants, canonical_order(&next));
                staying_shares.push((peer, share));
            }
        }

        // the refreshed shares still sign under the original group key
        let digest = ethers::utils::keccak256(b"after-refresh");
        let signatures = run_signing(
            &network,
            &peers,
            &staying_shares,
            &next,
            &"signing-after-refresh".into(),
            digest,
        )
        .await;
        let verifying_key =
            frost::VerifyingKey::deserialize(&group_key).unwrap();
        let signature =
            frost::Signature::deserialize(&signatures[0]).unwrap();
        verifying_key.verify(&digest, &signature).unwrap();
    }

    #[tokio::test]
    async fn refresh_rejects_new_members() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let shares = run_keygen(&network, &peers, 1).await;

        let newcomer = PeerId::random();
        let mut next = peers.clone();
        next.push(newcomer);

        // only the leader validates membership; run it alone
        let leader_peer = canonical_order(&peers)[0];
        let session: SessionId = "refresh-reject".into();
        let (_, mut ctx) = contexts(
            &network,
            &peers,
            &session,
            &peers,
            1,
            leader_peer,
        )
        .into_iter()
        .find(|(p, _)| p == &leader_peer)
        .unwrap();
        let share = shares
            .iter()
            .find(|(p, _)| p == &leader_peer)
            .map(|(_, s)| s.clone())
            .unwrap();
        let err = FrostScheme
            .refresh(&mut ctx, Some(&share), &next)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMembershipChange(p) if p == newcomer));
    }
}
