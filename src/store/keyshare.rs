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

use std::io::Write;
use std::path::{Path, PathBuf};

use libp2p_identity::PeerId;

use crate::error::{Error, Result};

/// The local share of the threshold key, together with the committee it was
/// generated with.
///
/// At most one keyshare is current per relayer. A refresh replaces it
/// atomically; the group public key persists across refreshes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyshare {
    /// Opaque share material of the underlying threshold scheme.
    pub share: Vec<u8>,
    /// The group public key, SEC1 compressed.
    pub public_key: Vec<u8>,
    /// The signing threshold `t` the share was generated with.
    pub threshold: u32,
    /// The committee that holds shares of this key.
    pub participants: Vec<PeerId>,
}

impl Keyshare {
    /// Encodes the keyshare into its on-disk form:
    /// `share_len ‖ share ‖ pk_len ‖ pk ‖ threshold ‖ participant_count ‖
    /// (id_len ‖ id)*`, all integers 4-byte big-endian. Peer ids are
    /// individually length-prefixed since they are variable-length
    /// multihashes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.share.len() + self.public_key.len() + 64,
        );
        out.extend_from_slice(&(self.share.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.share);
        out.extend_from_slice(&(self.public_key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.threshold.to_be_bytes());
        out.extend_from_slice(
            &(self.participants.len() as u32).to_be_bytes(),
        );
        for peer in &self.participants {
            let bytes = peer.to_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    /// Decodes a keyshare from its on-disk form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, offset: 0 };
        let share = cursor.read_prefixed("share")?.to_vec();
        let public_key = cursor.read_prefixed("public key")?.to_vec();
        let threshold = cursor.read_u32("threshold")?;
        let count = cursor.read_u32("participant count")? as usize;
        let mut participants = Vec::with_capacity(count);
        for _ in 0..count {
            let bytes = cursor.read_prefixed("participant id")?;
            let peer = PeerId::from_bytes(bytes).map_err(|_| {
                Error::MalformedKeyshare("invalid participant id")
            })?;
            participants.push(peer);
        }
        if cursor.offset != data.len() {
            return Err(Error::MalformedKeyshare("trailing bytes"));
        }
        Ok(Self {
            share,
            public_key,
            threshold,
            participants,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        let end = self.offset + 4;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(Error::MalformedKeyshare(field))?;
        self.offset = end;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn read_prefixed(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u32(field)? as usize;
        let end = self.offset + len;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(Error::MalformedKeyshare(field))?;
        self.offset = end;
        Ok(bytes)
    }
}

/// KeyshareStore persists the local keyshare in a single file, replaced via
/// write-temp-then-rename so a crash can never leave a partially written
/// share behind.
#[derive(Debug, Clone)]
pub struct KeyshareStore {
    path: PathBuf,
}

impl KeyshareStore {
    /// Creates a store backed by the given file path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Atomically writes `keyshare`, replacing any previous share.
    pub fn store(&self, keyshare: &Keyshare) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&keyshare.to_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        tracing::debug!(path = %self.path.display(), "stored keyshare");
        Ok(())
    }

    /// Loads the current keyshare.
    pub fn load(&self) -> Result<Keyshare> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyshareNotFound)
            }
            Err(e) => return Err(e.into()),
        };
        Keyshare::from_bytes(&data)
    }

    /// Whether a keyshare exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Erases the keyshare file. Called only after a replacement share is
    /// durably written elsewhere, or when this relayer left the committee.
    pub fn erase(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
