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

//! The distributed MPC session coordinator.
//!
//! Drives a [`TssProcess`] from a start request to completion: elects the
//! leader, exchanges the start announcement, runs the ceremony attempt under
//! a per-session cancellation token and deadline, and retries on a backup
//! coordinator when the leader fails. At most one session per id is in
//! flight process-wide; duplicate starts resolve to the in-flight session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::ceremony::{CeremonyOutput, RoundContext, TssProcess};
use super::{SessionId, SessionState};
use crate::comm::{Comm, Protocol};
use crate::config::SessionConfig;
use crate::elector::{CoordinatorElectorFactory, ElectorKind};
use crate::error::{Error, Result};
use crate::metric::Metrics;
use crate::probe;

/// The outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// The base session id the session was requested under.
    pub session_id: SessionId,
    /// The id of the attempt that completed (differs from `session_id` when
    /// the session was retried on a backup coordinator).
    pub attempt_id: SessionId,
    /// The leader of the completing attempt. On-chain side effects of the
    /// ceremony are the leader's job alone.
    pub leader: PeerId,
    /// What the ceremony produced.
    pub output: CeremonyOutput,
}

/// The leader's start announcement for one session attempt.
#[derive(Debug, Serialize, Deserialize)]
struct StartMessage {
    session_id: String,
    participants: Vec<String>,
}

struct SessionHandle {
    state: watch::Sender<SessionState>,
}

enum Begin<'c> {
    Started(SessionGuard<'c>),
    InFlight(watch::Receiver<SessionState>),
}

struct SessionGuard<'c> {
    coordinator: &'c Coordinator,
    id: SessionId,
    state: watch::Sender<SessionState>,
    finished: bool,
}

impl SessionGuard<'_> {
    fn set(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn finish(mut self, state: SessionState) {
        debug_assert!(state.is_terminal());
        self.state.send_replace(state);
        self.finished = true;
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // dropped on an unexpected path, e.g. the caller was aborted
            self.state.send_replace(SessionState::Failed);
        }
        self.coordinator
            .sessions
            .lock()
            .expect("session registry poisoned")
            .remove(&self.id);
    }
}

/// The session coordinator. One instance per relayer; sessions of distinct
/// ids run in parallel through it.
pub struct Coordinator {
    comm: Arc<dyn Comm>,
    elector_factory: CoordinatorElectorFactory,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    config: SessionConfig,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    /// Creates a new coordinator.
    pub fn new(
        comm: Arc<dyn Comm>,
        elector_factory: CoordinatorElectorFactory,
        config: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            comm,
            elector_factory,
            sessions: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// This node's identity on the committee network.
    pub fn local_peer(&self) -> PeerId {
        self.comm.local_peer()
    }

    /// Guards session creation: insert-if-absent under the registry mutex.
    fn try_begin(&self, id: &SessionId) -> Begin<'_> {
        let mut sessions =
            self.sessions.lock().expect("session registry poisoned");
        if let Some(handle) = sessions.get(id) {
            return Begin::InFlight(handle.state.subscribe());
        }
        let (tx, _rx) = watch::channel(SessionState::Pending);
        sessions.insert(
            id.clone(),
            SessionHandle { state: tx.clone() },
        );
        Begin::Started(SessionGuard {
            coordinator: self,
            id: id.clone(),
            state: tx,
            finished: false,
        })
    }

    /// Executes `process` to completion.
    ///
    /// The returned error is terminal for the session: retriable failures
    /// have already been retried on backup coordinators up to the configured
    /// bound. A duplicate start while the same id is in flight waits for the
    /// in-flight session and then fails with
    /// [`Error::SessionAlreadyRunning`].
    pub async fn execute(
        &self,
        token: &CancellationToken,
        process: Arc<dyn TssProcess>,
    ) -> Result<SessionResult> {
        let base = process.session_id().clone();
        let guard = match self.try_begin(&base) {
            Begin::Started(guard) => guard,
            Begin::InFlight(mut rx) => {
                // join the in-flight session instead of double-starting
                while !rx.borrow().is_terminal() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                return Err(Error::SessionAlreadyRunning(
                    base.as_str().to_string(),
                ));
            }
        };
        self.metrics.sessions_started.inc();
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Session,
            session_id = %base,
            started = true,
        );

        let participants = process.participants().to_vec();
        let need = process.threshold() as usize + 1;
        if participants.len() < need {
            guard.finish(SessionState::Failed);
            self.metrics.sessions_failed.inc();
            return Err(Error::InsufficientParticipants {
                have: participants.len(),
                need,
            });
        }

        let mut excluded: Vec<PeerId> = Vec::new();
        for attempt in 0..=self.config.max_retries {
            let attempt_id = if attempt == 0 {
                base.clone()
            } else {
                base.retried(attempt)
            };
            let candidates: Vec<PeerId> = participants
                .iter()
                .copied()
                .filter(|p| !excluded.contains(p))
                .collect();
            if candidates.len() < need {
                // not enough live peers left to try again
                break;
            }
            // the first attempt has no prior state distinguishing peers;
            // retries must agree on liveness, which takes the bully
            let elector_kind = if attempt == 0 {
                ElectorKind::Static
            } else {
                ElectorKind::Bully
            };
            let elector = self
                .elector_factory
                .coordinator_elector(&attempt_id, elector_kind);
            let leader = match elector.coordinator(&candidates).await {
                Ok(leader) => leader,
                Err(e) => {
                    guard.finish(SessionState::Failed);
                    self.metrics.sessions_failed.inc();
                    return Err(e);
                }
            };
            guard.set(SessionState::Running);

            let session_token = token.child_token();
            let result = tokio::select! {
                res = self.run_attempt(
                    &attempt_id,
                    &candidates,
                    leader,
                    process.as_ref(),
                    session_token.clone(),
                ) => res,
                _ = token.cancelled() => {
                    session_token.cancel();
                    guard.finish(SessionState::Cancelled);
                    self.metrics.sessions_cancelled.inc();
                    return Err(Error::SessionCancelled(
                        base.as_str().to_string(),
                    ));
                }
                _ = tokio::time::sleep(process.timeout()) => {
                    session_token.cancel();
                    guard.finish(SessionState::Failed);
                    self.metrics.sessions_failed.inc();
                    return Err(Error::SessionTimeout(
                        base.as_str().to_string(),
                    ));
                }
            };

            match result {
                Ok(output) => {
                    guard.finish(SessionState::Completed);
                    self.metrics.sessions_completed.inc();
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::Session,
                        session_id = %attempt_id,
                        completed = true,
                    );
                    return Ok(SessionResult {
                        session_id: base,
                        attempt_id,
                        leader,
                        output,
                    });
                }
                Err(e)
                    if process.retryable()
                        && e.is_retriable()
                        && attempt < self.config.max_retries =>
                {
                    tracing::warn!(
                        session_id = %attempt_id,
                        failed_leader = %leader,
                        error = %e,
                        "session attempt failed, retrying on a backup \
                         coordinator",
                    );
                    self.metrics.session_retries.inc();
                    excluded.push(leader);
                    guard.set(SessionState::Pending);
                }
                Err(e) => {
                    guard.finish(SessionState::Failed);
                    self.metrics.sessions_failed.inc();
                    return Err(e);
                }
            }
        }
        guard.finish(SessionState::Failed);
        self.metrics.sessions_failed.inc();
        Err(Error::NoProgress(base.as_str().to_string()))
    }

    async fn run_attempt(
        &self,
        attempt_id: &SessionId,
        participants: &[PeerId],
        leader: PeerId,
        process: &dyn TssProcess,
        token: CancellationToken,
    ) -> Result<CeremonyOutput> {
        let local = self.comm.local_peer();
        let mut ctx = RoundContext::new(
            self.comm.clone(),
            attempt_id.clone(),
            participants.to_vec(),
            process.threshold(),
            leader,
            self.config.round_timeout(),
            token.clone(),
        );

        if leader == local {
            let start = StartMessage {
                session_id: attempt_id.as_str().to_string(),
                participants: participants
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            };
            let others: Vec<PeerId> = participants
                .iter()
                .copied()
                .filter(|p| p != &local)
                .collect();
            self.comm.broadcast(
                attempt_id,
                Protocol::SessionStart,
                serde_json::to_vec(&start)?,
                &others,
            );
        } else {
            self.await_start(attempt_id, leader, &token).await?;
        }

        process.run(&mut ctx).await
    }

    /// Follower side of the start exchange: the leader not announcing the
    /// session within the start timeout means the leader failed.
    async fn await_start(
        &self,
        attempt_id: &SessionId,
        leader: PeerId,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut sub =
            self.comm.subscribe(attempt_id, Protocol::SessionStart);
        let deadline = tokio::time::sleep(self.config.start_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::SessionCancelled(
                        attempt_id.as_str().to_string(),
                    ));
                }
                _ = &mut deadline => {
                    return Err(Error::StartTimeout(
                        attempt_id.as_str().to_string(),
                    ));
                }
                msg = sub.recv() => {
                    let Some(msg) = msg else {
                        return Err(Error::ChannelClosed);
                    };
                    if msg.from != leader {
                        continue;
                    }
                    let start: StartMessage =
                        serde_json::from_slice(&msg.payload)?;
                    if start.session_id != attempt_id.as_str() {
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemComm;
    use crate::config::BullyConfig;
    use crate::elector::sort_peers_for_session;
    use crate::tss::SessionKind;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn test_config() -> SessionConfig {
        SessionConfig {
            start_timeout: 300,
            round_timeout: 2_000,
            max_retries: 2,
        }
    }

    fn coordinator_for(comm: Arc<MemComm>) -> Arc<Coordinator> {
        let bully = BullyConfig {
            election_wait: 200,
            ping_wait: 50,
            leader_wait: 400,
        };
        let factory =
            CoordinatorElectorFactory::new(comm.clone(), bully);
        Arc::new(Coordinator::new(
            comm,
            factory,
            test_config(),
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    /// A one-round echo ceremony: every participant broadcasts a byte and
    /// waits for everyone else's.
    struct EchoProcess {
        id: SessionId,
        participants: Vec<PeerId>,
        threshold: u32,
    }

    #[async_trait]
    impl TssProcess for EchoProcess {
        fn kind(&self) -> SessionKind {
            SessionKind::Signing
        }
        fn session_id(&self) -> &SessionId {
            &self.id
        }
        fn participants(&self) -> &[PeerId] {
            &self.participants
        }
        fn threshold(&self) -> u32 {
            self.threshold
        }
        fn retryable(&self) -> bool {
            true
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(10)
        }
        async fn run(
            &self,
            ctx: &mut RoundContext,
        ) -> Result<CeremonyOutput> {
            ctx.broadcast_round(1, &[7]);
            let participants = ctx.participants().to_vec();
            let got = ctx.gather_round(1, &participants).await?;
            Ok(CeremonyOutput::Signature(vec![got.len() as u8]))
        }
    }

    /// A ceremony that parks until the test releases it.
    struct BlockingProcess {
        id: SessionId,
        participants: Vec<PeerId>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl TssProcess for BlockingProcess {
        fn kind(&self) -> SessionKind {
            SessionKind::Signing
        }
        fn session_id(&self) -> &SessionId {
            &self.id
        }
        fn participants(&self) -> &[PeerId] {
            &self.participants
        }
        fn threshold(&self) -> u32 {
            0
        }
        fn retryable(&self) -> bool {
            false
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(10)
        }
        async fn run(
            &self,
            _ctx: &mut RoundContext,
        ) -> Result<CeremonyOutput> {
            self.release.notified().await;
            Ok(CeremonyOutput::Signature(vec![]))
        }
    }

    #[tokio::test]
    async fn all_participants_complete_a_session() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let session: SessionId = "signing-happy".into();

        let mut handles = Vec::new();
        for comm in &network {
            let coordinator = coordinator_for(comm.clone());
            let process = Arc::new(EchoProcess {
                id: session.clone(),
                participants: peers.clone(),
                threshold: 1,
            });
            handles.push(tokio::spawn(async move {
                coordinator
                    .execute(&CancellationToken::new(), process)
                    .await
                    .unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        // one leader, agreed by everyone, and every echo saw both peers
        assert!(results.windows(2).all(|w| w[0].leader == w[1].leader));
        for result in &results {
            assert_eq!(result.attempt_id, session);
            match &result.output {
                CeremonyOutput::Signature(sig) => assert_eq!(sig, &vec![2]),
                other => panic!("unexpected output: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn survivors_retry_when_the_leader_goes_silent() {
        let peers: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        // keep the statically elected leader of the base id silent, so the
        // followers' start exchange must time out
        let session: SessionId = "signing-crash".into();
        let dead = sort_peers_for_session(&peers, &session)[0];
        let network = MemComm::network(&peers);

        let mut handles = Vec::new();
        for (peer, comm) in peers.iter().zip(&network) {
            if peer == &dead {
                continue; // the elected leader never shows up
            }
            let coordinator = coordinator_for(comm.clone());
            let process = Arc::new(EchoProcess {
                id: session.clone(),
                participants: peers.clone(),
                threshold: 1,
            });
            handles.push(tokio::spawn(async move {
                coordinator
                    .execute(&CancellationToken::new(), process)
                    .await
                    .unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        // the retry ran under the derived id and a live leader
        for result in &results {
            assert_eq!(result.attempt_id, session.retried(1));
            assert_ne!(result.leader, dead);
        }
        assert_eq!(results[0].leader, results[1].leader);
    }

    #[tokio::test]
    async fn duplicate_start_resolves_to_the_in_flight_session() {
        let peers: Vec<PeerId> = vec![PeerId::random()];
        let network = MemComm::network(&peers);
        let coordinator = coordinator_for(network[0].clone());
        let release = Arc::new(Notify::new());
        let session: SessionId = "signing-dup".into();

        let process = Arc::new(BlockingProcess {
            id: session.clone(),
            participants: peers.clone(),
            release: release.clone(),
        });
        let first = {
            let coordinator = coordinator.clone();
            let process = process.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(&CancellationToken::new(), process)
                    .await
            })
        };
        // let the first start win the registry
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let coordinator = coordinator.clone();
            let process = process.clone();
            tokio::spawn(async move {
                coordinator
                    .execute(&CancellationToken::new(), process)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_waiters();

        assert!(first.await.unwrap().is_ok());
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyRunning(_)));

        // the id is reusable once the prior instance is terminal
        release.notify_one();
        let rerun = coordinator
            .execute(&CancellationToken::new(), process)
            .await;
        assert!(rerun.is_ok());
    }

    #[tokio::test]
    async fn too_few_participants_fail_immediately() {
        let peers: Vec<PeerId> = (0..2).map(|_| PeerId::random()).collect();
        let network = MemComm::network(&peers);
        let coordinator = coordinator_for(network[0].clone());
        let process = Arc::new(EchoProcess {
            id: "signing-small".into(),
            participants: peers.clone(),
            threshold: 2,
        });
        let err = coordinator
            .execute(&CancellationToken::new(), process)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientParticipants { have: 2, need: 3 }
        ));
    }

    #[tokio::test]
    async fn cancellation_reaches_a_running_session() {
        let peers: Vec<PeerId> = vec![PeerId::random()];
        let network = MemComm::network(&peers);
        let coordinator = coordinator_for(network[0].clone());
        let token = CancellationToken::new();
        let process = Arc::new(BlockingProcess {
            id: "signing-cancelled".into(),
            participants: peers.clone(),
            release: Arc::new(Notify::new()),
        });
        let exec = {
            let coordinator = coordinator.clone();
            let token = token.clone();
            tokio::spawn(async move {
                coordinator.execute(&token, process).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let err = exec.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionCancelled(_)));
    }
}
