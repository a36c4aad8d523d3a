use super::quorum::{Decision, Quorum, SyncTransport};
use super::request::{Proposal, SyncRequest, SyncResponse};
use super::state::{Delta, DeltaLog, Digest, NetworkState, Reconciled, Snapshot};
use super::SyncSettings;
use crate::colored::Colorize;
use crate::zfx_id::Id;
use crate::{Error, Result};

use actix::{Actor, ActorFutureExt, AsyncContext, Context, Handler, ResponseFuture, WrapFuture};
use actix_derive::Message;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use std::collections::VecDeque;
use std::sync::Arc;

enum Work {
    Propose { updates: Vec<(String, Option<Vec<u8>>)>, reply: oneshot::Sender<Result<Digest>> },
    Delta { from: Id, delta: Delta },
    Digest { from: Id, digest: Digest },
}

/// Owns the [NetworkState]. Work that could change the state is queued and processed one
/// item at a time; while a quorum decision or a fetch from a peer is outstanding the queue
/// is held, so nothing is applied in the middle of a resolution.
pub struct StateSynchronizer {
    local_id: Id,
    settings: SyncSettings,
    state: NetworkState,
    log: DeltaLog,
    quorum: Arc<dyn Quorum>,
    transport: Arc<dyn SyncTransport>,
    pending: VecDeque<Work>,
    busy: bool,
}

impl StateSynchronizer {
    pub fn new(
        local_id: Id,
        settings: SyncSettings,
        quorum: Arc<dyn Quorum>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        StateSynchronizer {
            local_id,
            log: DeltaLog::new(settings.max_log),
            settings,
            state: NetworkState::new(),
            quorum,
            transport,
            pending: VecDeque::new(),
            busy: false,
        }
    }

    fn pump(&mut self, ctx: &mut Context<Self>) {
        while !self.busy {
            match self.pending.pop_front() {
                Some(Work::Propose { updates, reply }) => self.propose(updates, reply, ctx),
                Some(Work::Delta { from, delta }) => self.receive_delta(from, delta, ctx),
                Some(Work::Digest { from, digest }) => self.receive_digest(from, digest, ctx),
                None => break,
            }
        }
    }

    fn enqueue(&mut self, work: Work, ctx: &mut Context<Self>) {
        self.pending.push_back(work);
        self.pump(ctx);
    }

    fn broadcast(&self, delta: Delta, ctx: &mut Context<Self>) {
        ctx.spawn(self.transport.broadcast(SyncRequest::Push(vec![delta])).into_actor(self));
    }

    fn propose(
        &mut self,
        updates: Vec<(String, Option<Vec<u8>>)>,
        reply: oneshot::Sender<Result<Digest>>,
        ctx: &mut Context<Self>,
    ) {
        let changes = self.state.prepare(self.local_id, updates);
        let candidate = match self.state.candidate(&changes) {
            Ok(candidate) => candidate,
            Err(err) => {
                error!("[{}] unresolved merge of local update: {:?}", "sync".yellow(), err);
                let _ = reply.send(Err(err));
                return;
            }
        };
        let proposal = Proposal {
            origin: self.local_id,
            version: candidate.version,
            changes,
            hash: candidate.hash,
        };
        self.busy = true;
        let decide = self.quorum.decide(proposal.clone()).into_actor(self).map(
            move |decision, act, ctx| {
                act.busy = false;
                let result = match decision {
                    Decision::Accept => act.commit(&proposal, ctx),
                    Decision::Reject => {
                        info!("[{}] proposal v{} rejected", "sync".yellow(), proposal.version);
                        Err(Error::ProposalRejected)
                    }
                };
                let _ = reply.send(result);
                act.pump(ctx);
            },
        );
        ctx.spawn(decide);
    }

    fn commit(&mut self, proposal: &Proposal, ctx: &mut Context<Self>) -> Result<Digest> {
        let delta = self.state.apply(&proposal.changes)?;
        debug!("[{}] committed {:?}", "sync".yellow(), self.state.digest());
        self.log.push(delta.clone());
        self.broadcast(delta, ctx);
        Ok(self.state.digest())
    }

    fn receive_delta(&mut self, from: Id, delta: Delta, ctx: &mut Context<Self>) {
        let local = self.state.digest();
        if delta.version <= local.version {
            if delta.version == local.version && delta.hash != local.hash {
                self.resolve(from, ctx);
            }
            return;
        }
        if delta.version > local.version + 1 {
            self.catch_up(from, ctx);
            return;
        }
        match self.state.apply_delta(&delta) {
            Ok(true) => {
                debug!("[{}] applied v{} from {}", "sync".yellow(), delta.version, from);
                self.log.push(delta);
            }
            Ok(false) => self.resolve(from, ctx),
            Err(err) => {
                error!("[{}] unresolved merge of v{} from {}: {:?}", "sync".yellow(), delta.version, from, err)
            }
        }
    }

    fn receive_digest(&mut self, from: Id, digest: Digest, ctx: &mut Context<Self>) {
        let local = self.state.digest();
        if digest == local {
            return;
        }
        if digest.version == local.version {
            debug!("[{}] {:?} conflicts with {:?} of {}", "sync".yellow(), local, digest, from);
            self.resolve(from, ctx);
        } else if digest.version > local.version {
            self.catch_up(from, ctx);
        } else {
            // The peer is behind: hand it what it misses, or our digest so that it fetches
            // the full state when the deltas are gone.
            let request = match self.log.since(digest.version) {
                Some(deltas) => SyncRequest::Push(deltas),
                None => SyncRequest::Digest(local),
            };
            let push = self.transport.request(from, request);
            ctx.spawn(
                async move {
                    if let Err(err) = push.await {
                        debug!("push to {} failed: {:?}", from, err);
                    }
                }
                .into_actor(self),
            );
        }
    }

    /// Fetches the deltas we are missing from `from`.
    fn catch_up(&mut self, from: Id, ctx: &mut Context<Self>) {
        self.busy = true;
        let fetch = self.transport.request(from, SyncRequest::Since(self.state.version()));
        ctx.spawn(fetch.into_actor(self).map(move |response, act, ctx| {
            act.busy = false;
            match response {
                Ok(SyncResponse::Deltas(deltas)) => act.replay(from, deltas, ctx),
                Ok(SyncResponse::State(snapshot)) => act.reconcile(snapshot, ctx),
                Ok(other) => warn!("[{}] unexpected response from {}: {:?}", "sync".yellow(), from, other),
                Err(err) => warn!("[{}] catch up with {} failed: {:?}", "sync".yellow(), from, err),
            }
            act.pump(ctx);
        }));
    }

    fn replay(&mut self, from: Id, deltas: Vec<Delta>, ctx: &mut Context<Self>) {
        for delta in deltas {
            if delta.version <= self.state.version() {
                continue;
            }
            match self.state.apply_delta(&delta) {
                Ok(true) => self.log.push(delta),
                Ok(false) => return self.resolve(from, ctx),
                Err(err) => {
                    error!("[{}] unresolved merge of v{} from {}: {:?}", "sync".yellow(), delta.version, from, err);
                    return;
                }
            }
        }
        debug!("[{}] caught up to {:?}", "sync".yellow(), self.state.digest());
    }

    /// Fetches the full state of `from` and merges it with ours.
    fn resolve(&mut self, from: Id, ctx: &mut Context<Self>) {
        self.busy = true;
        let fetch = self.transport.request(from, SyncRequest::State);
        ctx.spawn(fetch.into_actor(self).map(move |response, act, ctx| {
            act.busy = false;
            match response {
                Ok(SyncResponse::State(snapshot)) => act.reconcile(snapshot, ctx),
                Ok(other) => warn!("[{}] unexpected response from {}: {:?}", "sync".yellow(), from, other),
                Err(err) => warn!("[{}] state fetch from {} failed: {:?}", "sync".yellow(), from, err),
            }
            act.pump(ctx);
        }));
    }

    fn reconcile(&mut self, snapshot: Snapshot, ctx: &mut Context<Self>) {
        match self.state.merge_snapshot(&snapshot) {
            Ok(Reconciled::Unchanged) => (),
            Ok(Reconciled::Adopted) => {
                info!("[{}] adopted {:?}", "sync".yellow(), self.state.digest());
                self.log.reset(self.state.version());
            }
            Ok(Reconciled::Merged(delta)) => {
                info!("[{}] merged concurrent updates into {:?}", "sync".yellow(), self.state.digest());
                self.log.push(delta.clone());
                self.broadcast(delta, ctx);
            }
            Err(err) => error!("[{}] unresolved merge with v{}: {:?}", "sync".yellow(), snapshot.version, err),
        }
    }

    /// One anti-entropy round with up to `fanout` random peers.
    fn synchronize(&mut self, ctx: &mut Context<Self>) {
        let mut peers = self.transport.peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.settings.fanout.max(1));
        if peers.is_empty() {
            return;
        }
        let digest = self.state.digest();
        let requests = peers.into_iter().map(|peer| {
            let request = self.transport.request(peer, SyncRequest::Digest(digest));
            async move { (peer, request.await) }
        });
        let round = join_all(requests).into_actor(self).map(|responses, act, ctx| {
            for (peer, response) in responses {
                match response {
                    Ok(SyncResponse::Digest(digest)) => {
                        act.pending.push_back(Work::Digest { from: peer, digest })
                    }
                    Ok(other) => warn!("[{}] unexpected response from {}: {:?}", "sync".yellow(), peer, other),
                    Err(err) => debug!("digest exchange with {} failed: {:?}", peer, err),
                }
            }
            act.pump(ctx);
        });
        ctx.spawn(round);
    }
}

impl Actor for StateSynchronizer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        debug!("[{}] started", "sync".yellow());
        if let Some(interval) = self.settings.propagation_interval() {
            ctx.run_interval(interval, |act, ctx| act.synchronize(ctx));
        }
    }
}

/// Proposes a local update; `None` values delete keys. Resolves to the digest after the
/// update was applied.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<Digest>")]
pub struct Propose {
    pub updates: Vec<(String, Option<Vec<u8>>)>,
}

impl Handler<Propose> for StateSynchronizer {
    type Result = ResponseFuture<Result<Digest>>;

    fn handle(&mut self, msg: Propose, ctx: &mut Context<Self>) -> Self::Result {
        let (reply, decided) = oneshot::channel();
        self.enqueue(Work::Propose { updates: msg.updates, reply }, ctx);
        Box::pin(async move { decided.await.unwrap_or(Err(Error::Cancelled)) })
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ReceiveDelta {
    pub from: Id,
    pub delta: Delta,
}

impl Handler<ReceiveDelta> for StateSynchronizer {
    type Result = ();

    fn handle(&mut self, msg: ReceiveDelta, ctx: &mut Context<Self>) -> Self::Result {
        self.enqueue(Work::Delta { from: msg.from, delta: msg.delta }, ctx)
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ReceiveDigest {
    pub from: Id,
    pub digest: Digest,
}

impl Handler<ReceiveDigest> for StateSynchronizer {
    type Result = ();

    fn handle(&mut self, msg: ReceiveDigest, ctx: &mut Context<Self>) -> Self::Result {
        self.enqueue(Work::Digest { from: msg.from, digest: msg.digest }, ctx)
    }
}

/// A request from a remote synchronizer.
#[derive(Debug, Clone, Message)]
#[rtype(result = "SyncResponse")]
pub struct HandleSyncRequest {
    pub from: Id,
    pub request: SyncRequest,
}

impl Handler<HandleSyncRequest> for StateSynchronizer {
    type Result = SyncResponse;

    fn handle(&mut self, msg: HandleSyncRequest, ctx: &mut Context<Self>) -> Self::Result {
        match msg.request {
            SyncRequest::Digest(digest) => {
                let local = self.state.digest();
                self.enqueue(Work::Digest { from: msg.from, digest }, ctx);
                SyncResponse::Digest(local)
            }
            SyncRequest::Since(version) => match self.log.since(version) {
                Some(deltas) => SyncResponse::Deltas(deltas),
                None => SyncResponse::State(self.state.snapshot()),
            },
            SyncRequest::State => SyncResponse::State(self.state.snapshot()),
            SyncRequest::Propose(proposal) => {
                let vote = self.state.candidate(&proposal.changes).is_ok();
                SyncResponse::Vote(vote)
            }
            SyncRequest::Push(deltas) => {
                for delta in deltas {
                    self.pending.push_back(Work::Delta { from: msg.from, delta });
                }
                self.pump(ctx);
                SyncResponse::Ack
            }
        }
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Digest")]
pub struct GetDigest;

impl Handler<GetDigest> for StateSynchronizer {
    type Result = Digest;

    fn handle(&mut self, _msg: GetDigest, _ctx: &mut Context<Self>) -> Self::Result {
        self.state.digest()
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Snapshot")]
pub struct GetState;

impl Handler<GetState> for StateSynchronizer {
    type Result = Snapshot;

    fn handle(&mut self, _msg: GetState, _ctx: &mut Context<Self>) -> Self::Result {
        self.state.snapshot()
    }
}

/// Runs one anti-entropy round now.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Synchronize;

impl Handler<Synchronize> for StateSynchronizer {
    type Result = ();

    fn handle(&mut self, _msg: Synchronize, ctx: &mut Context<Self>) -> Self::Result {
        self.synchronize(ctx)
    }
}
