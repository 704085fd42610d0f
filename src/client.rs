//! The protocol node: one participant's engine, ledgers and scheduling.
//!
//! A [`Node`] owns this participant's key material, its committed channel
//! ledgers and every protocol instance currently in flight. It is driven
//! from outside: the embedder feeds it incoming envelopes and a clock, and
//! it hands outbound envelopes to the [`MessageBus`]. Instances touching the
//! same channel or app are serialized through the shard scheduler; an
//! instance that receives no message for [`PROTOCOL_TIMEOUT_SECS`] is
//! dropped by [`Node::expire`] without having changed any committed state.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::abiencode::types::Address;
use crate::engine::{self, Machine};
use crate::keys::{KeyCache, Wallet};
use crate::network::NetworkContext;
use crate::protocol::{Context, ProtocolError, ProtocolParams, Step};
use crate::queue::{ShardKey, ShardScheduler};
use crate::state::StateChannel;
use crate::store::{channel_key, index_key, Store};
use crate::wire::{Envelope, MessageBus, ProcessId};

#[cfg(test)]
mod tests;

/// Seconds an in-flight instance may wait for its next message.
pub const PROTOCOL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
struct Execution {
    machine: Machine,
    deadline: u64,
}

/// Work queued behind a shard held by another instance.
#[derive(Debug)]
enum Deferred {
    Start(ProtocolParams),
    Incoming(Envelope),
}

/// The persisted list of channel addresses under one store prefix, split by
/// ledger map so a reload puts each snapshot back where it came from.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChannelIndex {
    channels: Vec<Address>,
    virtual_channels: Vec<Address>,
}

#[derive(Debug)]
pub struct Node<B: MessageBus> {
    bus: B,
    network: NetworkContext,
    wallet: Wallet,
    key_cache: KeyCache,
    channels: BTreeMap<Address, StateChannel>,
    virtual_channels: BTreeMap<Address, StateChannel>,
    store: Box<dyn Store>,
    store_prefix: String,
    executions: HashMap<ProcessId, Execution>,
    deferred: HashMap<ProcessId, Deferred>,
    scheduler: ShardScheduler,
}

impl<B: MessageBus> Node<B> {
    pub fn new(
        bus: B,
        network: NetworkContext,
        wallet: Wallet,
        store: Box<dyn Store>,
    ) -> Self {
        let store_prefix = format!("{}", wallet.xpub());
        let mut node = Node {
            bus,
            network,
            wallet,
            key_cache: KeyCache::new(),
            channels: BTreeMap::new(),
            virtual_channels: BTreeMap::new(),
            store,
            store_prefix,
            executions: HashMap::new(),
            deferred: HashMap::new(),
            scheduler: ShardScheduler::new(),
        };
        node.restore_channels();
        node
    }

    /// Shut down, handing the persistence backend back to the embedder. A
    /// node constructed with the same wallet and this store resumes with
    /// the persisted ledgers.
    pub fn into_store(self) -> Box<dyn Store> {
        self.store
    }

    /// Reload every channel snapshot an earlier incarnation of this wallet's
    /// node persisted. Unreadable entries are skipped, not fatal.
    fn restore_channels(&mut self) {
        let index: ChannelIndex = match self.store.get(&index_key(&self.store_prefix)) {
            Some(json) => match serde_json::from_str(&json) {
                Ok(index) => index,
                Err(e) => {
                    warn!(error = %e, "unreadable channel index in store");
                    return;
                }
            },
            None => return,
        };
        for multisig in index.channels {
            if let Some(channel) = self.load_snapshot(multisig) {
                self.channels.insert(multisig, channel);
            }
        }
        for address in index.virtual_channels {
            if let Some(channel) = self.load_snapshot(address) {
                self.virtual_channels.insert(address, channel);
            }
        }
    }

    fn load_snapshot(&self, multisig: Address) -> Option<StateChannel> {
        let json = self.store.get(&channel_key(&self.store_prefix, multisig))?;
        match serde_json::from_str(&json) {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!(?multisig, error = %e, "unreadable channel snapshot in store");
                None
            }
        }
    }

    pub fn xpub(&self) -> crate::keys::Xpub {
        self.wallet.xpub()
    }

    pub fn channel(&self, multisig: Address) -> Option<&StateChannel> {
        self.channels.get(&multisig)
    }

    pub fn virtual_channel(&self, address: Address) -> Option<&StateChannel> {
        self.virtual_channels.get(&address)
    }

    pub fn channels(&self) -> impl Iterator<Item = &StateChannel> {
        self.channels.values()
    }

    pub fn virtual_channels(&self) -> impl Iterator<Item = &StateChannel> {
        self.virtual_channels.values()
    }

    /// Mirror an on-chain deposit into the channel's free balance. Funding
    /// itself happens outside this crate.
    pub fn credit(
        &mut self,
        multisig: Address,
        token: Address,
        beneficiary: Address,
        amount: crate::abiencode::types::U256,
    ) -> Result<(), ProtocolError> {
        let channel = self
            .channels
            .get(&multisig)
            .ok_or(ProtocolError::NoSuchChannel(multisig))?;
        let next = channel.credit(token, beneficiary, amount)?;
        self.channels.insert(multisig, next);
        self.persist(multisig);
        Ok(())
    }

    /// Start a protocol as initiator. If a shard it needs is held by another
    /// in-flight instance, the start is queued and runs when the shard
    /// frees up.
    pub fn initiate<R: Rng>(
        &mut self,
        rng: &mut R,
        params: ProtocolParams,
        now: u64,
    ) -> Result<ProcessId, ProtocolError> {
        let process_id = ProcessId::random(rng);
        let shards = self.shards_for(&params);
        if self.scheduler.acquire(process_id, &shards) {
            self.run_start(process_id, params, now)?;
        } else {
            debug!(?process_id, protocol = %params.protocol(), "start deferred");
            self.deferred.insert(process_id, Deferred::Start(params));
        }
        Ok(process_id)
    }

    /// Feed one incoming envelope into the engine.
    pub fn handle_message(&mut self, envelope: &Envelope, now: u64) -> Result<(), ProtocolError> {
        let process_id = envelope.process_id;
        if self.executions.contains_key(&process_id) {
            return self.run_receive(process_id, envelope, now);
        }
        if envelope.seq > 2 {
            // A follow-up for an instance we dropped (or never had).
            return Err(ProtocolError::UnexpectedMessage {
                expected: 1,
                got: envelope.seq,
            });
        }

        let shards = self.shards_for_envelope(envelope);
        if self.scheduler.acquire(process_id, &shards) {
            self.run_respond(process_id, envelope, now)
        } else {
            debug!(?process_id, protocol = %envelope.protocol, "response deferred");
            self.deferred
                .insert(process_id, Deferred::Incoming(envelope.clone()));
            Ok(())
        }
    }

    /// Drop every instance whose deadline has passed. Committed state is
    /// untouched; the counterparties' copies of the instance expire on their
    /// own clocks.
    pub fn expire(&mut self, now: u64) -> Vec<ProcessId> {
        let overdue: Vec<ProcessId> = self
            .executions
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &overdue {
            warn!(process_id = ?pid, "protocol instance timed out");
            self.executions.remove(pid);
            self.finish(*pid, now);
        }
        overdue
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            network: &self.network,
            channels: &mut self.channels,
            virtual_channels: &mut self.virtual_channels,
            wallet: &self.wallet,
            key_cache: &mut self.key_cache,
        }
    }

    fn run_start(
        &mut self,
        process_id: ProcessId,
        params: ProtocolParams,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let mut ctx = self.context();
        match engine::initiate(&mut ctx, process_id, params) {
            Ok((machine, envelope)) => {
                self.bus.send(&envelope.to, &envelope);
                self.executions.insert(
                    process_id,
                    Execution {
                        machine,
                        deadline: now + PROTOCOL_TIMEOUT_SECS,
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.finish(process_id, now);
                Err(e)
            }
        }
    }

    fn run_respond(
        &mut self,
        process_id: ProcessId,
        envelope: &Envelope,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let mut ctx = self.context();
        match engine::respond(&mut ctx, envelope) {
            Ok(step) => {
                self.apply_step(process_id, step, now);
                Ok(())
            }
            Err(e) => {
                self.finish(process_id, now);
                Err(e)
            }
        }
    }

    fn run_receive(
        &mut self,
        process_id: ProcessId,
        envelope: &Envelope,
        now: u64,
    ) -> Result<(), ProtocolError> {
        // The machine is consumed either way; on error the instance dies.
        let execution = match self.executions.remove(&process_id) {
            Some(e) => e,
            None => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: 1,
                    got: envelope.seq,
                })
            }
        };
        let mut ctx = self.context();
        match execution.machine.receive(&mut ctx, envelope) {
            Ok(step) => {
                self.apply_step(process_id, step, now);
                Ok(())
            }
            Err(e) => {
                self.finish(process_id, now);
                Err(e)
            }
        }
    }

    fn apply_step(&mut self, process_id: ProcessId, step: Step<Machine>, now: u64) {
        for multisig in &step.touched {
            self.persist(*multisig);
        }
        for envelope in &step.send {
            self.bus.send(&envelope.to, envelope);
        }
        match step.next {
            Some(machine) => {
                self.executions.insert(
                    process_id,
                    Execution {
                        machine,
                        deadline: now + PROTOCOL_TIMEOUT_SECS,
                    },
                );
            }
            None => self.finish(process_id, now),
        }
    }

    /// Release the instance's shards and pump any work that became runnable.
    fn finish(&mut self, process_id: ProcessId, now: u64) {
        self.deferred.remove(&process_id);
        let mut ready = self.scheduler.release(process_id);
        while let Some(pid) = ready.pop() {
            match self.deferred.remove(&pid) {
                Some(Deferred::Start(params)) => {
                    if let Err(e) = self.run_start(pid, params, now) {
                        warn!(process_id = ?pid, error = %e, "deferred start failed");
                        ready.extend(self.scheduler.release(pid));
                    }
                }
                Some(Deferred::Incoming(envelope)) => {
                    if let Err(e) = self.run_respond(pid, &envelope, now) {
                        warn!(process_id = ?pid, error = %e, "deferred response failed");
                        ready.extend(self.scheduler.release(pid));
                    }
                }
                None => {}
            }
        }
    }

    fn persist(&mut self, multisig: Address) {
        let key = channel_key(&self.store_prefix, multisig);
        let snapshot = self
            .channels
            .get(&multisig)
            .or_else(|| self.virtual_channels.get(&multisig));
        if let Some(channel) = snapshot {
            // Committed snapshots always serialize.
            let json = serde_json::to_string(channel).unwrap();
            self.store.set(&key, json);

            let index = ChannelIndex {
                channels: self.channels.keys().copied().collect(),
                virtual_channels: self.virtual_channels.keys().copied().collect(),
            };
            self.store.set(
                &index_key(&self.store_prefix),
                serde_json::to_string(&index).unwrap(),
            );
        }
    }

    /// The shards a locally initiated instance will touch. Lookups that fail
    /// here fail identically (and with a proper error) when the machine
    /// starts, so resolution errors degrade to a minimal shard set.
    fn shards_for(&mut self, params: &ProtocolParams) -> Vec<ShardKey> {
        match params {
            ProtocolParams::Setup(p) => vec![ShardKey::Channel(p.multisig_address)],
            ProtocolParams::Withdraw(p) => vec![ShardKey::Channel(p.multisig_address)],
            ProtocolParams::Propose(p) => {
                let our = self.wallet.xpub();
                match self.context().direct_channel_between(&our, &p.responder) {
                    Ok(c) => vec![ShardKey::Channel(c.multisig_address())],
                    Err(_) => vec![],
                }
            }
            ProtocolParams::Install(p) => self.app_shards(p.app_identity_hash),
            ProtocolParams::TakeAction(p) => self.app_shards(p.app_identity_hash),
            ProtocolParams::Uninstall(p) => self.app_shards(p.app_identity_hash),
            ProtocolParams::InstallVirtualApp(p) => {
                self.virtual_shards(&p.initiator, &p.responder, &p.intermediary, None)
            }
            ProtocolParams::UninstallVirtualApp(p) => self.virtual_shards(
                &p.initiator,
                &p.responder,
                &p.intermediary,
                Some(ShardKey::App(p.app_identity_hash)),
            ),
        }
    }

    fn shards_for_envelope(&mut self, envelope: &Envelope) -> Vec<ShardKey> {
        match &envelope.params {
            Some(params) => self.shards_for(&params.clone()),
            None => vec![],
        }
    }

    fn app_shards(&mut self, id: crate::abiencode::types::Hash) -> Vec<ShardKey> {
        let mut shards = vec![ShardKey::App(id)];
        if let Ok((channel, _)) = self.context().any_channel_with_app(id) {
            shards.push(ShardKey::Channel(channel.multisig_address()));
        }
        shards
    }

    /// Every direct channel this node shares with the other two parties,
    /// plus the virtual ledger address.
    fn virtual_shards(
        &mut self,
        initiator: &crate::keys::Xpub,
        responder: &crate::keys::Xpub,
        intermediary: &crate::keys::Xpub,
        extra: Option<ShardKey>,
    ) -> Vec<ShardKey> {
        let mut shards = Vec::new();
        let ctx = self.context();
        if let Ok(vaddr) = crate::protocol::install_virtual::virtual_channel_address(
            ctx.key_cache,
            initiator,
            responder,
            intermediary,
        ) {
            shards.push(ShardKey::Channel(vaddr));
        }
        let our = ctx.our_xpub();
        for other in [initiator, responder, intermediary] {
            if *other == our {
                continue;
            }
            if let Ok(c) = ctx.direct_channel_between(&our, other) {
                shards.push(ShardKey::Channel(c.multisig_address()));
            }
        }
        shards.extend(extra);
        shards
    }
}
