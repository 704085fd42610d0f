//! Uninstall: resolve an app's outcome back into the free balance.
//!
//! Two messages, signed with the root keys. Both parties compute the outcome
//! from the app's latest committed state, apply it to a candidate channel and
//! exchange signatures on the resulting free balance set-state commitment.

use super::{
    assert_signed_at_index, counterparty_of, expect_sender, expect_seq, opening, reply,
    single_signature, Context, Protocol, ProtocolError, ProtocolParams, Step, UninstallParams,
};
use crate::abiencode::types::{Address, Hash};
use crate::commitments::{Commitment, UninstallCommitment};
use crate::keys::Xpub;
use crate::state::{compute_outcome, StateChannel};
use crate::wire::{CustomData, Envelope, ProcessId};

fn uninstall_candidate(
    ctx: &mut Context,
    id: Hash,
) -> Result<(StateChannel, Hash), ProtocolError> {
    let channel = ctx.channel_with_app(id)?.clone();
    let outcome = compute_outcome(channel.app(id)?)?;
    let candidate = channel.uninstall_app(id, &outcome)?;
    let digest = UninstallCommitment::new(ctx.network, &candidate).hash_to_sign();
    Ok((candidate, digest))
}

#[derive(Debug)]
pub struct UninstallInitiator {
    multisig: Address,
    counterparty: Xpub,
    candidate: StateChannel,
    digest: Hash,
}

impl UninstallInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: UninstallParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let our = ctx.our_xpub();
        let (candidate, digest) = uninstall_candidate(ctx, params.app_identity_hash)?;
        let counterparty = counterparty_of(&candidate, &our);
        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);

        let envelope = opening(
            Protocol::Uninstall,
            process_id,
            our,
            counterparty,
            ProtocolParams::Uninstall(params),
            CustomData::Signature { signature },
        );
        Ok((
            UninstallInitiator {
                multisig: candidate.multisig_address(),
                counterparty,
                candidate,
                digest,
            },
            envelope,
        ))
    }

    pub fn receive(
        self,
        ctx: &mut Context,
        envelope: &Envelope,
    ) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 2)?;
        let signature = single_signature(envelope)?;
        assert_signed_at_index(ctx.key_cache, self.digest, signature, &self.counterparty, 0)?;

        ctx.channels.insert(self.multisig, self.candidate);
        Ok(Step::finished(vec![], vec![self.multisig]))
    }
}

#[derive(Debug)]
pub struct UninstallResponder;

impl UninstallResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::Uninstall(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };
        let their_signature = single_signature(envelope)?;

        let our = ctx.our_xpub();
        let (candidate, digest) = uninstall_candidate(ctx, params.app_identity_hash)?;
        let counterparty = expect_sender(&candidate, &our, envelope)?;
        assert_signed_at_index(ctx.key_cache, digest, their_signature, &counterparty, 0)?;

        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);
        let multisig = candidate.multisig_address();
        ctx.channels.insert(multisig, candidate);

        let ack = reply(
            envelope,
            our,
            counterparty,
            2,
            None,
            CustomData::Signature { signature },
        );
        Ok(Step::finished(vec![ack], vec![multisig]))
    }
}
