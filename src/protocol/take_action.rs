//! Take-action: advance an installed app's state by one version.
//!
//! Two messages, signed with the per-app derived keys rather than the root
//! keys. The initiator supplies both the action and the resulting state; the
//! responder validates the action against the app's declared action encoding
//! and countersigns the set-state commitment over the new state.

use super::{
    assert_signed_at_index, counterparty_of, expect_sender, expect_seq, opening, reply,
    single_signature, Context, Protocol, ProtocolError, ProtocolParams, Step, TakeActionParams,
};
use crate::abiencode::types::{Address, Hash};
use crate::commitments::{Commitment, SetStateCommitment};
use crate::keys::Xpub;
use crate::state::StateChannel;
use crate::wire::{CustomData, Envelope, ProcessId};

fn advance(
    ctx: &mut Context,
    params: &TakeActionParams,
) -> Result<(StateChannel, Hash, u32, bool), ProtocolError> {
    let id = params.app_identity_hash;
    let (channel, is_virtual) = ctx.any_channel_with_app(id)?;
    let channel = channel.clone();
    channel.app(id)?.check_action(&params.action)?;

    let candidate = channel.set_app_state(id, params.new_state.clone(), None)?;
    let app = candidate.app(id)?;
    let digest = SetStateCommitment {
        challenge_registry: ctx.network.challenge_registry,
        app_identity_hash: id,
        state_hash: app.state_hash()?,
        version_number: app.latest_version_number,
        timeout: app.latest_timeout,
    }
    .hash_to_sign();
    let signing_index = app.app_seq_no as u32;
    Ok((candidate, digest, signing_index, is_virtual))
}

fn commit(ctx: &mut Context, candidate: StateChannel, is_virtual: bool) -> Address {
    let multisig = candidate.multisig_address();
    if is_virtual {
        ctx.virtual_channels.insert(multisig, candidate);
    } else {
        ctx.channels.insert(multisig, candidate);
    }
    multisig
}

#[derive(Debug)]
pub struct TakeActionInitiator {
    counterparty: Xpub,
    candidate: StateChannel,
    digest: Hash,
    signing_index: u32,
    is_virtual: bool,
}

impl TakeActionInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: TakeActionParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let our = ctx.our_xpub();
        let (candidate, digest, signing_index, is_virtual) = advance(ctx, &params)?;
        let counterparty = counterparty_of(&candidate, &our);
        let signature = ctx.wallet.signer_for(signing_index)?.sign_eth(digest);

        let envelope = opening(
            Protocol::TakeAction,
            process_id,
            our,
            counterparty,
            ProtocolParams::TakeAction(params),
            CustomData::Signature { signature },
        );
        Ok((
            TakeActionInitiator {
                counterparty,
                candidate,
                digest,
                signing_index,
                is_virtual,
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
        assert_signed_at_index(
            ctx.key_cache,
            self.digest,
            signature,
            &self.counterparty,
            self.signing_index,
        )?;

        let multisig = commit(ctx, self.candidate, self.is_virtual);
        Ok(Step::finished(vec![], vec![multisig]))
    }
}

#[derive(Debug)]
pub struct TakeActionResponder;

impl TakeActionResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::TakeAction(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };
        let their_signature = single_signature(envelope)?;

        let our = ctx.our_xpub();
        let (candidate, digest, signing_index, is_virtual) = advance(ctx, &params)?;
        let counterparty = expect_sender(&candidate, &our, envelope)?;
        assert_signed_at_index(
            ctx.key_cache,
            digest,
            their_signature,
            &counterparty,
            signing_index,
        )?;

        let signature = ctx.wallet.signer_for(signing_index)?.sign_eth(digest);
        let multisig = commit(ctx, candidate, is_virtual);

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
