//! Install: turn a stored proposal into a funded app instance.
//!
//! Two messages. Both parties rebuild the post-install channel from the
//! stored proposal, exchange signatures on the install commitment (a multisig
//! transaction, so signed with the root keys) and only then replace their
//! committed copy.

use super::{
    assert_signed_at_index, counterparty_of, expect_sender, expect_seq, opening, reply,
    single_signature, Context, InstallParams, Protocol, ProtocolError, ProtocolParams, Step,
};
use crate::abiencode::types::{Address, Hash};
use crate::commitments::{Commitment, InstallCommitment};
use crate::keys::Xpub;
use crate::state::StateChannel;
use crate::wire::{CustomData, Envelope, ProcessId};

fn install_candidate(
    ctx: &mut Context,
    id: Hash,
) -> Result<(StateChannel, Hash), ProtocolError> {
    let channel = ctx.channel_with_app(id)?.clone();
    let (candidate, app) = channel.install_app(id, ctx.key_cache)?;
    let digest = InstallCommitment::new(ctx.network, &candidate, &app).hash_to_sign();
    Ok((candidate, digest))
}

#[derive(Debug)]
pub struct InstallInitiator {
    multisig: Address,
    counterparty: Xpub,
    candidate: StateChannel,
    digest: Hash,
}

impl InstallInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: InstallParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let our = ctx.our_xpub();
        let (candidate, digest) = install_candidate(ctx, params.app_identity_hash)?;
        let counterparty = counterparty_of(&candidate, &our);
        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);

        let envelope = opening(
            Protocol::Install,
            process_id,
            our,
            counterparty,
            ProtocolParams::Install(params),
            CustomData::Signature { signature },
        );
        Ok((
            InstallInitiator {
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
pub struct InstallResponder;

impl InstallResponder {
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::Install(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };
        let their_signature = single_signature(envelope)?;

        let our = ctx.our_xpub();
        let (candidate, digest) = install_candidate(ctx, params.app_identity_hash)?;
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
