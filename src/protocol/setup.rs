//! Channel setup: two parties agree on the free balance of a fresh multisig.
//!
//! Two messages. The initiator builds the channel and signs the setup
//! commitment; the responder rebuilds the identical channel, verifies,
//! countersigns and commits; the initiator verifies the countersignature and
//! commits.

use super::{
    assert_signed_at_index, expect_seq, opening, reply, single_signature, Context, Protocol,
    ProtocolError, ProtocolParams, SetupParams, Step,
};
use crate::abiencode::types::Hash;
use crate::commitments::{Commitment, SetupCommitment};
use crate::keys::Xpub;
use crate::state::StateChannel;
use crate::wire::{CustomData, Envelope, ProcessId};

fn build_channel(ctx: &mut Context, params: &SetupParams) -> Result<StateChannel, ProtocolError> {
    if ctx.channels.contains_key(&params.multisig_address) {
        return Err(ProtocolError::ChannelExists(params.multisig_address));
    }
    Ok(StateChannel::setup(
        ctx.network,
        params.multisig_address,
        &[params.initiator, params.responder],
        ctx.key_cache,
    )?)
}

#[derive(Debug)]
pub struct SetupInitiator {
    responder: Xpub,
    candidate: StateChannel,
    digest: Hash,
}

impl SetupInitiator {
    pub fn start(
        ctx: &mut Context,
        process_id: ProcessId,
        params: SetupParams,
    ) -> Result<(Self, Envelope), ProtocolError> {
        let candidate = build_channel(ctx, &params)?;
        let digest = SetupCommitment::new(ctx.network, &candidate).hash_to_sign();
        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);

        let envelope = opening(
            Protocol::Setup,
            process_id,
            ctx.our_xpub(),
            params.responder,
            ProtocolParams::Setup(params.clone()),
            CustomData::Signature { signature },
        );
        Ok((
            SetupInitiator {
                responder: params.responder,
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
        assert_signed_at_index(ctx.key_cache, self.digest, signature, &self.responder, 0)?;

        let multisig = self.candidate.multisig_address();
        ctx.channels.insert(multisig, self.candidate);
        Ok(Step::finished(vec![], vec![multisig]))
    }
}

#[derive(Debug)]
pub struct SetupResponder;

impl SetupResponder {
    /// Handle the opening message; completes in this single step.
    pub fn respond(ctx: &mut Context, envelope: &Envelope) -> Result<Step<Self>, ProtocolError> {
        expect_seq(envelope, 1)?;
        let params = match &envelope.params {
            Some(ProtocolParams::Setup(p)) => p.clone(),
            _ => return Err(ProtocolError::MissingParams),
        };
        let their_signature = single_signature(envelope)?;

        // Only countersign channels that name this node as the responder and
        // whose opening message comes from the named initiator.
        if params.responder != ctx.our_xpub() || envelope.from != params.initiator {
            return Err(ProtocolError::SenderNotOwner(envelope.from));
        }

        let candidate = build_channel(ctx, &params)?;
        let digest = SetupCommitment::new(ctx.network, &candidate).hash_to_sign();
        assert_signed_at_index(
            ctx.key_cache,
            digest,
            their_signature,
            &params.initiator,
            0,
        )?;

        let signature = ctx.wallet.signer_for(0)?.sign_eth(digest);
        let multisig = candidate.multisig_address();
        ctx.channels.insert(multisig, candidate);

        let ack = reply(
            envelope,
            ctx.our_xpub(),
            envelope.from,
            2,
            None,
            CustomData::Signature { signature },
        );
        Ok(Step::finished(vec![ack], vec![multisig]))
    }
}
